//! Server bootstrap: store selection, migration, router assembly and
//! graceful shutdown.

use gitrelay::{
    CONFIG, CancellationToken, StorageDriver,
    api::{
        ApiContext,
        router::{RouterArgs, new_full_router, serve as service_serve},
    },
    implementations::{
        memory::{MemoryState, MemoryStore},
        postgres::{self, PostgresState, PostgresStore},
    },
    service::{RouterState, RouterStore, authn::OidcValidator, drivers},
    tokio, tracing,
};

pub(crate) async fn migrate() -> anyhow::Result<()> {
    let pool = postgres::get_pool().await?;
    postgres::migrate(&pool).await
}

pub(crate) async fn serve() -> anyhow::Result<()> {
    match CONFIG.storage.driver {
        StorageDriver::Postgres => {
            let pool = postgres::get_pool().await?;
            if CONFIG.storage.auto_migrate {
                tracing::info!("Running migrations (storage.auto_migrate)");
                postgres::migrate(&pool).await?;
            }
            let state = PostgresState::from_pools(pool.clone(), pool);
            serve_with_store::<PostgresStore>(state).await
        }
        StorageDriver::Memory => {
            tracing::warn!("Using the in-memory store; nothing will survive a restart");
            serve_with_store::<MemoryStore>(MemoryState::new()).await
        }
    }
}

async fn serve_with_store<C: RouterStore>(store: C::State) -> anyhow::Result<()> {
    let validator = OidcValidator::from_config();
    if validator.is_some() {
        tracing::info!("Running with OAuth2/OIDC authentication on the management API.");
    } else {
        tracing::info!("Running without management API authentication.");
    }

    let state = RouterState::<C>::new(store);
    let router = new_full_router::<C>(RouterArgs {
        state: ApiContext { v1_state: state },
        validator,
    });

    let bind_addr = std::net::SocketAddr::from((CONFIG.server.bind_ip, CONFIG.server.port));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!(e).context(format!("Failed to bind to {bind_addr}")))?;
    match &CONFIG.server.public_base_url {
        Some(base) => tracing::info!("Listening on {bind_addr}, public base URL {base}"),
        None => tracing::info!("Listening on {bind_addr}"),
    }

    let cancellation_token = CancellationToken::new();
    let shutdown_token = cancellation_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            shutdown_token.cancel();
        }
    });

    let result = service_serve(listener, router, cancellation_token).await;

    // Release broker connections before exiting.
    drivers::close_all().await;
    result
}
