//! HTTP router assembly and the serve loop.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    response::IntoResponse,
    routing::get,
};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt, catch_panic::CatchPanicLayer,
    sensitive_headers::SetSensitiveHeadersLayer, timeout::TimeoutLayer,
    trace::{self, TraceLayer},
};

use crate::{
    CONFIG, CancellationToken,
    api::{ApiContext, ApiErrorResponse, ErrorModel},
    request_metadata::create_request_metadata_fn,
    request_tracing::{MakeRequestUuid7, RestMakeSpan},
    service::{
        RouterState, RouterStore,
        authn::{OidcValidator, bearer_token},
        health::{HealthExt as _, HealthReport, ServiceHealth},
    },
};

#[derive(Debug)]
pub struct RouterArgs<C: RouterStore> {
    pub state: ApiContext<RouterState<C>>,
    /// Present when `auth.oauth2.enabled`; management and worker routes
    /// then require a valid bearer token.
    pub validator: Option<OidcValidator>,
}

/// Create the full application router.
///
/// Webhook ingress and the OAuth callback stay unauthenticated; the
/// management and worker surfaces sit behind the bearer validator when
/// one is configured.
pub fn new_full_router<C: RouterStore>(
    RouterArgs { state, validator }: RouterArgs<C>,
) -> Router {
    let mut protected = Router::new()
        .nest("/management/v1", super::management::router::<C>())
        .merge(super::worker::router::<C>());

    if let Some(validator) = validator {
        let validator = Arc::new(validator);
        protected = protected.layer(axum::middleware::from_fn_with_state(
            validator,
            auth_middleware_fn,
        ));
    }

    let store_for_health = state.v1_state.store.clone();

    Router::new()
        .merge(super::webhooks::router::<C>())
        .merge(super::oauth::router::<C>())
        .merge(protected)
        .layer(DefaultBodyLimit::max(CONFIG.server.max_body_bytes))
        .route(
            "/health",
            get(move || {
                let store = store_for_health.clone();
                async move {
                    let health = store.health().await;
                    let report = HealthReport {
                        healthy: health.is_healthy(),
                        services: vec![ServiceHealth {
                            name: "store".to_string(),
                            health,
                        }],
                    };
                    Json(report).into_response()
                }
            }),
        )
        .layer(axum::middleware::from_fn(create_request_metadata_fn))
        .layer(
            ServiceBuilder::new()
                .set_x_request_id(MakeRequestUuid7)
                .layer(SetSensitiveHeadersLayer::new([
                    axum::http::header::AUTHORIZATION,
                ]))
                .layer(
                    TraceLayer::new_for_http()
                        .on_failure(())
                        .make_span_with(RestMakeSpan::new(tracing::Level::INFO))
                        .on_response(trace::DefaultOnResponse::new().level(tracing::Level::DEBUG)),
                )
                .layer(TimeoutLayer::with_status_code(
                    http::StatusCode::REQUEST_TIMEOUT,
                    CONFIG.server.request_timeout(),
                ))
                .layer(CatchPanicLayer::new())
                .propagate_x_request_id(),
        )
        .with_state(state)
}

async fn auth_middleware_fn(
    axum::extract::State(validator): axum::extract::State<Arc<OidcValidator>>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let Some(token) = bearer_token(request.headers()) else {
        return ApiErrorResponse::from(ErrorModel::unauthorized(
            "missing bearer token",
            "Unauthenticated",
            None,
        ))
        .into_response();
    };
    match validator.validate(token).await {
        Ok(principal) => {
            let mut request = request;
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(e) => ApiErrorResponse::from(ErrorModel::unauthorized(
            e.to_string(),
            "Unauthenticated",
            None,
        ))
        .into_response(),
    }
}

/// Serve the given router on the given listener.
///
/// # Errors
/// Fails if the webserver panics.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let cancellation_future = async move {
        cancellation_token.cancelled().await;
        tracing::info!("HTTP server shutdown requested (cancellation token)");
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(cancellation_future)
        .await
        .map_err(|e| anyhow::anyhow!(e).context("error running HTTP server"))
}
