//! Control-plane API: tenant-scoped CRUD and query operations.

pub mod drivers;
pub mod event_logs;
pub mod installations;
pub mod namespaces;
pub mod providers;
pub mod rules;

use axum::Router;

use crate::{
    api::ApiContext,
    service::{RouterState, RouterStore},
};

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new()
        .merge(providers::router::<C>())
        .merge(drivers::router::<C>())
        .merge(rules::router::<C>())
        .merge(namespaces::router::<C>())
        .merge(installations::router::<C>())
        .merge(event_logs::router::<C>())
}
