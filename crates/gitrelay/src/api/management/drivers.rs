//! Driver management endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    RequestMetadata,
    api::{ApiContext, ApiErrorResponse, ErrorModel},
    service::{
        Driver, DriverId, RouterState, RouterStore,
        drivers::{self, DriverKind},
        rules,
        store::DriverFilter,
    },
};

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new()
        .route("/drivers", get(list::<C>).post(upsert::<C>))
        .route("/drivers/{id}", get(get_one::<C>).delete(delete_one::<C>))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    name: Option<String>,
    enabled: Option<bool>,
}

async fn list<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = DriverFilter {
        name: query.name,
        enabled: query.enabled,
    };
    match C::list_drivers(metadata.tenant_id(), filter, ctx.v1_state.store.clone()).await {
        Ok(drivers) => Json(drivers).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn get_one<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path(id): Path<DriverId>,
) -> Response {
    match C::get_driver(metadata.tenant_id(), id, ctx.v1_state.store.clone()).await {
        Ok(Some(driver)) => Json(driver).into_response(),
        Ok(None) => ApiErrorResponse::from(ErrorModel::not_found(
            format!("driver {id} not found"),
            "NotFound",
            None,
        ))
        .into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpsertDriverRequest {
    #[serde(default)]
    pub id: Option<DriverId>,
    pub name: String,
    pub config: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn upsert<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Json(request): Json<UpsertDriverRequest>,
) -> Response {
    if request.name.parse::<DriverKind>().is_err() {
        return ApiErrorResponse::from(ErrorModel::bad_request(
            format!("unknown driver backend `{}`", request.name),
            "ValidationError",
            None,
        ))
        .into_response();
    }
    let now = Utc::now();
    let driver = Driver {
        id: request.id.unwrap_or_else(DriverId::new_random),
        tenant_id: metadata.tenant_id().clone(),
        name: request.name.clone(),
        config: request.config,
        enabled: request.enabled,
        created_at: now,
        updated_at: now,
    };
    let result = C::upsert_driver(driver, ctx.v1_state.store.clone()).await;
    // Rule snapshots join driver rows and publishers memoize configs; both
    // must drop their view of this driver even on a failed write.
    rules::invalidate_tenant(metadata.tenant_id()).await;
    drivers::evict_driver(&request.name);
    match result {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn delete_one<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path(id): Path<DriverId>,
) -> Response {
    let existing = C::get_driver(metadata.tenant_id(), id, ctx.v1_state.store.clone()).await;
    let result = C::delete_driver(metadata.tenant_id(), id, ctx.v1_state.store.clone()).await;
    rules::invalidate_tenant(metadata.tenant_id()).await;
    if let Ok(Some(driver)) = existing {
        drivers::evict_driver(&driver.name);
    }
    match result {
        Ok(()) => http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}
