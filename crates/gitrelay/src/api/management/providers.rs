//! Provider-instance management endpoints.

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
        ProviderInstance, ProviderKind, RouterState, RouterStore, credentials,
        store::ProviderInstanceFilter,
    },
};

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new()
        .route("/providers", get(list::<C>).post(upsert::<C>))
        .route(
            "/providers/{provider}/{key}",
            get(get_one::<C>).delete(remove::<C>),
        )
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    provider: Option<ProviderKind>,
    key: Option<String>,
    enabled: Option<bool>,
}

async fn list<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = ProviderInstanceFilter {
        provider: query.provider,
        key: query.key,
        enabled: query.enabled,
    };
    match C::list_provider_instances(metadata.tenant_id(), filter, ctx.v1_state.store.clone())
        .await
    {
        Ok(instances) => Json(instances).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn get_one<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path((provider, key)): Path<(ProviderKind, String)>,
) -> Response {
    match C::get_provider_instance(
        metadata.tenant_id(),
        provider,
        &key,
        ctx.v1_state.store.clone(),
    )
    .await
    {
        Ok(Some(instance)) => Json(instance).into_response(),
        Ok(None) => ApiErrorResponse::from(ErrorModel::not_found(
            format!("provider instance {provider}/{key} not found"),
            "NotFound",
            None,
        ))
        .into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpsertProviderRequest {
    pub provider: ProviderKind,
    pub key: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub webhook_path: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn upsert<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Json(request): Json<UpsertProviderRequest>,
) -> Response {
    if request.key.trim().is_empty() {
        return ApiErrorResponse::from(ErrorModel::bad_request(
            "provider instance key must not be empty",
            "ValidationError",
            None,
        ))
        .into_response();
    }
    let now = Utc::now();
    let instance = ProviderInstance {
        tenant_id: metadata.tenant_id().clone(),
        provider: request.provider,
        key: request.key,
        app_id: request.app_id,
        private_key: request.private_key,
        client_id: request.client_id,
        client_secret: request.client_secret,
        webhook_secret: request.webhook_secret,
        api_base_url: request.api_base_url,
        webhook_path: request.webhook_path,
        enabled: request.enabled,
        created_at: now,
        updated_at: now,
    };
    let result = C::upsert_provider_instance(instance, ctx.v1_state.store.clone()).await;
    // Caches must not serve the pre-write view, even after a failed write.
    credentials::invalidate_instances(metadata.tenant_id()).await;
    match result {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn remove<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path((provider, key)): Path<(ProviderKind, String)>,
) -> Response {
    let result = C::delete_provider_instance(
        metadata.tenant_id(),
        provider,
        &key,
        ctx.v1_state.store.clone(),
    )
    .await;
    credentials::invalidate_instances(metadata.tenant_id()).await;
    match result {
        Ok(()) => http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}
