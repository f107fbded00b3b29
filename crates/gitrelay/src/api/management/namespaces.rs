//! Namespace management endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    RequestMetadata,
    api::{ApiContext, ApiErrorResponse, ErrorModel},
    service::{
        Namespace, ProviderKind, RouterState, RouterStore,
        store::NamespaceFilter,
    },
};

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new()
        .route("/namespaces", get(list::<C>))
        .route("/namespaces/sync", post(sync::<C>))
        .route(
            "/namespaces/{provider}/{key}/{repo_id}/webhook",
            get(get_webhook::<C>).put(set_webhook::<C>),
        )
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    provider: Option<ProviderKind>,
    provider_instance_key: Option<String>,
    repo_id: Option<String>,
    full_name: Option<String>,
    webhooks_enabled: Option<bool>,
}

async fn list<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = NamespaceFilter {
        provider: query.provider,
        provider_instance_key: query.provider_instance_key,
        repo_id: query.repo_id,
        full_name: query.full_name,
        webhooks_enabled: query.webhooks_enabled,
    };
    match C::list_namespaces(metadata.tenant_id(), filter, ctx.v1_state.store.clone()).await {
        Ok(namespaces) => Json(namespaces).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SyncNamespaceRequest {
    pub provider: ProviderKind,
    pub provider_instance_key: String,
    pub repo_id: String,
    pub account_id: String,
    pub installation_id: String,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default = "default_webhooks_enabled")]
    pub webhooks_enabled: bool,
}

fn default_webhooks_enabled() -> bool {
    true
}

/// Explicit namespace sync: upserts the row by its natural key.
async fn sync<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Json(request): Json<SyncNamespaceRequest>,
) -> Response {
    if request.repo_id.trim().is_empty() {
        return ApiErrorResponse::from(ErrorModel::bad_request(
            "namespace repo_id must not be empty",
            "ValidationError",
            None,
        ))
        .into_response();
    }
    let now = Utc::now();
    let namespace = Namespace {
        tenant_id: metadata.tenant_id().clone(),
        provider: request.provider,
        provider_instance_key: request.provider_instance_key,
        repo_id: request.repo_id,
        account_id: request.account_id,
        installation_id: request.installation_id,
        owner: request.owner,
        name: request.name,
        full_name: request.full_name,
        visibility: request.visibility,
        default_branch: request.default_branch,
        clone_url: request.clone_url,
        html_url: request.html_url,
        webhooks_enabled: request.webhooks_enabled,
        created_at: now,
        updated_at: now,
    };
    match C::upsert_namespace(namespace, ctx.v1_state.store.clone()).await {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct WebhookState {
    pub webhooks_enabled: bool,
}

async fn get_webhook<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path((provider, key, repo_id)): Path<(ProviderKind, String, String)>,
) -> Response {
    let filter = NamespaceFilter::builder()
        .provider(Some(provider))
        .provider_instance_key(Some(key))
        .repo_id(Some(repo_id))
        .build();
    match C::list_namespaces(metadata.tenant_id(), filter, ctx.v1_state.store.clone()).await {
        Ok(namespaces) => namespaces.first().map_or_else(
            || {
                ApiErrorResponse::from(ErrorModel::not_found(
                    "namespace not found",
                    "NotFound",
                    None,
                ))
                .into_response()
            },
            |ns| {
                Json(WebhookState {
                    webhooks_enabled: ns.webhooks_enabled,
                })
                .into_response()
            },
        ),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SetWebhookRequest {
    pub enabled: bool,
}

async fn set_webhook<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path((provider, key, repo_id)): Path<(ProviderKind, String, String)>,
    Json(request): Json<SetWebhookRequest>,
) -> Response {
    match C::set_namespace_webhooks_enabled(
        metadata.tenant_id(),
        provider,
        &key,
        &repo_id,
        request.enabled,
        ctx.v1_state.store.clone(),
    )
    .await
    {
        Ok(namespace) => Json(namespace).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}
