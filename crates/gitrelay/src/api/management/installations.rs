//! Installation read endpoints. Rows are created by OAuth completion or
//! app-installation sync, never through this API.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::{
    RequestMetadata,
    api::{ApiContext, ApiErrorResponse, ErrorModel},
    service::{ProviderKind, RouterState, RouterStore, store::InstallationFilter},
};

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new()
        .route("/installations", get(list::<C>))
        .route("/installations/{provider}/{id}", get(get_one::<C>))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    provider: Option<ProviderKind>,
    account_id: Option<String>,
    installation_id: Option<String>,
    provider_instance_key: Option<String>,
}

async fn list<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = InstallationFilter {
        provider: query.provider,
        account_id: query.account_id,
        installation_id: query.installation_id,
        provider_instance_key: query.provider_instance_key,
    };
    match C::list_installations(metadata.tenant_id(), filter, ctx.v1_state.store.clone()).await {
        Ok(installations) => Json(installations).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn get_one<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path((provider, id)): Path<(ProviderKind, String)>,
) -> Response {
    match C::get_installation_by_id(metadata.tenant_id(), provider, &id, ctx.v1_state.store.clone())
        .await
    {
        Ok(Some(installation)) => Json(installation).into_response(),
        Ok(None) => ApiErrorResponse::from(ErrorModel::not_found(
            format!("installation {provider}/{id} not found"),
            "NotFound",
            None,
        ))
        .into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}
