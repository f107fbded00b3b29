//! Webhook ingress endpoints.

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::post,
};
use http::{HeaderMap, StatusCode, header::HeaderValue};

use crate::{
    RequestMetadata, X_REQUEST_ID_HEADER_NAME,
    api::ApiContext,
    service::{
        ProviderKind, RouterState, RouterStore,
        ingress::{
            self, IngressError, ProviderHandler, bitbucket::BitbucketHandler,
            github::GithubHandler, gitlab::GitlabHandler, slack::SlackHandler,
        },
    },
};

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new()
        .route("/webhooks/github", post(github_webhook::<C>))
        .route("/webhooks/gitlab", post(gitlab_webhook::<C>))
        .route("/webhooks/bitbucket", post(bitbucket_webhook::<C>))
        .route("/webhooks/slack", post(slack_webhook::<C>))
        .route("/webhooks/{*path}", post(overridden_webhook::<C>))
}

async fn github_webhook<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(&GithubHandler, &ctx.v1_state, &metadata, &headers, body).await
}

async fn gitlab_webhook<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(&GitlabHandler, &ctx.v1_state, &metadata, &headers, body).await
}

async fn bitbucket_webhook<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(&BitbucketHandler, &ctx.v1_state, &metadata, &headers, body).await
}

async fn slack_webhook<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(&SlackHandler, &ctx.v1_state, &metadata, &headers, body).await
}

/// Per-instance webhook path overrides: any unmatched path below
/// `/webhooks/` is resolved against configured instances.
async fn overridden_webhook<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    Path(path): Path<String>,
    metadata: RequestMetadata,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    use strum::IntoEnumIterator as _;

    let full_path = format!("/webhooks/{path}");
    for provider in ProviderKind::iter() {
        let instances = match C::resolve_provider_instances(provider, ctx.v1_state.store.clone())
            .await
        {
            Ok(instances) => instances,
            Err(e) => return crate::api::ApiErrorResponse::from(e).into_response(),
        };
        if instances
            .iter()
            .any(|i| i.webhook_path.as_deref() == Some(full_path.as_str()))
        {
            return match provider {
                ProviderKind::Github => {
                    dispatch(&GithubHandler, &ctx.v1_state, &metadata, &headers, body).await
                }
                ProviderKind::Gitlab => {
                    dispatch(&GitlabHandler, &ctx.v1_state, &metadata, &headers, body).await
                }
                ProviderKind::Bitbucket => {
                    dispatch(&BitbucketHandler, &ctx.v1_state, &metadata, &headers, body).await
                }
                ProviderKind::Slack => {
                    dispatch(&SlackHandler, &ctx.v1_state, &metadata, &headers, body).await
                }
            };
        }
    }
    respond(&metadata, StatusCode::NOT_FOUND)
}

async fn dispatch<C: RouterStore>(
    provider: &dyn ProviderHandler,
    state: &crate::service::RouterState<C>,
    metadata: &RequestMetadata,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let result =
        ingress::handle_webhook::<C>(provider, state, headers, body, metadata.request_id()).await;
    let status = match result {
        Ok(_) | Err(IngressError::Dropped(_)) => StatusCode::OK,
        Err(IngressError::PayloadTooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
        Err(IngressError::Signature) => StatusCode::UNAUTHORIZED,
        Err(IngressError::Parse(_)) => StatusCode::BAD_REQUEST,
        Err(IngressError::Store(e)) => {
            let mut response = crate::api::ApiErrorResponse::from(e).into_response();
            set_request_id(&mut response, metadata);
            return response;
        }
    };
    respond(metadata, status)
}

/// Empty body; the request id always rides on the response.
fn respond(metadata: &RequestMetadata, status: StatusCode) -> Response {
    let mut response = status.into_response();
    set_request_id(&mut response, metadata);
    response
}

fn set_request_id(response: &mut Response, metadata: &RequestMetadata) {
    if let Ok(value) = HeaderValue::from_str(metadata.request_id()) {
        response.headers_mut().insert(X_REQUEST_ID_HEADER_NAME, value);
    }
}

/// The webhook URL for a provider instance, honoring its path override.
#[must_use]
pub fn webhook_path(provider: ProviderKind, instance_path: Option<&str>) -> String {
    instance_path.map_or_else(
        || format!("/webhooks/{provider}"),
        ToString::to_string,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_paths() {
        assert_eq!(webhook_path(ProviderKind::Github, None), "/webhooks/github");
        assert_eq!(
            webhook_path(ProviderKind::Slack, Some("/hooks/custom-slack")),
            "/hooks/custom-slack"
        );
    }
}
