//! OAuth authorization-code callbacks.
//!
//! `GET /auth/{provider}/callback` exchanges the authorization code for an
//! access token, upserts the installation row and redirects to the
//! configured base URL with query parameters describing the installation.

use axum::{
    Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    CONFIG,
    api::{ApiContext, ApiErrorResponse, ErrorModel},
    service::{
        Installation, ProviderInstance, ProviderKind, RouterState, RouterStore, TenantId,
        credentials,
    },
};

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new().route("/auth/{provider}/callback", get(callback::<C>))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: String,
    /// Round-tripped state; carries the tenant the login was started for.
    #[serde(default)]
    state: String,
    /// Provider instance key; defaults to the first enabled instance.
    #[serde(default)]
    instance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

async fn callback<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    Path(provider): Path<ProviderKind>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    match run_callback::<C>(&ctx.v1_state, provider, query).await {
        Ok(redirect) => redirect.into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn run_callback<C: RouterStore>(
    state: &RouterState<C>,
    provider: ProviderKind,
    query: CallbackQuery,
) -> Result<Redirect, ErrorModel> {
    let tenant = TenantId::from(query.state.as_str());
    let instances = C::resolve_provider_instances(provider, state.store.clone())
        .await
        .map_err(ErrorModel::from)?;
    let instance = instances
        .into_iter()
        .filter(|i| i.tenant_id == tenant || i.tenant_id.is_global())
        .find(|i| {
            query
                .instance
                .as_deref()
                .is_none_or(|wanted| i.key == wanted)
        })
        .ok_or_else(|| {
            ErrorModel::bad_request(
                format!("no configured {provider} instance for callback"),
                "OAuthCallbackError",
                None,
            )
        })?;

    let token = exchange_code(&instance, &query.code).await?;
    let account_id = fetch_account_id(&instance, &token.access_token)
        .await
        .unwrap_or_default();

    let now = Utc::now();
    let installation = Installation {
        tenant_id: tenant.clone(),
        provider,
        account_id: account_id.clone(),
        // OAuth-stored providers have no app installation; the account is
        // the installation scope.
        installation_id: account_id.clone(),
        provider_instance_key: instance.key.clone(),
        access_token: Some(token.access_token),
        refresh_token: token.refresh_token,
        token_expires_at: token
            .expires_in
            .map(|secs| now + chrono::Duration::seconds(secs)),
        created_at: now,
        updated_at: now,
    };
    let stored = C::upsert_installation(installation, state.store.clone())
        .await
        .map_err(ErrorModel::from)?;
    credentials::invalidate_instances(&tenant).await;

    let base = CONFIG
        .oauth
        .redirect_base_url
        .as_ref()
        .map_or_else(|| "/".to_string(), |u| u.to_string());
    let redirect = format!(
        "{}?provider={}&installation_id={}&account_id={}&instance={}",
        base.trim_end_matches('/'),
        provider,
        urlencode(&stored.installation_id),
        urlencode(&stored.account_id),
        urlencode(&instance.key),
    );
    Ok(Redirect::to(&redirect))
}

async fn exchange_code(
    instance: &ProviderInstance,
    code: &str,
) -> Result<TokenResponse, ErrorModel> {
    let (Some(client_id), Some(client_secret)) = (&instance.client_id, &instance.client_secret)
    else {
        return Err(ErrorModel::bad_request(
            "provider instance has no OAuth client configured",
            "OAuthCallbackError",
            None,
        ));
    };
    let token_url = authorize_token_url(instance);
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("client_id", client_id.as_str()),
        ("client_secret", client_secret.as_str()),
    ];
    let response = reqwest::Client::new()
        .post(token_url)
        .header(http::header::ACCEPT, "application/json")
        .form(&params)
        .send()
        .await
        .map_err(|e| {
            ErrorModel::bad_request(
                format!("token exchange failed: {e}"),
                "OAuthCallbackError",
                None,
            )
        })?;
    if !response.status().is_success() {
        return Err(ErrorModel::bad_request(
            format!("token endpoint responded {}", response.status()),
            "OAuthCallbackError",
            None,
        ));
    }
    response.json().await.map_err(|e| {
        ErrorModel::bad_request(
            format!("token response unreadable: {e}"),
            "OAuthCallbackError",
            None,
        )
    })
}

fn authorize_token_url(instance: &ProviderInstance) -> String {
    match instance.provider {
        ProviderKind::Github => "https://github.com/login/oauth/access_token".to_string(),
        ProviderKind::Gitlab => {
            let base = instance.api_base();
            format!("{}/oauth/token", base.trim_end_matches("/api/v4"))
        }
        ProviderKind::Bitbucket => "https://bitbucket.org/site/oauth2/access_token".to_string(),
        ProviderKind::Slack => "https://slack.com/api/oauth.v2.access".to_string(),
    }
}

/// Resolve the account id behind a fresh token; providers disagree on the
/// identity endpoint.
async fn fetch_account_id(instance: &ProviderInstance, token: &str) -> Option<String> {
    let (url, pointer) = match instance.provider {
        ProviderKind::Github => (format!("{}/user", instance.api_base()), "/id"),
        ProviderKind::Gitlab => (format!("{}/user", instance.api_base()), "/id"),
        ProviderKind::Bitbucket => (format!("{}/user", instance.api_base()), "/uuid"),
        ProviderKind::Slack => (format!("{}/auth.test", instance.api_base()), "/team_id"),
    };
    let response = reqwest::Client::new()
        .get(url)
        .bearer_auth(token)
        .header(http::header::USER_AGENT, "gitrelay")
        .send()
        .await
        .ok()?;
    let body: serde_json::Value = response.json().await.ok()?;
    body.pointer(pointer)
        .map(crate::service::ingress::json_id_to_string)
}

fn urlencode(value: &str) -> String {
    serde_urlencoded::to_string([("v", value)])
        .unwrap_or_default()
        .trim_start_matches("v=")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_urls_per_provider() {
        let now = Utc::now();
        let mut instance = ProviderInstance {
            tenant_id: TenantId::global(),
            provider: ProviderKind::Github,
            key: "github.com".to_string(),
            app_id: None,
            private_key: None,
            client_id: None,
            client_secret: None,
            webhook_secret: None,
            api_base_url: None,
            webhook_path: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(
            authorize_token_url(&instance),
            "https://github.com/login/oauth/access_token"
        );
        instance.provider = ProviderKind::Gitlab;
        instance.api_base_url = Some("https://gitlab.example.com/api/v4".to_string());
        assert_eq!(
            authorize_token_url(&instance),
            "https://gitlab.example.com/oauth/token"
        );
    }

    #[test]
    fn urlencoding_query_values() {
        assert_eq!(urlencode("{uuid-1}"), "%7Buuid-1%7D");
        assert_eq!(urlencode("plain"), "plain");
    }
}
