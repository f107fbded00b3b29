//! Per-provider installation credentials.
//!
//! App-style providers (GitHub) mint a short-lived RS256 app JWT and
//! exchange it for an installation access token, cached until shortly
//! before expiry. OAuth-stored providers return the latest installation
//! row's access token, refreshing it when a refresh token is present and
//! the token is near expiry. Provider instance config is resolved through
//! a per-tenant cache; a miss refreshes the whole tenant.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Deserialize;

use crate::service::{
    Installation, ProviderInstance, ProviderKind, RouterStore, TenantId,
    store::{ProviderInstanceFilter, StoreError},
};

/// Tokens are refreshed this long before their recorded expiry.
const EXPIRY_SAFETY_MARGIN: chrono::Duration = chrono::Duration::seconds(60);

/// App JWT claim window: `iat = now - 60 s`, `exp = now + 9 m`.
const JWT_IAT_BACKDATE: chrono::Duration = chrono::Duration::seconds(60);
const JWT_LIFETIME: chrono::Duration = chrono::Duration::minutes(9);

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("no provider instance `{key}` for {provider}")]
    InstanceNotFound { provider: ProviderKind, key: String },
    #[error("no installation `{installation_id}` for {provider}")]
    InstallationNotFound {
        provider: ProviderKind,
        installation_id: String,
    },
    #[error("provider instance `{0}` has no app credentials")]
    MissingAppCredentials(String),
    #[error("installation carries no usable access token")]
    MissingAccessToken,
    #[error("signing the app JWT failed: {0}")]
    Mint(#[from] jsonwebtoken::errors::Error),
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What callers get back: a bearer token and the API base to use it
/// against.
#[derive(Clone, PartialEq, Eq, veil::Redact)]
pub struct ScmCredentials {
    #[redact]
    pub token: String,
    pub api_base_url: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Whether a token with the given expiry must be (re)fetched now.
fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_none_or(|expiry| expiry - EXPIRY_SAFETY_MARGIN <= now)
}

#[derive(serde::Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Build the app JWT claims for the given app id.
fn app_jwt_claims(app_id: &str, now: DateTime<Utc>) -> AppJwtClaims {
    AppJwtClaims {
        iat: (now - JWT_IAT_BACKDATE).timestamp(),
        exp: (now + JWT_LIFETIME).timestamp(),
        iss: app_id.to_string(),
    }
}

fn mint_app_jwt(instance: &ProviderInstance, now: DateTime<Utc>) -> Result<String, TokenError> {
    let (Some(app_id), Some(private_key)) = (&instance.app_id, &instance.private_key) else {
        return Err(TokenError::MissingAppCredentials(instance.key.clone()));
    };
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key.as_bytes())?;
    let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    Ok(jsonwebtoken::encode(
        &header,
        &app_jwt_claims(app_id, now),
        &key,
    )?)
}

#[derive(Deserialize)]
struct AccessTokensResponse {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct OAuthRefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

type InstanceMap = HashMap<(ProviderKind, String), Arc<ProviderInstance>>;

/// Per-tenant provider-instance cache; a miss refreshes the entire tenant.
static INSTANCE_CACHE: LazyLock<Cache<TenantId, Arc<InstanceMap>>> = LazyLock::new(|| {
    Cache::builder()
        .max_capacity(10_000)
        .time_to_live(Duration::from_secs(300))
        .build()
});

/// Installation token cache keyed by `(tenant, instance key, installation)`.
static TOKEN_CACHE: LazyLock<Cache<(TenantId, String, String), CachedToken>> =
    LazyLock::new(|| Cache::builder().max_capacity(100_000).build());

/// Drop the tenant's provider instances from the cache. Called on provider
/// instance writes.
pub async fn invalidate_instances(tenant: &TenantId) {
    INSTANCE_CACHE.invalidate(tenant).await;
}

/// Resolver for provider instances and installation credentials.
#[derive(Debug, Clone)]
pub struct CredentialResolver<C: RouterStore> {
    state: C::State,
    http: reqwest::Client,
}

impl<C: RouterStore> CredentialResolver<C> {
    #[must_use]
    pub fn new(state: C::State) -> Self {
        Self {
            state,
            http: reqwest::Client::new(),
        }
    }

    /// All enabled provider instances of a tenant, cached.
    pub async fn instances_for_tenant(
        &self,
        tenant: &TenantId,
    ) -> Result<Arc<InstanceMap>, TokenError> {
        if let Some(map) = INSTANCE_CACHE.get(tenant).await {
            return Ok(map);
        }
        let instances = C::list_provider_instances(
            tenant,
            ProviderInstanceFilter::builder().enabled(Some(true)).build(),
            self.state.clone(),
        )
        .await?;
        let map: InstanceMap = instances
            .into_iter()
            .map(|i| ((i.provider, i.key.clone()), Arc::new(i)))
            .collect();
        let map = Arc::new(map);
        INSTANCE_CACHE.insert(tenant.clone(), map.clone()).await;
        Ok(map)
    }

    /// One provider instance by key, through the tenant cache.
    pub async fn instance_for(
        &self,
        tenant: &TenantId,
        provider: ProviderKind,
        key: &str,
    ) -> Result<Arc<ProviderInstance>, TokenError> {
        let map = self.instances_for_tenant(tenant).await?;
        map.get(&(provider, key.to_string())).cloned().ok_or_else(|| {
            TokenError::InstanceNotFound {
                provider,
                key: key.to_string(),
            }
        })
    }

    /// The single capability the resolver presents: a bearer token and API
    /// base URL for an installation.
    pub async fn client_for(
        &self,
        tenant: &TenantId,
        provider: ProviderKind,
        installation_id: &str,
    ) -> Result<ScmCredentials, TokenError> {
        let installation =
            C::get_installation_by_id(tenant, provider, installation_id, self.state.clone())
                .await?
                .ok_or_else(|| TokenError::InstallationNotFound {
                    provider,
                    installation_id: installation_id.to_string(),
                })?;

        match provider {
            ProviderKind::Github => self.github_installation_token(tenant, &installation).await,
            ProviderKind::Gitlab | ProviderKind::Bitbucket | ProviderKind::Slack => {
                self.stored_oauth_token(tenant, installation).await
            }
        }
    }

    /// Installation-token exchange for the app-style provider.
    async fn github_installation_token(
        &self,
        tenant: &TenantId,
        installation: &Installation,
    ) -> Result<ScmCredentials, TokenError> {
        let instance = self
            .instance_for(
                tenant,
                ProviderKind::Github,
                &installation.provider_instance_key,
            )
            .await?;
        let cache_key = (
            tenant.clone(),
            instance.key.clone(),
            installation.installation_id.clone(),
        );

        if let Some(cached) = TOKEN_CACHE.get(&cache_key).await
            && !needs_refresh(Some(cached.expires_at), Utc::now())
        {
            return Ok(ScmCredentials {
                token: cached.token,
                api_base_url: instance.api_base(),
            });
        }

        // Near-expiry entries transition into a single-flight refresh:
        // concurrent callers coalesce on the same exchange future.
        TOKEN_CACHE.invalidate(&cache_key).await;
        let http = self.http.clone();
        let instance_for_exchange = instance.clone();
        let installation_id = installation.installation_id.clone();
        let fetched = TOKEN_CACHE
            .try_get_with(cache_key, async move {
                exchange_installation_token(&http, &instance_for_exchange, &installation_id).await
            })
            .await
            .map_err(|e: Arc<TokenError>| TokenError::Exchange(e.to_string()))?;

        Ok(ScmCredentials {
            token: fetched.token,
            api_base_url: instance.api_base(),
        })
    }

    /// Stored OAuth token retrieval with near-expiry refresh.
    async fn stored_oauth_token(
        &self,
        tenant: &TenantId,
        installation: Installation,
    ) -> Result<ScmCredentials, TokenError> {
        let instance = self
            .instance_for(
                tenant,
                installation.provider,
                &installation.provider_instance_key,
            )
            .await
            .ok()
            .filter(|i| i.enabled);
        let api_base_url = instance
            .as_ref()
            .map_or_else(|| default_api_base(installation.provider), |i| i.api_base());

        let refresh_due = needs_refresh(installation.token_expires_at, Utc::now())
            && installation.token_expires_at.is_some();
        if refresh_due
            && installation.refresh_token.is_some()
            && let Some(instance) = &instance
        {
            match self.refresh_oauth_token(&installation, instance).await {
                Ok(refreshed) => {
                    let updated = C::upsert_installation(refreshed, self.state.clone()).await?;
                    let token = updated
                        .access_token
                        .ok_or(TokenError::MissingAccessToken)?;
                    return Ok(ScmCredentials {
                        token,
                        api_base_url,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %installation.provider,
                        installation_id = %installation.installation_id,
                        "OAuth refresh failed, returning the stored token: {e}"
                    );
                }
            }
        }

        let token = installation
            .access_token
            .ok_or(TokenError::MissingAccessToken)?;
        Ok(ScmCredentials {
            token,
            api_base_url,
        })
    }

    async fn refresh_oauth_token(
        &self,
        installation: &Installation,
        instance: &ProviderInstance,
    ) -> Result<Installation, TokenError> {
        let refresh_token = installation
            .refresh_token
            .as_deref()
            .ok_or(TokenError::MissingAccessToken)?;
        let (Some(client_id), Some(client_secret)) =
            (&instance.client_id, &instance.client_secret)
        else {
            return Err(TokenError::MissingAppCredentials(instance.key.clone()));
        };

        let token_url = oauth_token_url(instance);
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        let response = self
            .http
            .post(token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| TokenError::Exchange(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TokenError::Exchange(format!(
                "token endpoint responded {}",
                response.status()
            )));
        }
        let refreshed: OAuthRefreshResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Exchange(e.to_string()))?;

        let mut updated = installation.clone();
        updated.access_token = Some(refreshed.access_token);
        if refreshed.refresh_token.is_some() {
            updated.refresh_token = refreshed.refresh_token;
        }
        updated.token_expires_at = refreshed
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        updated.updated_at = Utc::now();
        Ok(updated)
    }
}

async fn exchange_installation_token(
    http: &reqwest::Client,
    instance: &ProviderInstance,
    installation_id: &str,
) -> Result<CachedToken, TokenError> {
    let jwt = mint_app_jwt(instance, Utc::now())?;
    let url = format!(
        "{}/app/installations/{installation_id}/access_tokens",
        instance.api_base()
    );
    let response = http
        .post(url)
        .bearer_auth(jwt)
        .header(http::header::ACCEPT, "application/vnd.github+json")
        .header(http::header::USER_AGENT, "gitrelay")
        .send()
        .await
        .map_err(|e| TokenError::Exchange(e.to_string()))?;
    if !response.status().is_success() {
        return Err(TokenError::Exchange(format!(
            "installation token endpoint responded {}",
            response.status()
        )));
    }
    let body: AccessTokensResponse = response
        .json()
        .await
        .map_err(|e| TokenError::Exchange(e.to_string()))?;
    Ok(CachedToken {
        token: body.token,
        expires_at: body
            .expires_at
            .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(55)),
    })
}

fn default_api_base(provider: ProviderKind) -> String {
    match provider {
        ProviderKind::Github => "https://api.github.com".to_string(),
        ProviderKind::Gitlab => "https://gitlab.com/api/v4".to_string(),
        ProviderKind::Bitbucket => "https://api.bitbucket.org/2.0".to_string(),
        ProviderKind::Slack => "https://slack.com/api".to_string(),
    }
}

/// Token endpoint for stored-OAuth providers, derived from the instance's
/// API base.
fn oauth_token_url(instance: &ProviderInstance) -> String {
    match instance.provider {
        ProviderKind::Gitlab => {
            let base = instance.api_base();
            let host = base.trim_end_matches("/api/v4");
            format!("{host}/oauth/token")
        }
        ProviderKind::Bitbucket => "https://bitbucket.org/site/oauth2/access_token".to_string(),
        ProviderKind::Slack => "https://slack.com/api/oauth.v2.access".to_string(),
        ProviderKind::Github => format!("{}/login/oauth/access_token", instance.api_base()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_claim_window() {
        let now = Utc::now();
        let claims = app_jwt_claims("1234", now);
        assert_eq!(claims.iss, "1234");
        assert_eq!(claims.iat, (now - chrono::Duration::seconds(60)).timestamp());
        assert_eq!(claims.exp, (now + chrono::Duration::minutes(9)).timestamp());
    }

    #[test]
    fn refresh_decision_honors_safety_margin() {
        let now = Utc::now();
        assert!(needs_refresh(None, now));
        assert!(needs_refresh(Some(now + chrono::Duration::seconds(30)), now));
        assert!(needs_refresh(Some(now - chrono::Duration::seconds(1)), now));
        assert!(!needs_refresh(
            Some(now + chrono::Duration::seconds(120)),
            now
        ));
    }

    #[test]
    fn gitlab_token_url_derives_from_api_base() {
        let now = Utc::now();
        let instance = ProviderInstance {
            tenant_id: TenantId::global(),
            provider: ProviderKind::Gitlab,
            key: "gitlab.example.com".to_string(),
            app_id: None,
            private_key: None,
            client_id: None,
            client_secret: None,
            webhook_secret: None,
            api_base_url: Some("https://gitlab.example.com/api/v4".to_string()),
            webhook_path: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(
            oauth_token_url(&instance),
            "https://gitlab.example.com/oauth/token"
        );
    }

    #[test]
    fn missing_app_credentials_is_an_error() {
        let now = Utc::now();
        let instance = ProviderInstance {
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
        assert!(matches!(
            mint_app_jwt(&instance, now),
            Err(TokenError::MissingAppCredentials(_))
        ));
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = ScmCredentials {
            token: "ghs_supersecret".to_string(),
            api_base_url: "https://api.github.com".to_string(),
        };
        assert!(!format!("{creds:?}").contains("ghs_supersecret"));
    }
}
