//! Bearer-token validation for the control-plane API.
//!
//! When OAuth2/OIDC is enabled, management requests must carry a bearer
//! token issued by the configured issuer for the configured audience.
//! Signing keys come from the issuer's JWKS, discovered through the
//! OpenID configuration document and cached.

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use moka::future::Cache;
use serde::Deserialize;

use crate::CONFIG;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token rejected: {0}")]
    Invalid(String),
    #[error("JWKS discovery failed: {0}")]
    Discovery(String),
}

#[derive(Debug, Clone, Deserialize)]
struct OpenIdConfiguration {
    jwks_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

static JWKS_CACHE: LazyLock<Cache<String, Arc<JwkSet>>> = LazyLock::new(|| {
    Cache::builder()
        .max_capacity(16)
        .time_to_live(Duration::from_secs(3600))
        .build()
});

/// Validated token identity handed to handlers.
#[derive(Debug, Clone)]
pub struct TokenPrincipal {
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct OidcValidator {
    issuer: url::Url,
    audience: Option<String>,
    http: reqwest::Client,
}

impl OidcValidator {
    /// Build the validator from config; `None` when OAuth2 is disabled.
    #[must_use]
    pub fn from_config() -> Option<Self> {
        let oauth2 = &CONFIG.auth.oauth2;
        if !oauth2.enabled {
            return None;
        }
        let issuer = oauth2.issuer.clone()?;
        Some(Self {
            issuer,
            audience: oauth2.audience.clone(),
            http: reqwest::Client::new(),
        })
    }

    async fn jwks(&self) -> Result<Arc<JwkSet>, AuthError> {
        let issuer = self.issuer.as_str().trim_end_matches('/').to_string();
        if let Some(cached) = JWKS_CACHE.get(&issuer).await {
            return Ok(cached);
        }
        let discovery_url = format!("{issuer}/.well-known/openid-configuration");
        let configuration: OpenIdConfiguration = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| AuthError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Discovery(e.to_string()))?;
        let jwks: JwkSet = self
            .http
            .get(&configuration.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Discovery(e.to_string()))?;
        let jwks = Arc::new(jwks);
        JWKS_CACHE.insert(issuer, jwks.clone()).await;
        Ok(jwks)
    }

    /// Validate a bearer token: signature against the issuer's JWKS plus
    /// issuer and audience claims.
    pub async fn validate(&self, token: &str) -> Result<TokenPrincipal, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        let jwks = self.jwks().await?;
        let key = jwks
            .keys
            .iter()
            .filter(|k| k.kty == "RSA")
            .find(|k| match (&header.kid, &k.kid) {
                (Some(wanted), Some(kid)) => wanted == kid,
                _ => true,
            })
            .ok_or_else(|| AuthError::Invalid("no matching JWKS key".to_string()))?;
        let (Some(n), Some(e)) = (&key.n, &key.e) else {
            return Err(AuthError::Invalid("JWKS key lacks RSA components".to_string()));
        };
        let decoding_key = jsonwebtoken::DecodingKey::from_rsa_components(n, e)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;

        let validation = self.validation(header.alg);
        let data = jsonwebtoken::decode::<serde_json::Value>(token, &decoding_key, &validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        let subject = data
            .claims
            .get("sub")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(TokenPrincipal { subject })
    }

    fn validation(&self, alg: jsonwebtoken::Algorithm) -> jsonwebtoken::Validation {
        let mut validation = jsonwebtoken::Validation::new(alg);
        validation.set_issuer(&[self.issuer.as_str().trim_end_matches('/')]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

/// Extract the bearer token from an Authorization header value.
#[must_use]
pub fn bearer_token(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = http::HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(http::header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
        headers.insert(http::header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn jwks_parses_rsa_keys() {
        let jwks: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [
                {"kid": "k1", "kty": "RSA", "n": "abc", "e": "AQAB"},
                {"kty": "EC", "crv": "P-256"},
            ]
        }))
        .unwrap();
        assert_eq!(jwks.keys.len(), 2);
        assert_eq!(jwks.keys[0].kid.as_deref(), Some("k1"));
    }
}
