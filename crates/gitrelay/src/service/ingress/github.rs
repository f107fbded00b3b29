//! GitHub webhook handling: HMAC signature verification and app
//! installation lifecycle sync.

use chrono::Utc;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use sha1::Sha1;
use sha2::Sha256;

use super::{IngressError, ProviderHandler, VerifiedInstance, json_id_to_string};
use crate::service::{
    Installation, Namespace, ProviderInstance, ProviderKind, RouterStore, RouterState, TenantId,
    credentials,
};

pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const SIGNATURE_256_HEADER: &str = "x-hub-signature-256";
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

#[derive(Debug, Default, Clone, Copy)]
pub struct GithubHandler;

impl ProviderHandler for GithubHandler {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    fn default_webhook_path(&self) -> &'static str {
        "/webhooks/github"
    }

    fn event_name(&self, headers: &HeaderMap, _payload: Option<&serde_json::Value>) -> String {
        headers
            .get(EVENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string()
    }

    fn verify(
        &self,
        instances: &[ProviderInstance],
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedInstance, IngressError> {
        let secrets: Vec<&ProviderInstance> = instances
            .iter()
            .filter(|i| i.webhook_secret.is_some())
            .collect();
        if secrets.is_empty() {
            // Nothing configured to verify against; accept unverified.
            return Ok(None);
        }

        let sig256 = header_str(headers, SIGNATURE_256_HEADER)
            .and_then(|v| v.strip_prefix("sha256="))
            .and_then(|hex| hex::decode(hex).ok());
        let sig1 = header_str(headers, SIGNATURE_HEADER)
            .and_then(|v| v.strip_prefix("sha1="))
            .and_then(|hex| hex::decode(hex).ok());

        for instance in secrets {
            let secret = instance
                .webhook_secret
                .as_deref()
                .unwrap_or_default()
                .as_bytes();
            if let Some(signature) = &sig256 {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                    .map_err(|_| IngressError::Signature)?;
                mac.update(body);
                if mac.verify_slice(signature).is_ok() {
                    return Ok(Some(std::sync::Arc::new(instance.clone())));
                }
            } else if let Some(signature) = &sig1 {
                // SHA-1 fallback for deliveries without the SHA-256 header.
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(secret).map_err(|_| IngressError::Signature)?;
                mac.update(body);
                if mac.verify_slice(signature).is_ok() {
                    return Ok(Some(std::sync::Arc::new(instance.clone())));
                }
            }
        }
        Err(IngressError::Signature)
    }

    fn repository_id(&self, payload: &serde_json::Value) -> Option<String> {
        payload
            .pointer("/repository/id")
            .map(json_id_to_string)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Whether a payload is an installation lifecycle event.
#[must_use]
pub fn is_installation_lifecycle(payload: &serde_json::Value) -> bool {
    payload.get("installation").is_some()
        && (payload.get("repositories").is_some()
            || payload.get("repositories_added").is_some()
            || payload.get("repositories_removed").is_some()
            || payload
                .pointer("/installation/account")
                .is_some())
}

/// Synchronize installation and namespace rows for `installation` and
/// `installation_repositories` events before rules run.
pub(super) async fn sync_system_rules<C: RouterStore>(
    event: &crate::service::Event,
    state: &RouterState<C>,
) {
    if event.name != "installation" && event.name != "installation_repositories" {
        return;
    }
    if let Err(e) = sync_installation_event::<C>(event, state).await {
        tracing::warn!(
            request_id = %event.request_id,
            event = %event.name,
            "Installation sync failed: {e}"
        );
    }
}

async fn sync_installation_event<C: RouterStore>(
    event: &crate::service::Event,
    state: &RouterState<C>,
) -> Result<(), crate::service::store::StoreError> {
    let payload = &event.raw_object;
    let tenant = event.tenant_id.clone();
    let action = payload
        .get("action")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let account_id = payload
        .pointer("/installation/account/id")
        .map(json_id_to_string)
        .unwrap_or_else(|| event.state_id.clone());
    let account_login = payload
        .pointer("/installation/account/login")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    match action {
        "deleted" => {
            C::delete_installation(
                &tenant,
                ProviderKind::Github,
                &event.installation_id,
                state.store.clone(),
            )
            .await?;
            tracing::info!(
                tenant = %tenant,
                installation_id = %event.installation_id,
                "App uninstalled, removed installation"
            );
        }
        _ => {
            let now = Utc::now();
            C::upsert_installation(
                Installation {
                    tenant_id: tenant.clone(),
                    provider: ProviderKind::Github,
                    account_id: account_id.clone(),
                    installation_id: event.installation_id.clone(),
                    provider_instance_key: event.provider_instance_key.clone(),
                    access_token: None,
                    refresh_token: None,
                    token_expires_at: None,
                    created_at: now,
                    updated_at: now,
                },
                state.store.clone(),
            )
            .await?;
        }
    }

    // Repository membership changes ride on both event types.
    let added = payload
        .get("repositories_added")
        .or_else(|| payload.get("repositories"))
        .and_then(|v| v.as_array());
    if action != "deleted"
        && let Some(repos) = added
    {
        for repo in repos {
            let namespace = namespace_from_repo(
                &tenant,
                event,
                &account_id,
                &account_login,
                repo,
            );
            C::upsert_namespace(namespace, state.store.clone()).await?;
        }
    }
    let removed = if action == "deleted" {
        payload.get("repositories").and_then(|v| v.as_array())
    } else {
        payload
            .get("repositories_removed")
            .and_then(|v| v.as_array())
    };
    if let Some(repos) = removed {
        for repo in repos {
            if let Some(repo_id) = repo.get("id").map(json_id_to_string) {
                C::delete_namespace(
                    &tenant,
                    ProviderKind::Github,
                    &event.provider_instance_key,
                    &repo_id,
                    state.store.clone(),
                )
                .await?;
            }
        }
    }

    // Fresh rows must be visible to credential resolution immediately.
    credentials::invalidate_instances(&tenant).await;
    Ok(())
}

fn namespace_from_repo(
    tenant: &TenantId,
    event: &crate::service::Event,
    account_id: &str,
    account_login: &str,
    repo: &serde_json::Value,
) -> Namespace {
    let now = Utc::now();
    let full_name = repo
        .get("full_name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let name = repo
        .get("name")
        .and_then(|v| v.as_str())
        .map_or_else(
            || full_name.split('/').next_back().unwrap_or_default().to_string(),
            ToString::to_string,
        );
    let owner = full_name
        .split('/')
        .next()
        .filter(|o| !o.is_empty())
        .map_or_else(|| account_login.to_string(), ToString::to_string);
    Namespace {
        tenant_id: tenant.clone(),
        provider: ProviderKind::Github,
        provider_instance_key: event.provider_instance_key.clone(),
        repo_id: repo.get("id").map(json_id_to_string).unwrap_or_default(),
        account_id: account_id.to_string(),
        installation_id: event.installation_id.clone(),
        owner,
        name,
        full_name,
        visibility: repo.get("private").and_then(serde_json::Value::as_bool).map(
            |private| {
                if private { "private" } else { "public" }.to_string()
            },
        ),
        default_branch: repo
            .get("default_branch")
            .and_then(|v| v.as_str())
            .map(ToString::to_string),
        clone_url: None,
        html_url: None,
        webhooks_enabled: true,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn instance(secret: Option<&str>) -> ProviderInstance {
        let now = Utc::now();
        ProviderInstance {
            tenant_id: TenantId::global(),
            provider: ProviderKind::Github,
            key: "github.com".to_string(),
            app_id: None,
            private_key: None,
            client_id: None,
            client_secret: None,
            webhook_secret: secret.map(ToString::to_string),
            api_base_url: None,
            webhook_path: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn sign_sha256(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn sign_sha1(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_sha256_signature_verifies() {
        let body = br#"{"action":"opened"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_256_HEADER,
            sign_sha256("s3cret", body).parse().unwrap(),
        );
        let verified = GithubHandler
            .verify(&[instance(Some("s3cret"))], &headers, body)
            .unwrap();
        assert!(verified.is_some());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let body = br#"{"action":"opened"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_256_HEADER,
            sign_sha256("wrong-secret", body).parse().unwrap(),
        );
        let result = GithubHandler.verify(&[instance(Some("s3cret"))], &headers, body);
        assert!(matches!(result, Err(IngressError::Signature)));
    }

    #[test]
    fn sha1_fallback_when_sha256_header_absent() {
        let body = br#"{"action":"opened"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sign_sha1("s3cret", body).parse().unwrap());
        let verified = GithubHandler
            .verify(&[instance(Some("s3cret"))], &headers, body)
            .unwrap();
        assert!(verified.is_some());
    }

    #[test]
    fn no_configured_secret_accepts_unverified() {
        let body = br#"{}"#;
        let headers = HeaderMap::new();
        let verified = GithubHandler.verify(&[instance(None)], &headers, body).unwrap();
        assert!(verified.is_none());
    }

    #[test]
    fn missing_signature_with_secret_is_rejected() {
        let body = br#"{}"#;
        let headers = HeaderMap::new();
        let result = GithubHandler.verify(&[instance(Some("s3cret"))], &headers, body);
        assert!(matches!(result, Err(IngressError::Signature)));
    }

    #[test]
    fn repository_id_from_payload() {
        assert_eq!(
            GithubHandler.repository_id(&json!({"repository": {"id": 42}})),
            Some("42".to_string())
        );
        assert_eq!(GithubHandler.repository_id(&json!({})), None);
    }

    #[test]
    fn event_name_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_HEADER, "pull_request".parse().unwrap());
        assert_eq!(GithubHandler.event_name(&headers, None), "pull_request");
        assert_eq!(GithubHandler.event_name(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn installation_lifecycle_detection() {
        assert!(is_installation_lifecycle(&json!({
            "installation": {"id": 1, "account": {"id": 2, "login": "octo"}},
        })));
        assert!(!is_installation_lifecycle(&json!({"action": "opened"})));
    }
}
