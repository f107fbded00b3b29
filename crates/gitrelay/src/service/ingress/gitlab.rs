//! GitLab webhook handling: shared-token verification.

use http::HeaderMap;

use super::{IngressError, ProviderHandler, VerifiedInstance, constant_time_eq, json_id_to_string};
use crate::service::{ProviderInstance, ProviderKind};

pub const EVENT_HEADER: &str = "x-gitlab-event";
pub const TOKEN_HEADER: &str = "x-gitlab-token";

#[derive(Debug, Default, Clone, Copy)]
pub struct GitlabHandler;

impl ProviderHandler for GitlabHandler {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gitlab
    }

    fn default_webhook_path(&self) -> &'static str {
        "/webhooks/gitlab"
    }

    fn event_name(&self, headers: &HeaderMap, payload: Option<&serde_json::Value>) -> String {
        headers
            .get(EVENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .or_else(|| {
                payload
                    .and_then(|p| p.get("object_kind"))
                    .and_then(|v| v.as_str())
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn verify(
        &self,
        instances: &[ProviderInstance],
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedInstance, IngressError> {
        let _ = body;
        let secrets: Vec<&ProviderInstance> = instances
            .iter()
            .filter(|i| i.webhook_secret.is_some())
            .collect();
        if secrets.is_empty() {
            // Token verification is optional per instance config.
            return Ok(None);
        }
        let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) else {
            return Err(IngressError::Signature);
        };
        for instance in secrets {
            let secret = instance.webhook_secret.as_deref().unwrap_or_default();
            if constant_time_eq(secret.as_bytes(), token.as_bytes()) {
                return Ok(Some(std::sync::Arc::new(instance.clone())));
            }
        }
        Err(IngressError::Signature)
    }

    fn repository_id(&self, payload: &serde_json::Value) -> Option<String> {
        payload
            .pointer("/project/id")
            .or_else(|| payload.get("project_id"))
            .map(json_id_to_string)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::service::TenantId;

    fn instance(secret: Option<&str>) -> ProviderInstance {
        let now = Utc::now();
        ProviderInstance {
            tenant_id: TenantId::global(),
            provider: ProviderKind::Gitlab,
            key: "gitlab.com".to_string(),
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

    #[test]
    fn matching_token_verifies() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "tok-1".parse().unwrap());
        let verified = GitlabHandler
            .verify(&[instance(Some("tok-1"))], &headers, b"{}")
            .unwrap();
        assert!(verified.is_some());
    }

    #[test]
    fn wrong_or_missing_token_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "wrong".parse().unwrap());
        assert!(matches!(
            GitlabHandler.verify(&[instance(Some("tok-1"))], &headers, b"{}"),
            Err(IngressError::Signature)
        ));
        assert!(matches!(
            GitlabHandler.verify(&[instance(Some("tok-1"))], &HeaderMap::new(), b"{}"),
            Err(IngressError::Signature)
        ));
    }

    #[test]
    fn no_secret_configured_accepts() {
        let verified = GitlabHandler
            .verify(&[instance(None)], &HeaderMap::new(), b"{}")
            .unwrap();
        assert!(verified.is_none());
    }

    #[test]
    fn project_id_resolution() {
        assert_eq!(
            GitlabHandler.repository_id(&json!({"project": {"id": 7}})),
            Some("7".to_string())
        );
        assert_eq!(
            GitlabHandler.repository_id(&json!({"project_id": 9})),
            Some("9".to_string())
        );
    }

    #[test]
    fn event_name_falls_back_to_object_kind() {
        assert_eq!(
            GitlabHandler.event_name(&HeaderMap::new(), Some(&json!({"object_kind": "push"}))),
            "push"
        );
    }
}
