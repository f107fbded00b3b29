//! Slack webhook handling: v0 signature scheme with timestamp skew
//! rejection.

use hmac::{Hmac, Mac};
use http::HeaderMap;
use sha2::Sha256;

use super::{IngressError, ProviderHandler, VerifiedInstance, json_id_to_string};
use crate::service::{ProviderInstance, ProviderKind};

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Maximum accepted clock skew between the delivery timestamp and now.
const MAX_SKEW_SECS: i64 = 5 * 60;

#[derive(Debug, Default, Clone, Copy)]
pub struct SlackHandler;

impl SlackHandler {
    fn verify_at(
        instances: &[ProviderInstance],
        headers: &HeaderMap,
        body: &[u8],
        now: i64,
    ) -> Result<VerifiedInstance, IngressError> {
        let configured: Vec<&ProviderInstance> = instances
            .iter()
            .filter(|i| i.webhook_secret.is_some())
            .collect();
        if configured.is_empty() {
            return Ok(None);
        }

        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("v0="))
            .and_then(|hex| hex::decode(hex).ok())
            .ok_or(IngressError::Signature)?;
        let timestamp: i64 = headers
            .get(TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or(IngressError::Signature)?;

        if (now - timestamp).abs() > MAX_SKEW_SECS {
            return Err(IngressError::Signature);
        }

        // The signing instance is ambiguous; try every configured Slack
        // instance and select the one whose secret verifies.
        for instance in configured {
            let secret = instance.webhook_secret.as_deref().unwrap_or_default();
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .map_err(|_| IngressError::Signature)?;
            mac.update(format!("v0:{timestamp}:").as_bytes());
            mac.update(body);
            if mac.verify_slice(&signature).is_ok() {
                return Ok(Some(std::sync::Arc::new(instance.clone())));
            }
        }
        Err(IngressError::Signature)
    }
}

impl ProviderHandler for SlackHandler {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Slack
    }

    fn default_webhook_path(&self) -> &'static str {
        "/webhooks/slack"
    }

    fn event_name(&self, _headers: &HeaderMap, payload: Option<&serde_json::Value>) -> String {
        payload
            .and_then(|p| {
                p.pointer("/event/type")
                    .or_else(|| p.get("type"))
                    .and_then(|v| v.as_str())
            })
            .unwrap_or("unknown")
            .to_string()
    }

    fn verify(
        &self,
        instances: &[ProviderInstance],
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedInstance, IngressError> {
        Self::verify_at(instances, headers, body, chrono::Utc::now().timestamp())
    }

    fn repository_id(&self, payload: &serde_json::Value) -> Option<String> {
        payload
            .get("team_id")
            .or_else(|| payload.pointer("/team/id"))
            .map(json_id_to_string)
    }

    fn installation_id(&self, payload: &serde_json::Value) -> Option<String> {
        // Slack events carry no app installation object; the team is the
        // installation scope.
        payload.get("team_id").map(json_id_to_string)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::service::TenantId;

    fn instance(key: &str, secret: &str) -> ProviderInstance {
        let now = Utc::now();
        ProviderInstance {
            tenant_id: TenantId::global(),
            provider: ProviderKind::Slack,
            key: key.to_string(),
            app_id: None,
            private_key: None,
            client_id: None,
            client_secret: None,
            webhook_secret: Some(secret.to_string()),
            api_base_url: None,
            webhook_path: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn headers_for(secret: &str, timestamp: i64, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, sign(secret, timestamp, body).parse().unwrap());
        headers.insert(TIMESTAMP_HEADER, timestamp.to_string().parse().unwrap());
        headers
    }

    #[test]
    fn valid_signature_within_window_verifies() {
        let now = 1_700_000_000;
        let body = br#"{"type":"event_callback"}"#;
        let headers = headers_for("slack-secret", now - 10, body);
        let verified =
            SlackHandler::verify_at(&[instance("a", "slack-secret")], &headers, body, now)
                .unwrap();
        assert!(verified.is_some());
    }

    #[test]
    fn skew_boundary_is_inclusive() {
        let now = 1_700_000_000;
        let body = b"{}";
        // Exactly five minutes old: accepted.
        let headers = headers_for("s", now - MAX_SKEW_SECS, body);
        assert!(SlackHandler::verify_at(&[instance("a", "s")], &headers, body, now).is_ok());
        // One second beyond: rejected.
        let headers = headers_for("s", now - MAX_SKEW_SECS - 1, body);
        assert!(matches!(
            SlackHandler::verify_at(&[instance("a", "s")], &headers, body, now),
            Err(IngressError::Signature)
        ));
    }

    #[test]
    fn ambiguous_instances_try_every_secret() {
        let now = 1_700_000_000;
        let body = b"{}";
        let headers = headers_for("second-secret", now, body);
        let verified = SlackHandler::verify_at(
            &[instance("first", "first-secret"), instance("second", "second-secret")],
            &headers,
            body,
            now,
        )
        .unwrap()
        .expect("an instance must verify");
        assert_eq!(verified.key, "second");
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let now = 1_700_000_000;
        let body = b"{}";
        let headers = headers_for("other", now, body);
        assert!(matches!(
            SlackHandler::verify_at(&[instance("a", "s")], &headers, body, now),
            Err(IngressError::Signature)
        ));
    }

    #[test]
    fn event_name_from_payload() {
        assert_eq!(
            SlackHandler.event_name(
                &HeaderMap::new(),
                Some(&json!({"type": "event_callback", "event": {"type": "message"}})),
            ),
            "message"
        );
        assert_eq!(
            SlackHandler.event_name(&HeaderMap::new(), Some(&json!({"type": "url_verification"}))),
            "url_verification"
        );
    }

    #[test]
    fn team_id_is_the_namespace_key() {
        assert_eq!(
            SlackHandler.repository_id(&json!({"team_id": "T123"})),
            Some("T123".to_string())
        );
    }
}
