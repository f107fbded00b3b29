//! In-flight event values and the broker envelope.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::service::{EventLogId, ProviderKind, TenantId};

/// Normalized record built from a webhook delivery. Immutable once handed
/// to the publisher, except for `log_id` which is stamped per match before
/// publishing.
#[derive(Debug, Clone)]
pub struct Event {
    pub provider: ProviderKind,
    /// Provider event name, e.g. `pull_request`.
    pub name: String,
    pub request_id: String,
    pub tenant_id: TenantId,
    pub installation_id: String,
    pub provider_instance_key: String,
    /// Provider account id owning the installation.
    pub state_id: String,
    pub namespace_id: String,
    pub namespace_name: String,
    pub headers: BTreeMap<String, String>,
    /// Original request body bytes.
    pub raw_payload: bytes::Bytes,
    /// Payload parsed as a generic JSON tree.
    pub raw_object: serde_json::Value,
    /// Flattened path→value view of the payload.
    pub data: BTreeMap<String, serde_json::Value>,
    pub log_id: Option<EventLogId>,
}

/// The on-the-wire record carried by every published message.
///
/// `payload` is the original webhook body unless a per-rule transform
/// replaced it for this match. The same fields are mirrored into
/// broker-level metadata for consumer-side filtering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, utoipa::ToSchema)]
pub struct Envelope {
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub provider: String,
    pub event: String,
    pub request_id: String,
    pub log_id: String,
    pub topic: String,
    pub driver: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub webhook_token: Option<String>,
}

impl Envelope {
    /// Broker-level metadata mirroring the envelope fields.
    #[must_use]
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        meta.insert("provider".to_string(), self.provider.clone());
        meta.insert("event".to_string(), self.event.clone());
        meta.insert("request_id".to_string(), self.request_id.clone());
        meta.insert("log_id".to_string(), self.log_id.clone());
        meta.insert("topic".to_string(), self.topic.clone());
        meta.insert("driver".to_string(), self.driver.clone());
        meta.insert("tenant_id".to_string(), self.tenant_id.clone());
        if let Some(token) = &self.webhook_token {
            meta.insert("webhook_token".to_string(), token.clone());
        }
        meta
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// SHA-256 of a request body, hex encoded. Stored on every event log row.
#[must_use]
pub fn body_hash(body: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(body))
}

/// Deterministic short hash of a configuration value, used for provider
/// instance identity and publisher cache keys.
#[must_use]
pub fn config_hash(config: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    // BTreeMap-backed canonicalization: object keys sort, so equivalent
    // configs hash identically.
    let canonical = canonicalize(config);
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&digest[..9])
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<_, _> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            serde_json::to_value(sorted).unwrap_or_default()
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            payload: b"{\"action\":\"opened\"}".to_vec(),
            provider: "github".to_string(),
            event: "pull_request".to_string(),
            request_id: "req-1".to_string(),
            log_id: "0192f0c1-0000-7000-8000-000000000001".to_string(),
            topic: "pr.opened.ready".to_string(),
            driver: "amqp".to_string(),
            tenant_id: "acme".to_string(),
            webhook_token: None,
        }
    }

    #[test]
    fn envelope_round_trips() {
        let env = envelope();
        let bytes = env.to_bytes().unwrap();
        let back = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.payload, b"{\"action\":\"opened\"}");
    }

    #[test]
    fn metadata_mirrors_fields() {
        let meta = envelope().metadata();
        assert_eq!(meta["provider"], "github");
        assert_eq!(meta["topic"], "pr.opened.ready");
        assert!(!meta.contains_key("webhook_token"));
    }

    #[test]
    fn body_hash_is_sha256_hex() {
        assert_eq!(
            body_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn config_hash_ignores_key_order() {
        let a = json!({"url": "amqp://x", "mode": "durable_queue"});
        let b = json!({"mode": "durable_queue", "url": "amqp://x"});
        assert_eq!(config_hash(&a), config_hash(&b));
        assert_ne!(config_hash(&a), config_hash(&json!({"url": "amqp://y"})));
    }
}
