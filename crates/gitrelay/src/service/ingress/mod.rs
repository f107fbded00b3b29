//! Webhook ingress: signature verification, payload normalization,
//! installation resolution and hand-off to the rule engine and publisher.

pub mod bitbucket;
pub mod github;
pub mod gitlab;
pub mod slack;

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use http::HeaderMap;

use crate::{
    CONFIG,
    service::{
        Event, Namespace, ProviderInstance, ProviderKind, RouterStore, RouterState,
        eventlog::{self, PipelineOutcome},
        flatten::flatten,
        rules,
        store::StoreError,
    },
};

/// Outcome of signature verification: the instance whose secret verified,
/// or none when no instance is configured to verify this provider.
pub type VerifiedInstance = Option<Arc<ProviderInstance>>;

#[derive(thiserror::Error, Debug)]
pub enum IngressError {
    #[error("request body exceeds the configured maximum")]
    PayloadTooLarge,
    #[error("signature verification failed")]
    Signature,
    #[error("payload is not valid JSON: {0}")]
    Parse(String),
    /// Accepted (200) but not processed.
    #[error("event dropped: {0}")]
    Dropped(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The per-provider capability set the common pipeline drives.
pub trait ProviderHandler: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ProviderKind;

    /// Default webhook path; a provider instance may override it.
    fn default_webhook_path(&self) -> &'static str;

    /// Event name taken from the provider's header (or payload).
    fn event_name(&self, headers: &HeaderMap, payload: Option<&serde_json::Value>) -> String;

    /// Provider-specific signature verification over the raw body.
    fn verify(
        &self,
        instances: &[ProviderInstance],
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<VerifiedInstance, IngressError>;

    /// Repository identifier used for namespace resolution.
    fn repository_id(&self, payload: &serde_json::Value) -> Option<String>;

    /// App installation id carried in the payload, used when no repository
    /// resolves (installation lifecycle events).
    fn installation_id(&self, payload: &serde_json::Value) -> Option<String> {
        payload
            .get("installation")
            .and_then(|i| i.get("id"))
            .map(json_id_to_string)
    }
}

/// Render a JSON id (number or string) as a string key.
pub(crate) fn json_id_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Length-constant byte comparison for secrets and signatures.
#[must_use]
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Derive the branch ref from the payload fields providers spread it
/// across, normalized to `refs/heads/<name>`.
#[must_use]
pub fn derive_ref(payload: &serde_json::Value) -> Option<String> {
    let candidates = [
        payload.get("ref"),
        payload.pointer("/check_suite/head_branch"),
        payload.pointer("/check_suite/head_ref"),
        payload.pointer("/workflow_run/head_branch"),
        payload.pointer("/workflow_run/head_ref"),
        payload.pointer("/push/ref"),
    ];
    let raw = candidates
        .into_iter()
        .flatten()
        .find_map(serde_json::Value::as_str)?;
    if raw.starts_with("refs/") {
        Some(raw.to_string())
    } else {
        Some(format!("refs/heads/{raw}"))
    }
}

/// Run the common ingress pipeline for one delivery.
///
/// Steps: body cap, signature verification, dual parse, annotation, ref
/// derivation, installation resolution, tenant scoping, GitHub system-rule
/// sync, rule evaluation and publish.
pub async fn handle_webhook<C: RouterStore>(
    provider: &dyn ProviderHandler,
    state: &RouterState<C>,
    headers: &HeaderMap,
    body: Bytes,
    request_id: &str,
) -> Result<PipelineOutcome, IngressError> {
    if body.len() > CONFIG.server.max_body_bytes {
        return Err(IngressError::PayloadTooLarge);
    }

    let kind = provider.kind();
    let instances = C::resolve_provider_instances(kind, state.store.clone()).await?;

    let verified = provider.verify(&instances, headers, &body).map_err(|e| {
        // Single-line warning, provider and event type only, never the
        // payload.
        tracing::warn!(
            provider = %kind,
            event = %provider.event_name(headers, None),
            "{e}"
        );
        e
    })?;

    let mut raw_object: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| IngressError::Parse(e.to_string()))?;
    let event_name = provider.event_name(headers, Some(&raw_object));

    // Annotate the parsed tree before flattening so both views agree.
    let derived_ref = derive_ref(&raw_object);
    if let Some(map) = raw_object.as_object_mut() {
        map.insert("provider".to_string(), serde_json::json!(kind.to_string()));
        map.insert("event".to_string(), serde_json::json!(event_name.clone()));
        if let Some(git_ref) = derived_ref {
            map.insert("ref".to_string(), serde_json::json!(git_ref));
        }
    }
    let data = flatten(&raw_object);

    let resolution = resolve_installation::<C>(provider, &raw_object, state).await?;
    let Some(resolution) = resolution else {
        tracing::warn!(
            provider = %kind,
            event = %event_name,
            request_id = %request_id,
            "No installation resolved for delivery, dropping"
        );
        return Err(IngressError::Dropped("no installation resolved"));
    };

    if let Some(namespace) = &resolution.namespace
        && !namespace.webhooks_enabled
    {
        tracing::debug!(
            provider = %kind,
            namespace = %namespace.full_name,
            request_id = %request_id,
            "Webhooks disabled for namespace, dropping"
        );
        return Err(IngressError::Dropped("webhooks disabled for namespace"));
    }

    let tenant = resolution.tenant_id.clone();
    let instance_key = verified
        .as_ref()
        .map(|i| i.key.clone())
        .unwrap_or_else(|| resolution.provider_instance_key.clone());

    let headers_map: BTreeMap<String, String> = headers
        .iter()
        .filter(|(name, _)| *name != http::header::AUTHORIZATION)
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let event = Event {
        provider: kind,
        name: event_name,
        request_id: request_id.to_string(),
        tenant_id: tenant.clone(),
        installation_id: resolution.installation_id.clone(),
        provider_instance_key: instance_key,
        state_id: resolution.account_id.clone(),
        namespace_id: resolution.namespace_id.clone(),
        namespace_name: resolution.namespace_name.clone(),
        headers: headers_map,
        raw_payload: body,
        raw_object,
        data,
        log_id: None,
    };

    if kind == ProviderKind::Github {
        github::sync_system_rules::<C>(&event, state).await;
    }

    let snapshot = rules::snapshot_for_tenant::<C>(&tenant, state.store.clone()).await?;
    let matches = rules::evaluate(&snapshot, &event);
    let publisher = crate::service::drivers::RouterPublisher::<C>::new(state.store.clone());
    let outcome = eventlog::process_event::<C>(
        &event,
        &matches,
        &publisher,
        &state.worker_hub,
        state.store.clone(),
    )
    .await?;

    tracing::debug!(
        provider = %kind,
        tenant = %tenant,
        request_id = %request_id,
        matched = outcome.matched,
        delivered = outcome.delivered,
        failed = outcome.failed,
        "Webhook processed"
    );
    Ok(outcome)
}

/// What installation resolution produced for one delivery.
#[derive(Debug, Clone)]
struct Resolution {
    tenant_id: crate::service::TenantId,
    account_id: String,
    installation_id: String,
    provider_instance_key: String,
    namespace_id: String,
    namespace_name: String,
    namespace: Option<Namespace>,
}

async fn resolve_installation<C: RouterStore>(
    provider: &dyn ProviderHandler,
    payload: &serde_json::Value,
    state: &RouterState<C>,
) -> Result<Option<Resolution>, StoreError> {
    let kind = provider.kind();

    if let Some(repo_id) = provider.repository_id(payload)
        && let Some(namespace) =
            C::resolve_namespace(kind, &repo_id, state.store.clone()).await?
    {
        return Ok(Some(Resolution {
            tenant_id: namespace.tenant_id.clone(),
            account_id: namespace.account_id.clone(),
            installation_id: namespace.installation_id.clone(),
            provider_instance_key: namespace.provider_instance_key.clone(),
            namespace_id: namespace.repo_id.clone(),
            namespace_name: namespace.full_name.clone(),
            namespace: Some(namespace),
        }));
    }

    // Installation lifecycle events carry no resolvable repository; fall
    // back to the installation row.
    if let Some(installation_id) = provider.installation_id(payload) {
        if let Some(installation) =
            C::resolve_installation(kind, &installation_id, state.store.clone()).await?
        {
            return Ok(Some(Resolution {
                tenant_id: installation.tenant_id.clone(),
                account_id: installation.account_id.clone(),
                installation_id: installation.installation_id.clone(),
                provider_instance_key: installation.provider_instance_key.clone(),
                namespace_id: String::new(),
                namespace_name: String::new(),
                namespace: None,
            }));
        }
        // First contact from a fresh app installation: scope to the global
        // tenant so the system-rule sync can create the rows.
        if kind == ProviderKind::Github && github::is_installation_lifecycle(payload) {
            let account_id = payload
                .pointer("/installation/account/id")
                .map(json_id_to_string)
                .unwrap_or_default();
            return Ok(Some(Resolution {
                tenant_id: crate::service::TenantId::global(),
                account_id,
                installation_id,
                provider_instance_key: String::new(),
                namespace_id: String::new(),
                namespace_name: String::new(),
                namespace: None,
            }));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn ref_derivation_sources_and_normalization() {
        assert_eq!(
            derive_ref(&json!({"ref": "refs/heads/main"})),
            Some("refs/heads/main".to_string())
        );
        assert_eq!(
            derive_ref(&json!({"ref": "refs/tags/v1.0"})),
            Some("refs/tags/v1.0".to_string())
        );
        assert_eq!(
            derive_ref(&json!({"check_suite": {"head_branch": "feature/x"}})),
            Some("refs/heads/feature/x".to_string())
        );
        assert_eq!(
            derive_ref(&json!({"workflow_run": {"head_branch": "main"}})),
            Some("refs/heads/main".to_string())
        );
        assert_eq!(
            derive_ref(&json!({"push": {"ref": "refs/heads/dev"}})),
            Some("refs/heads/dev".to_string())
        );
        assert_eq!(derive_ref(&json!({"action": "opened"})), None);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn json_ids_render_as_strings() {
        assert_eq!(json_id_to_string(&json!(42)), "42");
        assert_eq!(json_id_to_string(&json!("{uuid}")), "{uuid}");
    }
}
