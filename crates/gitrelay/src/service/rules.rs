//! Rule loading, compilation caching and evaluation.
//!
//! Compiled rules form an immutable per-tenant snapshot swapped atomically
//! on rule or driver writes; evaluation never holds a lock.

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use moka::future::Cache;

use crate::{
    CONFIG,
    service::{
        DriverId, Event, RouterStore, RuleId, TenantId,
        expr::{CompiledExpr, ExprError},
        store::{RuleWithDriver, StoreError},
    },
};

static RULE_SNAPSHOT_CACHE: LazyLock<Cache<TenantId, Arc<RuleSnapshot>>> = LazyLock::new(|| {
    Cache::builder()
        .max_capacity(10_000)
        .time_to_live(Duration::from_secs(30))
        .build()
});

/// One rule compiled and joined with its driver row.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: RuleId,
    pub when: String,
    pub emit: Vec<String>,
    pub driver_id: DriverId,
    pub driver_name: String,
    pub driver_config: Option<serde_json::Value>,
    pub driver_enabled: bool,
    pub transform_js: Option<String>,
    expr: CompiledExpr,
}

/// The compiled, immutable set of rules for one tenant at one point in
/// time.
#[derive(Debug)]
pub struct RuleSnapshot {
    pub tenant_id: TenantId,
    pub rules: Vec<CompiledRule>,
}

/// One (rule, topic) pair produced by the engine for a single event.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRule {
    pub rule_id: RuleId,
    pub when: String,
    pub topic: String,
    pub driver_id: DriverId,
    pub driver_name: String,
    pub driver_config: Option<serde_json::Value>,
    pub driver_enabled: bool,
    pub transform_js: Option<String>,
}

/// Build a snapshot from joined rule rows, dropping rules the engine can
/// never fire: empty `when`, empty `emit`, unresolved driver, or a `when`
/// that does not compile. Compile failures are reported once here, never
/// per event.
#[must_use]
pub fn build_snapshot(tenant_id: &TenantId, rows: Vec<RuleWithDriver>) -> RuleSnapshot {
    let mut rules = Vec::with_capacity(rows.len());
    for row in rows {
        let rule = row.rule;
        if rule.when.trim().is_empty() || rule.emit.is_empty() {
            tracing::debug!(rule_id = %rule.id, tenant = %tenant_id, "Skipping rule with empty when/emit");
            continue;
        }
        let Some(driver_id) = rule.driver_id else {
            tracing::debug!(rule_id = %rule.id, tenant = %tenant_id, "Skipping rule without driver");
            continue;
        };
        let Some(driver_name) = row.driver_name else {
            tracing::warn!(rule_id = %rule.id, tenant = %tenant_id, "Skipping rule with unresolved driver");
            continue;
        };
        let expr = match CompiledExpr::compile(&rule.when) {
            Ok(expr) => expr,
            Err(e) => {
                tracing::warn!(rule_id = %rule.id, tenant = %tenant_id, "Rule is unusable: {e}");
                continue;
            }
        };
        rules.push(CompiledRule {
            id: rule.id,
            when: rule.when,
            emit: rule.emit,
            driver_id,
            driver_name,
            driver_config: row.driver_config,
            driver_enabled: row.driver_enabled.unwrap_or(false),
            transform_js: rule.transform_js,
            expr,
        });
    }
    RuleSnapshot {
        tenant_id: tenant_id.clone(),
        rules,
    }
}

/// Fetch the tenant's snapshot, loading and compiling on a cache miss.
pub async fn snapshot_for_tenant<C: RouterStore>(
    tenant_id: &TenantId,
    state: C::State,
) -> Result<Arc<RuleSnapshot>, StoreError> {
    if let Some(snapshot) = RULE_SNAPSHOT_CACHE.get(tenant_id).await {
        return Ok(snapshot);
    }
    let rows = C::list_rules(tenant_id, state).await?;
    let snapshot = Arc::new(build_snapshot(tenant_id, rows));
    RULE_SNAPSHOT_CACHE
        .insert(tenant_id.clone(), snapshot.clone())
        .await;
    Ok(snapshot)
}

/// Drop the tenant's snapshot. Called on every rule or driver write for
/// that tenant, including failed writes.
pub async fn invalidate_tenant(tenant_id: &TenantId) {
    tracing::debug!(tenant = %tenant_id, "Invalidating compiled rule snapshot");
    RULE_SNAPSHOT_CACHE.invalidate(tenant_id).await;
}

/// Evaluate every rule of a snapshot against an event, in stored order.
///
/// A matching rule emits one [`MatchedRule`] per `emit` topic. Expression
/// runtime errors are non-matches; in strict mode they are logged as
/// explicit failures.
#[must_use]
pub fn evaluate(snapshot: &RuleSnapshot, event: &Event) -> Vec<MatchedRule> {
    let strict = CONFIG.rules_strict;
    evaluate_with_mode(snapshot, event, strict)
}

pub(crate) fn evaluate_with_mode(
    snapshot: &RuleSnapshot,
    event: &Event,
    strict: bool,
) -> Vec<MatchedRule> {
    let mut matches = Vec::new();
    for rule in &snapshot.rules {
        let fired = match rule.expr.evaluate(&event.data, &event.raw_object, strict) {
            Ok(fired) => fired,
            Err(e @ ExprError::MissingPath { .. }) if strict => {
                tracing::error!(
                    rule_id = %rule.id,
                    tenant = %snapshot.tenant_id,
                    request_id = %event.request_id,
                    "Strict evaluation failed: {e}"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    rule_id = %rule.id,
                    tenant = %snapshot.tenant_id,
                    request_id = %event.request_id,
                    "Rule evaluation error, treating as non-match: {e}"
                );
                false
            }
        };
        if !fired {
            continue;
        }
        for topic in &rule.emit {
            matches.push(MatchedRule {
                rule_id: rule.id,
                when: rule.when.clone(),
                topic: topic.clone(),
                driver_id: rule.driver_id,
                driver_name: rule.driver_name.clone(),
                driver_config: rule.driver_config.clone(),
                driver_enabled: rule.driver_enabled,
                transform_js: rule.transform_js.clone(),
            });
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::service::{
        ProviderKind,
        flatten::flatten,
        store::{Rule, RuleWithDriver},
    };

    fn rule_row(
        when: &str,
        emit: &[&str],
        driver: Option<(&str, bool)>,
        position: i64,
    ) -> RuleWithDriver {
        let now = chrono::Utc::now();
        RuleWithDriver {
            rule: Rule {
                id: RuleId::new_random(),
                tenant_id: TenantId::from("acme"),
                when: when.to_string(),
                emit: emit.iter().map(ToString::to_string).collect(),
                driver_id: driver.map(|_| DriverId::new_random()),
                transform_js: None,
                position,
                created_at: now,
                updated_at: now,
            },
            driver_name: driver.map(|(name, _)| name.to_string()),
            driver_config: driver.map(|_| json!({"url": "amqp://localhost"})),
            driver_enabled: driver.map(|(_, enabled)| enabled),
        }
    }

    fn event(payload: serde_json::Value) -> Event {
        Event {
            provider: ProviderKind::Github,
            name: "pull_request".to_string(),
            request_id: "req-1".to_string(),
            tenant_id: TenantId::from("acme"),
            installation_id: "11".to_string(),
            provider_instance_key: "github.com".to_string(),
            state_id: "owner-1".to_string(),
            namespace_id: "1".to_string(),
            namespace_name: "o/r".to_string(),
            headers: std::collections::BTreeMap::new(),
            raw_payload: bytes::Bytes::from(payload.to_string()),
            data: flatten(&payload),
            raw_object: payload,
            log_id: None,
        }
    }

    #[test]
    fn invalid_rules_are_dropped_at_load() {
        let tenant = TenantId::from("acme");
        let rows = vec![
            rule_row("", &["t"], Some(("amqp", true)), 0),
            rule_row("action == \"opened\"", &[], Some(("amqp", true)), 1),
            rule_row("action == \"opened\"", &["t"], None, 2),
            rule_row("action ==", &["t"], Some(("amqp", true)), 3),
            rule_row("action == \"opened\"", &["t"], Some(("amqp", true)), 4),
        ];
        let snapshot = build_snapshot(&tenant, rows);
        assert_eq!(snapshot.rules.len(), 1);
    }

    #[test]
    fn matches_in_rule_then_emit_order() {
        let tenant = TenantId::from("acme");
        let rows = vec![
            rule_row(
                "action == \"closed\" && pull_request.merged == true",
                &["pr.merged", "audit.pr.merged"],
                Some(("amqp", true)),
                0,
            ),
            rule_row("action == \"closed\"", &["pr.closed"], Some(("nats", true)), 1),
        ];
        let snapshot = build_snapshot(&tenant, rows);
        let event = event(json!({"action": "closed", "pull_request": {"merged": true}}));
        let matches = evaluate_with_mode(&snapshot, &event, false);
        let topics: Vec<&str> = matches.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["pr.merged", "audit.pr.merged", "pr.closed"]);
    }

    #[test]
    fn disabled_driver_matches_are_still_returned() {
        let tenant = TenantId::from("acme");
        let rows = vec![rule_row(
            "action == \"opened\"",
            &["t"],
            Some(("amqp", false)),
            0,
        )];
        let snapshot = build_snapshot(&tenant, rows);
        let matches = evaluate_with_mode(&snapshot, &event(json!({"action": "opened"})), false);
        assert_eq!(matches.len(), 1);
        assert!(!matches[0].driver_enabled);
    }

    #[test]
    fn runtime_error_is_a_non_match() {
        let tenant = TenantId::from("acme");
        // Numeric comparison against a string payload value errors at
        // evaluation time.
        let rows = vec![rule_row("action > 3", &["t"], Some(("amqp", true)), 0)];
        let snapshot = build_snapshot(&tenant, rows);
        let matches = evaluate_with_mode(&snapshot, &event(json!({"action": "opened"})), false);
        assert!(matches.is_empty());
    }

    #[test]
    fn strict_mode_missing_path_is_a_non_match() {
        let tenant = TenantId::from("acme");
        let rows = vec![rule_row(
            "pull_request.draft == false",
            &["t"],
            Some(("amqp", true)),
            0,
        )];
        let snapshot = build_snapshot(&tenant, rows);
        let payload = json!({"action": "opened"});
        assert!(evaluate_with_mode(&snapshot, &event(payload.clone()), true).is_empty());
        // Lenient mode: missing path is null, null == false is false too,
        // but no error is raised.
        assert!(evaluate_with_mode(&snapshot, &event(payload), false).is_empty());
    }

    #[test]
    fn inserting_a_rule_keeps_existing_match_order() {
        let tenant = TenantId::from("acme");
        let a = rule_row("action == \"opened\"", &["first"], Some(("amqp", true)), 0);
        let b = rule_row("action == \"opened\"", &["second"], Some(("amqp", true)), 1);
        let before = build_snapshot(&tenant, vec![a.clone(), b.clone()]);
        let c = rule_row("action == \"opened\"", &["third"], Some(("amqp", true)), 2);
        let after = build_snapshot(&tenant, vec![a, b, c]);

        let ev = event(json!({"action": "opened"}));
        let topics_before: Vec<String> = evaluate_with_mode(&before, &ev, false)
            .into_iter()
            .map(|m| m.topic)
            .collect();
        let topics_after: Vec<String> = evaluate_with_mode(&after, &ev, false)
            .into_iter()
            .map(|m| m.topic)
            .collect();
        assert_eq!(topics_after[..2], topics_before[..]);
    }
}
