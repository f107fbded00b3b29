//! Per-rule payload transforms.
//!
//! A rule's `transform_js` runs in an isolated JavaScript interpreter per
//! invocation. No host bindings are exposed; the function receives the
//! parsed payload and a minimal event context and its return value (or the
//! `payload` field of a returned envelope) replaces the raw payload for
//! that match only.

use boa_engine::{Context, JsValue, Source, js_string};

use crate::service::{Event, ProviderKind};

#[derive(thiserror::Error, Debug)]
pub enum TransformError {
    #[error("transform failed to compile: {0}")]
    Compile(String),
    #[error("transform failed at runtime: {0}")]
    Runtime(String),
    #[error("transform payload is not valid JSON: {0}")]
    InvalidPayload(String),
}

/// The minimal context a transform sees besides the payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransformContext {
    pub provider: ProviderKind,
    pub event: String,
    pub request_id: String,
}

impl From<&Event> for TransformContext {
    fn from(event: &Event) -> Self {
        Self {
            provider: event.provider,
            event: event.name.clone(),
            request_id: event.request_id.clone(),
        }
    }
}

/// Run `transform(payload, event)` and return the replacement payload
/// bytes.
pub fn apply_transform(
    script: &str,
    payload: &[u8],
    ctx: &TransformContext,
) -> Result<Vec<u8>, TransformError> {
    let parsed: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| TransformError::InvalidPayload(e.to_string()))?;

    let mut context = Context::default();
    context
        .eval(Source::from_bytes(script))
        .map_err(|e| TransformError::Compile(e.to_string()))?;

    let transform = context
        .global_object()
        .get(js_string!("transform"), &mut context)
        .map_err(|e| TransformError::Compile(e.to_string()))?;
    let Some(callable) = transform.as_callable() else {
        return Err(TransformError::Compile(
            "script must define a `transform` function".to_string(),
        ));
    };

    let payload_js = JsValue::from_json(&parsed, &mut context)
        .map_err(|e| TransformError::Runtime(e.to_string()))?;
    let ctx_json = serde_json::to_value(ctx)
        .map_err(|e| TransformError::Runtime(e.to_string()))?;
    let ctx_js = JsValue::from_json(&ctx_json, &mut context)
        .map_err(|e| TransformError::Runtime(e.to_string()))?;

    let result = callable
        .call(&JsValue::undefined(), &[payload_js, ctx_js], &mut context)
        .map_err(|e| TransformError::Runtime(e.to_string()))?;

    let result_json = result
        .to_json(&mut context)
        .map_err(|e| TransformError::Runtime(e.to_string()))?;

    // An envelope-shaped return replaces the payload with its `payload`
    // field; anything else replaces it wholesale.
    let replacement = match &result_json {
        serde_json::Value::Object(map) if map.contains_key("payload") => {
            map.get("payload").cloned().unwrap_or(serde_json::Value::Null)
        }
        other => other.clone(),
    };

    serde_json::to_vec(&replacement).map_err(|e| TransformError::Runtime(e.to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn ctx() -> TransformContext {
        TransformContext {
            provider: ProviderKind::Github,
            event: "pull_request".to_string(),
            request_id: "req-1".to_string(),
        }
    }

    #[test]
    fn passthrough_transform() {
        let out = apply_transform(
            "function transform(payload, event) { return payload; }",
            br#"{"action":"opened"}"#,
            &ctx(),
        )
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, json!({"action": "opened"}));
    }

    #[test]
    fn transform_reshapes_payload() {
        let script = r#"
            function transform(payload, event) {
                return { kind: event.event, action: payload.action };
            }
        "#;
        let out = apply_transform(script, br#"{"action":"closed"}"#, &ctx()).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, json!({"kind": "pull_request", "action": "closed"}));
    }

    #[test]
    fn envelope_return_unwraps_payload() {
        let script = r#"
            function transform(payload, event) {
                return { payload: { wrapped: true }, topic: "ignored" };
            }
        "#;
        let out = apply_transform(script, b"{}", &ctx()).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, json!({"wrapped": true}));
    }

    #[test]
    fn runtime_throw_is_a_runtime_error() {
        let script = r#"function transform(payload, event) { throw new Error("boom"); }"#;
        let err = apply_transform(script, b"{}", &ctx()).unwrap_err();
        assert!(matches!(err, TransformError::Runtime(_)));
    }

    #[test]
    fn syntax_error_is_a_compile_error() {
        let err = apply_transform("function transform(", b"{}", &ctx()).unwrap_err();
        assert!(matches!(err, TransformError::Compile(_)));
    }

    #[test]
    fn missing_function_is_a_compile_error() {
        let err = apply_transform("var x = 1;", b"{}", &ctx()).unwrap_err();
        assert!(matches!(err, TransformError::Compile(_)));
    }

    #[test]
    fn invalid_payload_is_rejected() {
        let err = apply_transform(
            "function transform(p) { return p; }",
            b"not json",
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidPayload(_)));
    }
}
