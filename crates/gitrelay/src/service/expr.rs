//! The `when` expression language for rules.
//!
//! Bare identifiers and `$`-prefixed JSONPath tokens are rewritten into
//! synthetic variables bound to payload lookups, then the rewritten source
//! is compiled once with the boolean-expression evaluator. Evaluation reads
//! the flattened payload view first and falls back to a JSONPath query
//! against the raw parsed object for paths the flat view cannot answer.

use std::collections::BTreeMap;

use evalexpr::{ContextWithMutableFunctions, ContextWithMutableVariables, Function};
use serde_json::Value as JsonValue;

/// Keywords that are never rewritten into variables.
const KEYWORDS: &[&str] = &["true", "false", "null"];

/// Helper functions callable from expressions.
const FUNCTIONS: &[&str] = &["contains", "like"];

#[derive(thiserror::Error, Debug)]
pub enum ExprError {
    #[error("expression failed to compile: {message}")]
    Compile { message: String },
    #[error("payload path `{path}` is missing")]
    MissingPath { path: String },
    #[error("expression evaluation failed: {message}")]
    Eval { message: String },
}

/// One synthetic variable and the payload path it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    var: String,
    /// Always `$`-prefixed, e.g. `$.pull_request.draft`.
    path: String,
}

/// A compiled `when` expression. Compile once, evaluate per event.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    rewritten: String,
    node: evalexpr::Node,
    bindings: Vec<Binding>,
}

impl CompiledExpr {
    /// Rewrite and compile an expression source.
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let (rewritten, bindings) = rewrite(source)?;
        let node = evalexpr::build_operator_tree(&rewritten).map_err(|e| ExprError::Compile {
            message: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            rewritten,
            node,
            bindings,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a flattened payload view and the raw parsed object.
    ///
    /// Missing paths resolve to null unless `strict` is set, in which case
    /// they fail the evaluation.
    pub fn evaluate(
        &self,
        data: &BTreeMap<String, JsonValue>,
        raw: &JsonValue,
        strict: bool,
    ) -> Result<bool, ExprError> {
        let mut context = evalexpr::HashMapContext::new();
        install_functions(&mut context)?;

        for binding in &self.bindings {
            let resolved = resolve_path(&binding.path, data, raw);
            let value = match resolved {
                Some(v) => v,
                None if strict => {
                    return Err(ExprError::MissingPath {
                        path: binding.path.clone(),
                    });
                }
                None => evalexpr::Value::Empty,
            };
            context
                .set_value(binding.var.clone(), value)
                .map_err(|e| ExprError::Eval {
                    message: e.to_string(),
                })?;
        }

        self.node
            .eval_boolean_with_context(&context)
            .map_err(|e| ExprError::Eval {
                message: e.to_string(),
            })
    }
}

/// Look a `$`-prefixed path up in the flat view, falling back to a JSONPath
/// query for wildcard/filter paths the flat view cannot express.
fn resolve_path(
    path: &str,
    data: &BTreeMap<String, JsonValue>,
    raw: &JsonValue,
) -> Option<evalexpr::Value> {
    let flat_key = path.strip_prefix("$.").unwrap_or(path);
    if let Some(v) = data.get(flat_key) {
        return Some(json_to_eval(v));
    }

    let selected = jsonpath_lib::select(raw, path).ok()?;
    match selected.as_slice() {
        [] => None,
        [single] => Some(json_to_eval(single)),
        many => Some(evalexpr::Value::Tuple(
            many.iter().map(|v| json_to_eval(v)).collect(),
        )),
    }
}

fn json_to_eval(value: &JsonValue) -> evalexpr::Value {
    match value {
        JsonValue::Null => evalexpr::Value::Empty,
        JsonValue::Bool(b) => evalexpr::Value::Boolean(*b),
        JsonValue::Number(n) => n.as_i64().map_or_else(
            || evalexpr::Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            evalexpr::Value::Int,
        ),
        JsonValue::String(s) => evalexpr::Value::String(s.clone()),
        JsonValue::Array(items) => {
            evalexpr::Value::Tuple(items.iter().map(json_to_eval).collect())
        }
        JsonValue::Object(_) => evalexpr::Value::String(value.to_string()),
    }
}

fn install_functions(context: &mut evalexpr::HashMapContext) -> Result<(), ExprError> {
    let set = |ctx: &mut evalexpr::HashMapContext,
               name: &str,
               f: Function|
     -> Result<(), ExprError> {
        ctx.set_function(name.to_string(), f)
            .map_err(|e| ExprError::Eval {
                message: e.to_string(),
            })
    };

    set(
        context,
        "contains",
        Function::new(|argument| {
            let args = argument.as_fixed_len_tuple(2)?;
            let needle = &args[1];
            let found = match &args[0] {
                evalexpr::Value::String(haystack) => match needle {
                    evalexpr::Value::String(n) => haystack.contains(n.as_str()),
                    other => haystack.contains(&other.to_string()),
                },
                evalexpr::Value::Tuple(items) => items.iter().any(|item| item == needle),
                _ => false,
            };
            Ok(evalexpr::Value::Boolean(found))
        }),
    )?;

    set(
        context,
        "like",
        Function::new(|argument| {
            let args = argument.as_fixed_len_tuple(2)?;
            let value = match &args[0] {
                evalexpr::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let pattern = match &args[1] {
                evalexpr::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(evalexpr::Value::Boolean(like_match(&value, &pattern)))
        }),
    )?;

    Ok(())
}

/// SQL-LIKE style matching where `%` matches any run of characters.
fn like_match(value: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return value == pattern;
    }

    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Rewrite bare identifiers and JSONPath tokens into synthetic variables.
///
/// Quoted substrings are copied verbatim; tokens keep balanced `[…]` ranges
/// (including quotes inside them); the terminator set is whitespace, `,`,
/// `;`, arithmetic and comparison operators, logical operators and the
/// closing paren. Unknown function names are a compile failure, reported
/// once per rule.
fn rewrite(source: &str) -> Result<(String, Vec<Binding>), ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut bindings: Vec<Binding> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let (literal, next) = consume_quoted(&chars, i);
                // The evaluator only accepts double-quoted strings.
                out.push_str(&normalize_string_literal(&literal));
                i = next;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let (token, next) = consume_token(&chars, i);
                i = next;
                let followed_by_paren = chars.get(i).copied() == Some('(');
                if KEYWORDS.contains(&token.as_str()) {
                    // evalexpr spells null as the empty value.
                    out.push_str(if token == "null" { "()" } else { &token });
                } else if followed_by_paren {
                    if !FUNCTIONS.contains(&token.as_str()) {
                        return Err(ExprError::Compile {
                            message: format!("unknown function `{token}`"),
                        });
                    }
                    out.push_str(&token);
                } else {
                    let path = if token.starts_with('$') {
                        token.clone()
                    } else {
                        format!("$.{token}")
                    };
                    let var = bind(&mut bindings, &path);
                    out.push_str(&var);
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok((out, bindings))
}

/// Reuse the variable for an already-bound path; disambiguate sanitized
/// collisions with a numeric suffix.
fn bind(bindings: &mut Vec<Binding>, path: &str) -> String {
    if let Some(existing) = bindings.iter().find(|b| b.path == path) {
        return existing.var.clone();
    }
    let base = format!("v_{}", safe_name(path));
    let mut var = base.clone();
    let mut n = 1;
    while bindings.iter().any(|b| b.var == var) {
        var = format!("{base}_{n}");
        n += 1;
    }
    bindings.push(Binding {
        var: var.clone(),
        path: path.to_string(),
    });
    var
}

fn safe_name(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Rewrite a single-quoted literal as a double-quoted one, unescaping
/// `\'` and escaping embedded `"`.
fn normalize_string_literal(literal: &str) -> String {
    if !literal.starts_with('\'') {
        return literal.to_string();
    }
    let inner: Vec<char> = literal.chars().collect();
    let mut out = String::with_capacity(literal.len() + 2);
    out.push('"');
    let mut i = 1;
    while i + 1 < inner.len() {
        let c = inner[i];
        if c == '\\' && i + 2 < inner.len() {
            let next = inner[i + 1];
            if next == '\'' {
                out.push('\'');
            } else {
                out.push('\\');
                out.push(next);
            }
            i += 2;
            continue;
        }
        if c == '"' {
            out.push('\\');
        }
        out.push(c);
        i += 1;
    }
    out.push('"');
    out
}

fn consume_quoted(chars: &[char], start: usize) -> (String, usize) {
    let quote = chars[start];
    let mut out = String::new();
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        i += 1;
        if c == '\\' && i < chars.len() {
            out.push(chars[i]);
            i += 1;
        } else if c == quote {
            break;
        }
    }
    (out, i)
}

fn is_terminator(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            ',' | ';' | '+' | '-' | '*' | '/' | '%' | '=' | '!' | '<' | '>' | '&' | '|' | ')' | '('
        )
}

fn consume_token(chars: &[char], start: usize) -> (String, usize) {
    let mut out = String::new();
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if c == '[' {
            let (bracketed, next) = consume_bracketed(chars, i);
            out.push_str(&bracketed);
            i = next;
        } else if is_terminator(c) {
            break;
        } else {
            out.push(c);
            i += 1;
        }
    }
    (out, i)
}

/// Copy a balanced `[…]` range, honoring nesting and quoted substrings
/// (JSONPath filters may contain both).
fn consume_bracketed(chars: &[char], start: usize) -> (String, usize) {
    let mut out = String::new();
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            let (literal, next) = consume_quoted(chars, i);
            out.push_str(&literal);
            i = next;
            continue;
        }
        out.push(c);
        i += 1;
        if c == '[' {
            depth += 1;
        } else if c == ']' {
            depth -= 1;
            if depth == 0 {
                break;
            }
        }
    }
    (out, i)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::service::flatten::flatten;

    fn eval(source: &str, payload: &serde_json::Value) -> Result<bool, ExprError> {
        let expr = CompiledExpr::compile(source).expect("compile");
        expr.evaluate(&flatten(payload), payload, false)
    }

    fn eval_strict(source: &str, payload: &serde_json::Value) -> Result<bool, ExprError> {
        let expr = CompiledExpr::compile(source).expect("compile");
        expr.evaluate(&flatten(payload), payload, true)
    }

    #[test]
    fn rewrites_bare_identifiers() {
        let (rewritten, bindings) = rewrite("action == \"opened\"").unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].path, "$.action");
        assert_eq!(rewritten, format!("{} == \"opened\"", bindings[0].var));
    }

    #[test]
    fn keeps_keywords_and_functions() {
        let (rewritten, bindings) = rewrite("x == null && contains(tags, \"a\") || true").unwrap();
        assert!(rewritten.contains("()"));
        assert!(rewritten.contains("contains("));
        assert!(rewritten.contains("true"));
        // x and tags bound, nothing else.
        assert_eq!(bindings.len(), 2);
    }

    #[test]
    fn preserves_bracket_ranges_in_tokens() {
        let (_, bindings) = rewrite("$.labels[0].name == \"bug\"").unwrap();
        assert_eq!(bindings[0].path, "$.labels[0].name");
    }

    #[test]
    fn matches_pr_opened() {
        let payload = json!({"action": "opened", "pull_request": {"draft": false}});
        assert!(eval(
            "action == \"opened\" && pull_request.draft == false",
            &payload
        )
        .unwrap());
        assert!(!eval(
            "action == \"closed\" && pull_request.draft == false",
            &payload
        )
        .unwrap());
    }

    #[test]
    fn missing_path_is_null_in_lenient_mode() {
        let payload = json!({"action": "opened"});
        assert!(eval("pull_request.draft == null", &payload).unwrap());
        assert!(!eval("pull_request.draft == false", &payload).unwrap());
    }

    #[test]
    fn missing_path_fails_in_strict_mode() {
        let payload = json!({"action": "opened"});
        let err = eval_strict("pull_request.draft == false", &payload).unwrap_err();
        assert!(matches!(err, ExprError::MissingPath { .. }));
        // Present values still evaluate.
        assert!(eval_strict("action == \"opened\"", &payload).unwrap());
    }

    #[test]
    fn numeric_comparisons_and_arithmetic() {
        let payload = json!({"pr": {"additions": 120, "deletions": 20}});
        assert!(eval("pr.additions + pr.deletions > 100", &payload).unwrap());
        assert!(eval("pr.additions % 2 == 0", &payload).unwrap());
        assert!(!eval("pr.additions < 100", &payload).unwrap());
    }

    #[test]
    fn contains_on_strings_and_arrays() {
        let payload = json!({"title": "fix: flaky test", "refs": ["main", "dev"]});
        assert!(eval("contains(title, \"flaky\")", &payload).unwrap());
        assert!(eval("contains(refs, \"dev\")", &payload).unwrap());
        assert!(!eval("contains(refs, \"prod\")", &payload).unwrap());
    }

    #[test]
    fn like_wildcards() {
        assert!(like_match("refs/heads/main", "refs/heads/%"));
        assert!(like_match("release-1.2", "%-1.2"));
        assert!(like_match("a-b-c", "a%c"));
        assert!(!like_match("refs/tags/v1", "refs/heads/%"));
        assert!(like_match("exact", "exact"));
        assert!(!like_match("exact!", "exact"));
    }

    #[test]
    fn like_function_in_expression() {
        let payload = json!({"ref": "refs/heads/feature/x"});
        assert!(eval("like($.ref, \"refs/heads/%\")", &payload).unwrap());
    }

    #[test]
    fn jsonpath_fallback_for_filters() {
        let payload = json!({"labels": [{"name": "bug"}, {"name": "p1"}]});
        assert!(eval(
            "contains($.labels[*].name, \"p1\")",
            &payload
        )
        .unwrap());
    }

    #[test]
    fn compile_failure_is_reported() {
        assert!(CompiledExpr::compile("action ==").is_err());
        assert!(CompiledExpr::compile("unknownfn(a, b)").is_err());
    }

    #[test]
    fn single_quoted_strings() {
        let payload = json!({"action": "opened"});
        assert!(eval("action == 'opened'", &payload).unwrap());
    }

    #[test]
    fn single_quote_normalization() {
        assert_eq!(normalize_string_literal("'abc'"), "\"abc\"");
        assert_eq!(normalize_string_literal(r"'a\'b'"), "\"a'b\"");
        assert_eq!(normalize_string_literal("'say \"hi\"'"), "\"say \\\"hi\\\"\"");
        assert_eq!(normalize_string_literal("\"kept\""), "\"kept\"");
    }

    #[test]
    fn same_path_reuses_binding() {
        let (_, bindings) = rewrite("a.b == 1 || a.b == 2").unwrap();
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn sanitized_collisions_stay_distinct() {
        let (_, bindings) = rewrite("a.b == 1 && a_b == 2").unwrap();
        assert_eq!(bindings.len(), 2);
        assert_ne!(bindings[0].var, bindings[1].var);
    }
}
