//! Rule management endpoints, including the `match` dry run.

use axum::{
    Json, Router,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    RequestMetadata,
    api::{ApiContext, ApiErrorResponse, ErrorModel},
    service::{
        DriverId, RouterState, RouterStore, Rule, RuleId,
        flatten::flatten,
        rules,
        store::StoreError,
    },
};

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new()
        .route("/rules", get(list::<C>).post(create::<C>))
        .route(
            "/rules/{id}",
            get(get_one::<C>).put(update::<C>).delete(delete_one::<C>),
        )
        .route("/rules/match", post(match_rules::<C>))
}

async fn list<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
) -> Response {
    match C::list_rules(metadata.tenant_id(), ctx.v1_state.store.clone()).await {
        Ok(rules) => Json(rules).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn get_one<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path(id): Path<RuleId>,
) -> Response {
    match C::get_rule(metadata.tenant_id(), id, ctx.v1_state.store.clone()).await {
        Ok(Some(rule)) => Json(rule).into_response(),
        Ok(None) => ApiErrorResponse::from(ErrorModel::not_found(
            format!("rule {id} not found"),
            "NotFound",
            None,
        ))
        .into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RuleRequest {
    pub when: String,
    pub emit: Vec<String>,
    pub driver_id: DriverId,
    #[serde(default)]
    pub transform_js: Option<String>,
}

fn validate(request: &RuleRequest) -> Result<(), ErrorModel> {
    if request.when.trim().is_empty() {
        return Err(ErrorModel::bad_request(
            "rule `when` must not be empty",
            "ValidationError",
            None,
        ));
    }
    if request.emit.is_empty() || request.emit.iter().any(|t| t.trim().is_empty()) {
        return Err(ErrorModel::bad_request(
            "rule `emit` must be a non-empty list of topic names",
            "ValidationError",
            None,
        ));
    }
    if let Err(e) = crate::service::expr::CompiledExpr::compile(&request.when) {
        return Err(ErrorModel::bad_request(
            format!("rule `when` does not compile: {e}"),
            "ValidationError",
            None,
        ));
    }
    Ok(())
}

async fn create<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Json(request): Json<RuleRequest>,
) -> Response {
    if let Err(e) = validate(&request) {
        return ApiErrorResponse::from(e).into_response();
    }
    let now = Utc::now();
    let rule = Rule {
        id: RuleId::new_random(),
        tenant_id: metadata.tenant_id().clone(),
        when: request.when,
        emit: request.emit,
        driver_id: Some(request.driver_id),
        transform_js: request.transform_js,
        position: 0,
        created_at: now,
        updated_at: now,
    };
    let result = C::create_rule(rule, ctx.v1_state.store.clone()).await;
    rules::invalidate_tenant(metadata.tenant_id()).await;
    match result {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn update<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path(id): Path<RuleId>,
    Json(request): Json<RuleRequest>,
) -> Response {
    if let Err(e) = validate(&request) {
        return ApiErrorResponse::from(e).into_response();
    }
    let existing = match C::get_rule(metadata.tenant_id(), id, ctx.v1_state.store.clone()).await {
        Ok(Some(existing)) => existing.rule,
        Ok(None) => {
            return ApiErrorResponse::from(ErrorModel::not_found(
                format!("rule {id} not found"),
                "NotFound",
                None,
            ))
            .into_response();
        }
        Err(e) => return ApiErrorResponse::from(e).into_response(),
    };
    let rule = Rule {
        when: request.when,
        emit: request.emit,
        driver_id: Some(request.driver_id),
        transform_js: request.transform_js,
        updated_at: Utc::now(),
        ..existing
    };
    let result = C::update_rule(rule, ctx.v1_state.store.clone()).await;
    rules::invalidate_tenant(metadata.tenant_id()).await;
    match result {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn delete_one<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path(id): Path<RuleId>,
) -> Response {
    let result = C::delete_rule(metadata.tenant_id(), id, ctx.v1_state.store.clone()).await;
    rules::invalidate_tenant(metadata.tenant_id()).await;
    match result {
        Ok(()) => http::StatusCode::NO_CONTENT.into_response(),
        Err(e @ StoreError::NotFound { .. }) => ApiErrorResponse::from(e).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

/// Dry-run matching: a sample payload plus a set of candidate rules,
/// returning the would-be emits without publishing anything.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct MatchRequest {
    pub payload: serde_json::Value,
    pub rules: Vec<MatchRuleSpec>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct MatchRuleSpec {
    pub when: String,
    pub emit: Vec<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MatchResponse {
    pub emits: Vec<MatchEmit>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MatchEmit {
    pub rule_index: usize,
    pub when: String,
    pub topic: String,
}

async fn match_rules<C: RouterStore>(
    metadata: RequestMetadata,
    Json(request): Json<MatchRequest>,
) -> Response {
    let data = flatten(&request.payload);
    let strict = crate::CONFIG.rules_strict;
    let mut emits = Vec::new();
    for (index, spec) in request.rules.iter().enumerate() {
        let compiled = match crate::service::expr::CompiledExpr::compile(&spec.when) {
            Ok(compiled) => compiled,
            Err(e) => {
                return ApiErrorResponse::from(ErrorModel::bad_request(
                    format!("rule {index} does not compile: {e}"),
                    "ValidationError",
                    None,
                ))
                .into_response();
            }
        };
        let fired = compiled
            .evaluate(&data, &request.payload, strict)
            .unwrap_or(false);
        if fired {
            for topic in &spec.emit {
                emits.push(MatchEmit {
                    rule_index: index,
                    when: spec.when.clone(),
                    topic: topic.clone(),
                });
            }
        }
    }
    tracing::debug!(
        tenant = %metadata.tenant_id(),
        candidates = request.rules.len(),
        emits = emits.len(),
        "Rule match dry run"
    );
    Json(MatchResponse { emits }).into_response()
}
