//! Worker protocol surface: per-rule event streams, SCM credentials and
//! terminal status reports.

use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    RequestMetadata,
    api::{ApiContext, ApiErrorResponse, ErrorModel},
    service::{
        EventLogId, EventLogStatus, ProviderKind, RouterState, RouterStore, RuleId,
        store::{EventLogFilter, StoreError},
        worker::WorkerEvent,
    },
};

const BACKLOG_LIMIT: usize = 256;

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new()
        .route("/worker/v1/rules/{rule_id}/events", get(subscribe::<C>))
        .route("/worker/v1/credentials", post(credentials::<C>))
        .route(
            "/worker/v1/events/{log_id}/status",
            post(report_status::<C>),
        )
}

/// Stream `queued`/`delivered` events for a rule: stored backlog first,
/// then live frames from the publish pipeline.
async fn subscribe<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path(rule_id): Path<RuleId>,
) -> Response {
    let tenant = metadata.tenant_id().clone();
    let state = &ctx.v1_state;

    let rule = match C::get_rule(&tenant, rule_id, state.store.clone()).await {
        Ok(Some(rule)) => rule,
        Ok(None) => {
            return ApiErrorResponse::from(ErrorModel::not_found(
                format!("rule {rule_id} not found"),
                "NotFound",
                None,
            ))
            .into_response();
        }
        Err(e) => return ApiErrorResponse::from(e).into_response(),
    };
    tracing::debug!(
        rule_id = %rule_id,
        tenant = %rule.rule.tenant_id,
        "Worker subscribed"
    );

    // Subscribe before reading the backlog so no frame falls in between.
    let live_rx = state.worker_hub.subscribe(rule_id);

    let mut backlog = Vec::new();
    for status in [EventLogStatus::Queued, EventLogStatus::Delivered] {
        let filter = EventLogFilter::builder()
            .rule_id(Some(rule_id))
            .status(Some(status))
            .build();
        match C::list_event_logs(&tenant, filter, BACKLOG_LIMIT, 0, state.store.clone()).await {
            Ok(records) => backlog.extend(records.iter().map(WorkerEvent::from_record)),
            Err(e) => return ApiErrorResponse::from(e).into_response(),
        }
    }
    backlog.sort_by_key(|frame| frame.envelope.log_id.clone());

    let backlog_stream = futures::stream::iter(
        backlog
            .into_iter()
            .filter_map(|frame| sse_frame(&frame))
            .map(Ok::<_, Infallible>),
    );
    let live_stream = futures::stream::unfold(live_rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if let Some(event) = sse_frame(&frame) {
                        return Some((Ok::<_, Infallible>(event), rx));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Worker stream lagged, frames dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(backlog_stream.chain(live_stream))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn sse_frame(frame: &WorkerEvent) -> Option<SseEvent> {
    let data = serde_json::to_string(frame).ok()?;
    Some(SseEvent::default().event("event").data(data))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CredentialsRequest {
    pub provider: ProviderKind,
    pub installation_id: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CredentialsResponse {
    pub token: String,
    pub api_base_url: String,
}

/// Issue a scoped bearer token for an installation.
async fn credentials<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Json(request): Json<CredentialsRequest>,
) -> Response {
    let result = ctx
        .v1_state
        .resolver
        .client_for(
            metadata.tenant_id(),
            request.provider,
            &request.installation_id,
        )
        .await;
    match result {
        Ok(creds) => Json(CredentialsResponse {
            token: creds.token,
            api_base_url: creds.api_base_url,
        })
        .into_response(),
        Err(e) => ApiErrorResponse::from(ErrorModel::bad_request(
            e.to_string(),
            "TokenError",
            None,
        ))
        .into_response(),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct StatusReport {
    pub status: EventLogStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Apply a worker's terminal status to an event-log row.
async fn report_status<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path(log_id): Path<EventLogId>,
    Json(report): Json<StatusReport>,
) -> Response {
    if !matches!(
        report.status,
        EventLogStatus::Success | EventLogStatus::Failed
    ) {
        return ApiErrorResponse::from(ErrorModel::bad_request(
            "workers may only report success or failed",
            "ValidationError",
            None,
        ))
        .into_response();
    }
    let result = C::update_event_log_status(
        metadata.tenant_id(),
        log_id,
        report.status,
        report.error_message,
        ctx.v1_state.store.clone(),
    )
    .await;
    match result {
        Ok(record) => Json(record).into_response(),
        Err(e @ StoreError::NotFound { .. }) => ApiErrorResponse::from(e).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}
