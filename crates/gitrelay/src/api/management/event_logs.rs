//! Event-log query and status endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    RequestMetadata,
    api::{ApiContext, ApiErrorResponse, ErrorModel},
    service::{
        EventLogId, EventLogStatus, ProviderKind, RouterState, RouterStore, RuleId,
        store::{
            BreakdownGroupBy, BreakdownQuery, BreakdownSortBy, EventLogFilter, TimeseriesInterval,
        },
    },
};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

pub(crate) fn router<C: RouterStore>() -> Router<ApiContext<RouterState<C>>> {
    Router::new()
        .route("/event-logs", get(list::<C>))
        .route("/event-logs/analytics", get(analytics::<C>))
        .route("/event-logs/timeseries", get(timeseries::<C>))
        .route("/event-logs/breakdown", get(breakdown::<C>))
        .route("/event-logs/{id}", get(get_one::<C>))
        .route("/event-logs/{id}/status", post(update_status::<C>))
}

/// One query-parameter surface shared by the list, analytics, timeseries
/// and breakdown endpoints; each endpoint validates the fields it needs.
#[derive(Debug, Default, Deserialize)]
struct FilterQuery {
    provider: Option<ProviderKind>,
    name: Option<String>,
    request_id: Option<String>,
    topic: Option<String>,
    rule_id: Option<RuleId>,
    installation_id: Option<String>,
    namespace_id: Option<String>,
    status: Option<EventLogStatus>,
    matched: Option<bool>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
    interval: Option<TimeseriesInterval>,
    group_by: Option<BreakdownGroupBy>,
    sort_by: Option<BreakdownSortBy>,
    desc: Option<bool>,
    page_size: Option<usize>,
    page_token: Option<String>,
    #[serde(default)]
    include_latency: bool,
}

impl FilterQuery {
    fn filter(&self) -> EventLogFilter {
        EventLogFilter {
            provider: self.provider,
            name: self.name.clone(),
            request_id: self.request_id.clone(),
            topic: self.topic.clone(),
            rule_id: self.rule_id,
            installation_id: self.installation_id.clone(),
            namespace_id: self.namespace_id.clone(),
            status: self.status,
            matched: self.matched,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

async fn list<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Query(query): Query<FilterQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    match C::list_event_logs(
        metadata.tenant_id(),
        query.filter(),
        limit,
        offset,
        ctx.v1_state.store.clone(),
    )
    .await
    {
        Ok(records) => Json(records).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn get_one<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path(id): Path<EventLogId>,
) -> Response {
    match C::get_event_log(metadata.tenant_id(), id, ctx.v1_state.store.clone()).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => ApiErrorResponse::from(ErrorModel::not_found(
            format!("event log {id} not found"),
            "NotFound",
            None,
        ))
        .into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn analytics<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Query(query): Query<FilterQuery>,
) -> Response {
    match C::get_event_log_analytics(
        metadata.tenant_id(),
        query.filter(),
        ctx.v1_state.store.clone(),
    )
    .await
    {
        Ok(analytics) => Json(analytics).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn timeseries<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Query(query): Query<FilterQuery>,
) -> Response {
    let Some(interval) = query.interval else {
        return ApiErrorResponse::from(ErrorModel::bad_request(
            "`interval` is required (hour, day or week)",
            "ValidationError",
            None,
        ))
        .into_response();
    };
    match C::get_event_log_timeseries(
        metadata.tenant_id(),
        query.filter(),
        interval,
        ctx.v1_state.store.clone(),
    )
    .await
    {
        Ok(buckets) => Json(buckets).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

async fn breakdown<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Query(query): Query<FilterQuery>,
) -> Response {
    let Some(group_by) = query.group_by else {
        return ApiErrorResponse::from(ErrorModel::bad_request(
            "`group_by` is required",
            "ValidationError",
            None,
        ))
        .into_response();
    };
    let breakdown_query = BreakdownQuery {
        filter: query.filter(),
        group_by,
        sort_by: query.sort_by.unwrap_or(BreakdownSortBy::Events),
        desc: query.desc.unwrap_or(true),
        page_size: query
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        page_token: query.page_token.clone(),
        include_latency: query.include_latency,
    };
    match C::get_event_log_breakdown(
        metadata.tenant_id(),
        breakdown_query,
        ctx.v1_state.store.clone(),
    )
    .await
    {
        Ok(page) => Json(page).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateStatusRequest {
    pub status: EventLogStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

async fn update_status<C: RouterStore>(
    State(ctx): State<ApiContext<RouterState<C>>>,
    metadata: RequestMetadata,
    Path(id): Path<EventLogId>,
    Json(request): Json<UpdateStatusRequest>,
) -> Response {
    match C::update_event_log_status(
        metadata.tenant_id(),
        id,
        request.status,
        request.error_message,
        ctx.v1_state.store.clone(),
    )
    .await
    {
        Ok(record) => Json(record).into_response(),
        Err(e) => ApiErrorResponse::from(e).into_response(),
    }
}
