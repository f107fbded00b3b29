pub mod management;
pub mod oauth;
pub mod router;
pub mod webhooks;
pub mod worker;

use std::{
    error::Error as StdError,
    fmt::{Display, Formatter},
};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const X_REQUEST_ID_HEADER: &str = "x-request-id";

pub type Result<T, E = ApiErrorResponse> = std::result::Result<T, E>;

/// JSON wrapper for all error responses (non-2xx).
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ApiErrorResponse {
    pub error: ErrorModel,
}

impl From<ErrorModel> for ApiErrorResponse {
    fn from(value: ErrorModel) -> Self {
        ApiErrorResponse { error: value }
    }
}

impl From<ApiErrorResponse> for ErrorModel {
    fn from(value: ApiErrorResponse) -> Self {
        value.error
    }
}

impl Display for ApiErrorResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl axum::response::IntoResponse for ApiErrorResponse {
    fn into_response(self) -> axum::response::Response {
        let code = StatusCode::from_u16(self.error.code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if code.is_server_error() {
            tracing::error!(error_id = %self.error.error_id, "{}", self.error);
        } else if !self.error.skip_log {
            tracing::debug!(error_id = %self.error.error_id, "{}", self.error);
        }
        (code, axum::Json(self)).into_response()
    }
}

/// JSON error payload with further details on the error.
#[derive(Default, Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorModel {
    /// Human-readable error message
    pub message: String,
    /// Internal type definition of the error
    pub r#type: String,
    /// HTTP response code
    pub code: u16,
    #[serde(skip)]
    #[schema(ignore)]
    pub source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stack: Vec<String>,
    #[serde(skip)]
    #[schema(ignore)]
    pub skip_log: bool,
    #[serde(skip)]
    #[schema(ignore)]
    pub error_id: Uuid,
}

impl StdError for ErrorModel {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl Display for ErrorModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} ({}): {}", self.r#type, self.code, self.message)?;

        if !self.stack.is_empty() {
            writeln!(f, "Stack:")?;
            for detail in &self.stack {
                writeln!(f, "  {detail}")?;
            }
        }

        if let Some(source) = self.source.as_ref() {
            writeln!(f, "Caused by:")?;
            error_chain_fmt(&**source, f)?;
        }

        Ok(())
    }
}

pub(crate) fn error_chain_fmt(
    e: impl StdError,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}

type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

impl ErrorModel {
    pub fn new(
        message: impl Into<String>,
        r#type: impl Into<String>,
        code: u16,
        source: Option<BoxedError>,
    ) -> Self {
        Self {
            message: message.into(),
            r#type: r#type.into(),
            code,
            source,
            stack: Vec::new(),
            skip_log: false,
            error_id: Uuid::now_v7(),
        }
    }

    pub fn bad_request(
        message: impl Into<String>,
        r#type: impl Into<String>,
        source: Option<BoxedError>,
    ) -> Self {
        Self::new(message, r#type, StatusCode::BAD_REQUEST.as_u16(), source)
    }

    pub fn unauthorized(
        message: impl Into<String>,
        r#type: impl Into<String>,
        source: Option<BoxedError>,
    ) -> Self {
        Self::new(message, r#type, StatusCode::UNAUTHORIZED.as_u16(), source)
    }

    pub fn not_found(
        message: impl Into<String>,
        r#type: impl Into<String>,
        source: Option<BoxedError>,
    ) -> Self {
        Self::new(message, r#type, StatusCode::NOT_FOUND.as_u16(), source)
    }

    pub fn conflict(
        message: impl Into<String>,
        r#type: impl Into<String>,
        source: Option<BoxedError>,
    ) -> Self {
        Self::new(message, r#type, StatusCode::CONFLICT.as_u16(), source)
    }

    pub fn payload_too_large(
        message: impl Into<String>,
        r#type: impl Into<String>,
        source: Option<BoxedError>,
    ) -> Self {
        Self::new(
            message,
            r#type,
            StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
            source,
        )
    }

    pub fn internal(
        message: impl Into<String>,
        r#type: impl Into<String>,
        source: Option<BoxedError>,
    ) -> Self {
        Self::new(
            message,
            r#type,
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            source,
        )
    }

    #[must_use]
    pub fn append_detail(mut self, detail: impl Into<String>) -> Self {
        self.stack.push(detail.into());
        self
    }

    pub fn append_detail_mut(&mut self, detail: impl Into<String>) {
        self.stack.push(detail.into());
    }
}

/// Shared request context handed to every handler.
#[derive(Clone, Debug)]
pub struct ApiContext<S: Clone + Send + Sync + 'static> {
    pub v1_state: S,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_model_display_carries_stack() {
        let err = ErrorModel::bad_request("broken", "BadThing", None)
            .append_detail("while validating the rule");
        let rendered = err.to_string();
        assert!(rendered.contains("BadThing (400): broken"));
        assert!(rendered.contains("while validating the rule"));
    }

    #[test]
    fn serialized_error_omits_empty_stack() {
        let err = ErrorModel::not_found("nope", "NotFound", None);
        let json = serde_json::to_value(ApiErrorResponse::from(err)).unwrap();
        assert!(json["error"].get("stack").is_none());
        assert_eq!(json["error"]["code"], 404);
    }
}
