use std::fmt::{Display, Formatter};

use crate::api::ErrorModel;

/// Failure kinds surfaced by store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum StoreBackendErrorType {
    Unexpected,
    ConcurrentModification,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] StoreBackendError),
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("validation failed: {0}")]
    Validation(String),
}

impl StoreError {
    #[must_use]
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Opaque backend failure with a context stack, carried up to the error
/// model.
#[derive(Debug)]
pub struct StoreBackendError {
    pub r#type: StoreBackendErrorType,
    pub stack: Vec<String>,
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl StoreBackendError {
    pub fn new<E>(source: E, r#type: StoreBackendErrorType) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            r#type,
            stack: Vec::new(),
            source: Box::new(source),
        }
    }

    pub fn new_unexpected<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(source, StoreBackendErrorType::Unexpected)
    }

    #[must_use]
    pub fn append_detail(mut self, detail: impl Into<String>) -> Self {
        self.stack.push(detail.into());
        self
    }
}

impl std::error::Error for StoreBackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source as &(dyn std::error::Error + 'static))
    }
}

impl Display for StoreBackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "StoreBackendError ({}): {}", self.r#type, self.source)?;
        if !self.stack.is_empty() {
            writeln!(f, "Stack:")?;
            for detail in &self.stack {
                writeln!(f, "  {detail}")?;
            }
        }
        Ok(())
    }
}

impl From<StoreError> for ErrorModel {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Backend(e) => {
                let code = match e.r#type {
                    StoreBackendErrorType::Unexpected => {
                        http::StatusCode::SERVICE_UNAVAILABLE.as_u16()
                    }
                    StoreBackendErrorType::ConcurrentModification => {
                        http::StatusCode::CONFLICT.as_u16()
                    }
                };
                let mut model = ErrorModel::new(
                    format!("Store backend error ({}): {}", e.r#type, e.source),
                    "StoreBackendError",
                    code,
                    Some(e.source),
                );
                model.stack = e.stack;
                model
            }
            StoreError::NotFound { entity } => {
                ErrorModel::not_found(format!("{entity} not found"), "NotFound", None)
            }
            StoreError::IllegalTransition { .. } => {
                ErrorModel::conflict(err.to_string(), "IllegalStatusTransition", None)
            }
            StoreError::Validation(_) => {
                ErrorModel::bad_request(err.to_string(), "ValidationError", None)
            }
        }
    }
}

impl From<StoreError> for crate::api::ApiErrorResponse {
    fn from(err: StoreError) -> Self {
        ErrorModel::from(err).into()
    }
}
