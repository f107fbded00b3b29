use sqlx::{Row as _, postgres::PgRow};

use crate::service::store::{StoreBackendError, StoreBackendErrorType, StoreError};

pub(crate) trait DBErrorHandler
where
    Self: ToString + Sized + Send + Sync + std::error::Error + 'static,
{
    fn into_store_backend_error(self) -> StoreBackendError;
}

impl DBErrorHandler for sqlx::Error {
    fn into_store_backend_error(self) -> StoreBackendError {
        match self {
            Self::Database(ref db) => {
                match db.code().as_deref() {
                    // https://www.postgresql.org/docs/current/errcodes-appendix.html
                    Some(
                        "2D000" | "25000" | "25001" | "25P01" | "25P02" | "25P03" | "40000"
                        | "40001" | "40002" | "40003" | "40004",
                    ) => StoreBackendError::new(
                        self,
                        StoreBackendErrorType::ConcurrentModification,
                    )
                    .append_detail("Database transaction failed."),
                    _ => StoreBackendError::new_unexpected(self),
                }
            }
            _ => StoreBackendError::new_unexpected(self),
        }
    }
}

/// Read one column, mapping decode failures into the backend error shape.
pub(crate) fn get_col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| e.into_store_backend_error().into())
}
