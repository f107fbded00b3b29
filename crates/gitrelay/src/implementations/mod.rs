pub mod memory;
#[cfg(feature = "sqlx-postgres")]
pub mod postgres;
