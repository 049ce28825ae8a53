//! Repository functions, one per database operation.
//!
//! Every function takes a `&PgPool` and returns a `Result<T, DbError>`.
//! SQL and row mapping only.

pub mod executions;
