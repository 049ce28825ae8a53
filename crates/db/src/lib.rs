//! `db` crate: Postgres persistence for the workflow engine.
//!
//! Provides a connection pool, typed row structs, repository functions for
//! the `executions` and `step_executions` tables, and [`PgStateStore`], the
//! engine's [`StateStore`](engine::StateStore) backed by them.

pub mod error;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use pool::{create_pool, run_migrations, DbPool};
pub use store::PgStateStore;
