//! ZapGate PostgreSQL access layer
//!
//! Connection pooling over `deadpool-postgres` plus idempotent schema
//! bootstrap executed at service start.

mod error;
mod pool;
mod schema;

pub use error::{DbError, Result};
pub use pool::{DbPool, PoolConfig, PoolStats};
pub use schema::ensure_schema;

/// Re-export tokio-postgres types for convenience
pub use tokio_postgres::{types::ToSql, Row};
