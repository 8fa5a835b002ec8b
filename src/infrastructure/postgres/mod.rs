//! PostgreSQL persistence for contacts and message templates.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
