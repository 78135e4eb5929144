//! Database drivers for querygate
//!
//! Concrete `DatabaseDriver` implementations.

pub mod postgres;

pub use postgres::{PgSession, PostgresConfig, PostgresDriver};
