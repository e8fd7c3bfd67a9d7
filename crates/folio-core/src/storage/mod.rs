//! Storage layer: SQLite connection pool and schema migrations

pub mod database;
pub mod migrations;

pub use database::{Database, DatabaseConfig};
