#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared infrastructure for the referral ledger services
//!
//! Environment configuration, Postgres pool construction, embedded migrations
//! and tracing setup used by every binary in the workspace.

pub mod config;
pub mod db;
pub mod telemetry;

pub use config::{ConfigError, InfraConfig, LogFormat};
pub use db::{create_migration_pool, create_pool, run_migrations};
pub use telemetry::init_tracing;
