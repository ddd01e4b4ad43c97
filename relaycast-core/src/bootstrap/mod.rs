//! Bootstrap helpers for the relay binary
//!
//! - Configuration loading (file, `.env`, environment)
//! - Database pool initialization

pub mod config;
pub mod database;

pub use config::load_config;
pub use database::init_database;
