//! Versioned object storage backed by a SQLite metadata store and plain
//! payload files on a local filesystem.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
