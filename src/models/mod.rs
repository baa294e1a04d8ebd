//! Core data models for the storage engine.
//!
//! These entities map to the fixed metadata schema via `sqlx::FromRow` and
//! serialize as JSON via `serde` for the HTTP adapter.

pub mod bucket;
pub mod multipart;
pub mod object;
pub mod time;
pub mod user;
