//! Shared building blocks for the courier notification engine: configuration,
//! error type, domain model and the notification lifecycle state machine.

pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod redis_pool;
pub mod types;
