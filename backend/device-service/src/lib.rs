//! Device command service.
//!
//! Accepts device commands over HTTP, mutates the aggregate under
//! optimistic concurrency, and appends the resulting domain events to the
//! transactional outbox in the same database transaction. Delivery of
//! those events is the device-worker's job.

pub mod auth;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod repository;
pub mod services;

pub use config::Config;
