//! Device event worker.
//!
//! A single polling loop claims unprocessed outbox rows (with a lock
//! that skips rows held by peer pollers, so the worker scales out
//! without code change), projects each event into the read model, runs
//! its side effects (notifications and the retirement saga), and marks
//! the row processed, retried, or dead-lettered.

pub mod clients;
pub mod config;
pub mod dispatch;
pub mod poller;
pub mod projector;
pub mod sagas;

pub use config::WorkerConfig;
