//! # hostdiag
//!
//! Runs a catalog of host diagnostic tasks concurrently and bundles their
//! output into a report.
//!
//! This library provides:
//! - A task catalog with per-platform built-in tasks
//! - A session scheduler with bounded concurrency, cancellation and
//!   progress push
//! - JSON and zip packaging of finished sessions
//! - An HTTP API (REST, SSE and WebSocket) over the scheduler
//!
//! ## Architecture
//!
//! ```text
//!   client ──▶ SessionScheduler ──▶ session actor ──▶ TaskExecutor × N
//!                  │                    │                  │
//!                  │                    ▼                  ▼
//!                  │               ProgressHub       ProcessRegistry
//!                  ▼                    │
//!            ResultPackager ◀── terminal ┘
//! ```
//!
//! ## Modules
//! - `catalog`: task descriptors and the built-in tables
//! - `executor`: runs one task action, isolates failures
//! - `session`: session state, scheduler and progress snapshots
//! - `package`: report and archive builders
//! - `api`: axum transport

pub mod api;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod package;
pub mod privilege;
pub mod session;
pub mod system_info;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{DiagError, DiagResult, TaskFailure};
pub use session::SessionScheduler;
