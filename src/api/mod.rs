//! HTTP interface.
//!
//! A thin transport over [`SessionScheduler`](crate::session::SessionScheduler):
//! - `GET  /api/health`, `/api/system`, `/api/tasks`
//! - `POST /api/sessions` creates and starts a session
//! - `GET  /api/sessions[/:id]`, `POST /api/sessions/:id/cancel`,
//!   `DELETE /api/sessions/:id`
//! - `GET  /api/sessions/:id/results?format=json|zip|both`
//! - `GET  /api/sessions/:id/events` (SSE) and `/api/sessions/:id/ws`
//!   (WebSocket) push progress snapshots until the session is terminal

mod routes;
mod stream;
mod types;

pub use routes::{app, serve, AppState};
pub use types::*;
