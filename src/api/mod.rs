//! HTTP API for the audit engine.
//!
//! ## Endpoints
//!
//! - `POST /api/v1/upload` - Upload a document (multipart field `file`) and start an audit
//! - `GET /api/v1/tasks` - List known tasks
//! - `GET /api/v1/tasks/{id}` - Task status and progress
//! - `GET /api/v1/report/{id}` - Audit report (202 while the task is running)
//! - `GET /api/v1/download/{id}` - Annotated document, or the report if none was produced
//! - `GET /api/v1/artifacts/{id}` - Paths of the produced artifacts
//! - `GET /api/health` - Health check with inference breaker state

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
