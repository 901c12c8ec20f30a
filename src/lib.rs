//! # Document Auditor
//!
//! Audit orchestration engine for academic documents.
//!
//! This library provides:
//! - An in-memory task store with lifecycle invariants
//! - A bounded dispatch queue feeding a fixed worker pool
//! - The audit pipeline: parse, parallel rule/semantic audit, annotate, report
//! - A circuit breaker isolating the optional inference service
//! - A thin HTTP API for uploads, status, reports, and downloads
//!
//! ## Pipeline
//!
//! ```text
//!   upload ──► TaskStore ──► DispatchQueue ──► worker
//!                                                │
//!                                         ┌──────▼──────┐
//!                                         │   parser    │  parse
//!                                         └──────┬──────┘
//!                                    ┌───────────┴───────────┐
//!                             ┌──────▼──────┐        ┌───────▼───────┐
//!                             │ rule engine │        │  inference    │
//!                             │             │        │ (breaker)     │
//!                             └──────┬──────┘        └───────┬───────┘
//!                                    └───────────┬───────────┘
//!                                         ┌──────▼──────┐
//!                                         │  aggregate  │  dedup + score
//!                                         └──────┬──────┘
//!                                         ┌──────▼──────┐
//!                                         │   parser    │  annotate
//!                                         └──────┬──────┘
//!                                                ▼
//!                                         report + artifacts
//! ```
//!
//! A failed parse ends the task in an `Error:*` state. Either audit branch
//! may fail on its own; the task completes with whatever the other branch
//! found.
//!
//! ## Modules
//! - `task`: Task record, status, and store
//! - `services`: Service capabilities, HTTP clients, circuit breaker
//! - `audit`: Issue aggregation, scoring, report artifact
//! - `worker`: Per-task pipeline
//! - `queue`: Dispatch queue and worker pool
//! - `engine`: Submit/status/report/artifacts facade
//! - `api`: HTTP routes

pub mod api;
pub mod audit;
pub mod config;
pub mod engine;
pub mod queue;
pub mod services;
pub mod task;
pub mod worker;

pub use config::Config;
pub use engine::{AuditEngine, EngineError, ReportLookup};
pub use task::{Task, TaskId, TaskStatus};
