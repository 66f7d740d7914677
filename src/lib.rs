//! # Conversations Pipeline Library
//!
//! Idempotent operation processing for the conversations service: a durable
//! job queue, synchronous webhook processing with background retries, a
//! dead-letter queue with backoff-scheduled replay, and turn execution that is
//! applied at most once per operation id.

pub mod backoff;
pub mod config;
pub mod db;
pub mod dedupe_cache;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod models;
pub mod repositories;
pub mod scheduler;
pub mod telemetry;
pub mod turns;
pub mod webhook_processor;
pub mod worker;
pub use migration;

pub use error::PipelineError;
