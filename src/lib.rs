//! crawl-forge: durable, self-tuning URL crawl engine.
//!
//! This library provides a file-backed job queue, an adaptive worker pool
//! that tunes its concurrency from job durations and host load, a resource
//! monitor that pauses work under critical pressure, and a rate-limited
//! batch runner.

// Core modules
pub mod batch;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod processor;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use control::ControlSurface;
pub use error::{ProcessorError, StorageError, TelemetryError};
