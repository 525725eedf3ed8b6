//! Command-line interface for crawl-forge.
//!
//! Provides commands for running the worker pool, managing the durable
//! queue, and one-shot rate-limited batches.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
