//! File-based persistent storage for scheduler state.
//!
//! Every state file (pending queue, completed set, failure registry,
//! checkpoints, resource history, fetched pages) is written with the same
//! discipline: serialize to a uniquely named sibling temp file, fsync it, then
//! rename over the destination. A crash mid-write leaves either the old file or the new
//! one, never a truncated mix.
//!
//! # Usage
//!
//! ```rust,ignore
//! use crawl_forge::storage::{read_json, write_json_atomic};
//!
//! write_json_atomic(&path, &vec!["https://example.com/a"]).await?;
//! let pending: Option<Vec<String>> = read_json(&path).await?;
//! ```

pub mod json_file;

pub use json_file::{read_json, sha256_hex, write_bytes_atomic, write_json_atomic};
