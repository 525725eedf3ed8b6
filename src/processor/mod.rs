//! Job processors plugged into the worker pool and batch runner.

pub mod fetch;

pub use fetch::{FetchProcessor, DEFAULT_FETCH_TIMEOUT};
