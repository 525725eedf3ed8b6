//! Error types shared across crawl-forge subsystems.
//!
//! Subsystem-local errors (queue, pool, batch runner, configuration) live next
//! to the code that raises them. This module holds the ones that cross
//! module boundaries:
//! - On-disk JSON persistence
//! - Job processor collaborators
//! - Resource telemetry sources

use thiserror::Error;

/// Errors that can occur while persisting or loading JSON state files.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: &std::path::Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Errors returned by job processors.
///
/// The worker pool never propagates these; they are converted to a message
/// and recorded in the queue's failure registry.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Processor panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

impl ProcessorError {
    /// Creates a generic failure from any displayable message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Converts a caught panic payload into a `Panicked` error.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

/// Errors that can occur while sampling host resources.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Resource sampling failed: {0}")]
    SampleFailed(String),

    #[error("No disk found for path '{0}'")]
    DiskNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_storage_error_display_includes_path() {
        let err = StorageError::io(
            Path::new("/tmp/queue.json"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/queue.json"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_processor_error_display() {
        let err = ProcessorError::Status {
            url: "https://example.com/a".to_string(),
            status: 503,
        };
        assert!(err.to_string().contains("503"));

        let err = ProcessorError::failed("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_from_panic_payloads() {
        let err = ProcessorError::from_panic(Box::new("static message"));
        assert_eq!(err.to_string(), "Processor panicked: static message");

        let err = ProcessorError::from_panic(Box::new(String::from("owned message")));
        assert!(err.to_string().contains("owned message"));

        let err = ProcessorError::from_panic(Box::new(42_u32));
        assert!(err.to_string().contains("unknown panic payload"));
    }

    #[test]
    fn test_telemetry_error_display() {
        let err = TelemetryError::DiskNotFound("/data".to_string());
        assert!(err.to_string().contains("/data"));
    }
}
