//! HTTP fetch job processor.
//!
//! Downloads each job URL and stores the body under the output directory as
//! `<sha256(url)>.html`. Extraction of the page content is left to later
//! stages.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::ProcessorError;
use crate::scheduler::job::{JobOutput, JobProcessor};
use crate::storage::{sha256_hex, write_bytes_atomic};

/// Default per-request timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetches URLs and stores their bodies on disk.
#[derive(Debug, Clone)]
pub struct FetchProcessor {
    client: Client,
    output_dir: PathBuf,
}

impl FetchProcessor {
    /// Creates a processor writing into `output_dir` with the default timeout.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self::with_timeout(output_dir, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(output_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .user_agent(concat!("crawl-forge/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| Client::new()),
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path the body of `url` is stored at.
    pub fn output_path(&self, url: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.html", sha256_hex(url.as_bytes())))
    }

    /// Fetches `url` and stores the body.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::Http` on transport errors,
    /// `ProcessorError::Status` on a non-success status and
    /// `ProcessorError::Storage` if the body cannot be written.
    pub async fn fetch(&self, url: &str) -> Result<JobOutput, ProcessorError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProcessorError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let path = self.output_path(url);
        write_bytes_atomic(&path, &body).await?;

        debug!(url = %url, bytes = body.len(), path = %path.display(), "Stored page");

        Ok(serde_json::json!({
            "url": url,
            "status": status.as_u16(),
            "bytes": body.len(),
            "path": path.display().to_string(),
        }))
    }
}

#[async_trait]
impl JobProcessor for FetchProcessor {
    async fn process(&self, job_id: &str) -> Result<JobOutput, ProcessorError> {
        self.fetch(job_id).await
    }
}
