//! Per-destination media rendering
//!
//! A [`MediaRenderer`] turns one source file into one destination's variant
//! (optionally branded with the channel name). Renders are CPU heavy, so the
//! [`RenderPool`] admits at most `render.workers` of them at once, puts each
//! under the `render.timeout` deadline and collects results in completion
//! order. A render that misses the deadline is dropped, which stops its
//! process.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RenderError;
use crate::types::MediaKind;

pub mod ffmpeg;

// Mock renderer is available for all builds (not just tests) to support integration tests
pub mod mock;

/// One render request. The output path is owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub destination_id: String,
    /// Position of the source item within the post (0 for single media)
    pub item: usize,
    pub source: PathBuf,
    pub kind: MediaKind,
    /// Text to overlay; `None` re-encodes without branding
    pub branding: Option<String>,
    pub output: PathBuf,
}

impl RenderJob {
    /// Output file name unique per destination and item inside a run's scratch dir
    pub fn output_in(dir: &Path, destination_id: &str, item: usize, kind: MediaKind) -> PathBuf {
        let safe: String = destination_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        dir.join(format!("render-{}-{}.{}", safe, item, kind.extension()))
    }
}

/// Result of one job, tagged with what it was for
#[derive(Debug)]
pub struct RenderOutcome {
    pub destination_id: String,
    pub item: usize,
    pub result: std::result::Result<PathBuf, RenderError>,
}

/// Renderer driven by the pool.
///
/// Must never modify `job.source` and must release any temporary files of its
/// own, including when the future is dropped at the deadline.
#[async_trait]
pub trait MediaRenderer: Send + Sync {
    async fn render(&self, job: &RenderJob) -> std::result::Result<(), RenderError>;
}

#[derive(Clone)]
pub struct RenderPool {
    renderer: Arc<dyn MediaRenderer>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl RenderPool {
    pub fn new(renderer: Arc<dyn MediaRenderer>, workers: usize, timeout: Duration) -> Self {
        Self {
            renderer,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    /// Render one job. A failure is returned in the outcome, never raised.
    pub async fn render(&self, job: RenderJob) -> RenderOutcome {
        let destination_id = job.destination_id.clone();
        let item = job.item;
        let output = job.output.clone();

        let result = self.run(job).await;
        if result.is_err() {
            // Partial output from a failed render is never handed to the caller
            if let Err(e) = std::fs::remove_file(&output) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %output.display(), "Failed to remove partial render: {}", e);
                }
            }
        }

        RenderOutcome {
            destination_id,
            item,
            result,
        }
    }

    /// Render every job, yielding outcomes as they complete
    pub async fn render_all(&self, jobs: Vec<RenderJob>) -> Vec<RenderOutcome> {
        let mut pending: FuturesUnordered<_> =
            jobs.into_iter().map(|job| self.render(job)).collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some(outcome) = pending.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run(&self, job: RenderJob) -> std::result::Result<PathBuf, RenderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RenderError::PoolClosed)?;

        debug!(destination = %job.destination_id, item = job.item, "Render started");
        match timeout(self.timeout, self.renderer.render(&job)).await {
            Err(_) => Err(RenderError::Timeout(self.timeout.as_secs())),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Ok(job.output),
        }
    }
}
