//! Mock renderer for testing
//!
//! Copies the source to the output path instead of encoding, fails or stalls
//! chosen destinations and records every job it saw.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RenderError;
use crate::render::{MediaRenderer, RenderJob};

#[derive(Clone, Default)]
pub struct MockRenderer {
    delay: Duration,
    delays: Arc<Mutex<HashMap<String, Duration>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    rendered: Arc<Mutex<Vec<RenderJob>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every render (simulates encoding time)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleep only for one destination's renders, replacing the common delay
    pub fn delay_destination(&self, destination_id: &str, delay: Duration) {
        lock(&self.delays).insert(destination_id.to_string(), delay);
    }

    pub fn fail_destination(&self, destination_id: &str) {
        lock(&self.failing).insert(destination_id.to_string());
    }

    /// Jobs that completed successfully
    pub fn rendered(&self) -> Vec<RenderJob> {
        lock(&self.rendered).clone()
    }

    /// Highest number of renders observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counts a render as running until dropped, even when cut off by a deadline
struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaRenderer for MockRenderer {
    async fn render(&self, job: &RenderJob) -> std::result::Result<(), RenderError> {
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = Running(&self.active);
        self.peak.fetch_max(running, Ordering::SeqCst);

        let delay = lock(&self.delays)
            .get(&job.destination_id)
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.failing).contains(&job.destination_id) {
            return Err(RenderError::Process(format!(
                "scripted failure for {}",
                job.destination_id
            )));
        }

        tokio::fs::copy(&job.source, &job.output).await?;
        lock(&self.rendered).push(job.clone());
        Ok(())
    }
}
