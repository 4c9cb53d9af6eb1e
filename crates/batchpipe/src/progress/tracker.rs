//! Sliding-window throughput and ETA per space.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::broadcast::{ProgressBroadcaster, ProgressEvent, ProgressKind};
use crate::queue::{JobQueue, QueueError, SpaceProgress};

/// Completion timestamps inside a fixed look-back window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window: Duration,
    events: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.events.push_back(at);
        self.prune(at);
    }

    /// Drops events older than the window, relative to `now`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events per second over the whole window.
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.events.len() as f64 / secs
        }
    }
}

/// `pending / rate`, undefined while nothing completes.
pub fn eta_seconds(pending: u64, rate: f64) -> Option<f64> {
    (rate > 0.0).then(|| pending as f64 / rate)
}

/// Progress of a space combined with its current throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    #[serde(flatten)]
    pub progress: SpaceProgress,
    pub percent_complete: f64,
    pub is_finished: bool,
}

impl BatchStatus {
    pub fn from_progress(progress: SpaceProgress) -> Self {
        let finished = progress.finished();
        let percent_complete = if progress.total == 0 {
            0.0
        } else {
            (finished as f64 / progress.total as f64 * 100.0).min(100.0)
        };
        Self {
            is_finished: progress.total > 0 && finished >= progress.total,
            percent_complete,
            progress,
        }
    }
}

/// Tracks completion rate per space and publishes it to the store and to
/// subscribers.
pub struct ProgressTracker {
    queue: JobQueue,
    window: Duration,
    windows: Mutex<HashMap<String, SlidingWindow>>,
    broadcaster: ProgressBroadcaster,
}

impl ProgressTracker {
    pub fn new(queue: JobQueue, window: Duration, broadcaster: ProgressBroadcaster) -> Self {
        Self {
            queue,
            window,
            windows: Mutex::new(HashMap::new()),
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.broadcaster
    }

    /// Records a transition of `job_id` and refreshes the space's rate/ETA.
    ///
    /// Only completions enter the window; every kind refreshes the ETA since
    /// failures and cancellations also shrink `pending`.
    pub fn record(
        &self,
        space_id: &str,
        job_id: &str,
        kind: ProgressKind,
    ) -> Result<BatchStatus, QueueError> {
        let rate = self.observe(space_id, kind == ProgressKind::Completed);

        let mut progress = self.queue.get_progress(space_id)?;
        let eta = eta_seconds(progress.pending, rate);
        self.queue.update_rate(space_id, rate, eta)?;
        progress.rate_per_second = rate;
        progress.eta_seconds = eta;

        self.broadcaster.send(ProgressEvent {
            space_id: space_id.to_string(),
            job_id: job_id.to_string(),
            kind,
            total: progress.total,
            pending: progress.pending,
            processing: progress.processing,
            completed: progress.completed,
            failed: progress.failed,
            cancelled: progress.cancelled,
            rate_per_second: rate,
            eta_seconds: eta,
            timestamp: Utc::now(),
        });

        Ok(BatchStatus::from_progress(progress))
    }

    pub fn record_completion(
        &self,
        space_id: &str,
        job_id: &str,
    ) -> Result<BatchStatus, QueueError> {
        self.record(space_id, job_id, ProgressKind::Completed)
    }

    /// Completions per second observed by this process for `space_id`.
    pub fn rate(&self, space_id: &str) -> f64 {
        self.observe(space_id, false)
    }

    /// Batch status for `space_id`.
    ///
    /// Uses this process' window when it has seen the space, otherwise the
    /// rate last written to the store by whichever process did.
    pub fn batch_status(&self, space_id: &str) -> Result<BatchStatus, QueueError> {
        let mut progress = self.queue.get_progress(space_id)?;
        if let Some(rate) = self.local_rate(space_id) {
            progress.rate_per_second = rate;
            progress.eta_seconds = eta_seconds(progress.pending, rate);
        }
        Ok(BatchStatus::from_progress(progress))
    }

    fn observe(&self, space_id: &str, completed: bool) -> f64 {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = windows
            .entry(space_id.to_string())
            .or_insert_with(|| SlidingWindow::new(self.window));
        if completed {
            window.record(now);
        } else {
            window.prune(now);
        }
        window.rate()
    }

    fn local_rate(&self, space_id: &str) -> Option<f64> {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows.get_mut(space_id).map(|w| {
            w.prune(now);
            w.rate()
        })
    }
}
