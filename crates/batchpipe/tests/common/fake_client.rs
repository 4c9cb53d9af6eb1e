//! Scripted in-memory inference client.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use batchpipe::inference::{EmbedRequest, GenerateRequest, InferenceClient, InferenceError};

/// Replies to `generate` from a script (falling back to a fixed text) and
/// embeds every text as a fixed-size vector.
pub struct ScriptedClient {
    generate_script: Mutex<VecDeque<Result<String, InferenceError>>>,
    default_text: String,
    dimensions: usize,
    delay: Duration,
    fail_embeds: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
    devices: Mutex<Vec<Option<u32>>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            generate_script: Mutex::new(VecDeque::new()),
            default_text: "Cordless drill, 18V, two batteries".to_string(),
            dimensions: 1024,
            delay: Duration::ZERO,
            fail_embeds: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// The next `n` embed calls fail with a transport error.
    pub fn failing_embeds(self, n: usize) -> Self {
        self.fail_embeds.store(n, Ordering::SeqCst);
        self
    }

    pub fn push_generate(&self, reply: Result<String, InferenceError>) {
        self.generate_script.lock().unwrap().push_back(reply);
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn devices_seen(&self) -> Vec<Option<u32>> {
        self.devices.lock().unwrap().clone()
    }

    async fn simulate(&self, device: Option<u32>) {
        self.devices.lock().unwrap().push(device);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn generate(&self, request: GenerateRequest) -> Result<String, InferenceError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate(request.device).await;
        let scripted = self.generate_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            if request.json {
                Ok(r#"{"product_name":"Drill","features":[],"citations":[]}"#.to_string())
            } else {
                Ok(self.default_text.clone())
            }
        })
    }

    async fn embed(&self, request: EmbedRequest) -> Result<Vec<f32>, InferenceError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate(request.device).await;
        let should_fail = self
            .fail_embeds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(InferenceError::Transport("connection refused".to_string()));
        }
        Ok(vec![0.1; self.dimensions])
    }
}
