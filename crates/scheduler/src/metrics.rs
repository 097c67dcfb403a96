use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cu::CuModel;

/// Per-CU counters.
#[derive(Debug, Clone, Serialize)]
pub struct CuUsage {
    pub index: usize,
    pub model: CuModel,
    pub base_addr: u64,
    /// Commands ever started on this CU.
    pub usage: u64,
    pub credits: u32,
    pub max_credits: u32,
    pub in_flight: usize,
    pub initialized: bool,
    pub valid: bool,
}

/// Snapshot of scheduler state published after every loop pass.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub device: String,
    pub configured: bool,
    pub polling: bool,
    /// Commands taken off the ingress queue.
    pub submitted: u64,
    pub completed: u64,
    pub errored: u64,
    pub aborted: u64,
    /// Commands that ran past their CU's run timeout.
    pub overruns: u64,
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub num_slots: usize,
    pub slots_in_use: usize,
    pub poll_count: usize,
    pub cus: Vec<CuUsage>,
    /// Mean submit-to-completion latency.
    pub avg_latency: Duration,
    pub last_completion: Option<DateTime<Utc>>,
    pub loop_passes: u64,
    pub failed: bool,
}

impl SchedulerMetrics {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            configured: false,
            polling: false,
            submitted: 0,
            completed: 0,
            errored: 0,
            aborted: 0,
            overruns: 0,
            pending: 0,
            queued: 0,
            running: 0,
            num_slots: 0,
            slots_in_use: 0,
            poll_count: 0,
            cus: Vec::new(),
            avg_latency: Duration::ZERO,
            last_completion: None,
            loop_passes: 0,
            failed: false,
        }
    }

    /// Record a completed command.
    pub fn record_completion(&mut self, latency: Duration) {
        self.completed += 1;
        self.last_completion = Some(Utc::now());

        // Incremental mean: new_avg = prev_avg + (latency - prev_avg) / count
        let count = self.completed;
        self.avg_latency = if count == 1 {
            latency
        } else {
            let prev_ns = self.avg_latency.as_nanos() as f64;
            let cur_ns = latency.as_nanos() as f64;
            let new_ns = prev_ns + (cur_ns - prev_ns) / count as f64;
            Duration::from_nanos(new_ns.max(0.0) as u64)
        };
    }

    /// Commands submitted but not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed + self.errored + self.aborted)
    }
}
