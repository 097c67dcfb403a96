use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use kds_core::SchedulerConfig;

use crate::command::{Command, CommandState};
use crate::exec::ExecCore;
use crate::io::RegisterIo;
use crate::layout::BitstreamLayout;
use crate::metrics::SchedulerMetrics;

use super::{Control, Shared};

/// The scheduler loop. Owns the executor core and every command between
/// ingress and retirement; nothing here is touched from another thread.
pub struct Scheduler {
    pub(super) shared: Arc<Shared>,
    pub(super) exec: ExecCore,
    /// Commands taken off ingress, in submission order.
    pub(super) queue: VecDeque<Box<Command>>,
    pub(super) control: Receiver<Control>,
    /// RUNNING commands that need polling.
    pub(super) poll: usize,
    pub(super) stats: SchedulerMetrics,
    pub(super) poll_interval: Duration,
    pub(super) shutdown_grace: Duration,
    pub(super) cu_reset_timeout: Duration,
}

impl Scheduler {
    pub(crate) fn new(
        config: &SchedulerConfig,
        shared: Arc<Shared>,
        layout: Arc<dyn BitstreamLayout>,
        control: Receiver<Control>,
    ) -> Self {
        let io: Arc<dyn RegisterIo> = Arc::clone(&shared.io);
        Self {
            exec: ExecCore::new(config, io, layout),
            stats: SchedulerMetrics::new(&config.device_name),
            shared,
            queue: VecDeque::new(),
            control,
            poll: 0,
            poll_interval: config.poll_interval(),
            shutdown_grace: config.shutdown_grace(),
            cu_reset_timeout: config.cu_reset_timeout(),
        }
    }

    pub fn exec(&self) -> &ExecCore {
        &self.exec
    }

    /// Commands currently held by the loop.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Sleep until there is something to do.
    ///
    /// With polled commands in flight the sleep is bounded by the poll
    /// interval; otherwise only a submission, interrupt, control request or
    /// stop wakes the loop.
    pub(super) fn wait(&self) {
        let shared = &self.shared;
        let idle = || {
            !(shared.stop.load(Ordering::Acquire)
                || shared.error.load(Ordering::Acquire)
                || shared.intc.load(Ordering::Acquire)
                || shared.ingress.pending() > 0
                || shared.requests.load(Ordering::Acquire) > 0)
        };

        if self.poll > 0 {
            if !self.poll_interval.is_zero() {
                shared.wakeup.wait_while(Some(self.poll_interval), idle);
            }
        } else {
            shared.wakeup.wait_while(None, idle);
        }
        shared.intc.store(false, Ordering::Release);
    }

    /// Commands other than the one at `skip` that are pending, queued or
    /// running.
    pub(super) fn outstanding_except(&self, skip: Option<usize>) -> usize {
        let held = self
            .queue
            .iter()
            .enumerate()
            .filter(|(i, cmd)| {
                Some(*i) != skip
                    && matches!(cmd.state, CommandState::Queued | CommandState::Running)
            })
            .count();
        self.shared.ingress.pending() + held
    }

    pub(super) fn publish_routes(&self) {
        *self
            .shared
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner) = self.exec.cu_routes();
    }

    /// Refresh the shared metrics snapshot and busy counters.
    pub(super) fn publish(&mut self) {
        let (mut queued, mut running) = (0, 0);
        for cmd in &self.queue {
            match cmd.state {
                CommandState::Queued => queued += 1,
                CommandState::Running => running += 1,
                _ => {}
            }
        }
        self.poll = if self.exec.polling() { running } else { 0 };

        let stats = &mut self.stats;
        stats.configured = self.exec.is_configured();
        stats.polling = self.exec.polling();
        stats.pending = self.shared.ingress.pending();
        stats.queued = queued;
        stats.running = running;
        stats.num_slots = self.exec.num_slots();
        stats.slots_in_use = self.exec.slots_in_use();
        stats.poll_count = self.poll;
        stats.cus = self.exec.cu_usage();
        stats.failed = self.shared.is_failed();

        *self
            .shared
            .metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner) = stats.clone();
        // Busy drops only once the snapshot above is visible.
        self.shared.active.store(self.queue.len(), Ordering::Release);
        self.shared.completions.notify();
    }
}
