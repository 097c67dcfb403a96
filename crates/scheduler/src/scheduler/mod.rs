//! Scheduler loop -- the single thread that drives every command through
//! its state machine.
//!
//! Split into focused submodules:
//! - `core`: loop-owned state, the wait predicate and metrics publication
//! - `execution`: the pass over the command queue, control requests and teardown

mod core;
mod execution;

pub use self::core::Scheduler;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, PoisonError, RwLock};

use kds_core::SchedulerConfig;

use crate::command::CommandPool;
use crate::context::ContextRegistry;
use crate::cu::CuModel;
use crate::error::Result;
use crate::exec::ConfigureRequest;
use crate::ingress::{IngressQueue, Wakeup};
use crate::io::RegisterIo;
use crate::metrics::SchedulerMetrics;

/// Yield the CPU after this many consecutive passes.
pub(crate) const MAX_SCHED_LOOP: u64 = 8;

/// Requests that must run on the loop thread because they touch the
/// executor core.
#[derive(Debug)]
pub(crate) enum Control {
    Configure {
        request: ConfigureRequest,
        reply: Sender<Result<()>>,
    },
    ResetCu {
        cu: usize,
        reply: Sender<Result<()>>,
    },
    Reset {
        reply: Sender<Result<()>>,
    },
}

/// State visible to both the loop and submitting threads.
pub(crate) struct Shared {
    pub device: String,
    pub io: Arc<dyn RegisterIo>,
    pub ingress: IngressQueue,
    pub pool: CommandPool,
    pub contexts: ContextRegistry,
    /// Loop wakeups: submissions, interrupts, control requests, stop.
    pub wakeup: Arc<Wakeup>,
    /// Signalled whenever a command reaches a terminal state.
    pub completions: Wakeup,
    pub stop: AtomicBool,
    pub error: AtomicBool,
    /// Set by interrupt delivery, cleared by the loop before each pass.
    pub intc: AtomicBool,
    /// Control requests sent but not yet picked up.
    pub requests: AtomicUsize,
    /// Commands held by the loop (queued or running).
    pub active: AtomicUsize,
    pub metrics: RwLock<SchedulerMetrics>,
    /// Base address and model per configured CU, for interrupt acks.
    pub routes: RwLock<Vec<(u64, CuModel)>>,
}

impl Shared {
    pub fn new(config: &SchedulerConfig, io: Arc<dyn RegisterIo>) -> Self {
        let wakeup = Arc::new(Wakeup::new());
        Self {
            device: config.device_name.clone(),
            io,
            ingress: IngressQueue::new(Arc::clone(&wakeup)),
            pool: CommandPool::new(config.max_commands),
            contexts: ContextRegistry::new(),
            wakeup,
            completions: Wakeup::new(),
            stop: AtomicBool::new(false),
            error: AtomicBool::new(false),
            intc: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            metrics: RwLock::new(SchedulerMetrics::new(&config.device_name)),
            routes: RwLock::new(Vec::new()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Whether any command is pending, queued or running.
    pub fn is_busy(&self) -> bool {
        self.ingress.pending() > 0 || self.active.load(Ordering::Acquire) > 0
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn route(&self, cu: usize) -> Option<(u64, CuModel)> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cu)
            .copied()
    }
}
