//! Compute-unit resource management.
//!
//! Each CU is driven through a [`CuCore`] adapter that hides its register
//! protocol. Two adapters exist:
//!
//! - [`HlsCore`]: HLS streaming control word with AP_* handshake bits.
//! - [`AccCore`]: accelerator adapter with a fixed credit budget and a
//!   clear-on-read completion counter.
//!
//! [`ComputeUnit`] wraps an adapter with the credit accounting and the FIFO
//! of commands the CU is currently executing.

pub mod acc;
pub mod hls;
pub mod regs;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kds_core::REGMAP_RESERVED_WORDS;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::RegisterIo;

pub use acc::AccCore;
pub use hls::HlsCore;

/// Register protocol spoken by a CU, as reported by the bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CuModel {
    Hls,
    Acc,
}

impl fmt::Display for CuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hls => write!(f, "hls"),
            Self::Acc => write!(f, "acc"),
        }
    }
}

/// How a register-map payload is laid onto the CU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureMode {
    /// Word `i` goes to `base + 4 * i`.
    Consecutive,
    /// `{offset, value}` pairs, offsets relative to base.
    Pairs,
}

/// Counts reported by one [`CuCore::check`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatus {
    pub done: u32,
    pub ready: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrKind {
    Done,
    Ready,
}

/// Register protocol adapter for one CU.
pub trait CuCore: Send {
    fn model(&self) -> CuModel;

    fn base_addr(&self) -> u64;

    /// Commands the CU can hold in flight.
    fn max_credits(&self) -> u32;

    fn configure(&mut self, payload: &[u32], mode: ConfigureMode);

    fn start(&mut self);

    /// Read completion state. Counts are consumed by the read.
    fn check(&mut self) -> TaskStatus;

    fn reset(&mut self);

    fn reset_done(&self) -> bool;

    fn enable_intr(&mut self, kind: IntrKind) -> Result<()>;

    fn disable_intr(&mut self, kind: IntrKind) -> Result<()>;

    /// Acknowledge pending interrupts, returning the status bits cleared.
    fn clear_intr(&mut self) -> u32;
}

/// Write a register map to a CU, skipping the reserved leading words.
pub fn write_payload(io: &dyn RegisterIo, base: u64, payload: &[u32], mode: ConfigureMode) {
    let body = payload.get(REGMAP_RESERVED_WORDS..).unwrap_or(&[]);
    match mode {
        ConfigureMode::Consecutive => {
            for (i, value) in body.iter().enumerate() {
                let word = (REGMAP_RESERVED_WORDS + i) as u64;
                io.write32(base + word * 4, *value);
            }
        }
        ConfigureMode::Pairs => {
            for pair in body.chunks_exact(2) {
                io.write32(base + pair[0] as u64, pair[1]);
            }
        }
    }
}

/// Build the adapter for a CU of the given model.
pub fn build_core(model: CuModel, io: Arc<dyn RegisterIo>, base_addr: u64) -> Box<dyn CuCore> {
    match model {
        CuModel::Hls => Box::new(HlsCore::probe(io, base_addr)),
        CuModel::Acc => Box::new(AccCore::new(io, base_addr)),
    }
}

/// A configured CU: adapter, credits and in-flight command FIFO.
pub struct ComputeUnit {
    index: usize,
    core: Box<dyn CuCore>,
    credits: u32,
    /// Pool indices of commands started on this CU, oldest first.
    running: VecDeque<u32>,
    /// Completions reported by hardware but not yet matched to a command.
    done_pending: u32,
    usage: u64,
    run_timeout: Option<Duration>,
    reset_timeout: Option<Duration>,
}

impl fmt::Debug for ComputeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeUnit")
            .field("index", &self.index)
            .field("model", &self.core.model())
            .field("base_addr", &format_args!("{:#x}", self.core.base_addr()))
            .field("credits", &self.credits)
            .field("running", &self.running.len())
            .finish()
    }
}

impl ComputeUnit {
    pub fn new(index: usize, core: Box<dyn CuCore>) -> Self {
        let credits = core.max_credits();
        Self {
            index,
            core,
            credits,
            running: VecDeque::new(),
            done_pending: 0,
            usage: 0,
            run_timeout: None,
            reset_timeout: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn model(&self) -> CuModel {
        self.core.model()
    }

    pub fn base_addr(&self) -> u64 {
        self.core.base_addr()
    }

    pub fn max_credits(&self) -> u32 {
        self.core.max_credits()
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    pub fn usage(&self) -> u64 {
        self.usage
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout
    }

    pub fn reset_timeout(&self) -> Option<Duration> {
        self.reset_timeout
    }

    pub fn set_timeouts(&mut self, run: Option<Duration>, reset: Option<Duration>) {
        self.run_timeout = run;
        self.reset_timeout = reset;
    }

    /// Take one credit. Returns false when none is left.
    pub fn get_credit(&mut self) -> bool {
        if self.credits == 0 {
            return false;
        }
        self.credits -= 1;
        true
    }

    /// Return `count` credits, never exceeding the CU's budget.
    pub fn refund_credit(&mut self, count: u32) {
        self.credits = self.credits.saturating_add(count).min(self.max_credits());
    }

    pub fn configure(&mut self, payload: &[u32], mode: ConfigureMode) {
        self.core.configure(payload, mode);
    }

    /// Start the CU on behalf of the command with pool index `record`.
    pub fn start(&mut self, record: u32) {
        self.core.start();
        self.running.push_back(record);
        self.usage += 1;
    }

    /// Whether `record` is the oldest command running on this CU.
    pub fn is_head(&self, record: u32) -> bool {
        self.running.front() == Some(&record)
    }

    /// Poll hardware and, if a completion is available, retire the head
    /// command and return its pool index. The caller refunds the credit.
    pub fn retire_head(&mut self) -> Option<u32> {
        if self.running.is_empty() {
            return None;
        }
        if self.done_pending == 0 {
            self.done_pending = self.core.check().done;
        }
        if self.done_pending == 0 {
            return None;
        }
        self.done_pending -= 1;
        self.running.pop_front()
    }

    /// Drop every in-flight command, returning their pool indices.
    pub fn abandon_all(&mut self) -> Vec<u32> {
        self.done_pending = 0;
        self.credits = self.max_credits();
        self.running.drain(..).collect()
    }

    pub fn reset(&mut self) {
        self.core.reset();
    }

    pub fn reset_done(&self) -> bool {
        self.core.reset_done()
    }

    pub fn enable_intr(&mut self, kind: IntrKind) -> Result<()> {
        self.core.enable_intr(kind)
    }

    pub fn disable_intr(&mut self, kind: IntrKind) -> Result<()> {
        self.core.disable_intr(kind)
    }

    pub fn clear_intr(&mut self) -> u32 {
        self.core.clear_intr()
    }
}
