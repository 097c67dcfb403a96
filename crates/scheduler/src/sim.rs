//! Behavioural model of a CU fabric behind [`RegisterIo`].
//!
//! Each simulated CU answers its control registers the way the hardware
//! protocol does (HLS version 0 and 1, ACC) and finishes jobs after a fixed
//! number of ticks. Any other address is plain storage, so register map
//! writes can be inspected afterwards.
//!
//! Time advances in two ways: every read of a CU's control or status
//! register ticks that CU once, and [`SimFabric::advance`] ticks every CU.
//! Polling therefore makes progress on its own; interrupt-driven runs need
//! something calling `advance`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cu::regs::{acc, hls};
use crate::cu::CuModel;
use crate::io::RegisterIo;
use crate::layout::{BitstreamLayout, CuDescriptor, CuLayout};

/// Address window decoded as belonging to one CU.
const CU_WINDOW: u64 = 0x1_0000;

fn default_latency() -> u32 {
    4
}

/// How one simulated CU behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimCuSpec {
    pub model: CuModel,
    /// HLS control protocol version.
    #[serde(default)]
    pub version: u32,
    /// log2 of the HLS start queue depth (version 1 and later).
    #[serde(default)]
    pub capacity_log2: u32,
    /// Ticks from start to completion.
    #[serde(default = "default_latency")]
    pub latency: u32,
}

impl SimCuSpec {
    pub fn hls(latency: u32) -> Self {
        Self {
            model: CuModel::Hls,
            version: 0,
            capacity_log2: 0,
            latency,
        }
    }

    pub fn hls_queued(capacity_log2: u32, latency: u32) -> Self {
        Self {
            model: CuModel::Hls,
            version: 1,
            capacity_log2,
            latency,
        }
    }

    pub fn acc(latency: u32) -> Self {
        Self {
            model: CuModel::Acc,
            version: 0,
            capacity_log2: 0,
            latency,
        }
    }
}

#[derive(Debug)]
struct SimCu {
    base: u64,
    spec: SimCuSpec,
    /// Remaining ticks per accepted start; only the head advances.
    jobs: VecDeque<u32>,
    done: u32,
    ready: u32,
    /// Version 0 only: AP_DONE raised, output blocked until AP_CONTINUE.
    awaiting_continue: bool,
    reset_done: bool,
    hung: bool,
    gie: bool,
    ier: u32,
    isr: u32,
    started: u64,
    completed: u64,
}

impl SimCu {
    fn new(base: u64, spec: SimCuSpec) -> Self {
        Self {
            base,
            spec,
            jobs: VecDeque::new(),
            done: 0,
            ready: 0,
            awaiting_continue: false,
            reset_done: false,
            hung: false,
            gie: false,
            ier: 0,
            isr: 0,
            started: 0,
            completed: 0,
        }
    }

    fn is_hls_v0(&self) -> bool {
        self.spec.model == CuModel::Hls && self.spec.version == 0
    }

    fn capacity(&self) -> usize {
        match self.spec.model {
            CuModel::Hls if self.spec.version == 0 => 1,
            CuModel::Hls => 1 << self.spec.capacity_log2.min(8),
            CuModel::Acc => usize::MAX,
        }
    }

    fn start(&mut self) {
        let occupied = self.jobs.len() + usize::from(self.awaiting_continue);
        if occupied >= self.capacity() {
            trace!(base = self.base, "start ignored, CU queue full");
            return;
        }
        self.jobs.push_back(self.spec.latency.max(1));
        self.started += 1;
        self.reset_done = false;
    }

    /// Advance one tick. Returns true when a completion should raise an
    /// interrupt.
    fn tick(&mut self) -> bool {
        if self.hung || self.awaiting_continue {
            return false;
        }
        let Some(head) = self.jobs.front_mut() else {
            return false;
        };
        *head = head.saturating_sub(1);
        if *head > 0 {
            return false;
        }
        self.jobs.pop_front();
        self.completed += 1;
        self.done = self.done.saturating_add(1);
        self.ready = self.ready.saturating_add(1);
        self.awaiting_continue = self.is_hls_v0();
        trace!(base = self.base, completed = self.completed, "job finished");

        if self.spec.model == CuModel::Hls && self.ier & hls::intr::DONE != 0 {
            self.isr |= hls::intr::DONE;
            return self.gie;
        }
        false
    }

    fn reset(&mut self) {
        self.jobs.clear();
        self.done = 0;
        self.ready = 0;
        self.awaiting_continue = false;
        self.isr = 0;
        self.reset_done = !self.hung;
    }

    fn read(&mut self, offset: u64, raise: &mut bool) -> Option<u32> {
        match (self.spec.model, offset) {
            (CuModel::Hls, hls::CTRL) => {
                *raise |= self.tick();
                Some(self.hls_ctrl_word())
            }
            (CuModel::Hls, hls::GIE) => Some(u32::from(self.gie)),
            (CuModel::Hls, hls::IER) => Some(self.ier),
            (CuModel::Hls, hls::ISR) => Some(self.isr),
            (CuModel::Acc, acc::CONTROL) => Some(if self.jobs.is_empty() {
                0
            } else {
                acc::control::START
            }),
            (CuModel::Acc, acc::STATUS) => {
                *raise |= self.tick();
                let mut word = self.done.min(acc::status::DONE_MASK);
                if self.reset_done {
                    word |= acc::status::RESET_DONE;
                }
                self.done = 0;
                self.ready = 0;
                Some(word)
            }
            _ => None,
        }
    }

    fn hls_ctrl_word(&mut self) -> u32 {
        use crate::cu::regs::hls::ctrl;
        let mut word = 0;
        if self.jobs.is_empty() && !self.awaiting_continue {
            word |= ctrl::AP_IDLE;
        }
        if !self.jobs.is_empty() {
            word |= ctrl::AP_START;
        }
        if self.reset_done {
            word |= ctrl::AP_RESET_DONE;
        }
        if self.spec.version == 0 {
            if self.awaiting_continue {
                word |= ctrl::AP_DONE;
            }
            return word;
        }
        word |= (self.spec.version & ctrl::NIBBLE_MASK) << ctrl::VERSION_SHIFT;
        word |= (self.spec.capacity_log2 & ctrl::NIBBLE_MASK) << ctrl::CAPACITY_SHIFT;
        word |= self.done.min(ctrl::COUNT_MASK) << ctrl::DONE_COUNT_SHIFT;
        word |= self.ready.min(ctrl::COUNT_MASK) << ctrl::READY_COUNT_SHIFT;
        self.done = 0;
        self.ready = 0;
        word
    }

    fn write(&mut self, offset: u64, value: u32) -> bool {
        match (self.spec.model, offset) {
            (CuModel::Hls, hls::CTRL) => {
                if value & hls::ctrl::AP_RESET != 0 {
                    self.reset();
                }
                if value & hls::ctrl::AP_CONTINUE != 0 {
                    self.awaiting_continue = false;
                }
                if value & hls::ctrl::AP_START != 0 {
                    self.start();
                }
                true
            }
            (CuModel::Hls, hls::GIE) => {
                self.gie = value & hls::intr::GIE_ENABLE != 0;
                true
            }
            (CuModel::Hls, hls::IER) => {
                self.ier = value;
                true
            }
            (CuModel::Hls, hls::ISR) => {
                self.isr ^= value;
                true
            }
            (CuModel::Acc, acc::CONTROL) => {
                if value & acc::control::RESET != 0 {
                    self.reset();
                }
                if value & acc::control::START != 0 {
                    self.start();
                }
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct FabricState {
    cus: Vec<SimCu>,
    memory: HashMap<u64, u32>,
}

impl FabricState {
    fn decode(&self, addr: u64) -> Option<(usize, u64)> {
        self.cus
            .iter()
            .position(|cu| addr >= cu.base && addr < cu.base + CU_WINDOW)
            .map(|idx| (idx, addr - self.cus[idx].base))
    }
}

type IrqHandler = Box<dyn Fn(usize) + Send + Sync>;

/// A fabric of simulated CUs.
#[derive(Default)]
pub struct SimFabric {
    state: Mutex<FabricState>,
    irq: Mutex<Option<IrqHandler>>,
}

impl std::fmt::Debug for SimFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimFabric")
            .field("cus", &self.lock().cus.len())
            .finish()
    }
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// CUs at `base + (i << shift)`, one per spec.
    pub fn strided(base: u64, shift: u32, specs: &[SimCuSpec]) -> Self {
        let fabric = Self::new();
        for (i, spec) in specs.iter().enumerate() {
            fabric.add_cu(base + ((i as u64) << shift), *spec);
        }
        fabric
    }

    /// Add a CU and return its index in the fabric.
    pub fn add_cu(&self, base: u64, spec: SimCuSpec) -> usize {
        let mut state = self.lock();
        state.cus.push(SimCu::new(base, spec));
        state.cus.len() - 1
    }

    /// Layout describing the fabric, for the scheduler's address lookup.
    pub fn layout(&self) -> CuLayout {
        CuLayout::new(
            self.lock()
                .cus
                .iter()
                .map(|cu| CuDescriptor {
                    addr: cu.base,
                    model: cu.spec.model,
                })
                .collect(),
        )
    }

    /// Install the handler called, outside any fabric lock, with the CU
    /// index whenever an enabled completion interrupt fires.
    pub fn on_interrupt(&self, handler: impl Fn(usize) + Send + Sync + 'static) {
        *self.irq.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(handler));
    }

    /// Tick every CU `ticks` times. Returns how many jobs finished.
    pub fn advance(&self, ticks: u32) -> u64 {
        let mut raised = Vec::new();
        let finished = {
            let mut state = self.lock();
            let before: u64 = state.cus.iter().map(|cu| cu.completed).sum();
            for _ in 0..ticks {
                for (idx, cu) in state.cus.iter_mut().enumerate() {
                    if cu.tick() {
                        raised.push(idx);
                    }
                }
            }
            state.cus.iter().map(|cu| cu.completed).sum::<u64>() - before
        };
        self.raise(raised);
        finished
    }

    /// Finish the running job on `cu` immediately. Returns false when the
    /// CU has nothing that can finish.
    pub fn complete(&self, cu: usize) -> bool {
        let (finished, raise) = {
            let mut state = self.lock();
            let Some(sim) = state.cus.get_mut(cu) else {
                return false;
            };
            let before = sim.completed;
            if let Some(head) = sim.jobs.front_mut() {
                *head = 1;
            }
            let raise = sim.tick();
            (sim.completed > before, raise)
        };
        if raise {
            self.raise(vec![cu]);
        }
        finished
    }

    /// A hung CU stops finishing jobs and never acknowledges a reset.
    pub fn set_hung(&self, cu: usize, hung: bool) {
        if let Some(sim) = self.lock().cus.get_mut(cu) {
            sim.hung = hung;
        }
    }

    pub fn jobs_started(&self, cu: usize) -> u64 {
        self.lock().cus.get(cu).map_or(0, |sim| sim.started)
    }

    pub fn jobs_completed(&self, cu: usize) -> u64 {
        self.lock().cus.get(cu).map_or(0, |sim| sim.completed)
    }

    /// Jobs accepted by `cu` and not yet finished.
    pub fn jobs_pending(&self, cu: usize) -> usize {
        self.lock().cus.get(cu).map_or(0, |sim| sim.jobs.len())
    }

    /// Read plain storage without touching any CU state.
    pub fn peek(&self, addr: u64) -> u32 {
        self.lock().memory.get(&addr).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn raise(&self, cus: Vec<usize>) {
        if cus.is_empty() {
            return;
        }
        let irq = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = irq.as_ref() {
            for cu in cus {
                trace!(cu, "raising interrupt");
                handler(cu);
            }
        }
    }
}

impl RegisterIo for SimFabric {
    fn read32(&self, addr: u64) -> u32 {
        let mut raise = false;
        let (value, cu) = {
            let mut state = self.lock();
            match state.decode(addr) {
                Some((idx, offset)) => match state.cus[idx].read(offset, &mut raise) {
                    Some(value) => (value, Some(idx)),
                    None => (state.memory.get(&addr).copied().unwrap_or(0), None),
                },
                None => (state.memory.get(&addr).copied().unwrap_or(0), None),
            }
        };
        if let (true, Some(idx)) = (raise, cu) {
            self.raise(vec![idx]);
        }
        value
    }

    fn write32(&self, addr: u64, value: u32) {
        let mut state = self.lock();
        if let Some((idx, offset)) = state.decode(addr) {
            if state.cus[idx].write(offset, value) {
                return;
            }
        }
        state.memory.insert(addr, value);
    }
}

impl BitstreamLayout for SimFabric {
    fn cu_model(&self, addr: u64) -> Option<CuModel> {
        self.lock()
            .cus
            .iter()
            .find(|cu| cu.base == addr)
            .map(|cu| cu.spec.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const BASE: u64 = 0x80_0000;

    #[test]
    fn test_v0_done_until_continue() {
        let fabric = SimFabric::strided(BASE, 16, &[SimCuSpec::hls(2)]);
        fabric.write32(BASE, hls::ctrl::AP_START);
        assert_eq!(fabric.read32(BASE) & hls::ctrl::AP_DONE, 0);
        let word = fabric.read32(BASE);
        assert_ne!(word & hls::ctrl::AP_DONE, 0);
        // Still blocked on the output handshake.
        assert_ne!(fabric.read32(BASE) & hls::ctrl::AP_DONE, 0);
        fabric.write32(BASE, hls::ctrl::AP_CONTINUE);
        assert_ne!(fabric.read32(BASE) & hls::ctrl::AP_IDLE, 0);
        assert_eq!(fabric.jobs_completed(0), 1);
    }

    #[test]
    fn test_v1_counts_clear_on_read() {
        let fabric = SimFabric::strided(BASE, 16, &[SimCuSpec::hls_queued(2, 1)]);
        for _ in 0..3 {
            fabric.write32(BASE, hls::ctrl::AP_START);
        }
        assert_eq!(fabric.jobs_pending(0), 3);
        assert_eq!(fabric.advance(3), 3);
        let word = fabric.read32(BASE);
        assert_eq!((word >> hls::ctrl::VERSION_SHIFT) & 0xF, 1);
        assert_eq!((word >> hls::ctrl::CAPACITY_SHIFT) & 0xF, 2);
        assert_eq!((word >> hls::ctrl::DONE_COUNT_SHIFT) & 0xFF, 3);
        let again = fabric.read32(BASE);
        assert_eq!((again >> hls::ctrl::DONE_COUNT_SHIFT) & 0xFF, 0);
    }

    #[test]
    fn test_acc_status_and_reset() {
        let fabric = SimFabric::strided(BASE, 16, &[SimCuSpec::acc(10)]);
        fabric.write32(BASE + acc::CONTROL, acc::control::START);
        assert!(fabric.complete(0));
        assert_eq!(fabric.read32(BASE + acc::STATUS), 1);
        fabric.write32(BASE + acc::CONTROL, acc::control::RESET);
        assert_ne!(fabric.read32(BASE + acc::STATUS) & acc::status::RESET_DONE, 0);
    }

    #[test]
    fn test_hung_cu_never_acknowledges_reset() {
        let fabric = SimFabric::strided(BASE, 16, &[SimCuSpec::acc(1)]);
        fabric.set_hung(0, true);
        fabric.write32(BASE + acc::CONTROL, acc::control::RESET);
        assert_eq!(fabric.read32(BASE + acc::STATUS) & acc::status::RESET_DONE, 0);
    }

    #[test]
    fn test_interrupt_raised_when_enabled() {
        let fabric = Arc::new(SimFabric::strided(BASE, 16, &[SimCuSpec::hls(1)]));
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            fabric.on_interrupt(move |cu| {
                assert_eq!(cu, 0);
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        fabric.write32(BASE + hls::IER, hls::intr::DONE);
        fabric.write32(BASE + hls::GIE, hls::intr::GIE_ENABLE);
        fabric.write32(BASE, hls::ctrl::AP_START);
        fabric.advance(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(fabric.read32(BASE + hls::ISR), hls::intr::DONE);
        fabric.write32(BASE + hls::ISR, hls::intr::DONE);
        assert_eq!(fabric.read32(BASE + hls::ISR), 0);
    }

    #[test]
    fn test_regmap_writes_land_in_storage() {
        let fabric = SimFabric::strided(BASE, 16, &[SimCuSpec::hls(1)]);
        fabric.write32(BASE + 0x10, 0xCAFE);
        assert_eq!(fabric.peek(BASE + 0x10), 0xCAFE);
        assert_eq!(fabric.read32(BASE + 0x10), 0xCAFE);
        assert_eq!(fabric.layout().descriptors().len(), 1);
        assert_eq!(fabric.cu_model(BASE), Some(CuModel::Hls));
        assert_eq!(fabric.cu_model(BASE + 0x100), None);
    }
}
