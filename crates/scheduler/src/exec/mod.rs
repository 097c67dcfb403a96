//! Executor core: per-device configuration plus slot and CU bookkeeping.
//!
//! Owned by the scheduler thread. Nothing here locks; every bitmap is
//! mutated only from the loop.

mod dispatch;

use std::sync::Arc;

use kds_core::config::{MAX_CUS, MAX_SLOTS};
use kds_core::{ConfigurePacket, DispatchMode, SchedulerConfig};
use tracing::{info, warn};

use crate::bitmap::{words_for, BitSet};
use crate::cu::{build_core, ComputeUnit, CuModel, IntrKind};
use crate::error::{Result, SchedError};
use crate::io::RegisterIo;
use crate::layout::BitstreamLayout;
use crate::metrics::CuUsage;

/// Low address bits a bitstream may use to tag CU handshake flavour.
const CU_ADDR_HANDSHAKE_MASK: u64 = 0xFF;

/// CUs beyond this count cannot all raise interrupts.
const MAX_INTR_CUS: usize = 32;

/// Parameters of a CONFIGURE operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureRequest {
    pub slot_size: u32,
    pub num_cus: usize,
    pub cu_shift: u32,
    pub cu_base_addr: u64,
    /// `None` keeps the device default.
    pub polling: Option<bool>,
    /// Caller asked for the embedded scheduler; logged and ignored.
    pub ert: bool,
    /// Explicit CU addresses; empty means `base + (i << shift)`.
    pub cu_addrs: Vec<u64>,
}

impl ConfigureRequest {
    pub fn new(slot_size: u32, num_cus: usize, cu_shift: u32, cu_base_addr: u64) -> Self {
        Self {
            slot_size,
            num_cus,
            cu_shift,
            cu_base_addr,
            polling: None,
            ert: false,
            cu_addrs: Vec::new(),
        }
    }

    pub fn with_polling(mut self, polling: bool) -> Self {
        self.polling = Some(polling);
        self
    }

    pub fn with_cu_addrs(mut self, addrs: Vec<u64>) -> Self {
        self.cu_addrs = addrs;
        self
    }

    /// Address of CU `idx`, with handshake flag bits stripped. `None` when
    /// the strided address does not fit in 64 bits.
    fn cu_addr(&self, idx: usize) -> Option<u64> {
        match self.cu_addrs.get(idx) {
            Some(addr) => Some(addr & !CU_ADDR_HANDSHAKE_MASK),
            None => 1u64
                .checked_shl(self.cu_shift)
                .and_then(|stride| stride.checked_mul(idx as u64))
                .and_then(|offset| self.cu_base_addr.checked_add(offset)),
        }
    }
}

impl From<&ConfigurePacket> for ConfigureRequest {
    fn from(packet: &ConfigurePacket) -> Self {
        Self {
            slot_size: packet.slot_size,
            num_cus: packet.num_cus as usize,
            cu_shift: packet.cu_shift,
            cu_base_addr: packet.cu_base_addr as u64,
            polling: Some(packet.features.polling),
            ert: packet.features.ert,
            cu_addrs: packet.cu_addrs.iter().map(|a| *a as u64).collect(),
        }
    }
}

pub struct ExecCore {
    io: Arc<dyn RegisterIo>,
    layout: Arc<dyn BitstreamLayout>,
    mode: DispatchMode,
    queue_space: u32,
    default_slots: usize,
    default_polling: bool,

    configured: bool,
    polling: bool,
    slot_size: u32,
    num_slots: usize,
    num_cus: usize,
    num_cu_masks: usize,
    cu_shift: u32,
    cu_base_addr: u64,

    slots: BitSet,
    cu_busy: BitSet,
    cu_init: BitSet,
    cu_valid: BitSet,
    cus: Vec<ComputeUnit>,
}

impl ExecCore {
    pub fn new(
        config: &SchedulerConfig,
        io: Arc<dyn RegisterIo>,
        layout: Arc<dyn BitstreamLayout>,
    ) -> Self {
        Self {
            io,
            layout,
            mode: config.mode,
            queue_space: config.queue_space,
            default_slots: config.default_slots,
            default_polling: config.polling,
            configured: false,
            polling: config.polling,
            slot_size: 0,
            num_slots: config.default_slots,
            num_cus: 0,
            num_cu_masks: 0,
            cu_shift: 0,
            cu_base_addr: 0,
            slots: BitSet::new(config.default_slots),
            cu_busy: BitSet::new(0),
            cu_init: BitSet::new(0),
            cu_valid: BitSet::new(0),
            cus: Vec::new(),
        }
    }

    // ── Configuration ─────────────────────────────────────────

    /// Apply a CONFIGURE. `outstanding` counts every other command that is
    /// pending, queued or running; any such command rejects the request and
    /// leaves the core untouched.
    pub fn configure(&mut self, req: &ConfigureRequest, outstanding: usize) -> Result<()> {
        if outstanding > 0 {
            return Err(SchedError::ConfigRejectedBusy { outstanding });
        }
        if self.configured {
            return Err(SchedError::ConfigAlreadyDone);
        }
        if self.mode == DispatchMode::Embedded {
            return Err(SchedError::Unsupported(
                "embedded scheduler dispatch is not available".into(),
            ));
        }
        if req.ert {
            info!("embedded scheduler requested by CONFIGURE, continuing with software dispatch");
        }
        if req.slot_size == 0 {
            return Err(SchedError::InvalidConfig("slot_size must be non-zero".into()));
        }
        let num_slots = (self.queue_space / req.slot_size) as usize;
        if num_slots == 0 || num_slots > MAX_SLOTS {
            return Err(SchedError::InvalidConfig(format!(
                "queue space {:#x} / slot size {} gives {num_slots} slots (1..={MAX_SLOTS})",
                self.queue_space, req.slot_size
            )));
        }
        if req.num_cus > MAX_CUS {
            return Err(SchedError::InvalidConfig(format!(
                "{} CUs exceeds the maximum of {MAX_CUS}",
                req.num_cus
            )));
        }

        if req.cu_shift >= u64::BITS {
            return Err(SchedError::InvalidConfig(format!(
                "cu_shift {} is wider than the address space",
                req.cu_shift
            )));
        }

        let mut cus = Vec::with_capacity(req.num_cus);
        for idx in 0..req.num_cus {
            let addr = req.cu_addr(idx).ok_or_else(|| {
                SchedError::InvalidConfig(format!(
                    "CU {idx} at {:#x} + ({idx} << {}) overflows the address space",
                    req.cu_base_addr, req.cu_shift
                ))
            })?;
            let model = self.layout.cu_model(addr).ok_or_else(|| {
                SchedError::InvalidConfig(format!("no CU at {addr:#x} in the loaded bitstream"))
            })?;
            cus.push(ComputeUnit::new(idx, build_core(model, Arc::clone(&self.io), addr)));
        }

        let mut polling = req.polling.unwrap_or(self.default_polling);
        if !polling && cus.iter().any(|cu| cu.model() == CuModel::Acc) {
            warn!("ACC CUs present, falling back to polling");
            polling = true;
        }
        if !polling && req.num_cus > MAX_INTR_CUS {
            warn!(num_cus = req.num_cus, "too many CUs for interrupts, falling back to polling");
            polling = true;
        }
        for cu in cus.iter_mut().filter(|cu| cu.model() == CuModel::Hls) {
            let toggled = if polling {
                cu.disable_intr(IntrKind::Done)
            } else {
                cu.enable_intr(IntrKind::Done)
            };
            if let Err(e) = toggled {
                warn!(cu = cu.index(), error = %e, "could not set CU interrupt state");
            }
        }

        self.configured = true;
        self.polling = polling;
        self.slot_size = req.slot_size;
        self.num_slots = num_slots;
        self.num_cus = req.num_cus;
        self.num_cu_masks = words_for(req.num_cus);
        self.cu_shift = req.cu_shift;
        self.cu_base_addr = req.cu_base_addr;
        self.slots = BitSet::new(num_slots);
        self.cu_busy = BitSet::new(req.num_cus);
        self.cu_init = BitSet::new(req.num_cus);
        self.cu_valid = BitSet::full(req.num_cus);
        self.cus = cus;

        let base = format!("{:#x}", req.cu_base_addr);
        info!(
            slot_size = req.slot_size,
            num_slots,
            num_cus = req.num_cus,
            cu_shift = req.cu_shift,
            cu_base_addr = %base,
            polling,
            "executor configured"
        );
        Ok(())
    }

    /// Drop the configuration so a new CONFIGURE can be accepted.
    pub fn reset(&mut self, outstanding: usize) -> Result<()> {
        if outstanding > 0 {
            return Err(SchedError::ConfigRejectedBusy { outstanding });
        }
        if !self.polling {
            for cu in &mut self.cus {
                if let Err(e) = cu.disable_intr(IntrKind::Done) {
                    warn!(cu = cu.index(), error = %e, "could not set CU interrupt state");
                }
            }
        }
        self.configured = false;
        self.polling = self.default_polling;
        self.slot_size = 0;
        self.num_slots = self.default_slots;
        self.num_cus = 0;
        self.num_cu_masks = 0;
        self.cu_shift = 0;
        self.cu_base_addr = 0;
        self.slots = BitSet::new(self.default_slots);
        self.cu_busy = BitSet::new(0);
        self.cu_init = BitSet::new(0);
        self.cu_valid = BitSet::new(0);
        self.cus.clear();
        info!("executor reset to unconfigured");
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn polling(&self) -> bool {
        self.polling
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    pub fn num_cus(&self) -> usize {
        self.num_cus
    }

    pub fn num_cu_masks(&self) -> usize {
        self.num_cu_masks
    }

    pub fn cu_shift(&self) -> u32 {
        self.cu_shift
    }

    pub fn cu_base_addr(&self) -> u64 {
        self.cu_base_addr
    }

    pub fn cu(&self, idx: usize) -> Option<&ComputeUnit> {
        self.cus.get(idx)
    }

    pub fn cu_busy(&self) -> &BitSet {
        &self.cu_busy
    }

    // ── Slots ─────────────────────────────────────────────────

    /// Lowest free slot, without claiming it.
    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.first_zero()
    }

    pub fn claim_slot(&mut self, idx: usize) {
        self.slots.set(idx);
    }

    pub fn release_slot(&mut self, idx: usize) {
        self.slots.clear(idx);
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.count_ones()
    }

    // ── CUs ───────────────────────────────────────────────────

    /// Whether `mask` names at least one usable CU.
    pub fn has_eligible(&self, mask: &BitSet) -> bool {
        !mask.and(&self.cu_valid).is_empty()
    }

    /// First-fit CU with credit among `mask`. Takes one credit and marks the
    /// CU busy when that was its last.
    pub fn acquire_cu(&mut self, mask: &BitSet) -> Option<usize> {
        let idx = mask.and(&self.cu_valid).and_not(&self.cu_busy).first_set()?;
        let cu = self.cus.get_mut(idx)?;
        if !cu.get_credit() {
            self.cu_busy.set(idx);
            return None;
        }
        if cu.credits() == 0 {
            self.cu_busy.set(idx);
        }
        Some(idx)
    }

    /// Refund one credit and clear the busy bit.
    pub fn release_cu(&mut self, idx: usize) {
        if let Some(cu) = self.cus.get_mut(idx) {
            cu.refund_credit(1);
            self.cu_busy.clear(idx);
        }
    }

    /// Base address and model of every configured CU, for interrupt routing.
    pub fn cu_routes(&self) -> Vec<(u64, CuModel)> {
        self.cus.iter().map(|cu| (cu.base_addr(), cu.model())).collect()
    }

    pub fn cu_usage(&self) -> Vec<CuUsage> {
        self.cus
            .iter()
            .map(|cu| CuUsage {
                index: cu.index(),
                model: cu.model(),
                base_addr: cu.base_addr(),
                usage: cu.usage(),
                credits: cu.credits(),
                max_credits: cu.max_credits(),
                in_flight: cu.in_flight(),
                initialized: self.cu_init.test(cu.index()),
                valid: self.cu_valid.test(cu.index()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests;
