//! Accelerator adapter: fixed credit budget, polled completion counter.

use std::sync::Arc;

use crate::error::{Result, SchedError};
use crate::io::RegisterIo;

use super::regs::acc::{control, status, CONTROL, STATUS};
use super::{write_payload, ConfigureMode, CuCore, CuModel, IntrKind, TaskStatus};

/// Commands an ACC CU accepts before it must report completions.
pub const ACC_CREDITS: u32 = 16;

pub struct AccCore {
    io: Arc<dyn RegisterIo>,
    base: u64,
}

impl AccCore {
    pub fn new(io: Arc<dyn RegisterIo>, base: u64) -> Self {
        Self { io, base }
    }
}

impl CuCore for AccCore {
    fn model(&self) -> CuModel {
        CuModel::Acc
    }

    fn base_addr(&self) -> u64 {
        self.base
    }

    fn max_credits(&self) -> u32 {
        ACC_CREDITS
    }

    fn configure(&mut self, payload: &[u32], mode: ConfigureMode) {
        write_payload(self.io.as_ref(), self.base, payload, mode);
    }

    fn start(&mut self) {
        self.io.write32(self.base + CONTROL, control::START);
    }

    fn check(&mut self) -> TaskStatus {
        let done = self.io.read32(self.base + STATUS) & status::DONE_MASK;
        TaskStatus { done, ready: done }
    }

    fn reset(&mut self) {
        self.io.write32(self.base + CONTROL, control::RESET);
    }

    fn reset_done(&self) -> bool {
        self.io.read32(self.base + STATUS) & status::RESET_DONE != 0
    }

    fn enable_intr(&mut self, _kind: IntrKind) -> Result<()> {
        Err(SchedError::Unsupported("ACC CUs have no interrupt line".into()))
    }

    fn disable_intr(&mut self, _kind: IntrKind) -> Result<()> {
        Err(SchedError::Unsupported("ACC CUs have no interrupt line".into()))
    }

    fn clear_intr(&mut self) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemRegisters;

    #[test]
    fn test_fixed_credit_budget() {
        let io: Arc<dyn RegisterIo> = Arc::new(MemRegisters::new());
        assert_eq!(AccCore::new(io, 0x4000).max_credits(), 16);
    }

    #[test]
    fn test_check_reads_done_count() {
        let regs = Arc::new(MemRegisters::new());
        let io: Arc<dyn RegisterIo> = regs.clone();
        let mut core = AccCore::new(io, 0x4000);
        regs.poke(0x4000 + STATUS, 3);
        assert_eq!(core.check(), TaskStatus { done: 3, ready: 3 });
    }

    #[test]
    fn test_start_and_reset_write_control() {
        let regs = Arc::new(MemRegisters::new());
        let io: Arc<dyn RegisterIo> = regs.clone();
        let mut core = AccCore::new(io, 0x4000);
        core.start();
        core.reset();
        assert_eq!(
            regs.writes(),
            vec![(0x4000, control::START), (0x4000, control::RESET)]
        );
        regs.poke(0x4000 + STATUS, status::RESET_DONE);
        assert!(core.reset_done());
    }

    #[test]
    fn test_interrupts_unsupported() {
        let io: Arc<dyn RegisterIo> = Arc::new(MemRegisters::new());
        let mut core = AccCore::new(io, 0);
        assert!(matches!(
            core.enable_intr(IntrKind::Done),
            Err(SchedError::Unsupported(_))
        ));
        assert_eq!(core.clear_intr(), 0);
    }
}
