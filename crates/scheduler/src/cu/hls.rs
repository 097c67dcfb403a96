//! HLS streaming control protocol.
//!
//! Version 0 cores hold exactly one command and signal completion only via
//! AP_DONE. The core stays blocked on its output handshake until AP_CONTINUE
//! is written, so every observed AP_DONE must be acknowledged before the next
//! AP_START can take effect.
//!
//! Version 1 and later cores queue several starts and report completions as
//! a clear-on-read done count packed into the control word.

use std::sync::Arc;

use crate::error::Result;
use crate::io::RegisterIo;

use super::regs::hls::{ctrl, intr, CTRL, GIE, IER, ISR};
use super::{write_payload, ConfigureMode, CuCore, CuModel, IntrKind, TaskStatus};

/// Conservative bound on commands queued in a multi-command HLS core.
///
/// The width of the hardware done counter has not been confirmed; staying at
/// 31 keeps the counter from wrapping between two polls.
pub const HLS_DONE_COUNTER_LIMIT: u32 = 31;

pub struct HlsCore {
    io: Arc<dyn RegisterIo>,
    base: u64,
    version: u32,
    max_credits: u32,
}

impl HlsCore {
    /// Read the control word once to learn protocol version and queue depth.
    pub fn probe(io: Arc<dyn RegisterIo>, base: u64) -> Self {
        let word = io.read32(base + CTRL);
        let version = (word >> ctrl::VERSION_SHIFT) & ctrl::NIBBLE_MASK;
        let max_credits = if version == 0 {
            1
        } else {
            let depth = 1u32 << ((word >> ctrl::CAPACITY_SHIFT) & ctrl::NIBBLE_MASK);
            depth.clamp(1, HLS_DONE_COUNTER_LIMIT)
        };
        Self {
            io,
            base,
            version,
            max_credits,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

/// Acknowledge an HLS interrupt: read ISR and write the same value back.
pub fn ack_interrupt(io: &dyn RegisterIo, base: u64) -> u32 {
    let status = io.read32(base + ISR);
    io.write32(base + ISR, status);
    status
}

fn intr_bit(kind: IntrKind) -> u32 {
    match kind {
        IntrKind::Done => intr::DONE,
        IntrKind::Ready => intr::READY,
    }
}

impl CuCore for HlsCore {
    fn model(&self) -> CuModel {
        CuModel::Hls
    }

    fn base_addr(&self) -> u64 {
        self.base
    }

    fn max_credits(&self) -> u32 {
        self.max_credits
    }

    fn configure(&mut self, payload: &[u32], mode: ConfigureMode) {
        write_payload(self.io.as_ref(), self.base, payload, mode);
    }

    fn start(&mut self) {
        self.io.write32(self.base + CTRL, ctrl::AP_START);
    }

    fn check(&mut self) -> TaskStatus {
        let word = self.io.read32(self.base + CTRL);
        if self.version == 0 {
            if word & ctrl::AP_DONE == 0 {
                return TaskStatus::default();
            }
            self.io.write32(self.base + CTRL, ctrl::AP_CONTINUE);
            return TaskStatus { done: 1, ready: 1 };
        }
        TaskStatus {
            done: (word >> ctrl::DONE_COUNT_SHIFT) & ctrl::COUNT_MASK,
            ready: (word >> ctrl::READY_COUNT_SHIFT) & ctrl::COUNT_MASK,
        }
    }

    fn reset(&mut self) {
        self.io.write32(self.base + CTRL, ctrl::AP_RESET);
    }

    fn reset_done(&self) -> bool {
        self.io.read32(self.base + CTRL) & ctrl::AP_RESET_DONE != 0
    }

    fn enable_intr(&mut self, kind: IntrKind) -> Result<()> {
        let enabled = self.io.read32(self.base + IER) | intr_bit(kind);
        self.io.write32(self.base + IER, enabled);
        self.io.write32(self.base + GIE, intr::GIE_ENABLE);
        Ok(())
    }

    fn disable_intr(&mut self, kind: IntrKind) -> Result<()> {
        let enabled = self.io.read32(self.base + IER) & !intr_bit(kind);
        self.io.write32(self.base + IER, enabled);
        if enabled == 0 {
            self.io.write32(self.base + GIE, 0);
        }
        Ok(())
    }

    fn clear_intr(&mut self) -> u32 {
        ack_interrupt(self.io.as_ref(), self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemRegisters;

    const BASE: u64 = 0x80_0000;

    fn core_with(word: u32) -> (Arc<MemRegisters>, HlsCore) {
        let regs = Arc::new(MemRegisters::new());
        regs.poke(BASE + CTRL, word);
        let io: Arc<dyn RegisterIo> = regs.clone();
        (regs, HlsCore::probe(io, BASE))
    }

    #[test]
    fn test_v0_single_credit() {
        let (_, core) = core_with(ctrl::AP_IDLE);
        assert_eq!(core.version(), 0);
        assert_eq!(core.max_credits(), 1);
    }

    #[test]
    fn test_v0_done_writes_continue() {
        let (regs, mut core) = core_with(0);
        assert_eq!(core.check(), TaskStatus::default());
        assert!(regs.writes().is_empty());

        regs.poke(BASE + CTRL, ctrl::AP_DONE | ctrl::AP_IDLE);
        assert_eq!(core.check(), TaskStatus { done: 1, ready: 1 });
        assert_eq!(regs.writes(), vec![(BASE + CTRL, ctrl::AP_CONTINUE)]);
    }

    #[test]
    fn test_v1_capacity_clamped_to_counter_limit() {
        let word = (1 << ctrl::VERSION_SHIFT) | (6 << ctrl::CAPACITY_SHIFT);
        let (_, core) = core_with(word);
        assert_eq!(core.version(), 1);
        assert_eq!(core.max_credits(), HLS_DONE_COUNTER_LIMIT);

        let word = (1 << ctrl::VERSION_SHIFT) | (2 << ctrl::CAPACITY_SHIFT);
        let (_, core) = core_with(word);
        assert_eq!(core.max_credits(), 4);
    }

    #[test]
    fn test_v1_check_unpacks_counters() {
        let (regs, mut core) = core_with((1 << ctrl::VERSION_SHIFT) | (3 << ctrl::CAPACITY_SHIFT));
        regs.poke(
            BASE + CTRL,
            (1 << ctrl::VERSION_SHIFT) | (3 << ctrl::DONE_COUNT_SHIFT) | (2 << ctrl::READY_COUNT_SHIFT),
        );
        assert_eq!(core.check(), TaskStatus { done: 3, ready: 2 });
        assert!(regs.writes().is_empty());
    }

    #[test]
    fn test_interrupt_enable_and_disable() {
        let (regs, mut core) = core_with(0);
        core.enable_intr(IntrKind::Done).unwrap();
        core.enable_intr(IntrKind::Ready).unwrap();
        assert_eq!(regs.read32(BASE + IER), intr::DONE | intr::READY);
        assert_eq!(regs.read32(BASE + GIE), intr::GIE_ENABLE);

        core.disable_intr(IntrKind::Done).unwrap();
        assert_eq!(regs.read32(BASE + GIE), intr::GIE_ENABLE);
        core.disable_intr(IntrKind::Ready).unwrap();
        assert_eq!(regs.read32(BASE + GIE), 0);
    }

    #[test]
    fn test_clear_intr_writes_back_status() {
        let (regs, mut core) = core_with(0);
        regs.poke(BASE + ISR, intr::DONE);
        assert_eq!(core.clear_intr(), intr::DONE);
        assert_eq!(regs.writes(), vec![(BASE + ISR, intr::DONE)]);
    }

    #[test]
    fn test_reset_handshake() {
        let (regs, mut core) = core_with(0);
        core.reset();
        assert_eq!(regs.writes(), vec![(BASE + CTRL, ctrl::AP_RESET)]);
        assert!(!core.reset_done());
        regs.poke(BASE + CTRL, ctrl::AP_RESET_DONE);
        assert!(core.reset_done());
    }
}
