//! Register access seam between the scheduler and the device mapping.

use std::collections::HashMap;
use std::sync::Mutex;

/// 32-bit register access over a mapped device range.
///
/// Implementations must tolerate concurrent use: the scheduler thread
/// dispatches and polls while interrupt handlers acknowledge status.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, addr: u64) -> u32;
    fn write32(&self, addr: u64, value: u32);
}

/// Plain memory-backed register file. Unwritten registers read as zero.
///
/// Every write is also appended to a log so callers can assert on the exact
/// access sequence.
#[derive(Debug, Default)]
pub struct MemRegisters {
    regs: Mutex<HashMap<u64, u32>>,
    log: Mutex<Vec<(u64, u32)>>,
}

impl MemRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a register without recording it in the write log.
    pub fn poke(&self, addr: u64, value: u32) {
        if let Ok(mut regs) = self.regs.lock() {
            regs.insert(addr, value);
        }
    }

    pub fn writes(&self) -> Vec<(u64, u32)> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn clear_log(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }
}

impl RegisterIo for MemRegisters {
    fn read32(&self, addr: u64) -> u32 {
        self.regs
            .lock()
            .map(|regs| regs.get(&addr).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn write32(&self, addr: u64, value: u32) {
        self.poke(addr, value);
        if let Ok(mut log) = self.log.lock() {
            log.push((addr, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_reads_zero() {
        let regs = MemRegisters::new();
        assert_eq!(regs.read32(0x1000), 0);
    }

    #[test]
    fn test_write_is_logged_poke_is_not() {
        let regs = MemRegisters::new();
        regs.write32(0x10, 7);
        regs.poke(0x14, 9);
        assert_eq!(regs.read32(0x10), 7);
        assert_eq!(regs.read32(0x14), 9);
        assert_eq!(regs.writes(), vec![(0x10, 7)]);
        regs.clear_log();
        assert!(regs.writes().is_empty());
    }
}
