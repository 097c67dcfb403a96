//! Per-opcode submit/query steps of the command state machine.

use std::time::{Duration, Instant};

use kds_core::{
    ConfigurePacket, InitCuPacket, Opcode, REGMAP_CU_INDEX, REGMAP_DONE_US, REGMAP_START_US,
};
use tracing::{debug, warn};

use crate::bitmap::BitSet;
use crate::command::Command;
use crate::cu::ConfigureMode;
use crate::error::{Result, SchedError};

use super::{ConfigureRequest, ExecCore};

/// Low 32 bits of wall-clock microseconds, as written back into packets.
fn timestamp_us() -> u32 {
    chrono::Utc::now().timestamp_micros() as u32
}

fn micros(us: u32) -> Option<Duration> {
    (us > 0).then(|| Duration::from_micros(us as u64))
}

impl ExecCore {
    /// Try to move a QUEUED command to RUNNING.
    ///
    /// `Ok(false)` means resources are exhausted and the command stays
    /// queued. `Err(UnknownOpcode)` is fatal for the scheduler; any other
    /// error fails just this command.
    pub(crate) fn submit(&mut self, cmd: &mut Command, outstanding: usize) -> Result<bool> {
        match cmd.opcode {
            Opcode::Configure => {
                let packet = ConfigurePacket::decode(cmd.packet())?;
                self.configure(&ConfigureRequest::from(&packet), outstanding)?;
                // Nothing else is in flight, so the slot map is empty.
                let slot = self
                    .find_free_slot()
                    .ok_or_else(|| SchedError::InvalidConfig("no slot after configure".into()))?;
                self.claim_slot(slot);
                cmd.slot_idx = Some(slot);
                Ok(true)
            }
            Opcode::InitCu => {
                let Some(slot) = self.find_free_slot() else {
                    return Ok(false);
                };
                let packet = InitCuPacket::decode(cmd.packet())?;
                self.init_cus(&packet);
                self.claim_slot(slot);
                cmd.slot_idx = Some(slot);
                Ok(true)
            }
            Opcode::StartCu | Opcode::ExecWrite => self.start_cu(cmd),
            other => Err(SchedError::UnknownOpcode(other.raw())),
        }
    }

    fn start_cu(&mut self, cmd: &mut Command) -> Result<bool> {
        if !self.configured {
            return Err(SchedError::NotConfigured);
        }
        if !self.has_eligible(&cmd.cu_mask) {
            return Err(SchedError::InvalidCuMask);
        }
        let Some(slot) = self.find_free_slot() else {
            return Ok(false);
        };
        let Some(cu_idx) = self.acquire_cu(&cmd.cu_mask) else {
            return Ok(false);
        };
        self.claim_slot(slot);

        let mode = if cmd.opcode == Opcode::ExecWrite {
            ConfigureMode::Pairs
        } else {
            ConfigureMode::Consecutive
        };
        let cu = &mut self.cus[cu_idx];
        cu.configure(cmd.regmap(), mode);
        cmd.write_back(REGMAP_CU_INDEX, cu_idx as u32);
        cmd.write_back(REGMAP_START_US, timestamp_us());
        cu.start(cmd.index());

        cmd.cu_idx = Some(cu_idx);
        cmd.slot_idx = Some(slot);
        cmd.timeout = cu.run_timeout();
        cmd.started_at = Some(Instant::now());
        debug!(cmd = cmd.index(), cu = cu_idx, slot, "command dispatched");
        Ok(true)
    }

    /// Check a RUNNING command. Returns true once it has completed, with its
    /// slot and CU credit already returned.
    pub(crate) fn query(&mut self, cmd: &mut Command) -> bool {
        match cmd.opcode {
            Opcode::Configure | Opcode::InitCu => {
                self.release_command_slot(cmd);
                true
            }
            Opcode::StartCu | Opcode::ExecWrite => {
                let Some(cu_idx) = cmd.cu_idx else {
                    return false;
                };
                let Some(cu) = self.cus.get_mut(cu_idx) else {
                    return false;
                };
                if !cu.is_head(cmd.index()) || cu.retire_head().is_none() {
                    return false;
                }
                self.release_cu(cu_idx);
                self.release_command_slot(cmd);
                cmd.write_back(REGMAP_DONE_US, timestamp_us());
                debug!(cmd = cmd.index(), cu = cu_idx, "command completed");
                true
            }
            _ => false,
        }
    }

    /// Flag a RUNNING command that has exceeded its CU's run timeout.
    /// Returns true the first time the overrun is seen.
    pub(crate) fn check_overrun(&self, cmd: &mut Command) -> bool {
        if cmd.overdue {
            return false;
        }
        let (Some(timeout), Some(started)) = (cmd.timeout, cmd.started_at) else {
            return false;
        };
        if started.elapsed() <= timeout {
            return false;
        }
        cmd.overdue = true;
        cmd.publish();
        warn!(
            cmd = cmd.index(),
            cu = ?cmd.cu_idx,
            timeout_us = timeout.as_micros() as u64,
            "command exceeded CU run timeout"
        );
        true
    }

    pub(crate) fn release_command_slot(&mut self, cmd: &mut Command) {
        if let Some(slot) = cmd.slot_idx.take() {
            self.release_slot(slot);
        }
    }

    /// One-time initialisation of every CU named by the packet that is
    /// configured, idle and not yet initialised.
    fn init_cus(&mut self, packet: &InitCuPacket) {
        let mask = BitSet::from_words(&packet.cu_masks);
        for idx in mask.iter_ones() {
            if idx >= self.num_cus {
                break;
            }
            if self.cu_init.test(idx) {
                warn!(cu = idx, "CU already initialized, skipping");
                continue;
            }
            if self.cu_busy.test(idx) || self.cus[idx].in_flight() > 0 {
                warn!(cu = idx, "CU busy, skipping initialization");
                continue;
            }
            let cu = &mut self.cus[idx];
            cu.configure(&packet.regmap, ConfigureMode::Consecutive);
            cu.set_timeouts(micros(packet.run_timeout_us), micros(packet.reset_timeout_us));
            self.cu_init.set(idx);
            debug!(cu = idx, "CU initialized");
        }
    }

    /// Reset one CU. Commands running on it are abandoned and their pool
    /// indices returned; the caller fails them and frees their slots.
    ///
    /// A CU that does not acknowledge the reset within its timeout is taken
    /// out of service and reported as a hardware fault.
    pub(crate) fn reset_cu(
        &mut self,
        idx: usize,
        default_timeout: Duration,
    ) -> (Vec<u32>, Result<()>) {
        let Some(cu) = self.cus.get_mut(idx) else {
            return (
                Vec::new(),
                Err(SchedError::InvalidConfig(format!("no CU {idx}"))),
            );
        };
        let abandoned = cu.abandon_all();
        let timeout = cu.reset_timeout().unwrap_or(default_timeout);
        cu.reset();
        let deadline = Instant::now() + timeout;
        while !cu.reset_done() {
            if Instant::now() >= deadline {
                self.cu_valid.clear(idx);
                self.cu_busy.set(idx);
                return (
                    abandoned,
                    Err(SchedError::HardwareFault {
                        cu: idx,
                        reason: format!("reset not acknowledged within {timeout:?}"),
                    }),
                );
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        self.cu_busy.clear(idx);
        debug!(cu = idx, abandoned = abandoned.len(), "CU reset");
        (abandoned, Ok(()))
    }
}
