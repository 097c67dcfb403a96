//! Command records and the status cells submitters observe them through.

pub mod pool;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kds_core::{set_packet_state, Opcode, PacketState, PacketView};
use serde::Serialize;

use crate::bitmap::BitSet;
use crate::buffer::ExecBuffer;
use crate::context::ContextId;

pub use pool::CommandPool;

/// Lifecycle of a command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandState {
    New,
    Queued,
    Running,
    Completed,
    Error,
    Aborted,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }

    fn to_packet(self) -> PacketState {
        match self {
            Self::New => PacketState::New,
            Self::Queued => PacketState::Queued,
            Self::Running => PacketState::Running,
            Self::Completed => PacketState::Completed,
            Self::Error => PacketState::Error,
            Self::Aborted => PacketState::Abort,
        }
    }

    fn to_raw(self) -> u64 {
        match self {
            Self::New => 0,
            Self::Queued => 1,
            Self::Running => 2,
            Self::Completed => 3,
            Self::Error => 4,
            Self::Aborted => 5,
        }
    }

    fn from_raw(raw: u64) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Completed,
            4 => Self::Error,
            _ => Self::Aborted,
        }
    }
}

/// Externally visible command status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl From<CommandState> for CommandStatus {
    fn from(state: CommandState) -> Self {
        match state {
            CommandState::New | CommandState::Queued => Self::Queued,
            CommandState::Running => Self::Running,
            CommandState::Completed => Self::Completed,
            CommandState::Error | CommandState::Aborted => Self::Error,
        }
    }
}

/// Point-in-time view of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandSnapshot {
    pub state: CommandState,
    pub cu: Option<usize>,
    pub slot: Option<usize>,
    /// Ran past its CU's run timeout.
    pub overdue: bool,
}

impl CommandSnapshot {
    pub fn status(&self) -> CommandStatus {
        self.state.into()
    }
}

const NONE_IDX: u64 = 0xFF;
const CU_SHIFT: u32 = 8;
const SLOT_SHIFT: u32 = 16;
const OVERDUE_BIT: u64 = 1 << 24;

/// Lock-free status word shared between a record and its submitter's handle.
///
/// Packs state, CU, slot and the overdue flag into one atomic so readers
/// always see a consistent snapshot.
#[derive(Debug, Default)]
pub struct StatusCell {
    word: AtomicU64,
}

impl StatusCell {
    fn publish(&self, snap: &CommandSnapshot) {
        let idx = |v: Option<usize>| v.map_or(NONE_IDX, |i| i as u64 & NONE_IDX);
        let mut word = snap.state.to_raw()
            | (idx(snap.cu) << CU_SHIFT)
            | (idx(snap.slot) << SLOT_SHIFT);
        if snap.overdue {
            word |= OVERDUE_BIT;
        }
        self.word.store(word, Ordering::Release);
    }

    fn load(&self) -> CommandSnapshot {
        let word = self.word.load(Ordering::Acquire);
        let idx = |shift: u32| match (word >> shift) & NONE_IDX {
            NONE_IDX => None,
            i => Some(i as usize),
        };
        CommandSnapshot {
            state: CommandState::from_raw(word & 0xFF),
            cu: idx(CU_SHIFT),
            slot: idx(SLOT_SHIFT),
            overdue: word & OVERDUE_BIT != 0,
        }
    }
}

/// Submitter's reference to one submission.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    index: u32,
    generation: u32,
    cell: Arc<StatusCell>,
}

impl CommandHandle {
    /// Pool index of the record carrying this submission.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Reuse count of the record at submission time.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn snapshot(&self) -> CommandSnapshot {
        self.cell.load()
    }

    pub fn status(&self) -> CommandStatus {
        self.snapshot().status()
    }
}

/// Scheduler-side command record.
///
/// Records are recycled through [`CommandPool`]; `index` is stable across
/// reuse and `generation` counts reuses.
pub struct Command {
    index: u32,
    generation: u32,
    cell: Arc<StatusCell>,
    pub(crate) opcode: Opcode,
    pub(crate) state: CommandState,
    pub(crate) cu_idx: Option<usize>,
    pub(crate) slot_idx: Option<usize>,
    pub(crate) cu_mask: BitSet,
    pub(crate) buffer: Option<Box<dyn ExecBuffer>>,
    pub(crate) context: Option<ContextId>,
    pub(crate) submitted_at: Option<Instant>,
    pub(crate) started_at: Option<Instant>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) overdue: bool,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("opcode", &self.opcode)
            .field("state", &self.state)
            .field("cu_idx", &self.cu_idx)
            .field("slot_idx", &self.slot_idx)
            .finish()
    }
}

impl Command {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            generation: 0,
            cell: Arc::new(StatusCell::default()),
            opcode: Opcode::StartCu,
            state: CommandState::New,
            cu_idx: None,
            slot_idx: None,
            cu_mask: BitSet::default(),
            buffer: None,
            context: None,
            submitted_at: None,
            started_at: None,
            timeout: None,
            overdue: false,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn handle(&self) -> CommandHandle {
        CommandHandle {
            index: self.index,
            generation: self.generation,
            cell: Arc::clone(&self.cell),
        }
    }

    /// Attach a buffer and its decoded routing information.
    pub(crate) fn load(
        &mut self,
        buffer: Box<dyn ExecBuffer>,
        opcode: Opcode,
        cu_mask: BitSet,
        context: Option<ContextId>,
    ) {
        self.buffer = Some(buffer);
        self.opcode = opcode;
        self.cu_mask = cu_mask;
        self.context = context;
        self.submitted_at = Some(Instant::now());
        self.set_state(CommandState::New);
    }

    /// Prepare a recycled record for its next submission.
    pub(crate) fn renew(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.cell = Arc::new(StatusCell::default());
        self.state = CommandState::New;
        self.cu_idx = None;
        self.slot_idx = None;
        self.cu_mask = BitSet::default();
        self.context = None;
        self.submitted_at = None;
        self.started_at = None;
        self.timeout = None;
        self.overdue = false;
    }

    pub(crate) fn set_state(&mut self, state: CommandState) {
        self.state = state;
        if let Some(buffer) = self.buffer.as_mut() {
            set_packet_state(buffer.words_mut(), state.to_packet());
        }
        self.publish();
    }

    pub(crate) fn publish(&self) {
        self.cell.publish(&CommandSnapshot {
            state: self.state,
            cu: self.cu_idx,
            slot: self.slot_idx,
            overdue: self.overdue,
        });
    }

    pub(crate) fn packet(&self) -> &[u32] {
        self.buffer.as_ref().map(|b| b.words()).unwrap_or(&[])
    }

    /// Register map (including reserved words), empty if the packet has none.
    pub(crate) fn regmap(&self) -> &[u32] {
        PacketView::parse(self.packet())
            .map(|view| view.regmap())
            .unwrap_or(&[])
    }

    /// Write into a reserved regmap word of the packet.
    pub(crate) fn write_back(&mut self, word: usize, value: u32) {
        let Some(offset) = PacketView::parse(self.packet())
            .ok()
            .and_then(|view| view.regmap_offset())
        else {
            return;
        };
        if let Some(buffer) = self.buffer.as_mut() {
            if let Some(slot) = buffer.words_mut().get_mut(offset + word) {
                *slot = value;
            }
        }
    }

    pub(crate) fn take_buffer(&mut self) -> Option<Box<dyn ExecBuffer>> {
        self.buffer.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HostBuffer;
    use kds_core::{encode_start_cu, PacketHeader, REGMAP_CU_INDEX};

    fn loaded() -> Command {
        let mut cmd = Command::new(3);
        let words = encode_start_cu(&[0b1], &[0, 0, 0, 0, 42]);
        cmd.load(Box::new(HostBuffer::new(words)), Opcode::StartCu, BitSet::from_words(&[1]), None);
        cmd
    }

    #[test]
    fn test_status_cell_round_trips_fields() {
        let cell = StatusCell::default();
        let snap = CommandSnapshot {
            state: CommandState::Running,
            cu: Some(127),
            slot: Some(0),
            overdue: true,
        };
        cell.publish(&snap);
        assert_eq!(cell.load(), snap);
    }

    #[test]
    fn test_state_change_visible_through_handle_and_packet() {
        let mut cmd = loaded();
        let handle = cmd.handle();
        assert_eq!(handle.status(), CommandStatus::Queued);

        cmd.cu_idx = Some(1);
        cmd.set_state(CommandState::Running);
        assert_eq!(handle.status(), CommandStatus::Running);
        assert_eq!(handle.snapshot().cu, Some(1));
        assert_eq!(PacketHeader(cmd.packet()[0]).state(), Some(PacketState::Running));
    }

    #[test]
    fn test_write_back_targets_reserved_words() {
        let mut cmd = loaded();
        cmd.write_back(REGMAP_CU_INDEX, 9);
        assert_eq!(cmd.regmap()[REGMAP_CU_INDEX], 9);
        assert_eq!(cmd.regmap()[4], 42);
    }

    #[test]
    fn test_renew_detaches_old_handle() {
        let mut cmd = loaded();
        let old = cmd.handle();
        cmd.set_state(CommandState::Error);
        cmd.renew();
        cmd.set_state(CommandState::Running);
        assert_eq!(old.status(), CommandStatus::Error);
        assert_eq!(cmd.handle().generation(), old.generation() + 1);
        assert_eq!(cmd.handle().index(), old.index());
    }
}
