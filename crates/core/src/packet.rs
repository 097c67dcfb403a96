//! Command packet layout shared by submitters and the scheduler.
//!
//! A packet is a slice of 32-bit words. Word 0 is the header:
//!
//! ```text
//!  31    28 27    23 22          12 11      4 3     0
//! +--------+--------+--------------+---------+-------+
//! |  type  | opcode |    count     | custom  | state |
//! +--------+--------+--------------+---------+-------+
//! ```
//!
//! `count` is the number of payload words following the header. For START_CU,
//! EXEC_WRITE and INIT_CU packets bits 11:10 of `custom` hold the number of
//! extra CU mask words that follow the first mask.
//!
//! The first [`REGMAP_RESERVED_WORDS`] words of a register map shadow the
//! CU's control and interrupt registers and are never written to hardware.
//! The scheduler reuses them to report the assigned CU and timestamps back to
//! the submitter.

use serde::{Deserialize, Serialize};

use crate::error::PacketError;

const STATE_MASK: u32 = 0xF;
const CUSTOM_SHIFT: u32 = 4;
const CUSTOM_MASK: u32 = 0xFF;
const EXTRA_MASKS_SHIFT: u32 = 10;
const EXTRA_MASKS_MASK: u32 = 0x3;
const COUNT_SHIFT: u32 = 12;
const COUNT_MASK: u32 = 0x7FF;
const OPCODE_SHIFT: u32 = 23;
const OPCODE_MASK: u32 = 0x1F;
const TYPE_SHIFT: u32 = 28;

/// Register-map words that mirror CU control/interrupt registers.
pub const REGMAP_RESERVED_WORDS: usize = 4;

/// Reserved regmap word receiving the assigned CU index.
pub const REGMAP_CU_INDEX: usize = 0;
/// Reserved regmap word receiving the dispatch timestamp (low 32 bits, µs).
pub const REGMAP_START_US: usize = 1;
/// Reserved regmap word receiving the completion timestamp (low 32 bits, µs).
pub const REGMAP_DONE_US: usize = 2;

/// Maximum CU mask words carried by one packet (1 + 3 extra).
pub const MAX_CU_MASK_WORDS: usize = 4;

/// Packet type used for command-queue packets.
pub const PACKET_TYPE_CU: u32 = 1;

// ── Opcodes ───────────────────────────────────────────────────

/// Command opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Start a CU with a consecutive register map (also START_KERNEL).
    StartCu,
    Configure,
    Exit,
    Abort,
    /// Start a CU with `{offset, value}` register pairs.
    ExecWrite,
    CuStat,
    StartCopyBo,
    SkConfig,
    SkStart,
    SkUnconfig,
    /// One-time CU initialisation.
    InitCu,
    Unknown(u8),
}

impl Opcode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::StartCu,
            2 => Self::Configure,
            3 => Self::Exit,
            4 => Self::Abort,
            5 => Self::ExecWrite,
            6 => Self::CuStat,
            7 => Self::StartCopyBo,
            8 => Self::SkConfig,
            9 => Self::SkStart,
            10 => Self::SkUnconfig,
            11 => Self::InitCu,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::StartCu => 0,
            Self::Configure => 2,
            Self::Exit => 3,
            Self::Abort => 4,
            Self::ExecWrite => 5,
            Self::CuStat => 6,
            Self::StartCopyBo => 7,
            Self::SkConfig => 8,
            Self::SkStart => 9,
            Self::SkUnconfig => 10,
            Self::InitCu => 11,
            Self::Unknown(raw) => raw,
        }
    }

    /// Word index of the first CU mask, for opcodes that carry masks.
    pub fn cu_mask_offset(self) -> Option<usize> {
        match self {
            Self::StartCu | Self::ExecWrite => Some(1),
            Self::InitCu => Some(3),
            _ => None,
        }
    }
}

/// Packet state as written back into the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketState {
    New = 1,
    Queued = 2,
    Running = 3,
    Completed = 4,
    Error = 5,
    Abort = 6,
}

impl PacketState {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::New,
            2 => Self::Queued,
            3 => Self::Running,
            4 => Self::Completed,
            5 => Self::Error,
            6 => Self::Abort,
            _ => return None,
        })
    }
}

// ── Header ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader(pub u32);

impl PacketHeader {
    pub fn new(opcode: Opcode, count: usize) -> Self {
        let word = (PacketState::New as u32)
            | ((count as u32 & COUNT_MASK) << COUNT_SHIFT)
            | ((opcode.raw() as u32 & OPCODE_MASK) << OPCODE_SHIFT)
            | (PACKET_TYPE_CU << TYPE_SHIFT);
        Self(word)
    }

    pub fn opcode(self) -> Opcode {
        Opcode::from_raw(((self.0 >> OPCODE_SHIFT) & OPCODE_MASK) as u8)
    }

    pub fn count(self) -> usize {
        ((self.0 >> COUNT_SHIFT) & COUNT_MASK) as usize
    }

    pub fn custom(self) -> u8 {
        ((self.0 >> CUSTOM_SHIFT) & CUSTOM_MASK) as u8
    }

    pub fn extra_cu_masks(self) -> usize {
        ((self.0 >> EXTRA_MASKS_SHIFT) & EXTRA_MASKS_MASK) as usize
    }

    pub fn with_extra_cu_masks(self, extra: usize) -> Self {
        let cleared = self.0 & !(EXTRA_MASKS_MASK << EXTRA_MASKS_SHIFT);
        Self(cleared | ((extra as u32 & EXTRA_MASKS_MASK) << EXTRA_MASKS_SHIFT))
    }

    pub fn state(self) -> Option<PacketState> {
        PacketState::from_raw((self.0 & STATE_MASK) as u8)
    }

    pub fn with_state(self, state: PacketState) -> Self {
        Self((self.0 & !STATE_MASK) | state as u32)
    }
}

/// Overwrite the state nibble of a packet in place.
pub fn set_packet_state(words: &mut [u32], state: PacketState) {
    if let Some(header) = words.first_mut() {
        *header = PacketHeader(*header).with_state(state).0;
    }
}

// ── Views ─────────────────────────────────────────────────────

/// Borrowed, validated view over a packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    words: &'a [u32],
    header: PacketHeader,
}

impl<'a> PacketView<'a> {
    pub fn parse(words: &'a [u32]) -> Result<Self, PacketError> {
        let first = *words.first().ok_or(PacketError::Truncated {
            needed: 1,
            actual: 0,
        })?;
        let header = PacketHeader(first);
        if header.count() + 1 > words.len() {
            return Err(PacketError::CountOverflow {
                count: header.count(),
                len: words.len(),
            });
        }
        let view = Self { words, header };
        if let Some(offset) = header.opcode().cu_mask_offset() {
            let needed = offset + 1 + header.extra_cu_masks();
            if header.count() + 1 < needed {
                return Err(PacketError::Truncated {
                    needed,
                    actual: header.count() + 1,
                });
            }
        }
        Ok(view)
    }

    pub fn header(&self) -> PacketHeader {
        self.header
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode()
    }

    /// Header plus payload, trimmed to `count`.
    pub fn words(&self) -> &'a [u32] {
        &self.words[..self.header.count() + 1]
    }

    /// CU mask words, empty for opcodes that carry none.
    pub fn cu_masks(&self) -> &'a [u32] {
        match self.opcode().cu_mask_offset() {
            Some(offset) => &self.words()[offset..offset + 1 + self.header.extra_cu_masks()],
            None => &[],
        }
    }

    /// Index of the first register-map word, for opcodes that carry one.
    pub fn regmap_offset(&self) -> Option<usize> {
        self.opcode()
            .cu_mask_offset()
            .map(|offset| offset + 1 + self.header.extra_cu_masks())
    }

    pub fn regmap(&self) -> &'a [u32] {
        match self.regmap_offset() {
            Some(offset) => &self.words()[offset..],
            None => &[],
        }
    }
}

// ── Builders ──────────────────────────────────────────────────

fn encode_masked(opcode: Opcode, prefix: &[u32], cu_masks: &[u32], regmap: &[u32]) -> Vec<u32> {
    let masks = if cu_masks.is_empty() { &[0][..] } else { cu_masks };
    let masks = &masks[..masks.len().min(MAX_CU_MASK_WORDS)];
    let count = prefix.len() + masks.len() + regmap.len();
    let header = PacketHeader::new(opcode, count).with_extra_cu_masks(masks.len() - 1);
    let mut words = Vec::with_capacity(count + 1);
    words.push(header.0);
    words.extend_from_slice(prefix);
    words.extend_from_slice(masks);
    words.extend_from_slice(regmap);
    words
}

/// Build a START_CU packet with a consecutive register map.
///
/// `regmap` includes the [`REGMAP_RESERVED_WORDS`] leading words.
pub fn encode_start_cu(cu_masks: &[u32], regmap: &[u32]) -> Vec<u32> {
    encode_masked(Opcode::StartCu, &[], cu_masks, regmap)
}

/// Build an EXEC_WRITE packet from `{offset, value}` pairs.
pub fn encode_exec_write(cu_masks: &[u32], pairs: &[(u32, u32)]) -> Vec<u32> {
    let mut regmap = vec![0; REGMAP_RESERVED_WORDS];
    for &(offset, value) in pairs {
        regmap.push(offset);
        regmap.push(value);
    }
    encode_masked(Opcode::ExecWrite, &[], cu_masks, &regmap)
}

/// Feature bits of a CONFIGURE packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFeatures {
    /// Request the embedded scheduler (logged and ignored).
    pub ert: bool,
    pub polling: bool,
}

const FEATURE_ERT: u32 = 1 << 0;
const FEATURE_POLLING: u32 = 1 << 1;

impl ConfigFeatures {
    fn from_word(word: u32) -> Self {
        Self {
            ert: word & FEATURE_ERT != 0,
            polling: word & FEATURE_POLLING != 0,
        }
    }

    fn to_word(self) -> u32 {
        let mut word = 0;
        if self.ert {
            word |= FEATURE_ERT;
        }
        if self.polling {
            word |= FEATURE_POLLING;
        }
        word
    }
}

/// Decoded CONFIGURE packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurePacket {
    pub slot_size: u32,
    pub num_cus: u32,
    pub cu_shift: u32,
    pub cu_base_addr: u32,
    pub features: ConfigFeatures,
    /// Per-CU addresses; low 8 bits may carry handshake flags.
    pub cu_addrs: Vec<u32>,
}

const CONFIGURE_FIXED_WORDS: usize = 5;

impl ConfigurePacket {
    pub fn decode(words: &[u32]) -> Result<Self, PacketError> {
        let view = PacketView::parse(words)?;
        if view.opcode() != Opcode::Configure {
            return Err(PacketError::WrongOpcode {
                expected: Opcode::Configure.raw(),
                found: view.opcode().raw(),
            });
        }
        let words = view.words();
        if words.len() < CONFIGURE_FIXED_WORDS + 1 {
            return Err(PacketError::Truncated {
                needed: CONFIGURE_FIXED_WORDS + 1,
                actual: words.len(),
            });
        }
        let num_cus = words[2];
        let listed = &words[CONFIGURE_FIXED_WORDS + 1..];
        if !listed.is_empty() && listed.len() < num_cus as usize {
            return Err(PacketError::CuListMismatch {
                listed: listed.len(),
                num_cus: num_cus as usize,
            });
        }
        Ok(Self {
            slot_size: words[1],
            num_cus,
            cu_shift: words[3],
            cu_base_addr: words[4],
            features: ConfigFeatures::from_word(words[5]),
            cu_addrs: listed.iter().take(num_cus as usize).copied().collect(),
        })
    }

    pub fn encode(&self) -> Vec<u32> {
        let count = CONFIGURE_FIXED_WORDS + self.cu_addrs.len();
        let mut words = Vec::with_capacity(count + 1);
        words.push(PacketHeader::new(Opcode::Configure, count).0);
        words.extend_from_slice(&[
            self.slot_size,
            self.num_cus,
            self.cu_shift,
            self.cu_base_addr,
            self.features.to_word(),
        ]);
        words.extend_from_slice(&self.cu_addrs);
        words
    }
}

/// Decoded INIT_CU packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCuPacket {
    /// Per-CU run budget in microseconds (0 = unlimited).
    pub run_timeout_us: u32,
    /// Per-CU reset acknowledge budget in microseconds (0 = device default).
    pub reset_timeout_us: u32,
    pub cu_masks: Vec<u32>,
    pub regmap: Vec<u32>,
}

impl InitCuPacket {
    pub fn decode(words: &[u32]) -> Result<Self, PacketError> {
        let view = PacketView::parse(words)?;
        if view.opcode() != Opcode::InitCu {
            return Err(PacketError::WrongOpcode {
                expected: Opcode::InitCu.raw(),
                found: view.opcode().raw(),
            });
        }
        let words = view.words();
        Ok(Self {
            run_timeout_us: words[1],
            reset_timeout_us: words[2],
            cu_masks: view.cu_masks().to_vec(),
            regmap: view.regmap().to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u32> {
        encode_masked(
            Opcode::InitCu,
            &[self.run_timeout_us, self.reset_timeout_us],
            &self.cu_masks,
            &self.regmap,
        )
    }
}
