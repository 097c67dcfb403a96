//! Error types for the command scheduler.

use kds_core::{ConfigError, PacketError};

/// Scheduler errors.
///
/// "No free CU" and "no free slot" are not errors: the command stays queued
/// and is retried on the next pass.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("executor already configured")]
    ConfigAlreadyDone,

    #[error("cannot reconfigure: {outstanding} command(s) outstanding")]
    ConfigRejectedBusy { outstanding: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Fatal: the scheduler stops processing.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("out of memory allocating command record")]
    OutOfMemory,

    #[error("hardware fault on CU {cu}: {reason}")]
    HardwareFault { cu: usize, reason: String },

    #[error("malformed packet: {0}")]
    InvalidPacket(#[from] PacketError),

    #[error("no configured CU matches eligibility mask")]
    InvalidCuMask,

    #[error("CU {cu} already claimed by another context")]
    CuClaimConflict { cu: usize },

    #[error("unknown client context {0}")]
    UnknownContext(uuid::Uuid),

    #[error("executor not configured")]
    NotConfigured,

    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// Fatal: a loop pass panicked.
    #[error("scheduler loop panicked: {0}")]
    LoopPanicked(String),

    #[error("scheduler stopped after a fatal error")]
    SchedulerFailed,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchedError>;
