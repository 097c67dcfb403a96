//! CU register offsets and bit definitions, relative to each CU's base.

// ── HLS control protocol ──────────────────────────────────────

pub mod hls {
    /// Control word: handshake bits plus the packed counter fields.
    pub const CTRL: u64 = 0x00;
    /// Global interrupt enable.
    pub const GIE: u64 = 0x04;
    /// IP interrupt enable.
    pub const IER: u64 = 0x08;
    /// IP interrupt status. Toggle-on-write: write back the value read.
    pub const ISR: u64 = 0x0C;

    pub mod ctrl {
        pub const AP_START: u32 = 1 << 0;
        pub const AP_DONE: u32 = 1 << 1;
        pub const AP_IDLE: u32 = 1 << 2;
        pub const AP_READY: u32 = 1 << 3;
        pub const AP_CONTINUE: u32 = 1 << 4;
        pub const AP_RESET: u32 = 1 << 5;
        pub const AP_RESET_DONE: u32 = 1 << 6;

        pub const DONE_COUNT_SHIFT: u32 = 8;
        pub const READY_COUNT_SHIFT: u32 = 16;
        pub const COUNT_MASK: u32 = 0xFF;
        /// log2 of the CU's command queue depth.
        pub const CAPACITY_SHIFT: u32 = 24;
        pub const VERSION_SHIFT: u32 = 28;
        pub const NIBBLE_MASK: u32 = 0xF;
    }

    pub mod intr {
        pub const GIE_ENABLE: u32 = 1;
        pub const DONE: u32 = 1 << 0;
        pub const READY: u32 = 1 << 1;
    }
}

// ── ACC status protocol ───────────────────────────────────────

pub mod acc {
    pub const CONTROL: u64 = 0x00;
    /// Completions since last read in the low byte (clear-on-read).
    pub const STATUS: u64 = 0x04;

    pub mod control {
        pub const START: u32 = 1 << 0;
        pub const RESET: u32 = 1 << 1;
    }

    pub mod status {
        pub const DONE_MASK: u32 = 0xFF;
        pub const RESET_DONE: u32 = 1 << 31;
    }
}
