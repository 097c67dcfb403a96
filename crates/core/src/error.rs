use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors raised while decoding a command packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: need {needed} words, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("packet count field {count} exceeds buffer of {len} words")]
    CountOverflow { count: usize, len: usize },

    #[error("packet carries opcode {found}, expected {expected}")]
    WrongOpcode { expected: u8, found: u8 },

    #[error("configure packet lists {listed} CU addresses for {num_cus} CUs")]
    CuListMismatch { listed: usize, num_cus: usize },
}
