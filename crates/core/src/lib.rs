pub mod config;
pub mod error;
pub mod packet;

pub use config::{DispatchMode, SchedulerConfig};
pub use error::*;
pub use packet::*;
