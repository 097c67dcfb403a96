pub mod bitmap;
pub mod buffer;
pub mod command;
pub mod context;
pub mod cu;
pub mod device;
pub mod error;
pub mod exec;
pub mod ingress;
pub mod io;
pub mod layout;
pub mod metrics;
pub mod scheduler;
pub mod sim;

pub use bitmap::BitSet;
pub use buffer::{ExecBuffer, HostBuffer};
pub use command::{CommandHandle, CommandSnapshot, CommandState, CommandStatus};
pub use context::{ClaimKind, ClientContext, ContextId};
pub use cu::CuModel;
pub use device::{Device, SubmitRequest};
pub use error::{Result, SchedError};
pub use exec::ConfigureRequest;
pub use io::{MemRegisters, RegisterIo};
pub use layout::{BitstreamLayout, CuDescriptor, CuLayout, UniformLayout};
pub use metrics::{CuUsage, SchedulerMetrics};
pub use sim::{SimCuSpec, SimFabric};
