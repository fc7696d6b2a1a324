pub mod ash_driver;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod frame;
pub mod memory;
pub mod null_driver;
pub mod remap;
pub mod replayer;

pub use ash_driver::AshDriver;
pub use context::ReplayContext;
pub use dispatch::{Dispatcher, Outcome};
pub use driver::{Call, DeviceIdentity, Invocation, MappedRange, MemoryRequirements, ReplayDriver};
pub use error::{CallError, DriverError, ReplayError};
pub use frame::{FrameAction, FrameController};
pub use memory::MemoryEmulator;
pub use null_driver::{DeviceProfile, ForeignHandle, NullDriver};
pub use replayer::{PacketObserver, ReplayStats, Replayer};
