//! Trace file format for vkreplay: header, packets, per-call body layout and
//! the sequential packet stores that feed the replayer.

pub mod body;
pub mod diff;
pub mod entry;
pub mod error;
pub mod handle;
pub mod header;
pub mod packet;
pub mod store;
pub mod writer;

pub use body::{BodyPatch, Fields};
pub use entry::{EntryPoint, Field, FieldKind};
pub use error::{DecodeError, TraceError};
pub use handle::{ObjectKind, NULL_HANDLE};
pub use header::{GpuInfo, TraceHeader};
pub use packet::{Packet, PacketFlags, PacketHeader};
pub use store::{PacketSource, PreloadedStore, StorePosition, StreamStore, TraceStore};
pub use writer::{Arg, TraceWriter};
