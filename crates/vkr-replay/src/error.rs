use ash::vk;
use vkr_core::ResolveError;
use vkr_trace::{DecodeError, EntryPoint, ObjectKind, TraceError};

use crate::memory::MemoryError;

/// A failure scoped to one call. The call is skipped and replay continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("undecodable packet: {0}")]
    Decode(#[from] DecodeError),

    #[error("`{field}` refers to {kind:?} {handle:#x}, which does not exist on the replay side")]
    UnknownHandle {
        field: &'static str,
        kind: ObjectKind,
        handle: u64,
    },

    #[error("`{field}`: {source}")]
    Resolve {
        field: &'static str,
        #[source]
        source: ResolveError,
    },

    #[error("`{field}` has no owning device to translate indices against")]
    NoDeviceContext { field: &'static str },

    #[error("count mismatch: `{a}` has {a_len} entries, `{b}` has {b_len}")]
    CountMismatch {
        a: &'static str,
        a_len: usize,
        b: &'static str,
        b_len: usize,
    },

    #[error("memory {memory:#x}: {source}")]
    Memory {
        memory: u64,
        #[source]
        source: MemoryError,
    },

    #[error("physical device selection {index} is out of range ({available} available)")]
    NoSuchGpu { index: u32, available: usize },
}

/// Fatal errors. Replay stops and the process exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("{} failed, cannot continue replay: {reason}", entry.name())]
    Device { entry: EntryPoint, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to load the Vulkan loader: {0}")]
    Load(String),

    #[error("Vulkan call failed: {0:?}")]
    Vk(vk::Result),
}
