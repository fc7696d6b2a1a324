#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt trace: {0}")]
    Corrupt(String),

    #[error("incompatible trace: {0}")]
    Incompatible(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("packet store cannot rewind")]
    RewindUnsupported,

    #[error("encode error: {0}")]
    Encode(String),
}

/// A packet body that does not match its entry point's layout.
/// Scoped to one packet; the stream itself stays readable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown packet id {0}")]
    UnknownPacket(u16),

    #[error("body too short: {len} bytes, layout needs {needed}")]
    BodyTooShort { len: usize, needed: usize },

    #[error("field `{field}` points outside the packet (offset {offset}, {count} elements)")]
    OutOfBounds {
        field: &'static str,
        offset: u64,
        count: u64,
    },

    #[error("malformed dirty-page diff: {0}")]
    BadDiff(&'static str),
}
