use crate::compat::IndexSpace;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("{space} table for physical device {device:#x} has not been enumerated")]
    UnknownDevice { space: IndexSpace, device: u64 },

    #[error("trace {space} index {index} is outside the {len} entries recorded")]
    IndexOutOfRange {
        space: IndexSpace,
        index: u32,
        len: usize,
    },

    #[error("no replay {space} compatible with trace index {index} (flags {flags:#x})")]
    NoCompatibleIndex {
        space: IndexSpace,
        index: u32,
        flags: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
