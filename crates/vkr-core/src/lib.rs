pub mod compat;
pub mod config;
pub mod error;
pub mod handle_map;

pub use compat::{CompatTranslator, IndexSpace, Match, Resolution};
pub use config::{
    DeferPolicy, FrameSettings, MemorySettings, ReplayConfig, ReplaySettings, DEFAULT_CONFIG_PATH,
};
pub use error::{ConfigError, ResolveError};
pub use handle_map::{Lookup, ObjectMap};
