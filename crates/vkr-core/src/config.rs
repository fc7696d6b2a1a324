use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "vkreplay.toml";

/// Top-level replay configuration, loaded from vkreplay.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub replay: ReplaySettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub frames: FrameSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySettings {
    /// Translate queue-family and memory-type indices between devices
    #[serde(default = "default_true")]
    pub compatibility_mode: bool,
    /// Force every trace physical device onto this replay GPU
    pub physical_device_index: Option<u32>,
    /// Read the whole trace into memory before replaying
    #[serde(default)]
    pub preload: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySettings {
    /// When allocations take the pending (deferred) path
    #[serde(default)]
    pub defer_allocations: DeferPolicy,
    /// Accept dirty-page differential payloads on flush and unmap
    #[serde(default)]
    pub dirty_page_diff: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSettings {
    /// First frame of the looped range
    #[serde(default)]
    pub loop_start_frame: u64,
    /// Last frame of the looped range (inclusive)
    #[serde(default = "default_loop_end")]
    pub loop_end_frame: u64,
    /// How many times the range is replayed
    #[serde(default = "default_num_loops")]
    pub num_loops: u32,
}

/// Deferred-allocation policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeferPolicy {
    /// Always allocate immediately (default)
    #[default]
    Never,
    /// Defer when the memory type has no bit-identical replay counterpart
    Inexact,
    /// Defer every allocation until it is bound
    Always,
}

impl std::str::FromStr for DeferPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(DeferPolicy::Never),
            "inexact" => Ok(DeferPolicy::Inexact),
            "always" => Ok(DeferPolicy::Always),
            other => Err(ConfigError::Invalid(format!(
                "unknown defer policy `{other}` (expected never, inexact or always)"
            ))),
        }
    }
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            compatibility_mode: true,
            physical_device_index: None,
            preload: false,
        }
    }
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            loop_start_frame: 0,
            loop_end_frame: default_loop_end(),
            num_loops: default_num_loops(),
        }
    }
}

impl FrameSettings {
    /// Whether replay must return to the range start after the first pass.
    pub fn loops(&self) -> bool {
        self.num_loops > 1
    }
}

impl ReplayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ReplayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let frames = &self.frames;
        if frames.loop_start_frame > frames.loop_end_frame {
            return Err(ConfigError::Invalid(format!(
                "loop_start_frame {} is after loop_end_frame {}",
                frames.loop_start_frame, frames.loop_end_frame
            )));
        }
        if frames.num_loops == 0 {
            return Err(ConfigError::Invalid("num_loops must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_loop_end() -> u64 {
    u64::MAX
}

fn default_num_loops() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: ReplayConfig = toml::from_str("").unwrap();
        assert!(config.replay.compatibility_mode);
        assert_eq!(config.memory.defer_allocations, DeferPolicy::Never);
        assert_eq!(config.frames.loop_end_frame, u64::MAX);
        assert_eq!(config.frames.num_loops, 1);
    }

    #[test]
    fn test_sections_parse() {
        let config: ReplayConfig = toml::from_str(
            r#"
            [replay]
            compatibility_mode = false
            physical_device_index = 1

            [memory]
            defer_allocations = "inexact"
            dirty_page_diff = true

            [frames]
            loop_start_frame = 2
            loop_end_frame = 5
            num_loops = 3
            "#,
        )
        .unwrap();
        assert!(!config.replay.compatibility_mode);
        assert_eq!(config.replay.physical_device_index, Some(1));
        assert_eq!(config.memory.defer_allocations, DeferPolicy::Inexact);
        assert!(config.memory.dirty_page_diff);
        assert!(config.frames.loops());
        config.validate().unwrap();
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config = ReplayConfig::default();
        config.frames.loop_start_frame = 9;
        config.frames.loop_end_frame = 3;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_defer_policy_from_str() {
        assert_eq!("always".parse::<DeferPolicy>().unwrap(), DeferPolicy::Always);
        assert!("sometimes".parse::<DeferPolicy>().is_err());
    }
}
