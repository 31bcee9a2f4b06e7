use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Deserializer};

use crate::cache::DEFAULT_CACHE_FILE;
use crate::job::wait::DEFAULT_POLL_INTERVAL;

/// Parameters of the escalating retry loop.
///
/// Durations are written in humantime format (`15s`, `5m`, `2h 30m`) and memory as a
/// number of bytes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TenacityConfig {
    /// Delay between two status queries of a running job.
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    /// Walltime of the first attempt when neither the caller nor the cache provide one.
    #[serde(deserialize_with = "deserialize_duration")]
    pub default_walltime: Duration,
    /// Memory requested after an out-of-memory failure of a job without a memory limit.
    pub memory_floor: u64,
    /// Multiplier applied to the memory limit after an out-of-memory failure.
    pub memory_escalation: f64,
    /// Multiplier applied to the walltime after a timeout.
    pub walltime_escalation: f64,
    /// Multiplier applied to the observed resources before they are cached.
    pub safety_factor: f64,
    pub cache_path: PathBuf,
}

impl Default for TenacityConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_walltime: Duration::from_secs(5 * 60),
            memory_floor: ByteSize::gib(4).as_u64(),
            memory_escalation: 3.0,
            walltime_escalation: 3.0,
            safety_factor: 1.5,
            cache_path: PathBuf::from(DEFAULT_CACHE_FILE),
        }
    }
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let value = String::deserialize(deserializer)?;
    humantime::parse_duration(&value).map_err(serde::de::Error::custom)
}

impl TenacityConfig {
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        log::debug!("Loaded configuration from {}: {config:?}", path.display());
        Ok(config)
    }

    pub fn memory_floor(&self) -> ByteSize {
        ByteSize::b(self.memory_floor)
    }
}
