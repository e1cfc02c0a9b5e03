use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{calc::UnitTable, Error, InternalResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Capacity of each broadcast channel on the event bus.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Wall-clock time one evaluation invocation may take before the
    /// worker yields back to the runtime.
    #[serde(default = "default_frame_budget", with = "duration_ms")]
    pub frame_budget: Duration,

    /// Upper bound on recalculation passes for a single section. A section
    /// whose assignments keep changing completes with its last results
    /// once this many passes have run.
    #[serde(default = "default_max_recalculation_passes")]
    pub max_recalculation_passes: u32,

    /// Unit conversion rates shared by every calculator instance.
    #[serde(default)]
    pub units: UnitTable,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            frame_budget: default_frame_budget(),
            max_recalculation_passes: default_max_recalculation_passes(),
            units: UnitTable::default(),
        }
    }
}

impl SchedulerConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file(path: &str) -> InternalResult<Self> {
        from_file(path)
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Internal(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

// デフォルト値の定義
fn default_event_buffer_size() -> usize {
    256
}

fn default_frame_budget() -> Duration {
    Duration::from_millis(8)
}

fn default_max_recalculation_passes() -> u32 {
    32
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
