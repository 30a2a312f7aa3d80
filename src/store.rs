//! Persistent run timestamps.
//!
//! Remembers when a run last started, built and finished (unix seconds) so
//! enumeration can, for example, only pick up items changed since the last
//! run. The timers are merged into the run parameters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::paths;
use crate::renderer::Params;

/// Unix timestamps of the last run phases; 0 means never.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timers {
    #[serde(default)]
    pub last_started: i64,
    #[serde(default)]
    pub last_built: i64,
    #[serde(default)]
    pub last_finished: i64,
}

/// Which timer to stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Started,
    Built,
    Finished,
}

/// Timers backed by a JSON file.
#[derive(Debug)]
pub struct TimerStore {
    path: PathBuf,
    timers: Timers,
}

impl TimerStore {
    /// Load timers from `path`. A missing file starts from zero; an
    /// unreadable one is logged and ignored.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let timers = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt timers file");
                Timers::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Timers::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unable to read timers file");
                Timers::default()
            }
        };
        Self { path, timers }
    }

    /// Timers in the default data directory.
    pub fn open_default() -> Self {
        Self::open(paths::get_timers_path())
    }

    pub fn timers(&self) -> Timers {
        self.timers
    }

    /// Stamp `timer` with the current time and save.
    pub fn store_time(&mut self, timer: Timer) -> Result<()> {
        self.store_time_at(timer, chrono::Utc::now().timestamp())
    }

    pub fn store_time_at(&mut self, timer: Timer, timestamp: i64) -> Result<()> {
        match timer {
            Timer::Started => self.timers.last_started = timestamp,
            Timer::Built => self.timers.last_built = timestamp,
            Timer::Finished => self.timers.last_finished = timestamp,
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            paths::ensure_dir(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.timers)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Saved run timers");
        Ok(())
    }

    /// Timers as run parameters, overridden by `params`.
    pub fn merge_params(&self, params: Params) -> Params {
        let mut merged = match serde_json::to_value(self.timers) {
            Ok(Value::Object(map)) => map,
            _ => Params::new(),
        };
        merged.extend(params);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_timers_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/timers.json");

        let mut store = TimerStore::open(&path);
        assert_eq!(store.timers(), Timers::default());
        store.store_time_at(Timer::Started, 100).unwrap();
        store.store_time_at(Timer::Finished, 160).unwrap();

        let reopened = TimerStore::open(&path);
        assert_eq!(
            reopened.timers(),
            Timers {
                last_started: 100,
                last_built: 0,
                last_finished: 160,
            }
        );
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["lastStarted"], json!(100));
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("timers.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(TimerStore::open(&path).timers(), Timers::default());
    }

    #[test]
    fn test_user_params_win() {
        let dir = tempdir().unwrap();
        let mut store = TimerStore::open(dir.path().join("timers.json"));
        store.store_time_at(Timer::Built, 42).unwrap();

        let mut params = Params::new();
        params.insert("lastBuilt".into(), json!(7));
        params.insert("lang".into(), json!("en"));

        let merged = store.merge_params(params);
        assert_eq!(merged["lastBuilt"], json!(7));
        assert_eq!(merged["lastStarted"], json!(0));
        assert_eq!(merged["lang"], json!("en"));
    }
}
