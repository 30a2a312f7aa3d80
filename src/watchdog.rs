//! Per-worker lifecycle bookkeeping.
//!
//! The watchdog is the single source of truth for what happened to each
//! spawned worker: when it started, how long it lived, how it exited and
//! how much it did. Liveness itself is not checked here; the owner installs
//! an `isWorkerAlive` hook and [`Watchdog::count_alive`] asks it.
//!
//! Tracked stats are declared up front in a [`StatSchema`]. Each stat has a
//! fixed kind and merges updates according to that kind.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::error;

use crate::hooks::HookRegistry;

/// Hook name used for the liveness predicate.
pub const IS_WORKER_ALIVE: &str = "isWorkerAlive";

/// Stat counting items handed to a worker.
pub const STAT_ROUTES: &str = "routes";
/// Stat counting errors a worker reported.
pub const STAT_ERRORS: &str = "errors";

/// A cumulative per-worker statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Stat {
    /// Numeric total; merges by addition.
    Counter(u64),
    /// Text; merges by concatenation.
    Text(String),
    /// List; merges by appending.
    Sequence(Vec<Value>),
    /// Object; merges by shallow key overwrite.
    Struct(Map<String, Value>),
}

impl Stat {
    fn kind(&self) -> &'static str {
        match self {
            Self::Counter(_) => "counter",
            Self::Text(_) => "text",
            Self::Sequence(_) => "sequence",
            Self::Struct(_) => "struct",
        }
    }

    /// Fold `update` into this stat. Fails if the kinds differ.
    pub fn merge(&mut self, update: Stat) -> Result<(), (&'static str, &'static str)> {
        match (self, update) {
            (Self::Counter(total), Self::Counter(n)) => *total += n,
            (Self::Text(text), Self::Text(more)) => text.push_str(&more),
            (Self::Sequence(items), Self::Sequence(more)) => items.extend(more),
            (Self::Struct(fields), Self::Struct(more)) => fields.extend(more),
            (current, update) => return Err((current.kind(), update.kind())),
        }
        Ok(())
    }

    pub fn as_counter(&self) -> Option<u64> {
        match self {
            Self::Counter(n) => Some(*n),
            _ => None,
        }
    }
}

/// Stats every new worker record starts with.
#[derive(Debug, Clone)]
pub struct StatSchema {
    fields: Vec<(String, Stat)>,
}

impl StatSchema {
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    /// Declare a stat and its initial value.
    pub fn with(mut self, name: impl Into<String>, initial: Stat) -> Self {
        self.fields.push((name.into(), initial));
        self
    }

    fn instantiate(&self) -> BTreeMap<String, Stat> {
        self.fields.iter().cloned().collect()
    }
}

impl Default for StatSchema {
    /// Item and error counters.
    fn default() -> Self {
        Self::empty()
            .with(STAT_ROUTES, Stat::Counter(0))
            .with(STAT_ERRORS, Stat::Counter(0))
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit status; 0 when killed by a signal.
    pub code: i32,
    /// Signal name (e.g. `SIGKILL`) when killed by a signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn code(code: i32) -> Self {
        Self { code, signal: None }
    }

    pub fn signal(signal: impl Into<String>) -> Self {
        Self {
            code: 0,
            signal: Some(signal.into()),
        }
    }

    /// Nonzero status or any signal.
    pub fn is_fatal(&self) -> bool {
        self.code != 0 || self.signal.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Bookkeeping entry for one spawned worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: u32,
    pub pid: u32,
    pub started: Instant,
    /// Zero while alive, wall time from spawn to exit afterwards.
    pub duration: Duration,
    pub exit_code: i32,
    pub exit_signal: Option<String>,
    pub stats: BTreeMap<String, Stat>,
}

impl WorkerRecord {
    pub fn stat(&self, name: &str) -> Option<&Stat> {
        self.stats.get(name)
    }

    /// Items handed to this worker.
    pub fn routes_processed(&self) -> u64 {
        self.counter(STAT_ROUTES)
    }

    /// Errors this worker reported.
    pub fn error_count(&self) -> u64 {
        self.counter(STAT_ERRORS)
    }

    pub fn has_exited(&self) -> bool {
        self.duration > Duration::ZERO
    }

    /// Ended with a nonzero status or a signal.
    pub fn is_fatal(&self) -> bool {
        self.exit_code != 0 || self.exit_signal.as_deref().is_some_and(|s| !s.is_empty())
    }

    fn counter(&self, name: &str) -> u64 {
        self.stat(name).and_then(Stat::as_counter).unwrap_or(0)
    }
}

/// Summary shape: durations in seconds and the counters at the top level.
impl Serialize for WorkerRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("WorkerRecord", 8)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("pid", &self.pid)?;
        state.serialize_field("duration", &round_tenths(self.duration))?;
        state.serialize_field("exitCode", &self.exit_code)?;
        state.serialize_field("exitSignal", &self.exit_signal)?;
        state.serialize_field("routesProcessed", &self.routes_processed())?;
        state.serialize_field("errorCount", &self.error_count())?;
        state.serialize_field("stats", &self.stats)?;
        state.end()
    }
}

/// Seconds, rounded to 0.1.
pub fn round_tenths(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 10.0).round() / 10.0
}

/// `serialize_with` helper writing a duration as [`round_tenths`] seconds.
pub fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(round_tenths(*duration))
}

/// Per-worker state table.
pub struct Watchdog {
    workers: BTreeMap<u32, WorkerRecord>,
    schema: StatSchema,
    hooks: HookRegistry<WorkerRecord, bool>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::with_schema(StatSchema::default())
    }

    pub fn with_schema(schema: StatSchema) -> Self {
        Self {
            workers: BTreeMap::new(),
            schema,
            hooks: HookRegistry::new(),
        }
    }

    /// Register a hook, e.g. [`IS_WORKER_ALIVE`].
    pub fn hook<F>(&mut self, name: &str, callback: F)
    where
        F: FnMut(&WorkerRecord) -> anyhow::Result<bool> + Send + 'static,
    {
        self.hooks.hook(name, callback);
    }

    /// Start tracking a worker. Re-registering an id overwrites it.
    pub fn add_worker(&mut self, id: u32, pid: u32) {
        if self.workers.contains_key(&id) {
            error!(worker_id = id, "A worker with this id is already registered to the watchdog");
        }
        self.workers.insert(
            id,
            WorkerRecord {
                id,
                pid,
                started: Instant::now(),
                duration: Duration::ZERO,
                exit_code: 0,
                exit_signal: None,
                stats: self.schema.instantiate(),
            },
        );
    }

    /// Fold `value` into stat `key` of worker `id`. Unknown workers, unknown
    /// stats and kind mismatches are logged and ignored.
    pub fn append_info(&mut self, id: u32, key: &str, value: Stat) {
        let Some(record) = self.workers.get_mut(&id) else {
            return;
        };
        match record.stats.get_mut(key) {
            None => error!(worker_id = id, key, "Key is undefined for worker"),
            Some(stat) => {
                if let Err((expected, got)) = stat.merge(value) {
                    error!(worker_id = id, key, expected, got, "Stat kind mismatch");
                }
            }
        }
    }

    /// Record a worker's exit. Call exactly once per worker: a second call
    /// recomputes and overwrites the duration.
    pub fn exit_worker(&mut self, id: u32, exit: ExitInfo) {
        if let Some(record) = self.workers.get_mut(&id) {
            // A zero duration would read as "alive" in all_dead().
            record.duration = record.started.elapsed().max(Duration::from_nanos(1));
            record.exit_code = exit.code;
            record.exit_signal = exit.signal;
        }
    }

    /// Workers the `isWorkerAlive` hook reports alive. Without a hook nobody counts.
    pub fn count_alive(&mut self) -> usize {
        let mut alive = 0;
        for record in self.workers.values() {
            let answers = self.hooks.call_hook(IS_WORKER_ALIVE, record);
            if !answers.is_empty() && answers.iter().all(|yes| *yes) {
                alive += 1;
            }
        }
        alive
    }

    /// True once every registered worker's exit has been recorded.
    pub fn all_dead(&self) -> bool {
        self.workers.values().all(WorkerRecord::has_exited)
    }

    pub fn get(&self, id: u32) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    /// Records in worker id order.
    pub fn records(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counter_accumulates() {
        let mut watchdog = Watchdog::new();
        watchdog.add_worker(1, 100);
        watchdog.append_info(1, STAT_ROUTES, Stat::Counter(3));
        watchdog.append_info(1, STAT_ROUTES, Stat::Counter(4));
        assert_eq!(watchdog.get(1).unwrap().routes_processed(), 7);
        assert_eq!(watchdog.get(1).unwrap().error_count(), 0);
    }

    #[test]
    fn test_other_stat_kinds_merge() {
        let schema = StatSchema::empty()
            .with("log", Stat::Text(String::new()))
            .with("items", Stat::Sequence(Vec::new()))
            .with("meta", Stat::Struct(Map::new()));
        let mut watchdog = Watchdog::with_schema(schema);
        watchdog.add_worker(1, 100);

        watchdog.append_info(1, "log", Stat::Text("ab".into()));
        watchdog.append_info(1, "log", Stat::Text("c".into()));
        watchdog.append_info(1, "items", Stat::Sequence(vec![json!("/a")]));
        watchdog.append_info(1, "items", Stat::Sequence(vec![json!("/b")]));
        let mut meta = Map::new();
        meta.insert("host".into(), json!("x"));
        watchdog.append_info(1, "meta", Stat::Struct(meta.clone()));
        meta.insert("host".into(), json!("y"));
        meta.insert("port".into(), json!(1));
        watchdog.append_info(1, "meta", Stat::Struct(meta));

        let record = watchdog.get(1).unwrap();
        assert_eq!(record.stat("log"), Some(&Stat::Text("abc".into())));
        assert_eq!(
            record.stat("items"),
            Some(&Stat::Sequence(vec![json!("/a"), json!("/b")]))
        );
        match record.stat("meta") {
            Some(Stat::Struct(fields)) => {
                assert_eq!(fields["host"], json!("y"));
                assert_eq!(fields["port"], json!(1));
            }
            other => panic!("unexpected stat {:?}", other),
        }
    }

    #[test]
    fn test_unknown_key_and_kind_mismatch_are_noops() {
        let mut watchdog = Watchdog::new();
        watchdog.add_worker(1, 100);
        watchdog.append_info(1, "nope", Stat::Counter(1));
        watchdog.append_info(1, STAT_ROUTES, Stat::Text("x".into()));
        watchdog.append_info(9, STAT_ROUTES, Stat::Counter(1));

        let record = watchdog.get(1).unwrap();
        assert!(record.stat("nope").is_none());
        assert_eq!(record.routes_processed(), 0);
    }

    #[test]
    fn test_all_dead_tracks_recorded_exits() {
        let mut watchdog = Watchdog::new();
        assert!(watchdog.all_dead());

        watchdog.add_worker(1, 100);
        watchdog.add_worker(2, 101);
        assert!(!watchdog.all_dead());

        watchdog.exit_worker(1, ExitInfo::clean());
        assert!(!watchdog.all_dead());
        assert!(watchdog.get(1).unwrap().duration > Duration::ZERO);
        assert_eq!(watchdog.get(2).unwrap().duration, Duration::ZERO);

        watchdog.exit_worker(2, ExitInfo::code(1));
        assert!(watchdog.all_dead());
        assert_eq!(watchdog.get(2).unwrap().exit_code, 1);
    }

    #[test]
    fn test_readding_worker_overwrites_record() {
        let mut watchdog = Watchdog::new();
        watchdog.add_worker(1, 100);
        watchdog.append_info(1, STAT_ROUTES, Stat::Counter(5));
        watchdog.add_worker(1, 200);

        let record = watchdog.get(1).unwrap();
        assert_eq!(record.pid, 200);
        assert_eq!(record.routes_processed(), 0);
        assert_eq!(watchdog.len(), 1);
    }

    #[test]
    fn test_count_alive_uses_hook() {
        let mut watchdog = Watchdog::new();
        watchdog.add_worker(1, 100);
        watchdog.add_worker(2, 101);
        watchdog.add_worker(3, 102);
        assert_eq!(watchdog.count_alive(), 0);

        watchdog.hook(IS_WORKER_ALIVE, |record| Ok(record.id != 2));
        assert_eq!(watchdog.count_alive(), 2);
    }

    #[test]
    fn test_exit_info_fatal() {
        assert!(!ExitInfo::clean().is_fatal());
        assert!(ExitInfo::code(1).is_fatal());
        assert!(ExitInfo::signal("SIGKILL").is_fatal());
        assert!(!ExitInfo::signal("").is_fatal());
    }

    #[test]
    fn test_record_fatal_matches_exit_info() {
        let mut watchdog = Watchdog::new();
        watchdog.add_worker(1, 100);
        let mut record = watchdog.get(1).unwrap().clone();
        assert!(!record.is_fatal());

        record.exit_signal = Some(String::new());
        assert!(!record.is_fatal());
        record.exit_signal = Some("SIGKILL".into());
        assert!(record.is_fatal());

        record.exit_signal = None;
        record.exit_code = 2;
        assert!(record.is_fatal());
    }

    #[test]
    fn test_record_serializes_seconds_and_counters() {
        let mut watchdog = Watchdog::new();
        watchdog.add_worker(1, 100);
        watchdog.append_info(1, STAT_ROUTES, Stat::Counter(3));
        watchdog.append_info(1, STAT_ERRORS, Stat::Counter(1));
        let mut record = watchdog.get(1).unwrap().clone();
        record.duration = Duration::from_millis(1260);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["duration"], json!(1.3));
        assert_eq!(value["routesProcessed"], 3);
        assert_eq!(value["errorCount"], 1);
        assert_eq!(value["exitCode"], 0);
        assert_eq!(value["exitSignal"], Value::Null);
        assert_eq!(value["stats"]["routes"]["value"], 3);
        assert!(value.get("started").is_none());
    }

    #[test]
    fn test_records_in_id_order() {
        let mut watchdog = Watchdog::new();
        for id in [3, 1, 2] {
            watchdog.add_worker(id, id * 10);
        }
        let ids: Vec<u32> = watchdog.records().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
