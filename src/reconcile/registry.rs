//! Lock-guarded registries shared by the reconciler and the sweep.
//!
//! - `ActiveRegistry`: `path -> pattern -> (spec, monitor)`. Answers "is this
//!   spec already served?" and always references the live monitor of a file.
//! - `LivenessRegistry`: `(path, last refresh) -> monitor`. Re-keyed on every
//!   refresh; the only input to the stale sweep.
//!
//! Both are owned values injected into a `Reconciler`, so several engines can
//! coexist in one process. Each guards its map with its own `RwLock`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::desired::MonitorSpec;
use crate::error::{LogmonError, LogmonResult};
use crate::monitor::{FileMonitor, MonitorId};

/// Separator between path and timestamp in a rendered liveness key.
pub const LIVENESS_SEPARATOR: &str = "::::::";

fn lock_err(context: &'static str) -> LogmonError {
    LogmonError::internal(format!("poisoned lock: {context}"))
}

/// One served (file, pattern) pair.
#[derive(Debug, Clone)]
pub struct ActiveEntry {
    /// The desired spec being served.
    pub spec: MonitorSpec,
    /// Monitor serving it.
    pub monitor: Arc<FileMonitor>,
}

/// Which monitors are live, by file and pattern.
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    files: RwLock<HashMap<PathBuf, BTreeMap<String, ActiveEntry>>>,
}

impl ActiveRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any pattern is tracked for `path`.
    pub fn is_tracked(&self, path: &Path) -> LogmonResult<bool> {
        let files = self.files.read().map_err(|_| lock_err("active registry"))?;
        Ok(files.get(path).is_some_and(|patterns| !patterns.is_empty()))
    }

    /// Whether `(path, pattern)` is served.
    pub fn contains(&self, path: &Path, pattern: &str) -> LogmonResult<bool> {
        let files = self.files.read().map_err(|_| lock_err("active registry"))?;
        Ok(files
            .get(path)
            .is_some_and(|patterns| patterns.contains_key(pattern)))
    }

    /// Specs tracked for `path`, in pattern order.
    pub fn specs_for(&self, path: &Path) -> LogmonResult<Vec<MonitorSpec>> {
        let files = self.files.read().map_err(|_| lock_err("active registry"))?;
        Ok(files
            .get(path)
            .map(|patterns| patterns.values().map(|e| e.spec.clone()).collect())
            .unwrap_or_default())
    }

    /// Patterns tracked for `path`.
    pub fn patterns_for(&self, path: &Path) -> LogmonResult<Vec<String>> {
        let files = self.files.read().map_err(|_| lock_err("active registry"))?;
        Ok(files
            .get(path)
            .map(|patterns| patterns.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// The monitor serving `path`, if any.
    pub fn monitor_for(&self, path: &Path) -> LogmonResult<Option<Arc<FileMonitor>>> {
        let files = self.files.read().map_err(|_| lock_err("active registry"))?;
        Ok(files
            .get(path)
            .and_then(|patterns| patterns.values().next())
            .map(|e| Arc::clone(&e.monitor)))
    }

    /// Distinct monitors referenced for `path`.
    pub fn monitors_for(&self, path: &Path) -> LogmonResult<Vec<Arc<FileMonitor>>> {
        let files = self.files.read().map_err(|_| lock_err("active registry"))?;
        let mut out: BTreeMap<MonitorId, Arc<FileMonitor>> = BTreeMap::new();
        if let Some(patterns) = files.get(path) {
            for entry in patterns.values() {
                out.entry(entry.monitor.id())
                    .or_insert_with(|| Arc::clone(&entry.monitor));
            }
        }
        Ok(out.into_values().collect())
    }

    /// Registers `spec` as served by `monitor`.
    pub fn insert(&self, spec: MonitorSpec, monitor: Arc<FileMonitor>) -> LogmonResult<()> {
        let mut files = self.files.write().map_err(|_| lock_err("active registry"))?;
        files
            .entry(spec.file_path.clone())
            .or_default()
            .insert(spec.pattern.clone(), ActiveEntry { spec, monitor });
        Ok(())
    }

    /// Points every spec of `path` at `monitor`, replacing what was tracked.
    ///
    /// Returns the distinct monitors that were referenced before.
    pub fn replace_file(
        &self,
        path: &Path,
        specs: Vec<MonitorSpec>,
        monitor: &Arc<FileMonitor>,
    ) -> LogmonResult<Vec<Arc<FileMonitor>>> {
        let mut files = self.files.write().map_err(|_| lock_err("active registry"))?;
        let entries: BTreeMap<String, ActiveEntry> = specs
            .into_iter()
            .map(|spec| {
                (
                    spec.pattern.clone(),
                    ActiveEntry {
                        spec,
                        monitor: Arc::clone(monitor),
                    },
                )
            })
            .collect();
        let previous = files.insert(path.to_path_buf(), entries).unwrap_or_default();

        let mut old: BTreeMap<MonitorId, Arc<FileMonitor>> = BTreeMap::new();
        for entry in previous.into_values() {
            if entry.monitor.id() != monitor.id() {
                old.entry(entry.monitor.id()).or_insert(entry.monitor);
            }
        }
        Ok(old.into_values().collect())
    }

    /// Drops the entries of `path` that reference monitor `id`.
    ///
    /// Entries pointing at another monitor are left alone. Returns how many
    /// entries were removed.
    pub fn remove_monitor(&self, path: &Path, id: MonitorId) -> LogmonResult<usize> {
        let mut files = self.files.write().map_err(|_| lock_err("active registry"))?;
        let Some(patterns) = files.get_mut(path) else {
            return Ok(0);
        };
        let before = patterns.len();
        patterns.retain(|_, entry| entry.monitor.id() != id);
        let removed = before - patterns.len();
        if patterns.is_empty() {
            files.remove(path);
        }
        Ok(removed)
    }

    /// Forgets `path` entirely.
    pub fn remove_file(&self, path: &Path) -> LogmonResult<()> {
        let mut files = self.files.write().map_err(|_| lock_err("active registry"))?;
        files.remove(path);
        Ok(())
    }

    /// Tracked files, sorted.
    pub fn files(&self) -> LogmonResult<Vec<PathBuf>> {
        let files = self.files.read().map_err(|_| lock_err("active registry"))?;
        let mut out: Vec<PathBuf> = files.keys().cloned().collect();
        out.sort();
        Ok(out)
    }

    /// Every distinct live monitor.
    pub fn monitors(&self) -> LogmonResult<Vec<Arc<FileMonitor>>> {
        let files = self.files.read().map_err(|_| lock_err("active registry"))?;
        let mut out: BTreeMap<MonitorId, Arc<FileMonitor>> = BTreeMap::new();
        for entry in files.values().flat_map(BTreeMap::values) {
            out.entry(entry.monitor.id())
                .or_insert_with(|| Arc::clone(&entry.monitor));
        }
        Ok(out.into_values().collect())
    }

    /// Removes everything and returns the distinct monitors that were tracked.
    pub fn drain(&self) -> LogmonResult<Vec<Arc<FileMonitor>>> {
        let mut files = self.files.write().map_err(|_| lock_err("active registry"))?;
        let mut out: BTreeMap<MonitorId, Arc<FileMonitor>> = BTreeMap::new();
        for entry in std::mem::take(&mut *files).into_values().flat_map(BTreeMap::into_values) {
            out.entry(entry.monitor.id()).or_insert(entry.monitor);
        }
        Ok(out.into_values().collect())
    }
}

/// Liveness key: a file plus the last time its specs were seen.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LivenessKey {
    /// Monitored file.
    pub path: PathBuf,
    /// Last refresh.
    pub refreshed_at: DateTime<Utc>,
}

impl LivenessKey {
    /// Key for `path` refreshed at `at`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, at: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            refreshed_at: at,
        }
    }

    /// Whether the key is at least `threshold` old at `now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.refreshed_at >= threshold
    }
}

impl fmt::Display for LivenessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{LIVENESS_SEPARATOR}{}",
            self.path.display(),
            self.refreshed_at.timestamp()
        )
    }
}

/// Refresh timestamps per monitored file.
#[derive(Debug, Default)]
pub struct LivenessRegistry {
    entries: RwLock<BTreeMap<LivenessKey, Arc<FileMonitor>>>,
}

impl LivenessRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `monitor` for `path` as fresh at `at`.
    pub fn record(&self, path: &Path, at: DateTime<Utc>, monitor: Arc<FileMonitor>) -> LogmonResult<LivenessKey> {
        let mut entries = self.entries.write().map_err(|_| lock_err("liveness registry"))?;
        let key = LivenessKey::new(path, at);
        entries.insert(key.clone(), monitor);
        Ok(key)
    }

    /// Re-keys the entry for exactly `path` to `at`.
    ///
    /// Returns `false` if no entry exists for that path. Should several exist,
    /// the most recent one survives.
    pub fn refresh(&self, path: &Path, at: DateTime<Utc>) -> LogmonResult<bool> {
        let mut entries = self.entries.write().map_err(|_| lock_err("liveness registry"))?;
        let keys: Vec<LivenessKey> = entries.keys().filter(|k| k.path == path).cloned().collect();
        let mut latest = None;
        for key in keys {
            latest = entries.remove(&key);
        }
        let Some(monitor) = latest else {
            return Ok(false);
        };
        entries.insert(LivenessKey::new(path, at), monitor);
        tracing::debug!(path = %path.display(), at = %at, "liveness refreshed");
        Ok(true)
    }

    /// Removes every entry for exactly `path`; returns their monitors.
    pub fn purge_file(&self, path: &Path) -> LogmonResult<Vec<Arc<FileMonitor>>> {
        let mut entries = self.entries.write().map_err(|_| lock_err("liveness registry"))?;
        let keys: Vec<LivenessKey> = entries.keys().filter(|k| k.path == path).cloned().collect();
        Ok(keys.iter().filter_map(|k| entries.remove(k)).collect())
    }

    /// Entries at least `threshold` old at `now`.
    pub fn stale(&self, now: DateTime<Utc>, threshold: Duration) -> LogmonResult<Vec<(LivenessKey, Arc<FileMonitor>)>> {
        let entries = self.entries.read().map_err(|_| lock_err("liveness registry"))?;
        Ok(entries
            .iter()
            .filter(|(key, _)| key.is_stale(now, threshold))
            .map(|(key, monitor)| (key.clone(), Arc::clone(monitor)))
            .collect())
    }

    /// Removes one entry.
    pub fn remove(&self, key: &LivenessKey) -> LogmonResult<Option<Arc<FileMonitor>>> {
        let mut entries = self.entries.write().map_err(|_| lock_err("liveness registry"))?;
        Ok(entries.remove(key))
    }

    /// Current keys, in order.
    pub fn keys(&self) -> LogmonResult<Vec<LivenessKey>> {
        let entries = self.entries.read().map_err(|_| lock_err("liveness registry"))?;
        Ok(entries.keys().cloned().collect())
    }

    /// Key for exactly `path`, if recorded.
    pub fn key_for(&self, path: &Path) -> LogmonResult<Option<LivenessKey>> {
        let entries = self.entries.read().map_err(|_| lock_err("liveness registry"))?;
        Ok(entries.keys().filter(|k| k.path == path).max().cloned())
    }

    /// Number of entries.
    pub fn len(&self) -> LogmonResult<usize> {
        let entries = self.entries.read().map_err(|_| lock_err("liveness registry"))?;
        Ok(entries.len())
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> LogmonResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes everything and returns the monitors that were recorded.
    pub fn purge_all(&self) -> LogmonResult<Vec<Arc<FileMonitor>>> {
        let mut entries = self.entries.write().map_err(|_| lock_err("liveness registry"))?;
        Ok(std::mem::take(&mut *entries).into_values().collect())
    }
}
