//! Rotating, date-scoped append-only log targets.
//!
//! Every target is identified by `(key, date)`. Targets are created lazily on
//! first write through a single registry path, and each one serialises its own
//! writes behind its own lock so unrelated keys never wait on each other.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{Datelike, Local, NaiveDate};
use dashmap::DashMap;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SinkError;

const GLOBAL_LABEL: &str = "global";
const GLOBAL_PREFIX: &str = "network_traffic";
const IP_PREFIX: &str = "traffic";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogKey {
    Global,
    Ip(String),
}

impl LogKey {
    pub fn ip(ip: impl Into<String>) -> Self {
        LogKey::Ip(ip.into())
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogKey::Global => f.write_str(GLOBAL_LABEL),
            LogKey::Ip(ip) => f.write_str(ip),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate once the active file would grow past this many bytes.
    pub max_bytes: u64,
    /// Generation files kept per target, the active one included.
    pub retention: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            retention: 30,
        }
    }
}

/// Identifies a target by where it writes, so keys that map onto the same
/// directory share one target and one lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TargetId {
    dir: PathBuf,
    date: NaiveDate,
}

struct LogTarget {
    label: String,
    dir: PathBuf,
    stem: String,
    policy: RotationPolicy,
    file: Option<File>,
    bytes: u64,
    generation: u64,
}

impl LogTarget {
    fn new(label: String, dir: PathBuf, stem: String, policy: RotationPolicy) -> Self {
        Self {
            label,
            dir,
            stem,
            policy,
            file: None,
            bytes: 0,
            generation: 0,
        }
    }

    fn path_for(&self, generation: u64) -> PathBuf {
        generation_path(&self.dir, &self.stem, generation)
    }

    /// Opens the newest generation on disk, resuming its byte count.
    async fn open(&mut self) -> Result<(), SinkError> {
        let open_err = |path: &Path, source: io::Error| SinkError::Open {
            key: self.label.clone(),
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| open_err(&self.dir, e))?;
        let generation = generations(&self.dir, &self.stem)
            .await
            .map_err(|e| open_err(&self.dir, e))?
            .into_iter()
            .max()
            .unwrap_or(0);
        let path = self.path_for(generation);
        let file = open_append(&path).await.map_err(|e| open_err(&path, e))?;
        let bytes = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        debug!(key = %self.label, path = %path.display(), generation, bytes, "log_target_opened");
        self.generation = generation;
        self.bytes = bytes;
        self.file = Some(file);
        Ok(())
    }

    async fn append(&mut self, line: &str) -> Result<(), SinkError> {
        if self.file.is_none() {
            self.open().await?;
        }
        let len = line.len() as u64 + 1;
        if self.bytes > 0 && self.bytes + len > self.policy.max_bytes {
            self.rotate().await?;
        }

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let path = self.path_for(self.generation);
        let result = match self.file.as_mut() {
            Some(file) => match file.write_all(&buf).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            },
            None => Err(io::Error::new(io::ErrorKind::NotFound, "log target is closed")),
        };
        match result {
            Ok(()) => {
                self.bytes += len;
                Ok(())
            }
            Err(source) => {
                // A partial write leaves the byte count unknown; reopen on next use.
                self.file = None;
                Err(SinkError::Write {
                    key: self.label.clone(),
                    path,
                    source,
                })
            }
        }
    }

    async fn rotate(&mut self) -> Result<(), SinkError> {
        if let Some(mut old) = self.file.take() {
            if let Err(e) = old.flush().await {
                warn!(key = %self.label, error = %e, "log_target_flush_failed");
            }
        }
        let next = self.generation + 1;
        let path = self.path_for(next);
        let file = open_append(&path).await.map_err(|source| SinkError::Rotate {
            key: self.label.clone(),
            source,
        })?;
        self.bytes = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        self.generation = next;
        self.file = Some(file);
        info!(key = %self.label, generation = next, path = %path.display(), "log_target_rotated");
        self.prune().await;
        Ok(())
    }

    async fn prune(&self) {
        let retention = self.policy.retention.max(1) as u64;
        if self.generation < retention {
            return;
        }
        let oldest_kept = self.generation + 1 - retention;
        let existing = match generations(&self.dir, &self.stem).await {
            Ok(g) => g,
            Err(e) => {
                warn!(key = %self.label, error = %e, "log_target_prune_scan_failed");
                return;
            }
        };
        for generation in existing.into_iter().filter(|g| *g < oldest_kept) {
            let path = self.path_for(generation);
            match fs::remove_file(&path).await {
                Ok(()) => debug!(key = %self.label, path = %path.display(), "log_generation_pruned"),
                Err(e) => warn!(key = %self.label, path = %path.display(), error = %e, "log_generation_prune_failed"),
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// Registry of log targets keyed by `(key, date)`.
pub struct LogSink {
    root: PathBuf,
    policy: RotationPolicy,
    targets: DashMap<TargetId, Arc<Mutex<LogTarget>>>,
    newest_day: AtomicI32,
}

impl LogSink {
    pub fn new(root: impl Into<PathBuf>, policy: RotationPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            targets: DashMap::new(),
            newest_day: AtomicI32::new(i32::MIN),
        }
    }

    /// Appends one line to today's target for `key`.
    pub async fn append(&self, key: &LogKey, line: &str) -> Result<(), SinkError> {
        self.append_on(key, line, Local::now().date_naive()).await
    }

    /// Appends one line to the target for `key` on `date`.
    ///
    /// The date is fixed by the caller before the target is looked up, so a
    /// write never lands in a file for another day even when midnight passes
    /// while it waits for the target lock.
    pub async fn append_on(
        &self,
        key: &LogKey,
        line: &str,
        date: NaiveDate,
    ) -> Result<(), SinkError> {
        self.retire_before(date);
        if self.is_retired(date) {
            return self.append_retired(key, line, date).await;
        }
        let (id, target) = self.target(key, date);
        if self.is_retired(date) {
            // a newer day arrived between the check and the insert
            self.targets.remove(&id);
        }
        let mut target = target.lock().await;
        target.append(line).await
    }

    fn target(&self, key: &LogKey, date: NaiveDate) -> (TargetId, Arc<Mutex<LogTarget>>) {
        let (dir, stem) = self.location(key, date);
        let id = TargetId { dir, date };
        if let Some(existing) = self.targets.get(&id) {
            let target = existing.value().clone();
            return (id, target);
        }
        let target = self
            .targets
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(LogTarget::new(
                    key.to_string(),
                    id.dir.clone(),
                    stem,
                    self.policy,
                )))
            })
            .value()
            .clone();
        (id, target)
    }

    fn is_retired(&self, date: NaiveDate) -> bool {
        date.num_days_from_ce() < self.newest_day.load(Ordering::Acquire)
    }

    /// Late writes for a day that has already rolled over go through a
    /// short-lived target that is never registered.
    async fn append_retired(&self, key: &LogKey, line: &str, date: NaiveDate) -> Result<(), SinkError> {
        let (dir, stem) = self.location(key, date);
        let mut target = LogTarget::new(key.to_string(), dir, stem, self.policy);
        let result = target.append(line).await;
        if let Err(e) = target.close().await {
            warn!(key = %key, date = %date, error = %e, "log_target_close_failed");
        }
        debug!(key = %key, date = %date, "late_write_for_retired_day");
        result
    }

    fn location(&self, key: &LogKey, date: NaiveDate) -> (PathBuf, String) {
        let day = date.format("%Y%m%d");
        match key {
            LogKey::Global => (self.root.clone(), format!("{}_{}", GLOBAL_PREFIX, day)),
            LogKey::Ip(ip) => (
                self.root.join(path_component(ip)),
                format!("{}_{}", IP_PREFIX, day),
            ),
        }
    }

    /// Path of generation `generation` of the target for `key` on `date`.
    pub fn target_path(&self, key: &LogKey, date: NaiveDate, generation: u64) -> PathBuf {
        let (dir, stem) = self.location(key, date);
        generation_path(&dir, &stem, generation)
    }

    /// Drops targets for days older than `date` once a newer day shows up.
    fn retire_before(&self, date: NaiveDate) {
        let day = date.num_days_from_ce();
        let previous = self.newest_day.fetch_max(day, Ordering::AcqRel);
        if day > previous && previous != i32::MIN {
            let before = self.targets.len();
            self.targets.retain(|id, _| id.date.num_days_from_ce() >= day);
            info!(
                date = %date,
                retired = before.saturating_sub(self.targets.len()),
                "log_targets_date_rollover"
            );
        }
    }

    pub fn open_targets(&self) -> usize {
        self.targets.len()
    }

    /// Flushes and closes every target. Later appends reopen lazily.
    pub async fn close_all(&self) {
        let targets: Vec<(TargetId, Arc<Mutex<LogTarget>>)> = self
            .targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.targets.clear();
        for (id, target) in targets {
            let mut target = target.lock().await;
            if let Err(e) = target.close().await {
                warn!(key = %target.label, date = %id.date, error = %e, "log_target_close_failed");
            }
        }
        debug!("log_targets_closed");
    }
}

async fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

fn generation_path(dir: &Path, stem: &str, generation: u64) -> PathBuf {
    if generation == 0 {
        dir.join(format!("{}.log", stem))
    } else {
        dir.join(format!("{}.{}.log", stem, generation))
    }
}

/// Generations of `stem` currently present in `dir`.
async fn generations(dir: &Path, stem: &str) -> io::Result<Vec<u64>> {
    let mut found = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some(generation) = name.to_str().and_then(|n| parse_generation(n, stem)) {
            found.push(generation);
        }
    }
    Ok(found)
}

fn parse_generation(file_name: &str, stem: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(stem)?.strip_suffix(".log")?;
    if rest.is_empty() {
        return Some(0);
    }
    rest.strip_prefix('.')?.parse().ok()
}

/// Maps an arbitrary key onto one safe path component under the log root.
fn path_component(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn parses_generation_suffixes() {
        assert_eq!(parse_generation("traffic_20240301.log", "traffic_20240301"), Some(0));
        assert_eq!(parse_generation("traffic_20240301.12.log", "traffic_20240301"), Some(12));
        assert_eq!(parse_generation("traffic_20240302.log", "traffic_20240301"), None);
        assert_eq!(parse_generation("traffic_20240301.x.log", "traffic_20240301"), None);
        assert_eq!(parse_generation("traffic_20240301.log.gz", "traffic_20240301"), None);
    }

    #[test]
    fn keys_stay_inside_root() {
        assert_eq!(path_component("10.0.0.1"), "10.0.0.1");
        assert_eq!(path_component("fe80::1"), "fe80__1");
        assert_eq!(path_component("../../etc"), ".._.._etc");
        assert_eq!(path_component(".."), "_");
        assert_eq!(path_component("a/b"), "a_b");
    }

    #[tokio::test]
    async fn writes_global_and_ip_targets() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path(), RotationPolicy::default());

        sink.append_on(&LogKey::Global, "{\"a\":1}", day(1)).await.unwrap();
        sink.append_on(&LogKey::ip("1.1.1.1"), "hello", day(1)).await.unwrap();

        let global = dir.path().join("network_traffic_20240301.log");
        let ip = dir.path().join("1.1.1.1").join("traffic_20240301.log");
        assert_eq!(std::fs::read_to_string(&global).unwrap(), "{\"a\":1}\n");
        assert_eq!(std::fs::read_to_string(&ip).unwrap(), "hello\n");
        assert_eq!(sink.target_path(&LogKey::ip("1.1.1.1"), day(1), 0), ip);
    }

    #[tokio::test]
    async fn append_writes_todays_target() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path(), RotationPolicy::default());
        sink.append(&LogKey::ip("5.6.7.8"), "now").await.unwrap();
        let today = Local::now().date_naive();
        assert_eq!(line_count(&sink.target_path(&LogKey::ip("5.6.7.8"), today, 0)), 1);
    }

    #[tokio::test]
    async fn rotates_and_enforces_retention() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RotationPolicy {
            max_bytes: 64,
            retention: 3,
        };
        let sink = LogSink::new(dir.path(), policy);
        let key = LogKey::ip("10.0.0.1");
        let line = "x".repeat(29); // 30 bytes with newline, two lines per file

        for _ in 0..20 {
            sink.append_on(&key, &line, day(1)).await.unwrap();
        }

        let ip_dir = dir.path().join("10.0.0.1");
        let files = files_in(&ip_dir);
        assert_eq!(files.len(), 3, "{:?}", files);
        // 20 lines at two per file end in generation 9
        assert!(files.contains(&"traffic_20240301.9.log".to_string()));
        assert!(files.contains(&"traffic_20240301.7.log".to_string()));
        assert!(!files.contains(&"traffic_20240301.log".to_string()));
        for name in files {
            let len = std::fs::metadata(ip_dir.join(name)).unwrap().len();
            assert!(len <= 64);
        }
    }

    #[tokio::test]
    async fn write_past_threshold_opens_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(
            dir.path(),
            RotationPolicy {
                max_bytes: 10,
                retention: 30,
            },
        );
        let key = LogKey::Global;
        // a single oversized line still goes into the empty active file
        sink.append_on(&key, &"y".repeat(40), day(1)).await.unwrap();
        assert!(sink.target_path(&key, day(1), 0).exists());
        assert!(!sink.target_path(&key, day(1), 1).exists());

        sink.append_on(&key, "z", day(1)).await.unwrap();
        assert_eq!(line_count(&sink.target_path(&key, day(1), 1)), 1);
    }

    #[tokio::test]
    async fn resumes_newest_generation_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RotationPolicy {
            max_bytes: 20,
            retention: 30,
        };
        let key = LogKey::ip("2.2.2.2");
        {
            let sink = LogSink::new(dir.path(), policy);
            for _ in 0..3 {
                sink.append_on(&key, "123456789", day(1)).await.unwrap();
            }
            sink.close_all().await;
        }
        let sink = LogSink::new(dir.path(), policy);
        sink.append_on(&key, "123456789", day(1)).await.unwrap();

        // gen0 holds two lines, gen1 one line, the resumed write fills gen1
        assert_eq!(line_count(&sink.target_path(&key, day(1), 0)), 2);
        assert_eq!(line_count(&sink.target_path(&key, day(1), 1)), 2);
        assert!(!sink.target_path(&key, day(1), 2).exists());
    }

    #[tokio::test]
    async fn date_change_opens_new_target_and_retires_old() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path(), RotationPolicy::default());

        sink.append_on(&LogKey::Global, "one", day(1)).await.unwrap();
        sink.append_on(&LogKey::ip("a"), "one", day(1)).await.unwrap();
        assert_eq!(sink.open_targets(), 2);

        sink.append_on(&LogKey::Global, "two", day(2)).await.unwrap();
        assert_eq!(sink.open_targets(), 1);

        assert_eq!(line_count(&sink.target_path(&LogKey::Global, day(1), 0)), 1);
        assert_eq!(line_count(&sink.target_path(&LogKey::Global, day(2), 0)), 1);
    }

    #[tokio::test]
    async fn keys_with_the_same_directory_share_a_target() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RotationPolicy {
            max_bytes: 20,
            retention: 30,
        };
        let sink = LogSink::new(dir.path(), policy);

        for key in ["a/b", "a_b", "a/b"] {
            sink.append_on(&LogKey::ip(key), "123456789", day(1)).await.unwrap();
        }

        assert_eq!(sink.open_targets(), 1);
        let first = sink.target_path(&LogKey::ip("a_b"), day(1), 0);
        assert_eq!(first, sink.target_path(&LogKey::ip("a/b"), day(1), 0));
        assert_eq!(line_count(&first), 2);
        assert_eq!(line_count(&sink.target_path(&LogKey::ip("a_b"), day(1), 1)), 1);
        for name in files_in(&dir.path().join("a_b")) {
            assert!(std::fs::metadata(dir.path().join("a_b").join(name)).unwrap().len() <= 20);
        }
    }

    #[tokio::test]
    async fn late_write_for_previous_day_is_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path(), RotationPolicy::default());
        let key = LogKey::ip("7.7.7.7");

        sink.append_on(&key, "before", day(1)).await.unwrap();
        sink.append_on(&key, "after", day(2)).await.unwrap();
        assert_eq!(sink.open_targets(), 1);

        sink.append_on(&key, "late", day(1)).await.unwrap();
        assert_eq!(sink.open_targets(), 1);
        let old = std::fs::read_to_string(sink.target_path(&key, day(1), 0)).unwrap();
        assert_eq!(old, "before\nlate\n");
        assert_eq!(line_count(&sink.target_path(&key, day(2), 0)), 1);
    }

    #[tokio::test]
    async fn concurrent_first_touch_shares_one_target() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(LogSink::new(dir.path(), RotationPolicy::default()));
        let key = LogKey::ip("9.9.9.9");

        let mut handles = Vec::new();
        for i in 0..50 {
            let sink = sink.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let line = format!("line-{:02}-{}", i, "p".repeat(100));
                sink.append_on(&key, &line, day(1)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(sink.open_targets(), 1);
        let content = std::fs::read_to_string(sink.target_path(&key, day(1), 0)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 50);
        assert!(lines.iter().all(|l| l.len() == 108 && l.starts_with("line-")));
    }

    #[tokio::test]
    async fn unwritable_target_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the per-IP directory should be
        std::fs::write(dir.path().join("3.3.3.3"), b"blocker").unwrap();
        let sink = LogSink::new(dir.path(), RotationPolicy::default());

        let err = sink
            .append_on(&LogKey::ip("3.3.3.3"), "lost", day(1))
            .await
            .unwrap_err();
        assert_eq!(err.key(), "3.3.3.3");

        sink.append_on(&LogKey::Global, "kept", day(1)).await.unwrap();
        sink.append_on(&LogKey::ip("4.4.4.4"), "kept", day(1)).await.unwrap();
        assert_eq!(line_count(&sink.target_path(&LogKey::Global, day(1), 0)), 1);
    }
}
