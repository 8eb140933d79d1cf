//! Periodic export of the aggregate tables to one overwritten JSON file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::session::LiveSessions;
use crate::stats::{Aggregator, CountEntry, Dimension};

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub generated_at: String,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub protocols: Vec<CountEntry>,
    pub sources: Vec<CountEntry>,
    pub destinations: Vec<CountEntry>,
    pub ports: Vec<CountEntry>,
}

impl Snapshot {
    /// Reads each table once; concurrent updates may land on either side.
    pub fn collect(stats: &Aggregator, top_n: usize, active_sessions: usize) -> Self {
        Self {
            generated_at: Local::now().to_rfc3339(),
            total_packets: stats.total_packets(),
            total_bytes: stats.total_bytes(),
            active_sessions,
            protocols: stats.top_n(Dimension::Protocol, top_n),
            sources: stats.top_n(Dimension::Source, top_n),
            destinations: stats.top_n(Dimension::Destination, top_n),
            ports: stats.top_n(Dimension::Port, top_n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub path: PathBuf,
    pub top_n: usize,
    /// Publish after every this many ingested events; 0 disables.
    pub every_events: u64,
    /// Publish on this period; `None` disables.
    pub interval: Option<Duration>,
}

pub struct SnapshotPublisher {
    settings: SnapshotSettings,
    stats: Arc<Aggregator>,
    live: Arc<LiveSessions>,
    wake: Notify,
    published: AtomicU64,
}

impl SnapshotPublisher {
    pub fn new(settings: SnapshotSettings, stats: Arc<Aggregator>, live: Arc<LiveSessions>) -> Self {
        Self {
            settings,
            stats,
            live,
            wake: Notify::new(),
            published: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.settings.path
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Called with the running packet total after each event.
    /// Requests that arrive while a write is pending collapse into one.
    pub fn observe(&self, total_packets: u64) {
        let every = self.settings.every_events;
        if every > 0 && total_packets > 0 && total_packets % every == 0 {
            self.wake.notify_one();
        }
    }

    /// Writes one snapshot, replacing the previous file atomically.
    pub async fn publish(&self) -> io::Result<Snapshot> {
        let snapshot = Snapshot::collect(&self.stats, self.settings.top_n, self.live.len());
        let body = serde_json::to_vec_pretty(&snapshot)?;

        let path = &self.settings.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, path).await?;

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), total_packets = snapshot.total_packets, "snapshot_written");
        Ok(snapshot)
    }

    /// Writes the closing snapshot. Call once every session has ended.
    pub async fn finish(&self) {
        match self.publish().await {
            Ok(s) => info!(
                total_packets = s.total_packets,
                active_sessions = s.active_sessions,
                "final_snapshot_written"
            ),
            Err(e) => warn!(path = %self.settings.path.display(), error = %e, "snapshot_write_failed"),
        }
    }

    /// Publishes on the event-count and interval triggers until shutdown.
    /// The closing snapshot is left to `finish`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.interval;
        let mut tick = interval(period.unwrap_or(Duration::from_secs(3600)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        tick.tick().await;

        info!(
            path = %self.settings.path.display(),
            every_events = self.settings.every_events,
            interval_secs = period.map(|p| p.as_secs()).unwrap_or(0),
            "snapshot_publisher_started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tick.tick(), if period.is_some() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.publish().await {
                warn!(path = %self.settings.path.display(), error = %e, "snapshot_write_failed");
            }
        }
        debug!("snapshot_publisher_stopped");
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}
