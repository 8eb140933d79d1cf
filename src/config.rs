use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::sink::RotationPolicy;
use crate::snapshot::SnapshotSettings;

/// Every flag can also come from the environment (or a `.env` file).
#[derive(Parser, Debug, Clone)]
#[command(name = "traffic-ingest", version, about = "Ingests packet-observation events over WebSocket")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "TRAFFIC_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "TRAFFIC_PORT", default_value_t = 8765)]
    pub port: u16,

    /// Base directory for traffic logs and the snapshot
    #[arg(long, env = "TRAFFIC_LOG_DIR", default_value = "traffic_logs")]
    pub log_dir: PathBuf,

    /// Rotate a log target once it would exceed this many bytes
    #[arg(long, env = "TRAFFIC_MAX_BYTES", default_value_t = 10 * 1024 * 1024,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub max_bytes: u64,

    /// Generation files kept per log target
    #[arg(long, env = "TRAFFIC_RETENTION", default_value_t = 30,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub retention: u64,

    /// Write a snapshot every N events (0 disables)
    #[arg(long, env = "TRAFFIC_SNAPSHOT_EVERY", default_value_t = 1000)]
    pub snapshot_every: u64,

    /// Write a snapshot every N seconds (0 disables)
    #[arg(long, env = "TRAFFIC_SNAPSHOT_INTERVAL_SECS", default_value_t = 60)]
    pub snapshot_interval_secs: u64,

    /// Snapshot file; defaults to stats.json in the log directory
    #[arg(long, env = "TRAFFIC_SNAPSHOT_PATH")]
    pub snapshot_path: Option<PathBuf>,

    /// Entries per snapshot section
    #[arg(long, env = "TRAFFIC_TOP_N", default_value_t = 10)]
    pub top_n: usize,

    /// Status log period in seconds (0 disables)
    #[arg(long, env = "TRAFFIC_STATUS_INTERVAL_SECS", default_value_t = 10)]
    pub status_interval_secs: u64,

    #[arg(long, env = "TRAFFIC_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub handshake_timeout_secs: u64,

    /// Emit operational logs as JSON
    #[arg(long, env = "TRAFFIC_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn rotation(&self) -> RotationPolicy {
        RotationPolicy {
            max_bytes: self.max_bytes,
            retention: usize::try_from(self.retention).unwrap_or(usize::MAX),
        }
    }

    pub fn snapshot(&self) -> SnapshotSettings {
        SnapshotSettings {
            path: self
                .snapshot_path
                .clone()
                .unwrap_or_else(|| self.log_dir.join("stats.json")),
            top_n: self.top_n,
            every_events: self.snapshot_every,
            interval: secs(self.snapshot_interval_secs),
        }
    }

    pub fn status_interval(&self) -> Option<Duration> {
        secs(self.status_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}
