use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Local;
use tracing::warn;

use crate::error::DecodeError;
use crate::models::PacketEvent;
use crate::parser;
use crate::sink::{LogKey, LogSink};
use crate::snapshot::SnapshotPublisher;
use crate::stats::Aggregator;

/// Outcome of routing one accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingested {
    pub total_packets: u64,
    pub sink_failures: usize,
}

/// Decode → log fan-out → statistics, shared by every session.
pub struct Pipeline {
    sink: Arc<LogSink>,
    stats: Arc<Aggregator>,
    snapshots: Option<Arc<SnapshotPublisher>>,
    rejected: AtomicU64,
}

impl Pipeline {
    pub fn new(sink: Arc<LogSink>, stats: Arc<Aggregator>) -> Self {
        Self {
            sink,
            stats,
            snapshots: None,
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_snapshots(mut self, publisher: Arc<SnapshotPublisher>) -> Self {
        self.snapshots = Some(publisher);
        self
    }

    pub fn sink(&self) -> &Arc<LogSink> {
        &self.sink
    }

    pub fn stats(&self) -> &Arc<Aggregator> {
        &self.stats
    }

    /// Messages rejected by the codec so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub async fn ingest(&self, raw: &str) -> Result<Ingested, DecodeError> {
        let event = self.checked(parser::decode(raw))?;
        Ok(self.route(&event).await)
    }

    pub async fn ingest_bytes(&self, raw: &[u8]) -> Result<Ingested, DecodeError> {
        let event = self.checked(parser::decode_bytes(raw))?;
        Ok(self.route(&event).await)
    }

    fn checked(&self, decoded: Result<PacketEvent, DecodeError>) -> Result<PacketEvent, DecodeError> {
        if decoded.is_err() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        decoded
    }

    /// Writes the event to the global log and to the log of every IP it
    /// involves, then folds it into the statistics. A failed write only
    /// drops the record for that one target.
    pub async fn route(&self, event: &PacketEvent) -> Ingested {
        // All targets of one event share a date.
        let date = Local::now().date_naive();
        let mut sink_failures = 0;

        let record = parser::encode(event);
        if let Err(e) = self.sink.append_on(&LogKey::Global, &record, date).await {
            warn!(key = %e.key(), error = %e, "sink_write_failed");
            sink_failures += 1;
        }
        for (ip, direction) in event.involved_ips() {
            let line = event.summary_line(direction);
            if let Err(e) = self.sink.append_on(&LogKey::ip(ip), &line, date).await {
                warn!(key = %e.key(), error = %e, "sink_write_failed");
                sink_failures += 1;
            }
        }

        let total_packets = self.stats.record(event);
        if let Some(publisher) = &self.snapshots {
            publisher.observe(total_packets);
        }
        Ingested {
            total_packets,
            sink_failures,
        }
    }
}
