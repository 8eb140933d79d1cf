use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::pipeline::Pipeline;
use crate::session::LiveSessions;
use crate::stats::Dimension;

/// Periodic one-line view of the server: totals, rates and the busiest protocol.
pub fn spawn_status_logger(
    pipeline: Arc<Pipeline>,
    live: Arc<LiveSessions>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = StatusLine::read(&pipeline, &live);
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    let now = StatusLine::read(&pipeline, &live);
                    let secs = period.as_secs_f64().max(0.001);
                    info!(target: "traffic_status",
                        total_packets = now.packets,
                        total_bytes = now.bytes,
                        rejected = now.rejected,
                        active_sessions = now.sessions,
                        packets_rate = now.packets.saturating_sub(last.packets) as f64 / secs,
                        top_protocol = %now.top_protocol,
                        "status"
                    );
                    last = now;
                }
            }
        }
    })
}

struct StatusLine {
    packets: u64,
    bytes: u64,
    rejected: u64,
    sessions: usize,
    top_protocol: String,
}

impl StatusLine {
    fn read(pipeline: &Pipeline, live: &LiveSessions) -> Self {
        let stats = pipeline.stats();
        let top_protocol = stats
            .top_n(Dimension::Protocol, 1)
            .into_iter()
            .next()
            .map(|e| format!("{}({})", e.value, e.count))
            .unwrap_or_else(|| "-".to_string());
        Self {
            packets: stats.total_packets(),
            bytes: stats.total_bytes(),
            rejected: pipeline.rejected(),
            sessions: live.len(),
            top_protocol,
        }
    }
}
