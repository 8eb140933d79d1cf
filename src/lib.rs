//! Ingestion server for packet-observation events.
//!
//! Producers stream JSON records over WebSocket. Every accepted record is
//! appended to a global log and to one log per involved IP, folded into
//! running statistics, and periodically exported as a snapshot.

pub mod config;
pub mod error;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod session;
pub mod sink;
pub mod snapshot;
pub mod stats;
pub mod status;

pub use error::{DecodeError, SessionError, SinkError, StartupError};
pub use models::{PacketEvent, Ports};
pub use pipeline::Pipeline;
pub use session::{LiveSessions, SessionManager};
pub use sink::{LogKey, LogSink, RotationPolicy};
pub use snapshot::{SnapshotPublisher, SnapshotSettings};
pub use stats::{Aggregator, Dimension};
