//! Running traffic statistics shared by every session.
//!
//! Each dimension lives in its own sharded map so concurrent `record` calls
//! only contend when they touch the same shard of the same table.

use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::models::PacketEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Protocol,
    Source,
    Destination,
    Port,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Protocol,
        Dimension::Source,
        Dimension::Destination,
        Dimension::Port,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Dimension::Protocol => "protocols",
            Dimension::Source => "sources",
            Dimension::Destination => "destinations",
            Dimension::Port => "ports",
        }
    }
}

/// One `(value, count)` pair from a top-N view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountEntry {
    pub value: String,
    pub count: u64,
}

/// Frequency table for one dimension.
struct CounterTable<K: Eq + Hash> {
    counts: DashMap<K, u64>,
}

impl<K> CounterTable<K>
where
    K: Eq + Hash + Ord + Clone + Display,
{
    fn new() -> Self {
        Self {
            counts: DashMap::new(),
        }
    }

    fn increment(&self, key: K) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    fn get<Q>(&self, key: &Q) -> u64
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.counts.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Highest counts first, equal counts ordered by key ascending.
    fn top(&self, n: usize) -> Vec<CountEntry> {
        let mut rows: Vec<(K, u64)> = self
            .counts
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(n);
        rows.into_iter()
            .map(|(k, count)| CountEntry {
                value: k.to_string(),
                count,
            })
            .collect()
    }

    fn distinct(&self) -> usize {
        self.counts.len()
    }

    fn clear(&self) {
        self.counts.clear();
    }
}

pub struct Aggregator {
    protocols: CounterTable<String>,
    sources: CounterTable<String>,
    destinations: CounterTable<String>,
    ports: CounterTable<u16>,
    total_packets: AtomicU64,
    total_bytes: AtomicU64,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            protocols: CounterTable::new(),
            sources: CounterTable::new(),
            destinations: CounterTable::new(),
            ports: CounterTable::new(),
            total_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }

    /// Folds one event into every table and returns the new packet total.
    ///
    /// Source and destination ports share one histogram, so an event whose
    /// ports are equal bumps that port twice.
    pub fn record(&self, event: &PacketEvent) -> u64 {
        self.protocols.increment(event.protocol.clone());
        self.sources.increment(event.source_ip.clone());
        self.destinations.increment(event.dest_ip.clone());
        for port in event.port_values() {
            self.ports.increment(port);
        }
        self.total_bytes.fetch_add(event.size, Ordering::Relaxed);
        self.total_packets.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn top_n(&self, dimension: Dimension, n: usize) -> Vec<CountEntry> {
        match dimension {
            Dimension::Protocol => self.protocols.top(n),
            Dimension::Source => self.sources.top(n),
            Dimension::Destination => self.destinations.top(n),
            Dimension::Port => self.ports.top(n),
        }
    }

    pub fn protocol_count(&self, protocol: &str) -> u64 {
        self.protocols.get(protocol)
    }

    pub fn source_count(&self, ip: &str) -> u64 {
        self.sources.get(ip)
    }

    pub fn destination_count(&self, ip: &str) -> u64 {
        self.destinations.get(ip)
    }

    pub fn port_count(&self, port: u16) -> u64 {
        self.ports.get(&port)
    }

    pub fn distinct(&self, dimension: Dimension) -> usize {
        match dimension {
            Dimension::Protocol => self.protocols.distinct(),
            Dimension::Source => self.sources.distinct(),
            Dimension::Destination => self.destinations.distinct(),
            Dimension::Port => self.ports.distinct(),
        }
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Clears every table and total. Not used by the ingestion path.
    pub fn reset(&self) {
        self.protocols.clear();
        self.sources.clear();
        self.destinations.clear();
        self.ports.clear();
        self.total_packets.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
    }
}
