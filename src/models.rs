use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One observed network packet as reported by a capture agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketEvent {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub timestamp: Value,
    pub protocol: String,
    pub source_ip: String,
    pub dest_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Ports>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ports {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<u16>,
}

/// Which side of an event a per-IP log line is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
    Loopback,
}

impl Direction {
    pub fn marker(self) -> &'static str {
        match self {
            Direction::Outbound => "OUT",
            Direction::Inbound => "IN",
            Direction::Loopback => "SELF",
        }
    }
}

impl PacketEvent {
    /// Ports that feed the combined port histogram, source first.
    pub fn port_values(&self) -> impl Iterator<Item = u16> {
        let ports = self.ports.unwrap_or_default();
        ports.source_port.into_iter().chain(ports.dest_port)
    }

    /// The IPs this event is logged under, each paired with its direction.
    /// An event whose source and destination match is logged once.
    pub fn involved_ips(&self) -> Vec<(&str, Direction)> {
        if self.source_ip == self.dest_ip {
            vec![(self.source_ip.as_str(), Direction::Loopback)]
        } else {
            vec![
                (self.source_ip.as_str(), Direction::Outbound),
                (self.dest_ip.as_str(), Direction::Inbound),
            ]
        }
    }

    /// Human-readable line for the per-IP traffic log.
    pub fn summary_line(&self, direction: Direction) -> String {
        let counterpart = match direction {
            Direction::Inbound => &self.source_ip,
            Direction::Outbound | Direction::Loopback => &self.dest_ip,
        };
        let timestamp = match &self.timestamp {
            Value::String(s) => s.clone(),
            Value::Null => "-".to_string(),
            other => other.to_string(),
        };
        let ports = match self.ports {
            Some(p) => format!(
                "{}->{}",
                p.source_port.map_or_else(|| "-".to_string(), |v| v.to_string()),
                p.dest_port.map_or_else(|| "-".to_string(), |v| v.to_string()),
            ),
            None => "-".to_string(),
        };
        format!(
            "[{}] {} {} {} {}B ports={} data={}",
            timestamp,
            direction.marker(),
            counterpart,
            self.protocol,
            self.size,
            ports,
            self.data.as_deref().unwrap_or(""),
        )
    }
}
