use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol for a port reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            _ => Err(format!("Unknown protocol: {}", s)),
        }
    }
}

/// Container-to-host port mapping declared by a ServerGameConfig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
}

impl PortBinding {
    pub fn new(container_port: u16, host_port: u16, protocol: Protocol) -> Self {
        Self {
            container_port,
            host_port,
            protocol,
        }
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(port, port, Protocol::Tcp)
    }

    pub fn udp(port: u16) -> Self {
        Self::new(port, port, Protocol::Udp)
    }
}

/// A reserved (server, port, protocol) triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPort {
    pub server_id: i64,
    pub port: u16,
    pub protocol: Protocol,
    pub session_id: i64,
    pub allocated_at: DateTime<Utc>,
}
