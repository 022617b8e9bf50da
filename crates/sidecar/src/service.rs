//! Service & port domain model — spec §3.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport used by an exposed [`Port`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Tcp,
    Udp,
}

/// Sentinel returned by [`Port::for_service_port`] when no port matches.
pub const NO_PORT: i32 = -1;

/// A single exposed port on a [`Service`].
///
/// `port` is the host-visible port; `service_port` is the logical port
/// advertised to clients (0 means "not advertised").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    #[serde(rename = "type")]
    pub kind: PortType,
    pub port: i32,
    pub service_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Find the host port whose `(service_port, type)` matches, or [`NO_PORT`].
pub fn port_for_service_port(ports: &[Port], service_port: i32, kind: PortType) -> i32 {
    ports
        .iter()
        .find(|p| p.service_port == service_port && p.kind == kind)
        .map(|p| p.port)
        .unwrap_or(NO_PORT)
}

/// How a service's listener should be programmed by the proxy data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Http,
    Tcp,
}

/// Health/lifecycle status of a [`Service`] as seen by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Alive,
    Tombstone,
    Unhealthy,
    #[default]
    Unknown,
}

/// Canonical record for a single discovered service instance.
///
/// Identity is `(id, hostname)`. `Invariant: updated >= created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub hostname: String,
    pub name: String,
    pub image: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub proxy_mode: ProxyMode,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Service {
    /// Whether `self` should win over `other` in a concurrent catalog
    /// merge. The newer write wins.
    pub fn invalidates(&self, other: &Service) -> bool {
        self.updated > other.updated
    }

    /// Convenience accessor mirroring [`port_for_service_port`].
    pub fn port_for_service_port(&self, service_port: i32, kind: PortType) -> i32 {
        port_for_service_port(&self.ports, service_port, kind)
    }

    /// The first TCP port, if any — used by the health-monitor's default
    /// check synthesis (spec §4.4.3).
    pub fn first_tcp_port(&self) -> Option<&Port> {
        self.ports.iter().find(|p| p.kind == PortType::Tcp)
    }
}

/// A local subscriber notified by HTTP POST when the catalog changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeListenerTarget {
    pub name: String,
    pub url: String,
}
