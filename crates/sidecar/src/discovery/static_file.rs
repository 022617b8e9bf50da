//! Static-file discovery source — spec §4.1.2.
//!
//! Loads a JSON array of operator-declared targets from disk, each target
//! shaped `{Service:{…}, Check:{Type,Args}, ListenPort:int}` per spec
//! §4.1.2/§6. Every `Services()` call re-stamps `Updated` to now (the
//! source has no better signal than "still present in the file");
//! `Created` and the synthetic ID are assigned once, the first time a
//! target is seen, and cached for the life of the process.
//!
//! Grounded on `crates/agent/src/config.rs`'s file-then-env load pattern
//! and `crates/cluster/src/agent/discovery.rs`'s synthesized-ID approach;
//! `rand` is pulled in fresh here (present elsewhere in the pack, e.g.
//! `marlonsc-mcb`) since the teacher never needed to mint its own IDs.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use crate::looper::{ForeverLooper, Looper};
use crate::service::{ChangeListenerTarget, Port, PortType, ProxyMode, Service, ServiceStatus};

use super::{DiscoveryError, DiscoverySource, HealthCheckAdvice};

#[derive(Debug, Error)]
pub enum StaticFileError {
    #[error("reading target file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing target file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single exposed port as it appears nested under a target's `Service`
/// object — field casing matches the documented file format (spec §6),
/// independent of [`Port`]'s own internal wire representation.
#[derive(Debug, Clone, Deserialize)]
struct StaticPortDef {
    #[serde(rename = "Type")]
    kind: PortType,
    #[serde(rename = "Port")]
    port: i32,
    #[serde(rename = "ServicePort")]
    service_port: i32,
    #[serde(default, rename = "IP")]
    ip: Option<String>,
}

impl From<StaticPortDef> for Port {
    fn from(p: StaticPortDef) -> Self {
        Port {
            kind: p.kind,
            port: p.port,
            service_port: p.service_port,
            ip: p.ip,
        }
    }
}

/// The nested `Service` object of a target (spec §4.1.2, §6).
#[derive(Debug, Clone, Deserialize)]
struct StaticServiceDef {
    #[serde(rename = "Name")]
    name: String,
    #[serde(default, rename = "Image")]
    image: String,
    #[serde(default, rename = "Hostname")]
    hostname: Option<String>,
    #[serde(default, rename = "Ports")]
    ports: Vec<StaticPortDef>,
    #[serde(default, rename = "ProxyMode")]
    proxy_mode: ProxyMode,
    #[serde(default, rename = "Labels")]
    labels: HashMap<String, String>,
}

/// The nested `Check` object of a target (spec §4.1.2, §6): `{Type, Args}`.
#[derive(Debug, Clone, Default, Deserialize)]
struct StaticCheckDef {
    #[serde(default, rename = "Type")]
    check_type: String,
    #[serde(default, rename = "Args")]
    args: String,
}

/// One operator-declared target, as it appears in the JSON target file:
/// `{Service:{…}, Check:{Type,Args}, ListenPort:int}` (spec §4.1.2, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct StaticTarget {
    #[serde(rename = "Service")]
    service: StaticServiceDef,
    #[serde(default, rename = "Check")]
    check: StaticCheckDef,
    #[serde(default, rename = "ListenPort")]
    listen_port: i32,
}

struct Stamped {
    id: String,
    created: chrono::DateTime<Utc>,
}

fn random_short_id() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}

struct Inner {
    path: String,
    default_hostname: String,
    default_ip: String,
    advertise_ip: String,
    poll_interval: Duration,
    targets: DashMap<String, StaticTarget>,
    stamps: DashMap<String, Stamped>,
}

/// Static-file-backed discovery source. A thin, cheaply-`Clone`able handle
/// — see [`super::container_runtime::ContainerRuntimeSource`] for the
/// rationale.
#[derive(Clone)]
pub struct StaticFileSource(Arc<Inner>);

impl StaticFileSource {
    pub fn new(
        path: impl Into<String>,
        default_hostname: impl Into<String>,
        default_ip: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self::with_advertise_ip(path, default_hostname, default_ip, "", poll_interval)
    }

    /// Like [`StaticFileSource::new`], but `Listeners()` URLs are built
    /// from `advertise_ip` instead of each target's hostname when it is
    /// non-empty (spec §6 `advertiseIp`).
    pub fn with_advertise_ip(
        path: impl Into<String>,
        default_hostname: impl Into<String>,
        default_ip: impl Into<String>,
        advertise_ip: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self(Arc::new(Inner {
            path: path.into(),
            default_hostname: default_hostname.into(),
            default_ip: default_ip.into(),
            advertise_ip: advertise_ip.into(),
            poll_interval,
            targets: DashMap::new(),
            stamps: DashMap::new(),
        }))
    }

    fn load_targets(&self) -> Result<(), StaticFileError> {
        let contents = fs::read_to_string(&self.0.path).map_err(|e| StaticFileError::Read {
            path: self.0.path.clone(),
            source: e,
        })?;
        let parsed: Vec<StaticTarget> = serde_json::from_str(&contents).map_err(|e| StaticFileError::Parse {
            path: self.0.path.clone(),
            source: e,
        })?;

        let mut seen = std::collections::HashSet::new();
        for target in parsed {
            seen.insert(target.service.name.clone());
            self.0.targets.insert(target.service.name.clone(), target);
        }
        self.0.targets.retain(|name, _| seen.contains(name));
        self.0.stamps.retain(|name, _| seen.contains(name));
        Ok(())
    }

    fn stamp_for(&self, name: &str) -> Stamped {
        if let Some(existing) = self.0.stamps.get(name) {
            return Stamped {
                id: existing.id.clone(),
                created: existing.created,
            };
        }
        let stamped = Stamped {
            id: random_short_id(),
            created: Utc::now(),
        };
        self.0.stamps.insert(
            name.to_string(),
            Stamped {
                id: stamped.id.clone(),
                created: stamped.created,
            },
        );
        stamped
    }

    fn to_service(&self, target: &StaticTarget) -> Service {
        let stamp = self.stamp_for(&target.service.name);
        let hostname = target
            .service
            .hostname
            .clone()
            .unwrap_or_else(|| self.0.default_hostname.clone());
        let ports = target
            .service
            .ports
            .iter()
            .cloned()
            .map(Port::from)
            .map(|mut p| {
                if p.ip.is_none() && !self.0.default_ip.is_empty() {
                    p.ip = Some(self.0.default_ip.clone());
                }
                p
            })
            .collect();
        Service {
            id: stamp.id,
            hostname,
            name: target.service.name.clone(),
            image: target.service.image.clone(),
            created: stamp.created,
            updated: Utc::now(),
            ports,
            proxy_mode: target.service.proxy_mode,
            status: ServiceStatus::Alive,
            labels: target.service.labels.clone(),
        }
    }

    async fn refresh(&self) -> Result<(), DiscoveryError> {
        self.load_targets()
            .map_err(|e| DiscoveryError::Config(e.to_string()))
    }
}

impl DiscoverySource for StaticFileSource {
    fn services(&self) -> Vec<Service> {
        self.0
            .targets
            .iter()
            .map(|entry| self.to_service(entry.value()))
            .collect()
    }

    fn health_check(&self, svc: &Service) -> HealthCheckAdvice {
        for entry in self.0.targets.iter() {
            let stamp = self.0.stamps.get(&entry.key().clone());
            if let Some(stamp) = stamp {
                if stamp.id == svc.id && !entry.value().check.check_type.is_empty() {
                    return HealthCheckAdvice {
                        check_type: entry.value().check.check_type.clone(),
                        args: entry.value().check.args.clone(),
                    };
                }
            }
        }
        HealthCheckAdvice::none()
    }

    fn listeners(&self) -> Vec<ChangeListenerTarget> {
        self.0
            .targets
            .iter()
            .filter(|entry| entry.value().listen_port > 0)
            .map(|entry| {
                let target = entry.value();
                let host = if !self.0.advertise_ip.is_empty() {
                    self.0.advertise_ip.clone()
                } else {
                    target
                        .service
                        .hostname
                        .clone()
                        .unwrap_or_else(|| self.0.default_hostname.clone())
                };
                ChangeListenerTarget {
                    name: target.service.name.clone(),
                    url: format!("http://{}:{}/sidecar/update", host, target.listen_port),
                }
            })
            .collect()
    }

    fn run(&self, quit_rx: watch::Receiver<bool>) {
        let source = self.clone();
        tokio::spawn(async move {
            let mut looper = ForeverLooper::with_receiver(source.0.poll_interval, quit_rx);
            let this = source.clone();
            looper
                .run(move || {
                    let this = this.clone();
                    async move {
                        if let Err(e) = this.refresh().await {
                            warn!("static-file: refresh failed: {}", e);
                        }
                    }
                })
                .await;
        });
    }
}
