//! Catalog capability — the external collaborator specified at its
//! interface only (spec §6). The gossip/replication behavior behind a
//! real catalog is out of scope (spec.md Non-goals: "no durable storage",
//! "no authentication of peers", "no guarantee of causal consistency
//! across peers beyond what the catalog provides").
//!
//! [`InMemoryCatalog`] is a minimal reference implementation — just
//! enough for the discovery pipeline, health monitor, and snapshotter to
//! run against something real in the example binary and in tests. It is
//! explicitly not a gossip implementation.
//!
//! Grounded on `crates/cluster/src/state.rs::AppState` (one shared,
//! `Arc`-cloneable state struct) and the `RwLock` usage pattern in
//! `crates/cluster/src/agent/pool.rs::AgentConnection::last_seen`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};

use crate::service::{Service, ServiceStatus};

/// A change notification delivered to catalog subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub hostname: String,
}

/// A subscriber to catalog change events — the snapshotter is the only
/// consumer in this crate, but the capability itself is generic.
pub struct CatalogListener {
    name: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl CatalogListener {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The catalog never owns this listener's lifecycle — callers poll
    /// via this method and are free to drop it at any time. Represented
    /// as a plain `recv`, not a fused channel, matching the "weak
    /// reference: name + channel" design in spec.md §9.
    pub async fn recv(&mut self) -> Result<ChangeEvent, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

struct Inner {
    hostname: String,
    services: HashMap<String, Service>,
    last_changed: DateTime<Utc>,
}

/// Minimal in-process reference implementation of the `Catalog`
/// capability consumed by the core (spec §6).
pub struct InMemoryCatalog {
    inner: RwLock<Inner>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl InMemoryCatalog {
    pub fn new(hostname: impl Into<String>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(100);
        Arc::new(Self {
            inner: RwLock::new(Inner {
                hostname: hostname.into(),
                services: HashMap::new(),
                last_changed: Utc::now(),
            }),
            changes,
        })
    }

    pub async fn hostname(&self) -> String {
        self.inner.read().await.hostname.clone()
    }

    pub async fn last_changed(&self) -> DateTime<Utc> {
        self.inner.read().await.last_changed
    }

    /// Group every known, non-tombstoned service by `Service.name`.
    pub async fn by_service(&self) -> HashMap<String, Vec<Service>> {
        let inner = self.inner.read().await;
        let mut grouped: HashMap<String, Vec<Service>> = HashMap::new();
        for svc in inner.services.values() {
            if svc.status == ServiceStatus::Tombstone {
                continue;
            }
            grouped.entry(svc.name.clone()).or_default().push(svc.clone());
        }
        grouped
    }

    /// Merge `svc` into the catalog, resolving concurrent writes via
    /// `Service::invalidates`.
    pub async fn add_service_entry(&self, svc: Service) {
        let hostname = {
            let mut inner = self.inner.write().await;
            let should_write = match inner.services.get(&svc.id) {
                Some(existing) => svc.invalidates(existing),
                None => true,
            };
            if should_write {
                inner.services.insert(svc.id.clone(), svc);
                inner.last_changed = Utc::now();
            }
            inner.hostname.clone()
        };
        let _ = self.changes.send(ChangeEvent { hostname });
    }

    /// Mark every service owned by `hostname` as a tombstone.
    pub async fn expire_server(&self, hostname: &str) {
        let local_hostname = {
            let mut inner = self.inner.write().await;
            let mut changed = false;
            for svc in inner.services.values_mut() {
                if svc.hostname == hostname && svc.status != ServiceStatus::Tombstone {
                    svc.status = ServiceStatus::Tombstone;
                    svc.updated = Utc::now();
                    changed = true;
                }
            }
            if changed {
                inner.last_changed = Utc::now();
            }
            inner.hostname.clone()
        };
        let _ = self.changes.send(ChangeEvent {
            hostname: local_hostname,
        });
    }

    /// Subscribe to change events under a given listener name.
    pub fn add_listener(&self, name: impl Into<String>) -> CatalogListener {
        CatalogListener {
            name: name.into(),
            rx: self.changes.subscribe(),
        }
    }
}
