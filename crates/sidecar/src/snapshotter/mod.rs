//! Proxy snapshotter — spec §4.6.
//!
//! Polls the catalog on a timer, renders listeners/clusters whenever
//! `LastChanged` has moved since the last successful render (Open
//! Question resolved in `DESIGN.md`: poll-and-compare, not a push
//! subscription, even though [`crate::catalog::CatalogListener`] exists
//! and is used to wake the loop early), and publishes the result through
//! a [`SnapshotCache`] that the streaming RPC server reads from.
//!
//! Grounded on the split between `crates/agent/src/service/background.rs`
//! (periodic reconciliation loop) and `crates/agent/src/service/mod.rs`'s
//! `pub mod proto { tonic::include_proto!(...) }` convention.

pub mod render;
pub mod xds;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::catalog::InMemoryCatalog;
use crate::looper::{ForeverLooper, Looper};

pub mod proto {
    tonic::include_proto!("sidecar.snapshot");
}

/// A rendered resource set plus the opaque version token that identifies
/// it on the wire.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: String,
    pub resources: Vec<proto::Resource>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            version: "0".to_string(),
            resources: Vec::new(),
        }
    }
}

/// Holds the latest snapshot for every node this process has ever
/// rendered or been asked for, and wakes streaming RPC handlers when a
/// new one lands.
pub struct SnapshotCache {
    entries: DashMap<String, watch::Sender<Arc<Snapshot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Publishes `snapshot` for `hostname`. Per spec §4.6: on error, log
    /// and continue — there being no receiver yet is not an error, since
    /// the value is retained for the next subscriber regardless.
    pub fn set_snapshot(&self, hostname: &str, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        match self.entries.get(hostname) {
            Some(tx) => {
                let _ = tx.send(snapshot);
            }
            None => {
                let (tx, _rx) = watch::channel(snapshot);
                self.entries.insert(hostname.to_string(), tx);
            }
        }
    }

    /// Subscribes to snapshots for `hostname`, creating an empty baseline
    /// entry if none exists yet so the subscription can never fail.
    pub fn subscribe(&self, hostname: &str) -> watch::Receiver<Arc<Snapshot>> {
        self.entries
            .entry(hostname.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = watch::channel(Arc::new(Snapshot::empty()));
                tx
            })
            .subscribe()
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A time-based, monotonically-increasing version token (spec §9: "a
/// nanosecond-resolution wall-clock counter is sufficient; strict
/// per-process monotonicity isn't required by any tested property").
fn next_version() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string()
}

struct Inner {
    catalog: Arc<InMemoryCatalog>,
    cache: Arc<SnapshotCache>,
    bind_ip: String,
    use_hostnames: bool,
    update_interval: Duration,
}

/// Owns the render loop and the snapshot cache it feeds.
#[derive(Clone)]
pub struct Server(Arc<Inner>);

impl Server {
    pub fn new(
        catalog: Arc<InMemoryCatalog>,
        bind_ip: impl Into<String>,
        use_hostnames: bool,
        update_interval: Duration,
    ) -> Self {
        Self(Arc::new(Inner {
            catalog,
            cache: Arc::new(SnapshotCache::new()),
            bind_ip: bind_ip.into(),
            use_hostnames,
            update_interval,
        }))
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        self.0.cache.clone()
    }

    /// Re-renders and republishes the snapshot if the catalog has
    /// changed since the last successful render.
    async fn update_once(&self, last_seen: &std::sync::Mutex<Option<chrono::DateTime<chrono::Utc>>>) {
        let last_changed = self.0.catalog.last_changed().await;
        if *last_seen.lock().unwrap() == Some(last_changed) {
            return;
        }

        let hostname = self.0.catalog.hostname().await;
        let by_service = self.0.catalog.by_service().await;
        let resources = render::render_resources(&by_service, &self.0.bind_ip, self.0.use_hostnames);

        self.0.cache.set_snapshot(
            &hostname,
            Snapshot {
                version: next_version(),
                resources,
            },
        );
        *last_seen.lock().unwrap() = Some(last_changed);
    }

    /// Spawns the periodic render loop: `LastChanged` is polled and
    /// compared against the last successfully rendered timestamp, rather
    /// than driven off the catalog's own change-notification channel
    /// (both are valid per spec; this is the variant that composes with
    /// `tokio::time::interval` the way `background.rs`/`registry.rs` do
    /// throughout the teacher).
    pub fn run(&self, quit_rx: watch::Receiver<bool>) {
        let last_seen = Arc::new(std::sync::Mutex::new(None));

        let server = self.clone();
        tokio::spawn(async move {
            let mut looper = ForeverLooper::with_receiver(server.0.update_interval, quit_rx);
            looper
                .run(|| {
                    let server = server.clone();
                    let last_seen = last_seen.clone();
                    async move { server.update_once(&last_seen).await }
                })
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Port, PortType, ProxyMode, Service, ServiceStatus};
    use std::collections::HashMap as Map;

    fn alive_service() -> Service {
        let now = chrono::Utc::now();
        Service {
            id: "1".into(),
            hostname: "node-a".into(),
            name: "bocaccio".into(),
            image: "bocaccio:latest".into(),
            created: now,
            updated: now,
            ports: vec![Port {
                kind: PortType::Tcp,
                port: 9990,
                service_port: 10100,
                ip: Some("127.0.0.1".to_string()),
            }],
            proxy_mode: ProxyMode::Http,
            status: ServiceStatus::Alive,
            labels: Map::new(),
        }
    }

    #[tokio::test]
    async fn update_once_publishes_snapshot_on_catalog_change() {
        let catalog = InMemoryCatalog::new("node-a");
        let server = Server::new(catalog.clone(), "0.0.0.0", false, Duration::from_secs(60));
        let last_seen = std::sync::Mutex::new(None);

        catalog.add_service_entry(alive_service()).await;
        server.update_once(&last_seen).await;

        let mut rx = server.cache().subscribe("node-a");
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.resources.len(), 2);
    }

    #[tokio::test]
    async fn update_once_is_a_noop_when_catalog_is_unchanged() {
        let catalog = InMemoryCatalog::new("node-a");
        let server = Server::new(catalog.clone(), "0.0.0.0", false, Duration::from_secs(60));
        let last_seen = std::sync::Mutex::new(None);

        catalog.add_service_entry(alive_service()).await;
        server.update_once(&last_seen).await;
        let mut rx = server.cache().subscribe("node-a");
        let first_version = rx.borrow_and_update().version.clone();

        server.update_once(&last_seen).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(rx.borrow().version, first_version);
    }

    #[tokio::test]
    async fn subscribing_to_an_unknown_hostname_yields_empty_baseline() {
        let catalog = InMemoryCatalog::new("node-a");
        let server = Server::new(catalog, "0.0.0.0", false, Duration::from_secs(60));

        let mut rx = server.cache().subscribe("node-b");
        let snapshot = rx.borrow_and_update().clone();
        assert!(snapshot.resources.is_empty());
    }
}
