//! Container-runtime discovery source — spec §4.1.1.
//!
//! Polls the local container runtime for running containers, derives a
//! stable name via a [`ServiceNamer`], and atomically replaces the
//! in-memory service list. Concurrently subscribes to the runtime's event
//! stream to prune services on `die`/`stop` events, self-healing the
//! subscription on ping failure.
//!
//! Grounded on `crates/agent/src/docker/client.rs` (connection setup,
//! `DockerError`), `crates/agent/src/docker/event.rs` (`stream_events`),
//! `crates/agent/src/docker/inventory.rs` (`ContainerInfo`/`PortMapping`
//! conversions), and `crates/agent/src/service/background.rs` (periodic
//! refresh + mark-and-sweep, reused here to prune the container-metadata
//! cache in lockstep with each list refresh).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::models::ContainerSummary;
use bollard::query_parameters::{EventsOptionsBuilder, ListContainersOptionsBuilder};
use bollard::Docker;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{ContainerCache, WHOLESALE_DRAIN_INTERVAL};
use crate::looper::{ForeverLooper, Looper};
use crate::namer::{ContainerFacts, ServiceNamer};
use crate::service::{ChangeListenerTarget, Port, PortType, ProxyMode, Service, ServiceStatus};

use super::{DiscoveryError, DiscoverySource, HealthCheckAdvice};

/// Label that, when present on a container, excludes it from discovery.
pub const DO_NOT_DISCOVER_LABEL: &str = "sidecar.do_not_discover";

#[derive(Debug, Error)]
pub enum ContainerRuntimeError {
    #[error("container runtime connection failed: {0}")]
    ConnectionFailed(String),
}

/// Cheap, cloneable metadata used when deriving a health-check default
/// (the service's reported health-check label, if any).
#[derive(Debug, Clone, Default)]
struct InspectedMeta {
    health_check_type: String,
    health_check_args: String,
}

struct Inner {
    docker: Docker,
    namer: Arc<dyn ServiceNamer>,
    hostname: String,
    services: DashMap<String, Service>,
    inspect_cache: ContainerCache<InspectedMeta>,
    poll_interval: Duration,
}

/// Container-runtime-backed discovery source.
///
/// A thin, cheaply-`Clone`able handle around the shared state — clones
/// share the same underlying cache and connection, letting `run` move
/// independent clones into its three background tasks without requiring
/// callers to wrap the whole source in an `Arc` themselves.
#[derive(Clone)]
pub struct ContainerRuntimeSource(Arc<Inner>);

impl ContainerRuntimeSource {
    pub fn new(
        docker: Docker,
        namer: Arc<dyn ServiceNamer>,
        hostname: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self(Arc::new(Inner {
            docker,
            namer,
            hostname: hostname.into(),
            services: DashMap::new(),
            inspect_cache: ContainerCache::new(),
            poll_interval,
        }))
    }

    pub fn connect(
        socket_path: &str,
        namer: Arc<dyn ServiceNamer>,
        hostname: impl Into<String>,
    ) -> Result<Self, ContainerRuntimeError> {
        let docker = if socket_path.is_empty() {
            Docker::connect_with_local_defaults()
        } else {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| ContainerRuntimeError::ConnectionFailed(e.to_string()))?;

        Ok(Self::new(docker, namer, hostname, Duration::from_secs(5)))
    }

    fn to_service(&self, summary: &ContainerSummary) -> Option<Service> {
        let id = summary.id.clone()?;
        let labels = summary.labels.clone().unwrap_or_default();
        if labels.contains_key(DO_NOT_DISCOVER_LABEL) {
            return None;
        }

        let first_name = summary
            .names
            .as_deref()
            .and_then(|n| n.first())
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or("unknown");
        let image = summary.image.clone().unwrap_or_default();

        let facts = ContainerFacts {
            first_name,
            image: &image,
            labels: &labels,
        };
        let name = self.0.namer.name(&facts);

        let ports: Vec<Port> = summary
            .ports
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| {
                let host_port = p.public_port?;
                let kind = match p.typ {
                    Some(bollard::models::PortTypeEnum::UDP) => PortType::Udp,
                    _ => PortType::Tcp,
                };
                Some(Port {
                    kind,
                    port: host_port as i32,
                    service_port: p.private_port as i32,
                    ip: p.ip,
                })
            })
            .collect();

        let now = Utc::now();
        Some(Service {
            id,
            hostname: self.0.hostname.clone(),
            name,
            image,
            created: now,
            updated: now,
            ports,
            proxy_mode: ProxyMode::Http,
            status: ServiceStatus::Alive,
            labels,
        })
    }

    /// One discovery cycle: list containers, replace the in-memory table,
    /// prune the inspect cache in lockstep (spec §4.1.1, §4.2).
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        let options = ListContainersOptionsBuilder::default().all(false).build();
        let containers = self
            .0
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| DiscoveryError::Transient(e.to_string()))?;

        let mut live_ids = std::collections::HashSet::new();
        let mut fresh: HashMap<String, Service> = HashMap::new();
        for summary in &containers {
            if let Some(svc) = self.to_service(summary) {
                live_ids.insert(svc.id.clone());
                fresh.insert(svc.id.clone(), svc);
            }
        }

        for (id, svc) in fresh {
            self.0.services.insert(id, svc);
        }
        self.0.services.retain(|id, _| live_ids.contains(id));
        self.0.inspect_cache.prune(&live_ids);

        Ok(())
    }

    /// Remove a service whose short-ID prefix (first 12 chars) matches
    /// `event_id` (spec §4.1.1).
    fn prune_by_event_id(&self, event_id: &str) {
        let prefix = &event_id[..event_id.len().min(12)];
        let matched: Vec<String> = self
            .0
            .services
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        for id in matched {
            info!("container-runtime: removing service {} (die/stop event)", id);
            self.0.services.remove(&id);
        }
    }

    /// Inspect a single container to derive health-check advice, caching
    /// the result under `ServiceID`. A failed inspect yields empty advice
    /// for that service (spec §4.1.1 failure model).
    async fn inspect_for_health_check(&self, id: &str) -> HealthCheckAdvice {
        if let Some(meta) = self.0.inspect_cache.get(id) {
            return HealthCheckAdvice {
                check_type: meta.health_check_type,
                args: meta.health_check_args,
            };
        }

        match self
            .0
            .docker
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let labels = details
                    .config
                    .as_ref()
                    .and_then(|c| c.labels.clone())
                    .unwrap_or_default();
                let meta = InspectedMeta {
                    health_check_type: labels.get("sidecar.check.type").cloned().unwrap_or_default(),
                    health_check_args: labels.get("sidecar.check.args").cloned().unwrap_or_default(),
                };
                self.0.inspect_cache.set(id.to_string(), meta.clone());
                HealthCheckAdvice {
                    check_type: meta.health_check_type,
                    args: meta.health_check_args,
                }
            }
            Err(e) => {
                warn!("container-runtime: inspect failed for {}: {}", id, e);
                HealthCheckAdvice::none()
            }
        }
    }

    /// Event-stream reader: self-healing subscription with liveness ping.
    /// On ping failure, closes the old channel before re-subscribing
    /// against a fresh one (spec §9 "race on source events channel").
    async fn run_event_reader(self, mut quit_rx: watch::Receiver<bool>) {
        loop {
            if *quit_rx.borrow() {
                return;
            }

            if self.0.docker.ping().await.is_err() {
                warn!("container-runtime: ping failed, backing off before re-subscribing");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    _ = quit_rx.changed() => {
                        if *quit_rx.borrow() { return; }
                    }
                }
                continue;
            }

            let options = EventsOptionsBuilder::default()
                .filters(&HashMap::from([("type", vec!["container"])]))
                .build();
            let mut stream = self.0.docker.events(Some(options));

            loop {
                tokio::select! {
                    next = stream.next() => {
                        match next {
                            Some(Ok(event)) => {
                                let action = event.action.as_deref().unwrap_or_default();
                                if action == "die" || action == "stop" {
                                    if let Some(actor) = &event.actor {
                                        if let Some(id) = &actor.id {
                                            self.prune_by_event_id(id);
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                error!("container-runtime: event stream error: {}", e);
                                break;
                            }
                            None => {
                                // runtime bounced; backoff and re-read (spec §9)
                                debug!("container-runtime: event stream closed, reconnecting");
                                break;
                            }
                        }
                    }
                    _ = quit_rx.changed() => {
                        if *quit_rx.borrow() { return; }
                    }
                }
            }
        }
    }

    async fn run_poll_loop(self, quit_rx: watch::Receiver<bool>) {
        let mut looper = ForeverLooper::with_receiver(self.0.poll_interval, quit_rx);
        let this = self.clone();
        looper
            .run(move || {
                let this = this.clone();
                async move {
                    if let Err(e) = this.refresh().await {
                        warn!("container-runtime: refresh failed: {}", e);
                    }
                }
            })
            .await;
    }

    async fn run_drain_loop(self, quit_rx: watch::Receiver<bool>) {
        let mut looper = ForeverLooper::with_receiver(WHOLESALE_DRAIN_INTERVAL, quit_rx);
        let this = self.clone();
        looper
            .run(move || {
                let this = this.clone();
                async move {
                    debug!("container-runtime: wholesale cache drain");
                    this.0.inspect_cache.drain_all();
                }
            })
            .await;
    }
}

impl DiscoverySource for ContainerRuntimeSource {
    fn services(&self) -> Vec<Service> {
        self.0.services.iter().map(|e| e.value().clone()).collect()
    }

    fn health_check(&self, svc: &Service) -> HealthCheckAdvice {
        // Synchronous capability surface, async inspect is a cache-warm
        // background concern; fall back to whatever is already cached.
        match self.0.inspect_cache.get(&svc.id) {
            Some(meta) if !meta.health_check_type.is_empty() => HealthCheckAdvice {
                check_type: meta.health_check_type,
                args: meta.health_check_args,
            },
            _ => HealthCheckAdvice::none(),
        }
    }

    fn listeners(&self) -> Vec<ChangeListenerTarget> {
        Vec::new()
    }

    fn run(&self, quit_rx: watch::Receiver<bool>) {
        let poll_source = self.clone();
        let poll_quit = quit_rx.clone();
        tokio::spawn(async move { poll_source.run_poll_loop(poll_quit).await });

        let event_source = self.clone();
        let event_quit = quit_rx.clone();
        tokio::spawn(async move { event_source.run_event_reader(event_quit).await });

        let drain_source = self.clone();
        tokio::spawn(async move { drain_source.run_drain_loop(quit_rx).await });

        // Warm the inspect cache for services lacking advice, best-effort.
        let warm_source = self.clone();
        tokio::spawn(async move {
            for svc in warm_source.services() {
                let _ = warm_source.inspect_for_health_check(&svc.id).await;
            }
        });
    }
}
