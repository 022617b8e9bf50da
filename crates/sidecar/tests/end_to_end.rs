//! Cross-module end-to-end scenarios — spec.md §8.
//!
//! Unlike the colocated `#[cfg(test)]` modules (which exercise one
//! component in isolation), these drive several components together the
//! way `main.rs` wires them: discovery -> health monitor -> catalog ->
//! snapshotter rendering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sidecar::catalog::InMemoryCatalog;
use sidecar::discovery::multi::MultiSource;
use sidecar::discovery::{DiscoverySource, HealthCheckAdvice};
use sidecar::health::Monitor;
use sidecar::service::{ChangeListenerTarget, Port, PortType, ProxyMode, Service, ServiceStatus};
use sidecar::snapshotter::render::render_resources;
use tokio::sync::watch;

struct StubSource {
    services: Vec<Service>,
    advice: HealthCheckAdvice,
}

impl DiscoverySource for StubSource {
    fn services(&self) -> Vec<Service> {
        self.services.clone()
    }

    fn health_check(&self, _svc: &Service) -> HealthCheckAdvice {
        self.advice.clone()
    }

    fn listeners(&self) -> Vec<ChangeListenerTarget> {
        Vec::new()
    }

    fn run(&self, _quit_rx: watch::Receiver<bool>) {}
}

fn service(id: &str, name: &str, ports: Vec<Port>) -> Service {
    let now = Utc::now();
    Service {
        id: id.to_string(),
        hostname: "node-a".to_string(),
        name: name.to_string(),
        image: "img".to_string(),
        created: now,
        updated: now,
        ports,
        proxy_mode: ProxyMode::Http,
        status: ServiceStatus::Alive,
        labels: HashMap::new(),
    }
}

/// Scenario 1 (spec §8): two sources concatenate in registration order and
/// `HealthCheck` falls back to "no opinion" for a service neither source
/// recognizes.
#[test]
fn multi_source_aggregation() {
    let a = Arc::new(StubSource {
        services: vec![service("1", "svc1", vec![])],
        advice: HealthCheckAdvice {
            check_type: "one".to_string(),
            args: String::new(),
        },
    });
    let b = Arc::new(StubSource {
        services: vec![service("2", "svc2", vec![])],
        advice: HealthCheckAdvice::none(),
    });
    let multi = MultiSource::new(vec![a as Arc<dyn DiscoverySource>, b as Arc<dyn DiscoverySource>]);

    let names: Vec<String> = multi.services().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["svc1".to_string(), "svc2".to_string()]);

    let advice = multi.health_check(&service("1", "svc1", vec![]));
    assert_eq!(advice.check_type, "one");

    let unknown = multi.health_check(&service("unknown", "nope", vec![]));
    assert!(unknown.is_none());
}

/// Scenario 2 + 3 (spec §8): hysteresis under `MaxCount`, then recovery to
/// `HEALTHY` resets `Count` to zero — driven through the real monitor
/// `tick`/`reconcile` pair, not the transition function directly.
#[tokio::test]
async fn hysteresis_then_recovery_through_real_tick() {
    let outcome = Arc::new(Mutex::new("sickly".to_string()));
    let backing = outcome.clone();

    struct ToggleSource {
        outcome: Arc<Mutex<String>>,
    }
    impl DiscoverySource for ToggleSource {
        fn services(&self) -> Vec<Service> {
            vec![service("flaky", "flaky-svc", vec![])]
        }
        fn health_check(&self, _svc: &Service) -> HealthCheckAdvice {
            let program = if *self.outcome.lock().unwrap() == "sickly" { "false" } else { "true" };
            HealthCheckAdvice {
                check_type: "External".to_string(),
                args: program.to_string(),
            }
        }
        fn listeners(&self) -> Vec<ChangeListenerTarget> {
            Vec::new()
        }
        fn run(&self, _quit_rx: watch::Receiver<bool>) {}
    }

    let source: Arc<dyn DiscoverySource> = Arc::new(ToggleSource { outcome: backing });
    let monitor = Monitor::new(source, Duration::from_millis(200), "127.0.0.1", "/");

    monitor.reconcile().await;
    monitor.tick().await;
    monitor.tick().await;

    let services = monitor.services();
    assert_eq!(services[0].status, ServiceStatus::Unhealthy);

    *outcome.lock().unwrap() = "healthy".to_string();
    monitor.tick().await;

    let services = monitor.services();
    assert_eq!(services[0].status, ServiceStatus::Alive);
}

/// Scenario 6 (spec §8): catalog -> render pipeline. Adding a second
/// instance grows the cluster's endpoint set; tombstoning both drops the
/// listener and cluster entirely.
#[tokio::test]
async fn proxy_snapshot_after_add_and_tombstone() {
    let catalog = InMemoryCatalog::new("node-a");

    let first = service(
        "1",
        "bocaccio",
        vec![Port {
            kind: PortType::Tcp,
            port: 9990,
            service_port: 10100,
            ip: Some("127.0.0.1".to_string()),
        }],
    );
    catalog.add_service_entry(first).await;

    let by_service = catalog.by_service().await;
    let resources = render_resources(&by_service, "0.0.0.0", false);
    let cluster = resources
        .iter()
        .find_map(|r| match &r.kind {
            Some(sidecar::snapshotter::proto::resource::Kind::Cluster(c)) => Some(c.clone()),
            _ => None,
        })
        .expect("cluster rendered");
    assert_eq!(cluster.name, "bocaccio:10100");
    assert_eq!(cluster.endpoints.len(), 1);

    let second = service(
        "2",
        "bocaccio",
        vec![Port {
            kind: PortType::Tcp,
            port: 9991,
            service_port: 10100,
            ip: Some("127.0.0.1".to_string()),
        }],
    );
    catalog.add_service_entry(second).await;

    let by_service = catalog.by_service().await;
    let resources = render_resources(&by_service, "0.0.0.0", false);
    let cluster = resources
        .iter()
        .find_map(|r| match &r.kind {
            Some(sidecar::snapshotter::proto::resource::Kind::Cluster(c)) => Some(c.clone()),
            _ => None,
        })
        .expect("cluster rendered");
    assert_eq!(cluster.endpoints.len(), 2);

    catalog.expire_server("node-a").await;
    let by_service = catalog.by_service().await;
    let resources = render_resources(&by_service, "0.0.0.0", false);
    assert!(resources.is_empty());
}
