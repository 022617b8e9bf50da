//! Multi-source aggregator — spec §4.1.4.
//!
//! Fans out `Run` to every configured source and fans in `Services`,
//! `HealthCheck`, and `Listeners` across them, in the order sources were
//! registered.
//!
//! Grounded on `crates/cluster/src/agent/pool.rs::AgentPool` (holds a
//! collection of heterogeneous child handles) and the
//! `tokio::select!`-over-children shape in
//! `crates/cluster/src/agent/registry.rs::AgentRegistry::start_health_monitoring`,
//! generalized here to cascade shutdown to every child via a shared
//! `watch::Receiver<bool>`.

use std::sync::Arc;

use tokio::sync::watch;

use crate::service::{ChangeListenerTarget, Service};

use super::{DiscoverySource, HealthCheckAdvice};

/// Aggregates an ordered list of [`DiscoverySource`]s behind the same
/// capability.
///
/// `Services` concatenates each source's non-empty snapshot in
/// registration order; `HealthCheck` returns the first non-empty advice,
/// breaking ties by source order; `Listeners` concatenates. During
/// shutdown, `Services` keeps returning whatever was last observed
/// (best-effort) rather than emptying out from under the health monitor
/// mid-cascade (spec §9 "aggregator shutdown").
pub struct MultiSource {
    sources: Vec<Arc<dyn DiscoverySource>>,
}

impl MultiSource {
    pub fn new(sources: Vec<Arc<dyn DiscoverySource>>) -> Self {
        Self { sources }
    }
}

impl DiscoverySource for MultiSource {
    fn services(&self) -> Vec<Service> {
        let mut all = Vec::new();
        for source in &self.sources {
            let snapshot = source.services();
            if !snapshot.is_empty() {
                all.extend(snapshot);
            }
        }
        all
    }

    fn health_check(&self, svc: &Service) -> HealthCheckAdvice {
        for source in &self.sources {
            let advice = source.health_check(svc);
            if !advice.is_none() {
                return advice;
            }
        }
        HealthCheckAdvice::none()
    }

    fn listeners(&self) -> Vec<ChangeListenerTarget> {
        self.sources.iter().flat_map(|s| s.listeners()).collect()
    }

    /// Starts one scheduler per child source, all bound to the same
    /// `quit_rx`, so a single shutdown trigger cascades to every child
    /// (spec §9).
    fn run(&self, quit_rx: watch::Receiver<bool>) {
        for source in &self.sources {
            source.run(quit_rx.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StubSource {
        services: Vec<Service>,
        advice: HealthCheckAdvice,
        listeners: Vec<ChangeListenerTarget>,
    }

    impl DiscoverySource for StubSource {
        fn services(&self) -> Vec<Service> {
            self.services.clone()
        }

        fn health_check(&self, _svc: &Service) -> HealthCheckAdvice {
            self.advice.clone()
        }

        fn listeners(&self) -> Vec<ChangeListenerTarget> {
            self.listeners.clone()
        }

        fn run(&self, _quit_rx: watch::Receiver<bool>) {}
    }

    fn svc(id: &str) -> Service {
        let now = chrono::Utc::now();
        Service {
            id: id.to_string(),
            hostname: "h".into(),
            name: "svc".into(),
            image: "img".into(),
            created: now,
            updated: now,
            ports: vec![],
            proxy_mode: crate::service::ProxyMode::Http,
            status: crate::service::ServiceStatus::Alive,
            labels: HashMap::new(),
        }
    }

    #[test]
    fn services_concatenates_in_registration_order() {
        let a = Arc::new(StubSource {
            services: vec![svc("a1")],
            advice: HealthCheckAdvice::none(),
            listeners: vec![],
        });
        let b = Arc::new(StubSource {
            services: vec![svc("b1")],
            advice: HealthCheckAdvice::none(),
            listeners: vec![],
        });
        let multi = MultiSource::new(vec![a as Arc<dyn DiscoverySource>, b as Arc<dyn DiscoverySource>]);

        let ids: Vec<String> = multi.services().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a1".to_string(), "b1".to_string()]);
    }

    #[test]
    fn health_check_returns_first_non_empty_advice() {
        let a = Arc::new(StubSource {
            services: vec![],
            advice: HealthCheckAdvice::none(),
            listeners: vec![],
        });
        let b = Arc::new(StubSource {
            services: vec![],
            advice: HealthCheckAdvice {
                check_type: "HttpGet".to_string(),
                args: "http://x".to_string(),
            },
            listeners: vec![],
        });
        let multi = MultiSource::new(vec![a as Arc<dyn DiscoverySource>, b as Arc<dyn DiscoverySource>]);

        let advice = multi.health_check(&svc("x"));
        assert_eq!(advice.check_type, "HttpGet");
    }

    #[test]
    fn listeners_concatenates_across_sources() {
        let a = Arc::new(StubSource {
            services: vec![],
            advice: HealthCheckAdvice::none(),
            listeners: vec![ChangeListenerTarget {
                name: "a".into(),
                url: "http://a".into(),
            }],
        });
        let b = Arc::new(StubSource {
            services: vec![],
            advice: HealthCheckAdvice::none(),
            listeners: vec![ChangeListenerTarget {
                name: "b".into(),
                url: "http://b".into(),
            }],
        });
        let multi = MultiSource::new(vec![a as Arc<dyn DiscoverySource>, b as Arc<dyn DiscoverySource>]);

        assert_eq!(multi.listeners().len(), 2);
    }
}
