//! Health monitor — spec §4.4.
//!
//! Maintains one [`Check`] per currently discovered service, dispatches
//! them on a fixed interval with a fan-in barrier, and reconciles the
//! check set against the discovery pipeline's current view on a separate
//! loop.
//!
//! Grounded on `crates/agent/src/health/route.rs::evaluate_health` (the
//! pure-function / I/O-loop split between status derivation and the
//! scheduling that drives it) and `crates/agent/src/service/background.rs`
//! (the two-pass add-then-delete-absent reconciler shape), generalized
//! from a single fixed metrics source into a per-check state machine with
//! hysteresis.

pub mod executors;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use handlebars::{Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::warn;

use crate::discovery::DiscoverySource;
use crate::looper::{ForeverLooper, Looper};
use crate::service::{port_for_service_port, Port, PortType, Service, ServiceStatus};

use executors::executor_for;

/// Default interval between check dispatches (spec §4.4).
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_CHECK_HOST: &str = "127.0.0.1";
pub const DEFAULT_CHECK_ENDPOINT: &str = "/";

/// Per-check state machine status (spec §4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckStatus {
    Healthy,
    Sickly,
    Failed,
    #[default]
    Unknown,
}

/// The result of one check execution, before state-machine application.
pub enum CheckOutcome {
    Healthy,
    Sickly { message: String },
    Unknown { message: String },
}

/// A single health check bound to a service ID.
pub struct Check {
    pub id: String,
    pub check_type: String,
    pub args: String,
    pub status: CheckStatus,
    pub count: u32,
    pub max_count: u32,
    pub last_error: Option<String>,
}

impl Check {
    fn new(id: String, check_type: String, args: String) -> Self {
        Self {
            id,
            check_type,
            args,
            status: CheckStatus::Unknown,
            count: 0,
            max_count: 1,
            last_error: None,
        }
    }
}

/// Applies spec §4.4.1's transition table to `check` in place.
fn apply_outcome(check: &mut Check, outcome: CheckOutcome) {
    match outcome {
        CheckOutcome::Healthy => {
            check.status = CheckStatus::Healthy;
            check.count = 0;
            check.last_error = None;
        }
        CheckOutcome::Sickly { message } => {
            check.count += 1;
            check.last_error = Some(message);
            check.status = if check.count >= check.max_count {
                CheckStatus::Failed
            } else {
                CheckStatus::Sickly
            };
        }
        CheckOutcome::Unknown { message } => {
            check.count += 1;
            check.last_error = Some(message);
            check.status = if check.count >= check.max_count {
                CheckStatus::Failed
            } else {
                CheckStatus::Unknown
            };
        }
    }
}

async fn run_check(check_type: String, args: String, deadline: Duration) -> CheckOutcome {
    let executor = executor_for(&check_type);
    match timeout(deadline, executor.execute(&args)).await {
        Ok(outcome) => outcome,
        Err(_) => CheckOutcome::Unknown {
            message: "Timed out!".to_string(),
        },
    }
}

/// Handlebars helper implementing `{{tcp service_port}}` / `{{udp
/// service_port}}`: looks up the host-visible port for `service_port` on
/// the root context's `ports` array (spec §4.4.3 `Args` templating).
struct PortHelper(PortType);

impl HelperDef for PortHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let service_port = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0) as i32;
        let ports: Vec<Port> = ctx
            .data()
            .get("ports")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let port = port_for_service_port(&ports, service_port, self.0);
        out.write(&port.to_string())?;
        Ok(())
    }
}

fn build_handlebars() -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.register_helper("tcp", Box::new(PortHelper(PortType::Tcp)));
    hb.register_helper("udp", Box::new(PortHelper(PortType::Udp)));
    hb
}

struct Inner {
    checks: DashMap<String, Check>,
    check_interval: Duration,
    reconcile_interval: Duration,
    default_host: String,
    default_endpoint: String,
    discovery: Arc<dyn DiscoverySource>,
    handlebars: Handlebars<'static>,
}

/// Fixed-interval health monitor plus watcher/reconciler, spec §4.4. A
/// thin, cheaply-`Clone`able handle — see
/// [`crate::discovery::container_runtime::ContainerRuntimeSource`] for
/// the rationale.
#[derive(Clone)]
pub struct Monitor(Arc<Inner>);

impl Monitor {
    /// Dispatch and reconcile both run on `check_interval`; use
    /// [`Monitor::with_reconcile_interval`] to decouple them.
    pub fn new(
        discovery: Arc<dyn DiscoverySource>,
        check_interval: Duration,
        default_host: impl Into<String>,
        default_endpoint: impl Into<String>,
    ) -> Self {
        Self::with_reconcile_interval(discovery, check_interval, check_interval, default_host, default_endpoint)
    }

    /// Like [`Monitor::new`], but the reconciler loop (spec §4.4.3) runs on
    /// its own interval instead of sharing the dispatch tick.
    pub fn with_reconcile_interval(
        discovery: Arc<dyn DiscoverySource>,
        check_interval: Duration,
        reconcile_interval: Duration,
        default_host: impl Into<String>,
        default_endpoint: impl Into<String>,
    ) -> Self {
        Self(Arc::new(Inner {
            checks: DashMap::new(),
            check_interval,
            reconcile_interval,
            default_host: default_host.into(),
            default_endpoint: default_endpoint.into(),
            discovery,
            handlebars: build_handlebars(),
        }))
    }

    /// Service-status projection (spec §4.4.4): the discovery pipeline's
    /// current view, with `Status` overridden per the owning check's
    /// status. Services with an empty ID are logged and skipped.
    pub fn services(&self) -> Vec<Service> {
        let discovered = self.0.discovery.services();
        let mut result = Vec::with_capacity(discovered.len());
        for mut svc in discovered {
            if svc.id.is_empty() {
                warn!("discovered service with empty id skipped");
                continue;
            }
            svc.status = match self.0.checks.get(&svc.id) {
                Some(check) => match check.status {
                    CheckStatus::Healthy | CheckStatus::Sickly => ServiceStatus::Alive,
                    CheckStatus::Unknown => ServiceStatus::Unknown,
                    CheckStatus::Failed => ServiceStatus::Unhealthy,
                },
                None => ServiceStatus::Unknown,
            };
            result.push(svc);
        }
        result
    }

    /// One dispatch cycle: run every current check concurrently with a
    /// per-run deadline, and wait for all to finish before returning
    /// (spec §4.4.2's fan-in barrier).
    pub async fn tick(&self) {
        let deadline = self.0.check_interval.saturating_sub(Duration::from_millis(1));
        let ids: Vec<String> = self.0.checks.iter().map(|e| e.key().clone()).collect();

        let runs = ids.into_iter().filter_map(|id| {
            let entry = self.0.checks.get(&id)?;
            let check_type = entry.check_type.clone();
            let args = entry.args.clone();
            Some(async move {
                let outcome = run_check(check_type, args, deadline).await;
                (id, outcome)
            })
        });

        let results = join_all(runs).await;
        for (id, outcome) in results {
            if let Some(mut entry) = self.0.checks.get_mut(&id) {
                apply_outcome(&mut entry, outcome);
            }
        }
    }

    /// One reconciliation pass (spec §4.4.3): add a check for every newly
    /// discovered service, then drop checks for services no longer
    /// present.
    pub async fn reconcile(&self) {
        let discovered = self.0.discovery.services();
        for svc in &discovered {
            if svc.id.is_empty() || self.0.checks.contains_key(&svc.id) {
                continue;
            }
            let check = self.check_for_service(svc);
            self.0.checks.insert(svc.id.clone(), check);
        }

        let live_ids: HashSet<String> = discovered.iter().map(|s| s.id.clone()).collect();
        self.0.checks.retain(|id, _| live_ids.contains(id));
    }

    fn check_for_service(&self, svc: &Service) -> Check {
        let advice = self.0.discovery.health_check(svc);
        let (check_type, raw_args) = if !advice.is_none() {
            (advice.check_type, advice.args)
        } else if let Some(port) = svc.first_tcp_port() {
            (
                "HttpGet".to_string(),
                format!("http://{}:{}{}", self.0.default_host, port.port, self.0.default_endpoint),
            )
        } else {
            ("AlwaysSuccessful".to_string(), String::new())
        };

        let args = match self.render_args(&raw_args, svc) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("check args templating failed for {}: {}", svc.id, e);
                raw_args
            }
        };

        Check::new(svc.id.clone(), check_type, args)
    }

    fn render_args(&self, template: &str, svc: &Service) -> Result<String, handlebars::RenderError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }
        let mut data = serde_json::to_value(svc).map_err(|e| handlebars::RenderError::new(e.to_string()))?;
        if let Some(obj) = data.as_object_mut() {
            obj.insert("host".to_string(), serde_json::Value::String(self.0.default_host.clone()));
            obj.insert("container".to_string(), serde_json::Value::String(svc.hostname.clone()));
        }
        self.0.handlebars.render_template(template, &data)
    }

    /// Starts the dispatch loop and the reconciler loop, both bound to
    /// `quit_rx` (spec §5 cancellation).
    pub fn run(&self, quit_rx: watch::Receiver<bool>) {
        let tick_monitor = self.clone();
        let tick_quit = quit_rx.clone();
        tokio::spawn(async move {
            let interval = tick_monitor.0.check_interval;
            let mut looper = ForeverLooper::with_receiver(interval, tick_quit);
            let this = tick_monitor.clone();
            looper
                .run(move || {
                    let this = this.clone();
                    async move {
                        this.tick().await;
                    }
                })
                .await;
        });

        let reconcile_monitor = self.clone();
        tokio::spawn(async move {
            let interval = reconcile_monitor.0.reconcile_interval;
            let mut looper = ForeverLooper::with_receiver(interval, quit_rx);
            let this = reconcile_monitor.clone();
            looper
                .run(move || {
                    let this = this.clone();
                    async move {
                        this.reconcile().await;
                    }
                })
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::HealthCheckAdvice;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubSource {
        services: Arc<Mutex<Vec<Service>>>,
    }

    impl DiscoverySource for StubSource {
        fn services(&self) -> Vec<Service> {
            self.services.lock().unwrap().clone()
        }

        fn health_check(&self, _svc: &Service) -> HealthCheckAdvice {
            HealthCheckAdvice::none()
        }

        fn listeners(&self) -> Vec<crate::service::ChangeListenerTarget> {
            Vec::new()
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
            status: ServiceStatus::Unknown,
            labels: HashMap::new(),
        }
    }

    fn monitor_with(services: Vec<Service>) -> (Monitor, Arc<Mutex<Vec<Service>>>) {
        let backing = Arc::new(Mutex::new(services));
        let source = Arc::new(StubSource {
            services: backing.clone(),
        });
        let monitor = Monitor::new(source as Arc<dyn DiscoverySource>, Duration::from_millis(10), "127.0.0.1", "/");
        (monitor, backing)
    }

    #[test]
    fn new_defaults_reconcile_interval_to_check_interval() {
        let (monitor, _backing) = monitor_with(vec![]);
        assert_eq!(monitor.0.reconcile_interval, monitor.0.check_interval);
    }

    #[test]
    fn with_reconcile_interval_decouples_the_two_intervals() {
        let source = Arc::new(StubSource {
            services: Arc::new(Mutex::new(vec![])),
        });
        let monitor = Monitor::with_reconcile_interval(
            source as Arc<dyn DiscoverySource>,
            Duration::from_millis(10),
            Duration::from_secs(5),
            "127.0.0.1",
            "/",
        );
        assert_eq!(monitor.0.check_interval, Duration::from_millis(10));
        assert_eq!(monitor.0.reconcile_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn reconcile_adds_check_for_new_service_with_no_tcp_port_as_always_successful() {
        let (monitor, _backing) = monitor_with(vec![svc("a")]);
        monitor.reconcile().await;

        assert!(monitor.0.checks.contains_key("a"));
        assert_eq!(monitor.0.checks.get("a").unwrap().check_type, "AlwaysSuccessful");
    }

    #[tokio::test]
    async fn reconcile_drops_checks_absent_from_latest_discovery() {
        let (monitor, backing) = monitor_with(vec![svc("a")]);
        monitor.reconcile().await;
        assert!(monitor.0.checks.contains_key("a"));

        *backing.lock().unwrap() = vec![];
        monitor.reconcile().await;

        assert!(!monitor.0.checks.contains_key("a"));
    }

    #[tokio::test]
    async fn hysteresis_sickly_then_failed_at_max_count() {
        let (monitor, _backing) = monitor_with(vec![]);
        monitor.0.checks.insert(
            "a".to_string(),
            Check {
                id: "a".to_string(),
                check_type: "AlwaysSuccessful".to_string(),
                args: String::new(),
                status: CheckStatus::Unknown,
                count: 0,
                max_count: 2,
                last_error: None,
            },
        );
        // Force a sickly outcome directly through the transition function
        // rather than through a real executor, to test the state machine
        // in isolation.
        {
            let mut entry = monitor.0.checks.get_mut("a").unwrap();
            apply_outcome(
                &mut entry,
                CheckOutcome::Sickly {
                    message: "down".to_string(),
                },
            );
        }
        assert_eq!(monitor.0.checks.get("a").unwrap().status, CheckStatus::Sickly);
        assert_eq!(monitor.0.checks.get("a").unwrap().count, 1);

        {
            let mut entry = monitor.0.checks.get_mut("a").unwrap();
            apply_outcome(
                &mut entry,
                CheckOutcome::Sickly {
                    message: "down".to_string(),
                },
            );
        }
        assert_eq!(monitor.0.checks.get("a").unwrap().status, CheckStatus::Failed);
        assert_eq!(monitor.0.checks.get("a").unwrap().count, 2);
    }

    #[test]
    fn recovery_from_failed_resets_count_on_healthy() {
        let mut check = Check {
            id: "a".to_string(),
            check_type: "AlwaysSuccessful".to_string(),
            args: String::new(),
            status: CheckStatus::Failed,
            count: 2,
            max_count: 3,
            last_error: Some("down".to_string()),
        };
        apply_outcome(&mut check, CheckOutcome::Healthy);
        assert_eq!(check.status, CheckStatus::Healthy);
        assert_eq!(check.count, 0);
        assert!(check.last_error.is_none());
    }

    #[tokio::test]
    async fn timeout_yields_unknown_with_timed_out_message() {
        let outcome = run_check(
            "External".to_string(),
            "sleep 1".to_string(),
            Duration::from_millis(1),
        )
        .await;
        match outcome {
            CheckOutcome::Unknown { message } => assert_eq!(message, "Timed out!"),
            _ => panic!("expected Unknown outcome"),
        }
    }

    #[tokio::test]
    async fn services_projects_failed_check_as_unhealthy() {
        let (monitor, _backing) = monitor_with(vec![svc("a")]);
        monitor.0.checks.insert(
            "a".to_string(),
            Check {
                id: "a".to_string(),
                check_type: "AlwaysSuccessful".to_string(),
                args: String::new(),
                status: CheckStatus::Failed,
                count: 5,
                max_count: 1,
                last_error: None,
            },
        );

        let services = monitor.services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].status, ServiceStatus::Unhealthy);
    }

    #[test]
    fn render_args_substitutes_tcp_port_and_host() {
        let (monitor, _backing) = monitor_with(vec![]);
        let mut svc = svc("a");
        svc.ports.push(Port {
            kind: PortType::Tcp,
            port: 9990,
            service_port: 10100,
            ip: None,
        });

        let rendered = monitor.render_args("http://{{host}}:{{tcp 10100}}/status", &svc).unwrap();
        assert_eq!(rendered, "http://127.0.0.1:9990/status");
    }
}
