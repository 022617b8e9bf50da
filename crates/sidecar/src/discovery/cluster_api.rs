//! Cluster-API discovery source — spec §4.1.3.
//!
//! Periodically polls a central REST API for the node × service cross
//! product this agent should advertise locally. On any non-2xx response
//! the previous in-memory snapshot is retained and the failure logged,
//! rather than emptying the service table on a transient outage.
//!
//! Grounded on `crates/cluster/src/agent/pool.rs::create_channel`
//! (credential loading from a directory, bearer auth), reworked here from
//! mTLS gRPC to bearer-token REST via `reqwest` — `reqwest` itself is pack
//! enrichment (absent from the teacher, present in
//! `ciresnave-auto-discovery`).

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use crate::looper::{ForeverLooper, Looper};
use crate::service::{ChangeListenerTarget, Port, PortType, ProxyMode, Service, ServiceStatus};

use super::{DiscoveryError, DiscoverySource, HealthCheckAdvice};

/// Label carrying the name this agent should advertise a cluster-service
/// under (spec §4.1.3: "skip services without this label").
const SERVICE_NAME_LABEL: &str = "ServiceName";

#[derive(Debug, Error)]
pub enum ClusterApiError {
    #[error("reading credentials at {path}: {source}")]
    Credentials {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server {url} returned status {status}")]
    Status { url: String, status: u16 },
}

/// `GET /api/v1/nodes/` response shape (spec §6).
#[derive(Debug, Clone, Deserialize)]
struct NodeList {
    items: Vec<NodeItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeItem {
    status: NodeStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

impl NodeItem {
    /// Hostname is the `InternalDNS` address if present, else `Hostname`.
    fn hostname(&self) -> Option<&str> {
        self.status
            .addresses
            .iter()
            .find(|a| a.kind == "InternalDNS")
            .or_else(|| self.status.addresses.iter().find(|a| a.kind == "Hostname"))
            .map(|a| a.address.as_str())
    }

    fn internal_ip(&self) -> Option<&str> {
        self.status
            .addresses
            .iter()
            .find(|a| a.kind == "InternalIP")
            .map(|a| a.address.as_str())
    }
}

/// `GET /api/v1/services/` response shape (spec §6).
#[derive(Debug, Clone, Deserialize)]
struct ServiceList {
    items: Vec<ServiceItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceItem {
    metadata: ServiceMetadata,
    spec: ServiceSpec,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceMetadata {
    uid: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default = "Utc::now", rename = "creationTimestamp")]
    creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceSpec {
    #[serde(default)]
    ports: Vec<ServicePortSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServicePortSpec {
    port: i32,
    #[serde(default, rename = "nodePort")]
    node_port: Option<i32>,
}

/// Credentials loaded once at construction from a directory containing
/// `token` and `ca.crt` files (spec §4.1.3, §6).
pub struct ClusterApiCredentials {
    pub bearer_token: String,
    pub ca_pem: Option<Vec<u8>>,
}

impl ClusterApiCredentials {
    pub fn load_from_dir(dir: &str) -> Result<Self, ClusterApiError> {
        let token_path = format!("{}/token", dir);
        let bearer_token = fs::read_to_string(&token_path)
            .map_err(|e| ClusterApiError::Credentials {
                path: token_path,
                source: e,
            })?
            .trim()
            .to_string();

        let ca_path = format!("{}/ca.crt", dir);
        let ca_pem = fs::read(&ca_path).ok();

        Ok(Self { bearer_token, ca_pem })
    }
}

struct Inner {
    client: Client,
    base_url: String,
    bearer_token: String,
    hostname: String,
    namespace: String,
    poll_interval: Duration,
    services: DashMap<String, Service>,
}

/// Cluster-API-backed discovery source. A thin, cheaply-`Clone`able handle
/// — see [`super::container_runtime::ContainerRuntimeSource`] for the
/// rationale.
#[derive(Clone)]
pub struct ClusterApiSource(Arc<Inner>);

impl ClusterApiSource {
    pub fn new(
        base_url: impl Into<String>,
        credentials: ClusterApiCredentials,
        hostname: impl Into<String>,
        namespace: impl Into<String>,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ClusterApiError> {
        let base_url = base_url.into();
        let mut builder = Client::builder().timeout(request_timeout);
        if let Some(ca_pem) = &credentials.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca_pem).map_err(|e| ClusterApiError::Request {
                url: base_url.clone(),
                source: e,
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(|e| ClusterApiError::Request {
            url: "client-build".to_string(),
            source: e,
        })?;

        Ok(Self(Arc::new(Inner {
            client,
            base_url,
            bearer_token: credentials.bearer_token,
            hostname: hostname.into(),
            namespace: namespace.into(),
            poll_interval,
            services: DashMap::new(),
        })))
    }

    /// Path of the namespace-scoped services endpoint (spec §6
    /// `namespace`), falling back to the cluster-wide listing when unset.
    fn services_path(&self) -> String {
        if self.0.namespace.is_empty() {
            "/api/v1/services/".to_string()
        } else {
            format!("/api/v1/namespaces/{}/services/", self.0.namespace)
        }
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ClusterApiError> {
        let url = format!("{}{}", self.0.base_url, path);
        let resp = self
            .0
            .client
            .get(&url)
            .bearer_auth(&self.0.bearer_token)
            .send()
            .await
            .map_err(|e| ClusterApiError::Request {
                url: url.clone(),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(ClusterApiError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }

        resp.json::<T>().await.map_err(|e| ClusterApiError::Request { url, source: e })
    }

    /// Fetch nodes and cluster-services, and compute the node ×
    /// cluster-service cross product this agent should advertise (spec
    /// §4.1.3). On failure the previous snapshot is retained untouched.
    async fn refresh(&self) -> Result<(), DiscoveryError> {
        let node_list: NodeList = self
            .fetch("/api/v1/nodes/")
            .await
            .map_err(|e| DiscoveryError::Transient(e.to_string()))?;
        let service_list: ServiceList = self
            .fetch(&self.services_path())
            .await
            .map_err(|e| DiscoveryError::Transient(e.to_string()))?;

        let mut fresh: HashMap<String, Service> = HashMap::new();
        for node in &node_list.items {
            let Some(node_hostname) = node.hostname() else {
                continue;
            };
            let node_ip = node.internal_ip().unwrap_or_default();

            for svc in &service_list.items {
                let Some(name) = svc.metadata.labels.get(SERVICE_NAME_LABEL) else {
                    continue;
                };

                let ports: Vec<Port> = svc
                    .spec
                    .ports
                    .iter()
                    .filter_map(|p| {
                        let node_port = p.node_port?;
                        Some(Port {
                            kind: PortType::Tcp,
                            port: node_port,
                            service_port: p.port,
                            ip: Some(node_ip.to_string()),
                        })
                    })
                    .collect();

                let id = svc.metadata.uid.clone();
                fresh.insert(
                    format!("{}:{}", node_hostname, id),
                    Service {
                        id,
                        hostname: node_hostname.to_string(),
                        name: name.clone(),
                        image: format!("{}:kubernetes-hosted", name),
                        created: svc.metadata.creation_timestamp,
                        updated: Utc::now(),
                        ports,
                        proxy_mode: ProxyMode::Http,
                        status: ServiceStatus::Alive,
                        labels: svc.metadata.labels.clone(),
                    },
                );
            }
        }

        self.0.services.retain(|key, _| fresh.contains_key(key));
        for (key, svc) in fresh {
            self.0.services.insert(key, svc);
        }

        Ok(())
    }
}

impl DiscoverySource for ClusterApiSource {
    fn services(&self) -> Vec<Service> {
        self.0.services.iter().map(|e| e.value().clone()).collect()
    }

    fn health_check(&self, _svc: &Service) -> HealthCheckAdvice {
        // Spec §4.1.3: this source always returns the always-successful
        // sentinel, so any other configured source's opinion takes
        // precedence through the multi-source aggregator's tie-break.
        HealthCheckAdvice {
            check_type: "AlwaysSuccessful".to_string(),
            args: String::new(),
        }
    }

    fn listeners(&self) -> Vec<ChangeListenerTarget> {
        Vec::new()
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
                            warn!("cluster-api: refresh failed: {}", e);
                        }
                    }
                })
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> ClusterApiSource {
        ClusterApiSource::new(
            "http://localhost:1",
            ClusterApiCredentials {
                bearer_token: "tok".to_string(),
                ca_pem: None,
            },
            "node-a",
            "default",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .expect("construct source")
    }

    #[test]
    fn health_check_always_returns_success_sentinel() {
        let source = source();
        let now = chrono::Utc::now();
        let svc = Service {
            id: "x".into(),
            hostname: "node-a".into(),
            name: "svc".into(),
            image: "img".into(),
            created: now,
            updated: now,
            ports: vec![],
            proxy_mode: ProxyMode::Http,
            status: ServiceStatus::Alive,
            labels: HashMap::new(),
        };
        let advice = source.health_check(&svc);
        assert_eq!(advice.check_type, "AlwaysSuccessful");
        assert_eq!(advice.args, "");
    }

    #[test]
    fn listeners_is_always_empty() {
        let source = source();
        assert!(source.listeners().is_empty());
    }

    #[test]
    fn services_path_scopes_to_configured_namespace() {
        let source = source();
        assert_eq!(source.services_path(), "/api/v1/namespaces/default/services/");
    }

    #[test]
    fn services_path_falls_back_to_cluster_wide_when_namespace_empty() {
        let source = ClusterApiSource::new(
            "http://localhost:1",
            ClusterApiCredentials {
                bearer_token: "tok".to_string(),
                ca_pem: None,
            },
            "node-a",
            "",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .expect("construct source");
        assert_eq!(source.services_path(), "/api/v1/services/");
    }

    #[test]
    fn node_hostname_prefers_internal_dns_over_hostname() {
        let node = NodeItem {
            status: NodeStatus {
                addresses: vec![
                    NodeAddress {
                        kind: "Hostname".to_string(),
                        address: "fallback".to_string(),
                    },
                    NodeAddress {
                        kind: "InternalDNS".to_string(),
                        address: "preferred.internal".to_string(),
                    },
                ],
            },
        };
        assert_eq!(node.hostname(), Some("preferred.internal"));
    }

    #[tokio::test]
    async fn refresh_skips_services_without_service_name_label_and_ports_without_node_port() {
        let source = source();

        let nodes = NodeList {
            items: vec![NodeItem {
                status: NodeStatus {
                    addresses: vec![
                        NodeAddress {
                            kind: "Hostname".to_string(),
                            address: "node-a".to_string(),
                        },
                        NodeAddress {
                            kind: "InternalIP".to_string(),
                            address: "10.0.0.5".to_string(),
                        },
                    ],
                },
            }],
        };
        let services = ServiceList {
            items: vec![
                ServiceItem {
                    metadata: ServiceMetadata {
                        uid: "uid-1".to_string(),
                        labels: HashMap::from([(SERVICE_NAME_LABEL.to_string(), "bocaccio".to_string())]),
                        creation_timestamp: Utc::now(),
                    },
                    spec: ServiceSpec {
                        ports: vec![
                            ServicePortSpec {
                                port: 10100,
                                node_port: Some(9990),
                            },
                            ServicePortSpec {
                                port: 10101,
                                node_port: None,
                            },
                        ],
                    },
                },
                ServiceItem {
                    metadata: ServiceMetadata {
                        uid: "uid-2".to_string(),
                        labels: HashMap::new(),
                        creation_timestamp: Utc::now(),
                    },
                    spec: ServiceSpec { ports: vec![] },
                },
            ],
        };

        let mut fresh: HashMap<String, Service> = HashMap::new();
        for node in &nodes.items {
            let node_hostname = node.hostname().unwrap();
            let node_ip = node.internal_ip().unwrap_or_default();
            for svc in &services.items {
                let Some(name) = svc.metadata.labels.get(SERVICE_NAME_LABEL) else {
                    continue;
                };
                let ports: Vec<Port> = svc
                    .spec
                    .ports
                    .iter()
                    .filter_map(|p| {
                        let node_port = p.node_port?;
                        Some(Port {
                            kind: PortType::Tcp,
                            port: node_port,
                            service_port: p.port,
                            ip: Some(node_ip.to_string()),
                        })
                    })
                    .collect();
                fresh.insert(
                    format!("{}:{}", node_hostname, svc.metadata.uid),
                    Service {
                        id: svc.metadata.uid.clone(),
                        hostname: node_hostname.to_string(),
                        name: name.clone(),
                        image: format!("{}:kubernetes-hosted", name),
                        created: svc.metadata.creation_timestamp,
                        updated: Utc::now(),
                        ports,
                        proxy_mode: ProxyMode::Http,
                        status: ServiceStatus::Alive,
                        labels: svc.metadata.labels.clone(),
                    },
                );
            }
        }
        source.0.services.extend(fresh);

        let services = source.services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "bocaccio");
        assert_eq!(services[0].image, "bocaccio:kubernetes-hosted");
        assert_eq!(services[0].ports.len(), 1);
        assert_eq!(services[0].ports[0].port, 9990);
        assert_eq!(services[0].ports[0].service_port, 10100);
        assert_eq!(services[0].ports[0].ip, Some("10.0.0.5".to_string()));
    }
}
