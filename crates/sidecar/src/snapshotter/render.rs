//! Proxy-resource rendering — spec §4.6.2.
//!
//! Pure function: catalog grouping in, protobuf resources out. Kept
//! separate from the update loop so it can be unit tested without any
//! catalog or RPC machinery, mirroring the
//! `evaluate_health`/dispatch-loop split in
//! `crates/agent/src/health/route.rs`.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::service::{ProxyMode, Service, ServiceStatus};

use super::proto::{self, Cluster, Endpoint, HttpConnectionManager, Listener, Resource, TcpProxy};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("malformed cluster name: {0}")]
    MalformedClusterName(String),
}

/// `SvcName(name, port) = "<name>:<port>"` (spec §4.6.2).
pub fn svc_name(name: &str, service_port: i32) -> String {
    format!("{}:{}", name, service_port)
}

/// Inverse of [`svc_name`]; splits on the first separator.
pub fn parse_svc_name(s: &str) -> Result<(String, i32), RenderError> {
    let (name, port) = s
        .split_once(':')
        .ok_or_else(|| RenderError::MalformedClusterName(s.to_string()))?;
    let port: i32 = port
        .parse()
        .map_err(|_| RenderError::MalformedClusterName(s.to_string()))?;
    Ok((name.to_string(), port))
}

/// Renders listeners and clusters from a `ByService()` grouping.
///
/// `ProxyMode` is a closed two-variant enum at the type level (spec's
/// "unrecognized proxy mode fails the render" has no counterpart here —
/// deserialization of an unrecognized wire value already fails before a
/// `Service` can exist, so the match below is exhaustive by construction).
pub fn render_resources(
    by_service: &HashMap<String, Vec<Service>>,
    bind_ip: &str,
    use_hostnames: bool,
) -> Vec<Resource> {
    let mut resources = Vec::new();

    for (name, instances) in by_service {
        let alive: Vec<&Service> = instances.iter().filter(|s| s.status == ServiceStatus::Alive).collect();
        if alive.is_empty() {
            continue;
        }

        let mut service_ports: HashSet<i32> = HashSet::new();
        for svc in &alive {
            for port in &svc.ports {
                if port.service_port != 0 {
                    service_ports.insert(port.service_port);
                }
            }
        }

        for service_port in service_ports {
            let endpoints: Vec<Endpoint> = alive
                .iter()
                .flat_map(|svc| {
                    svc.ports
                        .iter()
                        .filter(move |p| p.service_port == service_port)
                        .map(move |p| {
                            let address = if use_hostnames {
                                svc.hostname.clone()
                            } else {
                                p.ip.clone().unwrap_or_else(|| svc.hostname.clone())
                            };
                            Endpoint {
                                address,
                                port: p.port as u32,
                            }
                        })
                })
                .collect();
            if endpoints.is_empty() {
                continue;
            }

            let cluster_name = svc_name(name, service_port);
            resources.push(Resource {
                kind: Some(proto::resource::Kind::Cluster(Cluster {
                    name: cluster_name.clone(),
                    connect_timeout_ms: 500,
                    endpoints,
                })),
            });

            let filter = match alive[0].proxy_mode {
                ProxyMode::Http => proto::listener::Filter::HttpConnectionManager(HttpConnectionManager {
                    stat_prefix: "ingress_http".to_string(),
                    route_cluster: cluster_name.clone(),
                }),
                ProxyMode::Tcp => proto::listener::Filter::TcpProxy(TcpProxy {
                    stat_prefix: "ingress_tcp".to_string(),
                    cluster: cluster_name.clone(),
                }),
            };

            resources.push(Resource {
                kind: Some(proto::resource::Kind::Listener(Listener {
                    name: name.clone(),
                    bind_address: bind_ip.to_string(),
                    bind_port: service_port as u32,
                    filter: Some(filter),
                })),
            });
        }
    }

    resources
}
