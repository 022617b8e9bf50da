//! Streaming discovery RPC server — spec §4.6.3.
//!
//! Grounded on the `async_stream::stream! { loop { tokio::select! { ... } } }`
//! idiom in `crates/agent/src/health/route.rs::watch`, generalized from a
//! one-directional status feed to a bidirectional request/response stream
//! keyed by node identity.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::warn;

use super::proto::snapshot_discovery_service_server::SnapshotDiscoveryService;
use super::proto::{DiscoveryRequest, DiscoveryResponse};
use super::SnapshotCache;

const TYPE_URL: &str = "type.googleapis.com/sidecar.snapshot.Resource";
const ERROR_MESSAGE_TRUNCATE: usize = 200;

pub struct SnapshotDiscoveryServer {
    cache: Arc<SnapshotCache>,
}

impl SnapshotDiscoveryServer {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }
}

#[tonic::async_trait]
impl SnapshotDiscoveryService for SnapshotDiscoveryServer {
    type StreamSnapshotsStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

    async fn stream_snapshots(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSnapshotsStream>, Status> {
        let mut inbound = request.into_inner();
        let cache = self.cache.clone();

        let stream = async_stream::stream! {
            let mut rx: Option<tokio::sync::watch::Receiver<Arc<super::Snapshot>>> = None;
            let mut last_sent_version: Option<String> = None;

            loop {
                tokio::select! {
                    req = inbound.next() => {
                        match req {
                            Some(Ok(req)) => {
                                if let Some(detail) = &req.error_detail {
                                    if detail.code != 0 {
                                        warn!(
                                            "snapshot client reported error {}: {}",
                                            detail.code,
                                            truncate(&detail.message, ERROR_MESSAGE_TRUNCATE),
                                        );
                                    }
                                }

                                let node_id = req.node.as_ref().map(|n| n.id.clone()).unwrap_or_default();
                                let subscriber = rx.get_or_insert_with(|| cache.subscribe(&node_id));
                                let current = subscriber.borrow_and_update().clone();

                                // A client connecting (or reconnecting) with a stale
                                // version should see the current snapshot immediately
                                // rather than wait for the next change.
                                if req.version_info != current.version && last_sent_version.as_deref() != Some(current.version.as_str()) {
                                    last_sent_version = Some(current.version.clone());
                                    yield Ok(DiscoveryResponse {
                                        version_info: current.version.clone(),
                                        resources: current.resources.clone(),
                                        type_url: TYPE_URL.to_string(),
                                        nonce: current.version.clone(),
                                    });
                                }
                            }
                            Some(Err(e)) => {
                                warn!("snapshot stream recv error: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                    changed = wait_for_change(&mut rx) => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(subscriber) = &mut rx else { continue };
                        let snapshot = subscriber.borrow_and_update().clone();
                        if last_sent_version.as_deref() == Some(snapshot.version.as_str()) {
                            continue;
                        }
                        last_sent_version = Some(snapshot.version.clone());
                        yield Ok(DiscoveryResponse {
                            version_info: snapshot.version.clone(),
                            resources: snapshot.resources.clone(),
                            type_url: TYPE_URL.to_string(),
                            nonce: snapshot.version.clone(),
                        });
                    }
                }
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }
}

/// Awaits the next change on `rx`, or never resolves if no subscription
/// has been established yet (the client hasn't sent its first request).
async fn wait_for_change(
    rx: &mut Option<tokio::sync::watch::Receiver<Arc<super::Snapshot>>>,
) -> Result<(), tokio::sync::watch::error::RecvError> {
    match rx {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = s.char_indices().nth(max).map_or(s.len(), |(i, _)| i);
    format!("{}...", &s[..cut])
}
