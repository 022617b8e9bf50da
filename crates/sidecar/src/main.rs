use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tonic::transport::Server as GrpcServer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sidecar::catalog::InMemoryCatalog;
use sidecar::config::SidecarConfig;
use sidecar::discovery::cluster_api::{ClusterApiCredentials, ClusterApiSource};
use sidecar::discovery::container_runtime::ContainerRuntimeSource;
use sidecar::discovery::multi::MultiSource;
use sidecar::discovery::static_file::StaticFileSource;
use sidecar::discovery::DiscoverySource;
use sidecar::health::Monitor;
use sidecar::namer::{LabelNamer, RegexNamer, ServiceNamer};
use sidecar::snapshotter::xds::SnapshotDiscoveryServer;
use sidecar::snapshotter::{self, proto::snapshot_discovery_service_server::SnapshotDiscoveryServiceServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sidecar=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting service-discovery sidecar");

    let config = SidecarConfig::load()?;
    config.validate().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    info!("loaded configuration: hostname={}, bind_address={}", config.hostname, config.bind_address);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sources = build_discovery_sources(&config)?;
    let discovery: Arc<dyn DiscoverySource> = Arc::new(MultiSource::new(sources));
    discovery.run(shutdown_rx.clone());
    info!("discovery pipeline started with {} configured sources", discovery.services().len());

    let catalog = InMemoryCatalog::new(config.hostname.clone());
    let monitor = Monitor::with_reconcile_interval(
        discovery.clone(),
        Duration::from_secs(config.health.check_interval_secs),
        Duration::from_secs(config.health.reconcile_interval_secs),
        config.health.default_check_host.clone(),
        config.health.default_check_endpoint.clone(),
    );
    monitor.run(shutdown_rx.clone());
    tokio::spawn(catalog_bridge_loop(monitor.clone(), catalog.clone(), shutdown_rx.clone()));
    tokio::spawn(change_notifier_loop(discovery.clone(), catalog.clone(), shutdown_rx.clone()));

    let snapshot_server = snapshotter::Server::new(
        catalog.clone(),
        config.snapshotter.bind_ip.clone(),
        config.snapshotter.use_hostnames,
        Duration::from_secs(config.snapshotter.update_interval_secs),
    );
    snapshot_server.run(shutdown_rx.clone());

    if config.snapshotter.use_grpc_api {
        let addr: std::net::SocketAddr = config.bind_address.parse().map_err(|e| {
            error!("invalid bind address: {}", e);
            e
        })?;
        let xds = SnapshotDiscoveryServer::new(snapshot_server.cache());
        let mut server_shutdown_rx = shutdown_rx.clone();
        info!("streaming discovery service listening on {}", addr);

        tokio::spawn(async move {
            if let Err(e) = GrpcServer::builder()
                .add_service(SnapshotDiscoveryServiceServer::new(xds))
                .serve_with_shutdown(addr, async move {
                    let _ = server_shutdown_rx.changed().await;
                })
                .await
            {
                error!("streaming discovery server exited: {}", e);
            }
        });
    } else {
        info!("streaming discovery service disabled (snapshotter.use_grpc_api=false)");
    }

    info!("sidecar ready, press Ctrl+C to shut down");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining background tasks");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("shutdown complete");

    Ok(())
}

/// Builds the configured set of discovery sources (spec §4.1.4): any
/// combination may be active simultaneously.
fn build_discovery_sources(config: &SidecarConfig) -> Result<Vec<Arc<dyn DiscoverySource>>, Box<dyn std::error::Error>> {
    let mut sources: Vec<Arc<dyn DiscoverySource>> = Vec::new();

    let namer: Arc<dyn ServiceNamer> = match config.discovery.namer.as_str() {
        "regex" => Arc::new(RegexNamer::compile(&config.discovery.namer_arg)?),
        _ => Arc::new(LabelNamer::new(config.discovery.namer_arg.clone())),
    };
    match ContainerRuntimeSource::connect(&config.discovery.endpoint, namer, config.hostname.clone()) {
        Ok(source) => sources.push(Arc::new(source)),
        Err(e) => warn!("container-runtime source unavailable, skipping: {}", e),
    }

    if config.discovery.static_file_enabled() {
        sources.push(Arc::new(StaticFileSource::with_advertise_ip(
            config.discovery.config_file.clone(),
            config.hostname.clone(),
            config.discovery.default_ip.clone(),
            config.discovery.advertise_ip.clone(),
            Duration::from_secs(config.discovery.poll_interval_secs),
        )));
    }

    if config.discovery.cluster_api_enabled() {
        let credentials = ClusterApiCredentials::load_from_dir(&config.discovery.creds_path)?;
        let source = ClusterApiSource::new(
            config.discovery.base_url(),
            credentials,
            config.hostname.clone(),
            config.discovery.namespace.clone(),
            Duration::from_secs(config.discovery.poll_interval_secs),
            Duration::from_secs(config.discovery.timeout_secs),
        )?;
        sources.push(Arc::new(source));
    }

    Ok(sources)
}

/// Periodically folds the health monitor's service-status projection into
/// the catalog, the one piece of glue between "local view" (discovery +
/// health) and "what the snapshotter renders" (spec §5: the catalog is an
/// external collaborator, specified at its interface only).
async fn catalog_bridge_loop(monitor: Monitor, catalog: Arc<InMemoryCatalog>, mut quit_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for svc in monitor.services() {
                    catalog.add_service_entry(svc).await;
                }
            }
            _ = quit_rx.changed() => {
                if *quit_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Notifies every configured [`sidecar::service::ChangeListenerTarget`]
/// by HTTP POST whenever the catalog changes (spec §3 "ChangeListener").
async fn change_notifier_loop(
    discovery: Arc<dyn DiscoverySource>,
    catalog: Arc<InMemoryCatalog>,
    mut quit_rx: watch::Receiver<bool>,
) {
    let client = reqwest::Client::new();
    let mut listener = catalog.add_listener("change-notifier");
    loop {
        tokio::select! {
            _ = quit_rx.changed() => {
                if *quit_rx.borrow() {
                    break;
                }
            }
            event = listener.recv() => {
                if event.is_err() {
                    break;
                }
                for target in discovery.listeners() {
                    if let Err(e) = client.post(&target.url).send().await {
                        warn!("change-notifier: POST to {} ({}) failed: {}", target.url, target.name, e);
                    }
                }
            }
        }
    }
}
