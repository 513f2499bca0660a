//! Ghost agent: node-local VM lifecycle engine with an inbound control
//! RPC, an outbound orchestrator heartbeat, and HTTP health endpoints.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod config;
pub mod disks;
pub mod dto;
pub mod engine;
pub mod error;
pub mod health;
pub mod hypervisor;
pub mod images;
pub mod ledger;
pub mod network;
pub mod orchestrator;
pub mod registry;
pub mod server;

use crate::config::Config;
use crate::disks::QemuImgProvisioner;
use crate::engine::Engine;
use crate::error::AgentError;
use crate::health::HealthState;
use crate::hypervisor::{GatedHypervisor, LibvirtHypervisor};
use crate::images::{HttpFetcher, ImageCache};
use crate::ledger::ResourceLedger;
use crate::orchestrator::OrchestratorClient;
use crate::registry::VmRegistry;
use crate::server::Server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn main(config: Config) -> Result<(), AgentError> {
    // Fatal startup pieces: registry, ledger, hypervisor connection.
    let registry = Arc::new(VmRegistry::load(&config.data_dir)?);
    let ledger = Arc::new(ResourceLedger::new(
        config.resources.reserved_cpu,
        config.resources.reserved_ram_gib,
        config.resources.reserved_disk_gib,
    ));
    let hypervisor = Arc::new(GatedHypervisor::new(LibvirtHypervisor::connect(
        &config.libvirt.uri,
    )?));

    let images = ImageCache::new(&config.libvirt.image_cache, HttpFetcher::new());
    let disks = QemuImgProvisioner::new(&config.libvirt.image_cache);
    let engine = Arc::new(Engine::new(
        ledger.clone(),
        registry.clone(),
        images,
        disks,
        hypervisor.clone(),
    ));
    // Records reloaded from disk keep their footprint in the ledger.
    engine.readmit_existing();

    let shutdown = CancellationToken::new();
    let heartbeat_ok = Arc::new(AtomicBool::new(false));

    // Health endpoints run on the multi-threaded runtime.
    let health_state = HealthState {
        hypervisor: hypervisor.clone(),
        version: VERSION,
        started_at: Instant::now(),
        heartbeat_ok: heartbeat_ok.clone(),
    };
    let health_listener = tokio::net::TcpListener::bind(config.health.listen_addr)
        .await
        .map_err(|e| AgentError::Internal(format!("bind health {}: {e}", config.health.listen_addr)))?;
    info!(addr = %config.health.listen_addr, "health endpoints listening");
    let health_shutdown = shutdown.clone();
    let health_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(health_listener, health::router(health_state))
            .with_graceful_shutdown(health_shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "health server failed");
        }
    });

    // Signal handling: SIGTERM/SIGINT begin the graceful shutdown.
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    let (report_tx, report_rx) = mpsc::unbounded_channel();

    // Everything capnp lives on one LocalSet: the inbound RPC server and
    // the outbound orchestrator client.
    let local = task::LocalSet::new();
    let serve_result = local
        .run_until(async {
            let mut heartbeat_task = None;
            match OrchestratorClient::connect(&config.agent.orchestrator_addr).await {
                Ok(client) => {
                    let node_ip = detect_node_ip().await;
                    match client
                        .register(&config.agent.name, &node_ip, VERSION, &ledger.snapshot())
                        .await
                    {
                        Ok(agent_id) => {
                            heartbeat_task = Some(task::spawn_local(orchestrator::run_heartbeat(
                                client,
                                agent_id,
                                std::time::Duration::from_secs(
                                    config.agent.heartbeat_interval_secs,
                                ),
                                ledger.clone(),
                                registry.clone(),
                                heartbeat_ok.clone(),
                                report_rx,
                                shutdown.clone(),
                            )));
                        }
                        Err(e) => {
                            warn!(error = %e, "registration failed, serving without orchestrator");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "orchestrator unreachable, serving without it");
                }
            }

            let server = Server::new(engine.clone(), report_tx.clone());
            let serve_result = server
                .serve(config.rpc.listen_addr, shutdown.clone())
                .await
                .map_err(|e| AgentError::Internal(format!("control rpc: {e}")));
            // Make sure the orchestrator sees the unregister before the
            // LocalSet goes away.
            shutdown.cancel();
            if let Some(handle) = heartbeat_task {
                let _ = handle.await;
            }
            serve_result
        })
        .await;

    if let Err(e) = health_task.await {
        error!(error = %e, "health task panicked");
    }

    info!("closing libvirt connection");
    hypervisor.inner().close().await;
    info!("ghost agent shutdown complete");
    serve_result
}

async fn shutdown_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// The address the orchestrator should reach this node on: the tailnet
/// address when available, loopback otherwise.
async fn detect_node_ip() -> String {
    if let Ok(output) = tokio::process::Command::new("tailscale")
        .args(["ip", "--4"])
        .output()
        .await
    {
        if output.status.success() {
            let ip = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            if !ip.is_empty() {
                return ip;
            }
        }
    }
    warn!("no tailscale address, falling back to loopback");
    String::from("127.0.0.1")
}
