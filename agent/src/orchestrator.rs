//! Outbound orchestrator channel: registration, the heartbeat loop, and
//! best-effort VM event reports.
//!
//! The heartbeat carries a ledger snapshot and the registry inventory so
//! the orchestrator's cluster view converges. Each beat retries up to
//! three times with exponential backoff; a beat that still fails flips the
//! shared `heartbeat_ok` flag and the agent keeps serving local RPCs.
//! Commands returned by the orchestrator are recognized and logged but not
//! dispatched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};
use chrono::Utc;
use commands::common_capnp;
use commands::orchestrator_capnp::orchestrator;
use futures::AsyncReadExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dto::{ResourceSnapshot, VmRecord, VmState};
use crate::error::AgentError;
use crate::ledger::ResourceLedger;
use crate::registry::VmRegistry;

const HEARTBEAT_ATTEMPTS: u32 = 3;
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const UNREGISTER_BUDGET: Duration = Duration::from_secs(10);

/// Engine-side events reported to the orchestrator out-of-band of the
/// heartbeat.
#[derive(Debug, Clone)]
pub enum ReportEvent {
    Created {
        id: String,
        name: String,
        vcpu: u32,
        ram_gib: u32,
        disk_gib: u32,
        ip: String,
        template: String,
    },
    Deleted {
        id: String,
    },
    StateChanged {
        id: String,
        state: VmState,
    },
}

fn rpc_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Network(e.to_string())
}

pub struct OrchestratorClient {
    client: orchestrator::Client,
}

impl OrchestratorClient {
    /// Connect and bootstrap the orchestrator capability. Must run inside
    /// a LocalSet.
    pub async fn connect(addr: &str) -> Result<Self, AgentError> {
        let stream = tokio::net::TcpStream::connect(addr).await.map_err(rpc_err)?;
        stream.set_nodelay(true).map_err(rpc_err)?;
        let (reader, writer) = tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();
        let rpc_network = Box::new(twoparty::VatNetwork::new(
            futures::io::BufReader::new(reader),
            futures::io::BufWriter::new(writer),
            rpc_twoparty_capnp::Side::Client,
            Default::default(),
        ));
        let mut rpc_system = RpcSystem::new(rpc_network, None);
        let client = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);
        tokio::task::spawn_local(rpc_system);
        Ok(Self { client })
    }

    /// Register this node; the returned agent id is retained for the
    /// process lifetime.
    pub async fn register(
        &self,
        name: &str,
        ip: &str,
        version: &str,
        resources: &ResourceSnapshot,
    ) -> Result<String, AgentError> {
        let mut request = self.client.register_agent_request();
        {
            let mut req = request.get().init_req();
            req.set_name(name);
            req.set_ip(ip);
            req.set_version(version);
            fill_resources(req.init_resources(), resources);
        }

        let response = request.send().promise.await.map_err(rpc_err)?;
        let reply = response.get().map_err(rpc_err)?.get_resp().map_err(rpc_err)?;
        if !reply.get_success() {
            let message = read_text(reply.get_message());
            return Err(AgentError::Network(format!("registration rejected: {message}")));
        }
        let agent_id = reply
            .get_agent_id()
            .map_err(rpc_err)?
            .to_str()
            .map_err(rpc_err)?
            .to_string();
        info!(agent_id = %agent_id, "registered with orchestrator");
        Ok(agent_id)
    }

    /// One heartbeat attempt. Returns the command list from the reply.
    async fn heartbeat(
        &self,
        agent_id: &str,
        resources: &ResourceSnapshot,
        vms: &[VmRecord],
    ) -> Result<Vec<(String, String)>, AgentError> {
        let mut request = self.client.heartbeat_request();
        {
            let mut req = request.get().init_req();
            req.set_agent_id(agent_id);
            req.set_timestamp(Utc::now().timestamp());
            fill_resources(req.reborrow().init_resources(), resources);
            let mut list = req.init_vms(vms.len() as u32);
            for (i, vm) in vms.iter().enumerate() {
                let mut info = list.reborrow().get(i as u32);
                info.set_id(vm.id.as_str());
                info.set_name(vm.name.as_str());
                info.set_state(vm.state.as_str());
                info.set_ip_address(vm.ip.as_str());
                info.set_vcpu(vm.vcpu);
                info.set_ram_gib(vm.ram_gib);
            }
        }

        let response = request.send().promise.await.map_err(rpc_err)?;
        let reply = response.get().map_err(rpc_err)?.get_resp().map_err(rpc_err)?;
        if !reply.get_success() {
            let message = read_text(reply.get_message());
            return Err(AgentError::Network(format!("heartbeat rejected: {message}")));
        }

        let mut commands = Vec::new();
        for command in reply.get_commands().map_err(rpc_err)?.iter() {
            commands.push((
                read_text(command.get_opcode()),
                read_text(command.get_payload()),
            ));
        }
        Ok(commands)
    }

    /// Heartbeat with the retry schedule: 1 s, 2 s, 4 s, capped at 10 s.
    async fn heartbeat_with_retry(
        &self,
        agent_id: &str,
        resources: &ResourceSnapshot,
        vms: &[VmRecord],
    ) -> Result<Vec<(String, String)>, AgentError> {
        let mut delay = BACKOFF_START;
        let mut attempt = 1;
        loop {
            match self.heartbeat(agent_id, resources, vms).await {
                Ok(commands) => return Ok(commands),
                Err(e) if attempt < HEARTBEAT_ATTEMPTS => {
                    warn!(attempt, error = %e, "heartbeat attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn report_vm_created(
        &self,
        agent_id: &str,
        id: &str,
        name: &str,
        vcpu: u32,
        ram_gib: u32,
        disk_gib: u32,
        ip: &str,
        template: &str,
    ) -> Result<(), AgentError> {
        let mut request = self.client.report_vm_created_request();
        {
            let mut req = request.get().init_req();
            req.set_agent_id(agent_id);
            req.set_vm_id(id);
            req.set_vm_name(name);
            req.set_vcpu(vcpu);
            req.set_ram_gib(ram_gib);
            req.set_disk_gib(disk_gib);
            req.set_ip_address(ip);
            req.set_template(template);
        }
        let response = request.send().promise.await.map_err(rpc_err)?;
        check_ack(response.get().map_err(rpc_err)?.get_resp().map_err(rpc_err)?)
    }

    pub async fn report_vm_deleted(&self, agent_id: &str, id: &str) -> Result<(), AgentError> {
        let mut request = self.client.report_vm_deleted_request();
        {
            let mut req = request.get().init_req();
            req.set_agent_id(agent_id);
            req.set_vm_id(id);
        }
        let response = request.send().promise.await.map_err(rpc_err)?;
        check_ack(response.get().map_err(rpc_err)?.get_resp().map_err(rpc_err)?)
    }

    pub async fn report_vm_status_change(
        &self,
        agent_id: &str,
        id: &str,
        state: &VmState,
    ) -> Result<(), AgentError> {
        let mut request = self.client.report_vm_status_change_request();
        {
            let mut req = request.get().init_req();
            req.set_agent_id(agent_id);
            req.set_vm_id(id);
            req.set_state(state.as_str());
        }
        let response = request.send().promise.await.map_err(rpc_err)?;
        check_ack(response.get().map_err(rpc_err)?.get_resp().map_err(rpc_err)?)
    }

    pub async fn unregister(&self, agent_id: &str) -> Result<(), AgentError> {
        let mut request = self.client.unregister_agent_request();
        request.get().init_req().set_agent_id(agent_id);
        let response = request.send().promise.await.map_err(rpc_err)?;
        check_ack(response.get().map_err(rpc_err)?.get_resp().map_err(rpc_err)?)
    }
}

/// The heartbeat task: a timer tick racing a cancellation signal, with
/// engine report events drained in between. On cancellation the agent is
/// unregistered within a bounded budget.
pub async fn run_heartbeat(
    client: OrchestratorClient,
    agent_id: String,
    interval: Duration,
    ledger: Arc<ResourceLedger>,
    registry: Arc<VmRegistry>,
    heartbeat_ok: Arc<AtomicBool>,
    mut reports: UnboundedReceiver<ReportEvent>,
    shutdown: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "heartbeat loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let resources = ledger.snapshot();
                let vms = registry.find_all();
                match client.heartbeat_with_retry(&agent_id, &resources, &vms).await {
                    Ok(commands) => {
                        heartbeat_ok.store(true, Ordering::Relaxed);
                        debug!(vms = vms.len(), "heartbeat sent");
                        for (opcode, payload) in commands {
                            // Recognized but not executed; dispatch is an
                            // explicit extension point.
                            info!(opcode = %opcode, payload = %payload, "orchestrator command received, not dispatched");
                        }
                    }
                    Err(e) => {
                        heartbeat_ok.store(false, Ordering::Relaxed);
                        error!(error = %e, "heartbeat failed after retries");
                    }
                }
            }
            event = reports.recv() => {
                match event {
                    Some(event) => report(&client, &agent_id, event).await,
                    None => break,
                }
            }
        }
    }

    info!("heartbeat loop stopping, unregistering");
    match tokio::time::timeout(UNREGISTER_BUDGET, client.unregister(&agent_id)).await {
        Ok(Ok(())) => info!("unregistered from orchestrator"),
        Ok(Err(e)) => warn!(error = %e, "unregister failed"),
        Err(_) => warn!("unregister timed out"),
    }
}

async fn report(client: &OrchestratorClient, agent_id: &str, event: ReportEvent) {
    let result = match &event {
        ReportEvent::Created {
            id,
            name,
            vcpu,
            ram_gib,
            disk_gib,
            ip,
            template,
        } => {
            client
                .report_vm_created(agent_id, id, name, *vcpu, *ram_gib, *disk_gib, ip, template)
                .await
        }
        ReportEvent::Deleted { id } => client.report_vm_deleted(agent_id, id).await,
        ReportEvent::StateChanged { id, state } => {
            client.report_vm_status_change(agent_id, id, state).await
        }
    };
    if let Err(e) = result {
        warn!(error = %e, ?event, "vm event report failed");
    }
}

fn fill_resources(mut builder: common_capnp::resource_info::Builder<'_>, snap: &ResourceSnapshot) {
    builder.set_total_cpu(snap.total_cpu);
    builder.set_available_cpu(snap.available_cpu);
    builder.set_reserved_cpu(snap.reserved_cpu);
    builder.set_total_ram_gib(snap.total_ram_gib);
    builder.set_available_ram_gib(snap.available_ram_gib);
    builder.set_reserved_ram_gib(snap.reserved_ram_gib);
    builder.set_total_disk_gib(snap.total_disk_gib);
    builder.set_available_disk_gib(snap.available_disk_gib);
    builder.set_reserved_disk_gib(snap.reserved_disk_gib);
}

fn read_text(field: capnp::Result<capnp::text::Reader<'_>>) -> String {
    field
        .ok()
        .and_then(|t| t.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn check_ack(ack: commands::orchestrator_capnp::ack::Reader<'_>) -> Result<(), AgentError> {
    if !ack.get_success() {
        let message = read_text(ack.get_message());
        return Err(AgentError::Network(format!("report rejected: {message}")));
    }
    Ok(())
}
