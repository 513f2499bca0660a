//! Inbound control RPC: translates wire requests into engine calls and
//! engine errors into coded statuses.
//!
//! Error code mapping: validation → invalidArgument, not-found → notFound,
//! conflict → alreadyExists, resource exhaustion → resourceExhausted,
//! everything else → internal with the human message preserved.

use std::net::SocketAddr;
use std::sync::Arc;

use capnp::capability::Promise;
use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};
use commands::agent_capnp::agent;
use commands::common_capnp::{self, ErrorCode};
use futures::AsyncReadExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::disks::OverlayStore;
use crate::engine::Engine;
use crate::error::AgentError;
use crate::hypervisor::Hypervisor;
use crate::images::ImageFetcher;
use crate::orchestrator::ReportEvent;

pub struct Server<H: Hypervisor, S: OverlayStore, F: ImageFetcher> {
    engine: Arc<Engine<H, S, F>>,
    reports: UnboundedSender<ReportEvent>,
}

impl<H: Hypervisor, S: OverlayStore, F: ImageFetcher> Server<H, S, F> {
    pub fn new(engine: Arc<Engine<H, S, F>>, reports: UnboundedSender<ReportEvent>) -> Self {
        Server { engine, reports }
    }

    /// Accept loop. Runs inside a LocalSet; each connection gets its own
    /// RPC system task. Cancelling the token stops accepting new
    /// connections.
    pub async fn serve(
        self,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error>> {
        info!(addr = %addr, "control rpc listening");
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        let client: agent::Client = capnp_rpc::new_client(self);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("control rpc stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            let (stream, peer_addr) = accepted?;
            debug!(peer_addr = %peer_addr, "new control connection");
            stream.set_nodelay(true)?;
            let (reader, writer) =
                tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();
            let network = twoparty::VatNetwork::new(
                futures::io::BufReader::new(reader),
                futures::io::BufWriter::new(writer),
                rpc_twoparty_capnp::Side::Server,
                Default::default(),
            );

            let rpc_system = RpcSystem::new(Box::new(network), Some(client.clone().client));
            tokio::task::spawn_local(rpc_system);
        }
    }
}

fn error_code(err: &AgentError) -> ErrorCode {
    match err {
        AgentError::Validation(_) => ErrorCode::InvalidArgument,
        AgentError::NotFound(_) => ErrorCode::NotFound,
        AgentError::Conflict(_) => ErrorCode::AlreadyExists,
        AgentError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        _ => ErrorCode::Internal,
    }
}

fn write_status(mut status: common_capnp::status::Builder<'_>, err: &AgentError) {
    status.set_code(error_code(err));
    status.set_message(err.message());
}

impl<H: Hypervisor, S: OverlayStore, F: ImageFetcher> agent::Server for Server<H, S, F> {
    fn create_vm(
        &mut self,
        params: agent::CreateVmParams,
        mut results: agent::CreateVmResults,
    ) -> Promise<(), capnp::Error> {
        let engine = self.engine.clone();
        let reports = self.reports.clone();
        Promise::from_future(async move {
            let req = params.get()?.get_req()?;
            let name = req.get_name()?.to_str()?.to_string();
            let vcpu = req.get_vcpu();
            let ram_gib = req.get_ram_gib();
            let disk_gib = req.get_disk_gib();
            let template = req.get_template()?.to_str()?.to_string();
            debug!(vm_id = %name, "rpc create_vm");

            let mut resp = results.get().init_resp();
            match engine.create(&name, vcpu, ram_gib, disk_gib, &template).await {
                Ok(created) => {
                    let _ = reports.send(ReportEvent::Created {
                        id: created.id.clone(),
                        name: name.clone(),
                        vcpu,
                        ram_gib,
                        disk_gib,
                        ip: created.ip.clone(),
                        template,
                    });
                    let mut ok = resp.init_ok();
                    ok.set_vm_id(created.id.as_str());
                    ok.set_ip_address(created.ip.as_str());
                    ok.set_state(created.state.as_str());
                }
                Err(e) => write_status(resp.init_error(), &e),
            }
            Ok(())
        })
    }

    fn delete_vm(
        &mut self,
        params: agent::DeleteVmParams,
        mut results: agent::DeleteVmResults,
    ) -> Promise<(), capnp::Error> {
        let engine = self.engine.clone();
        let reports = self.reports.clone();
        Promise::from_future(async move {
            let vm_id = params.get()?.get_req()?.get_vm_id()?.to_str()?.to_string();
            debug!(vm_id = %vm_id, "rpc delete_vm");

            let mut resp = results.get().init_resp();
            match engine.delete(&vm_id).await {
                Ok(()) => {
                    let _ = reports.send(ReportEvent::Deleted { id: vm_id });
                    resp.set_ok(());
                }
                Err(e) => write_status(resp.init_error(), &e),
            }
            Ok(())
        })
    }

    fn start_vm(
        &mut self,
        params: agent::StartVmParams,
        mut results: agent::StartVmResults,
    ) -> Promise<(), capnp::Error> {
        let engine = self.engine.clone();
        let reports = self.reports.clone();
        Promise::from_future(async move {
            let vm_id = params.get()?.get_req()?.get_vm_id()?.to_str()?.to_string();
            debug!(vm_id = %vm_id, "rpc start_vm");

            let mut resp = results.get().init_resp();
            match engine.start(&vm_id).await {
                Ok(state) => {
                    let _ = reports.send(ReportEvent::StateChanged {
                        id: vm_id,
                        state: state.clone(),
                    });
                    resp.set_ok(state.as_str());
                }
                Err(e) => write_status(resp.init_error(), &e),
            }
            Ok(())
        })
    }

    fn stop_vm(
        &mut self,
        params: agent::StopVmParams,
        mut results: agent::StopVmResults,
    ) -> Promise<(), capnp::Error> {
        let engine = self.engine.clone();
        let reports = self.reports.clone();
        Promise::from_future(async move {
            let req = params.get()?.get_req()?;
            let vm_id = req.get_vm_id()?.to_str()?.to_string();
            let force = req.get_force();
            debug!(vm_id = %vm_id, force, "rpc stop_vm");

            let mut resp = results.get().init_resp();
            match engine.stop(&vm_id, force).await {
                Ok(state) => {
                    let _ = reports.send(ReportEvent::StateChanged {
                        id: vm_id,
                        state: state.clone(),
                    });
                    resp.set_ok(state.as_str());
                }
                Err(e) => write_status(resp.init_error(), &e),
            }
            Ok(())
        })
    }

    fn get_vm_status(
        &mut self,
        params: agent::GetVmStatusParams,
        mut results: agent::GetVmStatusResults,
    ) -> Promise<(), capnp::Error> {
        let engine = self.engine.clone();
        Promise::from_future(async move {
            let vm_id = params.get()?.get_req()?.get_vm_id()?.to_str()?.to_string();
            debug!(vm_id = %vm_id, "rpc get_vm_status");

            let mut resp = results.get().init_resp();
            match engine.status(&vm_id).await {
                Ok(report) => {
                    let mut ok = resp.init_ok();
                    ok.set_vm_id(report.id.as_str());
                    ok.set_name(report.name.as_str());
                    ok.set_state(report.state.as_str());
                    ok.set_vcpu(report.vcpu);
                    ok.set_ram_gib(report.ram_gib);
                    ok.set_disk_gib(report.disk_gib);
                    ok.set_ip_address(report.ip.as_str());
                    ok.set_uptime_seconds(report.uptime_seconds);
                    ok.set_cpu_usage_percent(report.cpu_usage_percent);
                    ok.set_ram_usage_percent(report.ram_usage_percent);
                }
                Err(e) => write_status(resp.init_error(), &e),
            }
            Ok(())
        })
    }

    fn list_vms(
        &mut self,
        _params: agent::ListVmsParams,
        mut results: agent::ListVmsResults,
    ) -> Promise<(), capnp::Error> {
        let engine = self.engine.clone();
        Promise::from_future(async move {
            debug!("rpc list_vms");

            let resp = results.get().init_resp();
            match engine.list().await {
                Ok(entries) => {
                    let mut vms = resp.init_ok(entries.len() as u32);
                    for (i, entry) in entries.iter().enumerate() {
                        let mut vm = vms.reborrow().get(i as u32);
                        vm.set_id(entry.id.as_str());
                        vm.set_name(entry.name.as_str());
                        vm.set_state(entry.state.as_str());
                        vm.set_ip_address(entry.ip.as_str());
                        vm.set_vcpu(entry.vcpu);
                        vm.set_ram_gib(entry.ram_gib);
                    }
                }
                Err(e) => write_status(resp.init_error(), &e),
            }
            Ok(())
        })
    }
}
