//! Cap'n Proto client for the agent's control RPC.

use std::net::SocketAddr;
use std::time::Duration;

use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};
use commands::agent_capnp::{
    agent, create_vm_response, delete_vm_response, get_vm_status_response, list_vms_response,
    start_vm_response, stop_vm_response,
};
use commands::common_capnp::status;
use futures::AsyncReadExt;

use crate::commands::CliError;

pub struct CreatedVm {
    pub id: String,
    pub ip: String,
    pub state: String,
}

pub struct VmRow {
    pub id: String,
    pub name: String,
    pub state: String,
    pub ip: String,
}

pub struct VmStatus {
    pub id: String,
    pub name: String,
    pub state: String,
    pub vcpu: u32,
    pub ram_gib: u32,
    pub disk_gib: u32,
    pub ip: String,
    pub uptime_seconds: i64,
    pub cpu_usage_percent: f32,
    pub ram_usage_percent: f32,
}

pub struct Client {
    client: agent::Client,
    timeout: Duration,
}

fn wire_err(e: impl std::fmt::Display) -> CliError {
    CliError::RequestFailed(e.to_string())
}

fn status_err(status: status::Reader<'_>) -> CliError {
    let code = status
        .get_code()
        .map(|c| format!("{c:?}"))
        .unwrap_or_else(|_| "Unknown".into());
    let message = status
        .get_message()
        .ok()
        .and_then(|t| t.to_str().ok())
        .unwrap_or_default();
    CliError::RequestFailed(format!("{code}: {message}"))
}

fn text(field: capnp::Result<capnp::text::Reader<'_>>) -> Result<String, CliError> {
    Ok(field.map_err(wire_err)?.to_str().map_err(wire_err)?.to_string())
}

impl Client {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, CliError> {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| CliError::ConnectFailed(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| CliError::ConnectFailed(e.to_string()))?;
        let (reader, writer) = tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();
        let rpc_network = Box::new(twoparty::VatNetwork::new(
            futures::io::BufReader::new(reader),
            futures::io::BufWriter::new(writer),
            rpc_twoparty_capnp::Side::Client,
            Default::default(),
        ));
        let mut rpc_system = RpcSystem::new(rpc_network, None);
        let client: agent::Client = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);

        tokio::task::spawn_local(rpc_system);
        Ok(Self { client, timeout })
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, CliError>>,
    ) -> Result<T, CliError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| {
                CliError::RequestFailed(format!(
                    "request timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
    }

    pub async fn create_vm(
        &self,
        name: &str,
        vcpu: u32,
        ram_gib: u32,
        disk_gib: u32,
        template: &str,
    ) -> Result<CreatedVm, CliError> {
        let mut request = self.client.create_vm_request();
        {
            let mut req = request.get().init_req();
            req.set_name(name);
            req.set_vcpu(vcpu);
            req.set_ram_gib(ram_gib);
            req.set_disk_gib(disk_gib);
            req.set_template(template);
        }
        self.bounded(async move {
            let response = request.send().promise.await.map_err(wire_err)?;
            let resp = response.get().map_err(wire_err)?.get_resp().map_err(wire_err)?;
            match resp.which().map_err(wire_err)? {
                create_vm_response::Which::Ok(reply) => {
                    let reply = reply.map_err(wire_err)?;
                    Ok(CreatedVm {
                        id: text(reply.get_vm_id())?,
                        ip: text(reply.get_ip_address())?,
                        state: text(reply.get_state())?,
                    })
                }
                create_vm_response::Which::Error(status) => {
                    Err(status_err(status.map_err(wire_err)?))
                }
            }
        })
        .await
    }

    pub async fn delete_vm(&self, vm_id: &str) -> Result<(), CliError> {
        let mut request = self.client.delete_vm_request();
        request.get().init_req().set_vm_id(vm_id);
        self.bounded(async move {
            let response = request.send().promise.await.map_err(wire_err)?;
            let resp = response.get().map_err(wire_err)?.get_resp().map_err(wire_err)?;
            match resp.which().map_err(wire_err)? {
                delete_vm_response::Which::Ok(()) => Ok(()),
                delete_vm_response::Which::Error(status) => {
                    Err(status_err(status.map_err(wire_err)?))
                }
            }
        })
        .await
    }

    pub async fn start_vm(&self, vm_id: &str) -> Result<String, CliError> {
        let mut request = self.client.start_vm_request();
        request.get().init_req().set_vm_id(vm_id);
        self.bounded(async move {
            let response = request.send().promise.await.map_err(wire_err)?;
            let resp = response.get().map_err(wire_err)?.get_resp().map_err(wire_err)?;
            match resp.which().map_err(wire_err)? {
                start_vm_response::Which::Ok(state) => text(state),
                start_vm_response::Which::Error(status) => {
                    Err(status_err(status.map_err(wire_err)?))
                }
            }
        })
        .await
    }

    pub async fn stop_vm(&self, vm_id: &str, force: bool) -> Result<String, CliError> {
        let mut request = self.client.stop_vm_request();
        {
            let mut req = request.get().init_req();
            req.set_vm_id(vm_id);
            req.set_force(force);
        }
        self.bounded(async move {
            let response = request.send().promise.await.map_err(wire_err)?;
            let resp = response.get().map_err(wire_err)?.get_resp().map_err(wire_err)?;
            match resp.which().map_err(wire_err)? {
                stop_vm_response::Which::Ok(state) => text(state),
                stop_vm_response::Which::Error(status) => {
                    Err(status_err(status.map_err(wire_err)?))
                }
            }
        })
        .await
    }

    pub async fn vm_status(&self, vm_id: &str) -> Result<VmStatus, CliError> {
        let mut request = self.client.get_vm_status_request();
        request.get().init_req().set_vm_id(vm_id);
        self.bounded(async move {
            let response = request.send().promise.await.map_err(wire_err)?;
            let resp = response.get().map_err(wire_err)?.get_resp().map_err(wire_err)?;
            match resp.which().map_err(wire_err)? {
                get_vm_status_response::Which::Ok(reply) => {
                    let reply = reply.map_err(wire_err)?;
                    Ok(VmStatus {
                        id: text(reply.get_vm_id())?,
                        name: text(reply.get_name())?,
                        state: text(reply.get_state())?,
                        vcpu: reply.get_vcpu(),
                        ram_gib: reply.get_ram_gib(),
                        disk_gib: reply.get_disk_gib(),
                        ip: text(reply.get_ip_address())?,
                        uptime_seconds: reply.get_uptime_seconds(),
                        cpu_usage_percent: reply.get_cpu_usage_percent(),
                        ram_usage_percent: reply.get_ram_usage_percent(),
                    })
                }
                get_vm_status_response::Which::Error(status) => {
                    Err(status_err(status.map_err(wire_err)?))
                }
            }
        })
        .await
    }

    pub async fn list_vms(&self) -> Result<Vec<VmRow>, CliError> {
        let request = self.client.list_vms_request();
        self.bounded(async move {
            let response = request.send().promise.await.map_err(wire_err)?;
            let resp = response.get().map_err(wire_err)?.get_resp().map_err(wire_err)?;
            match resp.which().map_err(wire_err)? {
                list_vms_response::Which::Ok(vms) => {
                    let vms = vms.map_err(wire_err)?;
                    let mut rows = Vec::with_capacity(vms.len() as usize);
                    for vm in vms.iter() {
                        rows.push(VmRow {
                            id: text(vm.get_id())?,
                            name: text(vm.get_name())?,
                            state: text(vm.get_state())?,
                            ip: text(vm.get_ip_address())?,
                        });
                    }
                    Ok(rows)
                }
                list_vms_response::Which::Error(status) => {
                    Err(status_err(status.map_err(wire_err)?))
                }
            }
        })
        .await
    }
}
