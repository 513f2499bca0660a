use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::client::Client;

/// Create can take minutes (image download + boot + DHCP).
const CREATE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub enum CliError {
    ConnectFailed(String),
    RequestFailed(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::ConnectFailed(msg) => write!(f, "could not reach agent: {msg}"),
            CliError::RequestFailed(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CliError {}

#[derive(Debug, Parser)]
#[command(name = "ghostctl", version)]
#[command(about = "Manage a ghost agent and its virtual machines")]
pub struct Cli {
    /// Agent RPC address
    #[arg(long, global = true, default_value = "127.0.0.1:9090")]
    agent: SocketAddr,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage virtual machines
    Vm {
        #[command(subcommand)]
        command: VmCommands,
    },
    /// Show agent status
    Status,
    /// Print the client version
    Version,
}

#[derive(Debug, Subcommand)]
enum VmCommands {
    /// List all VMs
    List,
    /// Create a new VM
    Create {
        /// VM name (also its id)
        #[arg(long)]
        name: String,
        /// Number of vCPUs
        #[arg(long, default_value_t = 2)]
        vcpu: u32,
        /// RAM in GiB
        #[arg(long, default_value_t = 4)]
        ram: u32,
        /// Disk size in GiB
        #[arg(long, default_value_t = 50)]
        disk: u32,
        /// OS template (ubuntu-22.04, ubuntu-20.04, debian-12, debian-11)
        #[arg(long, default_value = "ubuntu-22.04")]
        template: String,
    },
    /// Delete a VM
    Delete { id: String },
    /// Start a stopped VM
    Start { id: String },
    /// Stop a running VM
    Stop {
        id: String,
        /// Immediate power-off instead of a guest shutdown request
        #[arg(long)]
        force: bool,
    },
    /// Show detailed VM status
    Status { id: String },
}

impl Cli {
    pub async fn run() -> Result<(), CliError> {
        let cli = Cli::parse();
        let timeout = Duration::from_secs(cli.timeout);

        match cli.command {
            Commands::Version => {
                println!("ghostctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
            Commands::Status => {
                let client = Client::connect(cli.agent, timeout).await?;
                let vms = client.list_vms().await?;
                let running = vms.iter().filter(|vm| vm.state == "running").count();
                println!("Agent at {} is reachable", cli.agent);
                println!("  VMs: {} total, {} running", vms.len(), running);
                Ok(())
            }
            Commands::Vm { command } => {
                let timeout = match command {
                    VmCommands::Create { .. } => CREATE_TIMEOUT,
                    _ => timeout,
                };
                let client = Client::connect(cli.agent, timeout).await?;
                run_vm_command(&client, command).await
            }
        }
    }
}

async fn run_vm_command(client: &Client, command: VmCommands) -> Result<(), CliError> {
    match command {
        VmCommands::List => {
            let vms = client.list_vms().await?;
            if vms.is_empty() {
                println!("No VMs found");
                return Ok(());
            }
            println!(
                "{:<20} {:<30} {:<10} {:<15}",
                "VM ID", "NAME", "STATE", "IP ADDRESS"
            );
            for vm in vms {
                println!(
                    "{:<20} {:<30} {:<10} {:<15}",
                    vm.id, vm.name, vm.state, vm.ip
                );
            }
            Ok(())
        }
        VmCommands::Create {
            name,
            vcpu,
            ram,
            disk,
            template,
        } => {
            println!("Creating VM '{name}'...");
            let created = client.create_vm(&name, vcpu, ram, disk, &template).await?;
            println!("VM created");
            println!("  ID:    {}", created.id);
            println!("  IP:    {}", display_ip(&created.ip));
            println!("  State: {}", created.state);
            Ok(())
        }
        VmCommands::Delete { id } => {
            client.delete_vm(&id).await?;
            println!("VM '{id}' deleted");
            Ok(())
        }
        VmCommands::Start { id } => {
            let state = client.start_vm(&id).await?;
            println!("VM '{id}' is {state}");
            Ok(())
        }
        VmCommands::Stop { id, force } => {
            let state = client.stop_vm(&id, force).await?;
            println!("VM '{id}' is {state}");
            Ok(())
        }
        VmCommands::Status { id } => {
            let status = client.vm_status(&id).await?;
            println!("VM:      {} ({})", status.id, status.name);
            println!("State:   {}", status.state);
            println!("vCPU:    {}", status.vcpu);
            println!("RAM:     {} GiB", status.ram_gib);
            println!("Disk:    {} GiB", status.disk_gib);
            println!("IP:      {}", display_ip(&status.ip));
            println!("Uptime:  {}s", status.uptime_seconds);
            println!(
                "Usage:   cpu {:.1}%, ram {:.1}%",
                status.cpu_usage_percent, status.ram_usage_percent
            );
            Ok(())
        }
    }
}

fn display_ip(ip: &str) -> &str {
    if ip.is_empty() {
        "(pending)"
    } else {
        ip
    }
}
