use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tracing::debug;

use self::models::{
    DhcpServer, HostonlyNetwork, Machine, Nic, NicNetwork, PortForward, StorageController,
    StorageMedium,
};
use crate::{
    cmd::{self, Echo},
    error::{Error, Result},
};

pub mod mock;
pub mod models;
pub mod parse;

const MACHINE_NOT_FOUND: &str = "Could not find a registered machine";

/// How `startvm` should bring the machine up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StartType {
    #[default]
    Headless,
    Gui,
    Separate,
}

impl StartType {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Headless => "headless",
            Self::Gui => "gui",
            Self::Separate => "separate",
        }
    }
}

/// The VirtualBox control surface this crate drives.
///
/// Every call is a single blocking round trip into VirtualBox, which owns
/// all machine and network state. "Not found" outcomes are reported as
/// [`Error::MachineNotFound`] so callers can fall through to creation.
#[async_trait]
pub trait VirtualBox: Send + Sync {
    async fn get_machine(&self, name: &str) -> Result<Machine>;

    async fn create_machine(&self, name: &str, base_folder: Option<&Path>) -> Result<Machine>;

    async fn start_machine(&self, name: &str, start_type: StartType) -> Result<()>;

    /// Re-reads the live state of `machine` in place.
    async fn refresh_machine(&self, machine: &mut Machine) -> Result<()>;

    async fn add_storage_controller(
        &self,
        machine: &str,
        controller: &StorageController,
    ) -> Result<()>;

    async fn attach_storage(
        &self,
        machine: &str,
        controller: &str,
        medium: &StorageMedium,
    ) -> Result<()>;

    async fn clone_medium(&self, source: &Path, target: &Path) -> Result<()>;

    async fn set_nic(&self, machine: &str, index: u8, nic: &Nic) -> Result<()>;

    async fn add_nat_port_forward(&self, machine: &str, index: u8, rule: &PortForward)
        -> Result<()>;

    async fn hostonly_networks(&self) -> Result<Vec<HostonlyNetwork>>;

    /// Asks VirtualBox for a fresh host-only adapter; the name is assigned
    /// by VirtualBox.
    async fn create_hostonly_network(&self) -> Result<HostonlyNetwork>;

    /// Pushes the IPv4 settings of `network` to VirtualBox.
    async fn configure_hostonly_network(&self, network: &HostonlyNetwork) -> Result<()>;

    async fn dhcp_servers(&self) -> Result<Vec<DhcpServer>>;

    async fn add_dhcp_server(&self, server: &DhcpServer) -> Result<()>;

    async fn modify_dhcp_server(&self, server: &DhcpServer) -> Result<()>;
}

/// [`VirtualBox`] backed by the `VBoxManage` command-line tool.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    program: PathBuf,
    echo: Echo,
}

impl Default for VBoxManage {
    fn default() -> Self {
        Self::new("VBoxManage")
    }
}

impl VBoxManage {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            echo: Echo::Quiet,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.echo = if verbose { Echo::Verbose } else { Echo::Quiet };
        self
    }

    async fn manage<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        cmd::run(&self.program, args, self.echo).await
    }

    async fn show_vm_info(&self, name: &str) -> Result<Machine> {
        let out = self
            .manage(["showvminfo", name, "--machinereadable"])
            .await
            .map_err(|e| not_found(name, e))?;
        parse::machine(&out)
    }

    async fn dhcp_server_args(&self, verb: &str, server: &DhcpServer) -> Result<()> {
        let args = vec![
            "dhcpserver".to_string(),
            verb.to_string(),
            "--netname".to_string(),
            server.network_name.clone(),
            "--ip".to_string(),
            server.server_ip.to_string(),
            "--netmask".to_string(),
            server.ipv4.mask().to_string(),
            "--lowerip".to_string(),
            server.lower_ip.to_string(),
            "--upperip".to_string(),
            server.upper_ip.to_string(),
            if server.enabled { "--enable" } else { "--disable" }.to_string(),
        ];
        self.manage(args).await?;
        Ok(())
    }
}

fn not_found(name: &str, err: Error) -> Error {
    match err {
        Error::Command { stderr, .. } if stderr.contains(MACHINE_NOT_FOUND) => {
            Error::MachineNotFound(name.to_string())
        }
        other => other,
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

#[async_trait]
impl VirtualBox for VBoxManage {
    async fn get_machine(&self, name: &str) -> Result<Machine> {
        self.show_vm_info(name).await
    }

    async fn create_machine(&self, name: &str, base_folder: Option<&Path>) -> Result<Machine> {
        let mut args: Vec<OsString> = vec!["createvm".into(), "--name".into(), name.into()];
        if let Some(folder) = base_folder {
            args.push("--basefolder".into());
            args.push(folder.as_os_str().to_owned());
        }
        args.push("--register".into());
        self.manage(args).await?;
        self.show_vm_info(name).await
    }

    async fn start_machine(&self, name: &str, start_type: StartType) -> Result<()> {
        self.manage(["startvm", name, "--type", start_type.as_arg()])
            .await?;
        Ok(())
    }

    async fn refresh_machine(&self, machine: &mut Machine) -> Result<()> {
        *machine = self.show_vm_info(&machine.name).await?;
        Ok(())
    }

    async fn add_storage_controller(
        &self,
        machine: &str,
        controller: &StorageController,
    ) -> Result<()> {
        let ports = controller.ports.to_string();
        self.manage([
            "storagectl",
            machine,
            "--name",
            controller.name.as_str(),
            "--add",
            controller.sys_bus.as_arg(),
            "--portcount",
            ports.as_str(),
            "--controller",
            controller.chipset.as_arg(),
            "--hostiocache",
            on_off(controller.host_io_cache),
            "--bootable",
            on_off(controller.bootable),
        ])
        .await?;
        Ok(())
    }

    async fn attach_storage(
        &self,
        machine: &str,
        controller: &str,
        medium: &StorageMedium,
    ) -> Result<()> {
        let port = medium.port.to_string();
        let device = medium.device.to_string();
        let path = medium.medium.to_string_lossy();
        self.manage([
            "storageattach",
            machine,
            "--storagectl",
            controller,
            "--port",
            port.as_str(),
            "--device",
            device.as_str(),
            "--type",
            "hdd",
            "--medium",
            &*path,
        ])
        .await?;
        Ok(())
    }

    async fn clone_medium(&self, source: &Path, target: &Path) -> Result<()> {
        self.manage([
            OsStr::new("clonemedium"),
            OsStr::new("disk"),
            source.as_os_str(),
            target.as_os_str(),
        ])
        .await?;
        Ok(())
    }

    async fn set_nic(&self, machine: &str, index: u8, nic: &Nic) -> Result<()> {
        let mut args = vec![
            "modifyvm".to_string(),
            machine.to_string(),
            format!("--nic{index}"),
            nic.network.attachment().to_string(),
            format!("--nictype{index}"),
            nic.hardware.as_arg().to_string(),
        ];
        if let NicNetwork::Hostonly(adapter) = &nic.network {
            args.push(format!("--hostonlyadapter{index}"));
            args.push(adapter.clone());
        }
        self.manage(args).await?;
        Ok(())
    }

    async fn add_nat_port_forward(
        &self,
        machine: &str,
        index: u8,
        rule: &PortForward,
    ) -> Result<()> {
        self.manage([
            "modifyvm".to_string(),
            machine.to_string(),
            format!("--natpf{index}"),
            rule.as_arg(),
        ])
        .await?;
        Ok(())
    }

    async fn hostonly_networks(&self) -> Result<Vec<HostonlyNetwork>> {
        let out = self.manage(["list", "hostonlyifs"]).await?;
        parse::hostonly_networks(&out)
    }

    async fn create_hostonly_network(&self) -> Result<HostonlyNetwork> {
        let out = self.manage(["hostonlyif", "create"]).await?;
        let name = parse::created_interface(&out)?;
        debug!(%name, "host-only interface created");

        self.hostonly_networks()
            .await?
            .into_iter()
            .find(|net| net.name == name)
            .ok_or(Error::HostonlyNetworkNotFound)
    }

    async fn configure_hostonly_network(&self, network: &HostonlyNetwork) -> Result<()> {
        let ip = network.ipv4.ip().to_string();
        let mask = network.ipv4.mask().to_string();
        self.manage([
            "hostonlyif",
            "ipconfig",
            network.name.as_str(),
            "--ip",
            ip.as_str(),
            "--netmask",
            mask.as_str(),
        ])
        .await?;
        Ok(())
    }

    async fn dhcp_servers(&self) -> Result<Vec<DhcpServer>> {
        let out = self.manage(["list", "dhcpservers"]).await?;
        parse::dhcp_servers(&out)
    }

    async fn add_dhcp_server(&self, server: &DhcpServer) -> Result<()> {
        self.dhcp_server_args("add", server).await
    }

    async fn modify_dhcp_server(&self, server: &DhcpServer) -> Result<()> {
        self.dhcp_server_args("modify", server).await
    }
}
