//! In-memory [`VirtualBox`] for tests.
//!
//! Keeps a registry of machines, host-only networks and DHCP servers, and
//! records every call in order so tests can assert on the exact sequence
//! issued against the control layer.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use ipnetwork::Ipv4Network;

use super::{
    models::{
        DhcpServer, HostonlyNetwork, Machine, MachineState, Nic, PortForward,
        StorageController, StorageMedium,
    },
    StartType, VirtualBox,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetMachine(String),
    CreateMachine(String),
    StartMachine(String, StartType),
    RefreshMachine(String),
    AddStorageController(String, StorageController),
    AttachStorage(String, String, StorageMedium),
    CloneMedium(PathBuf, PathBuf),
    SetNic(String, u8, Nic),
    AddNatPortForward(String, u8, PortForward),
    HostonlyNetworks,
    CreateHostonlyNetwork,
    ConfigureHostonlyNetwork(HostonlyNetwork),
    DhcpServers,
    AddDhcpServer(DhcpServer),
    ModifyDhcpServer(DhcpServer),
}

impl Call {
    /// Name of the trait method this call went through.
    pub fn op(&self) -> &'static str {
        match self {
            Self::GetMachine(_) => "get_machine",
            Self::CreateMachine(_) => "create_machine",
            Self::StartMachine(..) => "start_machine",
            Self::RefreshMachine(_) => "refresh_machine",
            Self::AddStorageController(..) => "add_storage_controller",
            Self::AttachStorage(..) => "attach_storage",
            Self::CloneMedium(..) => "clone_medium",
            Self::SetNic(..) => "set_nic",
            Self::AddNatPortForward(..) => "add_nat_port_forward",
            Self::HostonlyNetworks => "hostonly_networks",
            Self::CreateHostonlyNetwork => "create_hostonly_network",
            Self::ConfigureHostonlyNetwork(_) => "configure_hostonly_network",
            Self::DhcpServers => "dhcp_servers",
            Self::AddDhcpServer(_) => "add_dhcp_server",
            Self::ModifyDhcpServer(_) => "modify_dhcp_server",
        }
    }

    /// True for calls that change state inside VirtualBox.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::GetMachine(_) | Self::RefreshMachine(_) | Self::HostonlyNetworks | Self::DhcpServers
        )
    }
}

#[derive(Debug, Default)]
struct MockState {
    machines: HashMap<String, Machine>,
    hostonly: Vec<HostonlyNetwork>,
    dhcp: Vec<DhcpServer>,
    calls: Vec<Call>,
    refreshes: usize,
    created: usize,
}

#[derive(Debug, Default)]
pub struct MockVirtualBox {
    state: Mutex<MockState>,
    /// Refresh outcome by call number, cycled; `false` fails. Empty = always ok.
    refresh_pattern: Vec<bool>,
    fail_on: Option<&'static str>,
}

impl MockVirtualBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_machine(self, machine: Machine) -> Self {
        self.lock().machines.insert(machine.name.clone(), machine);
        self
    }

    pub fn with_hostonly_network(self, network: HostonlyNetwork) -> Self {
        self.lock().hostonly.push(network);
        self
    }

    pub fn with_dhcp_server(self, server: DhcpServer) -> Self {
        self.lock().dhcp.push(server);
        self
    }

    pub fn with_refresh_pattern(mut self, pattern: impl Into<Vec<bool>>) -> Self {
        self.refresh_pattern = pattern.into();
        self
    }

    /// Makes the named trait method fail every time it is called.
    pub fn fail_on(mut self, op: &'static str) -> Self {
        self.fail_on = Some(op);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn machine(&self, name: &str) -> Option<Machine> {
        self.lock().machines.get(name).cloned()
    }

    pub fn hostonly(&self) -> Vec<HostonlyNetwork> {
        self.lock().hostonly.clone()
    }

    pub fn dhcp(&self) -> Vec<DhcpServer> {
        self.lock().dhcp.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: Call) -> Result<MutexGuard<'_, MockState>> {
        let op = call.op();
        let mut state = self.lock();
        state.calls.push(call);
        if self.fail_on == Some(op) {
            return Err(injected(op));
        }
        Ok(state)
    }
}

fn injected(op: &str) -> Error {
    Error::Command {
        program: "VBoxManage".into(),
        args: op.into(),
        status: "exit status: 1".into(),
        stderr: format!("injected failure in {op}"),
    }
}

fn registered<'a>(state: &'a mut MockState, name: &str) -> Result<&'a mut Machine> {
    state
        .machines
        .get_mut(name)
        .ok_or_else(|| Error::MachineNotFound(name.to_string()))
}

#[async_trait]
impl VirtualBox for MockVirtualBox {
    async fn get_machine(&self, name: &str) -> Result<Machine> {
        let mut state = self.record(Call::GetMachine(name.into()))?;
        registered(&mut state, name).map(|m| m.clone())
    }

    async fn create_machine(&self, name: &str, _base_folder: Option<&Path>) -> Result<Machine> {
        let mut state = self.record(Call::CreateMachine(name.into()))?;
        state.created += 1;
        let mut machine = Machine::new(name);
        machine.uuid = format!("00000000-0000-4000-8000-{:012}", state.created);
        state.machines.insert(name.into(), machine.clone());
        Ok(machine)
    }

    async fn start_machine(&self, name: &str, start_type: StartType) -> Result<()> {
        let mut state = self.record(Call::StartMachine(name.into(), start_type))?;
        registered(&mut state, name)?.state = MachineState::Running;
        Ok(())
    }

    async fn refresh_machine(&self, machine: &mut Machine) -> Result<()> {
        let mut state = self.record(Call::RefreshMachine(machine.name.clone()))?;
        let attempt = state.refreshes;
        state.refreshes += 1;
        if !self.refresh_pattern.is_empty()
            && !self.refresh_pattern[attempt % self.refresh_pattern.len()]
        {
            return Err(injected("refresh_machine"));
        }
        *machine = registered(&mut state, &machine.name)?.clone();
        Ok(())
    }

    async fn add_storage_controller(
        &self,
        machine: &str,
        controller: &StorageController,
    ) -> Result<()> {
        let mut state =
            self.record(Call::AddStorageController(machine.into(), controller.clone()))?;
        registered(&mut state, machine)?
            .storage_controllers
            .push(controller.name.clone());
        Ok(())
    }

    async fn attach_storage(
        &self,
        machine: &str,
        controller: &str,
        medium: &StorageMedium,
    ) -> Result<()> {
        let mut state = self.record(Call::AttachStorage(
            machine.into(),
            controller.into(),
            medium.clone(),
        ))?;
        registered(&mut state, machine)?;
        Ok(())
    }

    async fn clone_medium(&self, source: &Path, target: &Path) -> Result<()> {
        self.record(Call::CloneMedium(source.into(), target.into()))?;
        Ok(())
    }

    async fn set_nic(&self, machine: &str, index: u8, nic: &Nic) -> Result<()> {
        let mut state = self.record(Call::SetNic(machine.into(), index, nic.clone()))?;
        registered(&mut state, machine)?
            .nics
            .insert(index, nic.network.attachment());
        Ok(())
    }

    async fn add_nat_port_forward(
        &self,
        machine: &str,
        index: u8,
        rule: &PortForward,
    ) -> Result<()> {
        let mut state =
            self.record(Call::AddNatPortForward(machine.into(), index, rule.clone()))?;
        registered(&mut state, machine)?;
        Ok(())
    }

    async fn hostonly_networks(&self) -> Result<Vec<HostonlyNetwork>> {
        let state = self.record(Call::HostonlyNetworks)?;
        Ok(state.hostonly.clone())
    }

    async fn create_hostonly_network(&self) -> Result<HostonlyNetwork> {
        let mut state = self.record(Call::CreateHostonlyNetwork)?;
        let network = HostonlyNetwork {
            name: format!("vboxnet{}", state.hostonly.len()),
            guid: String::new(),
            dhcp: false,
            ipv4: Ipv4Network::from(Ipv4Addr::UNSPECIFIED),
            hw_addr: String::new(),
            status: "Down".into(),
        };
        state.hostonly.push(network.clone());
        Ok(network)
    }

    async fn configure_hostonly_network(&self, network: &HostonlyNetwork) -> Result<()> {
        let mut state = self.record(Call::ConfigureHostonlyNetwork(network.clone()))?;
        let existing = state
            .hostonly
            .iter_mut()
            .find(|n| n.name == network.name)
            .ok_or(Error::HostonlyNetworkNotFound)?;
        existing.ipv4 = network.ipv4;
        Ok(())
    }

    async fn dhcp_servers(&self) -> Result<Vec<DhcpServer>> {
        let state = self.record(Call::DhcpServers)?;
        Ok(state.dhcp.clone())
    }

    async fn add_dhcp_server(&self, server: &DhcpServer) -> Result<()> {
        let mut state = self.record(Call::AddDhcpServer(server.clone()))?;
        state.dhcp.push(server.clone());
        Ok(())
    }

    async fn modify_dhcp_server(&self, server: &DhcpServer) -> Result<()> {
        let mut state = self.record(Call::ModifyDhcpServer(server.clone()))?;
        let existing = state
            .dhcp
            .iter_mut()
            .find(|d| d.network_name == server.network_name)
            .ok_or_else(|| Error::DhcpServerNotFound(server.network_name.clone()))?;
        *existing = server.clone();
        Ok(())
    }
}
