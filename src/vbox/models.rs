use std::{collections::BTreeMap, fmt, net::Ipv4Addr, path::PathBuf, str::FromStr};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    PowerOff,
    Running,
    Paused,
    Saved,
    Aborted,
    Starting,
    Stopping,
    Other(String),
}

impl MachineState {
    pub fn from_vbox(state: &str) -> Self {
        match state {
            "poweroff" => Self::PowerOff,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "saved" => Self::Saved,
            "aborted" => Self::Aborted,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerOff => write!(f, "poweroff"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Saved => write!(f, "saved"),
            Self::Aborted => write!(f, "aborted"),
            Self::Starting => write!(f, "starting"),
            Self::Stopping => write!(f, "stopping"),
            Self::Other(state) => write!(f, "{}", state),
        }
    }
}

/// The control layer's view of a registered machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    pub uuid: String,
    pub state: MachineState,
    pub os_type: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub vram_mb: u32,
    pub cfg_file: String,
    /// Attachment per NIC index, only for slots that are not `none`.
    pub nics: BTreeMap<u8, NicAttachment>,
    pub storage_controllers: Vec<String>,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: String::new(),
            state: MachineState::PowerOff,
            os_type: "Other".into(),
            cpus: 1,
            memory_mb: 128,
            vram_mb: 8,
            cfg_file: String::new(),
            nics: BTreeMap::new(),
            storage_controllers: Vec::new(),
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] state={} os={} cpus={} memory={}MiB vram={}MiB",
            self.name, self.uuid, self.state, self.os_type, self.cpus, self.memory_mb, self.vram_mb
        )?;
        let nics = self
            .nics
            .iter()
            .map(|(index, mode)| format!("{index}:{mode}"))
            .collect::<Vec<_>>();
        write!(f, " nics=[{}]", nics.join(","))?;
        write!(f, " storage=[{}]", self.storage_controllers.join(","))
    }
}

/// What a NIC slot is attached to, as `showvminfo` reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicAttachment {
    Nat,
    Hostonly,
    Other(String),
}

impl NicAttachment {
    pub fn from_vbox(mode: &str) -> Self {
        match mode {
            "nat" => Self::Nat,
            "hostonly" => Self::Hostonly,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for NicAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nat => write!(f, "nat"),
            Self::Hostonly => write!(f, "hostonly"),
            Self::Other(mode) => write!(f, "{}", mode),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum SysBus {
    Ide,
    Sata,
    Scsi,
    Sas,
    Floppy,
    Usb,
    Pcie,
}

impl SysBus {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Ide => "ide",
            Self::Sata => "sata",
            Self::Scsi => "scsi",
            Self::Sas => "sas",
            Self::Floppy => "floppy",
            Self::Usb => "usb",
            Self::Pcie => "pcie",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Chipset {
    IntelAhci,
    Piix3,
    Piix4,
    Ich6,
    LsiLogic,
    BusLogic,
    LsiLogicSas,
    Nvme,
}

impl Chipset {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::IntelAhci => "IntelAhci",
            Self::Piix3 => "PIIX3",
            Self::Piix4 => "PIIX4",
            Self::Ich6 => "ICH6",
            Self::LsiLogic => "LSILogic",
            Self::BusLogic => "BusLogic",
            Self::LsiLogicSas => "LSILogicSAS",
            Self::Nvme => "NVMe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageController {
    pub name: String,
    pub sys_bus: SysBus,
    pub ports: u32,
    pub chipset: Chipset,
    pub host_io_cache: bool,
    pub bootable: bool,
}

impl Default for StorageController {
    fn default() -> Self {
        Self {
            name: "storctrl0".into(),
            sys_bus: SysBus::Sata,
            ports: 1,
            chipset: Chipset::IntelAhci,
            host_io_cache: true,
            bootable: true,
        }
    }
}

/// A hard disk image attached at `port`/`device` of a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMedium {
    pub port: u32,
    pub device: u32,
    pub medium: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NicNetwork {
    Nat,
    /// Host-only, on the named adapter.
    Hostonly(String),
}

impl NicNetwork {
    pub fn attachment(&self) -> NicAttachment {
        match self {
            Self::Nat => NicAttachment::Nat,
            Self::Hostonly(_) => NicAttachment::Hostonly,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NicHardware {
    Am79C970A,
    Am79C973,
    #[default]
    IntelPro1000MtDesktop,
    IntelPro1000TServer,
    IntelPro1000MtServer,
    Virtio,
}

impl NicHardware {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Am79C970A => "Am79C970A",
            Self::Am79C973 => "Am79C973",
            Self::IntelPro1000MtDesktop => "82540EM",
            Self::IntelPro1000TServer => "82543GC",
            Self::IntelPro1000MtServer => "82545EM",
            Self::Virtio => "virtio",
        }
    }
}

impl FromStr for NicHardware {
    type Err = Error;

    /// Accepts the `--nictype` names, e.g. `82540EM` or `virtio`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Am79C970A,
            Self::Am79C973,
            Self::IntelPro1000MtDesktop,
            Self::IntelPro1000TServer,
            Self::IntelPro1000MtServer,
            Self::Virtio,
        ]
        .into_iter()
        .find(|hw| hw.as_arg().eq_ignore_ascii_case(s))
        .ok_or_else(|| Error::parse("nic hardware", format!("unknown NIC type {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    pub network: NicNetwork,
    pub hardware: NicHardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// A NAT port-forward rule, e.g. host 2222 to guest 22.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub name: String,
    pub proto: Protocol,
    pub host_ip: Option<Ipv4Addr>,
    pub host_port: u16,
    pub guest_ip: Option<Ipv4Addr>,
    pub guest_port: u16,
}

impl PortForward {
    /// Renders the rule the way `--natpfN` expects it.
    pub fn as_arg(&self) -> String {
        let ip = |ip: Option<Ipv4Addr>| ip.map(|ip| ip.to_string()).unwrap_or_default();
        format!(
            "{},{},{},{},{},{}",
            self.name,
            self.proto.as_arg(),
            ip(self.host_ip),
            self.host_port,
            ip(self.guest_ip),
            self.guest_port
        )
    }
}

impl FromStr for PortForward {
    type Err = Error;

    /// Parses `NAME:PROTO:HOSTPORT:GUESTPORT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [name, proto, host_port, guest_port] = parts.as_slice() else {
            return Err(Error::parse(
                "port forward",
                format!("{s:?} is not NAME:PROTO:HOSTPORT:GUESTPORT"),
            ));
        };
        if name.is_empty() || name.contains(',') {
            return Err(Error::parse("port forward", format!("bad rule name {name:?}")));
        }
        let proto = match proto.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => return Err(Error::parse("port forward", format!("unknown protocol {other:?}"))),
        };
        let port = |p: &str| {
            p.parse::<u16>()
                .map_err(|e| Error::parse("port forward", format!("port {p:?}: {e}")))
        };

        Ok(Self {
            name: name.to_string(),
            proto,
            host_ip: None,
            host_port: port(*host_port)?,
            guest_ip: None,
            guest_port: port(*guest_port)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostonlyNetwork {
    pub name: String,
    pub guid: String,
    pub dhcp: bool,
    pub ipv4: Ipv4Network,
    pub hw_addr: String,
    pub status: String,
}

impl HostonlyNetwork {
    /// Name under which VirtualBox registers this adapter's DHCP server.
    pub fn dhcp_network_name(&self) -> String {
        format!("HostInterfaceNetworking-{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpServer {
    pub network_name: String,
    pub server_ip: Ipv4Addr,
    pub ipv4: Ipv4Network,
    pub lower_ip: Ipv4Addr,
    pub upper_ip: Ipv4Addr,
    pub enabled: bool,
}
