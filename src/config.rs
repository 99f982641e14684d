use std::{collections::BTreeSet, net::Ipv4Addr, path::PathBuf, str::FromStr};

use ipnetwork::Ipv4Network;
use serde::Serialize;

use crate::{
    error::{Error, Result},
    vbox::models::{NicHardware, PortForward, StorageController},
};

/// VirtualBox exposes NICs 1 through 8.
pub const MAX_NICS: u8 = 8;

pub const DEFAULT_HOSTONLY_NAME: &str = "vboxnet0";

/// How the source image is turned into the medium the machine boots from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageStrategy {
    /// Attach the source image itself.
    Direct,
    /// `clonemedium` into a machine-specific copy.
    #[default]
    Clone,
    /// Hard-link the source under a machine-specific name.
    Link,
}

/// Which existing host-only network counts as "ours".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NetworkMatch {
    /// Same address and prefix as the requested subnet.
    Subnet,
    /// Fixed adapter name, e.g. `vboxnet0`.
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NicMode {
    Nat,
    Hostonly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NicConfig {
    pub index: u8,
    pub mode: NicMode,
    pub hardware: NicHardware,
}

impl FromStr for NicConfig {
    type Err = Error;

    /// Parses `INDEX:MODE[:HARDWARE]`, e.g. `1:hostonly` or `2:nat:virtio`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(index), Some(mode)) = (parts.next(), parts.next()) else {
            return Err(Error::parse("nic", format!("{s:?} is not INDEX:MODE")));
        };
        let index = index
            .parse::<u8>()
            .map_err(|e| Error::parse("nic", format!("index {index:?}: {e}")))?;
        let mode = match mode.to_ascii_lowercase().as_str() {
            "nat" => NicMode::Nat,
            "hostonly" | "host-only" => NicMode::Hostonly,
            other => return Err(Error::parse("nic", format!("unknown mode {other:?}"))),
        };
        let hardware = match parts.next() {
            Some(hardware) => hardware.parse()?,
            None => NicHardware::default(),
        };
        Ok(Self {
            index,
            mode,
            hardware,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionConfig {
    pub controller: StorageController,
    pub image_strategy: ImageStrategy,
    pub nics: Vec<NicConfig>,
    /// Rules applied to the lowest-indexed NAT NIC.
    pub port_forwards: Vec<PortForward>,
    pub subnet: Ipv4Network,
    pub network_match: NetworkMatch,
    pub base_folder: Option<PathBuf>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            controller: StorageController::default(),
            image_strategy: ImageStrategy::default(),
            nics: vec![NicConfig {
                index: 1,
                mode: NicMode::Hostonly,
                hardware: NicHardware::default(),
            }],
            port_forwards: Vec::new(),
            subnet: default_subnet(),
            network_match: NetworkMatch::Subnet,
            base_folder: None,
        }
    }
}

pub fn default_subnet() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::new(172, 16, 16, 1), 24).expect("24 is a valid IPv4 prefix")
}

impl ProvisionConfig {
    /// Checks the NIC plan before anything is sent to VirtualBox.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for nic in &self.nics {
            if nic.index == 0 || nic.index > MAX_NICS {
                return Err(Error::InvalidConfig(format!(
                    "NIC index {} is outside 1..={MAX_NICS}",
                    nic.index
                )));
            }
            if !seen.insert(nic.index) {
                return Err(Error::InvalidConfig(format!(
                    "NIC index {} configured twice",
                    nic.index
                )));
            }
        }

        if !self.port_forwards.is_empty() && self.nat_index().is_none() {
            return Err(Error::InvalidConfig(
                "port forwards need a NAT NIC".to_string(),
            ));
        }

        if self.wants_hostonly() {
            crate::net::lease_pool(self.subnet)?;
        }
        Ok(())
    }

    /// NICs in index order.
    pub fn ordered_nics(&self) -> Vec<&NicConfig> {
        let mut nics: Vec<&NicConfig> = self.nics.iter().collect();
        nics.sort_by_key(|nic| nic.index);
        nics
    }

    pub fn wants_hostonly(&self) -> bool {
        self.nics.iter().any(|nic| nic.mode == NicMode::Hostonly)
    }

    /// Index of the NIC that receives the port-forward rules.
    pub fn nat_index(&self) -> Option<u8> {
        self.nics
            .iter()
            .filter(|nic| nic.mode == NicMode::Nat)
            .map(|nic| nic.index)
            .min()
    }
}
