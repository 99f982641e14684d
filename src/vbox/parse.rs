//! Parsers for the text `VBoxManage` prints.

use std::{collections::HashMap, net::Ipv4Addr};

use ipnetwork::Ipv4Network;

use super::models::{DhcpServer, HostonlyNetwork, Machine, MachineState, NicAttachment};
use crate::error::{Error, Result};

/// Parses `showvminfo --machinereadable` output (`key="value"` per line).
pub fn machine(out: &str) -> Result<Machine> {
    let props = machine_readable(out);
    let name = props
        .get("name")
        .ok_or_else(|| Error::parse("showvminfo", "missing name"))?;

    let mut machine = Machine::new(name.as_str());
    for (key, value) in &props {
        match key.as_str() {
            "UUID" => machine.uuid = value.clone(),
            "VMState" => machine.state = MachineState::from_vbox(value),
            "ostype" => machine.os_type = value.clone(),
            "CfgFile" => machine.cfg_file = value.clone(),
            "cpus" => machine.cpus = number(key, value)?,
            "memory" => machine.memory_mb = number(key, value)?,
            "vram" => machine.vram_mb = number(key, value)?,
            _ => {
                if let Some(index) = key.strip_prefix("nic").and_then(|i| i.parse::<u8>().ok()) {
                    if value != "none" {
                        machine.nics.insert(index, NicAttachment::from_vbox(value));
                    }
                }
            }
        }
    }

    let mut controllers: Vec<(u32, String)> = props
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix("storagecontrollername")
                .and_then(|i| i.parse::<u32>().ok())
                .map(|i| (i, value.clone()))
        })
        .collect();
    controllers.sort();
    machine.storage_controllers = controllers.into_iter().map(|(_, name)| name).collect();

    Ok(machine)
}

/// Parses `list hostonlyifs`.
pub fn hostonly_networks(out: &str) -> Result<Vec<HostonlyNetwork>> {
    blocks(out)
        .into_iter()
        .map(|block| {
            let name = field(&block, "name", "hostonlyifs")?;
            let ip = address(&block, "ipaddress", "hostonlyifs")?;
            let mask = address(&block, "networkmask", "hostonlyifs")?;
            Ok(HostonlyNetwork {
                name: name.to_string(),
                guid: block.get("guid").cloned().unwrap_or_default(),
                dhcp: block.get("dhcp").is_some_and(|v| v == "Enabled"),
                ipv4: network(ip, mask)?,
                hw_addr: block.get("hardwareaddress").cloned().unwrap_or_default(),
                status: block.get("status").cloned().unwrap_or_default(),
            })
        })
        .collect()
}

/// Parses `list dhcpservers`. Handles both the old (`IP`, `lowerIPAddress`)
/// and new (`Dhcpd IP`, `LowerIPAddress`) field spellings.
pub fn dhcp_servers(out: &str) -> Result<Vec<DhcpServer>> {
    blocks(out)
        .into_iter()
        .map(|block| {
            let network_name = field(&block, "networkname", "dhcpservers")?;
            let server_ip = match block.get("dhcpd ip") {
                Some(_) => address(&block, "dhcpd ip", "dhcpservers")?,
                None => address(&block, "ip", "dhcpservers")?,
            };
            let mask = address(&block, "networkmask", "dhcpservers")?;
            Ok(DhcpServer {
                network_name: network_name.to_string(),
                server_ip,
                ipv4: network(server_ip, mask)?,
                lower_ip: address(&block, "loweripaddress", "dhcpservers")?,
                upper_ip: address(&block, "upperipaddress", "dhcpservers")?,
                enabled: block.get("enabled").is_some_and(|v| v == "Yes"),
            })
        })
        .collect()
}

/// Extracts the interface name from `hostonlyif create` output, e.g.
/// `Interface 'vboxnet1' was successfully created`.
pub fn created_interface(out: &str) -> Result<String> {
    out.lines()
        .filter_map(|line| line.split_once('\''))
        .find_map(|(_, rest)| rest.split_once('\'').map(|(name, _)| name.to_string()))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::parse("hostonlyif create", out.trim().to_string()))
}

fn machine_readable(out: &str) -> HashMap<String, String> {
    out.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (unquote(key).to_string(), unquote(value).to_string()))
        .collect()
}

/// Splits `Key: value` listings into blank-line separated records with
/// lowercased keys.
fn blocks(out: &str) -> Vec<HashMap<String, String>> {
    let mut blocks = Vec::new();
    let mut current = HashMap::new();
    for line in out.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            current.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

fn field<'a>(block: &'a HashMap<String, String>, key: &str, what: &'static str) -> Result<&'a str> {
    block
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::parse(what, format!("missing {key}")))
}

fn address(block: &HashMap<String, String>, key: &str, what: &'static str) -> Result<Ipv4Addr> {
    let value = field(block, key, what)?;
    value
        .parse()
        .map_err(|e| Error::parse(what, format!("{key} {value:?}: {e}")))
}

fn network(ip: Ipv4Addr, mask: Ipv4Addr) -> Result<Ipv4Network> {
    Ipv4Network::with_netmask(ip, mask)
        .map_err(|e| Error::parse("netmask", format!("{ip}/{mask}: {e}")))
}

fn number(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|e| Error::parse("showvminfo", format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOWVMINFO: &str = r#"name="web01"
groups="/"
ostype="Other/Unknown"
UUID="0b5a3b63-4c3c-4a2e-9d1c-4d4b5e4b7f0e"
CfgFile="/home/dev/VirtualBox VMs/web01/web01.vbox"
memory=512
vram=16
cpus=2
VMState="running"
VMStateChangeTime="2026-10-19T06:00:00.000000000"
storagecontrollername0="storctrl0"
storagecontrollertype0="IntelAhci"
"storctrl0-0-0"="/images/.web01.base.vdi.1234"
nic1="hostonly"
nictype1="82540EM"
hostonlyadapter1="vboxnet0"
nic2="nat"
nic3="none"
nic4="bridged"
bridgeadapter4="eth0"
"#;

    #[test]
    fn parses_machine_readable_info() {
        let m = machine(SHOWVMINFO).unwrap();
        assert_eq!(m.name, "web01");
        assert_eq!(m.uuid, "0b5a3b63-4c3c-4a2e-9d1c-4d4b5e4b7f0e");
        assert_eq!(m.state, MachineState::Running);
        assert_eq!(m.os_type, "Other/Unknown");
        assert_eq!(m.cpus, 2);
        assert_eq!(m.memory_mb, 512);
        assert_eq!(m.vram_mb, 16);
        assert_eq!(m.cfg_file, "/home/dev/VirtualBox VMs/web01/web01.vbox");
        assert_eq!(m.storage_controllers, vec!["storctrl0".to_string()]);
        assert_eq!(m.nics.len(), 3);
        assert_eq!(m.nics[&1], NicAttachment::Hostonly);
        assert_eq!(m.nics[&2], NicAttachment::Nat);
        assert_eq!(m.nics[&4], NicAttachment::Other("bridged".into()));
    }

    #[test]
    fn machine_without_name_is_an_error() {
        assert!(matches!(
            machine("memory=512\n"),
            Err(Error::Parse { what: "showvminfo", .. })
        ));
    }

    #[test]
    fn parses_hostonly_interfaces() {
        let out = "Name:            vboxnet0
GUID:            786f6276-656e-4074-8000-0a0027000000
DHCP:            Disabled
IPAddress:       192.168.56.1
NetworkMask:     255.255.255.0
IPV6Address:
IPV6NetworkMaskPrefixLength: 0
HardwareAddress: 0a:00:27:00:00:00
MediumType:      Ethernet
Status:          Up
VBoxNetworkName: HostInterfaceNetworking-vboxnet0

Name:            vboxnet1
GUID:            786f6276-656e-4174-8000-0a0027000001
DHCP:            Enabled
IPAddress:       172.16.16.1
NetworkMask:     255.255.255.0
HardwareAddress: 0a:00:27:00:00:01
Status:          Down

";
        let nets = hostonly_networks(out).unwrap();
        assert_eq!(nets.len(), 2);
        assert_eq!(nets[0].name, "vboxnet0");
        assert!(!nets[0].dhcp);
        assert_eq!(nets[0].ipv4.to_string(), "192.168.56.1/24");
        assert_eq!(nets[0].hw_addr, "0a:00:27:00:00:00");
        assert_eq!(nets[1].name, "vboxnet1");
        assert!(nets[1].dhcp);
        assert_eq!(nets[1].ipv4.to_string(), "172.16.16.1/24");
        assert_eq!(nets[1].status, "Down");
    }

    #[test]
    fn parses_both_dhcp_listing_spellings() {
        let old = "NetworkName:    HostInterfaceNetworking-vboxnet0
IP:             192.168.56.100
NetworkMask:    255.255.255.0
lowerIPAddress: 192.168.56.101
upperIPAddress: 192.168.56.254
Enabled:        Yes
";
        let new = "NetworkName:    HostInterfaceNetworking-vboxnet1
Dhcpd IP:       172.16.16.1
LowerIPAddress: 172.16.16.2
UpperIPAddress: 172.16.16.240
NetworkMask:    255.255.255.0
Enabled:        No
";
        let servers = dhcp_servers(&format!("{old}\n{new}")).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].network_name, "HostInterfaceNetworking-vboxnet0");
        assert_eq!(servers[0].server_ip, Ipv4Addr::new(192, 168, 56, 100));
        assert_eq!(servers[0].upper_ip, Ipv4Addr::new(192, 168, 56, 254));
        assert!(servers[0].enabled);
        assert_eq!(servers[1].lower_ip, Ipv4Addr::new(172, 16, 16, 2));
        assert_eq!(servers[1].ipv4.prefix(), 24);
        assert!(!servers[1].enabled);
    }

    #[test]
    fn empty_listings_are_empty() {
        assert!(hostonly_networks("").unwrap().is_empty());
        assert!(dhcp_servers("\n\n").unwrap().is_empty());
    }

    #[test]
    fn created_interface_name() {
        let out = "0%...10%...20%...100%\nInterface 'vboxnet3' was successfully created\n";
        assert_eq!(created_interface(out).unwrap(), "vboxnet3");
        assert!(created_interface("something else\n").is_err());
    }
}
