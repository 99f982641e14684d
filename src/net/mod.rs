use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

use crate::{
    config::NetworkMatch,
    error::{Error, Result},
    vbox::{
        models::{DhcpServer, HostonlyNetwork},
        VirtualBox,
    },
};

/// Addresses kept out of the pool after the network address.
const POOL_LOW_OFFSET: u32 = 2;
/// Addresses kept out of the pool before the broadcast address.
const POOL_HIGH_OFFSET: u32 = 15;
const MAX_POOL_PREFIX: u8 = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePool {
    pub lower: Ipv4Addr,
    pub upper: Ipv4Addr,
}

/// Lease pool for `subnet`, strictly between its network and broadcast
/// addresses. For a /24 that is `.2` through `.240`.
pub fn lease_pool(subnet: Ipv4Network) -> Result<LeasePool> {
    if subnet.prefix() > MAX_POOL_PREFIX {
        return Err(Error::SubnetTooSmall(subnet));
    }
    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());
    Ok(LeasePool {
        lower: Ipv4Addr::from(network + POOL_LOW_OFFSET),
        upper: Ipv4Addr::from(broadcast - POOL_HIGH_OFFSET),
    })
}

/// The host side of a host-only network cannot sit on the network address;
/// `192.168.50.0/24` becomes `192.168.50.1/24`.
pub fn host_address(subnet: Ipv4Network) -> Result<Ipv4Network> {
    if subnet.ip() != subnet.network() || subnet.prefix() >= 31 {
        return Ok(subnet);
    }
    let first = Ipv4Addr::from(u32::from(subnet.network()) + 1);
    Ipv4Network::new(first, subnet.prefix())
        .map_err(|e| Error::parse("subnet", format!("{subnet}: {e}")))
}

/// Makes sure a host-only network and its DHCP server exist for a subnet.
pub struct HostonlyReconciler<'a, V: VirtualBox + ?Sized> {
    vbox: &'a V,
    network_match: NetworkMatch,
}

impl<'a, V: VirtualBox + ?Sized> HostonlyReconciler<'a, V> {
    pub fn new(vbox: &'a V, network_match: NetworkMatch) -> Self {
        Self {
            vbox,
            network_match,
        }
    }

    /// Finds or creates the host-only network for `subnet`, makes sure it
    /// carries that subnet, then reconciles the DHCP server of whichever
    /// network that turned out to be.
    pub async fn reconcile(&self, subnet: Ipv4Network) -> Result<HostonlyNetwork> {
        let subnet = host_address(subnet)?;
        lease_pool(subnet)?;

        let network = match self.find_network(subnet).await {
            Ok(mut network) => {
                debug!(name = %network.name, ipv4 = %network.ipv4, "host-only network exists");
                if !same_subnet(&network, subnet) {
                    info!(name = %network.name, from = %network.ipv4, to = %subnet, "readdressing host-only network");
                    network.ipv4 = subnet;
                    self.vbox.configure_hostonly_network(&network).await?;
                }
                network
            }
            Err(Error::HostonlyNetworkNotFound) => self.create_network(subnet).await?,
            Err(e) => return Err(e),
        };

        self.ensure_dhcp(&network).await?;
        Ok(network)
    }

    /// Looks the network up by the configured match. A name match that finds
    /// nothing falls back to the subnet, which picks up an adapter an earlier
    /// run created when VirtualBox did not hand out the requested name.
    pub async fn find_network(&self, subnet: Ipv4Network) -> Result<HostonlyNetwork> {
        let networks = self.vbox.hostonly_networks().await?;
        let by_subnet = || networks.iter().find(|net| same_subnet(net, subnet));
        let found = match &self.network_match {
            NetworkMatch::Subnet => by_subnet(),
            NetworkMatch::Name(name) => networks
                .iter()
                .find(|net| &net.name == name)
                .or_else(by_subnet),
        };
        found.cloned().ok_or(Error::HostonlyNetworkNotFound)
    }

    async fn create_network(&self, subnet: Ipv4Network) -> Result<HostonlyNetwork> {
        let mut network = self.vbox.create_hostonly_network().await?;
        if let NetworkMatch::Name(name) = &self.network_match {
            if &network.name != name {
                warn!(wanted = %name, created = %network.name, "VirtualBox picked another adapter name");
            }
        }
        network.ipv4 = subnet;
        self.vbox.configure_hostonly_network(&network).await?;
        info!(name = %network.name, ipv4 = %network.ipv4, "created host-only network");
        Ok(network)
    }

    pub async fn find_dhcp(&self, network: &HostonlyNetwork) -> Result<DhcpServer> {
        let wanted = network.dhcp_network_name();
        self.vbox
            .dhcp_servers()
            .await?
            .into_iter()
            .find(|server| server.network_name == wanted)
            .ok_or(Error::DhcpServerNotFound(wanted))
    }

    /// Adds a DHCP server for `network` if it has none, or switches an
    /// existing one on. An enabled server whose pool already sits inside the
    /// network is left alone; one with a pool elsewhere gets a fresh pool.
    pub async fn ensure_dhcp(&self, network: &HostonlyNetwork) -> Result<DhcpServer> {
        match self.find_dhcp(network).await {
            Ok(server) if server.enabled && serves(&server, network) => Ok(server),
            Ok(server) => {
                let server = if serves(&server, network) {
                    DhcpServer {
                        enabled: true,
                        ..server
                    }
                } else {
                    dhcp_for(network, server.network_name)?
                };
                self.vbox.modify_dhcp_server(&server).await?;
                info!(
                    network = %server.network_name,
                    lower = %server.lower_ip,
                    upper = %server.upper_ip,
                    "enabled DHCP server"
                );
                Ok(server)
            }
            Err(Error::DhcpServerNotFound(network_name)) => {
                let server = dhcp_for(network, network_name)?;
                self.vbox.add_dhcp_server(&server).await?;
                info!(
                    network = %server.network_name,
                    lower = %server.lower_ip,
                    upper = %server.upper_ip,
                    "added DHCP server"
                );
                Ok(server)
            }
            Err(e) => Err(e),
        }
    }
}

fn same_subnet(network: &HostonlyNetwork, subnet: Ipv4Network) -> bool {
    network.ipv4.to_string() == subnet.to_string()
}

fn serves(server: &DhcpServer, network: &HostonlyNetwork) -> bool {
    network.ipv4.contains(server.lower_ip) && network.ipv4.contains(server.upper_ip)
}

fn dhcp_for(network: &HostonlyNetwork, network_name: String) -> Result<DhcpServer> {
    let pool = lease_pool(network.ipv4)?;
    Ok(DhcpServer {
        network_name,
        server_ip: network.ipv4.ip(),
        ipv4: network.ipv4,
        lower_ip: pool.lower,
        upper_ip: pool.upper,
        enabled: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_for_a_slash_24() {
        let pool = lease_pool("192.168.50.0/24".parse().unwrap()).unwrap();
        assert_eq!(pool.lower, Ipv4Addr::new(192, 168, 50, 2));
        assert_eq!(pool.upper, Ipv4Addr::new(192, 168, 50, 240));
    }

    #[test]
    fn pool_ignores_host_bits() {
        let pool = lease_pool("172.16.16.1/24".parse().unwrap()).unwrap();
        assert_eq!(pool.lower, Ipv4Addr::new(172, 16, 16, 2));
        assert_eq!(pool.upper, Ipv4Addr::new(172, 16, 16, 240));
    }

    #[test]
    fn pool_stays_inside_wider_subnets() {
        let subnet: Ipv4Network = "10.8.0.1/16".parse().unwrap();
        let pool = lease_pool(subnet).unwrap();
        assert_eq!(pool.lower, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(pool.upper, Ipv4Addr::new(10, 8, 255, 240));

        let subnet: Ipv4Network = "10.0.0.1/27".parse().unwrap();
        let pool = lease_pool(subnet).unwrap();
        assert!(pool.lower <= pool.upper);
        assert!(subnet.contains(pool.lower) && subnet.contains(pool.upper));
        assert_ne!(pool.lower, subnet.network());
        assert_ne!(pool.upper, subnet.broadcast());
    }

    #[test]
    fn small_subnets_are_rejected() {
        assert!(matches!(
            lease_pool("10.0.0.1/28".parse().unwrap()),
            Err(Error::SubnetTooSmall(_))
        ));
    }

    #[test]
    fn host_address_moves_off_network_address() {
        let subnet = host_address("192.168.50.0/24".parse().unwrap()).unwrap();
        assert_eq!(subnet.to_string(), "192.168.50.1/24");

        let subnet = host_address("192.168.50.7/24".parse().unwrap()).unwrap();
        assert_eq!(subnet.to_string(), "192.168.50.7/24");
    }
}
