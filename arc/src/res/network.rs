// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.
use crate::config::Runtime;
use crate::models::network::{parse_nat, Nat, PortSpecError, DISABLE_NETWORK_BRIDGE};
use crate::res::allocator::{AllocError, NetAllocator};
use crate::res::mapper::{MapperError, PortMapper};
use crate::util::{run, run_output, ExternalToolError};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("trying to allocate a port on a disabled interface")]
    Disabled,
    #[error("interface {0} has no usable address")]
    NoAddress(String),
    #[error("could not find a free IP address range for interface '{0}'")]
    NoFreeRange(String),
    #[error("network {0} is already routed: '{1}'")]
    Overlap(Ipv4Net, String),
    #[error("unexpected ip route output: {0}")]
    BadRouteOutput(String),
    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Mapper(#[from] MapperError),
    #[error(transparent)]
    PortSpec(#[from] PortSpecError),
}

/// The networking stack handed to one container: its address on the bridge
/// subnet, the gateways, and the host ports mapped so far.
pub struct NetworkInterface {
    pub address: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub gateway6: Option<Ipv6Addr>,
    ext_ports: Vec<Nat>,
    disabled: bool,
}

impl NetworkInterface {
    fn disabled() -> NetworkInterface {
        NetworkInterface {
            address: None,
            gateway: None,
            gateway6: None,
            ext_ports: Vec::new(),
            disabled: true,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn ports(&self) -> &[Nat] {
        &self.ext_ports
    }
}

enum ManagerState {
    Disabled,
    Active {
        bridge_network: Ipv4Net,
        bridge_network6: Option<Ipv6Net>,
        allocator: NetAllocator,
        mapper: PortMapper,
    },
}

/// Manages the host bridge and the per-container interfaces drawn from it.
/// Only one manager should drive a bridge at a time within a process.
pub struct NetworkManager {
    bridge_iface: String,
    state: ManagerState,
}

impl NetworkManager {
    /// Use (or create) the named bridge. `"none"` yields a disabled manager
    /// whose interfaces carry no addresses or ports.
    pub fn new(rt: &Runtime, bridge_iface: &str) -> Result<NetworkManager, NetworkError> {
        if bridge_iface == DISABLE_NETWORK_BRIDGE {
            return Ok(NetworkManager {
                bridge_iface: bridge_iface.to_string(),
                state: ManagerState::Disabled,
            });
        }

        let bridge_network = match iface_ipv4(bridge_iface) {
            Ok(network) => network,
            Err(_) => {
                // the bridge does not exist yet, create and address it
                create_bridge_iface(bridge_iface)?;
                iface_ipv4(bridge_iface)?
            }
        };
        let bridge_network6 = iface_ipv6(bridge_iface).ok();
        let allocator = NetAllocator::new(rt.ips_path(), bridge_network);
        let mapper = PortMapper::new(bridge_iface)?;

        Ok(NetworkManager {
            bridge_iface: bridge_iface.to_string(),
            state: ManagerState::Active {
                bridge_network,
                bridge_network6,
                allocator,
                mapper,
            },
        })
    }

    pub fn bridge_iface(&self) -> &str {
        &self.bridge_iface
    }

    /// Allocate a fresh interface on the bridge subnet.
    pub fn allocate(&mut self) -> Result<NetworkInterface, NetworkError> {
        match &self.state {
            ManagerState::Disabled => Ok(NetworkInterface::disabled()),
            ManagerState::Active {
                bridge_network,
                bridge_network6,
                allocator,
                ..
            } => {
                let ip = allocator.acquire_ip()?;
                Ok(NetworkInterface {
                    address: Ipv4Net::new(ip, bridge_network.prefix_len()).ok(),
                    gateway: Some(bridge_network.addr()),
                    gateway6: bridge_network6.map(|net| net.addr()),
                    ext_ports: Vec::new(),
                    disabled: false,
                })
            }
        }
    }

    /// Allocate a host port for `spec` and map it at the interface's
    /// address. Returns the effective mapping with the frontend filled in.
    pub async fn allocate_port(
        &mut self,
        iface: &mut NetworkInterface,
        spec: &str,
    ) -> Result<Nat, NetworkError> {
        if iface.disabled {
            return Err(NetworkError::Disabled);
        }
        let ManagerState::Active {
            allocator, mapper, ..
        } = &mut self.state
        else {
            return Err(NetworkError::Disabled);
        };
        let address = iface.address.ok_or(NetworkError::Disabled)?.addr();

        let mut nat = parse_nat(spec)?;
        let ext_port = allocator.acquire_port(nat.proto, nat.frontend)?;
        let backend = SocketAddrV4::new(address, nat.backend);
        if let Err(err) = mapper.map(ext_port, nat.proto, backend).await {
            if let Err(release_err) = allocator.release_port(nat.proto, ext_port) {
                warn!("unable to release port {}/{ext_port}: {release_err}", nat.proto);
            }
            return Err(err.into());
        }
        nat.frontend = ext_port;
        iface.ext_ports.push(nat.clone());
        Ok(nat)
    }

    /// Release everything the interface holds: unmap its ports, return them
    /// to the allocator, and free its address.
    pub fn release(&mut self, iface: &mut NetworkInterface) {
        if iface.disabled {
            return;
        }
        let ManagerState::Active {
            allocator, mapper, ..
        } = &mut self.state
        else {
            return;
        };
        for nat in iface.ext_ports.drain(..) {
            debug!("unmapping {}/{}", nat.proto, nat.frontend);
            if let Err(err) = mapper.unmap(nat.frontend, nat.proto) {
                warn!("unable to unmap port {}/{}: {err}", nat.proto, nat.frontend);
            }
            if let Err(err) = allocator.release_port(nat.proto, nat.frontend) {
                warn!("unable to release port {}/{}: {err}", nat.proto, nat.frontend);
            }
        }
        if let Some(address) = iface.address.take() {
            if let Err(err) = allocator.release_ip(address.addr()) {
                warn!("unable to release address {}: {err}", address.addr());
            }
        }
    }
}

fn ip_cmd(args: &[&str]) -> Result<String, NetworkError> {
    run_output("ip", args).map_err(Into::into)
}

/// First token following `key` in `ip -o addr show` output.
fn first_inet(output: &str, key: &str) -> Option<String> {
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == key {
                return tokens.next().map(|t| t.to_string());
            }
        }
    }
    None
}

/// The IPv4 address (with prefix) of a host interface.
pub(crate) fn iface_ipv4(name: &str) -> Result<Ipv4Net, NetworkError> {
    let output = ip_cmd(&["-4", "-o", "addr", "show", "dev", name])?;
    first_inet(&output, "inet")
        .and_then(|addr| addr.parse::<Ipv4Net>().ok())
        .ok_or_else(|| NetworkError::NoAddress(name.to_string()))
}

fn iface_ipv6(name: &str) -> Result<Ipv6Net, NetworkError> {
    let output = ip_cmd(&["-6", "-o", "addr", "show", "dev", name])?;
    first_inet(&output, "inet6")
        .and_then(|addr| addr.parse::<Ipv6Net>().ok())
        .ok_or_else(|| NetworkError::NoAddress(name.to_string()))
}

fn networks_overlap(a: Ipv4Net, b: Ipv4Net) -> bool {
    b.contains(&a.network()) || a.contains(&b.network())
}

/// Reject a candidate subnet if any existing route overlaps it.
fn check_route_overlaps(routes: &str, network: Ipv4Net) -> Result<(), NetworkError> {
    for line in routes.lines() {
        let line = line.trim();
        if line.is_empty() || line.contains("default") {
            continue;
        }
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        let routed = match first.parse::<Ipv4Net>() {
            Ok(net) => net,
            Err(_) => match first.parse::<Ipv4Addr>() {
                // a mask-less address routes a single host
                Ok(addr) => Ipv4Net::new(addr, 32).map_err(|_| {
                    NetworkError::BadRouteOutput(line.to_string())
                })?,
                Err(_) => return Err(NetworkError::BadRouteOutput(line.to_string())),
            },
        };
        if networks_overlap(network, routed) {
            return Err(NetworkError::Overlap(network, line.to_string()));
        }
    }
    Ok(())
}

/// Create a bridge named `name` and configure it with an address that does
/// not conflict with any route on the host.
pub(crate) fn create_bridge_iface(name: &str) -> Result<(), NetworkError> {
    // The gateway does not use the first address of the range on purpose:
    // these match the /24 gateway addresses that predate the /16 ranges,
    // and scripts in the wild rely on them.
    let candidates = [
        "172.17.42.1/16", // don't use 172.16.0.0/16, it conflicts with EC2 DNS 172.16.0.23
        "10.0.42.1/16",   // don't even try the entire /8, that's too intrusive
        "10.1.42.1/16",
        "10.42.42.1/16",
        "172.16.42.1/24",
        "172.16.43.1/24",
        "172.16.44.1/24",
        "10.0.42.1/24",
        "10.0.43.1/24",
        "192.168.42.1/24",
        "192.168.43.1/24",
        "192.168.44.1/24",
    ];

    let routes = ip_cmd(&["route"])?;
    let mut iface_addr = None;
    for addr in candidates {
        let Ok(network) = addr.parse::<Ipv4Net>() else {
            continue;
        };
        match check_route_overlaps(&routes, network) {
            Ok(()) => {
                iface_addr = Some(addr);
                break;
            }
            Err(err) => debug!("{addr}: {err}"),
        }
    }
    let Some(addr) = iface_addr else {
        return Err(NetworkError::NoFreeRange(name.to_string()));
    };

    debug!("creating bridge {name} with network {addr}");
    ip_cmd(&["link", "add", name, "type", "bridge"])?;
    ip_cmd(&["addr", "add", addr, "dev", name])?;
    ip_cmd(&["link", "set", name, "up"])?;
    run(
        "iptables",
        &[
            "-t", "nat", "-A", "POSTROUTING", "-s", addr, "!", "-d", addr, "-j", "MASQUERADE",
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_inet_parses_ip_output() {
        let output = "2: golden0    inet 172.17.42.1/16 brd 172.17.255.255 scope global golden0\\       valid_lft forever preferred_lft forever";
        assert_eq!(first_inet(output, "inet"), Some("172.17.42.1/16".to_string()));
        assert_eq!(first_inet(output, "inet6"), None);
    }

    #[test]
    fn test_route_overlap_detection() {
        let routes = "default via 10.0.0.1 dev eth0\n172.17.0.0/16 dev docker0 proto kernel scope link\n";
        let clash: Ipv4Net = "172.17.42.1/16".parse().unwrap();
        assert!(matches!(
            check_route_overlaps(routes, clash),
            Err(NetworkError::Overlap(_, _))
        ));
        let free: Ipv4Net = "10.1.42.1/16".parse().unwrap();
        assert!(check_route_overlaps(routes, free).is_ok());
    }

    #[test]
    fn test_route_overlap_maskless_address() {
        let routes = "169.254.169.254 via 10.0.0.1 dev eth0\n";
        let clash: Ipv4Net = "169.254.0.0/16".parse().unwrap();
        assert!(check_route_overlaps(routes, clash).is_err());
        let free: Ipv4Net = "192.168.42.1/24".parse().unwrap();
        assert!(check_route_overlaps(routes, free).is_ok());
    }

    #[test]
    fn test_route_overlap_rejects_garbage() {
        let routes = "certainly not a route\n";
        let network: Ipv4Net = "10.0.42.1/16".parse().unwrap();
        assert!(matches!(
            check_route_overlaps(routes, network),
            Err(NetworkError::BadRouteOutput(_))
        ));
    }

    #[test]
    fn test_networks_overlap() {
        let a: Ipv4Net = "10.0.0.0/16".parse().unwrap();
        let b: Ipv4Net = "10.0.42.0/24".parse().unwrap();
        let c: Ipv4Net = "10.1.0.0/16".parse().unwrap();
        assert!(networks_overlap(a, b));
        assert!(networks_overlap(b, a));
        assert!(!networks_overlap(a, c));
    }
}
