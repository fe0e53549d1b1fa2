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
use crate::models::network::NetProto;
use crate::res::proxy::Proxy;
use crate::util::{run, ExternalToolError};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use thiserror::Error;
use tracing::debug;

/// The nat-table chain owned by the runtime.
const CHAIN: &str = "AR";

#[derive(Error, Debug)]
pub enum MapperError {
    #[error("port {proto}/{port} is not mapped")]
    NotMapped { proto: NetProto, port: u16 },
    #[error("failed to create {CHAIN} chain: {0}")]
    ChainSetup(ExternalToolError),
    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),
    #[error("cannot start proxy on port {0}: {1}")]
    Proxy(u16, std::io::Error),
}

/// Maps host ports to container backends with a DNAT rule plus a userspace
/// proxy for host-local traffic, and keeps track of every mapping so it can
/// unmap at will.
pub struct PortMapper {
    bridge_iface: String,
    tcp_mapping: HashMap<u16, SocketAddrV4>,
    tcp_proxies: HashMap<u16, Proxy>,
    udp_mapping: HashMap<u16, SocketAddrV4>,
    udp_proxies: HashMap<u16, Proxy>,
}

fn iptables(args: &[String]) -> Result<(), ExternalToolError> {
    let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    run("iptables", &args)
}

/// Jump from PREROUTING into the chain for locally-destined traffic.
fn prerouting_jump(rule: &str) -> Vec<String> {
    ["-t", "nat", rule, "PREROUTING", "-m", "addrtype", "--dst-type", "LOCAL", "-j", CHAIN]
        .map(String::from)
        .to_vec()
}

/// Jump from OUTPUT into the chain, loopback excluded.
fn output_jump(rule: &str) -> Vec<String> {
    [
        "-t", "nat", rule, "OUTPUT", "-m", "addrtype", "--dst-type", "LOCAL", "!", "--dst",
        "127.0.0.0/8", "-j", CHAIN,
    ]
    .map(String::from)
    .to_vec()
}

/// OUTPUT jump shape used by earlier versions, removed during cleanup so
/// `-X` on the chain cannot be blocked by it.
fn legacy_output_jump(rule: &str) -> Vec<String> {
    ["-t", "nat", rule, "OUTPUT", "-m", "addrtype", "--dst-type", "LOCAL", "-j", CHAIN]
        .map(String::from)
        .to_vec()
}

/// The DNAT rule for one mapping: traffic arriving on `port` from anywhere
/// but the bridge is rewritten to the backend address.
fn forward_args(
    rule: &str,
    port: u16,
    proto: NetProto,
    bridge_iface: &str,
    backend: SocketAddrV4,
) -> Vec<String> {
    vec![
        "-t".to_string(),
        "nat".to_string(),
        rule.to_string(),
        CHAIN.to_string(),
        "-p".to_string(),
        proto.as_ref().to_string(),
        "--dport".to_string(),
        port.to_string(),
        "!".to_string(),
        "-i".to_string(),
        bridge_iface.to_string(),
        "-j".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        backend.to_string(),
    ]
}

impl PortMapper {
    pub fn new(bridge_iface: &str) -> Result<PortMapper, MapperError> {
        let mut mapper = PortMapper {
            bridge_iface: bridge_iface.to_string(),
            tcp_mapping: HashMap::new(),
            tcp_proxies: HashMap::new(),
            udp_mapping: HashMap::new(),
            udp_proxies: HashMap::new(),
        };
        mapper.cleanup();
        mapper.setup()?;
        Ok(mapper)
    }

    /// Clear previous mappings. Errors are ignored since the chains may
    /// never have been set up.
    fn cleanup(&mut self) {
        let _ = iptables(&prerouting_jump("-D"));
        let _ = iptables(&output_jump("-D"));
        let _ = iptables(&legacy_output_jump("-D"));
        self.tcp_mapping.clear();
        self.tcp_proxies.clear();
        self.udp_mapping.clear();
        self.udp_proxies.clear();
    }

    /// Create the chain if needed and install the jumps from PREROUTING and
    /// OUTPUT (loopback excluded).
    fn setup(&mut self) -> Result<(), MapperError> {
        if iptables(&["-t", "nat", "-L", CHAIN].map(String::from).to_vec()).is_err() {
            iptables(&["-t", "nat", "-N", CHAIN].map(String::from).to_vec())
                .map_err(MapperError::ChainSetup)?;
        }
        iptables(&prerouting_jump("-A"))?;
        iptables(&output_jump("-A"))?;
        Ok(())
    }

    fn forward(
        &self,
        rule: &str,
        port: u16,
        proto: NetProto,
        backend: SocketAddrV4,
    ) -> Result<(), ExternalToolError> {
        iptables(&forward_args(rule, port, proto, &self.bridge_iface, backend))
    }

    /// Install a DNAT rule for `port` and start the backing proxy.
    pub async fn map(
        &mut self,
        port: u16,
        proto: NetProto,
        backend: SocketAddrV4,
    ) -> Result<(), MapperError> {
        self.forward("-A", port, proto, backend)?;
        match proto {
            NetProto::Tcp => {
                self.tcp_mapping.insert(port, backend);
            }
            NetProto::Udp => {
                self.udp_mapping.insert(port, backend);
            }
        }
        let proxy = match Proxy::new(proto, port, backend).await {
            Ok(proxy) => proxy,
            Err(err) => {
                let _ = self.unmap(port, proto);
                return Err(MapperError::Proxy(port, err));
            }
        };
        match proto {
            NetProto::Tcp => {
                self.tcp_proxies.insert(port, proxy);
            }
            NetProto::Udp => {
                self.udp_proxies.insert(port, proxy);
            }
        }
        debug!("mapped {proto}/{port} -> {backend}");
        Ok(())
    }

    /// Tear down a mapping: close the proxy, remove the DNAT rule, forget
    /// the entry.
    pub fn unmap(&mut self, port: u16, proto: NetProto) -> Result<(), MapperError> {
        let backend = match proto {
            NetProto::Tcp => self.tcp_mapping.get(&port).copied(),
            NetProto::Udp => self.udp_mapping.get(&port).copied(),
        }
        .ok_or(MapperError::NotMapped { proto, port })?;
        let proxy = match proto {
            NetProto::Tcp => self.tcp_proxies.remove(&port),
            NetProto::Udp => self.udp_proxies.remove(&port),
        };
        if let Some(proxy) = proxy {
            proxy.close();
        }
        self.forward("-D", port, proto, backend)?;
        match proto {
            NetProto::Tcp => self.tcp_mapping.remove(&port),
            NetProto::Udp => self.udp_mapping.remove(&port),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_forward_args_tcp_add() {
        let backend = SocketAddrV4::new(Ipv4Addr::new(172, 17, 0, 5), 80);
        let args = forward_args("-A", 8080, NetProto::Tcp, "golden0", backend);
        assert_eq!(
            args,
            vec![
                "-t",
                "nat",
                "-A",
                "AR",
                "-p",
                "tcp",
                "--dport",
                "8080",
                "!",
                "-i",
                "golden0",
                "-j",
                "DNAT",
                "--to-destination",
                "172.17.0.5:80",
            ]
        );
    }

    #[test]
    fn test_forward_args_udp_delete() {
        let backend = SocketAddrV4::new(Ipv4Addr::new(172, 17, 0, 9), 53);
        let args = forward_args("-D", 5353, NetProto::Udp, "golden0", backend);
        assert_eq!(
            args,
            vec![
                "-t",
                "nat",
                "-D",
                "AR",
                "-p",
                "udp",
                "--dport",
                "5353",
                "!",
                "-i",
                "golden0",
                "-j",
                "DNAT",
                "--to-destination",
                "172.17.0.9:53",
            ]
        );
    }

    #[test]
    fn test_prerouting_jump_rule() {
        assert_eq!(
            prerouting_jump("-A"),
            vec![
                "-t", "nat", "-A", "PREROUTING", "-m", "addrtype", "--dst-type", "LOCAL", "-j",
                "AR",
            ]
        );
    }

    #[test]
    fn test_output_jump_excludes_loopback() {
        assert_eq!(
            output_jump("-A"),
            vec![
                "-t",
                "nat",
                "-A",
                "OUTPUT",
                "-m",
                "addrtype",
                "--dst-type",
                "LOCAL",
                "!",
                "--dst",
                "127.0.0.0/8",
                "-j",
                "AR",
            ]
        );
        // the legacy shape removed on cleanup carries no loopback exclusion
        assert_eq!(
            legacy_output_jump("-D"),
            vec![
                "-t", "nat", "-D", "OUTPUT", "-m", "addrtype", "--dst-type", "LOCAL", "-j", "AR",
            ]
        );
    }
}
