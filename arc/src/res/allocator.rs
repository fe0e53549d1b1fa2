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
use ipnet::Ipv4Net;
use nix::fcntl::{flock, FlockArg};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

pub const PORT_RANGE_START: u16 = 49153;
pub const PORT_RANGE_END: u16 = 65535;

// 16-bit draws into the subnet; a full pass over the draw space without a
// hit means the pool is effectively exhausted
const MAX_DRAWS: u32 = 1 << 18;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("too many ports used")]
    OutOfPorts,
    #[error("port already in use: {0}")]
    PortBusy(u16),
    #[error("no free address in {0}")]
    NoFreeAddress(Ipv4Net),
    #[error("cannot lock allocation state: {0}")]
    Lock(nix::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cannot serialize allocation state: {0}")]
    Json(#[from] serde_json::Error),
}

/// On-disk shape of `<DIR>/ips`.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
struct AllocState {
    #[serde(default)]
    ips: HashMap<String, u32>,
    #[serde(default)]
    tcp_ports: Vec<u16>,
    #[serde(default)]
    udp_ports: Vec<u16>,
}

impl AllocState {
    fn ports_mut(&mut self, proto: NetProto) -> &mut Vec<u16> {
        match proto {
            NetProto::Tcp => &mut self.tcp_ports,
            NetProto::Udp => &mut self.udp_ports,
        }
    }
}

/// Atomically acquire and release host ports and bridge-subnet addresses.
/// The state file doubles as the lock token: every operation opens it,
/// takes an exclusive flock, and holds it for the whole read-mutate-write
/// window.
pub struct NetAllocator {
    path: PathBuf,
    network: Ipv4Net,
}

impl NetAllocator {
    pub fn new(path: PathBuf, network: Ipv4Net) -> NetAllocator {
        NetAllocator { path, network }
    }

    fn with_locked<T>(
        &self,
        mutate: impl FnOnce(&mut AllocState) -> Result<T, AllocError>,
    ) -> Result<T, AllocError> {
        use std::os::fd::AsRawFd;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(AllocError::Lock)?;

        // the lock fd is write-only; read through a second handle. Closing
        // the fd on return releases the lock.
        let mut state = std::fs::read(&self.path)
            .ok()
            .and_then(|data| serde_json::from_slice::<AllocState>(&data).ok())
            .unwrap_or_default();

        let out = mutate(&mut state)?;
        std::fs::write(&self.path, serde_json::to_vec(&state)?)?;
        drop(file);
        Ok(out)
    }

    /// Draw a free address from the bridge subnet. The network address and
    /// any address with 0 or 255 in the third or fourth octet are skipped.
    pub fn acquire_ip(&self) -> Result<Ipv4Addr, AllocError> {
        let network = self.network;
        self.with_locked(|state| {
            let first = u32::from(network.network());
            let last = u32::from(network.broadcast());
            let size = last - first;
            if size == 0 {
                return Err(AllocError::NoFreeAddress(network));
            }
            let mut rng = rand::thread_rng();
            for _ in 0..MAX_DRAWS {
                let num: u16 = rng.gen();
                let ip = Ipv4Addr::from(first + (num as u32 % size));
                let octets = ip.octets();
                if ip == network.network()
                    || octets[2] == 0
                    || octets[3] == 0
                    || octets[2] == 255
                    || octets[3] == 255
                {
                    continue;
                }
                let key = ip.to_string();
                if !state.ips.contains_key(&key) {
                    state.ips.insert(key, 1);
                    debug!("allocated address {ip}");
                    return Ok(ip);
                }
            }
            Err(AllocError::NoFreeAddress(network))
        })
    }

    /// Release is idempotent on absent addresses.
    pub fn release_ip(&self, ip: Ipv4Addr) -> Result<(), AllocError> {
        self.with_locked(|state| {
            state.ips.remove(&ip.to_string());
            Ok(())
        })
    }

    /// Acquire a host port. A request of 0 is satisfied from the dynamic
    /// range starting at [`PORT_RANGE_START`]; an explicit request fails
    /// when the port is already taken.
    pub fn acquire_port(&self, proto: NetProto, requested: u16) -> Result<u16, AllocError> {
        self.with_locked(|state| {
            let ports = state.ports_mut(proto);
            let port = if requested == 0 {
                let next = PORT_RANGE_START as u32 + ports.len() as u32;
                if next > PORT_RANGE_END as u32 {
                    return Err(AllocError::OutOfPorts);
                }
                next as u16
            } else {
                if ports.contains(&requested) {
                    return Err(AllocError::PortBusy(requested));
                }
                requested
            };
            ports.push(port);
            Ok(port)
        })
    }

    /// Release is idempotent on absent ports.
    pub fn release_port(&self, proto: NetProto, port: u16) -> Result<(), AllocError> {
        self.with_locked(|state| {
            let ports = state.ports_mut(proto);
            if let Some(pos) = ports.iter().position(|p| *p == port) {
                ports.remove(pos);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(dir: &std::path::Path) -> NetAllocator {
        NetAllocator::new(dir.join("ips"), "10.99.42.1/16".parse().unwrap())
    }

    #[test]
    fn test_port_zero_walks_the_dynamic_range() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = allocator(tmp.path());
        assert_eq!(alloc.acquire_port(NetProto::Tcp, 0).unwrap(), 49153);
        assert_eq!(alloc.acquire_port(NetProto::Tcp, 0).unwrap(), 49154);
        // udp is tracked separately
        assert_eq!(alloc.acquire_port(NetProto::Udp, 0).unwrap(), 49153);
    }

    #[test]
    fn test_explicit_port_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = allocator(tmp.path());
        assert_eq!(alloc.acquire_port(NetProto::Tcp, 8080).unwrap(), 8080);
        assert!(matches!(
            alloc.acquire_port(NetProto::Tcp, 8080),
            Err(AllocError::PortBusy(8080))
        ));
        // acquire -> release -> acquire succeeds
        alloc.release_port(NetProto::Tcp, 8080).unwrap();
        assert_eq!(alloc.acquire_port(NetProto::Tcp, 8080).unwrap(), 8080);
        // releasing an absent port is fine
        alloc.release_port(NetProto::Tcp, 9999).unwrap();
    }

    #[test]
    fn test_out_of_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = allocator(tmp.path());
        let filled = AllocState {
            tcp_ports: (0..16383u16).collect(),
            ..Default::default()
        };
        std::fs::write(tmp.path().join("ips"), serde_json::to_vec(&filled).unwrap()).unwrap();
        assert!(matches!(
            alloc.acquire_port(NetProto::Tcp, 0),
            Err(AllocError::OutOfPorts)
        ));
    }

    #[test]
    fn test_ip_draws_avoid_reserved_octets() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = allocator(tmp.path());
        for _ in 0..64 {
            let ip = alloc.acquire_ip().unwrap();
            let octets = ip.octets();
            assert_eq!(octets[0], 10);
            assert_eq!(octets[1], 99);
            assert!(octets[2] != 0 && octets[2] != 255);
            assert!(octets[3] != 0 && octets[3] != 255);
        }
    }

    #[test]
    fn test_ip_release_frees_the_address() {
        let tmp = tempfile::tempdir().unwrap();
        let alloc = allocator(tmp.path());
        let ip = alloc.acquire_ip().unwrap();
        alloc.release_ip(ip).unwrap();
        let data = std::fs::read(tmp.path().join("ips")).unwrap();
        let state: AllocState = serde_json::from_slice(&data).unwrap();
        assert!(state.ips.is_empty());
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let dir = dir.clone();
            handles.push(std::thread::spawn(move || {
                let alloc = allocator(&dir);
                let mut mine = Vec::new();
                for _ in 0..10 {
                    mine.push(format!("port:{}", alloc.acquire_port(NetProto::Tcp, 0).unwrap()));
                    mine.push(format!("ip:{}", alloc.acquire_ip().unwrap()));
                }
                mine
            }));
        }
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for item in handle.join().unwrap() {
                assert!(seen.insert(item), "duplicate allocation");
            }
        }
        assert_eq!(seen.len(), 8 * 20);
    }
}
