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
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_NETWORK_BRIDGE: &str = "golden0";
pub const DISABLE_NETWORK_BRIDGE: &str = "none";

/// backend port -> host frontend port, both rendered as strings
pub type PortMapping = HashMap<String, String>;

/// The networking stack of a container as observed from the host.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct NetworkSettings {
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub ip_prefix_len: u8,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub gateway6: String,
    #[serde(default)]
    pub bridge: String,
    /// keyed by "Tcp" / "Udp"
    #[serde(default)]
    pub port_mapping: HashMap<String, PortMapping>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, std::hash::Hash)]
pub enum NetProto {
    Tcp,
    Udp,
}

impl NetProto {
    /// Key form used in the persisted port mapping table.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Tcp => "Tcp",
            Self::Udp => "Udp",
        }
    }
}

impl std::fmt::Display for NetProto {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(formatter, "tcp"),
            Self::Udp => write!(formatter, "udp"),
        }
    }
}

impl AsRef<str> for NetProto {
    fn as_ref(&self) -> &str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Error, Debug)]
pub enum PortSpecError {
    #[error("invalid port format: {0}")]
    BadFormat(String),
    #[error("invalid port format: unknown protocol {0}")]
    UnknownProtocol(String),
    #[error("invalid port number in {0}")]
    BadNumber(String),
}

/// One parsed port forwarding request. `frontend == 0` means any free host
/// port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nat {
    pub proto: NetProto,
    pub frontend: u16,
    pub backend: u16,
}

/// Parse `[[<frontend>]:]<backend>[/(tcp|udp)]`. A missing protocol means
/// tcp; a leading bare `:` requests frontend = backend.
pub fn parse_nat(spec: &str) -> Result<Nat, PortSpecError> {
    let (ports, proto) = match spec.split_once('/') {
        None => (spec, NetProto::Tcp),
        Some((ports, proto)) => {
            if proto.contains('/') {
                return Err(PortSpecError::BadFormat(spec.to_string()));
            }
            let proto = match proto {
                "tcp" => NetProto::Tcp,
                "udp" => NetProto::Udp,
                other => return Err(PortSpecError::UnknownProtocol(other.to_string())),
            };
            (ports, proto)
        }
    };

    let parse_port = |s: &str| {
        s.parse::<u16>()
            .map_err(|_| PortSpecError::BadNumber(spec.to_string()))
    };

    match ports.split_once(':') {
        None => Ok(Nat {
            proto,
            frontend: 0,
            backend: parse_port(ports)?,
        }),
        Some((front, back)) => {
            if back.contains(':') {
                return Err(PortSpecError::BadFormat(spec.to_string()));
            }
            let backend = parse_port(back)?;
            // a spec starting with ':' pins the frontend to the backend port
            let frontend = if front.is_empty() {
                backend
            } else {
                parse_port(front)?
            };
            Ok(Nat {
                proto,
                frontend,
                backend,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_only_defaults_to_tcp() {
        let nat = parse_nat("80").unwrap();
        assert_eq!(
            nat,
            Nat {
                proto: NetProto::Tcp,
                frontend: 0,
                backend: 80
            }
        );
    }

    #[test]
    fn test_explicit_proto() {
        let nat = parse_nat("80/tcp").unwrap();
        assert_eq!(nat.proto, NetProto::Tcp);
        assert_eq!(nat.frontend, 0);
        assert_eq!(nat.backend, 80);

        let nat = parse_nat("80:443/udp").unwrap();
        assert_eq!(
            nat,
            Nat {
                proto: NetProto::Udp,
                frontend: 80,
                backend: 443
            }
        );
    }

    #[test]
    fn test_leading_colon_pins_frontend() {
        let nat = parse_nat(":80").unwrap();
        assert_eq!(nat.frontend, 80);
        assert_eq!(nat.backend, 80);
    }

    #[test]
    fn test_rejects_malformed_specs() {
        assert!(parse_nat("80/sctp").is_err());
        assert!(parse_nat("80/tcp/udp").is_err());
        assert!(parse_nat("1:2:3").is_err());
        assert!(parse_nat("notaport").is_err());
        assert!(parse_nat("99999").is_err());
    }
}
