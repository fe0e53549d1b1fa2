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
pub mod network;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use self::network::parse_nat;

/// A service advertised by a container: name, backend port and an optional
/// version string.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
}

/// The execution contract of an image or container.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub user: String,
    /// Memory limit in bytes
    #[serde(default)]
    pub memory: i64,
    /// Total memory usage (memory + swap); set to -1 to disable swap
    #[serde(default)]
    pub memory_swap: i64,
    /// CPU shares (relative weight vs. other containers)
    #[serde(default)]
    pub cpu_shares: i64,
    #[serde(default)]
    pub attach_stdin: bool,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
    #[serde(default)]
    pub port_specs: Vec<String>,
    #[serde(default)]
    pub service_specs: Vec<ServiceSpec>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub open_stdin: bool,
    /// If true, close stdin after the one attached client disconnects
    #[serde(default)]
    pub stdin_once: bool,
    /// Ordered KEY=VALUE pairs
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    /// Name of the image as it was passed by the operator (may be symbolic)
    #[serde(default)]
    pub image: String,
    /// Container paths exported as volumes
    #[serde(default)]
    pub volumes: BTreeSet<String>,
    #[serde(default)]
    pub volumes_from: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub network_disabled: bool,
}

/// Merge an image config into a user config. User-set fields win; env and
/// ports are appended only where the user left the key/backend free, dns is
/// concatenated.
pub fn merge_config(user: &mut Config, image: &Config) {
    if user.user.is_empty() {
        user.user = image.user.clone();
    }
    if user.memory == 0 {
        user.memory = image.memory;
    }
    if user.memory_swap == 0 {
        user.memory_swap = image.memory_swap;
    }
    if user.cpu_shares == 0 {
        user.cpu_shares = image.cpu_shares;
    }
    if user.service_specs.is_empty() {
        user.service_specs = image.service_specs.clone();
    }
    if user.port_specs.is_empty() {
        user.port_specs = image.port_specs.clone();
    } else {
        for image_spec in image.port_specs.iter() {
            let Ok(image_nat) = parse_nat(image_spec) else {
                continue;
            };
            let found = user.port_specs.iter().any(|user_spec| {
                parse_nat(user_spec)
                    .map(|user_nat| {
                        user_nat.proto == image_nat.proto && user_nat.backend == image_nat.backend
                    })
                    .unwrap_or_default()
            });
            if !found {
                user.port_specs.push(image_spec.clone());
            }
        }
    }
    if !user.tty {
        user.tty = image.tty;
    }
    if !user.open_stdin {
        user.open_stdin = image.open_stdin;
    }
    if !user.stdin_once {
        user.stdin_once = image.stdin_once;
    }
    if user.env.is_empty() {
        user.env = image.env.clone();
    } else {
        for image_env in image.env.iter() {
            let image_key = image_env.split('=').next().unwrap_or_default();
            let found = user
                .env
                .iter()
                .any(|user_env| user_env.split('=').next().unwrap_or_default() == image_key);
            if !found {
                user.env.push(image_env.clone());
            }
        }
    }
    if user.cmd.is_empty() {
        user.cmd = image.cmd.clone();
    }
    if user.dns.is_empty() {
        user.dns = image.dns.clone();
    } else {
        // duplicates are not an issue here
        user.dns.extend(image.dns.iter().cloned());
    }
    if user.entrypoint.is_empty() {
        user.entrypoint = image.entrypoint.clone();
    }
    if user.volumes_from.is_empty() {
        user.volumes_from = image.volumes_from.clone();
    }
    if user.volumes.is_empty() {
        user.volumes = image.volumes.clone();
    } else {
        for volume in image.volumes.iter() {
            user.volumes.insert(volume.clone());
        }
    }
}

/// Host-side execution knobs, persisted at `<container>/hostconfig.json`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct HostConfig {
    /// `src:dst[:mode]` bind mounts
    #[serde(default)]
    pub binds: Vec<String>,
    /// Write the container id to this file after start
    #[serde(default)]
    pub container_id_file: String,
    /// Keep the container directory around after it exits
    #[serde(default)]
    pub save: bool,
    #[serde(default)]
    pub quiet: bool,
    /// Surfaced for external tooling; not consulted by the config merge
    #[serde(default)]
    pub env_dir: String,
    /// Command executed on the host once the container is booted
    #[serde(default)]
    pub hook: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct State {
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl State {
    pub fn set_running(&mut self, pid: i32) {
        self.pid = pid;
        self.running = true;
        self.exit_code = 0;
        self.started_at = Some(Utc::now());
    }

    pub fn set_stopped(&mut self, exit_code: i32) {
        self.pid = 0;
        self.running = false;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }
}
