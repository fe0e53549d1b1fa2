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

//! The routine run INSIDE the container, responsible for setting up the
//! environment before exec'ing the actual process. The runtime bind-mounts
//! this same binary at `/.dockerinit` and the launcher invokes it with the
//! flags rendered by the runner.

use crate::util::{run, ExternalToolError};
use nix::unistd::{setgid, setuid, Gid, Uid};
use std::convert::Infallible;
use std::os::unix::process::CommandExt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InitError {
    #[error("unable to set up networking: {0}")]
    Network(ExternalToolError),
    #[error("unable to find user {0}")]
    UserNotFound(String),
    #[error("setgid failed: {0}")]
    Setgid(nix::Error),
    #[error("setuid failed: {0}")]
    Setuid(nix::Error),
    #[error("unable to execute {program}: {source}")]
    Exec {
        program: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl InitError {
    /// Exit code the init process should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            InitError::Exec { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                127
            }
            _ => 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct InitOptions {
    /// username or uid
    pub user: Option<String>,
    /// default IPv4 gateway
    pub gateway: Option<String>,
    /// default IPv6 gateway
    pub gateway6: Option<String>,
    /// KEY=VALUE pairs replacing the inherited environment
    pub env: Vec<String>,
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// Find a user by name or uid in passwd-format content.
pub fn user_lookup(passwd: &str, needle: &str) -> Option<PasswdEntry> {
    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() > 5 && (fields[0] == needle || fields[2] == needle) {
            let uid = fields[2].parse().ok()?;
            let gid = fields[3].parse().ok()?;
            return Some(PasswdEntry {
                name: fields[0].to_string(),
                uid,
                gid,
                home: fields[5].to_string(),
            });
        }
    }
    None
}

/// Clear environment pollution introduced by the launcher and reapply the
/// provided variables.
fn cleanup_env(env: &[String]) {
    let inherited: Vec<String> = std::env::vars().map(|(key, _)| key).collect();
    for key in inherited {
        std::env::remove_var(key);
    }
    for kv in env {
        let (key, value) = kv.split_once('=').unwrap_or((kv.as_str(), ""));
        std::env::set_var(key, value);
    }
}

fn setup_networking(gateway: &Option<String>) -> Result<(), InitError> {
    let Some(gw) = gateway else {
        return Ok(());
    };
    run("ip", &["route", "add", "default", "via", gw]).map_err(InitError::Network)
}

fn setup_networking6(gateway: &Option<String>) -> Result<(), InitError> {
    let Some(gw) = gateway else {
        return Ok(());
    };
    run("ip", &["route", "add", "default", "via", gw, "dev", "eth0"]).map_err(InitError::Network)
}

/// Drop privileges to the requested user, resolved from /etc/passwd.
fn change_user(user: &Option<String>) -> Result<(), InitError> {
    let Some(user) = user else {
        return Ok(());
    };
    let passwd = std::fs::read_to_string("/etc/passwd")?;
    let entry = user_lookup(&passwd, user).ok_or_else(|| InitError::UserNotFound(user.clone()))?;
    setgid(Gid::from_raw(entry.gid)).map_err(InitError::Setgid)?;
    setuid(Uid::from_raw(entry.uid)).map_err(InitError::Setuid)?;
    Ok(())
}

/// Prepare the container environment and exec the program. Returns only on
/// failure.
pub fn sys_init(opts: InitOptions) -> Result<Infallible, InitError> {
    cleanup_env(&opts.env);
    setup_networking(&opts.gateway)?;
    setup_networking6(&opts.gateway6)?;
    change_user(&opts.user)?;

    let source = std::process::Command::new(&opts.program)
        .args(&opts.args)
        .exec();
    Err(InitError::Exec {
        program: opts.program,
        source,
    })
}
