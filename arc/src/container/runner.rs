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
use crate::container::{Container, ContainerError, DEFAULT_HOSTS};
use crate::format::lxc::render_lxc_config;
use crate::layer::LayerError;
use crate::models::network::{NetProto, NetworkSettings, DEFAULT_NETWORK_BRIDGE, DISABLE_NETWORK_BRIDGE};
use crate::models::HostConfig;
use crate::res::network::{iface_ipv4, NetworkError, NetworkInterface, NetworkManager};
use crate::tagstore::TagStore;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use path_clean::PathClean;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Signals relayed from the invoking process into the launcher child.
const FORWARDED_SIGNALS: [i32; 9] = [
    nix::libc::SIGINT,
    nix::libc::SIGQUIT,
    nix::libc::SIGTERM,
    nix::libc::SIGHUP,
    nix::libc::SIGUSR1,
    nix::libc::SIGUSR2,
    nix::libc::SIGWINCH,
    nix::libc::SIGTTIN,
    nix::libc::SIGTTOU,
];

#[derive(Error, Debug)]
pub enum StartError {
    #[error("the container {0} is already running")]
    AlreadyRunning(String),
    #[error("the container {0} is not running")]
    NotRunning(String),
    #[error("invalid bind specification: {0}")]
    InvalidBind(String),
    #[error("illegal bind destination: {0}")]
    IllegalBindDestination(String),
    #[error("invalid volume configuration: {0}")]
    InvalidVolume(String),
    #[error("launcher exited before it could be tracked")]
    LauncherGone,
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Host-side bookkeeping for a launched container. Dropped (and its signal
/// forwarder with it) when the container has been reaped.
pub(crate) struct Launched {
    child: tokio::process::Child,
    pid: u32,
    manager: NetworkManager,
    iface: NetworkInterface,
    signal_task: JoinHandle<()>,
}

impl std::fmt::Debug for Launched {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Launched")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct BindMap {
    src: String,
    mode: String,
}

/// Parse `src:dst[:mode]` binds keyed by the cleaned destination.
/// Destinations `/` and `.` are illegal; destinations tagged `@` are named
/// volumes handled during volume resolution.
fn parse_binds(binds: &[String]) -> Result<HashMap<String, BindMap>, StartError> {
    let mut map = HashMap::new();
    for bind in binds {
        let parts: Vec<&str> = bind.split(':').collect();
        let (src, dst, mode) = match parts.as_slice() {
            [src, dst] => (*src, *dst, "rw"),
            [src, dst, mode] => (*src, *dst, *mode),
            _ => return Err(StartError::InvalidBind(bind.clone())),
        };
        if dst == "/" || dst == "." {
            return Err(StartError::IllegalBindDestination(dst.to_string()));
        }
        if dst.starts_with('@') {
            continue;
        }
        let key = Path::new(dst).clean().to_string_lossy().to_string();
        map.insert(
            key,
            BindMap {
                src: src.to_string(),
                mode: mode.to_string(),
            },
        );
    }
    Ok(map)
}

async fn pump_lines<R: AsyncRead + Unpin + Send + 'static>(reader: R, to_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

/// One task per forwarded signal, all owned by the returned parent task so
/// that aborting it cancels the whole set when the launcher is reaped.
fn spawn_signal_forwarder(pid: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut set = JoinSet::new();
        for raw in FORWARDED_SIGNALS {
            set.spawn(async move {
                let mut stream = match signal(SignalKind::from_raw(raw)) {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!("cannot subscribe to signal {raw}: {err}");
                        return;
                    }
                };
                while stream.recv().await.is_some() {
                    let Ok(sig) = Signal::try_from(raw) else {
                        return;
                    };
                    debug!("forwarding signal {sig} to {pid}");
                    if let Err(err) = kill(Pid::from_raw(pid as i32), sig) {
                        warn!("cannot forward signal {sig} to {pid}: {err}");
                    }
                }
            });
        }
        while set.join_next().await.is_some() {}
    })
}

impl Container {
    /// Start the container: mount the rootfs, allocate networking, resolve
    /// binds and volumes, render the launcher config and spawn the
    /// launcher. Network and port allocations are rolled back on every
    /// failure path before the launcher is running.
    pub async fn start(
        &mut self,
        tags: &TagStore,
        host_config: &HostConfig,
    ) -> Result<(), StartError> {
        let mut host_config = host_config.clone();
        // allow restarting a saved container without repeating arguments
        if host_config.binds.is_empty() {
            if let Ok(saved) = self.read_host_config() {
                host_config = saved;
            }
        }

        if self.state.running {
            return Err(StartError::AlreadyRunning(self.id.clone()));
        }

        self.ensure_mounted(tags)?;

        let bridge = if self.config.network_disabled {
            DISABLE_NETWORK_BRIDGE
        } else {
            DEFAULT_NETWORK_BRIDGE
        };
        let mut manager = match NetworkManager::new(&self.runtime, bridge) {
            Ok(manager) => manager,
            Err(err) => {
                self.unmount_quietly();
                return Err(err.into());
            }
        };
        let mut iface = match manager.allocate() {
            Ok(iface) => iface,
            Err(err) => {
                self.unmount_quietly();
                return Err(err.into());
            }
        };

        if let Err(err) = self.allocate_ports(&mut manager, &mut iface).await {
            manager.release(&mut iface);
            self.unmount_quietly();
            return Err(err);
        }

        let child = match self.configure_and_spawn(&host_config).await {
            Ok(child) => child,
            Err(err) => {
                manager.release(&mut iface);
                self.unmount_quietly();
                return Err(err);
            }
        };

        let Some(pid) = child.id() else {
            manager.release(&mut iface);
            self.unmount_quietly();
            return Err(StartError::LauncherGone);
        };

        self.set_running(pid);
        let _ = std::fs::write(self.path_to("running"), format!("{pid}\n"));
        let signal_task = spawn_signal_forwarder(pid);
        self.launched = Some(Launched {
            child,
            pid,
            manager,
            iface,
            signal_task,
        });

        if !host_config.container_id_file.is_empty() {
            if let Err(err) = std::fs::write(&host_config.container_id_file, &self.id) {
                warn!("cannot write cid file {}: {err}", host_config.container_id_file);
            }
        }
        if !host_config.hook.is_empty() {
            let hook = host_config.hook.clone();
            tokio::spawn(async move {
                match tokio::process::Command::new("/bin/sh")
                    .arg("-c")
                    .arg(&hook)
                    .status()
                    .await
                {
                    Ok(status) if status.success() => debug!("boot hook completed"),
                    Ok(status) => warn!("boot hook exited with {status}"),
                    Err(err) => warn!("cannot run boot hook: {err}"),
                }
            });
        }

        self.to_disk()?;
        self.save_host_config(&host_config)?;
        Ok(())
    }

    fn unmount_quietly(&self) {
        if let Err(err) = self.unmount() {
            warn!("failed to unmount {}: {err}", self.id);
        }
    }

    /// Allocate a host port per port spec and record the mapping table.
    async fn allocate_ports(
        &mut self,
        manager: &mut NetworkManager,
        iface: &mut NetworkInterface,
    ) -> Result<(), StartError> {
        let mut settings = NetworkSettings::default();
        if iface.is_disabled() {
            self.network_settings = settings;
            return Ok(());
        }

        settings
            .port_mapping
            .insert(NetProto::Tcp.title().to_string(), HashMap::new());
        settings
            .port_mapping
            .insert(NetProto::Udp.title().to_string(), HashMap::new());

        for spec in self.config.port_specs.clone() {
            let nat = manager.allocate_port(iface, &spec).await?;
            if let Some(table) = settings.port_mapping.get_mut(nat.proto.title()) {
                table.insert(nat.backend.to_string(), nat.frontend.to_string());
            }
        }

        if let Some(address) = iface.address {
            settings.ip_address = address.addr().to_string();
            settings.ip_prefix_len = address.prefix_len();
        }
        settings.gateway = iface.gateway.map(|g| g.to_string()).unwrap_or_default();
        settings.gateway6 = iface.gateway6.map(|g| g.to_string()).unwrap_or_default();
        settings.bridge = manager.bridge_iface().to_string();
        self.network_settings = settings;
        Ok(())
    }

    async fn configure_and_spawn(
        &mut self,
        host_config: &HostConfig,
    ) -> Result<tokio::process::Child, StartError> {
        let binds = parse_binds(&host_config.binds)?;
        self.resolve_volumes(&binds)?;
        self.write_etc_hosts();

        std::fs::write(self.lxc_config_path(), render_lxc_config(self))?;

        let mut cmd = tokio::process::Command::new("lxc-start");
        cmd.arg("-n")
            .arg(&self.id)
            .arg("-f")
            .arg(self.lxc_config_path())
            .arg("--")
            .arg("/.dockerinit");

        if !self.config.network_disabled {
            if !self.network_settings.gateway.is_empty() {
                cmd.arg("-g").arg(&self.network_settings.gateway);
            }
            if !self.network_settings.gateway6.is_empty() {
                cmd.arg("-g6").arg(&self.network_settings.gateway6);
            }
        }
        if !self.config.user.is_empty() {
            cmd.arg("-u").arg(&self.config.user);
        }
        if self.config.tty {
            cmd.arg("-e").arg("TERM=xterm");
        }
        for env in [
            "HOME=/".to_string(),
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "container=lxc".to_string(),
            format!("HOSTNAME={}", self.config.hostname),
        ] {
            cmd.arg("-e").arg(env);
        }
        for env in self.config.env.iter() {
            cmd.arg("-e").arg(env);
        }

        cmd.arg("--").arg(&self.path);
        for arg in self.args.iter() {
            cmd.arg(arg);
        }

        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!("launching container {}", self.id);
        let mut child = cmd.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, true));
        }
        Ok(child)
    }

    /// Resolve every declared volume to a host path: an external bind wins,
    /// a `<path>:@<name>` declaration maps to a named volume under
    /// `<DIR>/volumes/`, anything else is invalid. Mountpoints are created
    /// under the rootfs.
    fn resolve_volumes(&mut self, binds: &HashMap<String, BindMap>) -> Result<(), StartError> {
        if !self.volumes.is_empty() {
            return Ok(());
        }

        for vol_path in self.config.volumes.clone() {
            let vol_path = Path::new(&vol_path).clean().to_string_lossy().to_string();
            let container_path;
            if let Some(bind) = binds.get(&vol_path) {
                container_path = vol_path.clone();
                self.volumes.insert(vol_path.clone(), bind.src.clone());
                self.volumes_rw
                    .insert(vol_path, bind.mode.eq_ignore_ascii_case("rw"));
            } else if let Some(n) = vol_path.rfind(":@") {
                let name = &vol_path[n + 2..];
                let host_dir = self.runtime.volumes_dir().join(name);
                std::fs::create_dir_all(&host_dir)?;
                container_path = vol_path[..n].to_string();
                self.volumes.insert(
                    container_path.clone(),
                    host_dir.to_string_lossy().to_string(),
                );
                self.volumes_rw.insert(container_path.clone(), true);
            } else {
                return Err(StartError::InvalidVolume(vol_path));
            }

            let mountpoint = self
                .rootfs_path()
                .join(container_path.trim_start_matches('/'));
            std::fs::create_dir_all(mountpoint)?;
        }
        Ok(())
    }

    /// Give the container an /etc/hosts carrying the loopback defaults and
    /// its own hostname.
    fn write_etc_hosts(&self) {
        let hosts = format!("{DEFAULT_HOSTS}\n127.0.0.1\t{}\n", self.config.hostname);
        let etc = self.rw_path().join("etc");
        let result = std::fs::create_dir_all(&etc)
            .and_then(|_| std::fs::write(etc.join("hosts"), hosts));
        if let Err(err) = result {
            warn!("error writing hosts file: {err}");
        }
    }

    /// Record the pid and advertise presence under RUN_DIR; the marker at
    /// INIT_DIR is touched last so watchers only see fully initialized
    /// containers.
    fn set_running(&mut self, pid: u32) {
        self.state.set_running(pid as i32);
        if let Err(err) = self.advertise(pid) {
            warn!("cannot advertise container presence: {err}");
        }
    }

    fn advertise(&self, pid: u32) -> std::io::Result<()> {
        let process_dir = self.runtime.run_dir(pid);
        std::fs::create_dir_all(&process_dir)?;
        std::fs::write(
            process_dir.join("ports"),
            serde_json::to_vec(&self.network_settings.port_mapping)?,
        )?;
        match iface_ipv4("eth0") {
            Ok(network) => {
                std::fs::write(process_dir.join("ip"), network.addr().to_string())?
            }
            Err(err) => warn!("unable to find address for eth0: {err}"),
        }
        std::fs::write(
            process_dir.join("services"),
            serde_json::to_vec(&self.config.service_specs)?,
        )?;
        std::fs::write(self.runtime.init_marker(pid), b"")?;
        Ok(())
    }

    /// Reap the launcher and tear everything down: unmount, release the
    /// network, flip the state. With `save` the container directory is
    /// kept (minus the pid file), otherwise it is deleted. Returns the
    /// container's exit code.
    pub async fn wait(&mut self, host_config: &HostConfig) -> Result<i32, StartError> {
        let Some(mut launched) = self.launched.take() else {
            return Err(StartError::NotRunning(self.id.clone()));
        };

        let _ = std::fs::write(self.path_to("running"), format!("{}\n", launched.pid));

        let status = launched.child.wait().await;
        let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
        launched.signal_task.abort();

        self.unmount_quietly();
        launched.manager.release(&mut launched.iface);
        self.set_stopped(exit_code);

        if host_config.save {
            if !host_config.quiet {
                println!("== Saved: {}", self.id);
            }
            let _ = std::fs::remove_file(self.path_to("running"));
            self.to_disk()?;
        } else {
            std::fs::remove_dir_all(self.root())?;
        }
        Ok(exit_code)
    }

    /// Drop fs-level presence information and flip the state.
    fn set_stopped(&mut self, exit_code: i32) {
        let pid = self.state.pid;
        if pid > 0 {
            let _ = std::fs::remove_dir_all(self.runtime.run_dir(pid as u32));
            let _ = std::fs::remove_file(self.runtime.init_marker(pid as u32));
        }
        self.state.set_stopped(exit_code);
    }

    /// Forward a signal to the launcher child.
    pub fn signal(&self, sig: Signal) -> nix::Result<()> {
        match &self.launched {
            Some(launched) => kill(Pid::from_raw(launched.pid as i32), sig),
            None => Ok(()),
        }
    }

    pub fn kill(&self) -> nix::Result<()> {
        self.signal(Signal::SIGKILL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binds() {
        let binds = vec![
            "/host/a:/a".to_string(),
            "/host/b:/b:ro".to_string(),
            "/host/c:@named".to_string(),
        ];
        let parsed = parse_binds(&binds).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["/a"].src, "/host/a");
        assert_eq!(parsed["/a"].mode, "rw");
        assert_eq!(parsed["/b"].mode, "ro");
    }

    #[test]
    fn test_parse_binds_rejects_illegal_destinations() {
        assert!(matches!(
            parse_binds(&["/x:/".to_string()]),
            Err(StartError::IllegalBindDestination(_))
        ));
        assert!(matches!(
            parse_binds(&["/x:.".to_string()]),
            Err(StartError::IllegalBindDestination(_))
        ));
        assert!(matches!(
            parse_binds(&["just-one-part".to_string()]),
            Err(StartError::InvalidBind(_))
        ));
        assert!(matches!(
            parse_binds(&["a:b:c:d".to_string()]),
            Err(StartError::InvalidBind(_))
        ));
    }

    #[test]
    fn test_parse_binds_cleans_destination_paths() {
        let parsed = parse_binds(&["/host:/data/./sub/..".to_string()]).unwrap();
        assert!(parsed.contains_key("/data"));
    }
}
