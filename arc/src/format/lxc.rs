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
use crate::container::Container;
use crate::models::Config;
use std::fmt::Write;

/// MemorySwap defaults to twice the size of memory; -1 omits the memsw
/// limit entirely.
pub fn get_memory_swap(config: &Config) -> i64 {
    if config.memory_swap < 0 {
        0
    } else {
        config.memory * 2
    }
}

/// Render the namespace-launcher configuration consumed by lxc-start.
pub fn render_lxc_config(container: &Container) -> String {
    let mut out = String::new();
    let config = &container.config;
    let rootfs_buf = container.rootfs_path();
    let rootfs = rootfs_buf.display();

    writeln!(out, "# hostname").unwrap();
    if !config.hostname.is_empty() {
        writeln!(out, "lxc.utsname = {}", config.hostname).unwrap();
    } else {
        writeln!(out, "lxc.utsname = {}", container.id).unwrap();
    }
    writeln!(out).unwrap();

    if config.network_disabled {
        writeln!(out, "# network is disabled (-n=false)").unwrap();
        writeln!(out, "lxc.network.type = empty").unwrap();
    } else {
        writeln!(out, "# network configuration").unwrap();
        writeln!(out, "lxc.network.type = veth").unwrap();
        writeln!(out, "lxc.network.flags = up").unwrap();
        writeln!(out, "lxc.network.link = {}", container.network_settings.bridge).unwrap();
        writeln!(out, "lxc.network.name = eth0").unwrap();
        writeln!(out, "lxc.network.mtu = 1500").unwrap();
        writeln!(
            out,
            "lxc.network.ipv4 = {}/{}",
            container.network_settings.ip_address, container.network_settings.ip_prefix_len
        )
        .unwrap();
    }
    writeln!(out).unwrap();

    writeln!(out, "# root filesystem").unwrap();
    writeln!(out, "lxc.rootfs = {rootfs}").unwrap();
    writeln!(out).unwrap();

    out.push_str(
        "# use a dedicated pts for the container (and limit the number of pseudo terminal\n\
         # available)\n\
         lxc.pts = 1024\n\
         \n\
         # disable the main console\n\
         lxc.console = none\n\
         \n\
         # no controlling tty at all\n\
         lxc.tty = 1\n\
         \n\
         # no implicit access to devices\n\
         lxc.cgroup.devices.deny = a\n\
         \n\
         # /dev/null and zero\n\
         lxc.cgroup.devices.allow = c 1:3 rwm\n\
         lxc.cgroup.devices.allow = c 1:5 rwm\n\
         \n\
         # consoles\n\
         lxc.cgroup.devices.allow = c 5:1 rwm\n\
         lxc.cgroup.devices.allow = c 5:0 rwm\n\
         lxc.cgroup.devices.allow = c 4:0 rwm\n\
         lxc.cgroup.devices.allow = c 4:1 rwm\n\
         \n\
         # /dev/urandom,/dev/random\n\
         lxc.cgroup.devices.allow = c 1:9 rwm\n\
         lxc.cgroup.devices.allow = c 1:8 rwm\n\
         \n\
         # /dev/pts/*\n\
         lxc.cgroup.devices.allow = c 136:* rwm\n\
         lxc.cgroup.devices.allow = c 5:2 rwm\n\
         \n\
         # tuntap\n\
         lxc.cgroup.devices.allow = c 10:200 rwm\n\
         \n",
    );

    writeln!(out, "# standard mount points").unwrap();
    writeln!(
        out,
        "lxc.mount.entry = proc {rootfs}/proc proc nosuid,nodev,noexec 0 0"
    )
    .unwrap();
    writeln!(
        out,
        "lxc.mount.entry = sysfs {rootfs}/sys sysfs nosuid,nodev,noexec 0 0"
    )
    .unwrap();
    writeln!(
        out,
        "lxc.mount.entry = devpts {rootfs}/dev/pts devpts newinstance,ptmxmode=0666,nosuid,noexec 0 0"
    )
    .unwrap();
    writeln!(out).unwrap();

    writeln!(out, "# inject the in-container init").unwrap();
    writeln!(
        out,
        "lxc.mount.entry = {} {rootfs}/.dockerinit none bind,ro 0 0",
        container.sys_init_path
    )
    .unwrap();
    writeln!(out).unwrap();

    writeln!(
        out,
        "# mount bind (ro) the host's or the container's resolv.conf"
    )
    .unwrap();
    writeln!(
        out,
        "lxc.mount.entry = {} {rootfs}/etc/resolv.conf none bind,ro 0 0",
        container.resolv_conf_path
    )
    .unwrap();

    if !container.volumes.is_empty() {
        writeln!(out).unwrap();
        writeln!(out, "# bind mount the declared volumes").unwrap();
        let mut paths: Vec<&String> = container.volumes.keys().collect();
        paths.sort();
        for virtual_path in paths {
            let real_path = &container.volumes[virtual_path];
            let mode = if container
                .volumes_rw
                .get(virtual_path)
                .copied()
                .unwrap_or_default()
            {
                "rw"
            } else {
                "ro"
            };
            writeln!(
                out,
                "lxc.mount.entry = {real_path} {rootfs}{virtual_path} none bind,{mode} 0 0"
            )
            .unwrap();
        }
    }
    writeln!(out).unwrap();

    writeln!(
        out,
        "# drop linux capabilities (apply mainly to the user root in the container)"
    )
    .unwrap();
    writeln!(
        out,
        "lxc.cap.drop = audit_control audit_write mac_admin mac_override mknod setfcap \
         setpcap sys_admin sys_boot sys_module sys_nice sys_pacct sys_rawio sys_resource \
         sys_time sys_tty_config"
    )
    .unwrap();
    writeln!(out).unwrap();

    writeln!(out, "# limits").unwrap();
    if config.memory > 0 {
        writeln!(out, "lxc.cgroup.memory.limit_in_bytes = {}", config.memory).unwrap();
        writeln!(
            out,
            "lxc.cgroup.memory.soft_limit_in_bytes = {}",
            config.memory
        )
        .unwrap();
        let memory_swap = get_memory_swap(config);
        if memory_swap > 0 {
            writeln!(
                out,
                "lxc.cgroup.memory.memsw.limit_in_bytes = {memory_swap}"
            )
            .unwrap();
        }
    }
    if config.cpu_shares > 0 {
        writeln!(out, "lxc.cgroup.cpu.shares = {}", config.cpu_shares).unwrap();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Runtime;
    use crate::models::network::NetworkSettings;
    use crate::models::{Config, State};
    use chrono::Utc;
    use std::collections::HashMap;

    fn test_container(config: Config) -> Container {
        Container {
            runtime: Runtime::with_root("/tmp/arc-lib", "/tmp/arc-run"),
            id: "c0ffee".to_string(),
            created: Utc::now(),
            path: "/bin/sh".to_string(),
            args: vec![],
            config,
            state: State::default(),
            image: String::new(),
            network_settings: NetworkSettings {
                ip_address: "172.17.0.5".to_string(),
                ip_prefix_len: 16,
                gateway: "172.17.42.1".to_string(),
                gateway6: String::new(),
                bridge: "golden0".to_string(),
                port_mapping: HashMap::new(),
            },
            sys_init_path: "/usr/bin/ar-container".to_string(),
            resolv_conf_path: "/etc/resolv.conf".to_string(),
            volumes: HashMap::new(),
            volumes_rw: HashMap::new(),
            launched: None,
        }
    }

    #[test]
    fn test_render_network_section() {
        let container = test_container(Config {
            hostname: "web01".to_string(),
            ..Default::default()
        });
        let rendered = render_lxc_config(&container);
        assert!(rendered.contains("lxc.utsname = web01"));
        assert!(rendered.contains("lxc.network.type = veth"));
        assert!(rendered.contains("lxc.network.link = golden0"));
        assert!(rendered.contains("lxc.network.ipv4 = 172.17.0.5/16"));
        assert!(rendered.contains("lxc.cap.drop = audit_control"));
        assert!(rendered.contains(
            "lxc.mount.entry = /usr/bin/ar-container /tmp/arc-lib/containers/c0ffee/rootfs/.dockerinit none bind,ro 0 0"
        ));
    }

    #[test]
    fn test_render_disabled_network() {
        let container = test_container(Config {
            network_disabled: true,
            ..Default::default()
        });
        let rendered = render_lxc_config(&container);
        assert!(rendered.contains("lxc.network.type = empty"));
        assert!(!rendered.contains("lxc.network.type = veth"));
        // hostname falls back to the container id
        assert!(rendered.contains("lxc.utsname = c0ffee"));
    }

    #[test]
    fn test_render_memory_limits() {
        let container = test_container(Config {
            memory: 1 << 20,
            cpu_shares: 512,
            ..Default::default()
        });
        let rendered = render_lxc_config(&container);
        assert!(rendered.contains("lxc.cgroup.memory.limit_in_bytes = 1048576"));
        assert!(rendered.contains("lxc.cgroup.memory.soft_limit_in_bytes = 1048576"));
        assert!(rendered.contains("lxc.cgroup.memory.memsw.limit_in_bytes = 2097152"));
        assert!(rendered.contains("lxc.cgroup.cpu.shares = 512"));
    }

    #[test]
    fn test_render_memsw_omitted_when_swap_disabled() {
        let container = test_container(Config {
            memory: 1 << 20,
            memory_swap: -1,
            ..Default::default()
        });
        let rendered = render_lxc_config(&container);
        assert!(rendered.contains("lxc.cgroup.memory.limit_in_bytes = 1048576"));
        assert!(!rendered.contains("memsw.limit_in_bytes"));
    }

    #[test]
    fn test_render_volumes_with_modes() {
        let mut container = test_container(Config::default());
        container
            .volumes
            .insert("/data".to_string(), "/var/lib/ar-container/volumes/db".to_string());
        container.volumes_rw.insert("/data".to_string(), true);
        container
            .volumes
            .insert("/conf".to_string(), "/host/conf".to_string());
        container.volumes_rw.insert("/conf".to_string(), false);

        let rendered = render_lxc_config(&container);
        assert!(rendered.contains(
            "lxc.mount.entry = /var/lib/ar-container/volumes/db /tmp/arc-lib/containers/c0ffee/rootfs/data none bind,rw 0 0"
        ));
        assert!(rendered.contains(
            "lxc.mount.entry = /host/conf /tmp/arc-lib/containers/c0ffee/rootfs/conf none bind,ro 0 0"
        ));
    }
}
