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

pub mod runner;

use crate::config::Runtime;
use crate::image::Image;
use crate::layer::{self, LayerError};
use crate::models::network::NetworkSettings;
use crate::models::{merge_config, Config, HostConfig, State};
use crate::tagstore::{TagStore, TagStoreError};
use crate::util::{gen_id, run, ExternalToolError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use self::runner::Launched;

/// Memory limits below this are rejected as almost certainly a unit error.
pub const MIN_MEMORY: i64 = 524288;

pub(crate) const DEFAULT_HOSTS: &str = "127.0.0.1\tlocalhost
::1\t\tlocalhost ip6-localhost ip6-loopback
fe00::0\t\tip6-localnet
ff00::0\t\tip6-mcastprefix
ff02::1\t\tip6-allnodes
ff02::2\t\tip6-allrouters";

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("memory limit must be given in bytes (minimum {MIN_MEMORY} bytes)")]
    MemoryLimitTooLow,
    #[error("no command specified")]
    NoCommand,
    #[error("container {0} already exists")]
    ContainerExists(String),
    #[error(transparent)]
    TagStore(#[from] TagStoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed container record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("image {0} already exists in the graph")]
    IdCollision(String),
    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cannot serialize image record: {0}")]
    Json(#[from] serde_json::Error),
}

/// A container: the mutable record rooted at `containers/<id>/`, its
/// execution config and host-visible state. The runtime handle and launch
/// bookkeeping never hit the disk.
#[derive(Serialize, Deserialize, Debug)]
pub struct Container {
    #[serde(skip)]
    pub(crate) runtime: Runtime,
    pub id: String,
    pub created: DateTime<Utc>,
    /// Resolved entrypoint
    pub path: String,
    /// Resolved arguments (entrypoint tail + cmd)
    pub args: Vec<String>,
    pub config: Config,
    pub state: State,
    /// Resolved image id this container was created from
    pub image: String,
    pub network_settings: NetworkSettings,
    pub sys_init_path: String,
    pub resolv_conf_path: String,
    /// container path -> host path
    pub volumes: HashMap<String, String>,
    /// container path -> writable; paths absent here mount read-only
    pub volumes_rw: HashMap<String, bool>,
    #[serde(skip)]
    pub(crate) launched: Option<Launched>,
}

impl Container {
    /// Create a container from `config`, resolving and merging the image
    /// config when one is named. The container directory doubles as a
    /// barrier against id races.
    pub fn create(
        rt: &Runtime,
        tags: &TagStore,
        mut config: Config,
    ) -> Result<Container, ContainerError> {
        if config.memory != 0 && config.memory < MIN_MEMORY {
            return Err(ContainerError::MemoryLimitTooLow);
        }

        let image_id = if config.image.is_empty() {
            String::new()
        } else {
            let (id, img) = tags.lookup(&config.image)?;
            if let Some(image_config) = img.config.clone() {
                merge_config(&mut config, &image_config);
            }
            id
        };

        if config.entrypoint.is_empty() && config.cmd.is_empty() {
            return Err(ContainerError::NoCommand);
        }

        let id = gen_id();
        if config.hostname.is_empty() {
            config.hostname = id[..12].to_string();
        }

        let (path, args) = if !config.entrypoint.is_empty() {
            (
                config.entrypoint[0].clone(),
                config.entrypoint[1..]
                    .iter()
                    .chain(config.cmd.iter())
                    .cloned()
                    .collect(),
            )
        } else {
            (config.cmd[0].clone(), config.cmd[1..].to_vec())
        };

        let root = rt.container_dir(&id);
        match std::fs::create_dir(&root) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ContainerError::ContainerExists(id))
            }
            Err(err) => return Err(err.into()),
        }

        // a custom dns list gets a private resolv.conf, otherwise the
        // host's is bind-mounted in
        let resolv_conf_path = if config.dns.is_empty() {
            "/etc/resolv.conf".to_string()
        } else {
            let path = root.join("resolv.conf");
            let mut buf = String::new();
            for dns in config.dns.iter() {
                buf.push_str(&format!("nameserver {dns}\n"));
            }
            std::fs::write(&path, buf)?;
            path.to_string_lossy().to_string()
        };

        let sys_init_path = std::env::current_exe()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();

        let container = Container {
            runtime: rt.clone(),
            id,
            created: Utc::now(),
            path,
            args,
            config,
            state: State::default(),
            image: image_id,
            network_settings: NetworkSettings::default(),
            sys_init_path,
            resolv_conf_path,
            volumes: HashMap::new(),
            volumes_rw: HashMap::new(),
            launched: None,
        };
        container.to_disk()?;
        Ok(container)
    }

    pub fn load(rt: &Runtime, id: &str) -> Result<Container, ContainerError> {
        let data = std::fs::read(rt.container_dir(id).join("config.json"))?;
        let mut container: Container = serde_json::from_slice(&data)?;
        container.runtime = rt.clone();
        Ok(container)
    }

    pub fn root(&self) -> PathBuf {
        self.runtime.container_dir(&self.id)
    }

    pub fn path_to(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    pub fn rootfs_path(&self) -> PathBuf {
        self.path_to("rootfs")
    }

    pub fn rw_path(&self) -> PathBuf {
        self.path_to("rw")
    }

    pub fn json_path(&self) -> PathBuf {
        self.path_to("config.json")
    }

    pub fn host_config_path(&self) -> PathBuf {
        self.path_to("hostconfig.json")
    }

    pub fn lxc_config_path(&self) -> PathBuf {
        self.path_to("config.lxc")
    }

    /// Persist `config.json` atomically (temp + rename).
    pub fn to_disk(&self) -> Result<(), ContainerError> {
        let data = serde_json::to_vec(self)?;
        let mut tmp = self.json_path();
        tmp.set_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, self.json_path())?;
        Ok(())
    }

    pub fn read_host_config(&self) -> Result<HostConfig, ContainerError> {
        let data = std::fs::read(self.host_config_path())?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save_host_config(&self, host_config: &HostConfig) -> Result<(), ContainerError> {
        let data = serde_json::to_vec(host_config)?;
        std::fs::write(self.host_config_path(), data)?;
        Ok(())
    }

    /// Write `data` into the rw branch at `pth`, creating parents.
    pub fn inject(&self, mut data: impl std::io::Read, pth: &str) -> Result<(), ContainerError> {
        let rel = pth.trim_start_matches('/');
        let dest = self.rw_path().join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&dest)?;
        std::io::copy(&mut data, &mut file)?;
        Ok(())
    }

    pub fn mounted(&self) -> std::io::Result<bool> {
        layer::mounted(&self.rootfs_path())
    }

    pub fn mount(&self, tags: &TagStore) -> Result<(), LayerError> {
        let image = if self.image.is_empty() {
            Image::default()
        } else {
            tags.entries
                .get(&self.image)
                .cloned()
                .ok_or_else(|| LayerError::MissingLayer(self.image.clone()))?
        };
        image.mount(
            &self.runtime,
            &tags.entries,
            &self.rootfs_path(),
            &self.rw_path(),
        )
    }

    pub fn ensure_mounted(&self, tags: &TagStore) -> Result<(), LayerError> {
        if self.mounted()? {
            Ok(())
        } else {
            self.mount(tags)
        }
    }

    pub fn unmount(&self) -> Result<(), LayerError> {
        layer::unmount(&self.rootfs_path())
    }

    /// Delete the container's subtree.
    pub fn remove(&self) -> std::io::Result<()> {
        std::fs::remove_dir_all(self.root())
    }

    /// Freeze the writable branch into a new immutable layer. The layer is
    /// staged under `graph/_armktmp` and renamed into place; the snapshot
    /// is either a tar+bzip2 archive (also extracted for direct union
    /// mounting) or a squashfs image mounted lazily by the assembler.
    pub fn commit(
        &self,
        comment: &str,
        author: &str,
        config: Option<Config>,
        squash: bool,
    ) -> Result<Image, CommitError> {
        let config = match config {
            None => self.config.clone(),
            Some(mut user) => {
                merge_config(&mut user, &self.config);
                user
            }
        };

        let img = Image {
            id: gen_id(),
            parent: self.image.clone(),
            comment: comment.to_string(),
            created: Utc::now(),
            container: self.id.clone(),
            container_config: self.config.clone(),
            author: author.to_string(),
            config: Some(config),
            architecture: "x86_64".to_string(),
            ..Default::default()
        };

        let staging = self.runtime.commit_staging_dir();
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        let layer_path = staging.join("layer");
        std::fs::create_dir_all(&layer_path)?;

        let rw = self.rw_path();
        let rw_str = rw.to_string_lossy();
        let result = if squash {
            let layer_fs = staging.join("layer.fs");
            let fs_str = layer_fs.to_string_lossy();
            run(
                "mksquashfs",
                &[rw_str.as_ref(), fs_str.as_ref(), "-comp", "xz"],
            )
        } else {
            let tarbz2 = staging.join("layer.tar.bz2");
            let tar_str = tarbz2.to_string_lossy();
            let layer_str = layer_path.to_string_lossy();
            run(
                "tar",
                &["--numeric-owner", "-cjf", tar_str.as_ref(), "-C", rw_str.as_ref(), "."],
            )
            .and_then(|_| run("tar", &["-xjf", tar_str.as_ref(), "-C", layer_str.as_ref()]))
        };
        if let Err(err) = result {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(err.into());
        }

        std::fs::write(staging.join("json"), serde_json::to_vec(&img)?)?;

        let dest = self.runtime.image_dir(&img.id);
        if dest.exists() {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(CommitError::IdCollision(img.id));
        }
        if let Err(err) = std::fs::rename(&staging, &dest) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(err.into());
        }
        Ok(img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn seeded(rt_image: Option<Config>) -> (tempfile::TempDir, Runtime, TagStore) {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();
        let mut tags = TagStore::load(&rt).unwrap();
        if let Some(config) = rt_image {
            let img = Image {
                id: "baseimage0000".to_string(),
                created: Utc::now(),
                config: Some(config),
                ..Default::default()
            };
            let dir = rt.image_dir(&img.id);
            std::fs::create_dir_all(dir.join("layer")).unwrap();
            std::fs::write(dir.join("json"), serde_json::to_vec(&img).unwrap()).unwrap();
            tags = TagStore::load(&rt).unwrap();
            tags.add("base", "latest", &img.id);
        }
        (tmp, rt, tags)
    }

    #[test]
    fn test_create_requires_a_command() {
        let (_tmp, rt, tags) = seeded(None);
        let err = Container::create(&rt, &tags, Config::default()).unwrap_err();
        assert!(matches!(err, ContainerError::NoCommand));
    }

    #[test]
    fn test_create_rejects_tiny_memory_limits() {
        let (_tmp, rt, tags) = seeded(None);
        let config = Config {
            memory: 1024,
            cmd: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let err = Container::create(&rt, &tags, config).unwrap_err();
        assert!(matches!(err, ContainerError::MemoryLimitTooLow));
    }

    #[test]
    fn test_create_defaults_hostname_and_resolves_command() {
        let (_tmp, rt, tags) = seeded(None);
        let config = Config {
            entrypoint: vec!["/entry".to_string(), "-v".to_string()],
            cmd: vec!["run".to_string()],
            ..Default::default()
        };
        let container = Container::create(&rt, &tags, config).unwrap();
        assert_eq!(container.config.hostname, container.id[..12].to_string());
        assert_eq!(container.path, "/entry");
        assert_eq!(container.args, vec!["-v", "run"]);
        assert!(container.root().is_dir());
        assert_eq!(container.resolv_conf_path, "/etc/resolv.conf");
    }

    #[test]
    fn test_create_merges_image_config() {
        let image_config = Config {
            env: vec!["HOME=/".to_string()],
            cmd: vec!["/bin/sh".to_string()],
            volumes: BTreeSet::from(["/data".to_string()]),
            ..Default::default()
        };
        let (_tmp, rt, tags) = seeded(Some(image_config));
        let config = Config {
            image: "base".to_string(),
            env: vec!["FOO=1".to_string()],
            ..Default::default()
        };
        let container = Container::create(&rt, &tags, config).unwrap();
        assert_eq!(container.image, "baseimage0000");
        assert_eq!(container.config.env, vec!["FOO=1", "HOME=/"]);
        assert_eq!(container.path, "/bin/sh");
        assert!(container.config.volumes.contains("/data"));
    }

    #[test]
    fn test_create_writes_private_resolv_conf() {
        let (_tmp, rt, tags) = seeded(None);
        let config = Config {
            cmd: vec!["/bin/true".to_string()],
            dns: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            ..Default::default()
        };
        let container = Container::create(&rt, &tags, config).unwrap();
        let body = std::fs::read_to_string(&container.resolv_conf_path).unwrap();
        assert_eq!(body, "nameserver 8.8.8.8\nnameserver 1.1.1.1\n");
    }

    #[test]
    fn test_to_disk_load_round_trip() {
        let (_tmp, rt, tags) = seeded(None);
        let config = Config {
            cmd: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let container = Container::create(&rt, &tags, config).unwrap();
        let loaded = Container::load(&rt, &container.id).unwrap();
        assert_eq!(loaded.id, container.id);
        assert_eq!(loaded.path, container.path);
        assert_eq!(loaded.config, container.config);
        assert!(!loaded.state.running);
    }

    #[test]
    fn test_inject_creates_parents() {
        let (_tmp, rt, tags) = seeded(None);
        let config = Config {
            cmd: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let container = Container::create(&rt, &tags, config).unwrap();
        container.inject(&b"payload"[..], "/opt/pkg/file.bin").unwrap();
        let body = std::fs::read(container.rw_path().join("opt/pkg/file.bin")).unwrap();
        assert_eq!(body, b"payload");
    }

    #[test]
    fn test_host_config_round_trip() {
        let (_tmp, rt, tags) = seeded(None);
        let config = Config {
            cmd: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let container = Container::create(&rt, &tags, config).unwrap();
        let host_config = HostConfig {
            binds: vec!["/src:/dst:ro".to_string()],
            save: true,
            ..Default::default()
        };
        container.save_host_config(&host_config).unwrap();
        let loaded = container.read_host_config().unwrap();
        assert_eq!(loaded.binds, host_config.binds);
        assert!(loaded.save);
    }
}
