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
use crate::util::{run, ExternalToolError};
use nix::mount::{mount, umount, MsFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// External xino file keeps aufs inode bookkeeping off the branches.
pub const XINO_PATH: &str = "/dev/shm/aufs.xino";

#[derive(Error, Debug)]
pub enum LayerError {
    #[error("layer for image {0} is missing")]
    MissingLayer(String),
    #[error("kernel union filesystem unavailable: {0}")]
    UnionUnavailable(nix::Error),
    #[error("failed to unmount {0:?} within the retry budget")]
    UnmountStuck(PathBuf),
    #[error("{0:?} is already mounted")]
    AlreadyMounted(PathBuf),
    #[error("mount failed: {0}")]
    Mount(nix::Error),
    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Render the aufs branch specification. The writable branch leads, the
/// read-only layers follow in the order given (image's own layer first,
/// oldest ancestor and the init scaffolding last).
pub(crate) fn union_branches(ro: &[PathBuf], rw: &Path) -> String {
    let mut branches = format!("br:{}=rw", rw.display());
    for layer in ro {
        branches.push_str(&format!(":{}=ro+wh", layer.display()));
    }
    branches.push_str(&format!(",xino={XINO_PATH}"));
    branches
}

fn try_mount(target: &Path, branches: &str) -> nix::Result<()> {
    mount(
        Some("none"),
        target,
        Some("aufs"),
        MsFlags::empty(),
        Some(branches),
    )
}

/// Union-mount the read-only layer stack with `rw` as the writable branch
/// at `target`. On ENODEV the aufs module is loaded once before retrying.
pub fn mount_union(ro: &[PathBuf], rw: &Path, target: &Path) -> Result<(), LayerError> {
    let branches = union_branches(ro, rw);
    match try_mount(target, &branches) {
        Ok(()) => Ok(()),
        Err(nix::Error::ENODEV) => {
            warn!("kernel does not support aufs, trying to load the module with modprobe");
            run("modprobe", &["aufs"])
                .map_err(|_| LayerError::UnionUnavailable(nix::Error::ENODEV))?;
            try_mount(target, &branches).map_err(LayerError::UnionUnavailable)
        }
        Err(err) => Err(LayerError::Mount(err)),
    }
}

/// Unmount a union mountpoint and remove the directory. aufs keeps the
/// mountpoint busy for a short while after umount, so removal is retried
/// up to 1000 times at 10ms intervals.
pub fn unmount(target: &Path) -> Result<(), LayerError> {
    std::fs::metadata(target)?;

    let target_str = target.to_string_lossy();
    if let Err(err) = run("auplink", &[target_str.as_ref(), "flush"]) {
        warn!("couldn't run auplink before unmount: {err}");
    }

    umount(target).map_err(LayerError::Mount)?;

    for _ in 0..1000 {
        match std::fs::remove_dir(target) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    }

    Err(LayerError::UnmountStuck(target.to_path_buf()))
}

/// A directory is mounted iff its device differs from its parent's.
pub fn mounted(mountpoint: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let mnt = match std::fs::metadata(mountpoint) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let parent = std::fs::metadata(mountpoint.join(".."))?;
    Ok(mnt.dev() != parent.dev())
}

/// Create the scaffolding layer required by the in-container init: the
/// `.dockerinit` bind target, a resolv.conf placeholder and the standard
/// mountpoint directories.
pub fn ensure_init_layer(rt: &Runtime) -> std::io::Result<PathBuf> {
    let dir = rt.init_layer_dir();
    for sub in ["proc", "sys", "dev/pts", "etc"] {
        std::fs::create_dir_all(dir.join(sub))?;
    }
    let dockerinit = dir.join(".dockerinit");
    if !dockerinit.exists() {
        std::fs::write(&dockerinit, b"")?;
    }
    let resolv = dir.join("etc/resolv.conf");
    if !resolv.exists() {
        std::fs::write(&resolv, b"")?;
    }
    Ok(dir)
}
