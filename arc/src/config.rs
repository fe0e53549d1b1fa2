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
use std::path::{Path, PathBuf};

/// Default root of all persistent runtime state.
pub const DIR: &str = "/var/lib/ar-container";

/// Per-pid details of running containers live in RUN_DIR/$PID/.
pub const RUN_DIR: &str = "/var/run/ar-container";

/// When a container's data is initialized, it advertises by placing a file
/// at INIT_DIR/$PID.
pub const INIT_DIR: &str = "/var/run/ar-container/running";

/// Handle to an on-disk runtime layout. The default points at [`DIR`] and
/// [`RUN_DIR`]; tests parameterize both.
#[derive(Clone, Debug)]
pub struct Runtime {
    root: PathBuf,
    run_root: PathBuf,
}

impl Default for Runtime {
    fn default() -> Runtime {
        Runtime {
            root: PathBuf::from(DIR),
            run_root: PathBuf::from(RUN_DIR),
        }
    }
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime::default()
    }

    pub fn with_root(root: impl AsRef<Path>, run_root: impl AsRef<Path>) -> Runtime {
        Runtime {
            root: root.as_ref().to_path_buf(),
            run_root: run_root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn graph_dir(&self) -> PathBuf {
        self.root.join("graph")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    pub fn repositories_path(&self) -> PathBuf {
        self.root.join("repositories")
    }

    pub fn ips_path(&self) -> PathBuf {
        self.root.join("ips")
    }

    pub fn image_dir(&self, id: &str) -> PathBuf {
        self.graph_dir().join(id)
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    /// Scaffolding layer appended at the tail of every union mount.
    pub fn init_layer_dir(&self) -> PathBuf {
        self.graph_dir().join("_init")
    }

    /// Staging area used by the committer, renamed into place on success.
    pub fn commit_staging_dir(&self) -> PathBuf {
        self.graph_dir().join("_armktmp")
    }

    pub fn run_dir(&self, pid: u32) -> PathBuf {
        self.run_root.join(pid.to_string())
    }

    pub fn init_marker(&self, pid: u32) -> PathBuf {
        self.run_root.join("running").join(pid.to_string())
    }

    /// Create the directory skeleton and an empty tag store if absent.
    /// Not auto-run on purpose.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.graph_dir(),
            self.containers_dir(),
            self.volumes_dir(),
            self.run_root.clone(),
            self.run_root.join("running"),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        let repositories = self.repositories_path();
        if !repositories.exists() {
            std::fs::write(repositories, b"{}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Runtime;

    #[test]
    fn test_layout_paths() {
        let rt = Runtime::with_root("/tmp/arc-root", "/tmp/arc-run");
        assert_eq!(rt.image_dir("abc"), std::path::Path::new("/tmp/arc-root/graph/abc"));
        assert_eq!(
            rt.container_dir("abc"),
            std::path::Path::new("/tmp/arc-root/containers/abc")
        );
        assert_eq!(rt.init_marker(42), std::path::Path::new("/tmp/arc-run/running/42"));
    }

    #[test]
    fn test_ensure_layout_seeds_empty_tagstore() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();
        assert!(rt.graph_dir().is_dir());
        assert!(rt.containers_dir().is_dir());
        let data = std::fs::read(rt.repositories_path()).unwrap();
        assert_eq!(data, b"{}");
        // a second run must not clobber existing state
        std::fs::write(rt.repositories_path(), b"{\"repositories\":{}}").unwrap();
        rt.ensure_layout().unwrap();
        let data = std::fs::read(rt.repositories_path()).unwrap();
        assert_eq!(data, b"{\"repositories\":{}}");
    }
}
