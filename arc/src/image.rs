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
use crate::layer::{self, LayerError};
use crate::models::Config;
use crate::util::{expand_id, run, truncate_id, ExpandError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// An immutable layer record, stored at `<graph>/<id>/json` next to its
/// payload. The parent linkage is by id; parents are resolved through the
/// tag store's entries map, never interned as owning references.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub comment: String,
    pub created: DateTime<Utc>,
    /// Id of the container this layer was committed from
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub container_config: Config,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub config: Option<Config>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub size: i64,
    /// Symbolic names attached on export; the first is the primary id
    #[serde(default)]
    pub ids: Vec<String>,
}

impl Default for Image {
    fn default() -> Image {
        Image {
            id: String::new(),
            parent: String::new(),
            comment: String::new(),
            created: DateTime::<Utc>::MIN_UTC,
            container: String::new(),
            container_config: Config::default(),
            author: String::new(),
            config: None,
            architecture: String::new(),
            size: 0,
            ids: Vec::new(),
        }
    }
}

impl Image {
    pub fn root(&self, rt: &Runtime) -> PathBuf {
        rt.image_dir(&self.id)
    }

    pub fn layer_dir(&self, rt: &Runtime) -> PathBuf {
        self.root(rt).join("layer")
    }

    pub fn with_primary_id(&self) -> Option<&str> {
        self.ids.first().map(|s| s.as_str())
    }

    /// Enumerate the union stack for this image: its own layer first, then
    /// each ancestor, with the init scaffolding layer appended at the tail.
    /// An unresolvable parent truncates the chain with a warning, matching
    /// the tag store's load-time diagnostics.
    pub fn layer_chain(
        &self,
        rt: &Runtime,
        entries: &HashMap<String, Image>,
    ) -> Result<Vec<PathBuf>, LayerError> {
        let mut layers = Vec::new();
        let mut cur = Some(self);
        while let Some(image) = cur {
            // the empty base image contributes no layer
            if image.id.is_empty() {
                break;
            }
            ensure_layer_present(rt, &image.id)?;
            layers.push(image.layer_dir(rt));
            cur = if image.parent.is_empty() {
                None
            } else {
                match entries.get(&image.parent) {
                    Some(parent) => Some(parent),
                    None => {
                        warn!("unable to find parent image {}", truncate_id(&image.parent));
                        None
                    }
                }
            };
        }
        layers.push(layer::ensure_init_layer(rt)?);
        Ok(layers)
    }

    /// Assemble the layered rootfs at `root` with `rw` as the writable
    /// branch.
    pub fn mount(
        &self,
        rt: &Runtime,
        entries: &HashMap<String, Image>,
        root: &Path,
        rw: &Path,
    ) -> Result<(), LayerError> {
        if layer::mounted(root)? {
            return Err(LayerError::AlreadyMounted(root.to_path_buf()));
        }
        let layers = self.layer_chain(rt, entries)?;
        std::fs::create_dir_all(root)?;
        std::fs::create_dir_all(rw)?;
        layer::mount_union(&layers, rw, root)
    }

    /// Delete the image's graph subtree. A loop-mounted squashfs layer is
    /// unmounted first.
    pub fn remove(&self, rt: &Runtime) -> Result<(), LayerError> {
        let layer_dir = self.layer_dir(rt);
        if layer_dir.exists() && layer::mounted(&layer_dir)? {
            nix::mount::umount(&layer_dir).map_err(LayerError::Mount)?;
        }
        std::fs::remove_dir_all(self.root(rt))?;
        Ok(())
    }
}

/// A layer payload is either an extracted `layer/` tree or a `layer.fs`
/// squashfs image that is loop-mounted onto `layer/` on demand.
fn ensure_layer_present(rt: &Runtime, id: &str) -> Result<(), LayerError> {
    let dir = rt.image_dir(id);
    let layer = dir.join("layer");
    let populated = layer
        .read_dir()
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    if populated {
        return Ok(());
    }

    let fs_image = dir.join("layer.fs");
    if fs_image.exists() {
        std::fs::create_dir_all(&layer)?;
        if !layer::mounted(&layer)? {
            let fs_str = fs_image.to_string_lossy();
            let layer_str = layer.to_string_lossy();
            run("mount", &["-o", "loop,ro", fs_str.as_ref(), layer_str.as_ref()])?;
        }
        return Ok(());
    }

    if layer.is_dir() {
        // a legitimately empty diff
        return Ok(());
    }

    Err(LayerError::MissingLayer(id.to_string()))
}

/// Expand a short image id to its full form against the graph directory.
pub fn expand_image_id(rt: &Runtime, id: &str) -> Result<String, ExpandError> {
    expand_id(rt.graph_dir(), id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Runtime;

    fn seed_image(rt: &Runtime, id: &str, parent: &str) -> Image {
        let img = Image {
            id: id.to_string(),
            parent: parent.to_string(),
            created: Utc::now(),
            architecture: "x86_64".to_string(),
            ..Default::default()
        };
        let dir = rt.image_dir(id);
        std::fs::create_dir_all(dir.join("layer")).unwrap();
        std::fs::write(dir.join("layer/marker"), id).unwrap();
        std::fs::write(dir.join("json"), serde_json::to_vec(&img).unwrap()).unwrap();
        img
    }

    #[test]
    fn test_layer_chain_child_first_init_last() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();

        let base = seed_image(&rt, "base00", "");
        let mid = seed_image(&rt, "mid000", "base00");
        let top = seed_image(&rt, "top000", "mid000");

        let mut entries = HashMap::new();
        for img in [&base, &mid, &top] {
            entries.insert(img.id.clone(), img.clone());
        }

        let chain = top.layer_chain(&rt, &entries).unwrap();
        assert_eq!(
            chain,
            vec![
                rt.image_dir("top000").join("layer"),
                rt.image_dir("mid000").join("layer"),
                rt.image_dir("base00").join("layer"),
                rt.init_layer_dir(),
            ]
        );
    }

    #[test]
    fn test_layer_chain_stops_at_unresolved_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();

        let orphan = seed_image(&rt, "orphan", "missing-parent");
        let entries = HashMap::from([(orphan.id.clone(), orphan.clone())]);

        let chain = orphan.layer_chain(&rt, &entries).unwrap();
        assert_eq!(
            chain,
            vec![rt.image_dir("orphan").join("layer"), rt.init_layer_dir()]
        );
    }

    #[test]
    fn test_missing_layer_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();

        let img = Image {
            id: "nolayer".to_string(),
            created: Utc::now(),
            ..Default::default()
        };
        std::fs::create_dir_all(rt.image_dir("nolayer")).unwrap();
        let entries = HashMap::from([(img.id.clone(), img.clone())]);
        let err = img.layer_chain(&rt, &entries).unwrap_err();
        assert!(matches!(err, LayerError::MissingLayer(id) if id == "nolayer"));
    }

    #[test]
    fn test_empty_layer_dir_is_a_valid_diff() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();

        let img = Image {
            id: "emptydiff".to_string(),
            created: Utc::now(),
            ..Default::default()
        };
        std::fs::create_dir_all(rt.image_dir("emptydiff").join("layer")).unwrap();
        let entries = HashMap::from([(img.id.clone(), img.clone())]);
        let chain = img.layer_chain(&rt, &entries).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_expand_image_id() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();
        seed_image(&rt, "abc123", "");
        seed_image(&rt, "abc456", "");

        assert!(expand_image_id(&rt, "abc").is_err());
        assert_eq!(expand_image_id(&rt, "abc1").unwrap(), "abc123");
    }
}
