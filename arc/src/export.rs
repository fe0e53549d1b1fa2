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

//! Image archive export and import. A layer travels as `<id>.layer`, a tar
//! holding `data.tar.bz2` (the payload) and `metadata.js` (the image
//! record), plus an `id` member when the image carries a symbolic name. A
//! `repositories` JSON at the root of the export directory accumulates tag
//! references.

use crate::config::Runtime;
use crate::image::Image;
use crate::tagstore::{parse_repository_tag, TagStore, TagStoreError};
use crate::util::{run, ExternalToolError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("can't find {0}")]
    UnknownName(String),
    #[error("tag doesn't reference an image: {0}")]
    DanglingTag(String),
    #[error(transparent)]
    TagStore(#[from] TagStoreError),
    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed image metadata: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where layer archives come from. Remote transports (object stores and
/// the like) plug in here; the runtime itself only ships the
/// directory-backed source.
pub trait LayerSource {
    /// Stage the members of the `<id>.layer` archive into `staging`.
    fn fetch(&self, id: &str, staging: &Path) -> Result<(), ExportError>;
}

/// Layer archives laid out flat in a local directory.
pub struct DirSource {
    dir: PathBuf,
}

impl DirSource {
    pub fn new(dir: impl Into<PathBuf>) -> DirSource {
        DirSource { dir: dir.into() }
    }

    pub fn layer_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.layer"))
    }
}

impl LayerSource for DirSource {
    fn fetch(&self, id: &str, staging: &Path) -> Result<(), ExportError> {
        let archive = self.layer_path(id);
        let archive_str = archive.to_string_lossy();
        let staging_str = staging.to_string_lossy();
        run(
            "tar",
            &[
                "--numeric-owner",
                "-f",
                archive_str.as_ref(),
                "-C",
                staging_str.as_ref(),
                "-x",
            ],
        )?;
        Ok(())
    }
}

/// Export `repo:tag` and its whole parent chain as layer archives under
/// `dir`, accumulating the tags into the export's `repositories` file.
pub fn export_image(
    rt: &Runtime,
    tags: &TagStore,
    dir: &Path,
    name: &str,
) -> Result<(), ExportError> {
    let (repo, tag) = parse_repository_tag(name);
    let hash = tags
        .repositories
        .get(&repo)
        .and_then(|t| t.get(&tag))
        .cloned()
        .ok_or_else(|| ExportError::UnknownName(name.to_string()))?;
    let mut img = tags
        .entries
        .get(&hash)
        .cloned()
        .ok_or_else(|| ExportError::DanglingTag(hash.clone()))?;
    img.ids = vec![format!("{repo}:{tag}")];

    let mut tout = match TagStore::read_repo_file(dir.join("repositories")) {
        Ok(store) => store,
        Err(TagStoreError::StoreMissing(_)) => TagStore::default(),
        Err(err) => return Err(err.into()),
    };

    info!("found {repo}:{tag} (parent: {})", img.parent);
    pkg(rt, tags, dir, &img, &hash, &mut tout)?;

    std::fs::write(dir.join("repositories"), serde_json::to_vec(&tout)?)?;
    Ok(())
}

fn pkg(
    rt: &Runtime,
    tags: &TagStore,
    out: &Path,
    img: &Image,
    hash: &str,
    tout: &mut TagStore,
) -> Result<(), ExportError> {
    let tarbz2 = out.join("data.tar.bz2");
    let layer_path = rt.image_dir(hash).join("layer");
    let json_path = rt.image_dir(hash).join("json");

    info!("creating archive of layer {hash}");
    let tarbz2_str = tarbz2.to_string_lossy().to_string();
    let layer_str = layer_path.to_string_lossy().to_string();
    run(
        "tar",
        &[
            "--numeric-owner",
            "-f",
            &tarbz2_str,
            "-C",
            &layer_str,
            "-cj",
            ".",
        ],
    )?;

    std::fs::copy(&json_path, out.join("metadata.js"))?;

    let final_path = out.join(format!("{hash}.layer"));
    let final_str = final_path.to_string_lossy().to_string();
    let out_str = out.to_string_lossy().to_string();
    let mut args: Vec<&str> = vec![
        "--numeric-owner",
        "-c",
        "-f",
        &final_str,
        "-C",
        &out_str,
        "data.tar.bz2",
        "metadata.js",
    ];
    if let Some(primary) = img.with_primary_id() {
        std::fs::write(out.join("id"), primary)?;
        args.push("id");
    }
    run("tar", &args)?;

    let _ = std::fs::remove_file(out.join("id"));
    let _ = std::fs::remove_file(&tarbz2);
    let _ = std::fs::remove_file(out.join("metadata.js"));

    tags.copy_to(tout, hash, true);

    if !img.parent.is_empty() {
        if out.join(format!("{}.layer", img.parent)).exists() {
            info!("skipping {}, already archived", img.parent);
        } else if let Some(parent_img) = tags.entries.get(&img.parent) {
            pkg(rt, tags, out, parent_img, &img.parent, tout)?;
        } else {
            warn!("parent layer {} is not in the graph, skipping", img.parent);
        }
    }
    Ok(())
}

/// Install `repo:tag` and its parent chain from an export directory into
/// the local graph. Existing layers are left untouched; tags are copied
/// without clobbering.
pub fn import_image(rt: &Runtime, dir: &Path, name: &str) -> Result<(), ExportError> {
    let source = DirSource::new(dir);
    let (repo, tag) = parse_repository_tag(name);
    info!("importing {repo}:{tag}");

    let in_tags = TagStore::read_repo_file(dir.join("repositories"))?;
    let hash = in_tags
        .repositories
        .get(&repo)
        .and_then(|t| t.get(&tag))
        .cloned()
        .ok_or_else(|| ExportError::UnknownName(name.to_string()))?;

    let mut sys = match TagStore::read_repo_file(rt.repositories_path()) {
        Ok(store) => store,
        Err(TagStoreError::StoreMissing(_)) => {
            let mut store = TagStore::default();
            store.path = rt.repositories_path();
            store
        }
        Err(err) => return Err(err.into()),
    };

    import_layer(rt, &source, &in_tags, &hash, &mut sys)?;

    sys.flush()?;
    Ok(())
}

fn import_layer(
    rt: &Runtime,
    source: &impl LayerSource,
    in_tags: &TagStore,
    hash: &str,
    sys: &mut TagStore,
) -> Result<(), ExportError> {
    let out = rt.image_dir(hash);
    if out.exists() {
        info!("layer {hash} already installed, not overwriting");
        return Ok(());
    }

    let tmp = rt.graph_dir().join(format!(":artmp:{hash}"));
    std::fs::create_dir_all(&tmp)?;
    std::fs::create_dir_all(out.join("layer"))?;

    source.fetch(hash, &tmp)?;

    let img: Image = serde_json::from_slice(&std::fs::read(tmp.join("metadata.js"))?)?;

    std::fs::copy(tmp.join("metadata.js"), out.join("json"))?;
    let data = tmp.join("data.tar.bz2");
    let data_str = data.to_string_lossy().to_string();
    let layer_str = out.join("layer").to_string_lossy().to_string();
    run(
        "tar",
        &["--numeric-owner", "-f", &data_str, "-C", &layer_str, "-xj"],
    )?;
    std::fs::copy(&data, out.join("layer.tar.bz2"))?;
    std::fs::remove_dir_all(&tmp)?;

    info!("importing tags");
    in_tags.copy_to(sys, hash, false);

    if !img.parent.is_empty() {
        info!("moving to import parent {}...", img.parent);
        import_layer(rt, source, in_tags, &img.parent, sys)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_unknown_name() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();
        let tags = TagStore::load(&rt).unwrap();
        let err = export_image(&rt, &tags, tmp.path(), "ghost:latest").unwrap_err();
        assert!(matches!(err, ExportError::UnknownName(_)));
    }

    #[test]
    fn test_export_dangling_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();
        let mut tags = TagStore::load(&rt).unwrap();
        tags.add("repo", "latest", "nowhere");
        let err = export_image(&rt, &tags, tmp.path(), "repo").unwrap_err();
        assert!(matches!(err, ExportError::DanglingTag(_)));
    }

    #[test]
    fn test_dir_source_layer_path() {
        let source = DirSource::new("/exports");
        assert_eq!(
            source.layer_path("abc"),
            PathBuf::from("/exports/abc.layer")
        );
    }

    #[test]
    fn test_import_requires_repositories_file() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();
        let err = import_image(&rt, &tmp.path().join("nope"), "repo").unwrap_err();
        assert!(matches!(
            err,
            ExportError::TagStore(TagStoreError::StoreMissing(_))
        ));
    }
}
