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

//! Removal of containers and images. A container is matched first (by id
//! prefix over the containers directory) and refused while its `running`
//! marker exists; otherwise the name is resolved as a tag or an image id
//! prefix, and the layer itself is only deleted once nothing references
//! it.

use crate::config::Runtime;
use crate::image::{expand_image_id, Image};
use crate::layer::LayerError;
use crate::tagstore::{parse_repository_tag, TagStore, TagStoreError};
use crate::util::{expand_id, truncate_id};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum NukeError {
    #[error("cowardly refusing to nuke running container {0}")]
    ContainerRunning(String),
    #[error("unable to find repo '{0}'")]
    NotFound(String),
    #[error("{0} is a parent image, not removing (use force to force)")]
    UsedAsParent(String),
    #[error(transparent)]
    TagStore(#[from] TagStoreError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum NukeOutcome {
    RemovedContainer(String),
    RemovedImage(String),
    /// A tag was dropped but the layer is still referenced elsewhere
    UntaggedOnly(String),
}

pub fn nuke(rt: &Runtime, name: &str, force: bool) -> Result<NukeOutcome, NukeError> {
    let id = expand_id(rt.containers_dir(), name).unwrap_or_else(|_| name.to_string());
    let root = rt.container_dir(&id);
    if root.exists() {
        if root.join("running").exists() {
            return Err(NukeError::ContainerRunning(id));
        }
        std::fs::remove_dir_all(&root)?;
        info!("removed {id}");
        return Ok(NukeOutcome::RemovedContainer(id));
    }

    nuke_image(rt, name, force)
}

fn nuke_image(rt: &Runtime, name: &str, force: bool) -> Result<NukeOutcome, NukeError> {
    let mut tags = TagStore::load(rt)?;

    let img: Image = match tags.lookup(name) {
        Ok((_, image)) => {
            let image = image.clone();
            let (repo, tag) = parse_repository_tag(name);
            tags.remove_tag(&repo, &tag);
            image
        }
        Err(_) => {
            let long = expand_image_id(rt, name).unwrap_or_else(|_| name.to_string());
            let Some(image) = tags.entries.get(&long) else {
                return Err(NukeError::NotFound(name.to_string()));
            };
            if !force && tags.used_as_parent(&long) {
                return Err(NukeError::UsedAsParent(name.to_string()));
            }
            image.clone()
        }
    };

    let outcome = if tags.find(&img.id).is_some() {
        info!("removing {name} tag on {} only", truncate_id(&img.id));
        NukeOutcome::UntaggedOnly(img.id.clone())
    } else {
        info!("nuking image {name}");
        img.remove(rt)?;
        NukeOutcome::RemovedImage(img.id.clone())
    };

    tags.flush()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn seeded() -> (tempfile::TempDir, Runtime) {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();
        (tmp, rt)
    }

    fn write_image(rt: &Runtime, id: &str, parent: &str) {
        let img = Image {
            id: id.to_string(),
            parent: parent.to_string(),
            created: Utc::now(),
            ..Default::default()
        };
        let dir = rt.image_dir(id);
        std::fs::create_dir_all(dir.join("layer")).unwrap();
        std::fs::write(dir.join("json"), serde_json::to_vec(&img).unwrap()).unwrap();
    }

    fn tag(rt: &Runtime, repo: &str, tag_name: &str, id: &str) {
        let mut tags = TagStore::load(rt).unwrap();
        tags.add(repo, tag_name, id);
        tags.flush().unwrap();
    }

    #[test]
    fn test_refuses_running_container() {
        let (_tmp, rt) = seeded();
        let dir = rt.container_dir("cafe00");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("running"), b"123\n").unwrap();
        let err = nuke(&rt, "cafe", false).unwrap_err();
        assert!(matches!(err, NukeError::ContainerRunning(_)));
        assert!(dir.exists());
    }

    #[test]
    fn test_removes_stopped_container() {
        let (_tmp, rt) = seeded();
        let dir = rt.container_dir("cafe00");
        std::fs::create_dir_all(&dir).unwrap();
        let outcome = nuke(&rt, "cafe", false).unwrap();
        assert_eq!(outcome, NukeOutcome::RemovedContainer("cafe00".to_string()));
        assert!(!dir.exists());
    }

    #[test]
    fn test_removes_image_with_sole_tag() {
        let (_tmp, rt) = seeded();
        write_image(&rt, "img000", "");
        tag(&rt, "repo", "latest", "img000");
        let outcome = nuke(&rt, "repo:latest", false).unwrap();
        assert_eq!(outcome, NukeOutcome::RemovedImage("img000".to_string()));
        assert!(!rt.image_dir("img000").exists());
    }

    #[test]
    fn test_untags_only_when_other_tags_remain() {
        let (_tmp, rt) = seeded();
        write_image(&rt, "img000", "");
        tag(&rt, "repo", "latest", "img000");
        tag(&rt, "repo", "v1", "img000");
        let outcome = nuke(&rt, "repo:latest", false).unwrap();
        assert_eq!(outcome, NukeOutcome::UntaggedOnly("img000".to_string()));
        assert!(rt.image_dir("img000").exists());
        let tags = TagStore::load(&rt).unwrap();
        assert!(tags.repositories["repo"].contains_key("v1"));
        assert!(!tags.repositories["repo"].contains_key("latest"));
    }

    #[test]
    fn test_parent_guard_and_force() {
        let (_tmp, rt) = seeded();
        write_image(&rt, "parent0", "");
        write_image(&rt, "child00", "parent0");
        let err = nuke(&rt, "parent0", false).unwrap_err();
        assert!(matches!(err, NukeError::UsedAsParent(_)));
        let outcome = nuke(&rt, "parent0", true).unwrap();
        assert_eq!(outcome, NukeOutcome::RemovedImage("parent0".to_string()));
        assert!(!rt.image_dir("parent0").exists());
    }

    #[test]
    fn test_unknown_name() {
        let (_tmp, rt) = seeded();
        let err = nuke(&rt, "ghost", false).unwrap_err();
        assert!(matches!(err, NukeError::NotFound(_)));
    }
}
