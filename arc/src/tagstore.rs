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
use crate::image::Image;
use crate::util::truncate_id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_TAG: &str = "latest";

/// tag -> image id
pub type Repository = HashMap<String, String>;

/// The mutable name index over the image graph. `repositories` is the
/// persisted part; `entries` is rebuilt from the graph directory on load.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct TagStore {
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub entries: HashMap<String, Image>,
    #[serde(default)]
    pub repositories: HashMap<String, Repository>,
}

#[derive(Error, Debug)]
pub enum TagStoreError {
    #[error("no tag store at {0:?}")]
    StoreMissing(PathBuf),
    #[error("no repo named '{0}'")]
    UnknownRepo(String),
    #[error("no tag named '{1}' in repo '{0}'")]
    UnknownTag(String, String),
    #[error("tag {0}:{1} references image {2} which is not on disk")]
    DanglingTag(String, String, String),
    #[error("no path set on tag store to flush")]
    NoPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed tag store: {0}")]
    Json(#[from] serde_json::Error),
}

/// Split a name into (repo, tag). The colon is a repo-vs-tag separator only
/// when the suffix carries no '/', which tolerates registry-host prefixes
/// such as `localhost.localdomain:5000/samalba/hipache:latest`.
pub fn parse_repository_tag(name: &str) -> (String, String) {
    match name.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (name.to_string(), DEFAULT_TAG.to_string()),
    }
}

impl TagStore {
    /// Parse a `repositories` file without scanning any graph.
    pub fn read_repo_file(path: impl Into<PathBuf>) -> Result<TagStore, TagStoreError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TagStoreError::StoreMissing(path))
            }
            Err(err) => return Err(err.into()),
        };
        let mut store: TagStore = serde_json::from_slice(&data)?;
        store.path = path;
        Ok(store)
    }

    /// Load the tag store and index the graph directory. Entries whose
    /// `json` cannot be read or parsed are skipped; unresolved parents are
    /// reported but do not abort the load.
    pub fn load(rt: &Runtime) -> Result<TagStore, TagStoreError> {
        let mut store = Self::read_repo_file(rt.repositories_path())?;

        for entry in std::fs::read_dir(rt.graph_dir())? {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().to_string();
            let json_path = entry.path().join("json");
            let data = match std::fs::read(&json_path) {
                Ok(data) => data,
                Err(_) => continue,
            };
            match serde_json::from_slice::<Image>(&data) {
                Ok(img) => {
                    store.entries.insert(id, img);
                }
                Err(err) => {
                    debug!("skipping graph entry {id} with malformed json: {err}");
                }
            }
        }

        for img in store.entries.values() {
            if !img.parent.is_empty() && !store.entries.contains_key(&img.parent) {
                warn!("unable to find parent image {}", truncate_id(&img.parent));
            }
        }

        Ok(store)
    }

    /// Resolve a symbolic name to its image id without touching `entries`.
    pub fn lookup_id(&self, name: &str) -> Result<String, TagStoreError> {
        let (repo, tag) = parse_repository_tag(name);
        let tags = self
            .repositories
            .get(&repo)
            .ok_or_else(|| TagStoreError::UnknownRepo(repo.clone()))?;
        tags.get(&tag)
            .cloned()
            .ok_or(TagStoreError::UnknownTag(repo, tag))
    }

    /// Resolve a symbolic name to (image id, image record).
    pub fn lookup(&self, name: &str) -> Result<(String, &Image), TagStoreError> {
        let (repo, tag) = parse_repository_tag(name);
        let tags = self
            .repositories
            .get(&repo)
            .ok_or_else(|| TagStoreError::UnknownRepo(repo.clone()))?;
        let id = tags
            .get(&tag)
            .ok_or_else(|| TagStoreError::UnknownTag(repo.clone(), tag.clone()))?;
        let img = self
            .entries
            .get(id)
            .ok_or_else(|| TagStoreError::DanglingTag(repo, tag, id.clone()))?;
        Ok((id.clone(), img))
    }

    pub fn lookup_image(&self, name: &str) -> Result<&Image, TagStoreError> {
        self.lookup(name).map(|(_, img)| img)
    }

    pub fn add(&mut self, repo: &str, tag: &str, id: &str) {
        self.repositories
            .entry(repo.to_string())
            .or_default()
            .insert(tag.to_string(), id.to_string());
    }

    /// First tag pointing at `id`, if any.
    pub fn find(&self, id: &str) -> Option<(String, String)> {
        for (repo, tags) in self.repositories.iter() {
            for (tag, hash) in tags.iter() {
                if hash == id {
                    return Some((repo.clone(), tag.clone()));
                }
            }
        }
        None
    }

    /// Whether any indexed image names `id` as its parent.
    pub fn used_as_parent(&self, id: &str) -> bool {
        self.entries.values().any(|img| img.parent == id)
    }

    pub fn remove_tag(&mut self, repo: &str, tag: &str) -> bool {
        let Some(tags) = self.repositories.get_mut(repo) else {
            return false;
        };
        tags.remove(tag);
        if tags.is_empty() {
            self.repositories.remove(repo);
        }
        true
    }

    /// Drop every tag that points exactly at `id`.
    pub fn remove(&mut self, id: &str) -> bool {
        self.remove_where(|hash| hash == id)
    }

    /// Drop every tag whose target starts with `prefix`.
    pub fn remove_by_prefix(&mut self, prefix: &str) -> bool {
        self.remove_where(|hash| hash.starts_with(prefix))
    }

    fn remove_where(&mut self, matches: impl Fn(&str) -> bool) -> bool {
        let mut deleted = false;
        self.repositories.retain(|_, tags| {
            tags.retain(|_, hash| {
                if matches(hash) {
                    deleted = true;
                    false
                } else {
                    true
                }
            });
            !tags.is_empty()
        });
        deleted
    }

    /// Copy every tag referencing `id` into another store, used when
    /// exporting and importing archives.
    pub fn copy_to(&self, other: &mut TagStore, id: &str, clobber: bool) {
        for (name, tags) in self.repositories.iter() {
            for (tag, hash) in tags.iter() {
                if hash != id {
                    continue;
                }
                let dest = other.repositories.entry(name.clone()).or_default();
                if clobber || !dest.contains_key(tag) {
                    dest.insert(tag.clone(), hash.clone());
                }
            }
        }
    }

    /// Persist atomically: serialize to a sibling temp file and rename over
    /// the store.
    pub fn flush(&self) -> Result<(), TagStoreError> {
        if self.path.as_os_str().is_empty() {
            return Err(TagStoreError::NoPath);
        }
        let data = serde_json::to_vec(self)?;
        let mut tmp = self.path.clone();
        tmp.set_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
