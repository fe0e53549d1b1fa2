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

pub mod directives;
pub mod parse;

use crate::config::Runtime;
use crate::container::runner::StartError;
use crate::container::{CommitError, Container, ContainerError};
use crate::layer::LayerError;
use crate::models::{Config, HostConfig};
use crate::tagstore::{parse_repository_tag, TagStore, TagStoreError};
use crate::util::{run, truncate_id, ExternalToolError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use self::directives::Directive;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("can't build a directory with no Dockerfile")]
    MissingRecipe,
    #[error("invalid recipe line: {0}")]
    InvalidLine(String),
    #[error("invalid {0} format")]
    InvalidFormat(&'static str),
    #[error("please provide a source image with `from` prior to run")]
    NoBaseImage,
    #[error("the command '{command}' returned a non-zero code: {code}")]
    RunFailed { command: String, code: i32 },
    #[error("{0} has been deprecated, please use ADD instead")]
    Deprecated(&'static str),
    #[error("entrypoint cannot be empty")]
    EmptyEntrypoint,
    #[error("volume cannot be empty")]
    EmptyVolume,
    #[error("cannot determine filename from url: {0}")]
    NoFilename(String),
    #[error("got HTTP status code >= 400: {0}")]
    Downstream(u16),
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("aborted build")]
    Aborted,
    #[error("an error occurred during the build: no container was produced")]
    NothingBuilt,
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    TagStore(#[from] TagStoreError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Committed and tagged
    Image { id: String, name: String },
    /// Accumulator kept for inspection
    Container { id: String },
}

/// Interpreter for a line-oriented image recipe. A single long-lived
/// accumulator container absorbs the effect of every instruction; the
/// result is either committed to a tagged image or the accumulator is
/// handed to the caller.
pub struct BuildFile {
    pub(crate) runtime: Runtime,
    pub(crate) tags: TagStore,
    pub(crate) image: String,
    pub(crate) maintainer: String,
    pub(crate) config: Config,
    pub(crate) context: PathBuf,
    pub(crate) host_config: HostConfig,
    pub(crate) container: Option<Container>,
    pub(crate) out_image: Option<String>,
    pub(crate) squash: bool,
    pub(crate) save_container: bool,
    pub(crate) abort: mpsc::Receiver<()>,
}

impl BuildFile {
    pub fn new(
        runtime: Runtime,
        tags: TagStore,
        out_image: Option<String>,
        squash: bool,
        abort: mpsc::Receiver<()>,
    ) -> BuildFile {
        BuildFile {
            runtime,
            tags,
            image: String::new(),
            maintainer: String::new(),
            config: Config::default(),
            context: PathBuf::new(),
            host_config: HostConfig::default(),
            container: None,
            out_image,
            squash,
            save_container: false,
            abort,
        }
    }

    /// Interpret `Dockerfile` in the context directory. The accumulator is
    /// removed on the way out unless the build asked for it to be kept.
    pub async fn build(&mut self, context: &Path) -> Result<BuildOutcome, BuildError> {
        let result = self.build_inner(context).await;
        self.cleanup();
        result
    }

    /// Build an image from a plain tarball: an empty base plus one ADD.
    pub async fn build_tar(&mut self, tar: &str) -> Result<BuildOutcome, BuildError> {
        let result = self.build_tar_inner(tar).await;
        self.cleanup();
        result
    }

    fn cleanup(&mut self) {
        if self.save_container {
            return;
        }
        if let Some(container) = self.container.take() {
            if let Err(err) = container.remove() {
                warn!("unable to remove build container {}: {err}", container.id);
            }
        }
    }

    async fn build_inner(&mut self, context: &Path) -> Result<BuildOutcome, BuildError> {
        self.context = context.to_path_buf();

        // optional preprocessor
        if context.join("build.sh").exists() {
            info!("step 0: execute build.sh on host");
            run(
                "/bin/sh",
                &["-c", &format!("cd {} && bash ./build.sh", context.display())],
            )?;
        }

        let recipe = std::fs::read_to_string(context.join("Dockerfile"))
            .map_err(|_| BuildError::MissingRecipe)?;

        let mut step = 0;
        for raw in recipe.lines() {
            // cooperative abort between instructions; whatever is in
            // flight runs to completion first
            if self.abort.try_recv().is_ok() {
                info!("aborting...");
                if let Some(container) = self.container.take() {
                    let _ = container.remove();
                }
                return Err(BuildError::Aborted);
            }

            let Some((instruction, arguments)) = parse::parse_line(raw)? else {
                continue;
            };
            let Some(directive) = Directive::from_name(&instruction) else {
                warn!("skipping unknown instruction {instruction}");
                continue;
            };
            step += 1;
            info!("step {step}: {instruction} {arguments}");
            self.apply(directive, &arguments).await?;
        }

        self.finish().await
    }

    async fn build_tar_inner(&mut self, tar: &str) -> Result<BuildOutcome, BuildError> {
        self.context = PathBuf::from("/");
        self.cmd_from("").await?;
        self.cmd_add(&format!("{tar} /")).await?;
        self.finish().await
    }

    async fn finish(&mut self) -> Result<BuildOutcome, BuildError> {
        let squash = self.squash;
        let maintainer = self.maintainer.clone();
        let out_image = self.out_image.clone();
        let Some(container) = self.container.as_mut() else {
            return Err(BuildError::NothingBuilt);
        };
        container.config.cmd.clear();
        container.to_disk()?;

        if let Some(out_image) = out_image {
            let img = container.commit("", &maintainer, None, squash)?;
            let (repo, tag) = parse_repository_tag(&out_image);
            self.tags.add(&repo, &tag, &img.id);
            self.tags.flush()?;
            info!("built {out_image} successfully");
            return Ok(BuildOutcome::Image {
                id: img.id,
                name: out_image,
            });
        }

        self.save_container = true;
        let id = self
            .container
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default();
        info!("successfully built {}", truncate_id(&id));
        Ok(BuildOutcome::Container { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (tempfile::TempDir, BuildFile, mpsc::Sender<()>) {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();
        let tags = TagStore::load(&rt).unwrap();
        let (tx, rx) = mpsc::channel(1);
        let builder = BuildFile::new(rt, tags, None, false, rx);
        (tmp, builder, tx)
    }

    #[tokio::test]
    async fn test_build_requires_a_recipe() {
        let (tmp, mut builder, _tx) = harness();
        let context = tmp.path().join("ctx");
        std::fs::create_dir(&context).unwrap();
        let err = builder.build(&context).await.unwrap_err();
        assert!(matches!(err, BuildError::MissingRecipe));
    }

    #[tokio::test]
    async fn test_abort_between_instructions() {
        let (tmp, mut builder, tx) = harness();
        let context = tmp.path().join("ctx");
        std::fs::create_dir(&context).unwrap();
        std::fs::write(context.join("Dockerfile"), "RUN true\n").unwrap();
        tx.send(()).await.unwrap();
        let err = builder.build(&context).await.unwrap_err();
        assert!(matches!(err, BuildError::Aborted));
        // no accumulator container survives the abort
        assert_eq!(
            std::fs::read_dir(builder.runtime.containers_dir())
                .unwrap()
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn test_unknown_instructions_are_skipped() {
        let (tmp, mut builder, _tx) = harness();
        let context = tmp.path().join("ctx");
        std::fs::create_dir(&context).unwrap();
        std::fs::write(
            context.join("Dockerfile"),
            "# only noise\nFROBNICATE everything\n",
        )
        .unwrap();
        // nothing ran, so no container was produced
        let err = builder.build(&context).await.unwrap_err();
        assert!(matches!(err, BuildError::NothingBuilt));
    }
}
