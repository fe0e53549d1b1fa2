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
use super::{parse, BuildError, BuildFile};
use crate::container::Container;
use crate::models::{Config, HostConfig, ServiceSpec};
use crate::util::run;
use std::path::Path;
use std::process::Stdio;
use tracing::{debug, warn};

/// The instruction set, dispatched through a static table instead of
/// name reflection. Unknown names never reach this enum; the engine warns
/// and skips them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Directive {
    From,
    Maintainer,
    Run,
    Env,
    Cmd,
    Entrypoint,
    Expose,
    Service,
    Volume,
    Add,
    Insert,
    Copy,
}

impl Directive {
    pub(crate) fn from_name(name: &str) -> Option<Directive> {
        match name {
            "FROM" => Some(Directive::From),
            "MAINTAINER" => Some(Directive::Maintainer),
            "RUN" => Some(Directive::Run),
            "ENV" => Some(Directive::Env),
            "CMD" => Some(Directive::Cmd),
            "ENTRYPOINT" => Some(Directive::Entrypoint),
            "EXPOSE" => Some(Directive::Expose),
            "SERVICE" => Some(Directive::Service),
            "VOLUME" => Some(Directive::Volume),
            "ADD" => Some(Directive::Add),
            "INSERT" => Some(Directive::Insert),
            "COPY" => Some(Directive::Copy),
            _ => None,
        }
    }
}

impl BuildFile {
    pub(crate) async fn apply(
        &mut self,
        directive: Directive,
        args: &str,
    ) -> Result<(), BuildError> {
        match directive {
            Directive::From => self.cmd_from(args).await,
            Directive::Maintainer => self.cmd_maintainer(args),
            Directive::Run => self.cmd_run(args).await,
            Directive::Env => self.cmd_env(args),
            Directive::Cmd => self.cmd_cmd(args),
            Directive::Entrypoint => self.cmd_entrypoint(args),
            Directive::Expose => self.cmd_expose(args),
            Directive::Service => self.cmd_service(args),
            Directive::Volume => self.cmd_volume(args),
            Directive::Add => self.cmd_add(args).await,
            Directive::Insert => Err(BuildError::Deprecated("INSERT")),
            Directive::Copy => Err(BuildError::Deprecated("COPY")),
        }
    }

    /// The accumulated config: the accumulator container's once one
    /// exists, the pristine build config before FROM.
    fn config_mut(&mut self) -> &mut Config {
        match self.container.as_mut() {
            Some(container) => &mut container.config,
            None => &mut self.config,
        }
    }

    fn config_ref(&self) -> &Config {
        match self.container.as_ref() {
            Some(container) => &container.config,
            None => &self.config,
        }
    }

    /// Set the base image, reset the build config with the default
    /// environment and create the accumulator container from it.
    pub(crate) async fn cmd_from(&mut self, name: &str) -> Result<(), BuildError> {
        self.image = name.to_string();
        self.config = Config::default();
        self.host_config = HostConfig {
            save: true,
            quiet: true,
            ..Default::default()
        };
        if self.config.env.is_empty() {
            self.config.env.push("HOME=/".to_string());
            self.config.env.push(
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            );
        }
        self.start_accumulator()
    }

    fn start_accumulator(&mut self) -> Result<(), BuildError> {
        self.config.cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "#(nop) START".to_string(),
        ];
        self.config.image = self.image.clone();
        let container = Container::create(&self.runtime, &self.tags, self.config.clone())?;
        self.container = Some(container);
        Ok(())
    }

    fn cmd_maintainer(&mut self, name: &str) -> Result<(), BuildError> {
        self.maintainer = name.to_string();
        Ok(())
    }

    /// Execute `/bin/sh -c <args>` inside the accumulator and wait for it;
    /// a non-zero exit fails the build.
    pub(crate) async fn cmd_run(&mut self, args: &str) -> Result<(), BuildError> {
        if self.image.is_empty() {
            return Err(BuildError::NoBaseImage);
        }
        let BuildFile {
            container,
            tags,
            host_config,
            ..
        } = self;
        let Some(container) = container.as_mut() else {
            return Err(BuildError::NoBaseImage);
        };

        container.path = "/bin/sh".to_string();
        container.args = vec!["-c".to_string(), args.to_string()];
        container.start(tags, host_config).await?;
        let code = container.wait(host_config).await?;
        if code != 0 {
            return Err(BuildError::RunFailed {
                command: args.to_string(),
                code,
            });
        }
        Ok(())
    }

    /// Upsert `<KEY> <VALUE>` into the environment, expanding variable
    /// references in the value against the current environment.
    fn cmd_env(&mut self, args: &str) -> Result<(), BuildError> {
        let Some((key, value)) = args.split_once(' ') else {
            return Err(BuildError::InvalidFormat("ENV"));
        };
        let key = key.trim();
        let value = value.trim();
        let replaced = parse::expand_env(value, &self.config_ref().env);
        let entry = format!("{key}={replaced}");

        let env = &mut self.config_mut().env;
        match env
            .iter_mut()
            .find(|kv| kv.split('=').next() == Some(key))
        {
            Some(existing) => *existing = entry,
            None => env.push(entry),
        }
        Ok(())
    }

    /// A JSON array, or a `/bin/sh -c` wrapper when it does not parse.
    fn cmd_cmd(&mut self, args: &str) -> Result<(), BuildError> {
        let cmd = match serde_json::from_str::<Vec<String>>(args) {
            Ok(cmd) => cmd,
            Err(err) => {
                debug!("error unmarshalling {args}: {err}, setting cmd to /bin/sh -c");
                vec!["/bin/sh".to_string(), "-c".to_string(), args.to_string()]
            }
        };
        self.config_mut().cmd = cmd;
        Ok(())
    }

    fn cmd_entrypoint(&mut self, args: &str) -> Result<(), BuildError> {
        if args.is_empty() {
            return Err(BuildError::EmptyEntrypoint);
        }
        let entrypoint = match serde_json::from_str::<Vec<String>>(args) {
            Ok(entrypoint) => entrypoint,
            Err(_) => vec!["/bin/sh".to_string(), "-c".to_string(), args.to_string()],
        };
        self.config_mut().entrypoint = entrypoint;
        Ok(())
    }

    /// Prepend the listed ports to the port specs.
    fn cmd_expose(&mut self, args: &str) -> Result<(), BuildError> {
        let config = self.config_mut();
        let mut specs: Vec<String> = args.split_whitespace().map(|s| s.to_string()).collect();
        specs.append(&mut config.port_specs);
        config.port_specs = specs;
        Ok(())
    }

    /// `SERVICE <name> <port> [<version>]`, prepended to both the service
    /// specs and the port specs.
    fn cmd_service(&mut self, args: &str) -> Result<(), BuildError> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let (Some(name), Some(port_str)) = (parts.first(), parts.get(1)) else {
            return Err(BuildError::InvalidFormat("SERVICE"));
        };
        let port: u16 = port_str
            .parse()
            .map_err(|_| BuildError::InvalidFormat("SERVICE"))?;
        let version = parts.get(2).unwrap_or(&"unknown").to_string();

        let config = self.config_mut();
        config.service_specs.insert(
            0,
            ServiceSpec {
                name: name.to_string(),
                port,
                version,
            },
        );
        config.port_specs.insert(0, port_str.to_string());
        Ok(())
    }

    /// A JSON array of paths or a single path, unioned into the volume
    /// set.
    fn cmd_volume(&mut self, args: &str) -> Result<(), BuildError> {
        if args.is_empty() {
            return Err(BuildError::EmptyVolume);
        }
        let volumes = match serde_json::from_str::<Vec<String>>(args) {
            Ok(volumes) => volumes,
            Err(_) => vec![args.to_string()],
        };
        let config = self.config_mut();
        for volume in volumes {
            config.volumes.insert(volume);
        }
        Ok(())
    }

    /// Copy `<src> <dst>` into the accumulator's filesystem: URLs are
    /// downloaded into the rw branch, context files are untarred over the
    /// destination when they parse as archives and copied otherwise,
    /// context directories are copied with tar.
    pub(crate) async fn cmd_add(&mut self, args: &str) -> Result<(), BuildError> {
        let Some((orig, dest)) = args.split_once(' ') else {
            return Err(BuildError::InvalidFormat("ADD"));
        };
        let env = self.config_ref().env.clone();
        let orig = parse::expand_env(orig.trim(), &env);
        let dest = parse::expand_env(dest.trim(), &env);

        let context = self.context.clone();
        let BuildFile {
            container, tags, ..
        } = self;
        let Some(container) = container.as_mut() else {
            return Err(BuildError::NoBaseImage);
        };

        let saved_cmd = container.config.cmd.clone();
        container.config.cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("#(nop) ADD {orig} in {dest}"),
        ];

        container.ensure_mounted(tags)?;
        let result = if is_url(&orig) {
            add_remote(container, &orig, &dest).await
        } else {
            add_context(&context, container, &orig, &dest)
        };
        if let Err(err) = container.unmount() {
            warn!("unable to unmount after ADD: {err}");
        }
        container.config.cmd = saved_cmd;
        result
    }
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// A destination ending in `/` takes its filename from the URL path; a
/// URL with no filename component cannot be placed there.
fn remote_dest(orig: &str, dest: &str) -> Result<String, BuildError> {
    if !dest.ends_with('/') {
        return Ok(dest.to_string());
    }
    let url = reqwest::Url::parse(orig).map_err(|_| BuildError::NoFilename(orig.to_string()))?;
    let filename = url.path().rsplit('/').next().unwrap_or_default();
    if filename.is_empty() {
        return Err(BuildError::NoFilename(orig.to_string()));
    }
    Ok(format!("{dest}{filename}"))
}

/// Download `orig` into the rw branch at `dest`.
async fn add_remote(container: &Container, orig: &str, dest: &str) -> Result<(), BuildError> {
    let response = reqwest::get(orig).await?;
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(BuildError::Downstream(status));
    }

    let dest = remote_dest(orig, dest)?;
    let bytes = response.bytes().await?;
    container.inject(bytes.as_ref(), &dest)?;
    Ok(())
}

/// Resolve `orig` under the context directory and place it at `dest`
/// inside the mounted rootfs.
fn add_context(
    context: &Path,
    container: &Container,
    orig: &str,
    dest: &str,
) -> Result<(), BuildError> {
    let orig_path = context.join(orig.trim_start_matches('/'));
    let dest_path = container
        .rootfs_path()
        .join(dest.trim_start_matches('/'));

    let meta = std::fs::metadata(&orig_path)?;
    if meta.is_dir() {
        copy_with_tar(&orig_path, &dest_path)?;
    } else if let Err(err) = untar_path(&orig_path, &dest_path) {
        debug!("couldn't untar {orig_path:?} to {dest_path:?}: {err}");
        // not an archive, copy as a plain file
        let (dir, file_dest) = if dest.ends_with('/') {
            let name = orig_path
                .file_name()
                .ok_or_else(|| BuildError::NoFilename(orig.to_string()))?;
            (dest_path.clone(), dest_path.join(name))
        } else {
            let parent = dest_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| container.rootfs_path());
            (parent, dest_path.clone())
        };
        std::fs::create_dir_all(&dir)?;
        std::fs::copy(&orig_path, &file_dest)?;
    }
    Ok(())
}

/// Extract the archive at `src` into the directory `dest`; tar detects
/// the compression itself.
fn untar_path(src: &Path, dest: &Path) -> Result<(), BuildError> {
    std::fs::create_dir_all(dest)?;
    let src_str = src.to_string_lossy();
    let dest_str = dest.to_string_lossy();
    run("tar", &["-xf", src_str.as_ref(), "-C", dest_str.as_ref()])?;
    Ok(())
}

/// Copy a directory tree by streaming one tar into another, preserving
/// ownership and permissions.
fn copy_with_tar(src: &Path, dest: &Path) -> Result<(), BuildError> {
    std::fs::create_dir_all(dest)?;
    let mut pack = std::process::Command::new("tar")
        .arg("-cf")
        .arg("-")
        .arg("-C")
        .arg(src)
        .arg(".")
        .stdout(Stdio::piped())
        .spawn()?;
    let Some(pack_out) = pack.stdout.take() else {
        return Err(BuildError::InvalidFormat("ADD"));
    };
    let unpack_status = std::process::Command::new("tar")
        .arg("-xf")
        .arg("-")
        .arg("-C")
        .arg(dest)
        .stdin(Stdio::from(pack_out))
        .status()?;
    let pack_status = pack.wait()?;
    if !unpack_status.success() || !pack_status.success() {
        return Err(crate::util::ExternalToolError {
            tool: "tar".to_string(),
            output: "copy-with-tar failed".to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Runtime;
    use crate::tagstore::TagStore;
    use tokio::sync::mpsc;

    fn builder() -> (tempfile::TempDir, BuildFile) {
        let tmp = tempfile::tempdir().unwrap();
        let rt = Runtime::with_root(tmp.path().join("lib"), tmp.path().join("run"));
        rt.ensure_layout().unwrap();
        let tags = TagStore::load(&rt).unwrap();
        let (_tx, rx) = mpsc::channel(1);
        (tmp, BuildFile::new(rt, tags, None, false, rx))
    }

    #[tokio::test]
    async fn test_env_keeps_spaces_in_value() {
        let (_tmp, mut builder) = builder();
        builder.apply(Directive::Env, "FOO bar baz").await.unwrap();
        assert_eq!(builder.config.env, vec!["FOO=bar baz"]);
    }

    #[tokio::test]
    async fn test_env_upserts_and_expands() {
        let (_tmp, mut builder) = builder();
        builder.apply(Directive::Env, "BASE /opt").await.unwrap();
        builder.apply(Directive::Env, "DIR $BASE/app").await.unwrap();
        builder.apply(Directive::Env, "BASE /usr").await.unwrap();
        assert_eq!(builder.config.env, vec!["BASE=/usr", "DIR=/opt/app"]);
    }

    #[tokio::test]
    async fn test_cmd_json_and_fallback() {
        let (_tmp, mut builder) = builder();
        builder
            .apply(Directive::Cmd, r#"["/bin/echo", "hi"]"#)
            .await
            .unwrap();
        assert_eq!(builder.config.cmd, vec!["/bin/echo", "hi"]);
        builder.apply(Directive::Cmd, "echo hi").await.unwrap();
        assert_eq!(builder.config.cmd, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[tokio::test]
    async fn test_entrypoint_rejects_empty() {
        let (_tmp, mut builder) = builder();
        let err = builder.apply(Directive::Entrypoint, "").await.unwrap_err();
        assert!(matches!(err, BuildError::EmptyEntrypoint));
    }

    #[tokio::test]
    async fn test_expose_prepends() {
        let (_tmp, mut builder) = builder();
        builder.config.port_specs = vec!["80".to_string()];
        builder.apply(Directive::Expose, "443 8080").await.unwrap();
        assert_eq!(builder.config.port_specs, vec!["443", "8080", "80"]);
    }

    #[tokio::test]
    async fn test_service_prepends_with_default_version() {
        let (_tmp, mut builder) = builder();
        builder.apply(Directive::Service, "web 8080").await.unwrap();
        builder
            .apply(Directive::Service, "db 5432 9.1")
            .await
            .unwrap();
        assert_eq!(builder.config.port_specs, vec!["5432", "8080"]);
        assert_eq!(builder.config.service_specs[0].name, "db");
        assert_eq!(builder.config.service_specs[0].version, "9.1");
        assert_eq!(builder.config.service_specs[1].name, "web");
        assert_eq!(builder.config.service_specs[1].version, "unknown");
    }

    #[tokio::test]
    async fn test_volume_union() {
        let (_tmp, mut builder) = builder();
        builder
            .apply(Directive::Volume, r#"["/data", "/logs"]"#)
            .await
            .unwrap();
        builder.apply(Directive::Volume, "/data").await.unwrap();
        assert_eq!(builder.config.volumes.len(), 2);
        let err = builder.apply(Directive::Volume, "").await.unwrap_err();
        assert!(matches!(err, BuildError::EmptyVolume));
    }

    #[tokio::test]
    async fn test_deprecated_instructions() {
        let (_tmp, mut builder) = builder();
        assert!(matches!(
            builder.apply(Directive::Insert, "x").await.unwrap_err(),
            BuildError::Deprecated("INSERT")
        ));
        assert!(matches!(
            builder.apply(Directive::Copy, "x").await.unwrap_err(),
            BuildError::Deprecated("COPY")
        ));
    }

    #[tokio::test]
    async fn test_run_requires_base_image() {
        let (_tmp, mut builder) = builder();
        let err = builder.apply(Directive::Run, "true").await.unwrap_err();
        assert!(matches!(err, BuildError::NoBaseImage));
    }

    #[test]
    fn test_directive_table() {
        assert_eq!(Directive::from_name("FROM"), Some(Directive::From));
        assert_eq!(Directive::from_name("SERVICE"), Some(Directive::Service));
        assert_eq!(Directive::from_name("WORKDIR"), None);
    }

    #[test]
    fn test_remote_dest_filename_derivation() {
        assert_eq!(
            remote_dest("http://h/pkg/file.tgz", "/opt/").unwrap(),
            "/opt/file.tgz"
        );
        assert_eq!(remote_dest("http://h/pkg/file.tgz", "/opt/f").unwrap(), "/opt/f");
        assert!(matches!(
            remote_dest("http://h/pkg/", "/opt/").unwrap_err(),
            BuildError::NoFilename(_)
        ));
        assert!(matches!(
            remote_dest("http://h/", "/opt/").unwrap_err(),
            BuildError::NoFilename(_)
        ));
    }
}
