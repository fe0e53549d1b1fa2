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
use rand::RngCore;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExpandError {
    #[error("no entry found matching prefix {0}")]
    NotFound(String),
    #[error("prefix {0} is ambiguous")]
    Ambiguous(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An external command exited non-zero; `output` carries the tool's
/// combined stdout + stderr.
#[derive(Error, Debug)]
#[error("{tool} failed: {output}")]
pub struct ExternalToolError {
    pub tool: String,
    pub output: String,
}

/// Generate a fresh 256-bit identity, rendered as 64 lowercase hex chars.
pub fn gen_id() -> String {
    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

/// Shorthand form of an identifier, convenient for display.
pub fn truncate_id(id: &str) -> &str {
    if id.len() < 12 {
        id
    } else {
        &id[..12]
    }
}

/// Expand a unique prefix against the entries of `dir`.
pub fn expand_id(dir: impl AsRef<Path>, prefix: &str) -> Result<String, ExpandError> {
    let mut found = None;
    for entry in std::fs::read_dir(dir.as_ref())? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) {
            if found.is_some() {
                return Err(ExpandError::Ambiguous(prefix.to_string()));
            }
            found = Some(name);
        }
    }
    found.ok_or_else(|| ExpandError::NotFound(prefix.to_string()))
}

/// Human-readable approximation of a size using SI units ("44 kB", "17 MB").
pub fn human_size(size: i64) -> String {
    const UNITS: [&str; 9] = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let mut sizef = size as f64;
    let mut i = 0;
    while sizef >= 1000.0 && i < UNITS.len() - 1 {
        sizef /= 1000.0;
        i += 1;
    }
    // four significant digits, trailing zeros trimmed
    let prec = if sizef >= 100.0 {
        1
    } else if sizef >= 10.0 {
        2
    } else {
        3
    };
    let mut s = format!("{sizef:.prec$}");
    if s.contains('.') {
        s = s.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{} {}", s, UNITS[i])
}

/// Run an external tool, failing with its combined output on a non-zero
/// exit.
pub fn run(tool: &str, args: &[&str]) -> Result<(), ExternalToolError> {
    run_output(tool, args).map(|_| ())
}

/// Run an external tool and collect its stdout. A spawn failure or non-zero
/// exit is reported with whatever the tool printed.
pub fn run_output(tool: &str, args: &[&str]) -> Result<String, ExternalToolError> {
    let rendered = if args.is_empty() {
        tool.to_string()
    } else {
        format!("{} {}", tool, args.join(" "))
    };
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|err| ExternalToolError {
            tool: rendered.clone(),
            output: err.to_string(),
        })?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(ExternalToolError {
            tool: rendered,
            output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_id_shape() {
        let id = gen_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, gen_id());
    }

    #[test]
    fn test_truncate_id() {
        assert_eq!(truncate_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(truncate_id("abc"), "abc");
    }

    #[test]
    fn test_expand_id() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("abc123")).unwrap();
        std::fs::create_dir(tmp.path().join("abc456")).unwrap();
        std::fs::create_dir(tmp.path().join("def789")).unwrap();

        assert!(matches!(
            expand_id(tmp.path(), "abc"),
            Err(ExpandError::Ambiguous(_))
        ));
        assert_eq!(expand_id(tmp.path(), "abc1").unwrap(), "abc123");
        assert_eq!(expand_id(tmp.path(), "d").unwrap(), "def789");
        assert!(matches!(
            expand_id(tmp.path(), "zzz"),
            Err(ExpandError::NotFound(_))
        ));
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(999), "999 B");
        assert_eq!(human_size(44000), "44 kB");
        assert_eq!(human_size(17_000_000), "17 MB");
        assert_eq!(human_size(1234), "1.234 kB");
    }

    #[test]
    fn test_run_reports_combined_output() {
        let err = run("/bin/sh", &["-c", "echo out; echo err >&2; exit 3"]).unwrap_err();
        assert!(err.output.contains("out"));
        assert!(err.output.contains("err"));
    }
}
