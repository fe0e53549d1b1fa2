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
use super::BuildError;

/// Normalize one recipe line: tabs become spaces, surrounding whitespace
/// is trimmed, empty lines and comments are dropped. What remains splits
/// at the first space into an uppercased instruction and its arguments.
pub(crate) fn parse_line(raw: &str) -> Result<Option<(String, String)>, BuildError> {
    let line = raw.replace('\t', " ");
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let Some((instruction, arguments)) = line.split_once(' ') else {
        return Err(BuildError::InvalidLine(line.to_string()));
    };
    Ok(Some((
        instruction.trim().to_uppercase(),
        arguments.trim().to_string(),
    )))
}

/// Expand `$VAR` and `${VAR}` references against the ordered KEY=VALUE
/// environment. A backslash escapes the dollar; unknown variables are left
/// untouched; an unclosed `${VAR` is tolerated the way the original
/// builder's pattern was.
pub(crate) fn expand_env(value: &str, env: &[String]) -> String {
    let lookup = |key: &str| {
        env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
    };

    let chars: Vec<char> = value.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && chars.get(i + 1) == Some(&'$') {
            out.push('\\');
            out.push('$');
            i += 2;
            continue;
        }
        if c == '$' {
            let braced = chars.get(i + 1) == Some(&'{');
            let start = if braced { i + 2 } else { i + 1 };
            let mut end = start;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            if end > start {
                let key: String = chars[start..end].iter().collect();
                if let Some(replacement) = lookup(&key) {
                    out.push_str(&replacement);
                    let has_close = braced && chars.get(end) == Some(&'}');
                    i = end + usize::from(has_close);
                    continue;
                }
            }
            out.push('$');
            i += 1;
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_normalizes() {
        assert_eq!(
            parse_line("  RUN\tapt-get update  ").unwrap(),
            Some(("RUN".to_string(), "apt-get update".to_string()))
        );
        assert_eq!(
            parse_line("from ubuntu:12.04").unwrap(),
            Some(("FROM".to_string(), "ubuntu:12.04".to_string()))
        );
    }

    #[test]
    fn test_parse_line_skips_comments_and_blanks() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("   \t ").unwrap(), None);
        assert_eq!(parse_line("# a comment").unwrap(), None);
    }

    #[test]
    fn test_parse_line_requires_arguments() {
        assert!(matches!(
            parse_line("RUN"),
            Err(BuildError::InvalidLine(_))
        ));
    }

    #[test]
    fn test_expand_env_basic() {
        let env = vec!["FOO=bar".to_string(), "HOME=/".to_string()];
        assert_eq!(expand_env("$FOO/baz", &env), "bar/baz");
        assert_eq!(expand_env("${FOO}baz", &env), "barbaz");
        assert_eq!(expand_env("a$FOO", &env), "abar");
        assert_eq!(expand_env("no vars here", &env), "no vars here");
    }

    #[test]
    fn test_expand_env_unknown_and_escaped() {
        let env = vec!["FOO=bar".to_string()];
        assert_eq!(expand_env("$UNKNOWN", &env), "$UNKNOWN");
        assert_eq!(expand_env("\\$FOO", &env), "\\$FOO");
        assert_eq!(expand_env("$", &env), "$");
    }

    #[test]
    fn test_expand_env_unclosed_brace() {
        let env = vec!["FOO=bar".to_string()];
        assert_eq!(expand_env("${FOO", &env), "bar");
    }
}
