//! Minimal OpenSSH client-config lookup.
//!
//! Supports the subset the transfer stack needs: `Host` blocks with
//! `HostName`, `Port`, `User` and `IdentityFile`, matched with `*` and `?`
//! patterns. The first obtained value wins, matching OpenSSH semantics.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub host_name: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

/// Look up the effective settings for `host` in an ssh client-config file.
pub fn lookup(config_file: &Path, host: &str) -> io::Result<HostConfig> {
    let content = fs::read_to_string(config_file)?;
    Ok(parse(&content, host))
}

fn parse(content: &str, host: &str) -> HostConfig {
    let mut cfg = HostConfig::default();
    let mut active = false;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = match split_keyword(line) {
            Some(kv) => kv,
            None => continue,
        };

        if key.eq_ignore_ascii_case("host") {
            active = value.split_whitespace().any(|p| pattern_matches(p, host));
            continue;
        }
        if !active {
            continue;
        }

        match key.to_ascii_lowercase().as_str() {
            "hostname" if cfg.host_name.is_none() => cfg.host_name = Some(value.to_owned()),
            "port" if cfg.port.is_none() => cfg.port = value.parse().ok(),
            "user" if cfg.user.is_none() => cfg.user = Some(value.to_owned()),
            "identityfile" if cfg.identity_file.is_none() => {
                cfg.identity_file = Some(expand_tilde(value));
            }
            _ => {}
        }
    }

    cfg
}

fn split_keyword(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(|c: char| c == '=' || c.is_whitespace())?;
    let (key, rest) = line.split_at(idx);
    let value = rest
        .trim_start_matches(|c: char| c == '=' || c.is_whitespace())
        .trim();
    if value.is_empty() {
        None
    } else {
        Some((key, value))
    }
}

/// `*` matches any run of characters, `?` exactly one.
fn pattern_matches(pattern: &str, host: &str) -> bool {
    fn matches(p: &[u8], h: &[u8]) -> bool {
        match (p.first(), h.first()) {
            (None, None) => true,
            (Some(b'*'), _) => matches(&p[1..], h) || (!h.is_empty() && matches(p, &h[1..])),
            (Some(b'?'), Some(_)) => matches(&p[1..], &h[1..]),
            (Some(a), Some(b)) if a == b => matches(&p[1..], &h[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), host.as_bytes())
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = directories::UserDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}
