//! Immutable allow-lists for paths, connect/listen addresses, and environment.
//!
//! Constructed once from raw configuration input and never mutated afterward;
//! every Worker shares the same `Arc<Policy>` as its Master.

pub mod path_resolver;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use fleetvm_shared::{FleetError, FleetResult};

/// One entry in the path allow-list: a virtual (guest-visible) path mapped to
/// a real (host) path plus the operations it permits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub real_path: PathBuf,
    pub readable: bool,
    pub writable: bool,
    pub symlink: bool,
    /// Usable after a Worker forks from the Master (original's `usable_in_fork`).
    pub usable_in_fork: bool,
}

/// A raw path allow-list entry as it arrives from configuration, before
/// canonicalization and merging.
#[derive(Debug, Clone)]
pub struct RawPathEntry {
    pub real_path: String,
    pub virtual_path: Option<String>,
    pub readable: bool,
    pub writable: bool,
    pub symlink: bool,
    pub usable_in_fork: bool,
}

/// Sort key for `allowed_paths`: path components compared element-wise.
///
/// This is deliberately *not* a byte-string comparison. Comparing component
/// vectors lexicographically makes `/foo` sort before `/foo/bar` (a strict
/// prefix is "less") and, critically, makes `/foo/bar` sort before `/foo./bar`
/// because the first component `"foo"` is less than `"foo."` on its own,
/// without ever seeing the separator byte. A full-path byte compare gets this
/// backwards: `.` (0x2e) sorts before `/` (0x2f).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathKey(pub Vec<String>);

impl PathKey {
    pub fn from_path(p: &Path) -> Self {
        PathKey(
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect(),
        )
    }

    pub fn is_prefix_of(&self, other: &PathKey) -> bool {
        other.0.len() >= self.0.len() && self.0 == other.0[..self.0.len()]
    }

    pub fn common_prefix(&self, other: &PathKey) -> PathKey {
        let n = self
            .0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count();
        PathKey(self.0[..n].to_vec())
    }
}

/// A single `(address, port)` allow-list entry. The wildcard address
/// (`0.0.0.0` / `::`) matches any host; port 0 matches any port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressEntryV4 {
    pub addr: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressEntryV6 {
    pub addr: Ipv6Addr,
    pub port: u16,
}

/// Immutable, fully-resolved allow-list policy.
#[derive(Debug)]
pub struct Policy {
    /// Ascending by [`PathKey`]; the segment-wise ordering is load-bearing
    /// for the longest-prefix search in [`path_resolver`].
    allowed_paths: Vec<(PathKey, PathEntry)>,
    /// Exact virtual-path fast path, ported from the original's
    /// `rewrite_path_indices`: declared `virtual_path` entries whose real
    /// path differs get an O(1) lookup that short-circuits the prefix search.
    rewrite_path_indices: HashMap<String, usize>,
    allowed_connect_v4: Vec<AddressEntryV4>,
    allowed_connect_v6: Vec<AddressEntryV6>,
    allowed_listen_v4: Vec<AddressEntryV4>,
    allowed_listen_v6: Vec<AddressEntryV6>,
    env: Vec<(String, String)>,
}

impl Policy {
    pub fn allowed_paths(&self) -> &[(PathKey, PathEntry)] {
        &self.allowed_paths
    }

    pub fn rewrite_index(&self, virtual_path: &str) -> Option<usize> {
        self.rewrite_path_indices.get(virtual_path).copied()
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn allowed_connect_v4(&self) -> &[AddressEntryV4] {
        &self.allowed_connect_v4
    }
    pub fn allowed_connect_v6(&self) -> &[AddressEntryV6] {
        &self.allowed_connect_v6
    }
    pub fn allowed_listen_v4(&self) -> &[AddressEntryV4] {
        &self.allowed_listen_v4
    }
    pub fn allowed_listen_v6(&self) -> &[AddressEntryV6] {
        &self.allowed_listen_v6
    }

    /// Builds a policy from raw configuration input (§4.1).
    pub fn build(
        cwd: &Path,
        raw_paths: &[RawPathEntry],
        connect_tokens: &[String],
        listen_tokens: &[String],
        env_tokens: &[String],
    ) -> FleetResult<Policy> {
        let mut allowed_paths: Vec<(PathKey, PathEntry)> = Vec::new();
        let mut rewrite_path_indices = HashMap::new();

        for raw in raw_paths {
            let real = canonicalize_virtual_path(&raw.real_path, cwd);
            let virtual_str = raw.virtual_path.clone().unwrap_or_else(|| raw.real_path.clone());
            let key = PathKey::from_path(&canonicalize_virtual_path(&virtual_str, cwd));

            let entry = PathEntry {
                real_path: real,
                readable: raw.readable,
                writable: raw.writable,
                symlink: raw.symlink,
                usable_in_fork: raw.usable_in_fork,
            };

            match allowed_paths.iter_mut().find(|(k, _)| *k == key) {
                Some((_, existing)) => {
                    // Duplicates merge: the union of r/w/symlink bits wins.
                    existing.readable |= entry.readable;
                    existing.writable |= entry.writable;
                    existing.symlink |= entry.symlink;
                    existing.usable_in_fork |= entry.usable_in_fork;
                }
                None => {
                    if raw.virtual_path.is_some() {
                        rewrite_path_indices.insert(virtual_str.clone(), allowed_paths.len());
                    }
                    allowed_paths.push((key, entry));
                }
            }
        }
        allowed_paths.sort_by(|a, b| a.0.cmp(&b.0));
        // Indices recorded above assumed insertion order; recompute after sort.
        rewrite_path_indices.clear();
        for raw in raw_paths {
            if let Some(vpath) = &raw.virtual_path {
                let key = PathKey::from_path(&canonicalize_virtual_path(vpath, cwd));
                if let Ok(idx) = allowed_paths.binary_search_by(|(k, _)| k.cmp(&key)) {
                    rewrite_path_indices.insert(vpath.clone(), idx);
                }
            }
        }

        let (allowed_connect_v4, allowed_connect_v6) = parse_address_tokens(connect_tokens)?;
        let (allowed_listen_v4, allowed_listen_v6) = parse_address_tokens(listen_tokens)?;
        let env = resolve_env_tokens(env_tokens);

        Ok(Policy {
            allowed_paths,
            rewrite_path_indices,
            allowed_connect_v4,
            allowed_connect_v6,
            allowed_listen_v4,
            allowed_listen_v6,
            env,
        })
    }
}

/// Canonicalizes a guest-space path without touching the filesystem:
/// relative paths resolve against `cwd`, `.`/`..` collapse, trailing
/// slashes normalize away.
pub fn canonicalize_virtual_path(path: &str, cwd: &Path) -> PathBuf {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        cwd.join(path)
    };

    let mut out: Vec<std::ffi::OsString> = Vec::new();
    for component in joined.components() {
        use std::path::Component::*;
        match component {
            RootDir => out.clear(),
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            Normal(seg) => out.push(seg.to_os_string()),
            Prefix(_) => {}
        }
    }
    let mut result = PathBuf::from("/");
    for seg in out {
        result.push(seg);
    }
    result
}

/// Parses `[ip]:port`, `ip:port`, `ip`, `[ipv6]`, `"true"`, `"false"`, or a
/// hostname (resolved once to the cross-product of A/AAAA records) into the
/// v4/v6 address allow-lists (§4.1). `"true"` with an implied port of 0
/// clears all prior entries and stops processing further tokens.
fn parse_address_tokens(
    tokens: &[String],
) -> FleetResult<(Vec<AddressEntryV4>, Vec<AddressEntryV6>)> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();

    for tok in tokens {
        let tok = tok.trim();
        if tok.eq_ignore_ascii_case("false") {
            continue;
        }
        if tok.eq_ignore_ascii_case("true") {
            v4.clear();
            v6.clear();
            v4.push(AddressEntryV4 { addr: Ipv4Addr::UNSPECIFIED, port: 0 });
            v6.push(AddressEntryV6 { addr: Ipv6Addr::UNSPECIFIED, port: 0 });
            break;
        }

        let (host_part, port) = split_host_port(tok)
            .ok_or_else(|| FleetError::Config(format!("invalid address literal: {tok}")))?;

        if let Ok(addr) = host_part.parse::<Ipv4Addr>() {
            v4.push(AddressEntryV4 { addr, port });
            continue;
        }
        if let Ok(addr) = host_part.parse::<Ipv6Addr>() {
            v6.push(AddressEntryV6 { addr, port });
            continue;
        }

        // Hostname: resolve once to the cross-product of A/AAAA records.
        let lookup = format!("{host_part}:0");
        let resolved = lookup
            .to_socket_addrs()
            .map_err(|e| FleetError::Config(format!("unresolvable hostname '{host_part}': {e}")))?;
        let mut any = false;
        for addr in resolved {
            any = true;
            match addr.ip() {
                IpAddr::V4(a) => v4.push(AddressEntryV4 { addr: a, port }),
                IpAddr::V6(a) => v6.push(AddressEntryV6 { addr: a, port }),
            }
        }
        if !any {
            return Err(FleetError::Config(format!(
                "unresolvable hostname: {host_part}"
            )));
        }
    }

    Ok((v4, v6))
}

/// Splits `[ip]:port`, `ip:port`, `[ipv6]`, or a bare `ip`/hostname (port 0)
/// into `(host, port)`.
fn split_host_port(tok: &str) -> Option<(String, u16)> {
    if let Some(rest) = tok.strip_prefix('[') {
        let (addr, rest) = rest.split_once(']')?;
        let port = if let Some(p) = rest.strip_prefix(':') {
            p.parse().ok()?
        } else {
            0
        };
        return Some((addr.to_string(), port));
    }

    // Bare IPv6 literal with no brackets (contains multiple colons).
    if tok.matches(':').count() > 1 {
        return Some((tok.to_string(), 0));
    }

    match tok.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((tok.to_string(), 0)),
    }
}

/// Expands environment allow-list tokens: an entry ending in `*` selects all
/// host env vars whose names begin with the prefix; otherwise the entry
/// names a single variable captured at its current value.
fn resolve_env_tokens(tokens: &[String]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for tok in tokens {
        if let Some(k) = tok.strip_suffix('=') {
            // Explicit K=V already split by caller; defensive no-op here.
            let _ = k;
            continue;
        }
        if let Some((k, v)) = tok.split_once('=') {
            out.push((k.to_string(), v.to_string()));
            continue;
        }
        if let Some(prefix) = tok.strip_suffix('*') {
            for (k, v) in std::env::vars() {
                if k.starts_with(prefix) {
                    out.push((k, v));
                }
            }
        } else if let Ok(v) = std::env::var(tok) {
            out.push((tok.clone(), v));
        }
    }
    out
}

/// Validates a candidate `(address, port)` against a family's allow-list
/// (§4.3 network validator): the entry's address matches if it is the
/// wildcard or equal to the candidate; the entry's port matches if it is 0
/// or equal. Both must match.
pub fn validate_v4(entries: &[AddressEntryV4], addr: Ipv4Addr, port: u16) -> bool {
    entries.iter().any(|e| {
        (e.addr.is_unspecified() || e.addr == addr) && (e.port == 0 || e.port == port)
    })
}

pub fn validate_v6(entries: &[AddressEntryV6], addr: Ipv6Addr, port: u16) -> bool {
    entries.iter().any(|e| {
        (e.addr.is_unspecified() || e.addr == addr) && (e.port == 0 || e.port == port)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(real: &str, readable: bool, writable: bool) -> RawPathEntry {
        RawPathEntry {
            real_path: real.to_string(),
            virtual_path: None,
            readable,
            writable,
            symlink: false,
            usable_in_fork: true,
        }
    }

    #[test]
    fn path_key_orders_separator_before_any_segment_char() {
        // The motivating example from the design notes: `/foo/bar` must sort
        // before `/foo./bar`, which a byte-order comparison gets backwards.
        let a = PathKey::from_path(Path::new("/foo/bar"));
        let b = PathKey::from_path(Path::new("/foo./bar"));
        assert!(a < b);
    }

    #[test]
    fn path_key_prefix_is_strictly_by_component() {
        let foo = PathKey::from_path(Path::new("/foo"));
        let foobar = PathKey::from_path(Path::new("/foobar"));
        let foo_bar = PathKey::from_path(Path::new("/foo/bar"));
        assert!(foo.is_prefix_of(&foo_bar));
        assert!(!foo.is_prefix_of(&foobar));
    }

    #[test]
    fn canonicalize_collapses_dot_dot_and_trailing_slash() {
        let cwd = Path::new("/work");
        assert_eq!(
            canonicalize_virtual_path("a/../b/", cwd),
            PathBuf::from("/work/b")
        );
        assert_eq!(
            canonicalize_virtual_path("/a/./b/../c", cwd),
            PathBuf::from("/a/c")
        );
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let cwd = Path::new("/work");
        let once = canonicalize_virtual_path("/a/../b/c/", cwd);
        let twice = canonicalize_virtual_path(once.to_str().unwrap(), cwd);
        assert_eq!(once, twice);
    }

    #[test]
    fn duplicate_path_entries_merge_permission_bits() {
        let cwd = Path::new("/");
        let raws = vec![entry("/data", true, false), entry("/data", false, true)];
        let policy = Policy::build(cwd, &raws, &[], &[], &[]).unwrap();
        let (_, e) = &policy.allowed_paths()[0];
        assert!(e.readable && e.writable);
    }

    #[test]
    fn wildcard_address_and_zero_port_match_anything() {
        let entries = vec![AddressEntryV4 { addr: Ipv4Addr::UNSPECIFIED, port: 0 }];
        assert!(validate_v4(&entries, Ipv4Addr::new(10, 0, 0, 1), 12345));
    }

    #[test]
    fn non_wildcard_entry_requires_exact_match() {
        let entries = vec![AddressEntryV4 { addr: Ipv4Addr::new(127, 0, 0, 1), port: 8080 }];
        assert!(validate_v4(&entries, Ipv4Addr::new(127, 0, 0, 1), 8080));
        assert!(!validate_v4(&entries, Ipv4Addr::new(127, 0, 0, 1), 80));
        assert!(!validate_v4(&entries, Ipv4Addr::new(127, 0, 0, 2), 8080));
    }

    #[test]
    fn allow_all_token_clears_and_short_circuits() {
        let tokens = vec!["127.0.0.1:80".to_string(), "true".to_string()];
        let (v4, v6) = parse_address_tokens(&tokens).unwrap();
        assert_eq!(v4.len(), 1);
        assert!(v4[0].addr.is_unspecified() && v4[0].port == 0);
        assert_eq!(v6.len(), 1);
    }

    #[test]
    fn hostname_literal_without_dns_falls_back_cleanly() {
        let tokens = vec!["0.0.0.0:0".to_string()];
        let (v4, _v6) = parse_address_tokens(&tokens).unwrap();
        assert_eq!(v4, vec![AddressEntryV4 { addr: Ipv4Addr::UNSPECIFIED, port: 0 }]);
    }
}
