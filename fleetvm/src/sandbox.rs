//! The intercepted syscalls the Sandbox mediates on behalf of a guest
//! (§4.3): path opens, symlink resolution, and socket address validation.
//! These are independent of the polling/accept/close hook set in
//! [`crate::vm::hooks`], which governs quiescence detection and client-fd
//! tracking instead.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::policy::{path_resolver, validate_v4, validate_v6, Policy};
use crate::vm::Endpoint;

/// Host of the intercepted syscalls. Immutable and cheaply cloned (wraps an
/// `Arc<Policy>`); a Master and every Worker forked from it share one
/// `Sandbox` instance, matching "Workers inherit the Master's connect/bind
/// policies" (§4.5).
#[derive(Clone)]
pub struct Sandbox {
    policy: Arc<Policy>,
    cwd: PathBuf,
}

/// Result of a path-mediated syscall: either the rewritten host path to use,
/// or denial (the guest observes `EACCES`/`EPERM`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    Allow(PathBuf),
    Deny,
}

impl Sandbox {
    pub fn new(policy: Arc<Policy>, cwd: impl Into<PathBuf>) -> Self {
        Self { policy, cwd: cwd.into() }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn policy_arc(&self) -> Arc<Policy> {
        Arc::clone(&self.policy)
    }

    /// `open_for_read(path)` (§4.3).
    pub fn open_for_read(&self, guest_path: &str) -> PathDecision {
        let res = path_resolver::resolve(&self.policy, guest_path, &self.cwd, |e| e.readable);
        if res.allowed { PathDecision::Allow(res.host_path) } else { PathDecision::Deny }
    }

    /// `open_for_write(path)` (§4.3).
    pub fn open_for_write(&self, guest_path: &str) -> PathDecision {
        let res = path_resolver::resolve(&self.policy, guest_path, &self.cwd, |e| e.writable);
        if res.allowed { PathDecision::Allow(res.host_path) } else { PathDecision::Deny }
    }

    /// `resolve_symlink(path)`: matches unconditionally but reports whether
    /// the resolved entry is a declared symlink (§4.3).
    pub fn resolve_symlink(&self, guest_path: &str) -> (bool, PathBuf) {
        let res = path_resolver::resolve(&self.policy, guest_path, &self.cwd, |_| true);
        (res.allowed && res.symlink, res.host_path)
    }

    /// `connect(fd, addr)` (§4.3): AF_UNIX paths are mediated as both
    /// readable and writable filesystem paths; everything else goes through
    /// the network validator against the connect allow-lists.
    pub fn connect(&self, addr: &Endpoint) -> bool {
        match addr {
            Endpoint::Unix { path } => self.validate_unix_path(path),
            Endpoint::V4 { addr, port } => {
                validate_v4(self.policy.allowed_connect_v4(), *addr, *port)
            }
            Endpoint::V6 { addr, port } => {
                validate_v6(self.policy.allowed_connect_v6(), *addr, *port)
            }
        }
    }

    /// `bind(fd, addr)` (§4.3): same mediation as `connect` but against the
    /// listen allow-lists.
    pub fn bind(&self, addr: &Endpoint) -> bool {
        match addr {
            Endpoint::Unix { path } => self.validate_unix_path(path),
            Endpoint::V4 { addr, port } => {
                validate_v4(self.policy.allowed_listen_v4(), *addr, *port)
            }
            Endpoint::V6 { addr, port } => {
                validate_v6(self.policy.allowed_listen_v6(), *addr, *port)
            }
        }
    }

    /// `listening_socket(vfd, fd)` (§4.3): validates the socket's local
    /// address the same way as `bind`. The caller (Master) records the
    /// vfd/fd pair as the tracked listener once this returns `true`.
    pub fn listening_socket(&self, addr: &Endpoint) -> bool {
        self.bind(addr)
    }

    fn validate_unix_path(&self, path: &Path) -> bool {
        let guest_path = path.to_string_lossy();
        let readable = path_resolver::resolve(&self.policy, &guest_path, &self.cwd, |e| e.readable);
        let writable = path_resolver::resolve(&self.policy, &guest_path, &self.cwd, |e| e.writable);
        readable.allowed && writable.allowed
    }
}

/// `AF_UNSPEC` is treated as IPv6 for validation, to support IPv4-mapped
/// IPv6 callers (§4.3). Network front-ends should route an `AF_UNSPEC`
/// candidate through [`Endpoint::V6`] with the IPv4-mapped representation.
pub fn ipv4_mapped_to_v6(addr: Ipv4Addr) -> Ipv6Addr {
    addr.to_ipv6_mapped()
}
