//! Longest-prefix lookup of a guest path against the [`super::Policy`].

use std::path::{Path, PathBuf};

use super::{canonicalize_virtual_path, PathEntry, PathKey, Policy};

/// Outcome of resolving a guest path against the policy (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub allowed: bool,
    pub host_path: PathBuf,
    pub symlink: bool,
}

fn denied() -> Resolution {
    Resolution { allowed: false, host_path: PathBuf::new(), symlink: false }
}

/// Finds the greatest key `<= target` in the ascending `allowed_paths` table
/// (`upper_bound(target)` then step back).
fn greatest_key_leq<'a>(
    table: &'a [(PathKey, PathEntry)],
    target: &PathKey,
) -> Option<(usize, &'a PathKey, &'a PathEntry)> {
    let idx = table.partition_point(|(k, _)| k <= target);
    if idx == 0 {
        None
    } else {
        let (k, e) = &table[idx - 1];
        Some((idx - 1, k, e))
    }
}

/// Resolves `guest_path` against `policy`, applying `extractor` to decide
/// whether a candidate entry's permission bits satisfy the requested
/// operation (readable / writable / "always true" for symlink inspection).
///
/// Implements §4.2 exactly: canonicalize, find the greatest key not
/// exceeding the target, check it is a component-wise prefix, apply the
/// extractor, and on rejection restart the search from the common prefix of
/// the candidate key and the target — this lets a narrower, differently
/// permissioned entry nested under a broader one win when the broader entry
/// doesn't satisfy the requested operation.
pub fn resolve(
    policy: &Policy,
    guest_path: &str,
    cwd: &Path,
    extractor: impl Fn(&PathEntry) -> bool,
) -> Resolution {
    let p = canonicalize_virtual_path(guest_path, cwd);
    let p_key = PathKey::from_path(&p);

    // Rewrite-index fast path: an explicit virtual_path entry distinct from
    // its real_path gets an O(1) exact-match lookup before falling back to
    // the longest-prefix search. This is purely an optimization; semantics
    // are identical to the general algorithm for such entries.
    if let Some(path_str) = p.to_str() {
        if let Some(idx) = policy.rewrite_index(path_str) {
            let (_, entry) = &policy.allowed_paths()[idx];
            if extractor(entry) {
                return Resolution {
                    allowed: true,
                    host_path: entry.real_path.clone(),
                    symlink: entry.symlink,
                };
            }
        }
    }

    let table = policy.allowed_paths();
    let bound = table.len() + 1;
    let mut target = p_key.clone();

    for _ in 0..bound {
        let Some((_, k, entry)) = greatest_key_leq(table, &target) else {
            return denied();
        };

        // A candidate must both be a genuine component-wise prefix of the
        // full path *and* satisfy the extractor. Either failure backs off to
        // the common prefix of the candidate and the current search target
        // and retries — this is what lets a broader entry with the wrong
        // permission bits (e.g. `/a/b` readable-only) still get found after
        // a narrower sibling (e.g. `/a/b/c` writable-only) is rejected.
        if k.is_prefix_of(&p_key) && extractor(entry) {
            let host_path = rewrite_host_path(entry, k, &p_key);
            return Resolution { allowed: true, host_path, symlink: entry.symlink };
        }

        let common = k.common_prefix(&target);
        if common == target {
            // No progress possible: restarting from the same target would
            // find the same candidate again.
            return denied();
        }
        target = common;
    }

    denied()
}

fn rewrite_host_path(entry: &PathEntry, key: &PathKey, full: &PathKey) -> PathBuf {
    let mut host = entry.real_path.clone();
    for segment in &full.0[key.0.len()..] {
        host.push(segment);
    }
    host
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RawPathEntry;

    fn raw(real: &str, virtual_path: Option<&str>, readable: bool, writable: bool) -> RawPathEntry {
        RawPathEntry {
            real_path: real.to_string(),
            virtual_path: virtual_path.map(|s| s.to_string()),
            readable,
            writable,
            symlink: false,
            usable_in_fork: true,
        }
    }

    fn cwd() -> PathBuf {
        PathBuf::from("/")
    }

    #[test]
    fn longest_prefix_wins_with_distinct_flags_per_scenario_c() {
        // Scenario C: { /a/b: readable, /a/b/c: writable }.
        let raws = vec![raw("/a/b", None, true, false), raw("/a/b/c", None, false, true)];
        let policy = Policy::build(&cwd(), &raws, &[], &[], &[]).unwrap();

        let write_d = resolve(&policy, "/a/b/c/d", &cwd(), |e| e.writable);
        assert!(write_d.allowed);
        assert_eq!(write_d.host_path, PathBuf::from("/a/b/c/d"));

        let write_x = resolve(&policy, "/a/b/x", &cwd(), |e| e.writable);
        assert!(!write_x.allowed);

        let read_x = resolve(&policy, "/a/b/x", &cwd(), |e| e.readable);
        assert!(read_x.allowed);
    }

    #[test]
    fn write_denied_read_allowed_scenario_b() {
        let raws = vec![raw("/etc", None, true, false)];
        let policy = Policy::build(&cwd(), &raws, &[], &[], &[]).unwrap();

        let write = resolve(&policy, "/etc/passwd", &cwd(), |e| e.writable);
        assert!(!write.allowed);
        let read = resolve(&policy, "/etc/passwd", &cwd(), |e| e.readable);
        assert!(read.allowed);
    }

    #[test]
    fn prefix_is_by_component_not_byte() {
        let raws = vec![raw("/foo", None, true, true)];
        let policy = Policy::build(&cwd(), &raws, &[], &[], &[]).unwrap();

        assert!(resolve(&policy, "/foo/bar", &cwd(), |e| e.readable).allowed);
        assert!(!resolve(&policy, "/foobar", &cwd(), |e| e.readable).allowed);
    }

    #[test]
    fn unrelated_path_is_denied() {
        let raws = vec![raw("/opt/app", None, true, true)];
        let policy = Policy::build(&cwd(), &raws, &[], &[], &[]).unwrap();
        assert!(!resolve(&policy, "/etc/shadow", &cwd(), |e| e.readable).allowed);
    }

    #[test]
    fn rewrite_index_fast_path_matches_general_algorithm() {
        let raws = vec![raw("/var/run/real-resolv.conf", Some("/etc/resolv.conf"), true, false)];
        let policy = Policy::build(&cwd(), &raws, &[], &[], &[]).unwrap();
        let res = resolve(&policy, "/etc/resolv.conf", &cwd(), |e| e.readable);
        assert!(res.allowed);
        assert_eq!(res.host_path, PathBuf::from("/var/run/real-resolv.conf"));
    }

    #[test]
    fn removing_and_readding_identical_entry_yields_same_resolution() {
        let raws = vec![raw("/a", None, true, true)];
        let p1 = Policy::build(&cwd(), &raws, &[], &[], &[]).unwrap();
        let p2 = Policy::build(&cwd(), &raws, &[], &[], &[]).unwrap();
        let r1 = resolve(&p1, "/a/b", &cwd(), |e| e.readable);
        let r2 = resolve(&p2, "/a/b", &cwd(), |e| e.readable);
        assert_eq!(r1, r2);
    }
}
