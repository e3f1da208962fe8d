//! In-memory lock manager.
//!
//! Write locks are anchored on interned paths (see `pathreg`). A lock on a
//! collection covers everything below it; conflicts are therefore checked
//! with a root-first ancestor walk. Locks expire on a monotonic clock and
//! are purged lazily, whenever the table is consulted.
//!
//! A `LockManager` is a cheap handle: clone it freely, all clones share
//! the same table.
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;
use xmltree::Element;

use crate::pathreg::{LockId, PathId, PathRegistry};

/// A lock as handed out to the method handlers.
#[derive(Debug, Clone)]
pub struct DavLock {
    /// `urn:uuid:...` token, unique for the lifetime of the server.
    pub token: String,
    /// The normalized path the lock is anchored at.
    pub path: String,
    /// Shared or exclusive.
    pub shared: bool,
    /// Depth infinity or zero.
    pub deep: bool,
    /// Opaque owner element from the lockinfo body, echoed back.
    pub owner: Option<Element>,
    /// Remaining timeout; `None` means the lock never expires.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
struct LockEntry {
    lock: DavLock,
    anchor: PathId,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    registry: PathRegistry,
    locks: Vec<Option<LockEntry>>,
    free: Vec<LockId>,
}

/// Ephemeral in-memory lock table.
#[derive(Debug, Clone, Default)]
pub struct LockManager(Arc<Mutex<Inner>>);

fn new_token() -> String {
    let token = format!("urn:uuid:{}", Uuid::new_v4());
    debug_assert_eq!(token.len(), "urn:uuid:".len() + 36);
    token
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager::default()
    }

    /// Try to create a lock at `path`. `timeout` of zero seconds means the
    /// lock never expires. Fails when a conflicting lock exists.
    pub fn lock(
        &self,
        path: &str,
        owner: Option<&Element>,
        timeout_secs: u64,
        shared: bool,
        deep: bool,
    ) -> Result<DavLock, ()> {
        let inner = &mut *self.0.lock();
        purge_expired(inner);

        // No lock may be created below an exclusive lock. An exclusive
        // lock additionally conflicts with any lock above or below it.
        let clear = inner.registry.for_each_ancestor(path, |id| {
            !inner.registry.node(id).locks.iter().any(|&l| {
                let e = inner.locks[l].as_ref().expect("stale lock id");
                !e.lock.shared || !shared
            })
        });
        if !clear {
            return Err(());
        }
        if !shared {
            for id in inner.registry.descendants(path) {
                if !inner.registry.node(id).locks.is_empty() {
                    return Err(());
                }
            }
        }

        let anchor = inner.registry.intern(path);
        let lock = DavLock {
            token: new_token(),
            path: inner.registry.node(anchor).path.clone(),
            shared,
            deep,
            owner: owner.cloned(),
            timeout: timeout_from_secs(timeout_secs),
        };
        let entry = LockEntry {
            lock: lock.clone(),
            anchor,
            expires_at: expiry_from_secs(timeout_secs),
        };
        let id = match inner.free.pop() {
            Some(id) => {
                inner.locks[id] = Some(entry);
                id
            }
            None => {
                inner.locks.push(Some(entry));
                inner.locks.len() - 1
            }
        };
        inner.registry.add_lock(anchor, id);
        // the lock itself keeps the anchor alive.
        inner.registry.release(anchor);
        trace!("lock {} created at {}", lock.token, lock.path);
        Ok(lock)
    }

    /// Look up a lock by token on `path` or any of its ancestors.
    pub fn find_by_token(&self, path: &str, token: &str) -> Option<DavLock> {
        let inner = &mut *self.0.lock();
        purge_expired(inner);
        find_entry(inner, path, token).map(|id| {
            let e = inner.locks[id].as_ref().unwrap();
            refreshed_view(e)
        })
    }

    /// Refresh a lock's timeout. Zero seconds sets infinite expiry.
    pub fn refresh(&self, path: &str, token: &str, timeout_secs: u64) -> Result<DavLock, ()> {
        let inner = &mut *self.0.lock();
        purge_expired(inner);
        let id = find_entry(inner, path, token).ok_or(())?;
        let e = inner.locks[id].as_mut().unwrap();
        e.expires_at = expiry_from_secs(timeout_secs);
        e.lock.timeout = timeout_from_secs(timeout_secs);
        trace!("lock {} refreshed", token);
        Ok(e.lock.clone())
    }

    /// Release the lock identified by `token`.
    pub fn unlock(&self, path: &str, token: &str) -> Result<(), ()> {
        let inner = &mut *self.0.lock();
        purge_expired(inner);
        let id = find_entry(inner, path, token).ok_or(())?;
        drop_entry(inner, id);
        trace!("lock {} released", token);
        Ok(())
    }

    /// Is there any lock on `path` or its ancestors that is not in the
    /// submitted token list?
    pub fn has_other_locks(&self, path: &str, submitted: &[&str]) -> bool {
        let inner = &mut *self.0.lock();
        purge_expired(inner);
        !inner.registry.for_each_ancestor(path, |id| {
            inner.registry.node(id).locks.iter().all(|&l| {
                let e = inner.locks[l].as_ref().expect("stale lock id");
                submitted.contains(&e.lock.token.as_str())
            })
        })
    }

    /// All locks covering `path`, root first. Used for `lockdiscovery`.
    pub fn discover(&self, path: &str) -> Vec<DavLock> {
        let inner = &mut *self.0.lock();
        purge_expired(inner);
        let mut locks = Vec::new();
        inner.registry.for_each_ancestor(path, |id| {
            for &l in &inner.registry.node(id).locks {
                let e = inner.locks[l].as_ref().expect("stale lock id");
                locks.push(refreshed_view(e));
            }
            true
        });
        locks
    }

    /// Remove all locks anchored at `path` and below. Called after a
    /// successful DELETE or MOVE.
    pub fn delete(&self, path: &str) {
        let inner = &mut *self.0.lock();
        let mut ids = Vec::new();
        if let Some(id) = inner.registry.lookup(path) {
            ids.extend_from_slice(&inner.registry.node(id).locks);
        }
        for id in inner.registry.descendants(path) {
            ids.extend_from_slice(&inner.registry.node(id).locks);
        }
        for id in ids {
            drop_entry(inner, id);
        }
    }
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

fn expiry_from_secs(secs: u64) -> Option<Instant> {
    timeout_from_secs(secs).map(|d| Instant::now() + d)
}

// The lock with its timeout recomputed against the current clock.
fn refreshed_view(e: &LockEntry) -> DavLock {
    let mut lock = e.lock.clone();
    lock.timeout = e
        .expires_at
        .map(|at| at.saturating_duration_since(Instant::now()));
    lock
}

fn find_entry(inner: &Inner, path: &str, token: &str) -> Option<LockId> {
    let mut found = None;
    inner.registry.for_each_ancestor(path, |id| {
        for &l in &inner.registry.node(id).locks {
            let e = inner.locks[l].as_ref().expect("stale lock id");
            if e.lock.token == token {
                found = Some(l);
                return false;
            }
        }
        true
    });
    found
}

fn drop_entry(inner: &mut Inner, id: LockId) {
    if let Some(e) = inner.locks[id].take() {
        inner.registry.remove_lock(e.anchor, id);
        inner.free.push(id);
    }
}

fn purge_expired(inner: &mut Inner) {
    let now = Instant::now();
    let expired: Vec<LockId> = inner
        .locks
        .iter()
        .enumerate()
        .filter_map(|(i, e)| {
            let e = e.as_ref()?;
            match e.expires_at {
                Some(at) if at <= now => Some(i),
                _ => None,
            }
        })
        .collect();
    for id in expired {
        trace!("lock {} expired", inner.locks[id].as_ref().unwrap().lock.token);
        drop_entry(inner, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_form() {
        let t = new_token();
        assert!(t.starts_with("urn:uuid:"));
        assert_eq!(t.len(), 45);
    }

    #[test]
    fn find_by_token_covers_descendants() {
        let ls = LockManager::new();
        let lock = ls.lock("/a/b", None, 0, false, true).unwrap();
        assert!(ls.find_by_token("/a/b/c/d", &lock.token).is_some());
        assert!(ls.find_by_token("/a/b", &lock.token).is_some());
        assert!(ls.find_by_token("/a", &lock.token).is_none());
        assert!(ls.find_by_token("/a/b/c", "urn:uuid:nope").is_none());
        assert!(ls.find_by_token("/a/b/c", "DAV:no-lock").is_none());
    }

    #[test]
    fn exclusive_conflicts() {
        let ls = LockManager::new();
        let l = ls.lock("/a/b", None, 0, false, true).unwrap();
        // below, at, and above an exclusive lock: all refused.
        assert!(ls.lock("/a/b/c", None, 0, false, true).is_err());
        assert!(ls.lock("/a/b/c", None, 0, true, true).is_err());
        assert!(ls.lock("/a/b", None, 0, true, false).is_err());
        assert!(ls.lock("/a", None, 0, false, true).is_err());
        // a sibling is fine.
        assert!(ls.lock("/a/x", None, 0, false, true).is_ok());
        ls.unlock("/a/b", &l.token).unwrap();
        assert!(ls.lock("/a/b/c", None, 0, false, true).is_ok());
    }

    #[test]
    fn shared_coexist() {
        let ls = LockManager::new();
        let s1 = ls.lock("/s", None, 0, true, true).unwrap();
        let s2 = ls.lock("/s", None, 0, true, true).unwrap();
        assert_ne!(s1.token, s2.token);
        // an exclusive lock under shared ancestors is refused.
        assert!(ls.lock("/s/x", None, 0, false, true).is_err());
        // a shared lock under a shared ancestor is fine.
        assert!(ls.lock("/s/x", None, 0, true, true).is_ok());
    }

    #[test]
    fn has_other_locks_respects_submitted() {
        let ls = LockManager::new();
        let lock = ls.lock("/d", None, 0, false, true).unwrap();
        assert!(ls.has_other_locks("/d/file", &[]));
        assert!(!ls.has_other_locks("/d/file", &[lock.token.as_str()]));
        assert!(!ls.has_other_locks("/elsewhere", &[]));
    }

    #[test]
    fn refresh_and_expiry() {
        let ls = LockManager::new();
        let lock = ls.lock("/t", None, 3600, false, true).unwrap();
        assert!(lock.timeout.is_some());
        let lock = ls.refresh("/t", &lock.token, 0).unwrap();
        assert!(lock.timeout.is_none());
        assert!(ls.refresh("/t", "urn:uuid:unknown", 60).is_err());
    }

    #[test]
    fn unlock_then_gone() {
        let ls = LockManager::new();
        let lock = ls.lock("/u", None, 0, false, false).unwrap();
        assert!(ls.unlock("/u", &lock.token).is_ok());
        assert!(ls.unlock("/u", &lock.token).is_err());
        assert!(!ls.has_other_locks("/u", &[]));
    }

    #[test]
    fn delete_clears_subtree() {
        let ls = LockManager::new();
        ls.lock("/p/q", None, 0, true, true).unwrap();
        ls.lock("/p/q/r", None, 0, true, true).unwrap();
        ls.delete("/p");
        assert!(!ls.has_other_locks("/p/q/r", &[]));
    }
}
