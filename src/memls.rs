//! In-memory lock manager.
//!
//! Lock state lives in a path-segment tree behind one mutex, which is
//! enough to make grant, conflict check and token issue linearizable.
//! Expired locks are pruned lazily at the start of every operation;
//! a server that wants eager expiry can call [`MemLs::sweep`] from a
//! background tick.
//!
//! Create the instance once with `MemLs::new`, store it in the
//! application, and clone it into the shares. A MemLs is just a handle,
//! cloning is cheap.
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use log::trace;
use uuid::Uuid;
use xmltree::Element;

use crate::davpath::DavPath;
use crate::fs::FsResult;
use crate::ls::*;
use crate::tree;

type Tree = tree::Tree<Vec<u8>, Vec<DavLock>>;

/// Ephemeral in-memory lock manager.
#[derive(Debug, Clone)]
pub struct MemLs(Arc<Mutex<MemLsInner>>);

#[derive(Debug)]
struct MemLsInner {
    tree:        Tree,
    max_timeout: Duration,
}

impl MemLs {
    /// Create a new "memls" lock manager with the default one hour
    /// timeout cap.
    pub fn new() -> Box<MemLs> {
        MemLs::with_max_timeout(Duration::from_secs(3600))
    }

    /// Create a lock manager with a specific timeout cap.
    pub fn with_max_timeout(max_timeout: Duration) -> Box<MemLs> {
        let inner = MemLsInner {
            tree: Tree::new(Vec::new()),
            max_timeout,
        };
        Box::new(MemLs(Arc::new(Mutex::new(inner))))
    }

    /// Drop all expired locks now.
    pub fn sweep(&self) {
        let inner = &mut *self.0.lock().unwrap();
        prune_expired(&mut inner.tree, tree::ROOT_ID);
    }
}

impl DavLockSystem for MemLs {
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
        lock_null: bool,
    ) -> Result<DavLock, DavLock>
    {
        let inner = &mut *self.0.lock().unwrap();
        prune_expired(&mut inner.tree, tree::ROOT_ID);

        // any conflicting locks along the path?
        check_locks_to_path(&inner.tree, path, &[], shared)?;

        // if it's a deep lock we need to check the subtree as well.
        if deep {
            check_locks_from_path(&inner.tree, path, &[], shared)?;
        }

        let timeout = timeout.map(|d| std::cmp::min(d, inner.max_timeout));
        let lock = DavLock {
            token: format!("opaquelocktoken:{}", Uuid::new_v4()),
            path: path.clone(),
            principal: principal.map(|s| s.to_string()),
            owner: owner.cloned(),
            timeout_at: timeout.map(|d| SystemTime::now() + d),
            timeout,
            created_at: SystemTime::now(),
            shared,
            deep,
            lock_null,
        };
        trace!("lock {} created", &lock.token);
        let node = get_or_create_path_node(&mut inner.tree, path);
        node.push(lock.clone());
        Ok(lock)
    }

    fn unlock(&self, path: &DavPath, token: &str) -> Result<DavLock, ()> {
        let inner = &mut *self.0.lock().unwrap();
        prune_expired(&mut inner.tree, tree::ROOT_ID);
        let node_id = match lookup_lock(&inner.tree, path, token) {
            None => {
                trace!("unlock: {} not found at {}", token, path);
                return Err(());
            },
            Some(n) => n,
        };
        let node = inner.tree.get_node_mut(node_id).unwrap();
        let idx = node.iter().position(|n| n.token == token).unwrap();
        let lock = node.remove(idx);
        if node.is_empty() {
            inner.tree.delete_node(node_id).ok();
        }
        Ok(lock)
    }

    fn refresh(&self, path: &DavPath, token: &str, timeout: Option<Duration>) -> Result<DavLock, ()> {
        trace!("refresh lock {}", token);
        let inner = &mut *self.0.lock().unwrap();
        prune_expired(&mut inner.tree, tree::ROOT_ID);
        let node_id = lookup_lock(&inner.tree, path, token).ok_or(())?;
        let max_timeout = inner.max_timeout;
        let node = inner.tree.get_node_mut(node_id).unwrap();
        let idx = node.iter().position(|n| n.token == token).unwrap();
        let lock = &mut node[idx];
        let timeout = timeout.map(|d| std::cmp::min(d, max_timeout));
        lock.timeout = timeout;
        lock.timeout_at = timeout.map(|d| SystemTime::now() + d);
        Ok(lock.clone())
    }

    fn check(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        ignore_principal: bool,
        deep: bool,
        submitted_tokens: Vec<&str>,
    ) -> Result<(), DavLock>
    {
        let inner = &mut *self.0.lock().unwrap();
        prune_expired(&mut inner.tree, tree::ROOT_ID);
        let held = |nl: &DavLock| {
            submitted_tokens.iter().any(|t| &nl.token == t)
                && (ignore_principal || principal == nl.principal.as_deref())
        };
        check_locks_held_to_path(&inner.tree, path, &held)?;
        if deep {
            check_locks_held_from_path(&inner.tree, path, &held)?;
        }
        Ok(())
    }

    fn discover(&self, path: &DavPath) -> Vec<DavLock> {
        let inner = &mut *self.0.lock().unwrap();
        prune_expired(&mut inner.tree, tree::ROOT_ID);
        list_locks(&inner.tree, path)
    }

    fn delete(&self, path: &DavPath) -> Result<(), ()> {
        let inner = &mut *self.0.lock().unwrap();
        if let Some(node_id) = lookup_node(&inner.tree, path) {
            inner.tree.delete_subtree(node_id).ok();
        }
        Ok(())
    }

    fn sweep_expired(&self) {
        self.sweep();
    }

    fn transfer(&self, from: &DavPath, to: &DavPath, submitted_tokens: Vec<&str>) -> Result<(), ()> {
        let inner = &mut *self.0.lock().unwrap();
        let node_id = match lookup_node(&inner.tree, from) {
            Some(id) => id,
            None => return Ok(()),
        };
        let mut locks = Vec::new();
        collect_locks(&inner.tree, node_id, &mut locks);
        inner.tree.delete_subtree(node_id).ok();

        for mut lock in locks.into_iter() {
            if !submitted_tokens.iter().any(|t| t == &lock.token) {
                // token not submitted: the lock is dropped.
                trace!("transfer: dropping lock {}", lock.token);
                continue;
            }
            let newpath = rebase(&lock.path, from, to);
            lock.path = newpath;
            let node = get_or_create_path_node(&mut inner.tree, &lock.path.clone());
            node.push(lock);
        }
        Ok(())
    }
}

fn is_expired(lock: &DavLock) -> bool {
    match lock.timeout_at {
        Some(t) => SystemTime::now() > t,
        None => false,
    }
}

fn prune_expired(tree: &mut Tree, node_id: u64) {
    if let Ok(node) = tree.get_node_mut(node_id) {
        node.retain(|l| {
            if is_expired(l) {
                trace!("lock {} expired", l.token);
                false
            } else {
                true
            }
        });
    }
    let children = match tree.get_children(node_id) {
        Ok(c) => c.map(|(_, id)| id).collect::<Vec<_>>(),
        Err(_) => return,
    };
    for child in children {
        prune_expired(tree, child);
    }
}

// check for conflicting locks from the root up to and including `path`.
// a lock for which `held` returns true is ours and never conflicts.
fn check_locks_held_to_path(
    tree: &Tree,
    path: &DavPath,
    held: &dyn Fn(&DavLock) -> bool,
) -> Result<(), DavLock>
{
    let segs = path_to_segs(path, true);
    let last_seg = segs.len() - 1;

    let mut holds_lock = false;
    let mut first_lock_seen: Option<&DavLock> = None;

    let mut node_id = tree::ROOT_ID;
    for (i, seg) in segs.into_iter().enumerate() {
        node_id = match get_child(tree, node_id, seg) {
            Ok(n) => n,
            Err(_) => break,
        };
        let node_locks = match tree.get_node(node_id) {
            Ok(n) => n,
            Err(_) => break,
        };

        for nl in node_locks {
            // an ancestor lock only covers us when it is deep.
            if i < last_seg && !nl.deep {
                continue;
            }
            if held(nl) {
                holds_lock = true;
            } else if !nl.shared {
                // exclusive locks are fatal.
                return Err(nl.to_owned());
            } else {
                first_lock_seen.get_or_insert(nl);
            }
        }
    }

    if !holds_lock {
        if let Some(first_lock_seen) = first_lock_seen {
            return Err(first_lock_seen.to_owned());
        }
    }
    Ok(())
}

// variant used on LOCK creation: a shared request is compatible with
// existing shared locks, everything else conflicts.
fn check_locks_to_path(
    tree: &Tree,
    path: &DavPath,
    submitted_tokens: &[&str],
    shared_ok: bool,
) -> Result<(), DavLock>
{
    let segs = path_to_segs(path, true);
    let last_seg = segs.len() - 1;

    let mut node_id = tree::ROOT_ID;
    for (i, seg) in segs.into_iter().enumerate() {
        node_id = match get_child(tree, node_id, seg) {
            Ok(n) => n,
            Err(_) => break,
        };
        let node_locks = match tree.get_node(node_id) {
            Ok(n) => n,
            Err(_) => break,
        };
        for nl in node_locks {
            if i < last_seg && !nl.deep {
                continue;
            }
            if submitted_tokens.iter().any(|t| &nl.token == t) {
                continue;
            }
            if !nl.shared || !shared_ok {
                return Err(nl.to_owned());
            }
        }
    }
    Ok(())
}

// see if there are conflicting locks anywhere below this collection.
fn check_locks_from_path(
    tree: &Tree,
    path: &DavPath,
    submitted_tokens: &[&str],
    shared_ok: bool,
) -> Result<(), DavLock>
{
    let node_id = match lookup_node(tree, path) {
        Some(id) => id,
        None => return Ok(()),
    };
    walk_subtree(tree, node_id, &|nl| {
        if submitted_tokens.iter().any(|t| &nl.token == t) {
            return Ok(());
        }
        if !nl.shared || !shared_ok {
            return Err(nl.to_owned());
        }
        Ok(())
    })
}

fn check_locks_held_from_path(
    tree: &Tree,
    path: &DavPath,
    held: &dyn Fn(&DavLock) -> bool,
) -> Result<(), DavLock>
{
    let node_id = match lookup_node(tree, path) {
        Some(id) => id,
        None => return Ok(()),
    };
    walk_subtree(tree, node_id, &|nl| {
        if held(nl) {
            Ok(())
        } else {
            Err(nl.to_owned())
        }
    })
}

fn walk_subtree(
    tree: &Tree,
    node_id: u64,
    visit: &dyn Fn(&DavLock) -> Result<(), DavLock>,
) -> Result<(), DavLock>
{
    if let Ok(node_locks) = tree.get_node(node_id) {
        for nl in node_locks {
            visit(nl)?;
        }
    }
    if let Ok(children) = tree.get_children(node_id) {
        for (_, child_id) in children {
            walk_subtree(tree, child_id, visit)?;
        }
    }
    Ok(())
}

fn collect_locks(tree: &Tree, node_id: u64, out: &mut Vec<DavLock>) {
    if let Ok(node_locks) = tree.get_node(node_id) {
        out.extend(node_locks.iter().cloned());
    }
    if let Ok(children) = tree.get_children(node_id) {
        for (_, child_id) in children {
            collect_locks(tree, child_id, out);
        }
    }
}

// find or create the node for a path.
fn get_or_create_path_node<'a>(tree: &'a mut Tree, path: &DavPath) -> &'a mut Vec<DavLock> {
    let mut node_id = tree::ROOT_ID;
    for seg in path_to_segs(path, false) {
        node_id = match tree.get_child(node_id, seg) {
            Ok(n) => n,
            Err(_) => {
                tree.add_child(node_id, seg.to_vec(), Vec::new(), false)
                    .unwrap()
            },
        };
    }
    tree.get_node_mut(node_id).unwrap()
}

// find the node that holds the lock with this token, walking the path.
fn lookup_lock(tree: &Tree, path: &DavPath, token: &str) -> Option<u64> {
    let mut node_id = tree::ROOT_ID;
    for seg in path_to_segs(path, true) {
        node_id = match get_child(tree, node_id, seg) {
            Ok(n) => n,
            Err(_) => break,
        };
        let node = tree.get_node(node_id).unwrap();
        if node.iter().any(|n| n.token == token) {
            return Some(node_id);
        }
    }
    trace!("lookup_lock: {} not found", token);
    None
}

fn lookup_node(tree: &Tree, path: &DavPath) -> Option<u64> {
    let mut node_id = tree::ROOT_ID;
    for seg in path_to_segs(path, false) {
        node_id = match tree.get_child(node_id, seg) {
            Ok(n) => n,
            Err(_) => return None,
        };
    }
    Some(node_id)
}

// all locks that cover `path`: on it, or deep on an ancestor.
fn list_locks(tree: &Tree, path: &DavPath) -> Vec<DavLock> {
    let mut locks = Vec::new();
    let segs = path_to_segs(path, false);
    let last_seg = segs.len().wrapping_sub(1);

    if let Ok(node) = tree.get_node(tree::ROOT_ID) {
        locks.extend(node.iter().filter(|l| l.deep || segs.is_empty()).cloned());
    }
    let mut node_id = tree::ROOT_ID;
    for (i, seg) in segs.into_iter().enumerate() {
        node_id = match tree.get_child(node_id, seg) {
            Ok(n) => n,
            Err(_) => break,
        };
        if let Ok(node) = tree.get_node(node_id) {
            locks.extend(node.iter().filter(|l| l.deep || i == last_seg).cloned());
        }
    }
    locks
}

// rebase a lock root from below `from` to below `to`.
fn rebase(path: &DavPath, from: &DavPath, to: &DavPath) -> DavPath {
    let from_segs = path_to_segs(from, false).len();
    let mut newpath = to.clone();
    for seg in path_to_segs(path, false).into_iter().skip(from_segs) {
        newpath.push_segment(seg);
    }
    newpath.add_slash_if(path.is_collection());
    newpath
}

// lock roots are keyed by the full URL path, share prefix included,
// so one lock manager can serve all mounted shares.
fn path_to_segs(path: &DavPath, include_root: bool) -> Vec<&[u8]> {
    let path = path.as_bytes_with_prefix();
    let mut segs: Vec<&[u8]> = path.split(|&c| c == b'/').filter(|s| !s.is_empty()).collect();
    if include_root {
        segs.insert(0, b"");
    }
    segs
}

fn get_child(tree: &Tree, node_id: u64, seg: &[u8]) -> FsResult<u64> {
    if seg.is_empty() {
        return Ok(node_id);
    }
    tree.get_child(node_id, seg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    fn lock(ls: &MemLs, path: &str, shared: bool, deep: bool) -> Result<DavLock, DavLock> {
        ls.lock(&p(path), Some("alice"), None, None, shared, deep, false)
    }

    #[test]
    fn compatibility_matrix() {
        let ls = MemLs::new();
        let l1 = lock(&ls, "/a/b", true, false).unwrap();
        // second shared lock is fine.
        let l2 = lock(&ls, "/a/b", true, false).unwrap();
        // exclusive conflicts with any shared lock.
        assert!(lock(&ls, "/a/b", false, false).is_err());
        ls.unlock(&p("/a/b"), &l1.token).unwrap();
        ls.unlock(&p("/a/b"), &l2.token).unwrap();

        let l3 = lock(&ls, "/a/b", false, false).unwrap();
        assert!(lock(&ls, "/a/b", true, false).is_err());
        assert!(lock(&ls, "/a/b", false, false).is_err());
        ls.unlock(&p("/a/b"), &l3.token).unwrap();
    }

    #[test]
    fn deep_lock_covers_descendants() {
        let ls = MemLs::new();
        let deep = lock(&ls, "/d/", false, true).unwrap();
        // the whole subtree is covered.
        assert!(lock(&ls, "/d/x", false, false).is_err());
        // and a deep lock on an ancestor conflicts with the child lock.
        assert!(ls.check(&p("/d/x"), None, true, false, vec![]).is_err());
        assert!(ls.check(&p("/d/x"), None, true, false, vec![&deep.token]).is_ok());
    }

    #[test]
    fn check_wants_token() {
        let ls = MemLs::new();
        let l = lock(&ls, "/f.txt", false, false).unwrap();
        let conflict = ls.check(&p("/f.txt"), None, true, false, vec![]).unwrap_err();
        assert_eq!(conflict.token, l.token);
        assert!(ls.check(&p("/f.txt"), None, true, false, vec![&l.token]).is_ok());
        // wrong principal, even with the right token.
        assert!(ls
            .check(&p("/f.txt"), Some("bob"), false, false, vec![&l.token])
            .is_err());
    }

    #[test]
    fn expiry() {
        let ls = MemLs::new();
        ls.lock(
            &p("/t.txt"),
            None,
            None,
            Some(Duration::from_secs(0)),
            false,
            false,
            false,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        ls.sweep();
        assert!(ls.discover(&p("/t.txt")).is_empty());
        // and the path is lockable again.
        assert!(lock(&ls, "/t.txt", false, false).is_ok());
    }

    #[test]
    fn transfer_needs_token() {
        let ls = MemLs::new();
        let keep = lock(&ls, "/src/a", false, false).unwrap();
        let drop = lock(&ls, "/src/b", false, false).unwrap();
        ls.transfer(&p("/src/"), &p("/dst/"), vec![&keep.token]).unwrap();
        let moved = ls.discover(&p("/dst/a"));
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].token, keep.token);
        assert_eq!(moved[0].path.as_bytes(), b"/dst/a");
        assert!(ls.discover(&p("/dst/b")).is_empty());
        assert!(ls.discover(&p("/src/b")).iter().all(|l| l.token != drop.token));
    }
}
