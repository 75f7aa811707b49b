//! The structs and traits that define a lock manager.
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

use xmltree::Element;

use crate::davpath::DavPath;

/// A write lock held on a resource URL.
#[derive(Debug, Clone)]
pub struct DavLock {
    /// `opaquelocktoken:` URI, globally unique, never reused.
    pub token:      String,
    /// Lock root. A deep lock covers everything below it as well.
    pub path:       DavPath,
    /// Principal that created the lock.
    pub principal:  Option<String>,
    /// Opaque `<D:owner>` XML submitted by the client.
    pub owner:      Option<Element>,
    pub timeout_at: Option<SystemTime>,
    pub timeout:    Option<Duration>,
    pub created_at: SystemTime,
    pub shared:     bool,
    pub deep:       bool,
    /// Lock was taken on an unmapped URL; the placeholder resource is
    /// removed again when the lock goes away.
    pub lock_null:  bool,
}

/// The trait that defines a lock manager.
///
/// Lock grant, conflict check and token issue each happen under one
/// critical section, so the operations are linearizable.
pub trait DavLockSystem: Debug + Sync + Send + BoxCloneLs {
    /// Lock a resource. Returns `Ok(new_lock)`, or `Err(conflicting_lock)`.
    #[allow(clippy::too_many_arguments)]
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
        lock_null: bool,
    ) -> Result<DavLock, DavLock>;

    /// Unlock a resource. Returns the removed lock, or `Err(())` if no
    /// lock with this token covers the path.
    fn unlock(&self, path: &DavPath, token: &str) -> Result<DavLock, ()>;

    /// Extend the timeout of an existing lock.
    fn refresh(&self, path: &DavPath, token: &str, timeout: Option<Duration>) -> Result<DavLock, ()>;

    /// Check whether the resource is locked, and if so, whether all
    /// covering locks were submitted. Returns one conflicting lock on
    /// failure.
    fn check(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        ignore_principal: bool,
        deep: bool,
        submitted_tokens: Vec<&str>,
    ) -> Result<(), DavLock>;

    /// All locks covering `path` (direct or through a deep ancestor).
    fn discover(&self, path: &DavPath) -> Vec<DavLock>;

    /// Remove all locks rooted at or below `path` (after DELETE).
    fn delete(&self, path: &DavPath) -> Result<(), ()>;

    /// After a MOVE: locks rooted at or below `from` whose token was
    /// submitted are re-rooted under `to`; all others are dropped.
    fn transfer(&self, from: &DavPath, to: &DavPath, submitted_tokens: Vec<&str>) -> Result<(), ()>;

    /// Eagerly drop expired locks. Implementations that only sweep
    /// lazily can leave this a no-op.
    fn sweep_expired(&self) {}
}

#[doc(hidden)]
pub trait BoxCloneLs {
    fn box_clone(&self) -> Box<dyn DavLockSystem>;
}

// generic Clone, calls implementation-specific box_clone().
impl Clone for Box<dyn DavLockSystem> {
    fn clone(&self) -> Box<dyn DavLockSystem> {
        self.box_clone()
    }
}

#[doc(hidden)]
impl<LS: Clone + DavLockSystem + 'static> BoxCloneLs for LS {
    fn box_clone(&self) -> Box<dyn DavLockSystem> {
        Box::new((*self).clone())
    }
}
