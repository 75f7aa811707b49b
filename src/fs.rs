//! Traits that define a resource backend ("provider").
//!
//! A provider is a rooted resource tree mounted at a share. Every
//! operation receives the per-request [`DavContext`], which carries the
//! authenticated principal and, for transactional providers, the batch
//! the router bound to the request.
use std::any::Any;
use std::fmt::Debug;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};

use crate::davpath::DavPath;

macro_rules! notimplemented {
    ($method:expr) => {
        Box::pin(futures_util::future::ready(Err(FsError::NotImplemented)))
    };
}

/// Errors generated by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotImplemented,
    GeneralFailure,
    Exists,
    NotFound,
    Forbidden,
    Conflict,
    InsufficientStorage,
}

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Convenience alias for the boxed futures the traits return.
pub type FsFuture<'a, T> = BoxFuture<'a, FsResult<T>>;

/// Convenience alias for a boxed stream of directory entries.
pub type FsStream<T> = Pin<Box<dyn Stream<Item = FsResult<T>> + Send>>;

/// A dead property, owned by the property manager.
#[derive(Debug, Clone)]
pub struct DavProp {
    pub name:      String,
    pub prefix:    Option<String>,
    pub namespace: Option<String>,
    pub xml:       Option<Vec<u8>>,
}

/// Per-request state threaded into every provider call.
///
/// Created by the router before dispatch; the batch (if any) is
/// committed or aborted by the router afterwards.
#[derive(Debug, Clone, Default)]
pub struct DavContext {
    /// Authenticated principal ("user"), if any.
    pub principal: Option<String>,
    /// Per-request transaction against the provider, if it supports one.
    pub batch:     Option<Arc<dyn DavBatch>>,
}

impl DavContext {
    pub fn principal_str(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

/// Per-request transactional context against a provider.
///
/// Mutations made through the provider become visible atomically at
/// `commit`. Read-only batches see a consistent snapshot.
pub trait DavBatch: Debug + Send + Sync {
    /// was the batch opened read-only?
    fn is_readonly(&self) -> bool;
    /// Publish the batch. Fails with `FsError::Conflict` when another
    /// writer committed in the meantime.
    fn commit(&self) -> FsResult<()>;
    /// Throw the batch away.
    fn abort(&self);
    /// Downcasting hook for the owning provider.
    fn as_any(&self) -> &dyn Any;
}

/// The resource-tree backend behind a share.
pub trait DavProvider: Debug + Sync + Send + BoxCloneProv {
    /// Metadata of the resource at `path`.
    fn metadata<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, Box<dyn DavMetaData>>;

    /// Stream the members of a collection.
    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        ctx: &'a DavContext,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>>;

    /// Open a non-collection resource for reading or writing.
    fn open<'a>(
        &'a self,
        path: &'a DavPath,
        options: OpenOptions,
        ctx: &'a DavContext,
    ) -> FsFuture<'a, Box<dyn DavFile>>;

    #[allow(unused_variables)]
    fn create_dir<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        notimplemented!("create_dir")
    }

    #[allow(unused_variables)]
    fn remove_dir<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        notimplemented!("remove_dir")
    }

    #[allow(unused_variables)]
    fn remove_file<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        notimplemented!("remove_file")
    }

    #[allow(unused_variables)]
    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        notimplemented!("rename")
    }

    #[allow(unused_variables)]
    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        notimplemented!("copy")
    }

    /// Cheap existence probe.
    fn exists<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, bool> {
        async move { Ok(self.metadata(path, ctx).await.is_ok()) }.boxed()
    }

    /// Does this provider refuse mutation?
    fn is_read_only(&self) -> bool {
        false
    }

    /// Open a per-request batch. Providers without transactions return None.
    #[allow(unused_variables)]
    fn begin_batch(&self, readonly: bool) -> FsResult<Option<Arc<dyn DavBatch>>> {
        Ok(None)
    }
}

#[doc(hidden)]
pub trait BoxCloneProv {
    fn box_clone(&self) -> Box<dyn DavProvider>;
}

// generic Clone, calls implementation-specific box_clone().
impl Clone for Box<dyn DavProvider> {
    fn clone(&self) -> Box<dyn DavProvider> {
        self.box_clone()
    }
}

#[doc(hidden)]
impl<P: Clone + DavProvider + 'static> BoxCloneProv for P {
    fn box_clone(&self) -> Box<dyn DavProvider> {
        Box::new((*self).clone())
    }
}

/// One member of a collection.
pub trait DavDirEntry: Debug + Send + Sync {
    /// Name of the entry (decoded bytes).
    fn name(&self) -> Vec<u8>;

    /// Metadata of the entry.
    fn metadata(&self) -> FsFuture<Box<dyn DavMetaData>>;

    /// Default implementation, can be overridden when metadata is expensive.
    fn is_dir(&self) -> FsFuture<bool> {
        async move { Ok(self.metadata().await?.is_dir()) }.boxed()
    }
}

/// An open non-collection resource.
pub trait DavFile: Debug + Send {
    fn metadata(&mut self) -> FsFuture<Box<dyn DavMetaData>>;
    fn write_buf(&mut self, buf: Box<dyn Buf + Send>) -> FsFuture<()>;
    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<()>;
    /// Read up to `count` bytes.
    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes>;
    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64>;
    fn flush(&mut self) -> FsFuture<()>;
}

/// Live attributes of a resource.
pub trait DavMetaData: Debug + Send + Sync {
    fn len(&self) -> u64;
    fn modified(&self) -> FsResult<SystemTime>;
    fn is_dir(&self) -> bool;

    /// Opaque etag, stable while the content is unchanged.
    fn etag(&self) -> Option<String> {
        if let Ok(t) = self.modified() {
            if let Ok(t) = t.duration_since(UNIX_EPOCH) {
                // apache-style etag.
                return Some(format!(
                    "{:x}-{:x}",
                    self.len(),
                    t.as_secs() * 1_000_000 + t.subsec_nanos() as u64 / 1000
                ));
            }
        }
        Some(format!("{:x}", self.len()))
    }

    fn is_file(&self) -> bool {
        !self.is_dir()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn created(&self) -> FsResult<SystemTime> {
        Err(FsError::NotImplemented)
    }
}

impl std::error::Error for FsError {}

impl From<FsError> for std::io::Error {
    fn from(e: FsError) -> Self {
        let kind = match e {
            FsError::NotFound => std::io::ErrorKind::NotFound,
            FsError::Exists => std::io::ErrorKind::AlreadyExists,
            FsError::Forbidden => std::io::ErrorKind::PermissionDenied,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How to open a resource, modeled on std's OpenOptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read:       bool,
    pub write:      bool,
    pub append:     bool,
    pub truncate:   bool,
    pub create:     bool,
    pub create_new: bool,
    /// Size hint for the full body, when known from Content-Length.
    pub size:       Option<u64>,
}

impl OpenOptions {
    pub fn read() -> OpenOptions {
        OpenOptions {
            read: true,
            ..Default::default()
        }
    }

    pub fn write() -> OpenOptions {
        OpenOptions {
            write: true,
            ..Default::default()
        }
    }
}
