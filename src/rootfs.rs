//! Synthetic read-only collection at `/` whose members are the
//! mounted share names.
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::FutureExt;

use crate::davpath::DavPath;
use crate::fs::*;

/// Provider for the root share: lists the other shares.
#[derive(Debug, Clone)]
pub struct RootFs {
    inner: Arc<RootFsInner>,
}

#[derive(Debug)]
struct RootFsInner {
    shares:  Vec<String>,
    created: SystemTime,
}

#[derive(Debug, Clone)]
struct RootFsEntry {
    name:    Vec<u8>,
    created: SystemTime,
}

impl RootFs {
    /// `shares` are the share names to list, without slashes.
    pub fn new(shares: Vec<String>) -> Box<RootFs> {
        Box::new(RootFs {
            inner: Arc::new(RootFsInner {
                shares,
                created: SystemTime::now(),
            }),
        })
    }

    fn entry(&self, name: &[u8]) -> RootFsEntry {
        RootFsEntry {
            name:    name.to_vec(),
            created: self.inner.created,
        }
    }
}

impl DavProvider for RootFs {
    fn metadata<'a>(&'a self, path: &'a DavPath, _ctx: &'a DavContext) -> FsFuture<'a, Box<dyn DavMetaData>> {
        async move {
            let name = path.file_name_bytes();
            if name.is_empty() {
                return Ok(Box::new(self.entry(b"")) as Box<dyn DavMetaData>);
            }
            let name = String::from_utf8_lossy(name);
            if path.parent().as_bytes() == b"/" && self.inner.shares.iter().any(|s| s == &name) {
                return Ok(Box::new(self.entry(name.as_bytes())) as Box<dyn DavMetaData>);
            }
            Err(FsError::NotFound)
        }
        .boxed()
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        _ctx: &'a DavContext,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>>
    {
        async move {
            if !path.file_name_bytes().is_empty() {
                return Err(FsError::NotFound);
            }
            let v = self
                .inner
                .shares
                .iter()
                .map(|s| Ok(Box::new(self.entry(s.as_bytes())) as Box<dyn DavDirEntry>))
                .collect::<Vec<_>>();
            Ok(Box::pin(futures_util::stream::iter(v)) as FsStream<Box<dyn DavDirEntry>>)
        }
        .boxed()
    }

    fn open<'a>(
        &'a self,
        _path: &'a DavPath,
        _options: OpenOptions,
        _ctx: &'a DavContext,
    ) -> FsFuture<'a, Box<dyn DavFile>>
    {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

impl DavDirEntry for RootFsEntry {
    fn name(&self) -> Vec<u8> {
        self.name.clone()
    }

    fn metadata(&self) -> FsFuture<Box<dyn DavMetaData>> {
        let meta = Box::new(self.clone()) as Box<dyn DavMetaData>;
        async move { Ok(meta) }.boxed()
    }
}

impl DavMetaData for RootFsEntry {
    fn len(&self) -> u64 {
        0
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.created)
    }

    fn created(&self) -> FsResult<SystemTime> {
        Ok(self.created)
    }

    fn is_dir(&self) -> bool {
        true
    }
}
