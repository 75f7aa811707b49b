//! Provider that serves a directory of the local filesystem.
//!
//! Writes go straight to disk, there is no batching. Live properties
//! come from `stat`; the etag is derived from inode, size and mtime.
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::FutureExt;
use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::davpath::DavPath;
use crate::fs::*;

/// Filesystem provider, rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    inner: Arc<LocalFsInner>,
}

#[derive(Debug)]
struct LocalFsInner {
    basedir:   PathBuf,
    read_only: bool,
}

#[derive(Debug, Clone)]
struct LocalFsMetaData(std::fs::Metadata);

#[derive(Debug)]
struct LocalFsFile {
    file: tokio::fs::File,
}

#[derive(Debug)]
struct LocalFsDirEntry {
    name: Vec<u8>,
    meta: std::fs::Metadata,
}

impl LocalFs {
    /// Create a new LocalFs provider serving `base`.
    pub fn new<P: AsRef<Path>>(base: P, read_only: bool) -> Box<LocalFs> {
        Box::new(LocalFs {
            inner: Arc::new(LocalFsInner {
                basedir: base.as_ref().to_path_buf(),
                read_only,
            }),
        })
    }

    fn fspath(&self, path: &DavPath) -> PathBuf {
        let mut p = self.inner.basedir.clone();
        p.push(path.as_rel_ospath());
        p
    }
}

fn to_fserror(e: std::io::Error) -> FsError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FsError::NotFound,
        std::io::ErrorKind::AlreadyExists => FsError::Exists,
        std::io::ErrorKind::PermissionDenied => FsError::Forbidden,
        _ => FsError::GeneralFailure,
    }
}

impl DavProvider for LocalFs {
    fn metadata<'a>(&'a self, path: &'a DavPath, _ctx: &'a DavContext) -> FsFuture<'a, Box<dyn DavMetaData>> {
        async move {
            let meta = tokio::fs::metadata(self.fspath(path)).await.map_err(to_fserror)?;
            Ok(Box::new(LocalFsMetaData(meta)) as Box<dyn DavMetaData>)
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
            trace!("FS: read_dir {:?}", path);
            let mut rd = tokio::fs::read_dir(self.fspath(path)).await.map_err(to_fserror)?;
            let mut v: Vec<FsResult<Box<dyn DavDirEntry>>> = Vec::new();
            while let Some(entry) = rd.next_entry().await.map_err(to_fserror)? {
                let meta = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                #[cfg(target_family = "unix")]
                let name = {
                    use std::os::unix::ffi::OsStrExt;
                    entry.file_name().as_os_str().as_bytes().to_vec()
                };
                #[cfg(not(target_family = "unix"))]
                let name = entry.file_name().to_string_lossy().as_bytes().to_vec();
                v.push(Ok(Box::new(LocalFsDirEntry { name, meta }) as Box<dyn DavDirEntry>));
            }
            Ok(Box::pin(futures_util::stream::iter(v)) as FsStream<Box<dyn DavDirEntry>>)
        }
        .boxed()
    }

    fn open<'a>(
        &'a self,
        path: &'a DavPath,
        options: OpenOptions,
        _ctx: &'a DavContext,
    ) -> FsFuture<'a, Box<dyn DavFile>>
    {
        async move {
            if self.inner.read_only && (options.write || options.create || options.truncate) {
                return Err(FsError::Forbidden);
            }
            let file = tokio::fs::OpenOptions::new()
                .read(options.read)
                .write(options.write)
                .append(options.append)
                .truncate(options.truncate)
                .create(options.create)
                .create_new(options.create_new)
                .open(self.fspath(path))
                .await
                .map_err(to_fserror)?;
            Ok(Box::new(LocalFsFile { file }) as Box<dyn DavFile>)
        }
        .boxed()
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath, _ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("FS: create_dir {:?}", path);
            if self.inner.read_only {
                return Err(FsError::Forbidden);
            }
            tokio::fs::create_dir(self.fspath(path)).await.map_err(|e| {
                match e.kind() {
                    std::io::ErrorKind::NotFound => FsError::NotFound,
                    std::io::ErrorKind::AlreadyExists => FsError::Exists,
                    _ => to_fserror(e),
                }
            })
        }
        .boxed()
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath, _ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("FS: remove_dir {:?}", path);
            if self.inner.read_only {
                return Err(FsError::Forbidden);
            }
            tokio::fs::remove_dir(self.fspath(path)).await.map_err(to_fserror)
        }
        .boxed()
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath, _ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("FS: remove_file {:?}", path);
            if self.inner.read_only {
                return Err(FsError::Forbidden);
            }
            tokio::fs::remove_file(self.fspath(path)).await.map_err(to_fserror)
        }
        .boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath, _ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("FS: rename {:?} {:?}", from, to);
            if self.inner.read_only {
                return Err(FsError::Forbidden);
            }
            tokio::fs::rename(self.fspath(from), self.fspath(to))
                .await
                .map_err(to_fserror)
        }
        .boxed()
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath, _ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("FS: copy {:?} {:?}", from, to);
            if self.inner.read_only {
                return Err(FsError::Forbidden);
            }
            let (from, to) = (self.fspath(from), self.fspath(to));
            if let Err(e) = tokio::fs::copy(&from, &to).await {
                // a partially written copy is worse than no copy.
                tokio::fs::remove_file(&to).await.ok();
                return Err(to_fserror(e));
            }
            Ok(())
        }
        .boxed()
    }

    fn is_read_only(&self) -> bool {
        self.inner.read_only
    }
}

impl DavFile for LocalFsFile {
    fn metadata(&mut self) -> FsFuture<Box<dyn DavMetaData>> {
        async move {
            let meta = self.file.metadata().await.map_err(to_fserror)?;
            Ok(Box::new(LocalFsMetaData(meta)) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<()> {
        async move {
            self.file.write_all(&buf).await.map_err(to_fserror)?;
            Ok(())
        }
        .boxed()
    }

    fn write_buf(&mut self, mut buf: Box<dyn Buf + Send>) -> FsFuture<()> {
        async move {
            while buf.has_remaining() {
                let chunk = buf.chunk();
                let n = chunk.len();
                self.file.write_all(chunk).await.map_err(to_fserror)?;
                buf.advance(n);
            }
            Ok(())
        }
        .boxed()
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes> {
        async move {
            let mut buf = BytesMut::with_capacity(count);
            while buf.len() < count {
                let n = self.file.read_buf(&mut buf).await.map_err(to_fserror)?;
                if n == 0 {
                    break;
                }
            }
            Ok(buf.freeze())
        }
        .boxed()
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64> {
        async move { self.file.seek(pos).await.map_err(to_fserror) }.boxed()
    }

    fn flush(&mut self) -> FsFuture<()> {
        async move { self.file.flush().await.map_err(to_fserror) }.boxed()
    }
}

impl DavDirEntry for LocalFsDirEntry {
    fn name(&self) -> Vec<u8> {
        self.name.clone()
    }

    fn metadata(&self) -> FsFuture<Box<dyn DavMetaData>> {
        let meta = Box::new(LocalFsMetaData(self.meta.clone())) as Box<dyn DavMetaData>;
        async move { Ok(meta) }.boxed()
    }
}

impl DavMetaData for LocalFsMetaData {
    fn len(&self) -> u64 {
        self.0.len()
    }

    fn modified(&self) -> FsResult<SystemTime> {
        self.0.modified().map_err(|_| FsError::GeneralFailure)
    }

    fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    fn created(&self) -> FsResult<SystemTime> {
        self.0.created().map_err(|_| FsError::NotImplemented)
    }

    #[cfg(target_family = "unix")]
    fn etag(&self) -> Option<String> {
        use std::os::unix::fs::MetadataExt;
        let mtime_ns = self.0.mtime() as u64 * 1_000_000_000 + self.0.mtime_nsec() as u64;
        Some(format!("{:x}-{:x}-{:x}", self.0.ino(), self.0.len(), mtime_ns))
    }
}
