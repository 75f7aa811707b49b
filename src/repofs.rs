//! Repository provider: an in-memory content-addressed versioned tree.
//!
//! The router opens a [`RepoBatch`] per request. All operations act on
//! the batch's snapshot of the tree; `commit` atomically publishes a
//! new root. A concurrent writer that committed first wins, the loser
//! gets a conflict. Etags are the hex SHA-256 of a document's content
//! (for folders, of the member manifest).
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::{Buf, Bytes};
use futures_util::FutureExt;
use log::{debug, trace};
use sha2::{Digest, Sha256};

use crate::davpath::DavPath;
use crate::fs::*;
use crate::tree;

type Tree = tree::Tree<Vec<u8>, RepoNode>;

/// Content-addressed repository backend.
#[derive(Debug, Clone)]
pub struct RepoFs {
    repo: Arc<Mutex<RepoInner>>,
}

#[derive(Debug)]
struct RepoInner {
    tree:       Tree,
    generation: u64,
}

#[derive(Debug, Clone)]
enum RepoNode {
    Folder(RepoDirNode),
    Doc(RepoDocNode),
}

#[derive(Debug, Clone)]
struct RepoDirNode {
    mtime:  SystemTime,
    crtime: SystemTime,
}

#[derive(Debug, Clone)]
struct RepoDocNode {
    mtime:  SystemTime,
    crtime: SystemTime,
    data:   Vec<u8>,
}

/// Per-request snapshot of the repository.
#[derive(Debug)]
pub struct RepoBatch {
    repo:            Arc<Mutex<RepoInner>>,
    staged:          Arc<Mutex<Tree>>,
    base_generation: u64,
    readonly:        bool,
    dirty:           Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
struct RepoDirEntry {
    name:   Vec<u8>,
    is_dir: bool,
    size:   u64,
    mtime:  SystemTime,
    crtime: SystemTime,
    hash:   String,
}

#[derive(Debug)]
struct RepoFile {
    staged:  Arc<Mutex<Tree>>,
    dirty:   Arc<AtomicBool>,
    node_id: u64,
    pos:     usize,
    append:  bool,
}

impl RepoFs {
    /// Create a new, empty repository.
    pub fn new() -> Box<RepoFs> {
        let root = RepoNode::new_folder();
        let inner = RepoInner {
            tree:       Tree::new(root),
            generation: 0,
        };
        Box::new(RepoFs {
            repo: Arc::new(Mutex::new(inner)),
        })
    }

    // the batch the router bound to this request.
    fn batch<'a>(&self, ctx: &'a DavContext) -> FsResult<&'a RepoBatch> {
        ctx.batch
            .as_ref()
            .and_then(|b| b.as_any().downcast_ref::<RepoBatch>())
            .ok_or(FsError::GeneralFailure)
    }
}

impl DavBatch for RepoBatch {
    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn commit(&self) -> FsResult<()> {
        if self.readonly || !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        let staged = self.staged.lock().unwrap().clone();
        let mut repo = self.repo.lock().unwrap();
        if repo.generation != self.base_generation {
            // someone else committed since this batch was opened.
            debug!("RepoBatch: commit conflict at generation {}", repo.generation);
            return Err(FsError::Conflict);
        }
        repo.tree = staged;
        repo.generation += 1;
        trace!("RepoBatch: committed generation {}", repo.generation);
        Ok(())
    }

    fn abort(&self) {
        if self.dirty.load(Ordering::SeqCst) {
            trace!("RepoBatch: aborted");
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl RepoBatch {
    fn lookup(&self, path: &DavPath) -> FsResult<u64> {
        self.staged.lock().unwrap().lookup(path.as_bytes())
    }

    fn create_document(&self, path: &DavPath, options: OpenOptions) -> FsResult<Box<dyn DavFile>> {
        let tree = &mut *self.staged.lock().unwrap();
        let path = path.as_bytes();
        let node_id = match tree.lookup(path) {
            Ok(n) => {
                if options.create_new {
                    return Err(FsError::Exists);
                }
                n
            },
            Err(FsError::NotFound) => {
                if !options.create {
                    return Err(FsError::NotFound);
                }
                let parent_id = tree.lookup_parent(path)?;
                let node_id = tree.add_child(parent_id, file_name(path), RepoNode::new_doc(), true)?;
                self.dirty.store(true, Ordering::SeqCst);
                node_id
            },
            Err(e) => return Err(e),
        };
        let node = tree.get_node_mut(node_id)?;
        if node.is_dir() {
            return Err(FsError::Forbidden);
        }
        if options.truncate {
            node.as_doc_mut()?.data.truncate(0);
            node.touch();
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(Box::new(RepoFile {
            staged:  self.staged.clone(),
            dirty:   self.dirty.clone(),
            node_id,
            pos:     0,
            append:  options.append,
        }))
    }

    fn create_folder(&self, path: &DavPath) -> FsResult<()> {
        let tree = &mut *self.staged.lock().unwrap();
        let path = path.as_bytes();
        let parent_id = tree.lookup_parent(path)?;
        tree.add_child(parent_id, file_name(path), RepoNode::new_folder(), false)?;
        tree.get_node_mut(parent_id)?.touch();
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn remove_item(&self, path: &DavPath) -> FsResult<()> {
        let tree = &mut *self.staged.lock().unwrap();
        let parent_id = tree.lookup_parent(path.as_bytes())?;
        let node_id = tree.lookup(path.as_bytes())?;
        tree.delete_node(node_id)?;
        tree.get_node_mut(parent_id)?.touch();
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn move_item(&self, from: &DavPath, to: &DavPath) -> FsResult<()> {
        let tree = &mut *self.staged.lock().unwrap();
        let node_id = tree.lookup(from.as_bytes())?;
        let parent_id = tree.lookup_parent(from.as_bytes())?;
        let dst_id = tree.lookup_parent(to.as_bytes())?;
        tree.move_node(node_id, dst_id, file_name(to.as_bytes()), true)?;
        tree.get_node_mut(parent_id)?.touch();
        tree.get_node_mut(dst_id)?.touch();
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn copy_item(&self, from: &DavPath, to: &DavPath) -> FsResult<()> {
        let tree = &mut *self.staged.lock().unwrap();

        let snode_id = tree.lookup(from.as_bytes())?;
        let mut data = tree.get_node(snode_id)?.clone();
        if let RepoNode::Folder(ref mut d) = data {
            d.crtime = SystemTime::now();
        }
        if let RepoNode::Doc(ref mut f) = data {
            f.crtime = SystemTime::now();
        }

        let path = to.as_bytes();
        let parent_id = tree.lookup_parent(path)?;
        match tree.lookup(path) {
            Ok(dnode_id) => *tree.get_node_mut(dnode_id)? = data,
            Err(FsError::NotFound) => {
                tree.add_child(parent_id, file_name(path), data, true)?;
            },
            Err(e) => return Err(e),
        }
        tree.get_node_mut(parent_id)?.touch();
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl DavProvider for RepoFs {
    fn metadata<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, Box<dyn DavMetaData>> {
        async move {
            let batch = self.batch(ctx)?;
            let tree = &*batch.staged.lock().unwrap();
            let node_id = tree.lookup(path.as_bytes())?;
            let node = tree.get_node(node_id)?;
            Ok(Box::new(node.as_dirent(tree, node_id, path.file_name_bytes())) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        ctx: &'a DavContext,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>>
    {
        async move {
            let batch = self.batch(ctx)?;
            let tree = &*batch.staged.lock().unwrap();
            let node_id = tree.lookup(path.as_bytes())?;
            if !tree.get_node(node_id)?.is_dir() {
                return Err(FsError::Forbidden);
            }
            let mut v: Vec<FsResult<Box<dyn DavDirEntry>>> = Vec::new();
            for (name, child_id) in tree.get_children(node_id)? {
                if let Ok(node) = tree.get_node(child_id) {
                    v.push(Ok(Box::new(node.as_dirent(tree, child_id, &name)) as Box<dyn DavDirEntry>));
                }
            }
            Ok(Box::pin(futures_util::stream::iter(v)) as FsStream<Box<dyn DavDirEntry>>)
        }
        .boxed()
    }

    fn open<'a>(
        &'a self,
        path: &'a DavPath,
        options: OpenOptions,
        ctx: &'a DavContext,
    ) -> FsFuture<'a, Box<dyn DavFile>>
    {
        async move {
            let batch = self.batch(ctx)?;
            if batch.is_readonly() && (options.write || options.create || options.truncate) {
                return Err(FsError::Forbidden);
            }
            batch.create_document(path, options)
        }
        .boxed()
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("RepoFs: create_folder {:?}", path);
            self.batch(ctx)?.create_folder(path)
        }
        .boxed()
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("RepoFs: remove_folder {:?}", path);
            self.batch(ctx)?.remove_item(path)
        }
        .boxed()
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("RepoFs: remove_document {:?}", path);
            self.batch(ctx)?.remove_item(path)
        }
        .boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("RepoFs: move_item {:?} {:?}", from, to);
            self.batch(ctx)?.move_item(from, to)
        }
        .boxed()
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, ()> {
        async move {
            debug!("RepoFs: copy_item {:?} {:?}", from, to);
            self.batch(ctx)?.copy_item(from, to)
        }
        .boxed()
    }

    fn exists<'a>(&'a self, path: &'a DavPath, ctx: &'a DavContext) -> FsFuture<'a, bool> {
        async move { Ok(self.batch(ctx).and_then(|b| b.lookup(path)).is_ok()) }.boxed()
    }

    fn begin_batch(&self, readonly: bool) -> FsResult<Option<Arc<dyn DavBatch>>> {
        let repo = self.repo.lock().unwrap();
        let batch = RepoBatch {
            repo:            self.repo.clone(),
            staged:          Arc::new(Mutex::new(repo.tree.clone())),
            base_generation: repo.generation,
            readonly,
            dirty:           Arc::new(AtomicBool::new(false)),
        };
        Ok(Some(Arc::new(batch)))
    }
}

impl RepoNode {
    fn new_folder() -> RepoNode {
        RepoNode::Folder(RepoDirNode {
            crtime: SystemTime::now(),
            mtime:  SystemTime::now(),
        })
    }

    fn new_doc() -> RepoNode {
        RepoNode::Doc(RepoDocNode {
            crtime: SystemTime::now(),
            mtime:  SystemTime::now(),
            data:   Vec::new(),
        })
    }

    fn is_dir(&self) -> bool {
        matches!(self, RepoNode::Folder(_))
    }

    fn as_doc(&self) -> FsResult<&RepoDocNode> {
        match self {
            RepoNode::Doc(ref n) => Ok(n),
            _ => Err(FsError::Forbidden),
        }
    }

    fn as_doc_mut(&mut self) -> FsResult<&mut RepoDocNode> {
        match self {
            RepoNode::Doc(ref mut n) => Ok(n),
            _ => Err(FsError::Forbidden),
        }
    }

    fn touch(&mut self) {
        let now = SystemTime::now();
        match self {
            RepoNode::Folder(ref mut d) => d.mtime = now,
            RepoNode::Doc(ref mut f) => f.mtime = now,
        }
    }

    // content hash: document data, or the member manifest of a folder.
    fn content_hash(&self, tree: &Tree, node_id: u64) -> String {
        let mut hasher = Sha256::new();
        match self {
            RepoNode::Doc(ref f) => hasher.update(&f.data),
            RepoNode::Folder(_) => {
                let mut names = match tree.get_children(node_id) {
                    Ok(children) => children.map(|(name, _)| name).collect::<Vec<_>>(),
                    Err(_) => Vec::new(),
                };
                names.sort();
                for name in names {
                    hasher.update(&name);
                    hasher.update(b"\0");
                }
            },
        }
        hex(&hasher.finalize())
    }

    fn as_dirent(&self, tree: &Tree, node_id: u64, name: &[u8]) -> RepoDirEntry {
        let (is_dir, size, mtime, crtime) = match self {
            RepoNode::Doc(ref f) => (false, f.data.len() as u64, f.mtime, f.crtime),
            RepoNode::Folder(ref d) => (true, 0, d.mtime, d.crtime),
        };
        RepoDirEntry {
            name: name.to_vec(),
            is_dir,
            size,
            mtime,
            crtime,
            hash: self.content_hash(tree, node_id),
        }
    }
}

fn hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

impl DavDirEntry for RepoDirEntry {
    fn name(&self) -> Vec<u8> {
        self.name.clone()
    }

    fn metadata(&self) -> FsFuture<Box<dyn DavMetaData>> {
        let meta = Box::new(self.clone()) as Box<dyn DavMetaData>;
        async move { Ok(meta) }.boxed()
    }
}

impl DavMetaData for RepoDirEntry {
    fn len(&self) -> u64 {
        self.size
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.mtime)
    }

    fn created(&self) -> FsResult<SystemTime> {
        Ok(self.crtime)
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn etag(&self) -> Option<String> {
        Some(self.hash.clone())
    }
}

impl DavFile for RepoFile {
    fn metadata(&mut self) -> FsFuture<Box<dyn DavMetaData>> {
        async move {
            let tree = &*self.staged.lock().unwrap();
            let node = tree.get_node(self.node_id)?;
            Ok(Box::new(node.as_dirent(tree, self.node_id, b"")) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<()> {
        async move {
            self.write_slice(&buf)?;
            Ok(())
        }
        .boxed()
    }

    fn write_buf(&mut self, mut buf: Box<dyn Buf + Send>) -> FsFuture<()> {
        async move {
            while buf.has_remaining() {
                let chunk = buf.chunk();
                let n = chunk.len();
                self.write_slice(chunk)?;
                buf.advance(n);
            }
            Ok(())
        }
        .boxed()
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes> {
        async move {
            let tree = &*self.staged.lock().unwrap();
            let doc = tree.get_node(self.node_id)?.as_doc()?;
            let curlen = doc.data.len();
            let start = std::cmp::min(self.pos, curlen);
            let end = std::cmp::min(self.pos + count, curlen);
            self.pos = end;
            Ok(Bytes::copy_from_slice(&doc.data[start..end]))
        }
        .boxed()
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64> {
        async move {
            let (start, offset): (u64, i64) = match pos {
                SeekFrom::Start(npos) => {
                    self.pos = npos as usize;
                    return Ok(npos);
                },
                SeekFrom::Current(npos) => (self.pos as u64, npos),
                SeekFrom::End(npos) => {
                    let tree = &*self.staged.lock().unwrap();
                    let curlen = tree.get_node(self.node_id)?.as_doc()?.data.len() as u64;
                    (curlen, npos)
                },
            };
            if offset < 0 {
                if -offset as u64 > start {
                    return Err(FsError::GeneralFailure);
                }
                self.pos = (start - (-offset as u64)) as usize;
            } else {
                self.pos = (start + offset as u64) as usize;
            }
            Ok(self.pos as u64)
        }
        .boxed()
    }

    fn flush(&mut self) -> FsFuture<()> {
        async move { Ok(()) }.boxed()
    }
}

impl RepoFile {
    fn write_slice(&mut self, buf: &[u8]) -> FsResult<()> {
        let tree = &mut *self.staged.lock().unwrap();
        let node = tree.get_node_mut(self.node_id)?;
        let doc = node.as_doc_mut()?;
        let start = if self.append { doc.data.len() } else { self.pos };
        let end = start + buf.len();
        if end > doc.data.len() {
            doc.data.resize(end, 0);
        }
        doc.data[start..end].copy_from_slice(buf);
        self.pos = end;
        node.touch();
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }
}

trait TreeExt {
    fn lookup_segs(&self, segs: Vec<&[u8]>) -> FsResult<u64>;
    fn lookup(&self, path: &[u8]) -> FsResult<u64>;
    fn lookup_parent(&self, path: &[u8]) -> FsResult<u64>;
}

impl TreeExt for Tree {
    fn lookup_segs(&self, segs: Vec<&[u8]>) -> FsResult<u64> {
        let mut node_id = tree::ROOT_ID;
        for seg in segs.into_iter() {
            if !self.get_node(node_id)?.is_dir() {
                return Err(FsError::Forbidden);
            }
            node_id = self.get_child(node_id, seg)?;
        }
        Ok(node_id)
    }

    fn lookup(&self, path: &[u8]) -> FsResult<u64> {
        self.lookup_segs(path.split(|&c| c == b'/').filter(|s| !s.is_empty()).collect())
    }

    // pop the last segment off the path, look up the rest, and make
    // sure the result is a folder.
    fn lookup_parent(&self, path: &[u8]) -> FsResult<u64> {
        let mut segs: Vec<&[u8]> = path.split(|&c| c == b'/').filter(|s| !s.is_empty()).collect();
        segs.pop();
        let node_id = self.lookup_segs(segs)?;
        if !self.get_node(node_id)?.is_dir() {
            return Err(FsError::Forbidden);
        }
        Ok(node_id)
    }
}

// helper
fn file_name(path: &[u8]) -> Vec<u8> {
    path.split(|&c| c == b'/')
        .filter(|s| !s.is_empty())
        .next_back()
        .unwrap_or(b"")
        .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(fs: &RepoFs, readonly: bool) -> DavContext {
        DavContext {
            principal: None,
            batch:     fs.begin_batch(readonly).unwrap(),
        }
    }

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn batch_commit_publishes() {
        let fs = RepoFs::new();
        let wctx = ctx(&fs, false);
        fs.create_dir(&p("/d/"), &wctx).await.unwrap();
        let mut file = fs
            .open(
                &p("/d/x"),
                OpenOptions {
                    write: true,
                    create: true,
                    ..Default::default()
                },
                &wctx,
            )
            .await
            .unwrap();
        file.write_bytes(Bytes::from_static(b"hello")).await.unwrap();

        // not visible through a fresh batch until committed.
        let rctx = ctx(&fs, true);
        assert!(!fs.exists(&p("/d/x"), &rctx).await.unwrap());

        wctx.batch.as_ref().unwrap().commit().unwrap();
        let rctx = ctx(&fs, true);
        let meta = fs.metadata(&p("/d/x"), &rctx).await.unwrap();
        assert_eq!(meta.len(), 5);
    }

    #[tokio::test]
    async fn conflicting_commit_detected() {
        let fs = RepoFs::new();
        let c1 = ctx(&fs, false);
        let c2 = ctx(&fs, false);
        fs.create_dir(&p("/a/"), &c1).await.unwrap();
        fs.create_dir(&p("/b/"), &c2).await.unwrap();
        c1.batch.as_ref().unwrap().commit().unwrap();
        assert_eq!(c2.batch.as_ref().unwrap().commit(), Err(FsError::Conflict));
    }

    #[tokio::test]
    async fn content_hash_etag() {
        let fs = RepoFs::new();
        let wctx = ctx(&fs, false);
        let oo = OpenOptions {
            write: true,
            create: true,
            ..Default::default()
        };
        let mut f = fs.open(&p("/a"), oo, &wctx).await.unwrap();
        f.write_bytes(Bytes::from_static(b"same")).await.unwrap();
        let mut f = fs.open(&p("/b"), oo, &wctx).await.unwrap();
        f.write_bytes(Bytes::from_static(b"same")).await.unwrap();

        let ma = fs.metadata(&p("/a"), &wctx).await.unwrap();
        let mb = fs.metadata(&p("/b"), &wctx).await.unwrap();
        // same bytes, same content address.
        assert_eq!(ma.etag(), mb.etag());
    }
}
