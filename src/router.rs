//! Share resolution and the request pipeline.
//!
//! The router owns the mounted shares and the side services. For each
//! request it resolves the provider (longest matching share prefix,
//! with a root share as fallback), authenticates, opens the per-request
//! batch, dispatches to the method handlers, and commits or aborts the
//! batch depending on the outcome.
use std::sync::Arc;

use bytes::Buf;
use futures_util::StreamExt;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use log::{debug, info, log_enabled};

use crate::auth::{AuthOutcome, DomainController, HttpAuthenticator, SimpleDomainController};
use crate::body::Body;
use crate::config::{Config, ShareKind};
use crate::davhandler::{DavConfig, DavHandler};
use crate::davheaders;
use crate::davpath::DavPath;
use crate::fs::*;
use crate::localfs::LocalFs;
use crate::ls::DavLockSystem;
use crate::memls::MemLs;
use crate::propman::{DavPropManager, MemPm};
use crate::repofs::RepoFs;
use crate::rootfs::RootFs;
use crate::util::{dav_method, DavMethod};

/// A provider mounted at a share prefix.
struct MountedShare {
    /// "/" for the root share, "/name" otherwise.
    share:    String,
    provider: Box<dyn DavProvider>,
}

/// The router: the application object handed to the HTTP server.
#[derive(Clone)]
pub struct DavRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    // sorted by share length, longest first.
    shares:        Vec<MountedShare>,
    handler:       DavHandler,
    auth:          Option<HttpAuthenticator>,
    anon_options:  bool,
    mount_path:    String,
    verbose:       u8,
    debug_methods: Vec<String>,
    debug_litmus:  bool,
}

/// Builder for a [`DavRouter`].
#[derive(Default)]
pub struct DavRouterConfig {
    mount_path:    String,
    shares:        Vec<(String, Box<dyn DavProvider>)>,
    ls:            Option<Box<dyn DavLockSystem>>,
    pm:            Option<Box<dyn DavPropManager>>,
    auth:          Option<HttpAuthenticator>,
    anon_options:  bool,
    autoindex:     bool,
    verbose:       u8,
    debug_methods: Vec<String>,
    debug_litmus:  bool,
}

impl DavRouterConfig {
    /// URL prefix under which all shares are mounted.
    pub fn mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    /// Mount a provider. The share must be "/" or "/name".
    pub fn share(mut self, share: impl Into<String>, provider: Box<dyn DavProvider>) -> Self {
        self.shares.push((share.into(), provider));
        self
    }

    pub fn locksystem(mut self, ls: Box<dyn DavLockSystem>) -> Self {
        self.ls = Some(ls);
        self
    }

    pub fn propsystem(mut self, pm: Box<dyn DavPropManager>) -> Self {
        self.pm = Some(pm);
        self
    }

    pub fn authenticator(mut self, auth: HttpAuthenticator) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Serve OPTIONS without authentication (Windows interop).
    pub fn allow_anonymous_options(mut self, allow: bool) -> Self {
        self.anon_options = allow;
        self
    }

    /// Serve an HTML index for GET on collections.
    pub fn autoindex(mut self, enable: bool) -> Self {
        self.autoindex = enable;
        self
    }

    pub fn verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn build(self) -> DavRouter {
        let mut shares = self
            .shares
            .into_iter()
            .map(|(share, provider)| MountedShare { share, provider })
            .collect::<Vec<_>>();

        // no root provider configured: synthesize a collection that
        // lists the mounted share names.
        if !shares.iter().any(|s| s.share == "/") {
            let names = shares
                .iter()
                .map(|s| s.share.trim_start_matches('/').to_string())
                .collect::<Vec<_>>();
            shares.push(MountedShare {
                share:    "/".to_string(),
                provider: RootFs::new(names),
            });
        }

        // longest share first, so prefix matching picks the most
        // specific one.
        shares.sort_by(|a, b| b.share.len().cmp(&a.share.len()));

        let mut handler = DavHandler::builder().autoindex(self.autoindex);
        if let Some(ls) = self.ls {
            handler = handler.locksystem(ls);
        }
        if let Some(pm) = self.pm {
            handler = handler.propsystem(pm);
        }

        DavRouter {
            inner: Arc::new(RouterInner {
                shares,
                handler: handler.build_handler(),
                auth: self.auth,
                anon_options: self.anon_options,
                mount_path: self.mount_path,
                verbose: self.verbose,
                debug_methods: self.debug_methods,
                debug_litmus: self.debug_litmus,
            }),
        }
    }
}

impl DavRouter {
    /// Return a configuration builder.
    pub fn builder() -> DavRouterConfig {
        DavRouterConfig::default()
    }

    /// Build a router from a [`Config`].
    pub fn from_config(config: &Config) -> Result<DavRouter, String> {
        let mut builder = DavRouter::builder()
            .mount_path(config.mount_path.clone())
            .autoindex(config.dir_browser.enable)
            .verbose(config.verbose);
        builder.debug_methods = config
            .debug_methods
            .iter()
            .map(|m| m.to_uppercase())
            .collect();
        builder.debug_litmus = config.debug_litmus;

        for (share, sharecfg) in &config.shares {
            let provider: Box<dyn DavProvider> = match sharecfg.kind {
                ShareKind::Fs => {
                    let dir = sharecfg.directory.as_ref().ok_or("missing directory")?;
                    LocalFs::new(dir, sharecfg.read_only)
                },
                ShareKind::Repo => RepoFs::new(),
            };
            builder = builder.share(share.clone(), provider);
        }

        if config.locksmanager {
            let max = std::time::Duration::from_secs(config.max_lock_timeout);
            builder = builder.locksystem(MemLs::with_max_timeout(max));
        }
        if config.propsmanager {
            builder = builder.propsystem(MemPm::new());
        }

        if !config.user_mapping.is_empty() {
            let users = config
                .user_mapping
                .iter()
                .map(|(realm, users)| {
                    let users = users
                        .iter()
                        .map(|(name, u)| (name.clone(), u.password.clone()))
                        .collect();
                    (realm.clone(), users)
                })
                .collect();
            let dc: Arc<dyn DomainController> = Arc::new(SimpleDomainController::new(users));
            builder = builder
                .authenticator(HttpAuthenticator::new(
                    dc,
                    config.auth.acceptbasic,
                    config.auth.acceptdigest,
                    config.auth.defaultdigest,
                ))
                .allow_anonymous_options(config.auth.allow_anonymous_options);
        }

        Ok(builder.build())
    }

    /// Handle one request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send,
        ReqError: std::error::Error + Send + Sync + 'static,
        ReqBody: http_body::Body<Data = ReqData, Error = ReqError> + Send,
    {
        let inner = &*self.inner;

        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(_) => return plain_response(StatusCode::NOT_IMPLEMENTED),
        };
        let method_str = req.method().as_str().to_string();
        let uri_path = req.uri().path().to_string();

        self.boost_logging(&req, &method_str);

        // The `OPTIONS *` request is answered directly, without share
        // binding or authentication.
        if method == DavMethod::Options && req.uri().path() == "*" {
            return options_star();
        }

        // Normalize and validate the path. `..` escapes and encoding
        // errors are client errors.
        let path = match DavPath::new(req.uri().path()) {
            Ok(p) => p,
            Err(_) => return plain_response(StatusCode::BAD_REQUEST),
        };

        // Resolve the share.
        let (share_idx, prefix) = match self.resolve(&path) {
            Some(r) => r,
            None => return plain_response(StatusCode::NOT_FOUND),
        };
        let share = &inner.shares[share_idx];
        debug!("router: {} {} -> share {}", method_str, uri_path, share.share);

        // Authentication.
        let mut principal = None;
        if let Some(ref auth) = inner.auth {
            let skip = inner.anon_options && method == DavMethod::Options;
            if !skip {
                match auth.authenticate(&req, &share.share) {
                    AuthOutcome::Anonymous => {},
                    AuthOutcome::User { realm, username } => {
                        debug!("router: authenticated {} in realm {}", username, realm);
                        principal = Some(username);
                    },
                    AuthOutcome::Challenge(resp) => return *resp,
                }
            }
        }

        // A read-only provider refuses mutation outright.
        if method.is_write() && share.provider.is_read_only() {
            return plain_response(StatusCode::FORBIDDEN);
        }

        // Bind a batch to the request.
        let readonly = !method.is_write();
        let batch = match share.provider.begin_batch(readonly) {
            Ok(b) => b,
            Err(_) => return plain_response(StatusCode::INTERNAL_SERVER_ERROR),
        };

        // COPY/MOVE whose destination lives in another share cannot be
        // done by the provider; stream through both of them here.
        if method == DavMethod::Copy || method == DavMethod::Move {
            if let Some(dest) = req.headers().typed_get::<davheaders::Destination>() {
                if let Ok(dpath) = DavPath::new(&dest.0) {
                    if let Some((dest_idx, dest_prefix)) = self.resolve(&dpath) {
                        if dest_idx != share_idx {
                            let mut resp = self
                                .cross_share_copymove(
                                    &req,
                                    method,
                                    share_idx,
                                    &prefix,
                                    batch.clone(),
                                    dest_idx,
                                    &dest_prefix,
                                    principal.clone(),
                                )
                                .await;
                            if let Err(e) = self.finish_batch(&batch, resp.status()) {
                                resp = plain_response(crate::errors::fserror_to_status(e));
                            }
                            add_date(&mut resp);
                            self.log_request(&method_str, &uri_path, resp.status(), &principal);
                            return resp;
                        }
                    }
                }
            }
        }

        // Dispatch.
        let mut config = DavConfig::new()
            .strip_prefix(prefix)
            .provider(share.provider.clone());
        if let Some(p) = principal.clone() {
            config = config.principal(p);
        }
        if let Some(ref b) = batch {
            config = config.batch(b.clone());
        }
        let mut resp = inner.handler.handle_with(config, req).await;

        // Commit or abort.
        if let Err(e) = self.finish_batch(&batch, resp.status()) {
            resp = plain_response(crate::errors::fserror_to_status(e));
        }

        add_date(&mut resp);
        self.log_request(&method_str, &uri_path, resp.status(), &principal);
        resp
    }

    // commit the batch when the request went through, abort otherwise.
    fn finish_batch(&self, batch: &Option<Arc<dyn DavBatch>>, status: StatusCode) -> FsResult<()> {
        if let Some(b) = batch {
            // 207 counts as success here: partial DELETE failures must
            // leave the successfully removed part removed.
            if status.is_success() || status.is_redirection() {
                b.commit()?;
            } else {
                b.abort();
            }
        }
        Ok(())
    }

    // find the mounted share for a normalized path. Returns the index
    // and the prefix to strip (mount path + share).
    fn resolve(&self, path: &DavPath) -> Option<(usize, String)> {
        let inner = &*self.inner;
        let full = path.as_bytes_with_prefix();

        // strip the mount path.
        let mount = inner.mount_path.as_bytes();
        if !full.starts_with(mount) {
            return None;
        }
        let rest = &full[mount.len()..];
        if !rest.is_empty() && rest[0] != b'/' {
            return None;
        }

        // longest matching share wins; "/" sorts last and catches the rest.
        for (idx, share) in inner.shares.iter().enumerate() {
            let s = share.share.as_bytes();
            if s == b"/" {
                return Some((idx, inner.mount_path.clone()));
            }
            if rest.starts_with(s) && (rest.len() == s.len() || rest[s.len()] == b'/') {
                let prefix = format!("{}{}", inner.mount_path, share.share);
                return Some((idx, prefix));
            }
        }
        None
    }

    fn boost_logging<B>(&self, req: &Request<B>, method: &str) {
        let inner = &*self.inner;
        if inner.debug_methods.iter().any(|m| m == method) {
            info!("== {} {}", method, req.uri());
        } else if inner.debug_litmus {
            if let Some(t) = req.headers().typed_get::<davheaders::XLitmus>() {
                info!("== X-Litmus: {}: {} {}", t.0, method, req.uri());
            }
        }
    }

    fn log_request(&self, method: &str, path: &str, status: StatusCode, principal: &Option<String>) {
        if self.inner.verbose >= 1 && log_enabled!(log::Level::Info) {
            let user = principal.as_deref().unwrap_or("(anonymous)");
            info!("{} - \"{} {}\" -> {}", user, method, path, status.as_u16());
        }
    }

    // Streaming COPY/MOVE between two different providers.
    #[allow(clippy::too_many_arguments)]
    async fn cross_share_copymove<ReqBody, ReqData, ReqError>(
        &self,
        req: &Request<ReqBody>,
        method: DavMethod,
        src_idx: usize,
        src_prefix: &str,
        src_batch: Option<Arc<dyn DavBatch>>,
        dest_idx: usize,
        dest_prefix: &str,
        principal: Option<String>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send,
        ReqError: std::error::Error + Send + Sync + 'static,
        ReqBody: http_body::Body<Data = ReqData, Error = ReqError> + Send,
    {
        let inner = &*self.inner;
        let src = &inner.shares[src_idx];
        let dest_share = &inner.shares[dest_idx];

        if dest_share.provider.is_read_only() {
            return plain_response(StatusCode::FORBIDDEN);
        }

        let overwrite = req
            .headers()
            .typed_get::<davheaders::Overwrite>()
            .map_or(true, |o| o.0);
        let depth = match req.headers().typed_get::<davheaders::Depth>() {
            Some(davheaders::Depth::Infinity) | None => davheaders::Depth::Infinity,
            Some(davheaders::Depth::Zero) if method == DavMethod::Copy => davheaders::Depth::Zero,
            _ => return plain_response(StatusCode::BAD_REQUEST),
        };
        let dest_hdr = match req.headers().typed_get::<davheaders::Destination>() {
            Some(d) => d,
            None => return plain_response(StatusCode::BAD_REQUEST),
        };

        let mut spath = match DavPath::from_uri_and_prefix(req.uri(), src_prefix) {
            Ok(p) => p,
            Err(_) => return plain_response(StatusCode::BAD_REQUEST),
        };
        let mut dpath = match DavPath::from_str_and_prefix(&dest_hdr.0, dest_prefix) {
            Ok(p) => p,
            Err(_) => return plain_response(StatusCode::BAD_GATEWAY),
        };

        let sctx = DavContext {
            principal: principal.clone(),
            batch:     src_batch,
        };
        let dbatch = match dest_share.provider.begin_batch(false) {
            Ok(b) => b,
            Err(_) => return plain_response(StatusCode::INTERNAL_SERVER_ERROR),
        };
        let dctx = DavContext {
            principal,
            batch: dbatch.clone(),
        };

        let smeta = match src.provider.metadata(&spath, &sctx).await {
            Ok(m) => m,
            Err(e) => return plain_response(crate::errors::fserror_to_status(e)),
        };
        spath.add_slash_if(smeta.is_dir());
        dpath.add_slash_if(smeta.is_dir());

        let dexists = dest_share.provider.metadata(&dpath, &dctx).await.is_ok();
        if dexists && !overwrite {
            return plain_response(StatusCode::PRECONDITION_FAILED);
        }
        if !dexists {
            // parent of the destination must exist.
            let dparent = dpath.parent();
            let ok = dest_share
                .provider
                .metadata(&dparent, &dctx)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !ok {
                return plain_response(StatusCode::CONFLICT);
            }
        }
        if dexists {
            if let Err(e) = remove_tree(&*dest_share.provider, &dctx, &dpath).await {
                return plain_response(crate::errors::fserror_to_status(e));
            }
        }

        if let Err(e) = copy_tree(
            &*src.provider,
            &sctx,
            &spath,
            &*dest_share.provider,
            &dctx,
            &dpath,
            depth == davheaders::Depth::Infinity,
        )
        .await
        {
            debug!("cross_share_copymove: copy failed: {:?}", e);
            if let Some(ref b) = dbatch {
                b.abort();
            }
            // MOVE keeps the source intact on failure.
            return plain_response(crate::errors::fserror_to_status(e));
        }

        // dead properties travel along.
        if let Some(pm) = self.propsystem() {
            match method {
                DavMethod::Move => {
                    pm.move_properties(&spath, &dpath, smeta.is_dir()).ok();
                },
                _ => {
                    pm.copy_properties(&spath, &dpath).ok();
                },
            }
        }

        if method == DavMethod::Move {
            if let Err(e) = remove_tree(&*src.provider, &sctx, &spath).await {
                if let Some(ref b) = dbatch {
                    b.abort();
                }
                return plain_response(crate::errors::fserror_to_status(e));
            }
            if let Some(ls) = self.locksystem() {
                ls.delete(&spath).ok();
            }
        }

        if let Some(b) = dbatch {
            if b.commit().is_err() {
                return plain_response(StatusCode::CONFLICT);
            }
        }

        let status = if dexists {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        plain_response(status)
    }

    /// Spawn a background tick that eagerly drops expired locks.
    /// (Lazy expiry works regardless; this just keeps the table tidy.)
    pub fn spawn_lock_sweeper(&self, interval: std::time::Duration) {
        if let Some(ls) = self.locksystem() {
            let ls = ls.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tick.tick().await;
                    ls.sweep_expired();
                }
            });
        }
    }

    fn locksystem(&self) -> Option<&Box<dyn DavLockSystem>> {
        self.inner.handler.config_ls()
    }

    fn propsystem(&self) -> Option<&Box<dyn DavPropManager>> {
        self.inner.handler.config_pm()
    }
}

// recursively remove a subtree through a provider.
fn remove_tree<'a>(
    fs: &'a dyn DavProvider,
    ctx: &'a DavContext,
    path: &'a DavPath,
) -> futures_util::future::BoxFuture<'a, FsResult<()>>
{
    use futures_util::FutureExt;
    async move {
        let meta = fs.metadata(path, ctx).await?;
        if !meta.is_dir() {
            return fs.remove_file(path, ctx).await;
        }
        let mut entries = fs.read_dir(path, ctx).await?;
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let meta = entry.metadata().await?;
            let mut npath = path.clone();
            npath.push_segment(&entry.name());
            npath.add_slash_if(meta.is_dir());
            remove_tree(fs, ctx, &npath).await?;
        }
        fs.remove_dir(path, ctx).await
    }
    .boxed()
}

// recursively copy a subtree from one provider to another, streaming
// document bodies.
fn copy_tree<'a>(
    sfs: &'a dyn DavProvider,
    sctx: &'a DavContext,
    spath: &'a DavPath,
    dfs: &'a dyn DavProvider,
    dctx: &'a DavContext,
    dpath: &'a DavPath,
    recurse: bool,
) -> futures_util::future::BoxFuture<'a, FsResult<()>>
{
    use futures_util::FutureExt;
    async move {
        let meta = sfs.metadata(spath, sctx).await?;
        if meta.is_dir() {
            dfs.create_dir(dpath, dctx).await?;
            if !recurse {
                return Ok(());
            }
            let mut entries = sfs.read_dir(spath, sctx).await?;
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                let emeta = entry.metadata().await?;
                let mut nsrc = spath.clone();
                let mut ndest = dpath.clone();
                nsrc.push_segment(&entry.name());
                ndest.push_segment(&entry.name());
                nsrc.add_slash_if(emeta.is_dir());
                ndest.add_slash_if(emeta.is_dir());
                copy_tree(sfs, sctx, &nsrc, dfs, dctx, &ndest, recurse).await?;
            }
            return Ok(());
        }

        let mut reader = sfs.open(spath, OpenOptions::read(), sctx).await?;
        let mut oo = OpenOptions::write();
        oo.create = true;
        oo.truncate = true;
        let mut writer = dfs.open(dpath, oo, dctx).await?;
        loop {
            let buf = reader.read_bytes(65536).await?;
            if buf.is_empty() {
                break;
            }
            writer.write_bytes(buf).await?;
        }
        writer.flush().await
    }
    .boxed()
}

fn add_date(resp: &mut Response<Body>) {
    if !resp.headers().contains_key(http::header::DATE) {
        resp.headers_mut()
            .typed_insert(headers::Date::from(std::time::SystemTime::now()));
    }
}

fn plain_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-length", "0")
        .body(Body::empty())
        .unwrap()
}

fn options_star() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("DAV", "1,2")
        .header("MS-Author-Via", "DAV")
        .header(
            "Allow",
            "OPTIONS,GET,HEAD,PUT,DELETE,MKCOL,PROPFIND,PROPPATCH,COPY,MOVE,LOCK,UNLOCK",
        )
        .header("content-length", "0")
        .body(Body::empty())
        .unwrap()
}
