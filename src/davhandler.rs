//! Per-share request handler.
//!
//! A `DavHandler` is built once per share from a `DavConfig` and
//! dispatches a single request to the right method handler. The router
//! in `router.rs` resolves the share, opens the batch, and calls
//! `handle_with` with the per-request overrides (principal, batch).
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use futures_util::stream::{Stream, StreamExt};
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use log::{debug, trace};

use crate::body::{Body, InBody};
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::fs::*;
use crate::ls::DavLockSystem;
use crate::propman::DavPropManager;
use crate::util::{dav_condition_body, dav_method, DavMethod, DavMethodSet};
use crate::DavResult;

/// The webdav handler struct.
///
/// Not much more than a wrapper around the configuration, the `handle`
/// and `handle_with` methods do the actual work.
#[derive(Clone)]
pub struct DavHandler {
    config: Arc<DavConfig>,
}

/// Configuration of the handler.
#[derive(Default)]
pub struct DavConfig {
    /// Prefix to be stripped off when handling the request (mount path + share).
    pub prefix:    Option<String>,
    /// The resource backend.
    pub fs:        Option<Box<dyn DavProvider>>,
    /// Lock manager.
    pub ls:        Option<Box<dyn DavLockSystem>>,
    /// Dead-property manager.
    pub pm:        Option<Box<dyn DavPropManager>>,
    /// Set of allowed methods (None means all).
    pub allow:     Option<DavMethodSet>,
    /// Principal is webdav-speak for "user".
    pub principal: Option<String>,
    /// Per-request batch, bound by the router.
    pub batch:     Option<Arc<dyn DavBatch>>,
    /// Serve an HTML index for GET on a collection.
    pub autoindex: Option<bool>,
}

impl DavConfig {
    /// Create a new configuration builder.
    pub fn new() -> DavConfig {
        DavConfig::default()
    }

    /// Use the configuration that was built to generate a DavHandler.
    pub fn build_handler(self) -> DavHandler {
        DavHandler {
            config: Arc::new(self),
        }
    }

    /// Prefix to be stripped off before translating the rest of the
    /// request path to an in-share path.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the provider to use.
    pub fn provider(mut self, fs: Box<dyn DavProvider>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Set the lock manager to use.
    pub fn locksystem(mut self, ls: Box<dyn DavLockSystem>) -> Self {
        self.ls = Some(ls);
        self
    }

    /// Set the dead-property manager to use.
    pub fn propsystem(mut self, pm: Box<dyn DavPropManager>) -> Self {
        self.pm = Some(pm);
        self
    }

    /// Which methods to allow (default is all).
    pub fn allow_methods(mut self, allow: DavMethodSet) -> Self {
        self.allow = Some(allow);
        self
    }

    /// Set the name of the "webdav principal". Locks get this owner.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Bind a per-request batch.
    pub fn batch(mut self, batch: Arc<dyn DavBatch>) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Enable the HTML directory index for GET on collections.
    pub fn autoindex(mut self, enable: bool) -> Self {
        self.autoindex = Some(enable);
        self
    }
}

// The actual inner struct. Created from the config at the start of
// each request.
pub(crate) struct DavInner {
    pub prefix:    String,
    pub fs:        Box<dyn DavProvider>,
    pub ls:        Option<Box<dyn DavLockSystem>>,
    pub pm:        Option<Box<dyn DavPropManager>>,
    pub allow:     Option<DavMethodSet>,
    pub ctx:       DavContext,
    pub autoindex: bool,
}

impl From<&DavConfig> for DavInner {
    fn from(cfg: &DavConfig) -> Self {
        DavInner {
            prefix:    cfg.prefix.clone().unwrap_or_default(),
            fs:        cfg.fs.clone().unwrap(),
            ls:        cfg.ls.clone(),
            pm:        cfg.pm.clone(),
            allow:     cfg.allow,
            ctx:       DavContext {
                principal: cfg.principal.clone(),
                batch:     cfg.batch.clone(),
            },
            autoindex: cfg.autoindex.unwrap_or(false),
        }
    }
}

impl DavHandler {
    /// Return a configuration builder.
    pub fn builder() -> DavConfig {
        DavConfig::new()
    }

    // side-service accessors for the router.
    pub(crate) fn config_ls(&self) -> Option<&Box<dyn DavLockSystem>> {
        self.config.ls.as_ref()
    }

    pub(crate) fn config_pm(&self) -> Option<&Box<dyn DavPropManager>> {
        self.config.pm.as_ref()
    }

    /// Handle a webdav request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: http_body::Body<Data = ReqData, Error = ReqError> + Send,
    {
        if self.config.fs.is_none() {
            return notfound();
        }
        let inner = DavInner::from(&*self.config);
        inner.handle(req).await
    }

    /// Handle a webdav request, overriding parts of the config.
    ///
    /// The router uses this to set the resolved share's provider, the
    /// authenticated principal and the per-request batch.
    pub async fn handle_with<ReqBody, ReqData, ReqError>(
        &self,
        config: DavConfig,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: http_body::Body<Data = ReqData, Error = ReqError> + Send,
    {
        let orig = &*self.config;
        let newconf = DavConfig {
            prefix:    config.prefix.or_else(|| orig.prefix.clone()),
            fs:        config.fs.or_else(|| orig.fs.clone()),
            ls:        config.ls.or_else(|| orig.ls.clone()),
            pm:        config.pm.or_else(|| orig.pm.clone()),
            allow:     config.allow.or(orig.allow),
            principal: config.principal.or_else(|| orig.principal.clone()),
            batch:     config.batch.or_else(|| orig.batch.clone()),
            autoindex: config.autoindex.or(orig.autoindex),
        };
        if newconf.fs.is_none() {
            return notfound();
        }
        let inner = DavInner::from(&newconf);
        inner.handle(req).await
    }
}

fn notfound() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("content-length", "0")
        .body(Body::empty())
        .unwrap()
}

impl DavInner {
    // helper.
    pub(crate) async fn has_parent<'a>(&'a self, path: &'a DavPath) -> bool {
        let p = path.parent();
        self.fs
            .metadata(&p, &self.ctx)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    // helper.
    pub(crate) fn path(&self, req: &Request<()>) -> DavPath {
        // This never fails, it has been checked before dispatch.
        DavPath::from_uri_and_prefix(req.uri(), &self.prefix).unwrap()
    }

    // See if this is a collection and if so, fix up the path by adding
    // a slash at the end.
    pub(crate) fn fixpath(
        &self,
        res: &mut Response<Body>,
        path: &mut DavPath,
        meta: Box<dyn DavMetaData>,
    ) -> Box<dyn DavMetaData>
    {
        if meta.is_dir() && !path.is_collection() {
            path.add_slash();
            let newloc = path.as_url_string_with_prefix();
            res.headers_mut()
                .typed_insert(davheaders::ContentLocation(newloc));
        }
        meta
    }

    // verify that the locks covering `path` were all submitted.
    pub(crate) fn check_locks(&self, path: &DavPath, deep: bool, tokens: &[String]) -> DavResult<()> {
        if let Some(ref locksystem) = self.ls {
            let t = tokens.iter().map(|s| s.as_str()).collect::<Vec<&str>>();
            let principal = self.ctx.principal.as_deref();
            if let Err(lock) = locksystem.check(path, principal, false, deep, t) {
                return Err(DavError::Condition(crate::errors::DavCondition {
                    status:  StatusCode::LOCKED,
                    element: "lock-token-submitted",
                    href:    Some(lock.path.as_url_string_with_prefix()),
                }));
            }
        }
        Ok(())
    }

    // drain the request body into a Vec, bounded.
    pub(crate) async fn read_request<ReqBody, ReqError>(
        &self,
        body: ReqBody,
        max_size: usize,
    ) -> DavResult<Vec<u8>>
    where
        ReqBody: Stream<Item = Result<Bytes, ReqError>> + Send,
        ReqError: StdError + Send + Sync + 'static,
    {
        let mut data = Vec::new();
        let mut body = Box::pin(body);
        while let Some(res) = body.next().await {
            let chunk = res.map_err(|_| {
                DavError::IoError(io::Error::new(io::ErrorKind::UnexpectedEof, "UnexpectedEof"))
            })?;
            if data.len() + chunk.len() > max_size {
                return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    // dispatcher: turns errors into HTTP error responses.
    pub(crate) async fn handle<ReqBody, ReqData, ReqError>(self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: http_body::Body<Data = ReqData, Error = ReqError> + Send,
    {
        let is_ms = req
            .headers()
            .get("user-agent")
            .and_then(|s| s.to_str().ok())
            .map(|s| s.contains("Microsoft"))
            .unwrap_or(false);

        let (req, body) = {
            let (parts, body) = req.into_parts();
            (Request::from_parts(parts, ()), InBody::from(body))
        };

        match self.handle2(&req, body).await {
            Ok(resp) => {
                debug!("== END REQUEST result OK");
                resp
            },
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                let mut resp = Response::builder();
                if is_ms && err.statuscode() == StatusCode::NOT_FOUND {
                    // Windows caches a 404 case-insensitively for 30-60
                    // seconds, which breaks "dir www" after "dir WWW".
                    // Try to convince it not to.
                    resp = resp.header("Cache-Control", "no-store, no-cache, must-revalidate");
                    resp = resp.header("Progma", "no-cache");
                    resp = resp.header("Expires", "0");
                    resp = resp.header("Vary", "*");
                }
                if err.must_close() {
                    resp = resp.header("connection", "close");
                }
                let body = match err {
                    DavError::Condition(ref c) => {
                        resp = resp.header("content-type", "application/xml; charset=utf-8");
                        dav_condition_body(c.element, c.href.as_deref())
                    },
                    _ => {
                        resp = resp.header("content-length", "0");
                        Body::empty()
                    },
                };
                resp.status(err.statuscode()).body(body).unwrap()
            },
        }
    }

    // the actual dispatcher.
    async fn handle2<ReqBody, ReqError>(self, req: &Request<()>, body: ReqBody) -> DavResult<Response<Body>>
    where
        ReqBody: Stream<Item = Result<Bytes, ReqError>> + Send,
        ReqError: StdError + Send + Sync + 'static,
    {
        // debug when running the webdav litmus tests.
        if log::log_enabled!(log::Level::Debug) {
            if let Some(t) = req.headers().typed_get::<davheaders::XLitmus>() {
                debug!("X-Litmus: {}", t.0);
            }
        }

        // translate HTTP method to Webdav method.
        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", req.method(), req.uri());
                return Err(e);
            },
        };

        // see if method is allowed.
        if let Some(ref a) = self.allow {
            if !a.contains(method) {
                debug!("method {} not allowed on request {}", req.method(), req.uri());
                return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
            }
        }

        // make sure the request path is valid.
        let path = DavPath::from_uri_and_prefix(req.uri(), &self.prefix)?;

        // PUT is the only handler that reads the body itself. All the
        // other handlers either expect no body, or a pre-read Vec<u8>.
        let (body_strm, body_data) = match method {
            DavMethod::Put => (Some(body), Vec::new()),
            _ => (None, self.read_request(body, 65536).await?),
        };

        // Not all methods accept a body.
        match method {
            DavMethod::Put | DavMethod::PropFind | DavMethod::PropPatch | DavMethod::Lock => {},
            _ => {
                if !body_data.is_empty() {
                    return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
                }
            },
        }

        debug!("== START REQUEST {:?} {}", method, path);
        trace!("principal = {:?}", self.ctx.principal);

        match method {
            DavMethod::Options => self.handle_options(req).await,
            DavMethod::PropFind => self.handle_propfind(req, &body_data).await,
            DavMethod::PropPatch => self.handle_proppatch(req, &body_data).await,
            DavMethod::MkCol => self.handle_mkcol(req).await,
            DavMethod::Delete => self.handle_delete(req).await,
            DavMethod::Lock => self.handle_lock(req, &body_data).await,
            DavMethod::Unlock => self.handle_unlock(req).await,
            DavMethod::Head | DavMethod::Get => self.handle_get(req).await,
            DavMethod::Put => self.handle_put(req, body_strm.unwrap()).await,
            DavMethod::Copy | DavMethod::Move => self.handle_copymove(req, method).await,
        }
    }
}
