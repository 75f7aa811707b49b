use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davhandler::DavInner;
use crate::davheaders;
use crate::errors::DavError;
use crate::fs::FsError;
use crate::DavResult;

impl DavInner {
    pub(crate) async fn handle_mkcol(self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut path = self.path(req);
        let meta = self.fs.metadata(&path, &self.ctx).await;

        let mut res = Response::new(Body::empty());

        // check the If and If-* headers.
        let meta_ref = meta.as_ref().ok().map(|m| &**m);
        let tokens =
            match if_match_get_tokens(req, meta_ref, &*self.fs, &self.ls, &self.ctx, &path).await {
                Ok(t) => t,
                Err(s) => return Err(DavError::Status(s)),
            };

        // if locked, check that we hold the lock.
        self.check_locks(&path, false, &tokens)?;

        match self.fs.create_dir(&path, &self.ctx).await {
            // RFC 4918 9.3.1 MKCOL Status Codes.
            Err(FsError::Exists) => Err(DavError::Status(SC::METHOD_NOT_ALLOWED)),
            Err(e @ FsError::NotFound) | Err(e @ FsError::Forbidden) => {
                if !self.has_parent(&path).await {
                    Err(DavError::Status(SC::CONFLICT))
                } else {
                    Err(DavError::FsError(e))
                }
            },
            Err(e) => Err(DavError::FsError(e)),
            Ok(()) => {
                if !path.is_collection() {
                    path.add_slash();
                    res.headers_mut()
                        .typed_insert(davheaders::ContentLocation(path.as_url_string_with_prefix()));
                }
                res.headers_mut().typed_insert(headers::ContentLength(0));
                *res.status_mut() = SC::CREATED;
                Ok(res)
            },
        }
    }
}
