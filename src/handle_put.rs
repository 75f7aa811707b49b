use std::error::Error as StdError;

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};
use log::{debug, error};

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davhandler::DavInner;
use crate::davheaders;
use crate::errors::DavError;
use crate::fs::*;
use crate::DavResult;

impl DavInner {
    pub(crate) async fn handle_put<ReqBody, ReqError>(
        self,
        req: &Request<()>,
        body: ReqBody,
    ) -> DavResult<Response<Body>>
    where
        ReqBody: Stream<Item = Result<Bytes, ReqError>> + Send,
        ReqError: StdError + Send + Sync + 'static,
    {
        let mut count = 0;
        let mut have_count = false;

        let mut oo = OpenOptions::write();
        oo.create = true;
        oo.truncate = true;

        if let Some(n) = req.headers().typed_get::<headers::ContentLength>() {
            count = n.0;
            have_count = true;
            oo.size = Some(count);
        } else if let Some(n) = req
            .headers()
            .get("X-Expected-Entity-Length")
            .and_then(|v| v.to_str().ok())
        {
            // macOS Finder streams the body with chunked encoding and
            // sends the length in this header instead.
            if let Ok(len) = n.parse() {
                count = len;
                have_count = true;
                oo.size = Some(count);
            }
        }

        let path = self.path(req);
        let meta = self.fs.metadata(&path, &self.ctx).await;

        // close connection on error.
        let mut res = Response::new(Body::empty());
        res.headers_mut().typed_insert(headers::Connection::close());

        // PUT on an existing collection is not allowed.
        if meta.as_ref().map(|m| m.is_dir()).unwrap_or(false) {
            return Err(DavError::StatusClose(SC::METHOD_NOT_ALLOWED));
        }

        // the parent collection must exist.
        if !self.has_parent(&path).await {
            return Err(DavError::StatusClose(SC::CONFLICT));
        }

        // check the If and If-* headers.
        let meta_ref = meta.as_ref().ok().map(|m| &**m);
        let tokens =
            match if_match_get_tokens(req, meta_ref, &*self.fs, &self.ls, &self.ctx, &path).await {
                Ok(t) => t,
                Err(s) => return Err(DavError::StatusClose(s)),
            };

        // if the path is locked, the lock tokens must be submitted.
        self.check_locks(&path, false, &tokens)?;

        // tweak open options.
        if req
            .headers()
            .typed_get::<davheaders::IfMatch>()
            .map_or(false, |h| h.0 == davheaders::ETagList::Star)
        {
            oo.create = false;
        }
        if req
            .headers()
            .typed_get::<davheaders::IfNoneMatch>()
            .map_or(false, |h| h.0 == davheaders::ETagList::Star)
        {
            oo.create_new = true;
        }

        let created = meta.is_err();
        let mut file = match self.fs.open(&path, oo, &self.ctx).await {
            Ok(f) => f,
            Err(FsError::NotFound) | Err(FsError::Exists) => {
                let s = if !oo.create || oo.create_new {
                    SC::PRECONDITION_FAILED
                } else {
                    SC::CONFLICT
                };
                return Err(DavError::StatusClose(s));
            },
            Err(e) => return Err(DavError::FsError(e)),
        };

        res.headers_mut().typed_insert(headers::AcceptRanges::bytes());

        // loop, read body, write to file.
        let mut total = 0u64;
        let mut body = Box::pin(body);
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(_) => {
                    // client went away or the stream broke: abort the
                    // write, leave no partial resource behind.
                    error!("PUT: body stream error, aborting write");
                    drop(file);
                    if created {
                        self.fs.remove_file(&path, &self.ctx).await.ok();
                    }
                    return Err(DavError::StatusClose(SC::INTERNAL_SERVER_ERROR));
                },
            };
            total += chunk.len() as u64;
            // consistency check.
            if have_count && total > count {
                break;
            }
            file.write_bytes(chunk).await?;
        }
        file.flush().await?;

        if have_count && total != count {
            if total > count {
                error!("PUT: sender is sending more bytes than expected");
            } else {
                error!("PUT: premature EOF on input");
            }
            drop(file);
            if created {
                self.fs.remove_file(&path, &self.ctx).await.ok();
            }
            return Err(DavError::StatusClose(SC::BAD_REQUEST));
        }

        // report whether we created or updated the file.
        *res.status_mut() = if created {
            res.headers_mut().typed_insert(headers::ContentLength(0));
            SC::CREATED
        } else {
            SC::NO_CONTENT
        };

        // no errors, connection may be kept open.
        res.headers_mut().remove(http::header::CONNECTION);

        if let Ok(m) = file.metadata().await {
            if let Some(etag) = davheaders::ETag::from_meta(&*m) {
                res.headers_mut().typed_insert(etag);
            }
            if let Ok(modified) = m.modified() {
                res.headers_mut()
                    .typed_insert(headers::LastModified::from(modified));
            }
        }
        debug!("PUT: {} bytes to {}", total, path);
        Ok(res)
    }
}
