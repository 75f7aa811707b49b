use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};
use log::{debug, trace};

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davhandler::DavInner;
use crate::davheaders::Depth;
use crate::davpath::DavPath;
use crate::errors::{fserror_to_status, DavError};
use crate::fs::*;
use crate::multierror::MultiError;
use crate::DavResult;

impl DavInner {
    pub(crate) fn delete_items<'a>(
        &'a self,
        res: &'a mut MultiError,
        depth: Depth,
        meta: Box<dyn DavMetaData>,
        path: &'a DavPath,
    ) -> BoxFuture<'a, DavResult<()>>
    {
        async move {
            if !meta.is_dir() {
                trace!("delete_items (file) {} {:?}", path, depth);
                match self.fs.remove_file(path, &self.ctx).await {
                    Ok(()) => {
                        self.remove_dead_props(path, false);
                        Ok(())
                    },
                    Err(e) => {
                        res.add_status(path, fserror_to_status(e));
                        Err(DavError::Status(fserror_to_status(e)))
                    },
                }
            } else if depth == Depth::Zero {
                trace!("delete_items (dir) {} {:?}", path, depth);
                match self.fs.remove_dir(path, &self.ctx).await {
                    Ok(()) => {
                        self.remove_dead_props(path, false);
                        Ok(())
                    },
                    Err(e) => {
                        let status = dir_status(e);
                        res.add_status(path, status);
                        Err(DavError::Status(status))
                    },
                }
            } else {
                // walk over all entries.
                trace!("delete_items (recurse) {} {:?}", path, depth);
                let mut entries = match self.fs.read_dir(path, &self.ctx).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        res.add_status(path, fserror_to_status(e));
                        return Err(DavError::Status(fserror_to_status(e)));
                    },
                };

                let mut result = Ok(());
                while let Some(dirent) = entries.next().await {
                    // if metadata() fails, skip to the next entry.
                    let (dirent, meta) = match dirent {
                        Ok(dirent) => {
                            match dirent.metadata().await {
                                Ok(meta) => (dirent, meta),
                                Err(e) => {
                                    result = Err(DavError::Status(fserror_to_status(e)));
                                    continue;
                                },
                            }
                        },
                        Err(e) => {
                            result = Err(DavError::Status(fserror_to_status(e)));
                            continue;
                        },
                    };

                    let mut npath = path.clone();
                    npath.push_segment(&dirent.name());
                    npath.add_slash_if(meta.is_dir());

                    // do the actual work. If this fails with a non-fs
                    // related error, return immediately.
                    if let Err(e) = self.delete_items(res, depth, meta, &npath).await {
                        match e {
                            DavError::Status(_) => {
                                result = Err(e);
                                continue;
                            },
                            _ => return Err(e),
                        }
                    }
                }

                // if we got any error, return with the error, and do not
                // try to remove the collection itself.
                result?;

                match self.fs.remove_dir(path, &self.ctx).await {
                    Ok(()) => {
                        self.remove_dead_props(path, false);
                        Ok(())
                    },
                    Err(e) => {
                        let status = dir_status(e);
                        res.add_status(path, status);
                        Err(DavError::Status(status))
                    },
                }
            }
        }
        .boxed()
    }

    // forget the dead properties of a removed resource.
    fn remove_dead_props(&self, path: &DavPath, with_children: bool) {
        if let Some(ref pm) = self.pm {
            pm.remove_properties(path, with_children).ok();
        }
    }

    pub(crate) async fn handle_delete(self, req: &Request<()>) -> DavResult<Response<Body>> {
        let depth = req.headers().typed_get::<Depth>();

        let mut path = self.path(req);
        let meta = self.fs.metadata(&path, &self.ctx).await?;
        path.add_slash_if(meta.is_dir());

        // RFC 4918 9.6.1: DELETE on a collection acts as if
        // "Depth: infinity" was used; a Depth of 0 is an error.
        let depth = match depth {
            Some(Depth::Infinity) | None => Depth::Infinity,
            Some(Depth::Zero) if !meta.is_dir() => Depth::Infinity,
            _ => return Err(DavError::Status(SC::BAD_REQUEST)),
        };

        // check the If and If-* headers.
        let tokens =
            match if_match_get_tokens(req, Some(&*meta), &*self.fs, &self.ls, &self.ctx, &path).await
            {
                Ok(t) => t,
                Err(s) => return Err(DavError::Status(s)),
            };

        // since we cancel the entire operation on a conflicting lock,
        // this is a simple status instead of a 207.
        self.check_locks(&path, true, &tokens)?;

        let mut multierror = MultiError::new(&path);

        match self.delete_items(&mut multierror, depth, meta, &path).await {
            Ok(()) => {
                // the subtree is gone: drop the locks rooted in it and
                // any dead properties that were left behind.
                if let Some(ref locksystem) = self.ls {
                    locksystem.delete(&path).ok();
                }
                self.remove_dead_props(&path, true);
                debug!("DELETE done {}", path);
                multierror.finalstatus(&path, SC::NO_CONTENT)
            },
            Err(e) => {
                if multierror.is_empty() {
                    Err(e)
                } else {
                    multierror.close()
                }
            },
        }
    }
}

// directory-removal statuscode mapping is not 100% the same.
fn dir_status(e: FsError) -> SC {
    match e {
        FsError::Exists => SC::CONFLICT,
        e => fserror_to_status(e),
    }
}
