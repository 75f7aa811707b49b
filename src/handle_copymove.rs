use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};
use log::{debug, trace};

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davhandler::DavInner;
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::{fserror_to_status, DavError};
use crate::fs::*;
use crate::multierror::MultiError;
use crate::util::DavMethod;
use crate::DavResult;

impl DavInner {
    fn do_copy<'a>(
        &'a self,
        source: &'a DavPath,
        topdest: &'a DavPath,
        dest: &'a DavPath,
        depth: Depth,
        multierror: &'a mut MultiError,
    ) -> BoxFuture<'a, FsResult<()>>
    {
        async move {
            trace!("do_copy {} {} depth {:?}", source, dest, depth);

            // when doing "COPY /a/b /a/b/c" make sure we don't
            // recursively copy /a/b/c/ into /a/b/c.
            if source == topdest {
                return Ok(());
            }

            // source must exist.
            let meta = match self.fs.metadata(source, &self.ctx).await {
                Err(e) => {
                    multierror.add_status(source, fserror_to_status(e));
                    return Err(e);
                },
                Ok(m) => m,
            };

            // if it's a file we can overwrite it.
            if !meta.is_dir() {
                if let Err(e) = self.fs.copy(source, dest, &self.ctx).await {
                    debug!("do_copy: copy error: {:?}", e);
                    multierror.add_status(dest, fserror_to_status(e));
                    return Err(e);
                }
                self.copy_dead_props(source, dest);
                return Ok(());
            }

            // Copying a directory onto an existing directory with
            // Depth 0 is not an error, it means "copy properties".
            if let Err(e) = self.fs.create_dir(dest, &self.ctx).await {
                if depth != Depth::Zero || e != FsError::Exists {
                    debug!("do_copy: create_dir error: {:?}", e);
                    multierror.add_status(dest, fserror_to_status(e));
                    return Err(e);
                }
            }
            self.copy_dead_props(source, dest);

            // only recurse when Depth > 0.
            if depth == Depth::Zero {
                return Ok(());
            }

            let mut entries = match self.fs.read_dir(source, &self.ctx).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("do_copy: read_dir error: {:?}", e);
                    multierror.add_status(source, fserror_to_status(e));
                    return Err(e);
                },
            };

            // If we encounter errors, just print them, and keep going.
            // The last seen error is returned from this function.
            let mut retval = Ok(());
            while let Some(dirent) = entries.next().await {
                let dirent = match dirent {
                    Ok(d) => d,
                    Err(e) => {
                        multierror.add_status(source, fserror_to_status(e));
                        return Err(e);
                    },
                };
                let meta = match dirent.metadata().await {
                    Ok(meta) => meta,
                    Err(e) => {
                        multierror.add_status(source, fserror_to_status(e));
                        return Err(e);
                    },
                };
                let name = dirent.name();
                let mut nsrc = source.clone();
                let mut ndest = dest.clone();
                nsrc.push_segment(&name);
                ndest.push_segment(&name);

                if meta.is_dir() {
                    nsrc.add_slash();
                    ndest.add_slash();
                }
                if let Err(e) = self.do_copy(&nsrc, topdest, &ndest, depth, multierror).await {
                    retval = Err(e);
                }
            }

            retval
        }
        .boxed()
    }

    fn copy_dead_props(&self, source: &DavPath, dest: &DavPath) {
        if let Some(ref pm) = self.pm {
            pm.copy_properties(source, dest).ok();
        }
    }

    async fn do_move(
        &self,
        source: &DavPath,
        dest: &DavPath,
        existed: bool,
        is_dir: bool,
        tokens: &[String],
        mut multierror: MultiError,
    ) -> DavResult<Response<Body>>
    {
        trace!("do_move {} {}", source, dest);
        if let Err(e) = self.fs.rename(source, dest, &self.ctx).await {
            // this is a single action, no need for a multi-error.
            let status = fserror_to_status(e);
            multierror.add_status(source, status);
            multierror.close()
        } else {
            // dead properties travel along, and so do the locks whose
            // tokens the client submitted; the rest are dropped.
            if let Some(ref pm) = self.pm {
                pm.move_properties(source, dest, is_dir).ok();
            }
            if let Some(ref locksystem) = self.ls {
                let t = tokens.iter().map(|s| s.as_str()).collect::<Vec<&str>>();
                locksystem.transfer(source, dest, t).ok();
            }
            let s = if existed { SC::NO_CONTENT } else { SC::CREATED };
            multierror.finalstatus(source, s)
        }
    }

    pub(crate) async fn handle_copymove(
        self,
        req: &Request<()>,
        method: DavMethod,
    ) -> DavResult<Response<Body>>
    {
        // get and check headers.
        let overwrite = req
            .headers()
            .typed_get::<davheaders::Overwrite>()
            .map_or(true, |o| o.0);
        let depth = match req.headers().typed_get::<Depth>() {
            Some(Depth::Infinity) | None => Depth::Infinity,
            Some(Depth::Zero) if method == DavMethod::Copy => Depth::Zero,
            _ => return Err(DavError::Status(SC::BAD_REQUEST)),
        };

        // decode and validate destination.
        let dest = req
            .headers()
            .typed_get::<davheaders::Destination>()
            .ok_or(DavError::Status(SC::BAD_REQUEST))?;
        let mut dest = DavPath::from_str_and_prefix(&dest.0, &self.prefix)?;

        let mut path = self.path(req);
        let meta = self.fs.metadata(&path, &self.ctx).await?;
        path.add_slash_if(meta.is_dir());
        dest.add_slash_if(meta.is_dir());

        // parent of the destination must exist.
        if !self.has_parent(&dest).await {
            return Err(DavError::Status(SC::CONFLICT));
        }

        // check if the destination exists.
        let dmeta = self.fs.metadata(&dest, &self.ctx).await;
        let exists = dmeta.is_ok();

        // check if overwrite is "F".
        if !overwrite && exists {
            return Err(DavError::Status(SC::PRECONDITION_FAILED));
        }

        // check if source equals destination.
        if path == dest {
            return Err(DavError::Status(SC::FORBIDDEN));
        }

        // moving a collection into its own subtree cannot work.
        if meta.is_dir() && dest.as_bytes().starts_with(path.as_bytes()) {
            return Err(DavError::Status(SC::CONFLICT));
        }

        // check the If and If-* headers for the source.
        let tokens =
            match if_match_get_tokens(req, Some(&*meta), &*self.fs, &self.ls, &self.ctx, &path).await
            {
                Ok(t) => t,
                Err(s) => return Err(DavError::Status(s)),
            };

        // check locks. for MOVE the source subtree is affected, for
        // both methods the destination is.
        if method == DavMethod::Move {
            self.check_locks(&path, true, &tokens)?;
        }
        self.check_locks(&dest, true, &tokens)?;

        let mut multierror = MultiError::new(&path);

        // see if we need to delete the destination first.
        if overwrite && exists && depth != Depth::Zero {
            debug!("handle_copymove: deleting destination {}", dest);
            if self
                .delete_items(&mut multierror, Depth::Infinity, dmeta.unwrap(), &dest)
                .await
                .is_err()
            {
                return multierror.close();
            }
            if let Some(ref locksystem) = self.ls {
                locksystem.delete(&dest).ok();
            }
            if let Some(ref pm) = self.pm {
                pm.remove_properties(&dest, true).ok();
            }
        }

        // COPY or MOVE.
        if method == DavMethod::Copy {
            match self.do_copy(&path, &dest, &dest, depth, &mut multierror).await {
                Err(_) => multierror.close(),
                Ok(_) => {
                    let s = if exists { SC::NO_CONTENT } else { SC::CREATED };
                    multierror.finalstatus(&path, s)
                },
            }
        } else {
            self.do_move(&path, &dest, exists, meta.is_dir(), &tokens, multierror)
                .await
        }
    }
}
