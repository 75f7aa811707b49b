use std::io::Cursor;
use std::time::Duration;

use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};
use log::trace;
use xmltree::Element;

use crate::body::Body;
use crate::conditional::{dav_if_match, if_match};
use crate::davhandler::DavInner;
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::{DavCondition, DavError};
use crate::fs::{FsError, OpenOptions};
use crate::ls::{DavLock, DavLockSystem};
use crate::util::MemBuffer;
use crate::xmltree_ext::{self, ElementExt};
use crate::DavResult;

impl DavInner {
    pub(crate) async fn handle_lock(self, req: &Request<()>, xmldata: &[u8]) -> DavResult<Response<Body>> {
        // must have a locksystem or bail.
        let locksystem = match self.ls {
            Some(ref ls) => ls,
            None => return Err(DavError::Status(SC::METHOD_NOT_ALLOWED)),
        };

        let mut path = self.path(req);
        let meta = self.fs.metadata(&path, &self.ctx).await.ok();
        if let Some(ref meta) = meta {
            path.add_slash_if(meta.is_dir());
        }

        let mut res = Response::new(Body::empty());

        // lock refresh?
        if xmldata.is_empty() {
            // get the lock token from the If: header.
            let (_, tokens) = dav_if_match(req, &*self.fs, &self.ls, &self.ctx, &path).await;
            if tokens.len() != 1 {
                return Err(DavError::Status(SC::BAD_REQUEST));
            }

            let timeout = get_timeout(req, true, false);
            let lock = match locksystem.refresh(&path, &tokens[0], timeout) {
                Ok(lock) => lock,
                Err(_) => return Err(DavError::Status(SC::PRECONDITION_FAILED)),
            };

            // output result.
            let prop = build_lock_prop(&lock, true);
            *res.status_mut() = SC::OK;
            let mut emitter = xmltree_ext::emitter(MemBuffer::new())?;
            prop.write_ev(&mut emitter)?;
            let buffer = emitter.into_inner().take();

            res.headers_mut()
                .insert("content-type", "application/xml; charset=utf-8".parse().unwrap());
            *res.body_mut() = Body::from(buffer);
            return Ok(res);
        }

        // handle Depth.
        let deep = match req.headers().typed_get::<Depth>() {
            Some(Depth::Infinity) | None => true,
            Some(Depth::Zero) => false,
            _ => return Err(DavError::Status(SC::BAD_REQUEST)),
        };

        // handle the conditional headers.
        let meta_ref = meta.as_deref();
        if let Some(s) = if_match(req, meta_ref, &*self.fs, &self.ls, &self.ctx, &path).await {
            return Err(DavError::Status(s));
        }

        // open options for the lock-null placeholder.
        let mut oo = OpenOptions::write();
        oo.create = true;
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

        // parse the lockinfo body.
        let tree = Element::parse2(Cursor::new(xmldata))?;
        if tree.name != "lockinfo" {
            return Err(DavError::XmlParseError);
        }

        let mut shared: Option<bool> = None;
        let mut owner: Option<Element> = None;
        let mut locktype = false;

        for elem in tree.children.iter().filter_map(|n| n.as_element()) {
            match elem.name.as_str() {
                "lockscope" if elem.children.len() == 1 => {
                    match elem.children[0].as_element().map(|e| e.name.as_str()) {
                        Some("exclusive") => shared = Some(false),
                        Some("shared") => shared = Some(true),
                        _ => return Err(DavError::XmlParseError),
                    }
                },
                "locktype" if elem.children.len() == 1 => {
                    match elem.children[0].as_element().map(|e| e.name.as_str()) {
                        Some("write") => locktype = true,
                        _ => return Err(DavError::XmlParseError),
                    }
                },
                "owner" => {
                    let mut o = elem.clone();
                    o.prefix = Some("D".to_owned());
                    owner = Some(o);
                },
                _ => return Err(DavError::XmlParseError),
            }
        }

        // sanity check.
        let shared = match (shared, locktype) {
            (Some(s), true) => s,
            _ => return Err(DavError::XmlParseError),
        };

        // create lock.
        let timeout = get_timeout(req, false, shared);
        let principal = self.ctx.principal.as_deref();
        let lock_null = meta.is_none();
        let lock = match locksystem.lock(&path, principal, owner.as_ref(), timeout, shared, deep, lock_null)
        {
            Ok(lock) => lock,
            Err(conflict) => {
                return Err(DavError::Condition(DavCondition {
                    status:  SC::LOCKED,
                    element: "no-conflicting-lock",
                    href:    Some(conflict.path.as_url_string_with_prefix()),
                }));
            },
        };

        // create the lock-null placeholder if the resource is unmapped.
        if meta.is_none() {
            trace!("LOCK: creating lock-null resource {}", path);
            match self.fs.open(&path, oo, &self.ctx).await {
                Ok(_) => {},
                Err(FsError::NotFound) | Err(FsError::Exists) => {
                    let s = if !oo.create || oo.create_new {
                        SC::PRECONDITION_FAILED
                    } else {
                        SC::CONFLICT
                    };
                    locksystem.unlock(&path, &lock.token).ok();
                    return Err(DavError::Status(s));
                },
                Err(e) => {
                    locksystem.unlock(&path, &lock.token).ok();
                    return Err(DavError::FsError(e));
                },
            };
        }

        // output result.
        let lt = format!("<{}>", lock.token);
        res.headers_mut().typed_insert(davheaders::LockToken(lt));
        *res.status_mut() = if meta.is_none() { SC::CREATED } else { SC::OK };

        let prop = build_lock_prop(&lock, true);
        let mut emitter = xmltree_ext::emitter(MemBuffer::new())?;
        prop.write_ev(&mut emitter)?;
        let buffer = emitter.into_inner().take();

        res.headers_mut()
            .insert("content-type", "application/xml; charset=utf-8".parse().unwrap());
        *res.body_mut() = Body::from(buffer);
        Ok(res)
    }

    pub(crate) async fn handle_unlock(self, req: &Request<()>) -> DavResult<Response<Body>> {
        // must have a locksystem or bail.
        let locksystem = match self.ls {
            Some(ref ls) => ls,
            None => return Err(DavError::Status(SC::METHOD_NOT_ALLOWED)),
        };

        // Must have a Lock-Token header.
        let t = req
            .headers()
            .typed_get::<davheaders::LockToken>()
            .ok_or(DavError::Status(SC::BAD_REQUEST))?;
        let token = t.0.trim_matches(|c| c == '<' || c == '>').to_owned();

        let mut path = self.path(req);
        if let Ok(meta) = self.fs.metadata(&path, &self.ctx).await {
            path.add_slash_if(meta.is_dir());
        }

        // only the principal that created a lock may remove it.
        if let Some(lock) = locksystem.discover(&path).iter().find(|l| l.token == token) {
            if lock.principal.is_some() && lock.principal != self.ctx.principal {
                return Err(DavError::Status(SC::FORBIDDEN));
            }
        }

        match locksystem.unlock(&path, &token) {
            Ok(lock) => {
                if lock.lock_null {
                    // the resource only existed as a placeholder.
                    trace!("UNLOCK: removing lock-null resource {}", path);
                    self.fs.remove_file(&path, &self.ctx).await.ok();
                }
                let mut res = Response::new(Body::empty());
                res.headers_mut().typed_insert(headers::ContentLength(0));
                *res.status_mut() = SC::NO_CONTENT;
                Ok(res)
            },
            Err(_) => Err(DavError::Status(SC::CONFLICT)),
        }
    }
}

pub(crate) fn list_lockdiscovery(ls: Option<&Box<dyn DavLockSystem>>, path: &DavPath) -> Element {
    let mut elem = Element::new2("D:lockdiscovery");

    // must have a locksystem or bail.
    let locksystem = match ls {
        Some(ls) => ls,
        None => return elem,
    };

    // list the locks.
    let locks = locksystem.discover(path);
    for lock in &locks {
        elem.push(build_lock_prop(lock, false));
    }
    elem
}

pub(crate) fn list_supportedlock(ls: Option<&Box<dyn DavLockSystem>>) -> Element {
    let mut elem = Element::new2("D:supportedlock");

    if ls.is_none() {
        return elem;
    }

    let mut entry = Element::new2("D:lockentry");
    let mut scope = Element::new2("D:lockscope");
    scope.push(Element::new2("D:exclusive"));
    scope.push(Element::new2("D:write"));
    entry.push(scope);
    elem.push(entry);

    let mut entry = Element::new2("D:lockentry");
    let mut scope = Element::new2("D:lockscope");
    scope.push(Element::new2("D:shared"));
    scope.push(Element::new2("D:write"));
    entry.push(scope);
    elem.push(entry);

    elem
}

// process the Timeout header. The lock manager caps the value.
fn get_timeout(req: &Request<()>, refresh: bool, shared: bool) -> Option<Duration> {
    let max_timeout = if shared {
        Duration::from_secs(86400)
    } else {
        Duration::from_secs(3600)
    };
    match req.headers().typed_get::<davheaders::Timeout>() {
        Some(davheaders::Timeout(ref vec)) if !vec.is_empty() => {
            match vec[0] {
                davheaders::DavTimeout::Infinite => {
                    if refresh {
                        None
                    } else {
                        Some(max_timeout)
                    }
                },
                davheaders::DavTimeout::Seconds(n) => {
                    Some(std::cmp::min(max_timeout, Duration::from_secs(n as u64)))
                },
            }
        },
        _ => Some(Duration::from_secs(3600)),
    }
}

fn build_lock_prop(lock: &DavLock, full: bool) -> Element {
    let mut actlock = Element::new2("D:activelock");

    let mut elem = Element::new2("D:lockscope");
    elem.push(match lock.shared {
        false => Element::new2("D:exclusive"),
        true => Element::new2("D:shared"),
    });
    actlock.push(elem);

    let mut elem = Element::new2("D:locktype");
    elem.push(Element::new2("D:write"));
    actlock.push(elem);

    actlock.push(
        Element::new2("D:depth").text(
            match lock.deep {
                false => "0",
                true => "Infinity",
            }
            .to_string(),
        ),
    );

    actlock.push(Element::new2("D:timeout").text(match lock.timeout {
        None => "Infinite".to_string(),
        Some(d) => format!("Second-{}", d.as_secs()),
    }));

    let mut locktokenelem = Element::new2("D:locktoken");
    locktokenelem.push(Element::new2("D:href").text(lock.token.clone()));
    actlock.push(locktokenelem);

    let mut lockroot = Element::new2("D:lockroot");
    lockroot.push(Element::new2("D:href").text(lock.path.as_url_string_with_prefix()));
    actlock.push(lockroot);

    if let Some(ref o) = lock.owner {
        actlock.push(o.clone());
    }

    if !full {
        return actlock;
    }

    let mut ldis = Element::new2("D:lockdiscovery");
    ldis.push(actlock);
    let mut prop = Element::new2("D:prop").ns("D", "DAV:");
    prop.push(ldis);

    prop
}
