use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::DavInner;
use crate::util::{dav_method, DavMethod};
use crate::DavResult;

impl DavInner {
    pub(crate) async fn handle_options(self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());

        let h = res.headers_mut();
        // locking support is advertised as class 2.
        let dav = if self.ls.is_some() { "1,2" } else { "1" };
        h.insert("DAV", dav.parse().unwrap());
        h.insert("MS-Author-Via", "DAV".parse().unwrap());
        h.insert("content-length", "0".parse().unwrap());

        let path = self.path(req);
        let meta = self.fs.metadata(&path, &self.ctx).await;

        // Helper to add a method to the array if it is in fact allowed.
        // If the current method is not OPTIONS, leave out the current
        // method since we're probably called for MethodNotAllowed.
        let method = dav_method(req.method()).unwrap_or(DavMethod::Options);
        let islock = |m| m == DavMethod::Lock || m == DavMethod::Unlock;
        let mm = |v: &mut Vec<String>, m: &str, y: DavMethod| {
            if (y == DavMethod::Options || (y != method || islock(y) != islock(method)))
                && (!islock(y) || self.ls.is_some())
                && self.allow.map_or(true, |x| x.contains(y))
            {
                v.push(m.to_string());
            }
        };

        let is_unmapped = meta.is_err();
        let is_file = meta.map(|m| m.is_file()).unwrap_or_default();
        let is_star = path.is_star() && method == DavMethod::Options;

        let mut v = Vec::new();
        if is_unmapped && !is_star {
            mm(&mut v, "OPTIONS", DavMethod::Options);
            mm(&mut v, "MKCOL", DavMethod::MkCol);
            mm(&mut v, "PUT", DavMethod::Put);
            mm(&mut v, "LOCK", DavMethod::Lock);
        } else {
            if is_file || is_star {
                mm(&mut v, "HEAD", DavMethod::Head);
                mm(&mut v, "GET", DavMethod::Get);
                mm(&mut v, "PUT", DavMethod::Put);
            }
            mm(&mut v, "OPTIONS", DavMethod::Options);
            mm(&mut v, "PROPFIND", DavMethod::PropFind);
            mm(&mut v, "PROPPATCH", DavMethod::PropPatch);
            mm(&mut v, "COPY", DavMethod::Copy);
            if path.as_bytes() != b"/" {
                mm(&mut v, "MOVE", DavMethod::Move);
                mm(&mut v, "DELETE", DavMethod::Delete);
            }
            mm(&mut v, "LOCK", DavMethod::Lock);
            mm(&mut v, "UNLOCK", DavMethod::Unlock);
        }

        let allow = v.join(",");
        res.headers_mut().insert("Allow", allow.parse().unwrap());
        *res.status_mut() = StatusCode::OK;

        Ok(res)
    }
}
