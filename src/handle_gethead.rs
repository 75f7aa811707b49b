use bytes::Bytes;
use futures_util::StreamExt;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use log::{debug, error};

use crate::async_stream::AsyncStream;
use crate::body::Body;
use crate::conditional;
use crate::davhandler::DavInner;
use crate::davheaders::{self, ByteRange};
use crate::errors::DavError;
use crate::fs::*;
use crate::util::systemtime_to_httpdate;
use crate::DavResult;

impl DavInner {
    pub(crate) async fn handle_get(self, req: &Request<()>) -> DavResult<Response<Body>> {
        let head = req.method() == http::Method::HEAD;
        let path = self.path(req);

        // check if it's a collection.
        let meta = self.fs.metadata(&path, &self.ctx).await?;
        if meta.is_dir() {
            return self.handle_autoindex(req, head).await;
        }

        // double check, is it a regular file.
        let mut file = self.fs.open(&path, OpenOptions::read(), &self.ctx).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        }

        let len = meta.len();
        let mut start = 0;
        let mut count = len;
        let file_etag = davheaders::ETag::from_meta(&*meta);

        let mut do_range = match req.headers().typed_get::<davheaders::IfRange>() {
            Some(r) => conditional::ifrange_match(&r, file_etag.as_ref(), meta.modified().ok()),
            None => true,
        };

        // see if we want to get a range.
        if do_range {
            do_range = false;
            if let Some(r) = req.headers().typed_get::<davheaders::Range>() {
                // we only support a single range.
                if r.0.len() == 1 {
                    match r.0[0] {
                        ByteRange::FromTo(s, e) => {
                            start = s;
                            count = e - s + 1;
                        },
                        ByteRange::AllFrom(s) => {
                            start = s;
                            count = len.saturating_sub(s);
                        },
                        ByteRange::Last(n) => {
                            start = len.saturating_sub(n);
                            count = n;
                        },
                    }
                    if start >= len || count == 0 {
                        let mut res = Response::new(Body::empty());
                        let r = format!("bytes */{}", len);
                        res.headers_mut().insert("Content-Range", r.parse().unwrap());
                        *res.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                        return Ok(res);
                    }
                    if start + count > len {
                        count = len - start;
                    }
                    do_range = true;
                }
            }
        }

        let mut res = Response::new(Body::empty());

        // set Last-Modified and ETag headers.
        if let Ok(modified) = meta.modified() {
            res.headers_mut()
                .typed_insert(headers::LastModified::from(modified));
        }
        if let Some(etag) = file_etag {
            res.headers_mut().typed_insert(etag);
        }

        // handle the conditional headers.
        if let Some(s) =
            conditional::if_match(req, Some(&*meta), &*self.fs, &self.ls, &self.ctx, &path).await
        {
            return Err(DavError::Status(s));
        }

        if do_range {
            // seek to beginning of the requested data.
            if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
                *res.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                return Ok(res);
            }
            let r = format!("bytes {}-{}/{}", start, start + count - 1, len);
            res.headers_mut().insert("Content-Range", r.parse().unwrap());
            *res.status_mut() = StatusCode::PARTIAL_CONTENT;
        } else {
            *res.status_mut() = StatusCode::OK;
        }

        res.headers_mut()
            .insert("Content-Type", path.get_mime_type_str().parse().unwrap());
        res.headers_mut().typed_insert(headers::ContentLength(count));
        res.headers_mut().typed_insert(headers::AcceptRanges::bytes());

        if head {
            return Ok(res);
        }

        // now just loop and send data.
        *res.body_mut() = Body::from(AsyncStream::new(|mut tx| {
            async move {
                let mut count = count as usize;
                while count > 0 {
                    let blen = std::cmp::min(count, 8192);
                    let mut buf = file.read_bytes(blen).await?;
                    if buf.is_empty() {
                        // the file got truncated under us; return
                        // zeroes instead of content.
                        buf = Bytes::from(vec![0u8; blen]);
                    }
                    if buf.len() > count {
                        buf.truncate(count);
                    }
                    count -= buf.len();
                    tx.send(buf).await;
                }
                Ok(())
            }
        }));

        Ok(res)
    }

    // GET on a collection: HTML index when enabled, else 405.
    pub(crate) async fn handle_autoindex(self, req: &Request<()>, head: bool) -> DavResult<Response<Body>> {
        let mut path = self.path(req);
        if !self.autoindex {
            debug!("GET on collection {} and no index configured", path);
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        }

        let mut res = Response::new(Body::empty());

        // If the path doesn't end in "/", redirect. A client asking for
        // a directory index is usually a browser, which handles that fine.
        if !path.is_collection() {
            path.add_slash();
            res.headers_mut()
                .insert("Location", path.as_url_string_with_prefix().parse().unwrap());
            res.headers_mut().typed_insert(headers::ContentLength(0));
            *res.status_mut() = StatusCode::FOUND;
            return Ok(res);
        }

        // read directory or bail.
        let mut entries = self.fs.read_dir(&path, &self.ctx).await?;

        res.headers_mut()
            .insert("Content-Type", "text/html; charset=utf-8".parse().unwrap());
        *res.status_mut() = StatusCode::OK;
        if head {
            return Ok(res);
        }

        *res.body_mut() = Body::from(AsyncStream::new(|mut tx| {
            async move {
                struct Dirent {
                    path: String,
                    name: String,
                    meta: Box<dyn DavMetaData>,
                }

                let mut dirents: Vec<Dirent> = Vec::new();
                while let Some(dirent) = entries.next().await {
                    let dirent = match dirent {
                        Ok(d) => d,
                        Err(e) => {
                            error!("read_dir error {:?}", e);
                            continue;
                        },
                    };
                    let mut name = dirent.name();
                    if name.starts_with(b".") {
                        continue;
                    }
                    let mut npath = path.clone();
                    npath.push_segment(&name);
                    if let Ok(meta) = dirent.metadata().await {
                        if meta.is_dir() {
                            name.push(b'/');
                            npath.add_slash();
                        }
                        dirents.push(Dirent {
                            path: npath.as_url_string_with_prefix(),
                            name: String::from_utf8_lossy(&name).to_string(),
                            meta,
                        });
                    }
                }

                // sort, directories first.
                dirents.sort_by(|a, b| {
                    let adir = a.meta.is_dir();
                    let bdir = b.meta.is_dir();
                    if adir && !bdir {
                        std::cmp::Ordering::Less
                    } else if bdir && !adir {
                        std::cmp::Ordering::Greater
                    } else {
                        (a.name).cmp(&b.name)
                    }
                });

                // and output html.
                let upath = htmlescape::encode_minimal(&path.as_url_string());
                let mut w = String::new();
                w.push_str("<html><head>");
                w.push_str(&format!("<title>Index of {}</title>", upath));
                w.push_str("<style>");
                w.push_str("table { border-collapse: separate; border-spacing: 1.5em 0.25em; }");
                w.push_str("h1 { padding-left: 0.3em; }");
                w.push_str(".mono { font-family: monospace; }");
                w.push_str("</style>");
                w.push_str("</head>");
                w.push_str("<body>");
                w.push_str(&format!("<h1>Index of {}</h1>", upath));
                w.push_str("<table>");
                w.push_str("<tr>");
                w.push_str("<th>Name</th><th>Last modified</th><th>Size</th>");
                w.push_str("<tr><th colspan=\"3\"><hr></th></tr>");
                w.push_str("<tr><td><a href=\"..\">Parent Directory</a></td><td>&nbsp;</td><td class=\"mono\" align=\"right\">[DIR]</td></tr>");
                tx.send(Bytes::from(w)).await;

                for dirent in &dirents {
                    let modified = match dirent.meta.modified() {
                        Ok(t) => systemtime_to_httpdate(t),
                        Err(_) => "".to_string(),
                    };
                    let size = match dirent.meta.is_file() {
                        true => dirent.meta.len().to_string(),
                        false => "[DIR]".to_string(),
                    };
                    let name = htmlescape::encode_minimal(&dirent.name);
                    let s = format!(
                        "<tr><td><a href=\"{}\">{}</a></td><td class=\"mono\">{}</td><td class=\"mono\" align=\"right\">{}</td></tr>",
                        dirent.path, name, modified, size
                    );
                    tx.send(Bytes::from(s)).await;
                }

                let mut w = String::new();
                w.push_str("<tr><th colspan=\"3\"><hr></th></tr>");
                w.push_str("</table></body></html>");
                tx.send(Bytes::from(w)).await;

                Ok::<_, std::io::Error>(())
            }
        }));

        Ok(res)
    }
}
