//! Builder for `207 Multi-Status` responses that report per-resource
//! sub-statuses (DELETE, COPY, MOVE).
use http::{Response, StatusCode};
use xml::common::XmlVersion;
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xml::EmitterConfig;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::util::MemBuffer;
use crate::DavResult;

pub(crate) struct MultiError {
    req_path: DavPath,
    entries:  Vec<(DavPath, StatusCode)>,
}

impl MultiError {
    pub fn new(req_path: &DavPath) -> MultiError {
        MultiError {
            req_path: req_path.clone(),
            entries:  Vec::new(),
        }
    }

    /// Record a sub-status for one resource.
    pub fn add_status(&mut self, path: &DavPath, status: StatusCode) {
        self.entries.push((path.clone(), status));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finish the operation. When no sub-statuses were recorded the
    /// response is the plain `status`; otherwise a 207 with one
    /// `<D:response>` per recorded resource.
    pub fn finalstatus(self, path: &DavPath, status: StatusCode) -> DavResult<Response<Body>> {
        if self.entries.is_empty() {
            let resp = Response::builder()
                .status(status)
                .header("content-length", "0")
                .body(Body::empty())
                .unwrap();
            return Ok(resp);
        }
        // A single entry for the request path itself needs no 207.
        if self.entries.len() == 1 && self.entries[0].0 == *path {
            let status = self.entries[0].1;
            let resp = Response::builder()
                .status(status)
                .header("content-length", "0")
                .body(Body::empty())
                .unwrap();
            return Ok(resp);
        }
        self.close()
    }

    /// Build the 207 response from the recorded entries.
    pub fn close(self) -> DavResult<Response<Body>> {
        if self.entries.len() == 1 && self.entries[0].0 == self.req_path {
            let (path, status) = (self.req_path.clone(), self.entries[0].1);
            return self.finalstatus(&path, status);
        }

        let mut xw = EventWriter::new_with_config(
            MemBuffer::new(),
            EmitterConfig {
                perform_indent: true,
                ..EmitterConfig::default()
            },
        );
        xw.write(XmlWEvent::StartDocument {
            version:    XmlVersion::Version10,
            encoding:   Some("utf-8"),
            standalone: None,
        })
        .map_err(DavError::from)?;
        xw.write(XmlWEvent::start_element("D:multistatus").ns("D", "DAV:"))
            .map_err(DavError::from)?;

        for (path, status) in &self.entries {
            write_response(&mut xw, path, *status)?;
        }

        xw.write(XmlWEvent::end_element()).map_err(DavError::from)?;

        let mut buffer = xw.into_inner();
        let body = buffer.take();
        let resp = Response::builder()
            .header("content-type", "application/xml; charset=utf-8")
            .status(StatusCode::MULTI_STATUS)
            .body(Body::from(body))
            .unwrap();
        Ok(resp)
    }
}

fn write_elem<W: std::io::Write>(xw: &mut EventWriter<W>, name: &str, text: &str) -> DavResult<()> {
    xw.write(XmlWEvent::start_element(name)).map_err(DavError::from)?;
    if !text.is_empty() {
        xw.write(XmlWEvent::characters(text)).map_err(DavError::from)?;
    }
    xw.write(XmlWEvent::end_element()).map_err(DavError::from)?;
    Ok(())
}

fn write_response<W: std::io::Write>(
    xw: &mut EventWriter<W>,
    path: &DavPath,
    sc: StatusCode,
) -> DavResult<()>
{
    xw.write(XmlWEvent::start_element("D:response")).map_err(DavError::from)?;
    write_elem(xw, "D:href", &path.as_url_string_with_prefix())?;
    write_elem(xw, "D:status", &format!("HTTP/1.1 {}", sc))?;
    xw.write(XmlWEvent::end_element()).map_err(DavError::from)?;
    Ok(())
}
