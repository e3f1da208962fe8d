//! Collects per-resource statuses during a recursive operation and turns
//! them into either a plain response or a 207 multi-status document.
use http::{Response, StatusCode};
use xml::writer::XmlEvent as XmlWEvent;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::util::MemBuffer;
use crate::xmltree_ext::emitter;
use crate::{DavError, DavResult};

pub(crate) struct MultiError {
    req_path: DavPath,
    items: Vec<(DavPath, StatusCode)>,
}

impl MultiError {
    pub fn new(req_path: &DavPath) -> MultiError {
        MultiError {
            req_path: req_path.clone(),
            items: Vec::new(),
        }
    }

    pub fn add_status(&mut self, path: &DavPath, status: impl Into<DavError>) {
        let status = status.into().statuscode();
        self.items.push((path.clone(), status));
    }

    /// The operation's top level succeeded. Without collected failures
    /// this is a plain `status` response, otherwise a 207 listing them.
    pub fn final_status(self, status: StatusCode) -> DavResult<Response<Body>> {
        if self.items.is_empty() {
            let resp = Response::builder()
                .status(status)
                .header("content-length", "0")
                .body(Body::empty())
                .unwrap();
            return Ok(resp);
        }
        self.multistatus()
    }

    /// The operation's top level failed. A single entry for the request
    /// path collapses into a plain status; anything else becomes a 207.
    pub fn close(self) -> DavResult<Response<Body>> {
        if let [(ref path, status)] = self.items[..] {
            if *path == self.req_path {
                return Err(DavError::Status(status));
            }
        }
        if self.items.is_empty() {
            return Err(DavError::Status(StatusCode::INTERNAL_SERVER_ERROR));
        }
        self.multistatus()
    }

    fn multistatus(self) -> DavResult<Response<Body>> {
        let mut buffer = MemBuffer::new();
        {
            let mut xw = emitter(&mut buffer)?;
            xw.write(XmlWEvent::start_element("D:multistatus").ns("D", "DAV:"))?;
            for (path, status) in &self.items {
                xw.write(XmlWEvent::start_element("D:response"))?;
                xw.write(XmlWEvent::start_element("D:href"))?;
                xw.write(XmlWEvent::characters(&path.as_url_string_with_prefix()))?;
                xw.write(XmlWEvent::end_element())?;
                xw.write(XmlWEvent::start_element("D:status"))?;
                xw.write(XmlWEvent::characters(&format!("HTTP/1.1 {}", status)))?;
                xw.write(XmlWEvent::end_element())?;
                xw.write(XmlWEvent::end_element())?;
            }
            xw.write(XmlWEvent::end_element())?;
        }

        let resp = Response::builder()
            .status(StatusCode::MULTI_STATUS)
            .header("content-type", "application/xml; charset=utf-8")
            .body(Body::from(buffer.take()))
            .unwrap();
        Ok(resp)
    }
}
