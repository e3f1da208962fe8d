use std::io::{Cursor, Write};
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::body::Body;
use crate::errors::DavError;
use crate::DavResult;

/// HTTP methods supported by [`DavHandler`](crate::DavHandler).
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[repr(u32)]
pub enum DavMethod {
    Head = 0x0001,
    Get = 0x0002,
    Put = 0x0004,
    Options = 0x0008,
    PropFind = 0x0010,
    PropPatch = 0x0020,
    MkCol = 0x0040,
    Copy = 0x0080,
    Move = 0x0100,
    Delete = 0x0200,
    Lock = 0x0400,
    Unlock = 0x0800,
}

// translate an HTTP method into our own enum that has the webdav methods as well.
pub(crate) fn dav_method(m: &http::Method) -> DavResult<DavMethod> {
    let m = match *m {
        http::Method::HEAD => DavMethod::Head,
        http::Method::GET => DavMethod::Get,
        http::Method::PUT => DavMethod::Put,
        http::Method::DELETE => DavMethod::Delete,
        http::Method::OPTIONS => DavMethod::Options,
        _ => match m.as_str() {
            "PROPFIND" => DavMethod::PropFind,
            "PROPPATCH" => DavMethod::PropPatch,
            "MKCOL" => DavMethod::MkCol,
            "COPY" => DavMethod::Copy,
            "MOVE" => DavMethod::Move,
            "LOCK" => DavMethod::Lock,
            "UNLOCK" => DavMethod::Unlock,
            _ => return Err(DavError::UnknownDavMethod),
        },
    };
    Ok(m)
}

impl DavMethod {
    /// Methods that mutate the resource tree. These run the `If` header
    /// check first, and are refused outright in readonly mode.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            DavMethod::Put
                | DavMethod::MkCol
                | DavMethod::Delete
                | DavMethod::Copy
                | DavMethod::Move
                | DavMethod::PropPatch
                | DavMethod::Lock
        )
    }
}

/// A set of allowed [`DavMethod`]s.
#[derive(Clone, Copy, Debug)]
pub struct DavMethodSet(u32);

impl DavMethodSet {
    pub const WEBDAV_RO: DavMethodSet = DavMethodSet(
        DavMethod::Get as u32
            | DavMethod::Head as u32
            | DavMethod::Options as u32
            | DavMethod::PropFind as u32,
    );
    pub const WEBDAV_RW: DavMethodSet = DavMethodSet(0xffffffff);

    /// New set, all methods allowed.
    pub fn all() -> DavMethodSet {
        DavMethodSet(0xffffffff)
    }

    /// New empty set.
    pub fn none() -> DavMethodSet {
        DavMethodSet(0)
    }

    /// Add a method.
    pub fn add(&mut self, m: DavMethod) -> &Self {
        self.0 |= m as u32;
        self
    }

    /// Remove a method.
    pub fn remove(&mut self, m: DavMethod) -> &Self {
        self.0 &= !(m as u32);
        self
    }

    /// Check if a method is in the set.
    pub fn contains(&self, m: DavMethod) -> bool {
        self.0 & (m as u32) > 0
    }
}

// RFC 1123 date, as used in HTTP headers and D:creationdate.
pub(crate) fn systemtime_to_rfc1123(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

// ISO-8601 / RFC 3339 date, as used in D:getlastmodified.
pub(crate) fn systemtime_to_rfc3339(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn dav_xml_error(body: &str) -> Body {
    let xml = format!(
        "{}\n{}\n{}\n{}\n",
        r#"<?xml version="1.0" encoding="utf-8" ?>"#,
        r#"<D:error xmlns:D="DAV:">"#,
        body,
        r#"</D:error>"#
    );
    Body::from(xml)
}

pub(crate) fn notfound() -> http::Response<Body> {
    http::Response::builder()
        .status(http::StatusCode::NOT_FOUND)
        .header("content-length", "0")
        .body(Body::empty())
        .unwrap()
}

// A buffer that implements "Write", to collect XML writer output.
pub(crate) struct MemBuffer(Cursor<Vec<u8>>);

impl MemBuffer {
    pub fn new() -> MemBuffer {
        MemBuffer(Cursor::new(Vec::new()))
    }

    pub fn take(&mut self) -> Bytes {
        let buf = std::mem::take(self.0.get_mut());
        self.0.set_position(0);
        Bytes::from(buf)
    }
}

impl Write for MemBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_rfc3339() {
        assert_eq!(systemtime_to_rfc3339(UNIX_EPOCH), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_rfc1123() {
        assert_eq!(
            systemtime_to_rfc1123(UNIX_EPOCH),
            "Thu, 01 Jan 1970 00:00:00 GMT"
        );
    }

    #[test]
    fn test_methodset() {
        let mut m = DavMethodSet::WEBDAV_RO;
        assert!(m.contains(DavMethod::PropFind));
        assert!(!m.contains(DavMethod::Put));
        m.add(DavMethod::Put);
        assert!(m.contains(DavMethod::Put));
    }
}
