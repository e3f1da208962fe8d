//! The path part of an URL, mapped to a filesystem path.
//!
//! Paths are kept percent-decoded as raw bytes; they are re-encoded on the
//! way out. Comparison and lock anchoring ignore a trailing slash, so
//! `/foo` and `/foo/` name the same resource.
use std::ffi::OsStr;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use percent_encoding as pct;

use crate::errors::DavError;

// Encode all non-unreserved characters, except '/'.
const PATH_ENCODE_SET: &pct::AsciiSet = &pct::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// URL path, with hidden prefix.
#[derive(Clone)]
pub struct DavPath {
    // decoded path bytes, always starting with '/' (after the prefix).
    path: Vec<u8>,
    prefix: String,
}

/// Error returned by the DavPath constructors.
#[derive(Debug)]
pub enum ParseError {
    /// cannot parse
    InvalidPath,
    /// outside of prefix
    PrefixMismatch,
    /// too many dotdots
    ForbiddenPath,
}

impl std::error::Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ParseError> for DavError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::InvalidPath => DavError::InvalidPath,
            ParseError::PrefixMismatch => DavError::IllegalPath,
            ParseError::ForbiddenPath => DavError::ForbiddenPath,
        }
    }
}

// A decoded segment may contain any byte except '/' and NUL.
fn decode_segment(seg: &[u8]) -> Result<Vec<u8>, ParseError> {
    let out: Vec<u8> = pct::percent_decode(seg).collect();
    if out.iter().any(|&b| b == 0 || b == b'/') {
        return Err(ParseError::InvalidPath);
    }
    Ok(out)
}

// Normalize a raw URL path:
// - printable ASCII only before decoding,
// - strip the query part, refuse fragments,
// - merge consecutive slashes, resolve "." and "..",
// - percent-decode each segment.
fn normalize_path(raw: &[u8]) -> Result<Vec<u8>, ParseError> {
    if raw.iter().any(|&b| !(32..127).contains(&b)) {
        return Err(ParseError::InvalidPath);
    }
    let mut raw = raw;
    if let Some(pos) = raw.iter().position(|&b| b == b'?' || b == b'#') {
        if raw[pos] == b'#' {
            return Err(ParseError::InvalidPath);
        }
        raw = &raw[..pos];
    }
    if raw.first() != Some(&b'/') {
        return Err(ParseError::InvalidPath);
    }
    let isdir = raw.ends_with(b"/");

    let mut segs: Vec<Vec<u8>> = Vec::new();
    for seg in raw.split(|&b| b == b'/') {
        match seg {
            b"" | b"." => {}
            b".." => {
                if segs.pop().is_none() {
                    return Err(ParseError::ForbiddenPath);
                }
            }
            s => segs.push(decode_segment(s)?),
        }
    }

    let mut path = Vec::new();
    for seg in &segs {
        path.push(b'/');
        path.extend_from_slice(seg);
    }
    if isdir || path.is_empty() {
        path.push(b'/');
    }
    Ok(path)
}

fn encode_path(src: &[u8]) -> String {
    pct::percent_encode(src, PATH_ENCODE_SET).to_string()
}

/// Comparison ignores any trailing slash, so /foo == /foo/
impl PartialEq for DavPath {
    fn eq(&self, rhs: &DavPath) -> bool {
        strip_slash(&self.path) == strip_slash(&rhs.path)
    }
}

fn strip_slash(p: &[u8]) -> &[u8] {
    if p.len() > 1 && p.ends_with(b"/") {
        &p[..p.len() - 1]
    } else {
        p
    }
}

impl std::fmt::Display for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_url_string())
    }
}

impl std::fmt::Debug for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.as_url_string_with_prefix())
    }
}

impl DavPath {
    /// From an URL encoded path.
    pub fn new(src: &str) -> Result<DavPath, ParseError> {
        Ok(DavPath {
            path: normalize_path(src.as_bytes())?,
            prefix: String::new(),
        })
    }

    /// From an URL encoded path and a non-encoded prefix that is stripped off.
    pub fn from_str_and_prefix(src: &str, prefix: &str) -> Result<DavPath, ParseError> {
        let mut path = normalize_path(src.as_bytes())?;
        let pfx = prefix.trim_end_matches('/').as_bytes();
        if !pfx.is_empty() {
            if !path.starts_with(pfx) {
                return Err(ParseError::PrefixMismatch);
            }
            path.drain(..pfx.len());
            if path.is_empty() {
                path.push(b'/');
            }
            if path[0] != b'/' {
                return Err(ParseError::PrefixMismatch);
            }
        }
        Ok(DavPath {
            path,
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    /// From a request URI.
    pub fn from_uri(uri: &http::uri::Uri, prefix: &str) -> Result<DavPath, ParseError> {
        DavPath::from_str_and_prefix(uri.path(), prefix)
    }

    /// Add a slash to the end of the path (if not already present).
    pub(crate) fn add_slash(&mut self) {
        if !self.is_collection() {
            self.path.push(b'/');
        }
    }

    pub(crate) fn add_slash_if(&mut self, b: bool) {
        if b && !self.is_collection() {
            self.path.push(b'/');
        }
    }

    /// Add a segment to the end of the path.
    pub(crate) fn push_segment(&mut self, seg: &[u8]) {
        if !self.is_collection() {
            self.path.push(b'/');
        }
        self.path.extend_from_slice(seg);
    }

    /// Return the parent collection.
    pub fn parent(&self) -> DavPath {
        let stripped = strip_slash(&self.path);
        let end = stripped.iter().rposition(|&b| b == b'/').unwrap_or(0);
        let mut path = stripped[..end].to_vec();
        path.push(b'/');
        DavPath {
            path,
            prefix: self.prefix.clone(),
        }
    }

    /// Raw decoded bytes, no prefix.
    pub fn as_bytes(&self) -> &[u8] {
        &self.path
    }

    /// As an URL encoded string, without the prefix.
    pub fn as_url_string(&self) -> String {
        encode_path(&self.path)
    }

    /// As an URL encoded string, including the prefix.
    pub fn as_url_string_with_prefix(&self) -> String {
        let mut s = self.prefix.clone();
        s.push_str(&self.as_url_string());
        s
    }

    /// The key under which locks for this path are anchored: the encoded
    /// path without prefix, with any trailing slash stripped.
    pub(crate) fn lock_key(&self) -> String {
        encode_path(strip_slash(&self.path))
    }

    /// Is this a collection, i.e. does the URL path end in "/"?
    pub fn is_collection(&self) -> bool {
        self.path.ends_with(b"/")
    }

    /// The last segment of the path. Empty for the root.
    pub fn file_name_bytes(&self) -> &[u8] {
        let stripped = strip_slash(&self.path);
        match stripped.iter().rposition(|&b| b == b'/') {
            Some(pos) => &stripped[pos + 1..],
            None => b"",
        }
    }

    /// The last segment of the path, if valid UTF-8 and non-empty.
    pub fn file_name(&self) -> Option<&str> {
        let name = self.file_name_bytes();
        if name.is_empty() {
            None
        } else {
            std::str::from_utf8(name).ok()
        }
    }

    /// As an OS path relative to a filesystem root, for `PathBuf::join`.
    pub fn as_rel_ospath(&self) -> &Path {
        let mut p = strip_slash(&self.path);
        if p.starts_with(b"/") {
            p = &p[1..];
        }
        #[cfg(unix)]
        let os = OsStr::from_bytes(p);
        #[cfg(not(unix))]
        let os: &OsStr = std::str::from_utf8(p).unwrap_or("").as_ref();
        Path::new(os)
    }

    /// Map onto a filesystem base directory.
    pub fn as_pathbuf_with_prefix(&self, base: &Path) -> PathBuf {
        base.join(self.as_rel_ospath())
    }

    pub(crate) fn get_mime_type_str(&self) -> &'static str {
        let name = self.file_name_bytes();
        if let Some(pos) = name.iter().rposition(|&b| b == b'.') {
            if let Ok(ext) = std::str::from_utf8(&name[pos + 1..]) {
                if let Some(t) = mime_guess::from_ext(ext).first_raw() {
                    return t;
                }
            }
        }
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(DavPath::new("/a/b/../c").unwrap().as_bytes(), b"/a/c");
        assert_eq!(DavPath::new("/a//b/./").unwrap().as_bytes(), b"/a/b/");
        assert_eq!(DavPath::new("/%41%20x").unwrap().as_bytes(), b"/A x");
        assert!(DavPath::new("/..").is_err());
        assert!(DavPath::new("relative").is_err());
        assert!(DavPath::new("/a#frag").is_err());
    }

    #[test]
    fn trailing_slash_eq() {
        assert_eq!(DavPath::new("/a/b").unwrap(), DavPath::new("/a/b/").unwrap());
        assert_ne!(DavPath::new("/a/b").unwrap(), DavPath::new("/a/c").unwrap());
    }

    #[test]
    fn prefix() {
        let p = DavPath::from_str_and_prefix("/dav/x/y", "/dav").unwrap();
        assert_eq!(p.as_bytes(), b"/x/y");
        assert_eq!(p.as_url_string_with_prefix(), "/dav/x/y");
        assert!(DavPath::from_str_and_prefix("/other/x", "/dav").is_err());
    }

    #[test]
    fn names() {
        let p = DavPath::new("/a/b.txt").unwrap();
        assert_eq!(p.file_name(), Some("b.txt"));
        assert_eq!(p.parent().as_bytes(), b"/a/");
        assert_eq!(p.get_mime_type_str(), "text/plain");
        assert_eq!(DavPath::new("/").unwrap().file_name(), None);
    }
}
