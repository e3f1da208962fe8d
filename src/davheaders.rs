//! Typed versions of the WebDAV request headers, including the parser for
//! the `If` header.
//!
//! The `If` header is parsed into a typed AST (`If` > `IfList` >
//! `IfCondition`) in one pass; evaluation happens separately in the
//! `conditional` module so that a parse error can never leave half-collected
//! lock submissions behind.
use std::fmt::Display;
use std::str::FromStr;

use headers::Header;
use http::header::{HeaderName, HeaderValue};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref RE_URL: Regex = Regex::new(r"^https?://[^/]*([^#?]+).*$").unwrap();
    pub static ref DEPTH: HeaderName = HeaderName::from_static("depth");
    pub static ref TIMEOUT: HeaderName = HeaderName::from_static("timeout");
    pub static ref OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
    pub static ref DESTINATION: HeaderName = HeaderName::from_static("destination");
    pub static ref IF: HeaderName = HeaderName::from_static("if");
}

// helper.
fn one<'i, I>(values: &mut I) -> Result<&'i HeaderValue, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let v = values.next().ok_or_else(invalid)?;
    if values.next().is_some() {
        Err(invalid())
    } else {
        Ok(v)
    }
}

// helper.
fn invalid() -> headers::Error {
    headers::Error::invalid()
}

// helper.
fn map_invalid(_e: impl std::error::Error) -> headers::Error {
    headers::Error::invalid()
}

macro_rules! header {
    ($tname:ident, $hname:ident, $sname:expr) => {
        lazy_static! {
            pub static ref $hname: HeaderName = HeaderName::from_static($sname);
        }

        #[derive(Debug, Clone, PartialEq)]
        pub struct $tname(pub String);

        impl Header for $tname {
            fn name() -> &'static HeaderName {
                &$hname
            }

            fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
            where
                I: Iterator<Item = &'i HeaderValue>,
            {
                one(values)?
                    .to_str()
                    .map(|x| $tname(x.to_owned()))
                    .map_err(map_invalid)
            }

            fn encode<E>(&self, values: &mut E)
            where
                E: Extend<HeaderValue>,
            {
                if let Ok(value) = HeaderValue::from_str(&self.0) {
                    values.extend(std::iter::once(value));
                }
            }
        }
    };
}

header!(ContentLocation, CONTENT_LOCATION, "content-location");
header!(LockToken, LOCK_TOKEN, "lock-token");

/// Depth: header.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        match one(values)?.as_bytes() {
            b"0" => Ok(Depth::Zero),
            b"1" => Ok(Depth::One),
            b"infinity" | b"Infinity" => Ok(Depth::Infinity),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match *self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "Infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// One entry of a Timeout: header. `Seconds(0)` is not used on the wire;
/// `Infinite` maps to a timeout of zero ("never expires") internally.
#[derive(Debug, Clone, PartialEq)]
pub enum DavTimeout {
    Seconds(u32),
    Infinite,
}

#[derive(Debug, Clone)]
pub struct Timeout(pub Vec<DavTimeout>);

impl Header for Timeout {
    fn name() -> &'static HeaderName {
        &TIMEOUT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let mut v = Vec::new();
        for word in one(values)?.to_str().map_err(map_invalid)?.split(',') {
            let word = word.trim();
            let w = match word {
                "Infinite" => DavTimeout::Infinite,
                _ => match word.strip_prefix("Second-") {
                    Some(num) => DavTimeout::Seconds(num.parse().map_err(map_invalid)?),
                    None => return Err(invalid()),
                },
            };
            v.push(w);
        }
        if v.is_empty() {
            return Err(invalid());
        }
        Ok(Timeout(v))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = self
            .0
            .iter()
            .map(|t| match t {
                DavTimeout::Seconds(n) => format!("Second-{}", n),
                DavTimeout::Infinite => "Infinite".to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Destination: header, reduced to an absolute URL path.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination(pub String);

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        if s.starts_with('/') {
            return Ok(Destination(s.to_string()));
        }
        if let Some(caps) = RE_URL.captures(s) {
            if let Some(path) = caps.get(1) {
                return Ok(Destination(path.as_str().to_string()));
            }
        }
        Err(invalid())
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Overwrite: header. Absent means "T" (overwrite allowed).
#[derive(Debug, Clone, PartialEq)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        // anything that is not an explicit "F" allows overwriting.
        Ok(Overwrite(one(values)?.as_bytes() != b"F"))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = if self.0 { "T" } else { "F" };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// An entity tag. Only strong tags ever compare equal.
#[derive(Debug, Clone)]
pub struct ETag {
    pub tag: String,
    pub weak: bool,
}

impl ETag {
    pub fn strong(tag: impl Into<String>) -> ETag {
        ETag {
            tag: tag.into(),
            weak: false,
        }
    }
}

impl FromStr for ETag {
    type Err = headers::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (weak, s) = match s.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let inner = s
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .ok_or_else(invalid)?;
        if inner.contains('"') {
            return Err(invalid());
        }
        Ok(ETag {
            tag: inner.to_string(),
            weak,
        })
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.weak {
            write!(f, "W/\"{}\"", self.tag)
        } else {
            write!(f, "\"{}\"", self.tag)
        }
    }
}

impl PartialEq for ETag {
    fn eq(&self, other: &Self) -> bool {
        !self.weak && !other.weak && self.tag == other.tag
    }
}

/// The If: header. The results of the `IfList`s are OR'd.
#[derive(Debug, Clone, PartialEq)]
pub struct If(pub Vec<IfList>);

/// One parenthesized list; its conditions are AND'd. When `resource_tag`
/// is set, the conditions apply to that resource instead of the request URI.
#[derive(Debug, Clone, PartialEq)]
pub struct IfList {
    pub resource_tag: Option<url::Url>,
    pub conditions: Vec<IfCondition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfCondition {
    pub not: bool,
    pub item: IfItem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IfItem {
    StateToken(String),
    ETag(ETag),
}

// Recursive-descent parser over the raw header bytes.
struct IfParser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> IfParser<'a> {
    fn new(buf: &'a [u8]) -> IfParser<'a> {
        IfParser { buf, pos: 0 }
    }

    fn skip_ws(&mut self) {
        while let Some(&b) = self.buf.get(self.pos) {
            if !b" \t\r\n".contains(&b) {
                break;
            }
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn expect(&mut self, b: u8) -> Result<(), headers::Error> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(invalid())
        }
    }

    // "<" URI ">", cursor on '<'.
    fn coded_url(&mut self) -> Result<String, headers::Error> {
        self.expect(b'<')?;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'>' {
                let s = std::str::from_utf8(&self.buf[start..self.pos]).map_err(map_invalid)?;
                self.pos += 1;
                if s.is_empty() {
                    return Err(invalid());
                }
                return Ok(s.to_string());
            }
            if b" \t\r\n".contains(&b) {
                return Err(invalid());
            }
            self.pos += 1;
        }
        Err(invalid())
    }

    // "[" entity-tag "]", cursor on '['. The quoted string may contain
    // backslash escapes.
    fn entity_tag(&mut self) -> Result<ETag, headers::Error> {
        self.expect(b'[')?;
        self.skip_ws();
        let weak = if self.buf[self.pos..].starts_with(b"W/") {
            self.pos += 2;
            true
        } else {
            false
        };
        self.expect(b'"')?;
        let mut tag = String::new();
        loop {
            match self.peek() {
                None => return Err(invalid()),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let b = self.peek().ok_or_else(invalid)?;
                    tag.push(b as char);
                    self.pos += 1;
                }
                Some(b) => {
                    tag.push(b as char);
                    self.pos += 1;
                }
            }
        }
        self.skip_ws();
        self.expect(b']')?;
        Ok(ETag { tag, weak })
    }

    // "(" Condition+ ")", cursor on '('.
    fn list(&mut self) -> Result<Vec<IfCondition>, headers::Error> {
        self.expect(b'(')?;
        let mut conditions = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Err(invalid()),
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                Some(b'<') => conditions.push(IfCondition {
                    not: false,
                    item: IfItem::StateToken(self.coded_url()?),
                }),
                Some(b'[') => conditions.push(IfCondition {
                    not: false,
                    item: IfItem::ETag(self.entity_tag()?),
                }),
                Some(b'N') if self.buf[self.pos..].starts_with(b"Not") => {
                    self.pos += 3;
                    self.skip_ws();
                    let item = match self.peek() {
                        Some(b'<') => IfItem::StateToken(self.coded_url()?),
                        Some(b'[') => IfItem::ETag(self.entity_tag()?),
                        _ => return Err(invalid()),
                    };
                    conditions.push(IfCondition { not: true, item });
                }
                Some(_) => return Err(invalid()),
            }
        }
        if conditions.is_empty() {
            return Err(invalid());
        }
        Ok(conditions)
    }

    fn parse(&mut self) -> Result<If, headers::Error> {
        let mut lists = Vec::new();
        let mut resource_tag: Option<url::Url> = None;
        loop {
            self.skip_ws();
            match self.peek() {
                None => break,
                Some(b'<') => {
                    let url = url::Url::parse(&self.coded_url()?).map_err(map_invalid)?;
                    resource_tag = Some(url);
                    // a resource tag must be followed by at least one list.
                    self.skip_ws();
                    if self.peek() != Some(b'(') {
                        return Err(invalid());
                    }
                }
                Some(b'(') => {
                    lists.push(IfList {
                        resource_tag: resource_tag.clone(),
                        conditions: self.list()?,
                    });
                }
                Some(_) => return Err(invalid()),
            }
        }
        if lists.is_empty() {
            return Err(invalid());
        }
        Ok(If(lists))
    }
}

impl Header for If {
    fn name() -> &'static HeaderName {
        &IF
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        IfParser::new(one(values)?.as_bytes()).parse()
    }

    fn encode<E>(&self, _values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        // request-only header, never generated.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_if(s: &'static str) -> Result<If, headers::Error> {
        let hdrval = HeaderValue::from_static(s);
        let mut iter = std::iter::once(&hdrval);
        If::decode(&mut iter)
    }

    #[test]
    fn if_single_token() {
        let hdr = parse_if("(<urn:uuid:150852e2-3847-42d5-8cbe-0f4f296f26cf>)").unwrap();
        assert_eq!(hdr.0.len(), 1);
        assert!(hdr.0[0].resource_tag.is_none());
        assert_eq!(
            hdr.0[0].conditions[0].item,
            IfItem::StateToken("urn:uuid:150852e2-3847-42d5-8cbe-0f4f296f26cf".to_string())
        );
    }

    #[test]
    fn if_tagged_lists() {
        let hdr = parse_if(r#" <http://x.yz/a%20b> ([W/"etag"] Not <DAV:no-lock>) (["other"]) "#)
            .unwrap();
        assert_eq!(hdr.0.len(), 2);
        // both lists inherit the resource tag.
        let tag = hdr.0[0].resource_tag.as_ref().unwrap();
        assert_eq!(tag.path(), "/a%20b");
        assert!(hdr.0[1].resource_tag.is_some());
        assert!(hdr.0[0].conditions[1].not);
        match &hdr.0[0].conditions[0].item {
            IfItem::ETag(etag) => {
                assert_eq!(etag.tag, "etag");
                assert!(etag.weak);
            }
            other => panic!("expected etag condition, got {:?}", other),
        }
    }

    #[test]
    fn if_garbage() {
        assert!(parse_if("()").is_err());
        assert!(parse_if("xyz").is_err());
        assert!(parse_if("(<urn:x>").is_err());
        assert!(parse_if("<urn:x>").is_err());
    }

    #[test]
    fn etag_equality() {
        let t1 = ETag::from_str(r#"W/"12345""#).unwrap();
        let t2 = ETag::from_str(r#"W/"12345""#).unwrap();
        let t3 = ETag::from_str(r#""12346""#).unwrap();
        let t4 = ETag::from_str(r#""12346""#).unwrap();
        assert!(t1 != t2);
        assert!(t2 != t3);
        assert!(t3 == t4);
    }

    #[test]
    fn timeout() {
        let hdrval = HeaderValue::from_static("Second-3600, Infinite");
        let mut iter = std::iter::once(&hdrval);
        let t = Timeout::decode(&mut iter).unwrap();
        assert_eq!(t.0, vec![DavTimeout::Seconds(3600), DavTimeout::Infinite]);
    }

    #[test]
    fn destination() {
        let hdrval = HeaderValue::from_static("http://localhost:8080/dst%20x?q=1");
        let mut iter = std::iter::once(&hdrval);
        let d = Destination::decode(&mut iter).unwrap();
        assert_eq!(d.0, "/dst%20x");
    }
}
