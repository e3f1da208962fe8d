use std::io::Cursor;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xmltree::Element;

use crate::body::Body;
use crate::conditional::check_if;
use crate::davheaders::{self, DavTimeout, Depth, IfItem};
use crate::fs::{FsError, OpenOptions};
use crate::locks::DavLock;
use crate::util::{DavMethod, MemBuffer};
use crate::xmltree_ext::{emitter, ElementExt};
use crate::{DavError, DavResult};

impl crate::davhandler::DavInner {
    pub(crate) async fn handle_lock(
        &self,
        req: &Request<()>,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>> {
        let path = self.path(req);
        let meta = self.fs.metadata(&path).await.ok();

        // An empty body is a lock refresh; the token comes in through the
        // If header, which must be exactly "(<token>)".
        if xmldata.is_empty() {
            let token = match req.headers().typed_try_get::<davheaders::If>() {
                Ok(Some(ifhdr)) => match &ifhdr.0[..] {
                    [list] if list.resource_tag.is_none() => match &list.conditions[..] {
                        [cond] if !cond.not => match &cond.item {
                            IfItem::StateToken(token) => token.clone(),
                            _ => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
                        },
                        _ => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
                    },
                    _ => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
                },
                _ => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
            };

            let timeout = get_timeout(req);
            let lock = self
                .ls
                .refresh(&path.lock_key(), &token, timeout)
                .map_err(|_| DavError::Status(StatusCode::BAD_REQUEST))?;

            return lock_response(&self.prefix, &lock, StatusCode::OK, None);
        }

        // Create mode.
        let deep = match req.headers().typed_try_get::<Depth>() {
            Ok(Some(Depth::Infinity)) | Ok(None) => true,
            Ok(Some(Depth::Zero)) => false,
            _ => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };

        let tree = Element::parse2(Cursor::new(xmldata))?;
        if tree.name != "lockinfo" {
            return Err(DavError::XmlParseError);
        }

        let mut shared: Option<bool> = None;
        let mut owner: Option<Element> = None;
        let mut locktype = false;

        for elem in tree.child_elems_iter() {
            match elem.name.as_str() {
                "lockscope" => {
                    for scope in elem.child_elems_iter() {
                        match scope.name.as_str() {
                            "exclusive" => shared = Some(false),
                            "shared" => shared = Some(true),
                            _ => return Err(DavError::XmlParseError),
                        }
                    }
                }
                "locktype" => {
                    for tp in elem.child_elems_iter() {
                        match tp.name.as_str() {
                            "write" => locktype = true,
                            _ => return Err(DavError::XmlParseError),
                        }
                    }
                }
                "owner" => {
                    let mut o = elem.clone();
                    o.prefix = Some("D".to_string());
                    owner = Some(o);
                }
                // unknown elements are ignored.
                _ => {}
            }
        }
        let shared = match (shared, locktype) {
            (Some(shared), true) => shared,
            _ => return Err(DavError::XmlParseError),
        };

        check_if(req, &self.fs, &self.ls, &path, DavMethod::Lock, &self.prefix)
            .await
            .map_err(DavError::Status)?;

        let timeout = get_timeout(req);
        let lock = self
            .ls
            .lock(&path.lock_key(), owner.as_ref(), timeout, shared, deep)
            .map_err(|_| DavError::Status(StatusCode::LOCKED))?;

        // lock-null resources: ensure the target exists.
        let mut status = StatusCode::OK;
        if meta.is_none() {
            let mut oo = OpenOptions::write();
            oo.create_new = true;
            match self.fs.open(&path, oo).await {
                Ok(_) => status = StatusCode::CREATED,
                Err(FsError::Exists) => {}
                Err(e) => {
                    self.ls.unlock(&path.lock_key(), &lock.token).ok();
                    return Err(DavError::FsError(e));
                }
            }
        }

        let token_hdr = davheaders::LockToken(format!("<{}>", lock.token));
        lock_response(&self.prefix, &lock, status, Some(token_hdr))
    }

    pub(crate) async fn handle_unlock(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let token = req
            .headers()
            .typed_get::<davheaders::LockToken>()
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;
        let token = token.0.trim_matches(|c| c == '<' || c == '>').to_string();

        let path = self.path(req);
        match self.ls.unlock(&path.lock_key(), &token) {
            Ok(()) => {
                let res = Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .header("content-length", "0")
                    .body(Body::empty())
                    .unwrap();
                Ok(res)
            }
            Err(()) => Err(DavError::Status(StatusCode::CONFLICT)),
        }
    }
}

// process the Timeout header; seconds, zero meaning "never expires".
fn get_timeout(req: &Request<()>) -> u64 {
    match req.headers().typed_get::<davheaders::Timeout>() {
        Some(davheaders::Timeout(ref v)) if !v.is_empty() => match v[0] {
            DavTimeout::Infinite => 0,
            DavTimeout::Seconds(n) => n as u64,
        },
        _ => 0,
    }
}

pub(crate) fn build_lock_prop(prefix: &str, lock: &DavLock) -> Element {
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
        Element::new2("D:depth").text(match lock.deep {
            false => "0",
            true => "infinity",
        }),
    );
    actlock.push(Element::new2("D:timeout").text(match lock.timeout {
        None => "Infinite".to_string(),
        Some(d) => format!("Second-{}", d.as_secs()),
    }));

    let mut locktoken = Element::new2("D:locktoken");
    locktoken.push(Element::new2("D:href").text(lock.token.clone()));
    actlock.push(locktoken);

    let mut lockroot = Element::new2("D:lockroot");
    lockroot.push(Element::new2("D:href").text(format!("{}{}", prefix, lock.path)));
    actlock.push(lockroot);

    if let Some(ref o) = lock.owner {
        actlock.push(o.clone());
    }

    actlock
}

pub(crate) fn list_supportedlock() -> Element {
    let mut elem = Element::new2("D:supportedlock");
    for scope in ["D:exclusive", "D:shared"] {
        let mut entry = Element::new2("D:lockentry");
        let mut lockscope = Element::new2("D:lockscope");
        lockscope.push(Element::new2(scope));
        entry.push(lockscope);
        let mut locktype = Element::new2("D:locktype");
        locktype.push(Element::new2("D:write"));
        entry.push(locktype);
        elem.push(entry);
    }
    elem
}

pub(crate) fn list_lockdiscovery(ls: &crate::locks::LockManager, lock_key: &str, prefix: &str) -> Element {
    let mut elem = Element::new2("D:lockdiscovery");
    for lock in ls.discover(lock_key) {
        elem.push(build_lock_prop(prefix, &lock));
    }
    elem
}

fn lock_response(
    prefix: &str,
    lock: &DavLock,
    status: StatusCode,
    token_hdr: Option<davheaders::LockToken>,
) -> DavResult<Response<Body>> {
    let mut ldis = Element::new2("D:lockdiscovery");
    ldis.push(build_lock_prop(prefix, lock));
    let mut prop = Element::new2("D:prop").ns("D", "DAV:");
    prop.push(ldis);

    let mut buffer = MemBuffer::new();
    {
        let mut xw = emitter(&mut buffer)?;
        prop.write_ev(&mut xw)?;
    }

    let mut res = Response::builder()
        .status(status)
        .header("content-type", "application/xml; charset=utf-8");
    if let Some(hdr) = token_hdr {
        res = res.header("Lock-Token", hdr.0);
    }
    Ok(res.body(Body::from(buffer.take())).unwrap())
}
