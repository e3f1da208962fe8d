//! Evaluation of the `If` request header.
//!
//! Parsing lives in `davheaders`; this module walks the typed AST and
//! decides whether the request may proceed. State tokens submitted anywhere
//! in the header are collected as `(path, token)` pairs even when their
//! condition evaluates to false, so that a `Not <token>` still proves
//! possession of the token.
use headers::HeaderMapExt;
use http::{Request, StatusCode};

use crate::davheaders::{self, IfItem};
use crate::davpath::DavPath;
use crate::fs::DavFileSystem;
use crate::locks::LockManager;
use crate::util::DavMethod;

/// A `(path, token)` pair submitted through the `If` header.
#[derive(Debug, Clone)]
pub(crate) struct LockSubmitted {
    pub path: String,
    pub token: String,
}

pub(crate) fn submitted_tokens(submitted: &[LockSubmitted]) -> Vec<&str> {
    submitted.iter().map(|s| s.token.as_str()).collect()
}

/// Check the `If` header against the lock table and the resource state.
///
/// Returns the submitted `(path, token)` pairs when the request may
/// proceed, or the status to fail with:
/// - no `If` header, no locks in the way: proceed;
/// - no `If` header, path or ancestor locked: 423;
/// - header evaluates false: 412;
/// - header true but a covering lock was not submitted (and the method is
///   not COPY): 423.
pub(crate) async fn check_if(
    req: &Request<()>,
    fs: &Box<dyn DavFileSystem>,
    ls: &LockManager,
    path: &DavPath,
    method: DavMethod,
    prefix: &str,
) -> Result<Vec<LockSubmitted>, StatusCode> {
    let key = path.lock_key();

    let ifhdr = match req.headers().typed_try_get::<davheaders::If>() {
        Ok(hdr) => hdr,
        Err(_) => return Err(StatusCode::BAD_REQUEST),
    };
    let ifhdr = match ifhdr {
        None => {
            if ls.has_other_locks(&key, &[]) {
                debug!("check_if: {} locked and no If header", path);
                return Err(StatusCode::LOCKED);
            }
            return Ok(Vec::new());
        }
        Some(h) => h,
    };

    let mut submitted: Vec<LockSubmitted> = Vec::new();
    let mut valid = false;

    for list in &ifhdr.0 {
        // A resource tag switches the resource the conditions apply to.
        let ctx_path = match list.resource_tag {
            None => path.clone(),
            Some(ref url) => match DavPath::from_str_and_prefix(url.path(), prefix) {
                Ok(p) => p,
                Err(_) => {
                    debug!("check_if: unusable resource tag {}", url);
                    continue;
                }
            },
        };
        let ctx_key = ctx_path.lock_key();

        let mut list_ok = true;
        for cond in &list.conditions {
            let matches = match cond.item {
                IfItem::StateToken(ref token) => {
                    submitted.push(LockSubmitted {
                        path: ctx_key.clone(),
                        token: token.clone(),
                    });
                    // DAV:no-lock never matches anything.
                    token != "DAV:no-lock" && ls.find_by_token(&ctx_key, token).is_some()
                }
                IfItem::ETag(ref etag) => match fs.metadata(&ctx_path).await {
                    Ok(meta) => match meta.etag() {
                        Some(tag) => *etag == davheaders::ETag::strong(tag),
                        None => false,
                    },
                    Err(_) => false,
                },
            };
            if matches == cond.not {
                // keep going to collect the remaining state tokens.
                list_ok = false;
            }
        }
        if list_ok {
            valid = true;
        }
    }

    if !valid {
        return Err(StatusCode::PRECONDITION_FAILED);
    }
    for s in &submitted {
        trace!("check_if: submitted token {} for {}", s.token, s.path);
    }
    if method != DavMethod::Copy && ls.has_other_locks(&key, &submitted_tokens(&submitted)) {
        return Err(StatusCode::LOCKED);
    }
    Ok(submitted)
}
