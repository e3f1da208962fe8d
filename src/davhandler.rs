//! The main entry point of the library, `DavHandler`.
use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Buf;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::fs::DavFileSystem;
use crate::locks::LockManager;
use crate::util::{dav_method, notfound, DavMethod, DavMethodSet};
use crate::DavResult;

const MAX_XML_BODY: usize = 65536;

/// The webdav handler.
///
/// Use [`DavHandler::builder`] to configure one, then call
/// [`handle`](DavHandler::handle) for every request.
#[derive(Clone)]
pub struct DavHandler {
    config: Arc<DavConfig>,
}

/// Configuration for [`DavHandler`].
#[derive(Default)]
pub struct DavConfig {
    /// Prefix to be stripped off when handling requests.
    pub prefix: Option<String>,
    /// Filesystem backend.
    pub fs: Option<Box<dyn DavFileSystem>>,
    /// Lock table. One is created if not set.
    pub ls: Option<LockManager>,
    /// Set of allowed methods (`None` means all).
    pub allow: Option<DavMethodSet>,
    /// Refuse all write methods.
    pub readonly: bool,
    /// Cooperative shutdown signal, checked during long recursive
    /// operations.
    pub cancel: Option<CancellationToken>,
}

impl DavConfig {
    pub fn new() -> DavConfig {
        DavConfig::default()
    }

    /// Use the built configuration to create a handler.
    pub fn build_handler(self) -> DavHandler {
        DavHandler {
            config: Arc::new(self),
        }
    }

    /// Prefix to be stripped off before translating the rest of the
    /// request path to a filesystem path.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the filesystem backend to use.
    pub fn filesystem(mut self, fs: Box<dyn DavFileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Set the lock table to use.
    pub fn locksystem(mut self, ls: LockManager) -> Self {
        self.ls = Some(ls);
        self
    }

    /// Which methods to allow (default is all).
    pub fn allow_methods(mut self, allow: DavMethodSet) -> Self {
        self.allow = Some(allow);
        self
    }

    /// Reject every write method with 403 Forbidden.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Install a cancellation handle; cancelling it aborts long
    /// recursive operations at the next iteration.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

// Per-request state, instantiated from the shared config.
pub(crate) struct DavInner {
    pub prefix: String,
    pub fs: Box<dyn DavFileSystem>,
    pub ls: LockManager,
    pub allow: Option<DavMethodSet>,
    pub readonly: bool,
    pub cancel: CancellationToken,
}

impl From<&DavConfig> for DavInner {
    fn from(cfg: &DavConfig) -> Self {
        DavInner {
            prefix: cfg.prefix.clone().unwrap_or_default(),
            fs: cfg.fs.clone().expect("no filesystem configured"),
            ls: cfg.ls.clone().unwrap_or_default(),
            allow: cfg.allow,
            readonly: cfg.readonly,
            cancel: cfg.cancel.clone().unwrap_or_default(),
        }
    }
}

impl DavHandler {
    /// Return a configuration builder.
    pub fn builder() -> DavConfig {
        DavConfig::new()
    }

    /// Handle a webdav request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send,
    {
        if self.config.fs.is_none() {
            return notfound();
        }
        DavInner::from(&*self.config).handle(req).await
    }
}

impl DavInner {
    // helper.
    pub(crate) fn path(&self, req: &Request<()>) -> DavPath {
        // checked by the dispatcher, cannot fail here.
        DavPath::from_uri(req.uri(), &self.prefix).unwrap()
    }

    // helper.
    pub(crate) async fn has_parent(&self, path: &DavPath) -> bool {
        let p = path.parent();
        self.fs.metadata(&p).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    pub(crate) fn cancelled(&self) -> DavResult<()> {
        if self.cancel.is_cancelled() {
            warn!("request aborted by cancellation");
            return Err(DavError::IoError(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "cancelled",
            )));
        }
        Ok(())
    }

    async fn handle<ReqBody, ReqData, ReqError>(self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send,
    {
        match self.handle2(req).await {
            Ok(resp) => {
                debug!("== END REQUEST result OK");
                resp
            }
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                let mut resp = Response::builder()
                    .status(err.statuscode())
                    .header("content-length", "0");
                if err.must_close() {
                    resp = resp.header("connection", "close");
                }
                resp.body(Body::empty()).unwrap()
            }
        }
    }

    async fn handle2<ReqBody, ReqData, ReqError>(
        self,
        req: Request<ReqBody>,
    ) -> DavResult<Response<Body>>
    where
        ReqData: Buf + Send,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send,
    {
        let (parts, body) = req.into_parts();
        let req = Request::from_parts(parts, ());

        // translate HTTP method to webdav method.
        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", req.method(), req.uri());
                return Err(e);
            }
        };

        if let Some(ref allow) = self.allow {
            if !allow.contains(method) {
                debug!("method {} not allowed on request {}", req.method(), req.uri());
                return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
            }
        }

        // readonly mode refuses writes before even looking at the body.
        if self.readonly && method.is_write() {
            debug!("{:?} rejected, readonly mode", method);
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }

        // make sure the request path is valid.
        let path = DavPath::from_uri(req.uri(), &self.prefix)?;

        // PUT is the only handler that streams the body; the others get a
        // pre-read buffer, and most of them do not accept a body at all.
        let (body_strm, body_data) = match method {
            DavMethod::Put => (Some(body), Vec::new()),
            _ => (None, read_request_body(body, MAX_XML_BODY).await?),
        };
        match method {
            DavMethod::Put | DavMethod::PropFind | DavMethod::PropPatch | DavMethod::Lock => {}
            _ => {
                if !body_data.is_empty() {
                    return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
                }
            }
        }

        debug!("== START REQUEST {:?} {}", method, path);

        match method {
            DavMethod::Options => self.handle_options(&req).await,
            DavMethod::PropFind => self.handle_propfind(&req, &body_data).await,
            DavMethod::PropPatch => self.handle_proppatch(&req, &body_data).await,
            DavMethod::MkCol => self.handle_mkcol(&req).await,
            DavMethod::Delete => self.handle_delete(&req).await,
            DavMethod::Lock => self.handle_lock(&req, &body_data).await,
            DavMethod::Unlock => self.handle_unlock(&req).await,
            DavMethod::Head | DavMethod::Get => self.handle_get(&req).await,
            DavMethod::Put => self.handle_put(&req, body_strm.unwrap()).await,
            DavMethod::Copy | DavMethod::Move => self.handle_copymove(&req, method).await,
        }
    }
}

// read a request body, bounded.
async fn read_request_body<ReqBody, ReqData, ReqError>(
    body: ReqBody,
    max_size: usize,
) -> DavResult<Vec<u8>>
where
    ReqData: Buf + Send,
    ReqError: StdError + Send + Sync + 'static,
    ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send,
{
    let mut data = Vec::new();
    let mut body = std::pin::pin!(body);
    while let Some(frame) = body.as_mut().frame().await {
        let frame = frame.map_err(|_| {
            DavError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "error reading request body",
            ))
        })?;
        if let Ok(mut buf) = frame.into_data() {
            if data.len() + buf.remaining() > max_size {
                return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
            }
            while buf.has_remaining() {
                let chunk = buf.chunk();
                data.extend_from_slice(chunk);
                let n = chunk.len();
                buf.advance(n);
            }
        }
    }
    Ok(data)
}
