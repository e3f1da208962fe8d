use std::error::Error as StdError;

use bytes::{Buf, Bytes};
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;

use crate::body::Body;
use crate::conditional::check_if;
use crate::fs::{FsError, OpenOptions};
use crate::util::DavMethod;
use crate::{DavError, DavResult};

impl crate::davhandler::DavInner {
    pub(crate) async fn handle_put<ReqBody, ReqData, ReqError>(
        &self,
        req: &Request<()>,
        body: ReqBody,
    ) -> DavResult<Response<Body>>
    where
        ReqData: Buf + Send,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send,
    {
        let path = self.path(req);
        let meta = self.fs.metadata(&path).await;

        // Conditional request headers are not honored on PUT.
        for name in ["if-match", "if-none-match", "expect"] {
            if req.headers().contains_key(name) {
                warn!("PUT {}: ignoring {} header", path, name);
            }
        }

        if let Ok(ref meta) = meta {
            if meta.is_virtual() {
                return Err(DavError::Status(StatusCode::INTERNAL_SERVER_ERROR));
            }
        }

        check_if(req, &self.fs, &self.ls, &path, DavMethod::Put, &self.prefix)
            .await
            .map_err(DavError::Status)?;

        let existed = meta.is_ok();

        let mut oo = OpenOptions::write();
        oo.create = true;
        oo.truncate = true;
        let mut file = match self.fs.open(&path, oo).await {
            Ok(f) => f,
            Err(FsError::GeneralFailure) => {
                return Err(DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))
            }
            Err(e) => return Err(DavError::FsError(e)),
        };

        // Stream the body to the file one chunk at a time; nothing is
        // accumulated. A failed write surfaces as 500 at finalization.
        let mut body = std::pin::pin!(body);
        let mut write_error = false;
        while let Some(frame) = body.as_mut().frame().await {
            let frame = frame.map_err(|_| {
                DavError::IoError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "error reading request body",
                ))
            })?;
            let mut buf = match frame.into_data() {
                Ok(buf) => buf,
                Err(_) => continue,
            };
            while buf.has_remaining() {
                let chunk = Bytes::copy_from_slice(buf.chunk());
                let n = chunk.len();
                if let Err(e) = file.write_bytes(chunk).await {
                    error!("PUT {}: write failed: {}", path, e);
                    write_error = true;
                    break;
                }
                buf.advance(n);
            }
            if write_error {
                break;
            }
        }
        if !write_error {
            if let Err(e) = file.flush().await {
                error!("PUT {}: flush failed: {}", path, e);
                write_error = true;
            }
        }
        if write_error {
            return Err(DavError::StatusClose(StatusCode::INTERNAL_SERVER_ERROR));
        }

        let mut res = Response::builder()
            .status(if existed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            })
            .header("content-length", "0");
        if let Ok(meta) = file.metadata().await {
            if let Some(etag) = meta.etag() {
                res = res.header("ETag", format!("\"{}\"", etag));
            }
        }
        Ok(res.body(Body::empty()).unwrap())
    }
}
