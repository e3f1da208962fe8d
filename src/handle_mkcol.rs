use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::check_if;
use crate::fs::FsError;
use crate::util::DavMethod;
use crate::{DavError, DavResult};

impl crate::davhandler::DavInner {
    pub(crate) async fn handle_mkcol(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let path = self.path(req);

        check_if(req, &self.fs, &self.ls, &path, DavMethod::MkCol, &self.prefix)
            .await
            .map_err(DavError::Status)?;

        match self.fs.create_dir(&path).await {
            // RFC 4918 9.3.1 MKCOL status codes.
            Err(FsError::Exists) => Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED)),
            Err(FsError::NotFound) => Err(DavError::Status(StatusCode::CONFLICT)),
            Err(_) => Err(DavError::Status(StatusCode::FORBIDDEN)),
            Ok(()) => {
                let res = Response::builder()
                    .status(StatusCode::CREATED)
                    .header("content-length", "0")
                    .body(Body::empty())
                    .unwrap();
                Ok(res)
            }
        }
    }
}
