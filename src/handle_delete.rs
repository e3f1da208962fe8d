use futures_util::future::{BoxFuture, FutureExt};
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::check_if;
use crate::davpath::DavPath;
use crate::fs::{DavMetaData, FsError};
use crate::multierror::MultiError;
use crate::util::DavMethod;
use crate::{DavError, DavResult};

// Per-descendant failures: missing entries report 404, everything else 403.
fn child_status(e: FsError) -> StatusCode {
    match e {
        FsError::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::FORBIDDEN,
    }
}

impl crate::davhandler::DavInner {
    // Depth-first removal. Failures are recorded in the multi-status map
    // and do not abort the walk; the parent directory is only removed when
    // all of its children went away.
    pub(crate) fn delete_items<'a>(
        &'a self,
        res: &'a mut MultiError,
        meta: Box<dyn DavMetaData>,
        path: &'a DavPath,
    ) -> BoxFuture<'a, DavResult<()>> {
        async move {
            if !meta.is_dir() {
                debug!("delete_items (file) {}", path);
                return self.fs.remove_file(path).await.map_err(|e| {
                    res.add_status(path, child_status(e));
                    DavError::Status(child_status(e))
                });
            }
            debug!("delete_items (dir) {}", path);

            let entries = match self.fs.read_dir(path).await {
                Ok(entries) => entries,
                Err(e) => {
                    res.add_status(path, child_status(e));
                    return Err(DavError::Status(child_status(e)));
                }
            };

            let mut result = Ok(());
            for entry in entries {
                self.cancelled()?;
                let meta = match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) => {
                        res.add_status(path, child_status(e));
                        result = Err(DavError::Status(child_status(e)));
                        continue;
                    }
                };
                let mut npath = path.clone();
                npath.push_segment(&entry.name());
                npath.add_slash_if(meta.is_dir());
                if let Err(e) = self.delete_items(res, meta, &npath).await {
                    result = Err(e);
                }
            }

            // do not try to remove a directory that still has content.
            result?;

            self.fs.remove_dir(path).await.map_err(|e| {
                res.add_status(path, child_status(e));
                DavError::Status(child_status(e))
            })
        }
        .boxed()
    }

    pub(crate) async fn handle_delete(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        // the scope of DELETE is implicitly the entire subtree.
        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await?;
        path.add_slash_if(meta.is_dir());

        check_if(req, &self.fs, &self.ls, &path, DavMethod::Delete, &self.prefix)
            .await
            .map_err(DavError::Status)?;

        let mut multierror = MultiError::new(&path);
        match self.delete_items(&mut multierror, meta, &path).await {
            Ok(()) => {
                self.ls.delete(&path.lock_key());
                multierror.final_status(StatusCode::NO_CONTENT)
            }
            Err(_) => multierror.close(),
        }
    }
}
