use futures_util::future::{BoxFuture, FutureExt};
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::{check_if, submitted_tokens};
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::fserror_to_status;
use crate::multierror::MultiError;
use crate::util::DavMethod;
use crate::{DavError, DavResult};

impl crate::davhandler::DavInner {
    // Manual recursive copy. `topdest` guards against copying a tree into
    // itself when the destination lies below the source.
    fn do_copy<'a>(
        &'a self,
        source: &'a DavPath,
        topdest: &'a DavPath,
        dest: &'a DavPath,
        depth: Depth,
        multierror: &'a mut MultiError,
    ) -> BoxFuture<'a, DavResult<()>> {
        async move {
            debug!("do_copy {} {} depth {:?}", source, dest, depth);
            if source == topdest {
                return Ok(());
            }

            let meta = match self.fs.metadata(source).await {
                Ok(meta) => meta,
                Err(e) => {
                    multierror.add_status(source, fserror_to_status(e));
                    return Err(DavError::FsError(e));
                }
            };

            if !meta.is_dir() {
                return match self.fs.copy(source, dest).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        debug!("do_copy: copy failed: {:?}", e);
                        multierror.add_status(dest, fserror_to_status(e));
                        Err(DavError::FsError(e))
                    }
                };
            }

            // the filesystem cannot copy a whole directory; create the
            // destination collection, then recurse for depth infinity.
            if let Err(e) = self.fs.create_dir(dest).await {
                if depth != Depth::Zero || e != crate::fs::FsError::Exists {
                    debug!("do_copy: create_dir failed: {:?}", e);
                    multierror.add_status(dest, fserror_to_status(e));
                    return Err(DavError::FsError(e));
                }
            }
            if depth == Depth::Zero {
                return Ok(());
            }

            let entries = match self.fs.read_dir(source).await {
                Ok(entries) => entries,
                Err(e) => {
                    multierror.add_status(source, fserror_to_status(e));
                    return Err(DavError::FsError(e));
                }
            };

            // on child errors, keep going; the last error is returned.
            let mut retval = Ok(());
            for entry in entries {
                self.cancelled()?;
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) => {
                        multierror.add_status(source, fserror_to_status(e));
                        retval = Err(DavError::FsError(e));
                        continue;
                    }
                };
                let name = entry.name();
                let mut nsrc = source.clone();
                let mut ndest = dest.clone();
                nsrc.push_segment(&name);
                ndest.push_segment(&name);
                if meta.is_dir() {
                    nsrc.add_slash();
                    ndest.add_slash();
                }
                if let Err(e) = self.do_copy(&nsrc, topdest, &ndest, depth, multierror).await {
                    retval = Err(e);
                }
            }
            retval
        }
        .boxed()
    }

    pub(crate) async fn handle_copymove(
        &self,
        req: &Request<()>,
        method: DavMethod,
    ) -> DavResult<Response<Body>> {
        // overwrite is allowed unless explicitly disabled.
        let overwrite = req
            .headers()
            .typed_get::<davheaders::Overwrite>()
            .map_or(true, |o| o.0);
        let depth = match req.headers().typed_get::<Depth>() {
            Some(Depth::Infinity) | None => Depth::Infinity,
            Some(Depth::Zero) if method == DavMethod::Copy => Depth::Zero,
            _ => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };

        let dest = req
            .headers()
            .typed_get::<davheaders::Destination>()
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;
        let mut dest = DavPath::from_str_and_prefix(&dest.0, &self.prefix)?;

        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await?;
        path.add_slash_if(meta.is_dir());

        // the virtual overlay cannot be copied or moved.
        if meta.is_virtual() {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }

        if !self.has_parent(&dest).await {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }

        let dmeta = self.fs.metadata(&dest).await;
        let exists = dmeta.is_ok();
        let dest_is_dir = dmeta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
        if let Ok(ref dmeta) = dmeta {
            if dmeta.is_virtual() {
                return Err(DavError::Status(StatusCode::FORBIDDEN));
            }
        }
        dest.add_slash_if(dest_is_dir);

        if !overwrite && exists {
            return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
        }
        if path == dest {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }

        let submitted = check_if(req, &self.fs, &self.ls, &path, method, &self.prefix)
            .await
            .map_err(DavError::Status)?;

        // the destination's covering locks must have been submitted too.
        if self
            .ls
            .has_other_locks(&dest.lock_key(), &submitted_tokens(&submitted))
        {
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        let mut multierror = MultiError::new(&path);

        // merging over an existing directory: delete it first, then do the
        // copy or move as if the destination were fresh.
        if overwrite && exists && dest_is_dir {
            debug!("handle_copymove: deleting destination {}", dest);
            if self
                .delete_items(&mut multierror, dmeta.unwrap(), &dest)
                .await
                .is_err()
            {
                return multierror.close();
            }
            self.ls.delete(&dest.lock_key());
        }

        if method == DavMethod::Copy {
            match self.do_copy(&path, &dest, &dest, depth, &mut multierror).await {
                Err(_) => multierror.close(),
                Ok(()) => {
                    let s = if exists {
                        StatusCode::NO_CONTENT
                    } else {
                        StatusCode::CREATED
                    };
                    multierror.final_status(s)
                }
            }
        } else {
            if let Err(e) = self.fs.rename(&path, &dest).await {
                multierror.add_status(&path, fserror_to_status(e));
                return multierror.close();
            }
            // the locks at the old location die with it.
            self.ls.delete(&path.lock_key());
            let s = if exists {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::CREATED
            };
            multierror.final_status(s)
        }
    }
}
