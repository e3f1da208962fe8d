//! Filesystem backend serving a local directory.
//!
//! Plain file I/O goes through `tokio::fs`; extended-attribute access,
//! `statvfs` and disk-usage measurement run on the blocking pool. Dead
//! properties are stored verbatim in user extended attributes named after
//! the property (`<namespace>#<name>`).
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::future::FutureExt;
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::davpath::DavPath;
use crate::fs::*;

// Namespace prefix for dead-property extended attributes.
#[cfg(unix)]
const XATTR_PREFIX: &str = "user.";

#[derive(Debug, Clone)]
pub struct LocalFs {
    basedir: PathBuf,
    public: bool,
}

#[derive(Debug)]
pub(crate) struct LocalFsMetaData(pub std::fs::Metadata);

#[derive(Debug)]
struct LocalFsFile(tokio::fs::File);

#[derive(Debug)]
pub(crate) struct LocalFsDirEntry {
    entry: tokio::fs::DirEntry,
    name: Vec<u8>,
}

impl LocalFs {
    /// Serve `base`. With `public` set, created files are world-readable
    /// (mode 644/755), otherwise private (600/700).
    pub fn new<P: AsRef<Path>>(base: P, public: bool) -> Box<LocalFs> {
        Box::new(LocalFs {
            basedir: base.as_ref().to_path_buf(),
            public,
        })
    }

    fn fspath(&self, path: &DavPath) -> PathBuf {
        path.as_pathbuf_with_prefix(&self.basedir)
    }
}

impl DavFileSystem for LocalFs {
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        async move { fs_metadata(self.fspath(path)).await }.boxed()
    }

    fn read_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<Box<dyn DavDirEntry>>> {
        async move { fs_read_dir(self.fspath(path)).await }.boxed()
    }

    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>> {
        async move { fs_open(self.fspath(path), options, self.public).await }.boxed()
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move { fs_create_dir(self.fspath(path), self.public).await }.boxed()
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            debug!("FS: remove_dir {:?}", self.fspath(path));
            tokio::fs::remove_dir(self.fspath(path)).await.map_err(to_fserror)
        }
        .boxed()
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            debug!("FS: remove_file {:?}", self.fspath(path));
            tokio::fs::remove_file(self.fspath(path)).await.map_err(to_fserror)
        }
        .boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            debug!("FS: rename {:?} {:?}", self.fspath(from), self.fspath(to));
            tokio::fs::rename(self.fspath(from), self.fspath(to))
                .await
                .map_err(to_fserror)
        }
        .boxed()
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        async move { fs_copy(self.fspath(from), self.fspath(to)).await }.boxed()
    }

    fn have_props<'a>(&'a self, _path: &'a DavPath) -> futures_util::future::BoxFuture<'a, bool> {
        futures_util::future::ready(cfg!(unix)).boxed()
    }

    fn patch_props<'a>(
        &'a self,
        path: &'a DavPath,
        patch: Vec<(bool, DavProp)>,
    ) -> FsFuture<'a, Vec<(StatusCode, DavProp)>> {
        async move { fs_patch_props(self.fspath(path), patch).await }.boxed()
    }

    fn get_props<'a>(&'a self, path: &'a DavPath, do_content: bool) -> FsFuture<'a, Vec<DavProp>> {
        async move { fs_get_props(self.fspath(path), do_content).await }.boxed()
    }

    fn get_prop<'a>(&'a self, path: &'a DavPath, prop: DavProp) -> FsFuture<'a, Vec<u8>> {
        async move { fs_get_prop(self.fspath(path), &prop).await }.boxed()
    }

    fn free_space<'a>(&'a self) -> FsFuture<'a, u64> {
        async move { fs_free_space(self.basedir.clone()).await }.boxed()
    }

    fn disk_usage<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, u64> {
        async move { fs_disk_usage(self.fspath(path)).await }.boxed()
    }
}

// The helpers below take full filesystem paths so the virtual-directory
// overlay can reuse them for its real-backed nodes.

pub(crate) async fn fs_metadata(fspath: PathBuf) -> FsResult<Box<dyn DavMetaData>> {
    let meta = tokio::fs::metadata(fspath).await.map_err(to_fserror)?;
    Ok(Box::new(LocalFsMetaData(meta)) as Box<dyn DavMetaData>)
}

pub(crate) async fn fs_read_dir(fspath: PathBuf) -> FsResult<Vec<Box<dyn DavDirEntry>>> {
    debug!("FS: read_dir {:?}", fspath);
    let mut rd = tokio::fs::read_dir(fspath).await.map_err(to_fserror)?;
    let mut entries: Vec<Box<dyn DavDirEntry>> = Vec::new();
    while let Some(entry) = rd.next_entry().await.map_err(to_fserror)? {
        entries.push(Box::new(LocalFsDirEntry::new(entry)));
    }
    Ok(entries)
}

pub(crate) async fn fs_open(
    fspath: PathBuf,
    options: OpenOptions,
    public: bool,
) -> FsResult<Box<dyn DavFile>> {
    debug!("FS: open {:?}", fspath);
    let mut oo = tokio::fs::OpenOptions::new();
    oo.read(options.read)
        .write(options.write)
        .append(options.append)
        .truncate(options.truncate)
        .create(options.create)
        .create_new(options.create_new);
    #[cfg(unix)]
    oo.mode(if public { 0o644 } else { 0o600 });
    #[cfg(not(unix))]
    let _ = public;
    let file = oo.open(fspath).await.map_err(to_fserror)?;
    Ok(Box::new(LocalFsFile(file)) as Box<dyn DavFile>)
}

pub(crate) async fn fs_create_dir(fspath: PathBuf, public: bool) -> FsResult<()> {
    debug!("FS: create_dir {:?}", fspath);
    let mut builder = tokio::fs::DirBuilder::new();
    #[cfg(unix)]
    builder.mode(if public { 0o755 } else { 0o700 });
    #[cfg(not(unix))]
    let _ = public;
    builder.create(fspath).await.map_err(to_fserror)
}

pub(crate) async fn fs_copy(from: PathBuf, to: PathBuf) -> FsResult<()> {
    debug!("FS: copy {:?} {:?}", from, to);
    tokio::fs::copy(from, to).await.map(|_| ()).map_err(|e| {
        debug!("copy failed: {:?}", e);
        to_fserror(e)
    })
}

pub(crate) async fn fs_free_space(fspath: PathBuf) -> FsResult<u64> {
    #[cfg(unix)]
    {
        blocking(move || statvfs_free(&fspath)).await
    }
    #[cfg(not(unix))]
    {
        let _ = fspath;
        Err(FsError::NotImplemented)
    }
}

pub(crate) async fn fs_disk_usage(fspath: PathBuf) -> FsResult<u64> {
    blocking(move || Ok(du(&fspath))).await
}

async fn blocking<T, F>(f: F) -> FsResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> FsResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or(Err(FsError::GeneralFailure))
}

#[cfg(unix)]
fn statvfs_free(path: &Path) -> FsResult<u64> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::GeneralFailure)?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(to_fserror(std::io::Error::last_os_error()));
    }
    Ok(st.f_bavail as u64 * st.f_frsize as u64)
}

fn du(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.is_dir() {
            if let Ok(rd) = std::fs::read_dir(path) {
                for entry in rd.flatten() {
                    total += du(&entry.path());
                }
            }
        } else {
            total += meta.len();
        }
    }
    total
}

// Dead properties as user extended attributes.

#[cfg(unix)]
pub(crate) async fn fs_patch_props(
    fspath: PathBuf,
    patch: Vec<(bool, DavProp)>,
) -> FsResult<Vec<(StatusCode, DavProp)>> {
    blocking(move || {
        let mut ret = Vec::new();
        for (set, prop) in patch {
            let attr = format!("{}{}", XATTR_PREFIX, prop.attr_key());
            let status = if set {
                let value = prop.xml.clone().unwrap_or_default();
                match xattr::set(&fspath, &attr, &value) {
                    Ok(()) => StatusCode::OK,
                    Err(e) => {
                        debug!("xattr set {} failed: {}", attr, e);
                        StatusCode::FORBIDDEN
                    }
                }
            } else {
                // removing a property that is not there is not an error.
                match xattr::remove(&fspath, &attr) {
                    Ok(()) => StatusCode::OK,
                    Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::OK,
                    Err(e) => {
                        debug!("xattr remove {} failed: {}", attr, e);
                        StatusCode::FORBIDDEN
                    }
                }
            };
            ret.push((status, prop));
        }
        Ok(ret)
    })
    .await
}

#[cfg(unix)]
pub(crate) async fn fs_get_props(fspath: PathBuf, do_content: bool) -> FsResult<Vec<DavProp>> {
    blocking(move || {
        let mut props = Vec::new();
        let attrs = xattr::list(&fspath).map_err(to_fserror)?;
        for attr in attrs {
            let attr = match attr.to_str() {
                Some(a) => a.to_string(),
                None => continue,
            };
            let key = match attr.strip_prefix(XATTR_PREFIX) {
                Some(k) => k,
                None => continue,
            };
            let mut prop = DavProp::from_attr_key(key);
            if do_content {
                prop.xml = xattr::get(&fspath, &attr).ok().flatten();
            }
            props.push(prop);
        }
        Ok(props)
    })
    .await
}

#[cfg(unix)]
pub(crate) async fn fs_get_prop(fspath: PathBuf, prop: &DavProp) -> FsResult<Vec<u8>> {
    let attr = format!("{}{}", XATTR_PREFIX, prop.attr_key());
    blocking(move || match xattr::get(&fspath, &attr) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(FsError::NotFound),
        Err(e) => Err(to_fserror(e)),
    })
    .await
}

#[cfg(not(unix))]
pub(crate) async fn fs_patch_props(
    _fspath: PathBuf,
    _patch: Vec<(bool, DavProp)>,
) -> FsResult<Vec<(StatusCode, DavProp)>> {
    Err(FsError::NotImplemented)
}

#[cfg(not(unix))]
pub(crate) async fn fs_get_props(_fspath: PathBuf, _do_content: bool) -> FsResult<Vec<DavProp>> {
    Err(FsError::NotImplemented)
}

#[cfg(not(unix))]
pub(crate) async fn fs_get_prop(_fspath: PathBuf, _prop: &DavProp) -> FsResult<Vec<u8>> {
    Err(FsError::NotImplemented)
}

impl LocalFsDirEntry {
    pub(crate) fn new(entry: tokio::fs::DirEntry) -> LocalFsDirEntry {
        #[cfg(unix)]
        let name = {
            use std::os::unix::ffi::OsStrExt;
            entry.file_name().as_os_str().as_bytes().to_vec()
        };
        #[cfg(not(unix))]
        let name = entry.file_name().to_string_lossy().into_owned().into_bytes();
        LocalFsDirEntry { entry, name }
    }
}

impl DavDirEntry for LocalFsDirEntry {
    fn name(&self) -> Vec<u8> {
        self.name.clone()
    }

    fn metadata(&self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        async move {
            let meta = self.entry.metadata().await.map_err(to_fserror)?;
            Ok(Box::new(LocalFsMetaData(meta)) as Box<dyn DavMetaData>)
        }
        .boxed()
    }
}

impl DavFile for LocalFsFile {
    fn metadata(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        async move {
            let meta = self.0.metadata().await.map_err(to_fserror)?;
            Ok(Box::new(LocalFsMetaData(meta)) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, Bytes> {
        async move {
            let mut buf = vec![0; count];
            let n = self.0.read(&mut buf).await.map_err(to_fserror)?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        }
        .boxed()
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()> {
        async move { self.0.write_all(&buf).await.map_err(to_fserror) }.boxed()
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        async move { self.0.flush().await.map_err(to_fserror) }.boxed()
    }
}

impl DavMetaData for LocalFsMetaData {
    fn len(&self) -> u64 {
        self.0.len()
    }

    fn modified(&self) -> FsResult<SystemTime> {
        self.0.modified().map_err(to_fserror)
    }

    fn created(&self) -> FsResult<SystemTime> {
        self.0.created().map_err(to_fserror)
    }

    fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    fn is_file(&self) -> bool {
        self.0.is_file()
    }

    #[cfg(unix)]
    fn executable(&self) -> FsResult<bool> {
        use std::os::unix::fs::PermissionsExt;
        if self.0.is_file() {
            return Ok((self.0.permissions().mode() & 0o100) > 0);
        }
        Err(FsError::NotImplemented)
    }
}

// Map I/O errors onto FsError, with errno refinement on unix.
pub(crate) fn to_fserror(e: std::io::Error) -> FsError {
    #[cfg(unix)]
    if let Some(errno) = e.raw_os_error() {
        match errno {
            libc::ENOSPC | libc::EDQUOT => return FsError::InsufficientStorage,
            libc::EACCES | libc::EPERM | libc::EROFS => return FsError::Forbidden,
            libc::ENOTEMPTY | libc::EEXIST => return FsError::Exists,
            libc::ENOTDIR | libc::EISDIR => return FsError::Forbidden,
            libc::ENOENT => return FsError::NotFound,
            libc::ENOSYS | libc::ENOTSUP => return FsError::NotImplemented,
            _ => {}
        }
    }
    match e.kind() {
        std::io::ErrorKind::NotFound => FsError::NotFound,
        std::io::ErrorKind::PermissionDenied => FsError::Forbidden,
        std::io::ErrorKind::AlreadyExists => FsError::Exists,
        _ => FsError::GeneralFailure,
    }
}
