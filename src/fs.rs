//! The traits that define a filesystem backend.
//!
//! All I/O methods return boxed futures so that the backends can be used
//! as trait objects (`Box<dyn DavFileSystem>`).
use std::fmt::Debug;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::future::{self, BoxFuture, FutureExt};
use http::StatusCode;

use crate::davpath::DavPath;

pub type FsResult<T> = std::result::Result<T, FsError>;
pub type FsFuture<'a, T> = BoxFuture<'a, FsResult<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    Forbidden,
    Exists,
    NotImplemented,
    GeneralFailure,
    InsufficientStorage,
}

impl std::error::Error for FsError {}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        let kind = match e {
            FsError::NotFound => io::ErrorKind::NotFound,
            FsError::Forbidden => io::ErrorKind::PermissionDenied,
            FsError::Exists => io::ErrorKind::AlreadyExists,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

macro_rules! notimplemented {
    () => {
        future::ready(Err(FsError::NotImplemented)).boxed()
    };
}

/// A property stored on a resource, live or dead.
#[derive(Debug, Clone)]
pub struct DavProp {
    pub name: String,
    pub prefix: Option<String>,
    pub namespace: Option<String>,
    pub xml: Option<Vec<u8>>,
}

impl DavProp {
    /// The extended-attribute key a dead property is stored under:
    /// `<namespace>#<name>`, or just `<name>` when unnamespaced.
    pub fn attr_key(&self) -> String {
        match self.namespace {
            Some(ref ns) => format!("{}#{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    /// The inverse of `attr_key`.
    pub fn from_attr_key(key: &str) -> DavProp {
        let (namespace, name) = match key.rsplit_once('#') {
            Some((ns, name)) => (Some(ns.to_string()), name.to_string()),
            None => (None, key.to_string()),
        };
        DavProp {
            name,
            prefix: None,
            namespace,
            xml: None,
        }
    }
}

/// The trait that defines a filesystem backend.
pub trait DavFileSystem: Debug + Sync + Send + BoxCloneFs {
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>>;

    fn read_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<Box<dyn DavDirEntry>>>;

    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>>;

    #[allow(unused_variables)]
    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        notimplemented!()
    }

    #[allow(unused_variables)]
    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        notimplemented!()
    }

    #[allow(unused_variables)]
    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        notimplemented!()
    }

    #[allow(unused_variables)]
    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        notimplemented!()
    }

    /// Copy a single file. Directories are copied by the caller, entry
    /// by entry, so that partial failures can be reported per path.
    #[allow(unused_variables)]
    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        notimplemented!()
    }

    /// Does this backend support dead properties on this path?
    #[allow(unused_variables)]
    fn have_props<'a>(&'a self, path: &'a DavPath) -> BoxFuture<'a, bool> {
        future::ready(false).boxed()
    }

    /// Apply an ordered list of `(set, prop)` patches. Returns the
    /// per-property status.
    #[allow(unused_variables)]
    fn patch_props<'a>(
        &'a self,
        path: &'a DavPath,
        patch: Vec<(bool, DavProp)>,
    ) -> FsFuture<'a, Vec<(StatusCode, DavProp)>> {
        notimplemented!()
    }

    /// List the dead properties of a resource. With `do_content` the
    /// stored XML fragments are included.
    #[allow(unused_variables)]
    fn get_props<'a>(&'a self, path: &'a DavPath, do_content: bool) -> FsFuture<'a, Vec<DavProp>> {
        notimplemented!()
    }

    /// Read one dead property, as an XML fragment.
    #[allow(unused_variables)]
    fn get_prop<'a>(&'a self, path: &'a DavPath, prop: DavProp) -> FsFuture<'a, Vec<u8>> {
        notimplemented!()
    }

    /// Free space on the filesystem holding this tree, in bytes.
    fn free_space<'a>(&'a self) -> FsFuture<'a, u64> {
        notimplemented!()
    }

    /// Measured disk usage of a subtree. Possibly slow; only invoked for
    /// explicit quota-used-bytes requests.
    #[allow(unused_variables)]
    fn disk_usage<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, u64> {
        notimplemented!()
    }
}

#[doc(hidden)]
pub trait BoxCloneFs {
    fn box_clone(&self) -> Box<dyn DavFileSystem>;
}

// generic Clone, calls implementation-specific box_clone().
impl Clone for Box<dyn DavFileSystem> {
    fn clone(&self) -> Box<dyn DavFileSystem> {
        self.box_clone()
    }
}

#[doc(hidden)]
impl<FS: Clone + DavFileSystem + 'static> BoxCloneFs for FS {
    fn box_clone(&self) -> Box<dyn DavFileSystem> {
        Box::new((*self).clone())
    }
}

/// One directory entry.
pub trait DavDirEntry: Debug + Send + Sync {
    fn name(&self) -> Vec<u8>;
    fn metadata(&self) -> FsFuture<'_, Box<dyn DavMetaData>>;
}

/// An open file.
pub trait DavFile: Debug + Send {
    fn metadata(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>>;
    /// Read up to `count` bytes. An empty buffer means end-of-file.
    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, Bytes>;
    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()>;
    fn flush(&mut self) -> FsFuture<'_, ()>;
}

/// File or directory metadata.
pub trait DavMetaData: Debug + Send + Sync {
    fn len(&self) -> u64;
    fn modified(&self) -> FsResult<SystemTime>;
    fn is_dir(&self) -> bool;

    // default implementations.

    /// Apache-style etag built from length and modification time.
    fn etag(&self) -> Option<String> {
        if let Ok(t) = self.modified() {
            if let Ok(t) = t.duration_since(UNIX_EPOCH) {
                return Some(format!(
                    "{:x}-{:x}",
                    self.len(),
                    t.as_secs() * 1_000_000 + t.subsec_nanos() as u64 / 1000
                ));
            }
        }
        Some(format!("{:x}", self.len()))
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_file(&self) -> bool {
        !self.is_dir()
    }

    fn created(&self) -> FsResult<SystemTime> {
        Err(FsError::NotImplemented)
    }

    fn executable(&self) -> FsResult<bool> {
        Err(FsError::NotImplemented)
    }

    /// Is this a node of a virtual directory tree? Write methods refuse
    /// to touch virtual nodes.
    fn is_virtual(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub create_new: bool,
}

impl OpenOptions {
    pub fn read() -> OpenOptions {
        OpenOptions {
            read: true,
            ..OpenOptions::default()
        }
    }

    pub fn write() -> OpenOptions {
        OpenOptions {
            write: true,
            ..OpenOptions::default()
        }
    }
}
