//! Virtual directory overlay.
//!
//! An in-memory tree of named nodes; the leaves bind real filesystem
//! entries. A directory node can additionally be bound to a real directory
//! whose contents are merged into listings, with virtual names shadowing
//! real ones. Path resolution descends the virtual tree while segments
//! match and hands the remainder to the real backend at the first
//! non-virtual segment.
//!
//! The tree is immutable once built; write operations aimed at a virtual
//! node fail, operations on a real entry reached through a virtual parent
//! behave normally.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::future::FutureExt;
use http::StatusCode;

use crate::davpath::DavPath;
use crate::fs::*;
use crate::localfs;

#[derive(Debug)]
struct VfsNode {
    name: String,
    // a directory node may merge a real directory into its listing;
    // a leaf node must bind one.
    real: Option<PathBuf>,
    children: Vec<usize>,
    dir: bool,
}

#[derive(Debug)]
struct VfsInner {
    nodes: Vec<VfsNode>,
    public: bool,
}

const ROOT: usize = 0;

/// Filesystem backend serving a virtual directory tree.
#[derive(Debug, Clone)]
pub struct VirtualFs(Arc<VfsInner>);

/// Builder for [`VirtualFs`].
#[derive(Debug)]
pub struct VirtualFsBuilder {
    nodes: Vec<VfsNode>,
    public: bool,
}

enum Resolved {
    Virtual(usize),
    Real(PathBuf),
    NotFound,
}

impl VirtualFs {
    pub fn builder() -> VirtualFsBuilder {
        VirtualFsBuilder {
            nodes: vec![VfsNode {
                name: String::new(),
                real: None,
                children: Vec::new(),
                dir: true,
            }],
            public: false,
        }
    }

    fn resolve(&self, path: &DavPath) -> Resolved {
        let nodes = &self.0.nodes;
        let mut cur = ROOT;
        let bytes = path.as_bytes();
        let mut segs = bytes
            .split(|&b| b == b'/')
            .filter(|s| !s.is_empty())
            .peekable();

        while let Some(seg) = segs.next() {
            let name = String::from_utf8_lossy(seg);
            match nodes[cur]
                .children
                .iter()
                .find(|&&c| nodes[c].name == name.as_ref())
            {
                Some(&child) if nodes[child].dir => cur = child,
                Some(&child) => {
                    // a bound leaf; hand the remainder to its real entry.
                    let mut real = nodes[child].real.clone().expect("leaf without binding");
                    for rest in segs {
                        real.push(String::from_utf8_lossy(rest).as_ref());
                    }
                    return Resolved::Real(real);
                }
                None => {
                    // first non-virtual segment.
                    return match nodes[cur].real {
                        Some(ref base) => {
                            let mut real = base.join(name.as_ref());
                            for rest in segs {
                                real.push(String::from_utf8_lossy(rest).as_ref());
                            }
                            Resolved::Real(real)
                        }
                        None => Resolved::NotFound,
                    };
                }
            }
        }
        match (self.0.nodes[cur].dir, self.0.nodes[cur].real.clone()) {
            (true, _) => Resolved::Virtual(cur),
            (false, Some(real)) => Resolved::Real(real),
            (false, None) => Resolved::NotFound,
        }
    }

    // Real paths below a virtual directory, for disk usage accounting.
    fn bindings(&self, id: usize, out: &mut Vec<PathBuf>) {
        let node = &self.0.nodes[id];
        if let Some(ref real) = node.real {
            out.push(real.clone());
        }
        for &c in &node.children {
            self.bindings(c, out);
        }
    }
}

impl VirtualFsBuilder {
    /// Make created files world-readable.
    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    /// Bind the virtual root to a real directory whose contents are merged
    /// into the root listing.
    pub fn bind_root(self, real: impl Into<PathBuf>) -> Self {
        self.bind("/", real)
    }

    /// Bind a real file or directory at a virtual path. Intermediate
    /// virtual directories are created. Binding an existing virtual
    /// directory node attaches the real directory as its merge source.
    pub fn bind(mut self, vpath: &str, real: impl Into<PathBuf>) -> Self {
        let id = self.mkpath(vpath, true);
        self.nodes[id].real = Some(real.into());
        self
    }

    /// Create an (empty) virtual directory.
    pub fn dir(mut self, vpath: &str) -> Self {
        self.mkpath(vpath, false);
        self
    }

    fn mkpath(&mut self, vpath: &str, leaf_last: bool) -> usize {
        let segs: Vec<&str> = vpath.split('/').filter(|s| !s.is_empty()).collect();
        let mut cur = ROOT;
        for (i, seg) in segs.iter().enumerate() {
            let last = i == segs.len() - 1;
            if let Some(&child) = self.nodes[cur]
                .children
                .iter()
                .find(|&&c| self.nodes[c].name == *seg)
            {
                cur = child;
                continue;
            }
            let id = self.nodes.len();
            self.nodes.push(VfsNode {
                name: seg.to_string(),
                real: None,
                children: Vec::new(),
                // the final segment of a bind() is a leaf delegating to
                // its real entry; everything else is a virtual directory.
                dir: !(last && leaf_last),
            });
            self.nodes[cur].children.push(id);
            cur = id;
        }
        cur
    }

    pub fn build(self) -> Box<VirtualFs> {
        Box::new(VirtualFs(Arc::new(VfsInner {
            nodes: self.nodes,
            public: self.public,
        })))
    }
}

#[derive(Debug)]
struct VirtualMetaData;

impl DavMetaData for VirtualMetaData {
    fn len(&self) -> u64 {
        0
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Err(FsError::NotImplemented)
    }

    fn is_dir(&self) -> bool {
        true
    }

    fn etag(&self) -> Option<String> {
        None
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct VirtualDirEntry {
    name: String,
    // None for virtual directories, a real path for bound leaves.
    real: Option<PathBuf>,
}

impl DavDirEntry for VirtualDirEntry {
    fn name(&self) -> Vec<u8> {
        self.name.clone().into_bytes()
    }

    fn metadata(&self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        async move {
            match self.real {
                Some(ref real) => localfs::fs_metadata(real.clone()).await,
                None => Ok(Box::new(VirtualMetaData) as Box<dyn DavMetaData>),
            }
        }
        .boxed()
    }
}

impl DavFileSystem for VirtualFs {
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        async move {
            match self.resolve(path) {
                Resolved::Virtual(_) => Ok(Box::new(VirtualMetaData) as Box<dyn DavMetaData>),
                Resolved::Real(p) => localfs::fs_metadata(p).await,
                Resolved::NotFound => Err(FsError::NotFound),
            }
        }
        .boxed()
    }

    fn read_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<Box<dyn DavDirEntry>>> {
        async move {
            match self.resolve(path) {
                Resolved::Virtual(id) => {
                    let node = &self.0.nodes[id];
                    let mut entries: Vec<Box<dyn DavDirEntry>> = Vec::new();
                    for &c in &node.children {
                        let child = &self.0.nodes[c];
                        entries.push(Box::new(VirtualDirEntry {
                            name: child.name.clone(),
                            real: if child.dir { None } else { child.real.clone() },
                        }));
                    }
                    // merge the bound real directory; virtual names shadow.
                    if let Some(ref real) = node.real {
                        for entry in localfs::fs_read_dir(real.clone()).await? {
                            let name = String::from_utf8_lossy(&entry.name()).into_owned();
                            if !node
                                .children
                                .iter()
                                .any(|&c| self.0.nodes[c].name == name)
                            {
                                entries.push(entry);
                            }
                        }
                    }
                    Ok(entries)
                }
                Resolved::Real(p) => localfs::fs_read_dir(p).await,
                Resolved::NotFound => Err(FsError::NotFound),
            }
        }
        .boxed()
    }

    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>> {
        async move {
            match self.resolve(path) {
                Resolved::Virtual(_) => Err(FsError::GeneralFailure),
                Resolved::Real(p) => localfs::fs_open(p, options, self.0.public).await,
                Resolved::NotFound => Err(FsError::NotFound),
            }
        }
        .boxed()
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            match self.resolve(path) {
                Resolved::Virtual(_) => Err(FsError::Forbidden),
                Resolved::Real(p) => localfs::fs_create_dir(p, self.0.public).await,
                Resolved::NotFound => Err(FsError::Forbidden),
            }
        }
        .boxed()
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            match self.resolve(path) {
                Resolved::Virtual(_) => Err(FsError::Forbidden),
                Resolved::Real(p) => tokio::fs::remove_dir(p).await.map_err(localfs::to_fserror),
                Resolved::NotFound => Err(FsError::NotFound),
            }
        }
        .boxed()
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            match self.resolve(path) {
                Resolved::Virtual(_) => Err(FsError::Forbidden),
                Resolved::Real(p) => tokio::fs::remove_file(p).await.map_err(localfs::to_fserror),
                Resolved::NotFound => Err(FsError::NotFound),
            }
        }
        .boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            match (self.resolve(from), self.resolve(to)) {
                (Resolved::Real(f), Resolved::Real(t)) => {
                    tokio::fs::rename(f, t).await.map_err(localfs::to_fserror)
                }
                (Resolved::NotFound, _) => Err(FsError::NotFound),
                _ => Err(FsError::Forbidden),
            }
        }
        .boxed()
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            match (self.resolve(from), self.resolve(to)) {
                (Resolved::Real(f), Resolved::Real(t)) => localfs::fs_copy(f, t).await,
                (Resolved::NotFound, _) => Err(FsError::NotFound),
                _ => Err(FsError::Forbidden),
            }
        }
        .boxed()
    }

    fn have_props<'a>(&'a self, path: &'a DavPath) -> futures_util::future::BoxFuture<'a, bool> {
        let real = matches!(self.resolve(path), Resolved::Real(_));
        futures_util::future::ready(real && cfg!(unix)).boxed()
    }

    fn patch_props<'a>(
        &'a self,
        path: &'a DavPath,
        patch: Vec<(bool, DavProp)>,
    ) -> FsFuture<'a, Vec<(StatusCode, DavProp)>> {
        async move {
            match self.resolve(path) {
                Resolved::Real(p) => localfs::fs_patch_props(p, patch).await,
                Resolved::Virtual(_) => Err(FsError::Forbidden),
                Resolved::NotFound => Err(FsError::NotFound),
            }
        }
        .boxed()
    }

    fn get_props<'a>(&'a self, path: &'a DavPath, do_content: bool) -> FsFuture<'a, Vec<DavProp>> {
        async move {
            match self.resolve(path) {
                Resolved::Real(p) => localfs::fs_get_props(p, do_content).await,
                _ => Err(FsError::NotImplemented),
            }
        }
        .boxed()
    }

    fn get_prop<'a>(&'a self, path: &'a DavPath, prop: DavProp) -> FsFuture<'a, Vec<u8>> {
        async move {
            match self.resolve(path) {
                Resolved::Real(p) => localfs::fs_get_prop(p, &prop).await,
                _ => Err(FsError::NotFound),
            }
        }
        .boxed()
    }

    fn free_space<'a>(&'a self) -> FsFuture<'a, u64> {
        async move {
            let mut real = Vec::new();
            self.bindings(ROOT, &mut real);
            match real.into_iter().next() {
                Some(p) => localfs::fs_free_space(p).await,
                None => Err(FsError::NotImplemented),
            }
        }
        .boxed()
    }

    fn disk_usage<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, u64> {
        async move {
            match self.resolve(path) {
                Resolved::Real(p) => localfs::fs_disk_usage(p).await,
                Resolved::Virtual(id) => {
                    let mut real = Vec::new();
                    self.bindings(id, &mut real);
                    let mut total = 0;
                    for p in real {
                        total += localfs::fs_disk_usage(p).await?;
                    }
                    Ok(total)
                }
                Resolved::NotFound => Err(FsError::NotFound),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpath(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn virtual_nodes_are_virtual() {
        let fs = VirtualFs::builder().dir("/share").build();
        let meta = fs.metadata(&vpath("/share")).await.unwrap();
        assert!(meta.is_dir());
        assert!(meta.is_virtual());
        assert!(fs.metadata(&vpath("/nosuch")).await.is_err());
    }

    #[tokio::test]
    async fn writes_on_virtual_fail() {
        let fs = VirtualFs::builder().dir("/share").build();
        assert_eq!(
            fs.create_dir(&vpath("/share")).await.unwrap_err(),
            FsError::Forbidden
        );
        assert_eq!(
            fs.open(&vpath("/share"), OpenOptions::write()).await.err(),
            Some(FsError::GeneralFailure)
        );
    }

    #[tokio::test]
    async fn delegation_and_shadowing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("real.txt"), b"real").unwrap();
        std::fs::write(tmp.path().join("shadowed"), b"real").unwrap();

        let fs = VirtualFs::builder()
            .bind_root(tmp.path())
            .dir("/shadowed")
            .build();

        // the real file is reachable through the bound root.
        let meta = fs.metadata(&vpath("/real.txt")).await.unwrap();
        assert!(meta.is_file());
        assert!(!meta.is_virtual());

        // the virtual name shadows the real one.
        let meta = fs.metadata(&vpath("/shadowed")).await.unwrap();
        assert!(meta.is_virtual());

        let names: Vec<String> = fs
            .read_dir(&vpath("/"))
            .await
            .unwrap()
            .iter()
            .map(|e| String::from_utf8_lossy(&e.name()).into_owned())
            .collect();
        assert_eq!(names.iter().filter(|n| *n == "shadowed").count(), 1);
        assert!(names.contains(&"real.txt".to_string()));
    }
}
