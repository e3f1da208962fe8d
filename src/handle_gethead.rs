use std::cmp::Ordering;

use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::fs::{DavMetaData, OpenOptions};
use crate::util::systemtime_to_rfc1123;
use crate::DavResult;

const READ_CHUNK: usize = 8192;

impl crate::davhandler::DavInner {
    pub(crate) async fn handle_get(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let path = self.path(req);
        let head = req.method() == &http::Method::HEAD;

        let meta = self.fs.metadata(&path).await?;
        if meta.is_dir() {
            return self.handle_dirlist(&path, head).await;
        }

        let mut res = Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", path.get_mime_type_str())
            .header("Content-Length", meta.len().to_string());
        if let Some(etag) = meta.etag() {
            res = res.header("ETag", format!("\"{}\"", etag));
        }
        if let Ok(modified) = meta.modified() {
            res = res.header("Last-Modified", systemtime_to_rfc1123(modified));
        }

        if head {
            return Ok(res.body(Body::empty()).unwrap());
        }

        let mut file = self.fs.open(&path, OpenOptions::read()).await?;
        let body = async_stream::try_stream! {
            loop {
                let buf = file.read_bytes(READ_CHUNK).await?;
                if buf.is_empty() {
                    break;
                }
                yield buf;
            }
        };
        Ok(res.body(Body::from_stream(body)).unwrap())
    }

    pub(crate) async fn handle_dirlist(&self, path: &DavPath, head: bool) -> DavResult<Response<Body>> {
        let entries = self.fs.read_dir(path).await?;

        let res = Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8");
        if head {
            return Ok(res.body(Body::empty()).unwrap());
        }

        struct Dirent {
            href: String,
            name: String,
            meta: Box<dyn DavMetaData>,
        }

        let mut dirents = Vec::new();
        for entry in entries {
            let mut name = entry.name();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("dirlist: skipping unreadable entry: {:?}", e);
                    continue;
                }
            };
            let mut npath = path.clone();
            npath.push_segment(&name);
            if meta.is_dir() {
                name.push(b'/');
                npath.add_slash();
            }
            dirents.push(Dirent {
                href: npath.as_url_string_with_prefix(),
                name: String::from_utf8_lossy(&name).into_owned(),
                meta,
            });
        }

        // plain lexicographic collation; directories carry their slash.
        dirents.sort_by(|a, b| match a.name.cmp(&b.name) {
            Ordering::Equal => a.href.cmp(&b.href),
            o => o,
        });

        let dpath = htmlescape::encode_minimal(&path.as_url_string());
        let mut w = String::new();
        w.push_str("<html><head>");
        w.push_str(&format!("<title>Index of {}</title>", dpath));
        w.push_str("</head><body>");
        w.push_str(&format!("<h1>Index of {}</h1>", dpath));
        w.push_str("<table>");
        w.push_str("<tr><th>Name</th><th>Last modified</th><th>Size</th></tr>");
        if path.as_bytes() != b"/" {
            w.push_str("<tr><td><a href=\"..\">Parent Directory</a></td><td></td><td>[DIR]</td></tr>");
        }
        for dirent in &dirents {
            let modified = match dirent.meta.modified() {
                Ok(t) => systemtime_to_rfc1123(t),
                Err(_) => String::new(),
            };
            let size = if dirent.meta.is_file() {
                dirent.meta.len().to_string()
            } else {
                "[DIR]".to_string()
            };
            w.push_str(&format!(
                "<tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>",
                dirent.href,
                htmlescape::encode_minimal(&dirent.name),
                modified,
                size
            ));
        }
        w.push_str("</table></body></html>");

        res.body(Body::from(w))
            .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))
    }
}
