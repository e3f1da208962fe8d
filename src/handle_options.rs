use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::util::DavMethod;
use crate::DavResult;

impl crate::davhandler::DavInner {
    pub(crate) async fn handle_options(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut res = Response::builder()
            .status(StatusCode::OK)
            .header("DAV", "1,2")
            .header("MS-Author-Via", "DAV")
            .header("content-length", "0");

        let path = self.path(req);
        let is_root = path.as_bytes() == b"/";

        let mut allow = Vec::new();
        let mut add = |name: &'static str, m: DavMethod| {
            if self.readonly && m.is_write() {
                return;
            }
            if self.allow.as_ref().map_or(true, |a| a.contains(m)) {
                allow.push(name);
            }
        };
        add("OPTIONS", DavMethod::Options);
        add("HEAD", DavMethod::Head);
        add("GET", DavMethod::Get);
        add("PUT", DavMethod::Put);
        add("PROPFIND", DavMethod::PropFind);
        add("PROPPATCH", DavMethod::PropPatch);
        add("MKCOL", DavMethod::MkCol);
        add("COPY", DavMethod::Copy);
        if !is_root {
            add("MOVE", DavMethod::Move);
            add("DELETE", DavMethod::Delete);
        }
        add("LOCK", DavMethod::Lock);
        add("UNLOCK", DavMethod::Unlock);

        res = res.header("Allow", allow.join(","));
        Ok(res.body(Body::empty()).unwrap())
    }
}
