use std::collections::HashMap;
use std::io::Cursor;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xmltree::{Element, XMLNode};

use crate::body::Body;
use crate::conditional::check_if;
use crate::davheaders::Depth;
use crate::davpath::DavPath;
use crate::fs::{DavMetaData, DavProp, FsError, FsResult};
use crate::handle_lock::{list_lockdiscovery, list_supportedlock};
use crate::util::{dav_xml_error, systemtime_to_rfc1123, systemtime_to_rfc3339, DavMethod, MemBuffer};
use crate::xmltree_ext::{emitter, ElementExt};
use crate::{DavError, DavResult};

const NS_APACHE_URI: &str = "http://apache.org/dav/props/";
const NS_DAV_URI: &str = "DAV:";

// Live properties, the entries of the static dispatch table below.
// quota-used-bytes is measured (expensive) and therefore only served on
// explicit <prop> requests, never through allprop.
const ALLPROP_STR: &[&str] = &[
    "D:creationdate",
    "D:displayname",
    "D:getcontentlength",
    "D:getcontenttype",
    "D:getetag",
    "D:getlastmodified",
    "D:lockdiscovery",
    "D:resourcetype",
    "D:supportedlock",
    "D:quota-available-bytes",
    "A:executable",
];

const PROPNAME_STR: &[&str] = &[
    "D:creationdate",
    "D:displayname",
    "D:getcontentlength",
    "D:getcontenttype",
    "D:getetag",
    "D:getlastmodified",
    "D:lockdiscovery",
    "D:resourcetype",
    "D:supportedlock",
    "D:quota-available-bytes",
    "D:quota-used-bytes",
    "A:executable",
];

lazy_static! {
    static ref ALLPROP: Vec<Element> = init_staticprop(ALLPROP_STR);
    static ref PROPNAME: Vec<Element> = init_staticprop(PROPNAME_STR);
}

fn init_staticprop(p: &[&str]) -> Vec<Element> {
    let mut v = Vec::new();
    for a in p {
        let mut e = Element::new2(*a);
        e.namespace = match e.prefix.as_deref() {
            Some("D") => Some(NS_DAV_URI.to_string()),
            Some("A") => Some(NS_APACHE_URI.to_string()),
            _ => None,
        };
        v.push(e);
    }
    v
}

#[derive(Clone, Copy, Default)]
enum QuotaCache {
    #[default]
    Unknown,
    Failed,
    Known(u64),
}

struct StatusElement {
    status: StatusCode,
    element: Element,
}

struct PropWriter<'h> {
    emitter: EventWriter<MemBuffer>,
    name: String,
    props: Vec<Element>,
    inner: &'h crate::davhandler::DavInner,
    q_cache: QuotaCache,
}

enum PropFindKind {
    AllProp,
    PropName,
    Prop(Vec<Element>),
}

impl crate::davhandler::DavInner {
    pub(crate) async fn handle_propfind(
        &self,
        req: &Request<()>,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>> {
        let depth = match req.headers().typed_try_get::<Depth>() {
            Ok(Some(Depth::Zero)) => Depth::Zero,
            Ok(Some(Depth::One)) => Depth::One,
            // RFC 4918 permits rejecting the unbounded case outright.
            Ok(Some(Depth::Infinity)) | Ok(None) => {
                let res = Response::builder()
                    .status(StatusCode::FORBIDDEN)
                    .header("content-type", "application/xml; charset=utf-8")
                    .body(dav_xml_error("<D:propfind-finite-depth/>"))
                    .unwrap();
                return Ok(res);
            }
            Err(_) => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };

        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await?;
        path.add_slash_if(meta.is_dir());

        let kind = parse_propfind_body(xmldata)?;
        let (name, props) = match kind {
            PropFindKind::AllProp => ("allprop", Vec::new()),
            PropFindKind::PropName => ("propname", Vec::new()),
            PropFindKind::Prop(props) => ("prop", props),
        };
        trace!("propfind: type request: {}", name);

        let mut pw = PropWriter::new(name, props, self)?;
        pw.write_props(&path, &*meta).await?;

        if meta.is_dir() && depth == Depth::One {
            for entry in self.fs.read_dir(&path).await? {
                self.cancelled()?;
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) => {
                        trace!("propfind: skipping entry: {:?}", e);
                        continue;
                    }
                };
                let mut npath = path.clone();
                npath.push_segment(&entry.name());
                npath.add_slash_if(meta.is_dir());
                pw.write_props(&npath, &*meta).await?;
            }
        }

        let body = pw.close()?;
        let res = Response::builder()
            .status(StatusCode::MULTI_STATUS)
            .header("content-type", "application/xml; charset=utf-8")
            .body(Body::from(body))
            .unwrap();
        Ok(res)
    }

    pub(crate) async fn handle_proppatch(
        &self,
        req: &Request<()>,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>> {
        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await?;
        path.add_slash_if(meta.is_dir());

        check_if(req, &self.fs, &self.ls, &path, DavMethod::PropPatch, &self.prefix)
            .await
            .map_err(DavError::Status)?;

        trace!(target: "xml", "proppatch input:\n{}",
               String::from_utf8_lossy(xmldata));

        let tree = Element::parse2(Cursor::new(xmldata))?;
        if tree.name != "propertyupdate" {
            return Err(DavError::XmlParseError);
        }

        let can_deadprop = self.fs.have_props(&path).await;
        let mut patch = Vec::new();
        let mut ret = Vec::new();

        // walk the set/remove operations in document order. Live
        // properties may not be modified; everything else becomes an
        // extended-attribute patch.
        for elem in tree.child_elems_iter() {
            let set = match elem.name.as_str() {
                "set" => true,
                "remove" => false,
                _ => continue,
            };
            for prop in elem
                .child_elems_iter()
                .filter(|e| e.name == "prop")
                .flat_map(|e| e.child_elems_iter())
            {
                if is_live_prop(prop) {
                    ret.push((StatusCode::FORBIDDEN, element_to_davprop(prop)));
                } else if !can_deadprop {
                    ret.push((StatusCode::FORBIDDEN, element_to_davprop(prop)));
                } else if set {
                    patch.push((true, element_to_davprop_full(prop)));
                } else {
                    patch.push((false, element_to_davprop(prop)));
                }
            }
        }

        if ret.iter().any(|(s, _)| s != &StatusCode::OK) {
            // partial failure: everything else reports Failed Dependency.
            ret.extend(
                patch
                    .into_iter()
                    .map(|(_, p)| (StatusCode::FAILED_DEPENDENCY, p)),
            );
        } else if !patch.is_empty() {
            let deadret = self.fs.patch_props(&path, patch).await?;
            ret.extend(deadret);
        }

        // group by status code.
        let mut by_status: HashMap<StatusCode, Vec<Element>> = HashMap::new();
        for (status, prop) in ret {
            by_status.entry(status).or_default().push(davprop_to_element(prop));
        }

        let mut pw = PropWriter::new("propertyupdate", Vec::new(), self)?;
        pw.write_propresponse(&path, by_status)?;
        let body = pw.close()?;

        let res = Response::builder()
            .status(StatusCode::MULTI_STATUS)
            .header("content-type", "application/xml; charset=utf-8")
            .body(Body::from(body))
            .unwrap();
        Ok(res)
    }
}

fn parse_propfind_body(xmldata: &[u8]) -> DavResult<PropFindKind> {
    // an absent body means allprop.
    if xmldata.is_empty() {
        return Ok(PropFindKind::AllProp);
    }
    let root = Element::parse2(Cursor::new(xmldata))?;
    if root.name != "propfind" {
        return Err(DavError::XmlParseError);
    }
    for elem in root.child_elems_iter() {
        match elem.name.as_str() {
            "allprop" => return Ok(PropFindKind::AllProp),
            "propname" => return Ok(PropFindKind::PropName),
            "prop" => {
                let props = elem.clone().take_child_elems();
                return Ok(PropFindKind::Prop(props));
            }
            // unknown elements are ignored.
            _ => {}
        }
    }
    Err(DavError::XmlParseError)
}

fn is_live_prop(prop: &Element) -> bool {
    match prop.namespace.as_deref() {
        Some(NS_DAV_URI) => true,
        Some(NS_APACHE_URI) => prop.name == "executable",
        _ => false,
    }
}

impl<'h> PropWriter<'h> {
    fn new(
        name: &str,
        mut props: Vec<Element>,
        inner: &'h crate::davhandler::DavInner,
    ) -> DavResult<PropWriter<'h>> {
        let mut emitter = emitter(MemBuffer::new())?;

        if name != "prop" && name != "propertyupdate" {
            let statics = if name == "allprop" { &*ALLPROP } else { &*PROPNAME };
            for a in statics.iter() {
                if !props
                    .iter()
                    .any(|e| a.namespace == e.namespace && a.name == e.name)
                {
                    props.push(a.clone());
                }
            }
        }

        // only bind the apache namespace when it is actually used.
        let mut ev = XmlWEvent::start_element("D:multistatus").ns("D", NS_DAV_URI);
        if props
            .iter()
            .any(|p| p.namespace.as_deref() == Some(NS_APACHE_URI))
        {
            ev = ev.ns("A", NS_APACHE_URI);
        }
        emitter.write(ev)?;

        Ok(PropWriter {
            emitter,
            name: name.to_string(),
            props,
            inner,
            q_cache: QuotaCache::default(),
        })
    }

    fn build_elem<T>(&self, content: bool, prop: &Element, text: T) -> StatusElement
    where
        T: Into<String>,
    {
        // response prefixes are ours, not whatever the request used.
        let prefix = match prop.namespace.as_deref() {
            Some(NS_DAV_URI) => Some("D".to_string()),
            Some(NS_APACHE_URI) => Some("A".to_string()),
            _ => prop.prefix.clone(),
        };
        let mut elem = Element {
            prefix,
            namespace: prop.namespace.clone(),
            namespaces: None,
            name: prop.name.clone(),
            attributes: HashMap::new(),
            children: Vec::new(),
        };
        if content {
            let t: String = text.into();
            if !t.is_empty() {
                elem.children.push(XMLNode::Text(t));
            }
        }
        StatusElement {
            status: StatusCode::OK,
            element: elem,
        }
    }

    fn notfound(&self, prop: &Element) -> StatusElement {
        StatusElement {
            status: StatusCode::NOT_FOUND,
            element: self.build_elem(false, prop, "").element,
        }
    }

    async fn free_space(&mut self) -> FsResult<u64> {
        match self.q_cache {
            QuotaCache::Known(n) => Ok(n),
            QuotaCache::Failed => Err(FsError::NotImplemented),
            QuotaCache::Unknown => match self.inner.fs.free_space().await {
                Ok(n) => {
                    self.q_cache = QuotaCache::Known(n);
                    Ok(n)
                }
                Err(e) => {
                    self.q_cache = QuotaCache::Failed;
                    Err(e)
                }
            },
        }
    }

    // The live-property dispatch. Dead properties fall through to the
    // extended-attribute store.
    async fn build_prop(
        &mut self,
        prop: &Element,
        path: &DavPath,
        meta: &dyn DavMetaData,
        docontent: bool,
    ) -> DavResult<StatusElement> {
        match (prop.namespace.as_deref(), prop.name.as_str()) {
            (Some(NS_DAV_URI), "creationdate") => {
                // RFC 1123, falling back to the modification time.
                if let Ok(t) = meta.created().or_else(|_| meta.modified()) {
                    return Ok(self.build_elem(docontent, prop, systemtime_to_rfc1123(t)));
                }
                Ok(self.notfound(prop))
            }
            (Some(NS_DAV_URI), "getlastmodified") => {
                if let Ok(t) = meta.modified() {
                    return Ok(self.build_elem(docontent, prop, systemtime_to_rfc3339(t)));
                }
                Ok(self.notfound(prop))
            }
            (Some(NS_DAV_URI), "getcontentlength") => {
                if !meta.is_dir() {
                    return Ok(self.build_elem(docontent, prop, meta.len().to_string()));
                }
                Ok(self.notfound(prop))
            }
            (Some(NS_DAV_URI), "getcontenttype") => {
                let ct = if meta.is_dir() {
                    "httpd/unix-directory"
                } else {
                    path.get_mime_type_str()
                };
                Ok(self.build_elem(docontent, prop, ct))
            }
            (Some(NS_DAV_URI), "displayname") => match path.file_name() {
                Some(name) => Ok(self.build_elem(docontent, prop, name)),
                None => Ok(self.notfound(prop)),
            },
            (Some(NS_DAV_URI), "getetag") => match meta.etag() {
                Some(etag) => Ok(self.build_elem(docontent, prop, format!("\"{}\"", etag))),
                None => Ok(self.notfound(prop)),
            },
            (Some(NS_DAV_URI), "resourcetype") => {
                let mut elem = self.build_elem(true, prop, "").element;
                if meta.is_dir() && docontent {
                    elem.push(Element::new2("D:collection"));
                }
                Ok(StatusElement {
                    status: StatusCode::OK,
                    element: elem,
                })
            }
            (Some(NS_DAV_URI), "supportedlock") => Ok(StatusElement {
                status: StatusCode::OK,
                element: list_supportedlock(),
            }),
            (Some(NS_DAV_URI), "lockdiscovery") => Ok(StatusElement {
                status: StatusCode::OK,
                element: list_lockdiscovery(
                    &self.inner.ls,
                    &path.lock_key(),
                    &self.inner.prefix,
                ),
            }),
            (Some(NS_DAV_URI), "quota-available-bytes") => match self.free_space().await {
                Ok(n) => Ok(self.build_elem(docontent, prop, n.to_string())),
                Err(_) => Ok(self.notfound(prop)),
            },
            (Some(NS_DAV_URI), "quota-used-bytes") => {
                match self.inner.fs.disk_usage(path).await {
                    Ok(n) => Ok(self.build_elem(docontent, prop, n.to_string())),
                    Err(_) => Ok(self.notfound(prop)),
                }
            }
            (Some(NS_DAV_URI), _) => Ok(self.notfound(prop)),
            (Some(NS_APACHE_URI), "executable") => {
                // directories always report "F".
                let x = if meta.is_dir() {
                    Ok(false)
                } else {
                    meta.executable()
                };
                match x {
                    Ok(x) => Ok(self.build_elem(docontent, prop, if x { "T" } else { "F" })),
                    Err(_) => Ok(self.notfound(prop)),
                }
            }
            _ => self.build_dead_prop(prop, path).await,
        }
    }

    async fn build_dead_prop(&self, prop: &Element, path: &DavPath) -> DavResult<StatusElement> {
        if self.name == "prop" && self.inner.fs.have_props(path).await {
            let dprop = element_to_davprop(prop);
            if let Ok(xml) = self.inner.fs.get_prop(path, dprop).await {
                return Ok(StatusElement {
                    status: StatusCode::OK,
                    element: raw_prop_to_element(prop, &xml),
                });
            }
        }
        Ok(StatusElement {
            status: StatusCode::NOT_FOUND,
            element: prop.clone(),
        })
    }

    async fn write_props(&mut self, path: &DavPath, meta: &dyn DavMetaData) -> DavResult<()> {
        let mut by_status: HashMap<StatusCode, Vec<Element>> = HashMap::new();
        let do_content = self.name != "propname";

        let props = std::mem::take(&mut self.props);
        for p in &props {
            let res = if do_content {
                self.build_prop(p, path, meta, true).await?
            } else {
                // propname only lists names, no values are computed.
                StatusElement {
                    status: StatusCode::OK,
                    element: self.build_elem(false, p, "").element,
                }
            };
            // allprop and propname only report what exists.
            if res.status == StatusCode::OK || self.name == "prop" {
                by_status.entry(res.status).or_default().push(res.element);
            }
        }
        self.props = props;

        // list the dead properties as well.
        if (self.name == "propname" || self.name == "allprop")
            && self.inner.fs.have_props(path).await
        {
            if let Ok(dprops) = self.inner.fs.get_props(path, do_content).await {
                for dprop in dprops {
                    let elem = match dprop.xml {
                        Some(ref xml) if do_content => {
                            raw_prop_to_element(&davprop_to_element(dprop.clone()), xml)
                        }
                        _ => davprop_to_element(dprop),
                    };
                    by_status.entry(StatusCode::OK).or_default().push(elem);
                }
            }
        }

        self.write_propresponse(path, by_status)
    }

    fn write_propresponse(
        &mut self,
        path: &DavPath,
        props: HashMap<StatusCode, Vec<Element>>,
    ) -> DavResult<()> {
        self.emitter.write(XmlWEvent::start_element("D:response"))?;
        Element::new2("D:href")
            .text(path.as_url_string_with_prefix())
            .write_ev(&mut self.emitter)?;

        let mut keys: Vec<_> = props.keys().copied().collect();
        keys.sort();
        for status in keys {
            self.emitter.write(XmlWEvent::start_element("D:propstat"))?;
            self.emitter.write(XmlWEvent::start_element("D:prop"))?;
            for elem in &props[&status] {
                elem.write_ev(&mut self.emitter)?;
            }
            self.emitter.write(XmlWEvent::end_element())?;
            Element::new2("D:status")
                .text(format!("HTTP/1.1 {}", status))
                .write_ev(&mut self.emitter)?;
            self.emitter.write(XmlWEvent::end_element())?;
        }

        self.emitter.write(XmlWEvent::end_element())?;
        Ok(())
    }

    fn close(mut self) -> DavResult<bytes::Bytes> {
        self.emitter.write(XmlWEvent::end_element())?;
        Ok(self.emitter.into_inner().take())
    }
}

fn element_to_davprop_full(elem: &Element) -> DavProp {
    let mut emitter = EventWriter::new(Cursor::new(Vec::new()));
    elem.write_ev(&mut emitter).ok();
    let xml = emitter.into_inner().into_inner();
    DavProp {
        name: elem.name.clone(),
        prefix: elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml: Some(xml),
    }
}

fn element_to_davprop(elem: &Element) -> DavProp {
    DavProp {
        name: elem.name.clone(),
        prefix: elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml: None,
    }
}

fn davprop_to_element(prop: DavProp) -> Element {
    let mut elem = Element::new(&prop.name);
    if let Some(ref ns) = prop.namespace {
        let pfx = prop.prefix.as_deref().unwrap_or("V");
        elem = elem.ns(pfx, ns.as_str());
        elem.prefix = Some(pfx.to_string());
        elem.namespace = prop.namespace.clone();
    }
    elem
}

// A stored dead property: preferably the XML fragment it was saved as,
// otherwise the raw bytes become the element text.
fn raw_prop_to_element(prop: &Element, xml: &[u8]) -> Element {
    if let Ok(elem) = Element::parse(Cursor::new(xml)) {
        return elem;
    }
    let mut elem = davprop_to_element(element_to_davprop(prop));
    elem.children
        .push(XMLNode::Text(String::from_utf8_lossy(xml).into_owned()));
    elem
}
