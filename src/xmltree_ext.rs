use std::borrow::Cow;
use std::io::{Read, Write};

use xml::common::XmlVersion;
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xml::EmitterConfig;
use xmltree::{Element, Namespace, XMLNode};

use crate::{DavError, DavResult};

pub(crate) trait ElementExt {
    fn new2<'a, N: Into<&'a str>>(n: N) -> Self;
    fn ns<S: Into<String>>(self, prefix: S, namespace: S) -> Self;
    fn text<T: Into<String>>(self, t: T) -> Self;
    fn push(&mut self, e: Element);
    fn parse2<R: Read>(r: R) -> DavResult<Element>;
    fn child_elems_iter(&self) -> Box<dyn Iterator<Item = &Element> + '_>;
    fn take_child_elems(self) -> Vec<Element>;
    fn has_child_elems(&self) -> bool;
    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()>;
}

impl ElementExt for Element {
    // Build an element from a "prefix:name" string.
    fn new2<'a, N: Into<&'a str>>(n: N) -> Element {
        let n = n.into();
        match n.split_once(':') {
            None => Element::new(n),
            Some((prefix, name)) => {
                let mut e = Element::new(name);
                e.prefix = Some(prefix.to_string());
                e
            }
        }
    }

    fn ns<S: Into<String>>(mut self, prefix: S, namespace: S) -> Element {
        let mut ns = self.namespaces.take().unwrap_or_else(Namespace::empty);
        ns.force_put(prefix.into(), namespace.into());
        self.namespaces = Some(ns);
        self
    }

    fn text<T: Into<String>>(mut self, t: T) -> Element {
        self.children.push(XMLNode::Text(t.into()));
        self
    }

    fn push(&mut self, e: Element) {
        self.children.push(XMLNode::Element(e));
    }

    fn parse2<R: Read>(r: R) -> DavResult<Element> {
        match Element::parse(r) {
            Ok(elem) => Ok(elem),
            Err(xmltree::ParseError::MalformedXml(_)) => Err(DavError::XmlParseError),
            Err(_) => Err(DavError::XmlReadError),
        }
    }

    fn child_elems_iter(&self) -> Box<dyn Iterator<Item = &Element> + '_> {
        Box::new(self.children.iter().filter_map(XMLNode::as_element))
    }

    fn take_child_elems(self) -> Vec<Element> {
        self.children
            .into_iter()
            .filter_map(|n| match n {
                XMLNode::Element(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn has_child_elems(&self) -> bool {
        self.children.iter().any(|n| n.as_element().is_some())
    }

    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()> {
        use xml::attribute::Attribute;
        use xml::name::Name;

        let mut name = Name::local(&self.name);
        if let Some(ref ns) = self.namespace {
            name.namespace = Some(ns);
        }
        if let Some(ref p) = self.prefix {
            name.prefix = Some(p);
        }

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for (k, v) in &self.attributes {
            attributes.push(Attribute {
                name: Name::local(k),
                value: v,
            });
        }

        let empty_ns = Namespace::empty();
        let namespace = self.namespaces.as_ref().unwrap_or(&empty_ns);

        emitter.write(XmlWEvent::StartElement {
            name,
            attributes: Cow::Owned(attributes),
            namespace: Cow::Borrowed(namespace),
        })?;
        for node in &self.children {
            match node {
                XMLNode::Element(e) => e.write_ev(emitter)?,
                XMLNode::Text(t) => emitter.write(XmlWEvent::Characters(t))?,
                _ => {}
            }
        }
        emitter.write(XmlWEvent::EndElement { name: Some(name) })
    }
}

// An XML event writer with the document declaration already emitted.
pub(crate) fn emitter<W: Write>(w: W) -> DavResult<EventWriter<W>> {
    let mut emitter = EventWriter::new_with_config(
        w,
        EmitterConfig {
            normalize_empty_elements: false,
            perform_indent: false,
            indent_string: Cow::Borrowed(""),
            ..Default::default()
        },
    );
    emitter.write(XmlWEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("utf-8"),
        standalone: None,
    })?;
    Ok(emitter)
}
