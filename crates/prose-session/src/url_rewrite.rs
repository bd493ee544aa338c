use kurso_prose_core::{Document, Node};
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("invalid origin {origin:?}")]
    Unparseable {
        origin: String,
        #[source]
        source: url::ParseError,
    },
    #[error("origin {0:?} has no host")]
    MissingHost(String),
}

/// Maps image sources between their storage form (origin-relative upload
/// paths) and their display form (absolute URLs on the configured origin).
///
/// Rewriting is structural: only the `src` attribute of image voids is
/// touched, never the serialized markup. Sources outside the uploads prefix,
/// or on a foreign origin, pass through unchanged in both directions, and the
/// two directions invert each other.
pub struct UrlRewriter {
    origin: Url,
    uploads_prefix: String,
}

impl UrlRewriter {
    pub fn new(origin: &str, uploads_prefix: impl Into<String>) -> Result<Self, OriginError> {
        let parsed = Url::parse(origin).map_err(|source| OriginError::Unparseable {
            origin: origin.to_string(),
            source,
        })?;
        if !parsed.has_host() {
            return Err(OriginError::MissingHost(origin.to_string()));
        }
        Ok(Self {
            origin: parsed,
            uploads_prefix: uploads_prefix.into(),
        })
    }

    /// Storage form to display form: an uploads path becomes absolute on the
    /// configured origin. Anything else is returned unchanged.
    pub fn to_display(&self, src: &str) -> String {
        if !src.starts_with(&self.uploads_prefix) {
            return src.to_string();
        }
        match self.origin.join(src) {
            Ok(url) => url.to_string(),
            Err(err) => {
                log::warn!("cannot resolve upload path {src:?} against origin: {err}");
                src.to_string()
            }
        }
    }

    /// Display form to storage form: an absolute URL on the configured origin
    /// whose path sits under the uploads prefix collapses back to the path.
    /// Foreign origins and non-upload paths are returned unchanged.
    pub fn to_storage(&self, src: &str) -> String {
        let Ok(url) = Url::parse(src) else {
            return src.to_string();
        };
        let same_origin = url.scheme() == self.origin.scheme()
            && url.host() == self.origin.host()
            && url.port_or_known_default() == self.origin.port_or_known_default();
        if !same_origin || !url.path().starts_with(&self.uploads_prefix) {
            return src.to_string();
        }

        let mut storage = url.path().to_string();
        if let Some(query) = url.query() {
            storage.push('?');
            storage.push_str(query);
        }
        if let Some(fragment) = url.fragment() {
            storage.push('#');
            storage.push_str(fragment);
        }
        storage
    }

    pub fn rewrite_for_display(&self, doc: &mut Document) {
        self.rewrite_images(doc, &|src| self.to_display(src));
    }

    pub fn rewrite_for_storage(&self, doc: &mut Document) {
        self.rewrite_images(doc, &|src| self.to_storage(src));
    }

    fn rewrite_images(&self, doc: &mut Document, rewrite: &dyn Fn(&str) -> String) {
        fn walk(children: &mut [Node], rewrite: &dyn Fn(&str) -> String) {
            for node in children {
                match node {
                    Node::Void(v) if v.kind == "image" => {
                        let Some(src) = v.attrs.get("src").and_then(|value| value.as_str()) else {
                            continue;
                        };
                        let rewritten = rewrite(src);
                        if rewritten != src {
                            v.attrs.insert("src".to_string(), Value::String(rewritten));
                        }
                    }
                    Node::Element(el) => walk(&mut el.children, rewrite),
                    _ => {}
                }
            }
        }
        walk(&mut doc.children, rewrite);
    }
}
