//! The serialized document format: a small HTML subset.
//!
//! Serialization is canonical, so equal documents produce byte-equal output:
//! marks nest in rank order, void attributes render in registration order,
//! links always carry the open-in-new-context attribute pair. Parsing is
//! tolerant: unknown tags are transparent, unknown attributes are dropped,
//! and the result is normalized, so `parse` never fails.

use serde_json::Value;

use crate::doc::{Attrs, Document, ElementNode, Marks, Node, Point, Selection, TextNode, VoidNode};
use crate::editor::apply_op_to;
use crate::registry::{AttrShape, ExtensionRegistry, MarkSpec};

/// HTML void tags outside the vocabulary; they carry no content to keep, so
/// they are skipped without expecting a closing tag.
const SKIPPED_VOID_TAGS: [&str; 6] = ["br", "hr", "meta", "link", "input", "wbr"];

const PARSE_NORMALIZE_LIMIT: usize = 100;

pub fn serialize(doc: &Document, registry: &ExtensionRegistry) -> String {
    let mut out = String::new();
    for node in &doc.children {
        match node {
            Node::Element(el) => {
                let tag = registry
                    .node_spec(&el.kind)
                    .map(|s| s.tag.as_str())
                    .unwrap_or("p");
                out.push('<');
                out.push_str(tag);
                out.push('>');
                serialize_inline(&mut out, &el.children, registry);
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
            Node::Void(v) => render_void(&mut out, v, registry),
            Node::Text(t) => {
                out.push_str(&html_escape::encode_text(&t.text));
            }
        }
    }
    out
}

fn serialize_inline(out: &mut String, children: &[Node], registry: &ExtensionRegistry) {
    for node in children {
        match node {
            Node::Text(t) => {
                if t.text.is_empty() {
                    continue;
                }
                let mut close_tags: Vec<String> = Vec::new();
                for spec in registry.marks_in_rank_order() {
                    if let Some(open) = mark_open_tag(spec, &t.marks) {
                        out.push_str(&open);
                        close_tags.push(format!("</{}>", spec.tag));
                    }
                }
                out.push_str(&html_escape::encode_text(&t.text));
                for close in close_tags.iter().rev() {
                    out.push_str(close);
                }
            }
            Node::Void(v) => render_void(out, v, registry),
            Node::Element(el) => serialize_inline(out, &el.children, registry),
        }
    }
}

fn mark_open_tag(spec: &MarkSpec, marks: &Marks) -> Option<String> {
    match spec.name.as_str() {
        "bold" if marks.bold => Some(format!("<{}>", spec.tag)),
        "italic" if marks.italic => Some(format!("<{}>", spec.tag)),
        "underline" if marks.underline => Some(format!("<{}>", spec.tag)),
        "link" => marks.link.as_ref().map(|href| {
            format!(
                r#"<{} href="{}" target="_blank" rel="noopener noreferrer nofollow">"#,
                spec.tag,
                html_escape::encode_double_quoted_attribute(href)
            )
        }),
        "font_size" => marks
            .font_size
            .map(|pt| format!(r#"<{} style="font-size: {pt}pt">"#, spec.tag)),
        _ => None,
    }
}

fn render_void(out: &mut String, void: &VoidNode, registry: &ExtensionRegistry) {
    let Some(spec) = registry.node_spec(&void.kind) else {
        return;
    };
    out.push('<');
    out.push_str(&spec.tag);
    for attr in registry.attr_specs_for(&void.kind) {
        let Some(value) = void.attrs.get(&attr.name) else {
            continue;
        };
        let rendered = match (&attr.shape, value) {
            (AttrShape::Str, Value::String(s)) => {
                Some(html_escape::encode_double_quoted_attribute(s).into_owned())
            }
            (AttrShape::UInt, value) => value.as_u64().map(|n| n.to_string()),
            (AttrShape::OneOf(allowed), Value::String(s)) if allowed.contains(s) => Some(s.clone()),
            _ => None,
        };
        if let Some(rendered) = rendered {
            out.push(' ');
            out.push_str(&attr.html_name);
            out.push_str("=\"");
            out.push_str(&rendered);
            out.push('"');
        }
    }
    out.push('>');
}

pub fn parse(html: &str, registry: &ExtensionRegistry) -> Document {
    let mut parser = Parser {
        src: html,
        bytes: html.as_bytes(),
        pos: 0,
        registry,
        blocks: Vec::new(),
        block: None,
        marks: Marks::default(),
        open: Vec::new(),
    };
    parser.run();
    let mut doc = Document {
        children: parser.blocks,
    };
    normalize_parsed(&mut doc, registry);
    doc
}

struct OpenTag {
    tag: String,
    kind: OpenKind,
}

enum OpenKind {
    Block,
    Mark { restore: Marks },
    Transparent,
}

struct Parser<'a, 'r> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    registry: &'r ExtensionRegistry,
    blocks: Vec<Node>,
    /// Kind and collected inline children of the block being filled.
    /// Stray inline content outside any block tag opens an implicit
    /// paragraph.
    block: Option<(String, Vec<Node>)>,
    marks: Marks,
    open: Vec<OpenTag>,
}

impl Parser<'_, '_> {
    fn run(&mut self) {
        while self.pos < self.bytes.len() {
            let start = self.pos;
            while self.pos < self.bytes.len() && self.bytes[self.pos] != b'<' {
                self.pos += 1;
            }
            if self.pos > start {
                let raw = &self.src[start..self.pos];
                self.text(raw);
            }
            if self.pos >= self.bytes.len() {
                break;
            }
            self.tag();
        }

        // Unterminated input: close whatever is still open.
        while let Some(entry) = self.open.pop() {
            self.leave(entry);
        }
        self.finish_block();
    }

    fn text(&mut self, raw: &str) {
        if self.block.is_none() && raw.trim().is_empty() {
            return;
        }
        let decoded = html_escape::decode_html_entities(raw).into_owned();
        if decoded.is_empty() {
            return;
        }
        let marks = self.marks.clone();
        self.inline(Node::Text(TextNode {
            text: decoded,
            marks,
        }));
    }

    fn inline(&mut self, node: Node) {
        self.block
            .get_or_insert_with(|| ("paragraph".to_string(), Vec::new()))
            .1
            .push(node);
    }

    fn finish_block(&mut self) {
        if let Some((kind, children)) = self.block.take() {
            self.blocks.push(Node::Element(ElementNode {
                kind,
                attrs: Attrs::default(),
                children,
            }));
        }
    }

    fn tag(&mut self) {
        // self.bytes[self.pos] == b'<'
        self.pos += 1;
        match self.bytes.get(self.pos) {
            Some(b'/') => {
                self.pos += 1;
                let name = self.tag_name();
                self.skip_past_gt();
                self.close(&name);
            }
            Some(b'!') => self.skip_comment_or_doctype(),
            Some(c) if c.is_ascii_alphabetic() => {
                let name = self.tag_name();
                let attrs = self.attrs();
                self.dispatch_open(&name, attrs);
            }
            _ => {
                // A stray '<' is literal text.
                self.text("<");
            }
        }
    }

    fn tag_name(&mut self) -> String {
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'-')
        {
            self.pos += 1;
        }
        self.src[start..self.pos].to_ascii_lowercase()
    }

    fn attrs(&mut self) -> Vec<(String, String)> {
        let mut attrs = Vec::new();
        loop {
            while self.bytes.get(self.pos).is_some_and(|c| c.is_ascii_whitespace()) {
                self.pos += 1;
            }
            match self.bytes.get(self.pos) {
                None => break,
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') => {
                    self.pos += 1;
                }
                Some(_) => {
                    let name_start = self.pos;
                    while self.bytes.get(self.pos).is_some_and(|c| {
                        !c.is_ascii_whitespace() && *c != b'=' && *c != b'>' && *c != b'/'
                    }) {
                        self.pos += 1;
                    }
                    let name = self.src[name_start..self.pos].to_ascii_lowercase();
                    let mut value = String::new();
                    if self.bytes.get(self.pos) == Some(&b'=') {
                        self.pos += 1;
                        value = self.attr_value();
                    }
                    if !name.is_empty() {
                        attrs.push((name, value));
                    }
                }
            }
        }
        attrs
    }

    fn attr_value(&mut self) -> String {
        match self.bytes.get(self.pos) {
            Some(&(quote @ (b'"' | b'\''))) => {
                self.pos += 1;
                let start = self.pos;
                while self
                    .bytes
                    .get(self.pos)
                    .is_some_and(|c| *c != quote && *c != b'>')
                {
                    self.pos += 1;
                }
                let raw = &self.src[start..self.pos];
                if self.bytes.get(self.pos) == Some(&quote) {
                    self.pos += 1;
                }
                html_escape::decode_html_entities(raw).into_owned()
            }
            _ => {
                let start = self.pos;
                while self
                    .bytes
                    .get(self.pos)
                    .is_some_and(|c| !c.is_ascii_whitespace() && *c != b'>')
                {
                    self.pos += 1;
                }
                html_escape::decode_html_entities(&self.src[start..self.pos]).into_owned()
            }
        }
    }

    fn skip_past_gt(&mut self) {
        while self.bytes.get(self.pos).is_some_and(|c| *c != b'>') {
            self.pos += 1;
        }
        if self.pos < self.bytes.len() {
            self.pos += 1;
        }
    }

    fn skip_comment_or_doctype(&mut self) {
        if self.src[self.pos..].starts_with("!--") {
            match self.src[self.pos..].find("-->") {
                Some(end) => self.pos += end + 3,
                None => self.pos = self.bytes.len(),
            }
        } else {
            self.skip_past_gt();
        }
    }

    fn dispatch_open(&mut self, name: &str, attrs: Vec<(String, String)>) {
        if let Some(spec) = self.registry.node_spec_for_tag(name) {
            if spec.is_void {
                self.void_node(spec.kind.clone(), attrs);
            } else {
                // Opening a block implicitly closes the current one.
                self.finish_block();
                self.block = Some((spec.kind.clone(), Vec::new()));
                for (attr, _) in &attrs {
                    log::debug!("dropping unknown attribute {attr} on <{name}>");
                }
                self.open.push(OpenTag {
                    tag: name.to_string(),
                    kind: OpenKind::Block,
                });
            }
            return;
        }

        if let Some(spec) = self.registry.mark_spec_for_tag(name) {
            let restore = self.marks.clone();
            self.apply_mark(&spec.name, name, attrs);
            self.open.push(OpenTag {
                tag: name.to_string(),
                kind: OpenKind::Mark { restore },
            });
            return;
        }

        if SKIPPED_VOID_TAGS.contains(&name) {
            log::debug!("dropping tag <{name}>");
            return;
        }

        // Unknown tag: keep its content, drop the tag itself.
        log::debug!("treating unknown tag <{name}> as transparent");
        self.open.push(OpenTag {
            tag: name.to_string(),
            kind: OpenKind::Transparent,
        });
    }

    fn apply_mark(&mut self, mark_name: &str, tag: &str, attrs: Vec<(String, String)>) {
        match mark_name {
            "bold" => self.marks.bold = true,
            "italic" => self.marks.italic = true,
            "underline" => self.marks.underline = true,
            "link" => {
                for (name, value) in attrs {
                    match name.as_str() {
                        "href" => self.marks.link = Some(value),
                        // The serializer bakes these onto every link.
                        "target" | "rel" => {}
                        _ => log::debug!("dropping unknown attribute {name} on <{tag}>"),
                    }
                }
                return;
            }
            "font_size" => {
                for (name, value) in attrs {
                    match name.as_str() {
                        "style" => {
                            if let Some(pt) = font_size_from_style(&value) {
                                self.marks.font_size = Some(pt);
                            }
                        }
                        _ => log::debug!("dropping unknown attribute {name} on <{tag}>"),
                    }
                }
                return;
            }
            _ => {}
        }
        for (name, _) in attrs {
            log::debug!("dropping unknown attribute {name} on <{tag}>");
        }
    }

    fn void_node(&mut self, kind: String, attrs: Vec<(String, String)>) {
        let mut node_attrs = Attrs::default();
        for (name, value) in attrs {
            let Some(spec) = self
                .registry
                .attr_specs_for(&kind)
                .find(|spec| spec.html_name == name)
            else {
                log::debug!("dropping unknown attribute {name} on {kind}");
                continue;
            };
            match attr_value_from_html(&spec.shape, &value) {
                Some(value) => {
                    node_attrs.insert(spec.name.clone(), value);
                }
                None => log::debug!("dropping malformed attribute {name}={value:?} on {kind}"),
            }
        }
        self.inline(Node::Void(VoidNode {
            kind,
            attrs: node_attrs,
        }));
    }

    fn close(&mut self, name: &str) {
        // Stray closing tags are ignored; a matching open closes everything
        // left dangling above it.
        let Some(depth) = self.open.iter().rposition(|entry| entry.tag == name) else {
            return;
        };
        while self.open.len() > depth {
            let Some(entry) = self.open.pop() else {
                break;
            };
            self.leave(entry);
        }
    }

    fn leave(&mut self, entry: OpenTag) {
        match entry.kind {
            OpenKind::Block => self.finish_block(),
            OpenKind::Mark { restore } => self.marks = restore,
            OpenKind::Transparent => {}
        }
    }
}

fn attr_value_from_html(shape: &AttrShape, raw: &str) -> Option<Value> {
    match shape {
        AttrShape::Str => Some(Value::String(raw.to_string())),
        AttrShape::UInt => raw.trim().parse::<u64>().ok().map(Value::from),
        AttrShape::OneOf(allowed) => allowed
            .iter()
            .any(|a| a == raw)
            .then(|| Value::String(raw.to_string())),
    }
}

fn font_size_from_style(style: &str) -> Option<u32> {
    for decl in style.split(';') {
        let Some((prop, value)) = decl.split_once(':') else {
            continue;
        };
        if !prop.trim().eq_ignore_ascii_case("font-size") {
            continue;
        }
        let value = value.trim();
        let Some(number) = value.strip_suffix("pt") else {
            continue;
        };
        if let Ok(pt) = number.trim().parse::<u32>() {
            return Some(pt);
        }
    }
    None
}

/// Parsed documents go through the same normalization as edited ones, so
/// serialization of a freshly parsed document is already canonical.
fn normalize_parsed(doc: &mut Document, registry: &ExtensionRegistry) {
    let mut selection = Selection::caret(Point::new(vec![0, 0], 0));
    for _ in 0..PARSE_NORMALIZE_LIMIT {
        let ops = registry.normalize(doc);
        if ops.is_empty() {
            return;
        }
        for op in ops {
            if let Err(err) = apply_op_to(doc, &mut selection, op) {
                log::warn!("normalization op failed on parsed document: {err}");
                return;
            }
        }
    }
    log::warn!("parsed document did not normalize to a fixpoint");
}
