use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ops::Path;

pub type Attrs = BTreeMap<String, serde_json::Value>;
pub type NodeKind = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Document {
    /// Inline text of every paragraph, blocks joined with newlines. Void
    /// leaves contribute nothing.
    pub fn to_plain_text(&self) -> String {
        fn walk(nodes: &[Node], out: &mut Vec<String>) {
            for node in nodes {
                match node {
                    Node::Element(el) => {
                        let mut line = String::new();
                        collect_inline_text(&el.children, &mut line);
                        out.push(line);
                    }
                    Node::Text(t) => out.push(t.text.clone()),
                    Node::Void(_) => {}
                }
            }
        }

        fn collect_inline_text(nodes: &[Node], out: &mut String) {
            for node in nodes {
                match node {
                    Node::Text(t) => out.push_str(&t.text),
                    Node::Element(el) => collect_inline_text(&el.children, out),
                    Node::Void(_) => {}
                }
            }
        }

        let mut lines = Vec::new();
        walk(&self.children, &mut lines);
        lines.join("\n")
    }

    /// True when the document carries no text and no void leaves. Drives
    /// placeholder display in embedding forms.
    pub fn is_blank(&self) -> bool {
        fn blank(nodes: &[Node]) -> bool {
            nodes.iter().all(|node| match node {
                Node::Element(el) => blank(&el.children),
                Node::Text(t) => t.text.is_empty(),
                Node::Void(_) => false,
            })
        }
        blank(&self.children)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Element(ElementNode),
    Text(TextNode),
    Void(VoidNode),
}

impl Node {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Node::Element(ElementNode {
            kind: "paragraph".to_string(),
            attrs: Attrs::default(),
            children: vec![Node::Text(TextNode {
                text: text.into(),
                marks: Marks::default(),
            })],
        })
    }

    pub fn image(src: impl Into<String>) -> Self {
        let mut attrs = Attrs::default();
        attrs.insert(
            "src".to_string(),
            serde_json::Value::String(src.into()),
        );
        Node::Void(VoidNode {
            kind: "image".to_string(),
            attrs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    pub kind: NodeKind,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidNode {
    pub kind: NodeKind,
    #[serde(default)]
    pub attrs: Attrs,
}

impl VoidNode {
    /// Width of the leaf in the block's inline coordinate space. Atomic
    /// leaves occupy one position so a caret can sit on either side.
    pub fn inline_text_len(&self) -> usize {
        1
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(|v| v.as_str())
    }

    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        self.attrs.get(name).and_then(|v| v.as_u64())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    pub text: String,
    #[serde(default)]
    pub marks: Marks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Marks {
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub underline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u32>,
}

impl Marks {
    pub fn is_plain(&self) -> bool {
        self == &Marks::default()
    }

    pub fn without_link(&self) -> Marks {
        Marks {
            link: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub path: Path,
    pub offset: usize,
}

impl Point {
    pub fn new(path: Path, offset: usize) -> Self {
        Self { path, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSelection {
    pub anchor: Point,
    pub head: Point,
}

impl TextSelection {
    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    /// Anchor and head in document order.
    pub fn ordered(&self) -> (Point, Point) {
        let mut start = self.anchor.clone();
        let mut end = self.head.clone();

        if start.path == end.path {
            if end.offset < start.offset {
                std::mem::swap(&mut start, &mut end);
            }
            return (start, end);
        }
        if end.path < start.path {
            std::mem::swap(&mut start, &mut end);
        }
        (start, end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelection {
    #[serde(default)]
    pub path: Path,
}

/// Either a text range (collapsed = caret) or exactly one selected atomic
/// node, e.g. an image awaiting a width change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "selection", rename_all = "snake_case")]
pub enum Selection {
    Text(TextSelection),
    Node(NodeSelection),
}

impl Selection {
    pub fn caret(point: Point) -> Self {
        Selection::Text(TextSelection {
            anchor: point.clone(),
            head: point,
        })
    }

    pub fn text(anchor: Point, head: Point) -> Self {
        Selection::Text(TextSelection { anchor, head })
    }

    pub fn node(path: Path) -> Self {
        Selection::Node(NodeSelection { path })
    }

    pub fn is_caret(&self) -> bool {
        match self {
            Selection::Text(sel) => sel.is_collapsed(),
            Selection::Node(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&TextSelection> {
        match self {
            Selection::Text(sel) => Some(sel),
            Selection::Node(_) => None,
        }
    }

    pub fn as_node(&self) -> Option<&NodeSelection> {
        match self {
            Selection::Node(sel) => Some(sel),
            Selection::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrPatch {
    #[serde(default)]
    pub set: Attrs,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl AttrPatch {
    pub fn set(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.set.insert(name.into(), value);
        self
    }

    pub fn remove(mut self, name: impl Into<String>) -> Self {
        self.remove.push(name.into());
        self
    }
}

pub(crate) fn patch_apply(attrs: &mut Attrs, patch: &AttrPatch) -> AttrPatch {
    let mut old_set: Attrs = Attrs::new();
    let mut old_remove: Vec<String> = Vec::new();

    for (k, v) in &patch.set {
        if let Some(prev) = attrs.insert(k.clone(), v.clone()) {
            old_set.insert(k.clone(), prev);
        } else {
            old_remove.push(k.clone());
        }
    }

    for key in &patch.remove {
        if let Some(prev) = attrs.remove(key) {
            old_set.insert(key.clone(), prev);
        }
    }

    AttrPatch {
        set: old_set,
        remove: old_remove,
    }
}

#[derive(Debug)]
pub struct PathError(pub String);

pub fn node_at_path<'a>(doc: &'a Document, path: &[usize]) -> Option<&'a Node> {
    if path.is_empty() {
        return None;
    }

    let mut node = doc.children.get(path[0])?;
    for &ix in path.iter().skip(1) {
        node = match node {
            Node::Element(el) => el.children.get(ix)?,
            Node::Void(_) | Node::Text(_) => return None,
        };
    }
    Some(node)
}

pub(crate) fn node_mut<'a>(
    doc: &'a mut Document,
    path: &[usize],
) -> Result<&'a mut Node, PathError> {
    if path.is_empty() {
        return Err(PathError("Empty path".into()));
    }

    let (&first, rest) = path.split_first().ok_or_else(|| PathError("Empty path".into()))?;
    let len = doc.children.len();
    let mut node = doc
        .children
        .get_mut(first)
        .ok_or_else(|| PathError(format!("Path out of bounds at depth 0: {first} >= {len}")))?;

    for (depth, &ix) in rest.iter().enumerate() {
        node = match node {
            Node::Element(el) => {
                let len = el.children.len();
                el.children.get_mut(ix).ok_or_else(|| {
                    PathError(format!(
                        "Path out of bounds at depth {}: {ix} >= {len}",
                        depth + 1
                    ))
                })?
            }
            Node::Void(_) | Node::Text(_) => {
                return Err(PathError(format!("Non-container node at depth {depth}")));
            }
        };
    }
    Ok(node)
}

pub(crate) fn node_text_mut<'a>(
    doc: &'a mut Document,
    path: &[usize],
) -> Result<&'a mut TextNode, PathError> {
    match node_mut(doc, path)? {
        Node::Text(t) => Ok(t),
        _ => Err(PathError("Expected Text node".into())),
    }
}

pub(crate) fn insert_node(doc: &mut Document, path: &[usize], node: Node) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError("Empty insert path".into()));
    }

    let (parent_path, index) = path.split_at(path.len() - 1);
    let index = index[0];

    let children = if parent_path.is_empty() {
        &mut doc.children
    } else {
        match node_mut(doc, parent_path)? {
            Node::Element(el) => &mut el.children,
            Node::Void(_) | Node::Text(_) => {
                return Err(PathError("Insert parent is not a container".into()));
            }
        }
    };

    if index > children.len() {
        return Err(PathError(format!(
            "Insert index out of bounds: {index} > {}",
            children.len()
        )));
    }
    children.insert(index, node);
    Ok(())
}

pub(crate) fn remove_node(doc: &mut Document, path: &[usize]) -> Result<Node, PathError> {
    if path.is_empty() {
        return Err(PathError("Empty remove path".into()));
    }

    let (parent_path, index) = path.split_at(path.len() - 1);
    let index = index[0];

    let children = if parent_path.is_empty() {
        &mut doc.children
    } else {
        match node_mut(doc, parent_path)? {
            Node::Element(el) => &mut el.children,
            Node::Void(_) | Node::Text(_) => {
                return Err(PathError("Remove parent is not a container".into()));
            }
        }
    };

    if index >= children.len() {
        return Err(PathError(format!(
            "Remove index out of bounds: {index} >= {}",
            children.len()
        )));
    }
    Ok(children.remove(index))
}

pub(crate) fn clamp_to_char_boundary(s: &str, mut ix: usize) -> usize {
    ix = ix.min(s.len());
    while ix > 0 && !s.is_char_boundary(ix) {
        ix -= 1;
    }
    ix
}

/// Offset of `(child_ix, offset)` in the block's flat inline coordinate
/// space, where every void leaf counts as one position.
pub(crate) fn point_global_offset(children: &[Node], child_ix: usize, offset: usize) -> usize {
    let mut global = 0usize;
    for (ix, node) in children.iter().enumerate() {
        match node {
            Node::Text(t) => {
                if ix < child_ix {
                    global += t.text.len();
                    continue;
                }
                if ix == child_ix {
                    let o = clamp_to_char_boundary(&t.text, offset);
                    global += o;
                }
                break;
            }
            Node::Void(v) => {
                if ix < child_ix {
                    global += v.inline_text_len();
                    continue;
                }
                if ix == child_ix {
                    global += offset.min(v.inline_text_len());
                }
                break;
            }
            Node::Element(_) => {}
        }
    }
    global
}

pub(crate) fn point_for_global_offset(
    block_path: &[usize],
    children: &[Node],
    global_offset: usize,
) -> Point {
    let mut remaining = global_offset;
    for (child_ix, node) in children.iter().enumerate() {
        match node {
            Node::Text(t) => {
                if remaining < t.text.len() {
                    let mut path = block_path.to_vec();
                    path.push(child_ix);
                    return Point::new(path, clamp_to_char_boundary(&t.text, remaining));
                }
                if remaining == t.text.len() {
                    if matches!(children.get(child_ix + 1), Some(Node::Text(_))) {
                        let mut path = block_path.to_vec();
                        path.push(child_ix + 1);
                        return Point::new(path, 0);
                    }
                    let mut path = block_path.to_vec();
                    path.push(child_ix);
                    return Point::new(path, t.text.len());
                }
                remaining = remaining.saturating_sub(t.text.len());
            }
            Node::Void(v) => {
                let len = v.inline_text_len();
                if remaining <= len {
                    let before = remaining;
                    let after = len - remaining;

                    if remaining == 0 || before <= after {
                        for (ix, prev) in children.iter().enumerate().take(child_ix).rev() {
                            if let Node::Text(t) = prev {
                                let mut path = block_path.to_vec();
                                path.push(ix);
                                return Point::new(path, t.text.len());
                            }
                        }
                    }

                    for (ix, next) in children.iter().enumerate().skip(child_ix + 1) {
                        if matches!(next, Node::Text(_)) {
                            let mut path = block_path.to_vec();
                            path.push(ix);
                            return Point::new(path, 0);
                        }
                    }
                    break;
                }
                remaining = remaining.saturating_sub(len);
            }
            Node::Element(_) => {}
        }
    }

    // Fallback to end of last text node.
    for (child_ix, node) in children.iter().enumerate().rev() {
        if let Node::Text(t) = node {
            let mut path = block_path.to_vec();
            path.push(child_ix);
            return Point::new(path, t.text.len());
        }
    }

    let mut path = block_path.to_vec();
    path.push(0);
    Point::new(path, 0)
}

pub(crate) fn is_point_in_block(point: &Point, block_path: &[usize]) -> bool {
    point.path.len() == block_path.len() + 1 && point.path.starts_with(block_path)
}

pub(crate) fn total_inline_text_len(children: &[Node]) -> usize {
    children
        .iter()
        .map(|n| match n {
            Node::Text(t) => t.text.len(),
            Node::Void(v) => v.inline_text_len(),
            Node::Element(_) => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document {
            children: vec![Node::paragraph("hello"), Node::paragraph("world")],
        }
    }

    #[test]
    fn node_at_path_resolves_nested_text() {
        let doc = doc();
        let Some(Node::Text(t)) = node_at_path(&doc, &[1, 0]) else {
            panic!("expected text node at [1, 0]");
        };
        assert_eq!(t.text, "world");
    }

    #[test]
    fn node_at_path_rejects_descent_into_leaves() {
        let doc = doc();
        assert!(node_at_path(&doc, &[0, 0, 0]).is_none());
        assert!(node_at_path(&doc, &[5]).is_none());
        assert!(node_at_path(&doc, &[]).is_none());
    }

    #[test]
    fn patch_apply_returns_inverse() {
        let mut attrs = Attrs::new();
        attrs.insert("width".into(), serde_json::json!(400));
        attrs.insert("height".into(), serde_json::json!(300));

        let patch = AttrPatch::default()
            .set("width", serde_json::json!(500))
            .remove("height");
        let inverse = patch_apply(&mut attrs, &patch);

        assert_eq!(attrs.get("width"), Some(&serde_json::json!(500)));
        assert!(!attrs.contains_key("height"));

        patch_apply(&mut attrs, &inverse);
        assert_eq!(attrs.get("width"), Some(&serde_json::json!(400)));
        assert_eq!(attrs.get("height"), Some(&serde_json::json!(300)));
    }

    #[test]
    fn clamp_lands_on_char_boundaries() {
        let s = "héllo";
        assert_eq!(clamp_to_char_boundary(s, 2), 1);
        assert_eq!(clamp_to_char_boundary(s, 3), 3);
        assert_eq!(clamp_to_char_boundary(s, 99), s.len());
    }

    #[test]
    fn plain_text_and_blankness() {
        let d = doc();
        assert_eq!(d.to_plain_text(), "hello\nworld");
        assert!(!d.is_blank());

        let empty = Document {
            children: vec![Node::paragraph("")],
        };
        assert_eq!(empty.to_plain_text(), "");
        assert!(empty.is_blank());

        let with_image = Document {
            children: vec![Node::Element(ElementNode {
                kind: "paragraph".into(),
                attrs: Attrs::default(),
                children: vec![
                    Node::Text(TextNode {
                        text: String::new(),
                        marks: Marks::default(),
                    }),
                    Node::image("/uploads/a.png"),
                ],
            })],
        };
        assert!(!with_image.is_blank());
    }

    #[test]
    fn ordered_swaps_backward_ranges() {
        let sel = TextSelection {
            anchor: Point::new(vec![1, 0], 3),
            head: Point::new(vec![0, 0], 1),
        };
        let (start, end) = sel.ordered();
        assert_eq!(start.path, vec![0, 0]);
        assert_eq!(end.path, vec![1, 0]);
    }
}
