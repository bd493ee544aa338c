use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::doc::{Document, ElementNode, Marks, Node, Point, Selection, TextSelection};
use crate::ops::{Op, StoredMarksAfter, Transaction};

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CommandError {
    message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Two extensions may not claim the same piece of vocabulary; registration
/// fails instead of silently overriding, so the combined profile is
/// deterministic no matter the registration order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("duplicate node kind: {kind}")]
    DuplicateNodeKind { kind: String },
    #[error("duplicate attribute {name} on node kind {kind}")]
    DuplicateAttr { kind: String, name: String },
    #[error("duplicate mark: {name}")]
    DuplicateMark { name: String },
    #[error("duplicate command id: {id}")]
    DuplicateCommand { id: String },
    #[error("duplicate query id: {id}")]
    DuplicateQuery { id: String },
}

#[derive(Clone)]
pub struct CommandSpec {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    pub args_example: Option<serde_json::Value>,
    pub handler: std::sync::Arc<
        dyn Fn(&mut crate::editor::Editor, Option<serde_json::Value>) -> Result<(), CommandError>
            + Send
            + Sync,
    >,
}

impl CommandSpec {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        handler: impl Fn(
            &mut crate::editor::Editor,
            Option<serde_json::Value>,
        ) -> Result<(), CommandError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            args_example: None,
            handler: std::sync::Arc::new(handler),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn args_example(mut self, args_example: serde_json::Value) -> Self {
        self.args_example = Some(args_example);
        self
    }
}

#[derive(Clone)]
pub struct QuerySpec {
    pub id: String,
    pub handler: std::sync::Arc<
        dyn Fn(
                &crate::editor::Editor,
                Option<serde_json::Value>,
            ) -> Result<serde_json::Value, QueryError>
            + Send
            + Sync,
    >,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Block,
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildConstraint {
    None,
    BlockOnly,
    InlineOnly,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub kind: String,
    pub role: NodeRole,
    pub is_void: bool,
    pub children: ChildConstraint,
    /// Tag the node parses from and renders to.
    pub tag: String,
}

/// Shape of an attribute value as it crosses the HTML boundary. Anything
/// that fails the shape is dropped on parse, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrShape {
    Str,
    UInt,
    OneOf(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrSpec {
    pub node_kind: String,
    pub name: String,
    /// Attribute name on the serialized tag; defaults to `name`.
    pub html_name: String,
    pub shape: AttrShape,
}

impl AttrSpec {
    pub fn new(node_kind: impl Into<String>, name: impl Into<String>, shape: AttrShape) -> Self {
        let name = name.into();
        Self {
            node_kind: node_kind.into(),
            html_name: name.clone(),
            name,
            shape,
        }
    }

    pub fn html_name(mut self, html_name: impl Into<String>) -> Self {
        self.html_name = html_name.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkSpec {
    pub name: String,
    /// Canonical tag the mark renders to.
    pub tag: String,
    /// Tags the mark parses from, canonical first.
    pub parse_tags: Vec<String>,
    /// Nesting order when a run carries several marks; lower wraps outer.
    pub rank: u8,
}

pub trait NormalizePass: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, doc: &Document, registry: &ExtensionRegistry) -> Vec<Op>;
}

/// A corrective follow-up a validator wants applied inside the same logical
/// step as the transaction it inspected.
#[derive(Debug, Clone, Default)]
pub struct Correction {
    pub ops: Vec<Op>,
    pub stored_marks: StoredMarksAfter,
}

/// Post-mutation correctors. Run exactly once per applied transaction,
/// after its ops and before normalization; their corrections are not fed
/// back through the validators.
pub trait EditValidator: Send + Sync {
    fn id(&self) -> &'static str;
    fn validate(
        &self,
        before: &Document,
        after: &Document,
        selection: &Selection,
        stored_marks: Option<&Marks>,
        tx: &Transaction,
        registry: &ExtensionRegistry,
    ) -> Option<Correction>;
}

pub trait Extension: Send + Sync {
    fn id(&self) -> &'static str;
    fn node_specs(&self) -> Vec<NodeSpec> {
        Vec::new()
    }
    fn attr_specs(&self) -> Vec<AttrSpec> {
        Vec::new()
    }
    fn mark_specs(&self) -> Vec<MarkSpec> {
        Vec::new()
    }
    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        Vec::new()
    }
    fn edit_validators(&self) -> Vec<Box<dyn EditValidator>> {
        Vec::new()
    }
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }
    fn queries(&self) -> Vec<QuerySpec> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct ExtensionRegistry {
    node_specs: HashMap<String, NodeSpec>,
    attr_specs: Vec<AttrSpec>,
    mark_specs: Vec<MarkSpec>,
    normalize_passes: Vec<Box<dyn NormalizePass>>,
    edit_validators: Vec<Box<dyn EditValidator>>,
    commands: HashMap<String, CommandSpec>,
    queries: HashMap<String, QuerySpec>,
}

impl ExtensionRegistry {
    pub fn new(
        extensions: impl IntoIterator<Item = Box<dyn Extension>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for extension in extensions {
            registry.register_extension(extension)?;
        }
        Ok(registry)
    }

    pub fn register_extension(
        &mut self,
        extension: Box<dyn Extension>,
    ) -> Result<(), RegistryError> {
        for spec in extension.node_specs() {
            if self.node_specs.contains_key(&spec.kind) {
                return Err(RegistryError::DuplicateNodeKind { kind: spec.kind });
            }
            self.node_specs.insert(spec.kind.clone(), spec);
        }

        for spec in extension.attr_specs() {
            if self
                .attr_specs
                .iter()
                .any(|s| s.node_kind == spec.node_kind && s.name == spec.name)
            {
                return Err(RegistryError::DuplicateAttr {
                    kind: spec.node_kind,
                    name: spec.name,
                });
            }
            self.attr_specs.push(spec);
        }

        for spec in extension.mark_specs() {
            if self.mark_specs.iter().any(|s| s.name == spec.name) {
                return Err(RegistryError::DuplicateMark { name: spec.name });
            }
            self.mark_specs.push(spec);
        }

        self.normalize_passes.extend(extension.normalize_passes());
        self.edit_validators.extend(extension.edit_validators());

        for cmd in extension.commands() {
            if self.commands.contains_key(&cmd.id) {
                return Err(RegistryError::DuplicateCommand { id: cmd.id });
            }
            self.commands.insert(cmd.id.clone(), cmd);
        }

        for query in extension.queries() {
            if self.queries.contains_key(&query.id) {
                return Err(RegistryError::DuplicateQuery { id: query.id });
            }
            self.queries.insert(query.id.clone(), query);
        }

        Ok(())
    }

    pub fn node_specs(&self) -> &HashMap<String, NodeSpec> {
        &self.node_specs
    }

    pub fn node_spec(&self, kind: &str) -> Option<&NodeSpec> {
        self.node_specs.get(kind)
    }

    pub fn node_spec_for_tag(&self, tag: &str) -> Option<&NodeSpec> {
        self.node_specs.values().find(|s| s.tag == tag)
    }

    pub fn is_known_kind(&self, kind: &str) -> bool {
        self.node_specs.contains_key(kind)
    }

    pub fn is_void_kind(&self, kind: &str) -> bool {
        self.node_specs.get(kind).is_some_and(|s| s.is_void)
    }

    /// Attribute schema of a node kind, in registration order. The order is
    /// also the serialization order of the attributes on the tag.
    pub fn attr_specs_for(&self, kind: &str) -> impl Iterator<Item = &AttrSpec> {
        self.attr_specs.iter().filter(move |s| s.node_kind == kind)
    }

    pub fn mark_specs(&self) -> &[MarkSpec] {
        &self.mark_specs
    }

    pub fn marks_in_rank_order(&self) -> Vec<&MarkSpec> {
        let mut specs: Vec<&MarkSpec> = self.mark_specs.iter().collect();
        specs.sort_by_key(|s| s.rank);
        specs
    }

    pub fn mark_spec_for_tag(&self, tag: &str) -> Option<&MarkSpec> {
        self.mark_specs
            .iter()
            .find(|s| s.parse_tags.iter().any(|t| t == tag))
    }

    pub fn normalize_passes(&self) -> &[Box<dyn NormalizePass>] {
        &self.normalize_passes
    }

    pub fn edit_validators(&self) -> &[Box<dyn EditValidator>] {
        &self.edit_validators
    }

    pub fn commands(&self) -> &HashMap<String, CommandSpec> {
        &self.commands
    }

    pub fn command(&self, id: &str) -> Option<CommandSpec> {
        self.commands.get(id).cloned()
    }

    pub fn queries(&self) -> &HashMap<String, QuerySpec> {
        &self.queries
    }

    pub fn query(&self, id: &str) -> Option<QuerySpec> {
        self.queries.get(id).cloned()
    }

    /// Returns the corrective ops of the first pass that is not already
    /// satisfied by `doc`. Passes run against the same snapshot, so applying
    /// one pass at a time keeps structural ops from different passes from
    /// invalidating each other; callers loop until this returns empty.
    pub fn normalize(&self, doc: &Document) -> Vec<Op> {
        for pass in &self.normalize_passes {
            let ops = pass.run(doc, self);
            if !ops.is_empty() {
                return ops;
            }
        }
        Vec::new()
    }

    /// Clamps a selection onto nodes that still exist: text points land on
    /// text leaves, a node selection must still address a void of a
    /// registered void kind.
    pub fn normalize_selection(&self, doc: &Document, selection: &Selection) -> Selection {
        let fallback = first_text_point(doc).unwrap_or(Point {
            path: vec![0],
            offset: 0,
        });

        match selection {
            Selection::Text(sel) => {
                let anchor =
                    normalize_point_to_existing_text(doc, &sel.anchor).unwrap_or_else(|| {
                        normalize_point_to_existing_text(doc, &sel.head)
                            .unwrap_or_else(|| fallback.clone())
                    });
                let head = normalize_point_to_existing_text(doc, &sel.head)
                    .unwrap_or_else(|| anchor.clone());
                Selection::Text(TextSelection { anchor, head })
            }
            Selection::Node(sel) => match crate::doc::node_at_path(doc, &sel.path) {
                Some(Node::Void(v)) if self.is_void_kind(&v.kind) => selection.clone(),
                _ => Selection::caret(fallback),
            },
        }
    }
}

pub(crate) fn first_text_point(doc: &Document) -> Option<Point> {
    fn walk(children: &[Node], path: &mut Vec<usize>) -> Option<Point> {
        for (ix, node) in children.iter().enumerate() {
            path.push(ix);
            match node {
                Node::Text(_) => {
                    let point = Point {
                        path: path.clone(),
                        offset: 0,
                    };
                    path.pop();
                    return Some(point);
                }
                Node::Element(el) => {
                    if let Some(point) = walk(&el.children, path) {
                        path.pop();
                        return Some(point);
                    }
                }
                Node::Void(_) => {}
            }
            path.pop();
        }
        None
    }

    walk(&doc.children, &mut Vec::new())
}

fn normalize_point_to_existing_text(doc: &Document, point: &Point) -> Option<Point> {
    if point.path.is_empty() || doc.children.is_empty() {
        return None;
    }

    fn first_text_descendant(children: &[Node], path: &mut Vec<usize>) -> Option<Point> {
        for (ix, node) in children.iter().enumerate() {
            path.push(ix);
            match node {
                Node::Text(_) => {
                    let point = Point {
                        path: path.clone(),
                        offset: 0,
                    };
                    path.pop();
                    return Some(point);
                }
                Node::Element(el) => {
                    if let Some(point) = first_text_descendant(&el.children, path) {
                        path.pop();
                        return Some(point);
                    }
                }
                Node::Void(_) => {}
            }
            path.pop();
        }
        None
    }

    let mut resolved_path: Vec<usize> = Vec::new();
    let mut children: &[Node] = &doc.children;

    for &wanted in &point.path {
        if children.is_empty() {
            break;
        }
        let ix = wanted.min(children.len() - 1);
        resolved_path.push(ix);
        let node = &children[ix];
        match node {
            Node::Text(t) => {
                return Some(Point {
                    path: resolved_path,
                    offset: point.offset.min(t.text.len()),
                });
            }
            Node::Element(el) => {
                children = &el.children;
            }
            Node::Void(_) => {
                break;
            }
        }
    }

    let node = crate::doc::node_at_path(doc, &resolved_path)?;
    match node {
        Node::Text(t) => Some(Point {
            path: resolved_path,
            offset: point.offset.min(t.text.len()),
        }),
        Node::Element(el) => first_text_descendant(&el.children, &mut resolved_path),
        Node::Void(_) => None,
    }
}

pub(crate) struct TextBlock<'a> {
    pub path: crate::ops::Path,
    pub el: &'a ElementNode,
}

pub(crate) fn element_is_text_block(el: &ElementNode, registry: &ExtensionRegistry) -> bool {
    match registry.node_spec(&el.kind).map(|s| s.children.clone()) {
        Some(ChildConstraint::InlineOnly) => true,
        Some(_) => false,
        None => el
            .children
            .iter()
            .any(|n| matches!(n, Node::Text(_) | Node::Void(_))),
    }
}

pub(crate) fn text_blocks_in_order<'a>(
    doc: &'a Document,
    registry: &ExtensionRegistry,
) -> Vec<TextBlock<'a>> {
    fn walk<'a>(
        nodes: &'a [Node],
        path: &mut Vec<usize>,
        registry: &ExtensionRegistry,
        out: &mut Vec<TextBlock<'a>>,
    ) {
        for (ix, node) in nodes.iter().enumerate() {
            let Node::Element(el) = node else {
                continue;
            };

            path.push(ix);

            if element_is_text_block(el, registry) {
                out.push(TextBlock {
                    path: path.clone(),
                    el,
                });
            } else {
                walk(&el.children, path, registry, out);
            }

            path.pop();
        }
    }

    let mut out = Vec::new();
    walk(&doc.children, &mut Vec::new(), registry, &mut out);
    out
}
