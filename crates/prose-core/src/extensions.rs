//! Built-in extensions behind [`ExtensionRegistry::cms_profile`]: paragraph
//! structure, the bold/italic/underline marks, links with their lifecycle
//! validator, font-size runs and inline images.

use serde_json::Value;
use url::Url;

use crate::doc::{
    clamp_to_char_boundary, is_point_in_block, node_at_path, point_for_global_offset,
    point_global_offset, total_inline_text_len, AttrPatch, Attrs, Document, ElementNode, Marks,
    Node, Point, Selection, TextNode, TextSelection, VoidNode,
};
use crate::editor::Editor;
use crate::ops::{Op, Path, StoredMarksAfter, Transaction};
use crate::registry::{
    text_blocks_in_order, AttrShape, AttrSpec, ChildConstraint, CommandError, CommandSpec,
    Correction, EditValidator, Extension, ExtensionRegistry, MarkSpec, NodeRole, NodeSpec,
    NormalizePass, QueryError, QuerySpec,
};

pub const MIN_FONT_SIZE_PT: u32 = 8;
pub const MAX_FONT_SIZE_PT: u32 = 72;

pub const IMAGE_ALIGNMENTS: [&str; 3] = ["left", "center", "right"];

impl ExtensionRegistry {
    /// The vocabulary served to CMS long-text fields: paragraphs of text runs
    /// and inline images, with bold, italic, underline, link and font-size
    /// marks.
    pub fn cms_profile() -> Self {
        let extensions: Vec<Box<dyn Extension>> = vec![
            Box::new(ParagraphExtension),
            Box::new(MarksExtension),
            Box::new(LinkExtension),
            Box::new(FontSizeExtension),
            Box::new(ImageExtension),
        ];
        Self::new(extensions).expect("cms profile registry must be valid")
    }
}

struct ParagraphExtension;

impl Extension for ParagraphExtension {
    fn id(&self) -> &'static str {
        "paragraph"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: "paragraph".to_string(),
            role: NodeRole::Block,
            is_void: false,
            children: ChildConstraint::InlineOnly,
            tag: "p".to_string(),
        }]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![
            Box::new(EnsureNonEmptyDocument),
            Box::new(EnsureBlocksHaveTextLeaf),
            Box::new(MergeAdjacentTextRuns),
            Box::new(DropEmptyTextRuns),
        ]
    }
}

struct EnsureNonEmptyDocument;

impl NormalizePass for EnsureNonEmptyDocument {
    fn id(&self) -> &'static str {
        "paragraph.ensure_non_empty_document"
    }

    fn run(&self, doc: &Document, _registry: &ExtensionRegistry) -> Vec<Op> {
        if doc.children.is_empty() {
            return vec![Op::InsertNode {
                path: vec![0],
                node: Node::paragraph(""),
            }];
        }
        Vec::new()
    }
}

/// Caret positions exist only inside text nodes, so every inline-only block
/// needs a text leaf, and every void needs one on each side. Without the
/// trailing leaf there would be no caret position after an image at the end
/// of a paragraph.
struct EnsureBlocksHaveTextLeaf;

impl NormalizePass for EnsureBlocksHaveTextLeaf {
    fn id(&self) -> &'static str {
        "paragraph.ensure_blocks_have_text_leaf"
    }

    fn run(&self, doc: &Document, registry: &ExtensionRegistry) -> Vec<Op> {
        let mut ops = Vec::new();

        fn empty_leaf() -> Node {
            Node::Text(TextNode {
                text: String::new(),
                marks: Marks::default(),
            })
        }

        fn pad_block(el: &ElementNode, path: &[usize], ops: &mut Vec<Op>) {
            let insert_at = |ops: &mut Vec<Op>, ix: usize| {
                let mut insert_path = path.to_vec();
                insert_path.push(ix);
                ops.push(Op::InsertNode {
                    path: insert_path,
                    node: empty_leaf(),
                });
            };

            if el.children.is_empty() {
                insert_at(ops, 0);
                return;
            }

            // Insert indices account for leaves already queued in this run.
            let queued_before = ops.len();
            let mut shift = 0usize;
            let mut prev_is_text = false;
            for (child_ix, child) in el.children.iter().enumerate() {
                match child {
                    Node::Text(_) => prev_is_text = true,
                    _ => {
                        if matches!(child, Node::Void(_)) && !prev_is_text {
                            insert_at(ops, child_ix + shift);
                            shift += 1;
                        }
                        prev_is_text = false;
                    }
                }
            }
            if matches!(el.children.last(), Some(Node::Void(_))) {
                insert_at(ops, el.children.len() + shift);
            }

            let has_text = el.children.iter().any(|n| matches!(n, Node::Text(_)));
            if ops.len() == queued_before && !has_text {
                insert_at(ops, 0);
            }
        }

        fn walk(
            children: &[Node],
            path: &mut Vec<usize>,
            registry: &ExtensionRegistry,
            ops: &mut Vec<Op>,
        ) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };

                path.push(ix);

                let spec_children = registry
                    .node_spec(&el.kind)
                    .map(|s| s.children.clone())
                    .unwrap_or(ChildConstraint::Any);

                if spec_children == ChildConstraint::InlineOnly {
                    pad_block(el, path, ops);
                } else {
                    walk(&el.children, path, registry, ops);
                }

                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), registry, &mut ops);
        ops
    }
}

struct MergeAdjacentTextRuns;

impl NormalizePass for MergeAdjacentTextRuns {
    fn id(&self) -> &'static str {
        "paragraph.merge_adjacent_text_runs"
    }

    fn run(&self, doc: &Document, registry: &ExtensionRegistry) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(
            children: &[Node],
            path: &mut Vec<usize>,
            registry: &ExtensionRegistry,
            ops: &mut Vec<Op>,
        ) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };

                path.push(ix);

                let spec_children = registry
                    .node_spec(&el.kind)
                    .map(|s| s.children.clone())
                    .unwrap_or_else(|| {
                        if el.children.iter().any(|n| matches!(n, Node::Text(_))) {
                            ChildConstraint::InlineOnly
                        } else {
                            ChildConstraint::Any
                        }
                    });

                if spec_children == ChildConstraint::InlineOnly {
                    if el.children.len() >= 2 {
                        let mut ix = el.children.len();
                        while ix > 0 {
                            ix -= 1;
                            let Node::Text(right) = &el.children[ix] else {
                                continue;
                            };

                            let mut start = ix;
                            while start > 0 {
                                let Some(Node::Text(left)) = el.children.get(start - 1) else {
                                    break;
                                };
                                if left.marks != right.marks {
                                    break;
                                }
                                start -= 1;
                            }

                            if start == ix {
                                continue;
                            }

                            let Some(Node::Text(first)) = el.children.get(start) else {
                                continue;
                            };
                            let mut appended = String::new();
                            for node in el.children.iter().take(ix + 1).skip(start + 1) {
                                if let Node::Text(t) = node {
                                    appended.push_str(&t.text);
                                }
                            }

                            if !appended.is_empty() {
                                let mut insert_text_path = path.clone();
                                insert_text_path.push(start);
                                ops.push(Op::InsertText {
                                    path: insert_text_path,
                                    offset: first.text.len(),
                                    text: appended,
                                });
                            }

                            for remove_ix in (start + 1..=ix).rev() {
                                let mut remove_path = path.clone();
                                remove_path.push(remove_ix);
                                ops.push(Op::RemoveNode { path: remove_path });
                            }

                            ix = start;
                        }
                    }
                } else {
                    walk(&el.children, path, registry, ops);
                }

                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), registry, &mut ops);

        ops
    }
}

/// Empty runs left behind by deletions are dropped once a sibling text run
/// can host the caret instead. An empty run whose only neighbours are voids
/// stays: it is the caret position beside the void.
struct DropEmptyTextRuns;

impl NormalizePass for DropEmptyTextRuns {
    fn id(&self) -> &'static str {
        "paragraph.drop_empty_text_runs"
    }

    fn run(&self, doc: &Document, registry: &ExtensionRegistry) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(
            children: &[Node],
            path: &mut Vec<usize>,
            registry: &ExtensionRegistry,
            ops: &mut Vec<Op>,
        ) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };

                path.push(ix);

                let spec_children = registry
                    .node_spec(&el.kind)
                    .map(|s| s.children.clone())
                    .unwrap_or(ChildConstraint::Any);

                if spec_children == ChildConstraint::InlineOnly {
                    let mut remaining_text = el
                        .children
                        .iter()
                        .filter(|n| matches!(n, Node::Text(_)))
                        .count();
                    let mut removals: Vec<usize> = Vec::new();

                    for (child_ix, child) in el.children.iter().enumerate() {
                        let Node::Text(t) = child else {
                            continue;
                        };
                        if !t.text.is_empty() || remaining_text <= 1 {
                            continue;
                        }
                        let text_neighbour = child_ix
                            .checked_sub(1)
                            .and_then(|p| el.children.get(p))
                            .is_some_and(|n| matches!(n, Node::Text(_)))
                            || el
                                .children
                                .get(child_ix + 1)
                                .is_some_and(|n| matches!(n, Node::Text(_)));
                        if text_neighbour {
                            removals.push(child_ix);
                            remaining_text -= 1;
                        }
                    }

                    for child_ix in removals.into_iter().rev() {
                        let mut remove_path = path.clone();
                        remove_path.push(child_ix);
                        ops.push(Op::RemoveNode { path: remove_path });
                    }
                } else {
                    walk(&el.children, path, registry, ops);
                }

                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), registry, &mut ops);
        ops
    }
}

struct MarksExtension;

impl Extension for MarksExtension {
    fn id(&self) -> &'static str {
        "marks"
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![
            MarkSpec {
                name: "bold".to_string(),
                tag: "strong".to_string(),
                parse_tags: vec!["strong".to_string(), "b".to_string()],
                rank: 1,
            },
            MarkSpec {
                name: "italic".to_string(),
                tag: "em".to_string(),
                parse_tags: vec!["em".to_string(), "i".to_string()],
                rank: 2,
            },
            MarkSpec {
                name: "underline".to_string(),
                tag: "u".to_string(),
                parse_tags: vec!["u".to_string()],
                rank: 3,
            },
        ]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("marks.toggle_bold", "Toggle bold", |editor, _args| {
                toggle_bold(editor)
                    .map_err(CommandError::new)
                    .and_then(|tx| {
                        editor
                            .apply(tx)
                            .map_err(|e| CommandError::new(format!("Failed to toggle bold: {e:?}")))
                    })
            })
            .description("Toggle bold on the current selection or caret."),
            CommandSpec::new("marks.toggle_italic", "Toggle italic", |editor, _args| {
                toggle_italic(editor)
                    .map_err(CommandError::new)
                    .and_then(|tx| {
                        editor.apply(tx).map_err(|e| {
                            CommandError::new(format!("Failed to toggle italic: {e:?}"))
                        })
                    })
            })
            .description("Toggle italic on the current selection or caret."),
            CommandSpec::new(
                "marks.toggle_underline",
                "Toggle underline",
                |editor, _args| {
                    toggle_underline(editor)
                        .map_err(CommandError::new)
                        .and_then(|tx| {
                            editor.apply(tx).map_err(|e| {
                                CommandError::new(format!("Failed to toggle underline: {e:?}"))
                            })
                        })
                },
            )
            .description("Toggle underline on the current selection or caret."),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec {
            id: "marks.active".to_string(),
            handler: std::sync::Arc::new(|editor, _args| {
                serde_json::to_value(active_marks(editor))
                    .map_err(|err| QueryError::new(format!("Failed to encode marks: {err}")))
            }),
        }]
    }
}

fn toggle_bold(editor: &Editor) -> Result<Transaction, String> {
    toggle_bool_mark(
        editor,
        |m| m.bold,
        |m, v| m.bold = v,
        "command:marks.toggle_bold",
    )
}

fn toggle_italic(editor: &Editor) -> Result<Transaction, String> {
    toggle_bool_mark(
        editor,
        |m| m.italic,
        |m, v| m.italic = v,
        "command:marks.toggle_italic",
    )
}

fn toggle_underline(editor: &Editor) -> Result<Transaction, String> {
    toggle_bool_mark(
        editor,
        |m| m.underline,
        |m, v| m.underline = v,
        "command:marks.toggle_underline",
    )
}

/// Marks the next typed character would take: stored marks if staged,
/// otherwise the marks of the text run under the selection head.
fn caret_marks(editor: &Editor, head: &Point) -> Marks {
    if let Some(marks) = editor.stored_marks() {
        return marks.clone();
    }
    match node_at_path(editor.doc(), &head.path) {
        Some(Node::Text(text)) => text.marks.clone(),
        _ => Marks::default(),
    }
}

fn active_marks(editor: &Editor) -> Marks {
    match editor.selection() {
        Selection::Text(sel) => caret_marks(editor, &sel.head),
        Selection::Node(_) => Marks::default(),
    }
}

/// A collapsed caret stages the toggle as stored marks; a range flips the
/// whole selection to the negation of "every selected character has it".
fn toggle_bool_mark(
    editor: &Editor,
    get: fn(&Marks) -> bool,
    set: fn(&mut Marks, bool),
    source: &'static str,
) -> Result<Transaction, String> {
    let sel = editor.selection().clone();
    match sel {
        Selection::Text(sel) if sel.is_collapsed() => {
            let mut marks = caret_marks(editor, &sel.head);
            let target = !get(&marks);
            set(&mut marks, target);
            Ok(Transaction::new(Vec::new())
                .stored_marks_after(StoredMarksAfter::Set(marks))
                .source(source))
        }
        Selection::Text(sel) => {
            let all_set = all_selected_text_nodes_have_mark(editor, &sel, get)?;
            let target = !all_set;
            apply_mark_range(editor, &sel, &|mut marks: Marks| {
                set(&mut marks, target);
                marks
            })
            .map(|(ops, selection_after)| {
                Transaction::new(ops)
                    .selection_after(selection_after)
                    .source(source)
            })
        }
        Selection::Node(_) => Err("Marks apply to text selections".into()),
    }
}

fn all_selected_text_nodes_have_mark(
    editor: &Editor,
    sel: &TextSelection,
    get: fn(&Marks) -> bool,
) -> Result<bool, String> {
    let (start, end) = sel.ordered();
    let Some(start_block_path) = start.path.split_last().map(|(_, p)| p.to_vec()) else {
        return Err("Selection start is not in a text block".into());
    };
    let Some(end_block_path) = end.path.split_last().map(|(_, p)| p.to_vec()) else {
        return Err("Selection end is not in a text block".into());
    };

    let blocks = text_blocks_in_order(editor.doc(), editor.registry());
    let start_index = blocks
        .iter()
        .position(|b| b.path == start_block_path)
        .ok_or_else(|| "Selection start is not in a text block".to_string())?;
    let end_index = blocks
        .iter()
        .position(|b| b.path == end_block_path)
        .ok_or_else(|| "Selection end is not in a text block".to_string())?;

    let (start_index, end_index) = if start_index <= end_index {
        (start_index, end_index)
    } else {
        (end_index, start_index)
    };

    let start_inline_ix = start.path.last().copied().unwrap_or(0);
    let end_inline_ix = end.path.last().copied().unwrap_or(0);

    for (block_index, block) in blocks
        .iter()
        .enumerate()
        .take(end_index + 1)
        .skip(start_index)
    {
        let children = block.el.children.as_slice();
        let total_len = total_inline_text_len(children);
        if total_len == 0 {
            continue;
        }

        let start_global = if block_index == start_index {
            point_global_offset(children, start_inline_ix, start.offset)
        } else {
            0
        };
        let end_global = if block_index == end_index {
            point_global_offset(children, end_inline_ix, end.offset)
        } else {
            total_len
        };
        if start_global >= end_global {
            continue;
        }

        let mut cursor = 0usize;
        for node in children {
            let (node_start, node_end) = match node {
                Node::Text(t) => {
                    let start = cursor;
                    let end = cursor + t.text.len();
                    cursor = end;
                    (start, end)
                }
                Node::Void(v) => {
                    let start = cursor;
                    let end = cursor + v.inline_text_len();
                    cursor = end;
                    (start, end)
                }
                Node::Element(_) => {
                    continue;
                }
            };
            if end_global <= node_start || start_global >= node_end {
                continue;
            }
            if let Node::Text(t) = node {
                if !get(&t.marks) {
                    return Ok(false);
                }
            }
        }
    }

    Ok(true)
}

/// Rebuilds every block the range touches with `apply` mapped over the
/// covered text, then remaps both selection endpoints through the global
/// offsets so the visual selection survives the node churn.
fn apply_mark_range(
    editor: &Editor,
    sel: &TextSelection,
    apply: &dyn Fn(Marks) -> Marks,
) -> Result<(Vec<Op>, Selection), String> {
    let (start, end) = sel.ordered();

    let Some(start_block_path) = start.path.split_last().map(|(_, p)| p.to_vec()) else {
        return Err("Selection start is not in a text block".into());
    };
    let Some(end_block_path) = end.path.split_last().map(|(_, p)| p.to_vec()) else {
        return Err("Selection end is not in a text block".into());
    };

    let blocks = text_blocks_in_order(editor.doc(), editor.registry());
    let start_index = blocks
        .iter()
        .position(|b| b.path == start_block_path)
        .ok_or_else(|| "Selection start is not in a text block".to_string())?;
    let end_index = blocks
        .iter()
        .position(|b| b.path == end_block_path)
        .ok_or_else(|| "Selection end is not in a text block".to_string())?;

    let (start_index, end_index) = if start_index <= end_index {
        (start_index, end_index)
    } else {
        (end_index, start_index)
    };

    let start_inline_ix = start.path.last().copied().unwrap_or(0);
    let end_inline_ix = end.path.last().copied().unwrap_or(0);

    let mut ops: Vec<Op> = Vec::new();
    let mut new_anchor = sel.anchor.clone();
    let mut new_head = sel.head.clone();

    for (block_index, block) in blocks
        .iter()
        .enumerate()
        .take(end_index + 1)
        .skip(start_index)
    {
        let children = block.el.children.as_slice();
        let total_len = total_inline_text_len(children);
        if total_len == 0 {
            continue;
        }

        let start_global = if block_index == start_index {
            point_global_offset(children, start_inline_ix, start.offset)
        } else {
            0
        };
        let end_global = if block_index == end_index {
            point_global_offset(children, end_inline_ix, end.offset)
        } else {
            total_len
        };

        if start_global >= end_global {
            continue;
        }

        let new_children = apply_marks_in_block(children, start_global, end_global, apply);

        for child_ix in (0..children.len()).rev() {
            let mut remove_path = block.path.clone();
            remove_path.push(child_ix);
            ops.push(Op::RemoveNode { path: remove_path });
        }
        for (child_ix, node) in new_children.iter().cloned().enumerate() {
            let mut insert_path = block.path.clone();
            insert_path.push(child_ix);
            ops.push(Op::InsertNode {
                path: insert_path,
                node,
            });
        }

        if is_point_in_block(&new_anchor, &block.path) {
            let global = point_global_offset(
                children,
                new_anchor.path.last().copied().unwrap_or(0),
                new_anchor.offset,
            );
            new_anchor = point_for_global_offset(&block.path, &new_children, global);
        }
        if is_point_in_block(&new_head, &block.path) {
            let global = point_global_offset(
                children,
                new_head.path.last().copied().unwrap_or(0),
                new_head.offset,
            );
            new_head = point_for_global_offset(&block.path, &new_children, global);
        }
    }

    Ok((ops, Selection::text(new_anchor, new_head)))
}

fn apply_marks_in_block(
    children: &[Node],
    start_global: usize,
    end_global: usize,
    apply: &dyn Fn(Marks) -> Marks,
) -> Vec<Node> {
    if start_global >= end_global {
        return children.to_vec();
    }

    let mut out: Vec<Node> = Vec::new();
    let mut cursor = 0usize;

    for node in children {
        let (node_start, node_end) = match node {
            Node::Text(t) => {
                let start = cursor;
                let end = cursor + t.text.len();
                cursor = end;
                (start, end)
            }
            Node::Void(v) => {
                cursor += v.inline_text_len();
                out.push(node.clone());
                continue;
            }
            Node::Element(_) => {
                out.push(node.clone());
                continue;
            }
        };

        if end_global <= node_start || start_global >= node_end {
            out.push(node.clone());
            continue;
        }

        let Node::Text(t) = node else {
            out.push(node.clone());
            continue;
        };

        let sel_start = (start_global.saturating_sub(node_start)).min(t.text.len());
        let sel_end = (end_global.saturating_sub(node_start)).min(t.text.len());

        let sel_start = clamp_to_char_boundary(&t.text, sel_start);
        let sel_end = clamp_to_char_boundary(&t.text, sel_end);

        if sel_start == 0 && sel_end == t.text.len() {
            let mut next = t.clone();
            next.marks = apply(next.marks);
            out.push(Node::Text(next));
            continue;
        }

        let prefix = t.text.get(..sel_start).unwrap_or("").to_string();
        let middle = t.text.get(sel_start..sel_end).unwrap_or("").to_string();
        let suffix = t.text.get(sel_end..).unwrap_or("").to_string();

        if !prefix.is_empty() {
            out.push(Node::Text(TextNode {
                text: prefix,
                marks: t.marks.clone(),
            }));
        }
        if !middle.is_empty() {
            out.push(Node::Text(TextNode {
                text: middle,
                marks: apply(t.marks.clone()),
            }));
        }
        if !suffix.is_empty() {
            out.push(Node::Text(TextNode {
                text: suffix,
                marks: t.marks.clone(),
            }));
        }
    }

    if out.is_empty() {
        out.push(Node::Text(TextNode {
            text: String::new(),
            marks: Marks::default(),
        }));
    }

    out
}

struct LinkExtension;

impl Extension for LinkExtension {
    fn id(&self) -> &'static str {
        "link"
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![MarkSpec {
            name: "link".to_string(),
            tag: "a".to_string(),
            parse_tags: vec!["a".to_string()],
            rank: 0,
        }]
    }

    fn edit_validators(&self) -> Vec<Box<dyn EditValidator>> {
        vec![Box::new(UnsetLinkOnEdit)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("link.set", "Set link", |editor, args| {
                let href = args
                    .as_ref()
                    .and_then(|v| v.get("href"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| CommandError::new("Missing args.href"))?
                    .to_string();

                set_link(editor, href)
                    .map_err(CommandError::new)
                    .and_then(|tx| {
                        editor
                            .apply(tx)
                            .map_err(|e| CommandError::new(format!("Failed to set link: {e:?}")))
                    })
            })
            .description("Link the selected text. Rejects URLs without a host.")
            .args_example(serde_json::json!({ "href": "https://example.com" })),
            CommandSpec::new("link.unset", "Remove link", |editor, _args| {
                unset_link(editor)
                    .map_err(CommandError::new)
                    .and_then(|tx| {
                        editor
                            .apply(tx)
                            .map_err(|e| CommandError::new(format!("Failed to unset link: {e:?}")))
                    })
            })
            .description("Remove the link under the selection or caret."),
        ]
    }
}

fn set_link(editor: &Editor, href: String) -> Result<Transaction, String> {
    match Url::parse(&href) {
        Ok(url) if url.has_host() => {}
        _ => return Err(format!("Invalid link URL: {href}")),
    }

    let Selection::Text(sel) = editor.selection().clone() else {
        return Err("Select text to link".into());
    };
    // A caret carries no characters to link, and freshly typed linked text
    // would be stripped again by the lifecycle validator.
    if sel.is_collapsed() {
        return Err("Select text to link".into());
    }

    apply_mark_range(editor, &sel, &|mut marks: Marks| {
        marks.link = Some(href.clone());
        marks
    })
    .map(|(ops, selection_after)| {
        Transaction::new(ops)
            .selection_after(selection_after)
            .source("command:link.set")
    })
}

fn unset_link(editor: &Editor) -> Result<Transaction, String> {
    let sel = editor.selection().clone();
    match sel {
        Selection::Text(sel) if sel.is_collapsed() => {
            // Expand the caret to the contiguous linked run it touches, the
            // same extent the lifecycle validator would strip.
            let head = &sel.head;
            if head.path.is_empty() {
                return Err("Selection is not in a text node".into());
            }
            let (child_ix, block_path) = head
                .path
                .split_last()
                .map(|(ix, p)| (*ix, p.to_vec()))
                .ok_or_else(|| "Selection is not in a text node".to_string())?;
            let Some(Node::Element(el)) = node_at_path(editor.doc(), &block_path) else {
                return Err("Selection is not in a text block".into());
            };

            let caret_global = point_global_offset(&el.children, child_ix, head.offset);
            let run = linked_runs(&el.children)
                .into_iter()
                .find(|run| run.start <= caret_global && caret_global <= run.end);

            let ops = match run {
                Some(run) => unlink_run_ops(&block_path, &el.children, &run),
                None => Vec::new(),
            };
            let stored = caret_marks(editor, head).without_link();
            Ok(Transaction::new(ops)
                .stored_marks_after(StoredMarksAfter::Set(stored))
                .source("command:link.unset"))
        }
        Selection::Text(sel) => apply_mark_range(editor, &sel, &|marks: Marks| marks.without_link())
            .map(|(ops, selection_after)| {
                Transaction::new(ops)
                    .selection_after(selection_after)
                    .source("command:link.unset")
            }),
        Selection::Node(_) => Err("Select text to unlink".into()),
    }
}

/// A maximal run of contiguous link-marked text inside one block, in global
/// text offsets. Href values are ignored: adjacency alone joins runs.
struct LinkedRun {
    start: usize,
    end: usize,
    child_ixs: Vec<usize>,
}

fn linked_runs(children: &[Node]) -> Vec<LinkedRun> {
    let mut runs: Vec<LinkedRun> = Vec::new();
    let mut current: Option<LinkedRun> = None;
    let mut cursor = 0usize;

    for (child_ix, node) in children.iter().enumerate() {
        match node {
            Node::Text(t) if t.marks.link.is_some() => {
                let run = current.get_or_insert(LinkedRun {
                    start: cursor,
                    end: cursor,
                    child_ixs: Vec::new(),
                });
                run.child_ixs.push(child_ix);
                cursor += t.text.len();
                run.end = cursor;
            }
            Node::Text(t) => {
                if let Some(run) = current.take() {
                    runs.push(run);
                }
                cursor += t.text.len();
            }
            Node::Void(v) => {
                if let Some(run) = current.take() {
                    runs.push(run);
                }
                cursor += v.inline_text_len();
            }
            Node::Element(_) => {
                if let Some(run) = current.take() {
                    runs.push(run);
                }
            }
        }
    }
    if let Some(run) = current.take() {
        runs.push(run);
    }

    runs
}

fn unlink_run_ops(block_path: &[usize], children: &[Node], run: &LinkedRun) -> Vec<Op> {
    let mut ops = Vec::new();
    for &child_ix in &run.child_ixs {
        let Some(Node::Text(t)) = children.get(child_ix) else {
            continue;
        };
        let mut path = block_path.to_vec();
        path.push(child_ix);
        ops.push(Op::SetTextMarks {
            path,
            marks: t.marks.without_link(),
        });
    }
    ops
}

/// Strips the link mark from every linked run the edited range touches.
///
/// Any mutation that changes document text and leaves the selection inside
/// or immediately adjacent to linked text destroys the whole contiguous run,
/// not just the edited characters. Editing strictly inside a link therefore
/// unlinks all of it. Stored marks lose the link too, so continued typing
/// does not re-acquire it.
struct UnsetLinkOnEdit;

impl EditValidator for UnsetLinkOnEdit {
    fn id(&self) -> &'static str {
        "link.unset_on_edit"
    }

    fn validate(
        &self,
        before: &Document,
        after: &Document,
        selection: &Selection,
        stored_marks: Option<&Marks>,
        _tx: &Transaction,
        registry: &ExtensionRegistry,
    ) -> Option<Correction> {
        if before.to_plain_text() == after.to_plain_text() {
            return None;
        }
        let Selection::Text(sel) = selection else {
            return None;
        };

        let (start, end) = sel.ordered();
        let start_block_path = start.path.split_last().map(|(_, p)| p.to_vec())?;
        let end_block_path = end.path.split_last().map(|(_, p)| p.to_vec())?;

        let blocks = text_blocks_in_order(after, registry);
        let start_index = blocks.iter().position(|b| b.path == start_block_path)?;
        let end_index = blocks.iter().position(|b| b.path == end_block_path)?;
        let (start_index, end_index) = if start_index <= end_index {
            (start_index, end_index)
        } else {
            (end_index, start_index)
        };

        let start_inline_ix = start.path.last().copied().unwrap_or(0);
        let end_inline_ix = end.path.last().copied().unwrap_or(0);

        let mut ops: Vec<Op> = Vec::new();
        for (block_index, block) in blocks
            .iter()
            .enumerate()
            .take(end_index + 1)
            .skip(start_index)
        {
            let children = block.el.children.as_slice();
            let total_len = total_inline_text_len(children);

            let start_global = if block_index == start_index {
                point_global_offset(children, start_inline_ix, start.offset)
            } else {
                0
            };
            let end_global = if block_index == end_index {
                point_global_offset(children, end_inline_ix, end.offset)
            } else {
                total_len
            };

            for run in linked_runs(children) {
                // Touching includes adjacency, so a collapsed caret at either
                // boundary of a run still selects it.
                if run.end >= start_global && run.start <= end_global {
                    ops.extend(unlink_run_ops(&block.path, children, &run));
                }
            }
        }

        if ops.is_empty() {
            return None;
        }

        let stored = match stored_marks {
            Some(marks) if marks.link.is_some() => StoredMarksAfter::Set(marks.without_link()),
            _ => StoredMarksAfter::Keep,
        };

        Some(Correction {
            ops,
            stored_marks: stored,
        })
    }
}

struct FontSizeExtension;

impl Extension for FontSizeExtension {
    fn id(&self) -> &'static str {
        "font_size"
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![MarkSpec {
            name: "font_size".to_string(),
            tag: "span".to_string(),
            parse_tags: vec!["span".to_string()],
            rank: 4,
        }]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(ClampFontSizeRuns)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("marks.set_font_size", "Set font size", |editor, args| {
                let pt = args
                    .as_ref()
                    .and_then(|v| v.get("pt"))
                    .and_then(|v| v.as_u64())
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| CommandError::new("Missing args.pt"))?;

                set_font_size(editor, Some(pt))
                    .map_err(CommandError::new)
                    .and_then(|tx| {
                        editor.apply(tx).map_err(|e| {
                            CommandError::new(format!("Failed to set font size: {e:?}"))
                        })
                    })
            })
            .description("Set the font size mark in points, clamped to 8..=72.")
            .args_example(serde_json::json!({ "pt": 14 })),
            CommandSpec::new(
                "marks.unset_font_size",
                "Reset font size",
                |editor, _args| {
                    set_font_size(editor, None)
                        .map_err(CommandError::new)
                        .and_then(|tx| {
                            editor.apply(tx).map_err(|e| {
                                CommandError::new(format!("Failed to unset font size: {e:?}"))
                            })
                        })
                },
            )
            .description("Drop the font size mark, returning to the default size."),
        ]
    }
}

fn set_font_size(editor: &Editor, pt: Option<u32>) -> Result<Transaction, String> {
    let pt = pt.map(|pt| pt.clamp(MIN_FONT_SIZE_PT, MAX_FONT_SIZE_PT));
    let source = match pt {
        Some(_) => "command:marks.set_font_size",
        None => "command:marks.unset_font_size",
    };

    let sel = editor.selection().clone();
    match sel {
        Selection::Text(sel) if sel.is_collapsed() => {
            let mut marks = caret_marks(editor, &sel.head);
            marks.font_size = pt;
            Ok(Transaction::new(Vec::new())
                .stored_marks_after(StoredMarksAfter::Set(marks))
                .source(source))
        }
        Selection::Text(sel) => apply_mark_range(editor, &sel, &|mut marks: Marks| {
            marks.font_size = pt;
            marks
        })
        .map(|(ops, selection_after)| {
            Transaction::new(ops)
                .selection_after(selection_after)
                .source(source)
        }),
        Selection::Node(_) => Err("Font size applies to text selections".into()),
    }
}

struct ClampFontSizeRuns;

impl NormalizePass for ClampFontSizeRuns {
    fn id(&self) -> &'static str {
        "font_size.clamp_runs"
    }

    fn run(&self, doc: &Document, _registry: &ExtensionRegistry) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(children: &[Node], path: &mut Vec<usize>, ops: &mut Vec<Op>) {
            for (ix, node) in children.iter().enumerate() {
                path.push(ix);
                match node {
                    Node::Text(t) => {
                        if let Some(pt) = t.marks.font_size {
                            let clamped = pt.clamp(MIN_FONT_SIZE_PT, MAX_FONT_SIZE_PT);
                            if clamped != pt {
                                let mut marks = t.marks.clone();
                                marks.font_size = Some(clamped);
                                ops.push(Op::SetTextMarks {
                                    path: path.clone(),
                                    marks,
                                });
                            }
                        }
                    }
                    Node::Element(el) => walk(&el.children, path, ops),
                    Node::Void(_) => {}
                }
                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), &mut ops);
        ops
    }
}

struct ImageExtension;

impl Extension for ImageExtension {
    fn id(&self) -> &'static str {
        "image"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: "image".to_string(),
            role: NodeRole::Inline,
            is_void: true,
            children: ChildConstraint::None,
            tag: "img".to_string(),
        }]
    }

    fn attr_specs(&self) -> Vec<AttrSpec> {
        vec![
            AttrSpec::new("image", "src", AttrShape::Str),
            AttrSpec::new("image", "alt", AttrShape::Str),
            AttrSpec::new("image", "title", AttrShape::Str),
            AttrSpec::new("image", "width", AttrShape::UInt),
            AttrSpec::new("image", "height", AttrShape::UInt),
            AttrSpec::new(
                "image",
                "align",
                AttrShape::OneOf(IMAGE_ALIGNMENTS.iter().map(|s| s.to_string()).collect()),
            )
            .html_name("data-align"),
        ]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(PairImageDimensions), Box::new(DropInvalidImageAlign)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("image.insert", "Insert image", |editor, args| {
                let src = args
                    .as_ref()
                    .and_then(|v| v.get("src"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| CommandError::new("Missing args.src"))?
                    .to_string();
                let alt = args
                    .as_ref()
                    .and_then(|v| v.get("alt"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                let title = args
                    .as_ref()
                    .and_then(|v| v.get("title"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());

                insert_image(editor, src, alt, title)
                    .map_err(CommandError::new)
                    .and_then(|tx| {
                        editor.apply(tx).map_err(|e| {
                            CommandError::new(format!("Failed to insert image: {e:?}"))
                        })
                    })
            })
            .description("Insert an inline image (void) at the caret.")
            .args_example(
                serde_json::json!({ "src": "https://example.com/image.png", "alt": "Alt text" }),
            ),
            CommandSpec::new("image.set_width", "Set image width", |editor, args| {
                let px = match args.as_ref().and_then(|v| v.get("px")) {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(
                        v.as_u64()
                            .filter(|px| *px > 0)
                            .ok_or_else(|| CommandError::new("args.px must be a positive integer"))?,
                    ),
                };

                set_image_width(editor, px)
                    .map_err(CommandError::new)
                    .and_then(|tx| {
                        editor.apply(tx).map_err(|e| {
                            CommandError::new(format!("Failed to set image width: {e:?}"))
                        })
                    })
            })
            .description("Set the selected image's width in pixels; null clears it. Height is always cleared.")
            .args_example(serde_json::json!({ "px": 400 })),
            CommandSpec::new("image.set_align", "Align image", |editor, args| {
                let align = args
                    .as_ref()
                    .and_then(|v| v.get("align"))
                    .and_then(|v| v.as_str())
                    .filter(|align| IMAGE_ALIGNMENTS.contains(align))
                    .ok_or_else(|| CommandError::new("args.align must be left, center or right"))?
                    .to_string();

                set_image_align(editor, Some(align))
                    .map_err(CommandError::new)
                    .and_then(|tx| {
                        editor.apply(tx).map_err(|e| {
                            CommandError::new(format!("Failed to align image: {e:?}"))
                        })
                    })
            })
            .description("Set the selected image's alignment.")
            .args_example(serde_json::json!({ "align": "center" })),
            CommandSpec::new("image.unset_align", "Reset image alignment", |editor, _args| {
                set_image_align(editor, None)
                    .map_err(CommandError::new)
                    .and_then(|tx| {
                        editor.apply(tx).map_err(|e| {
                            CommandError::new(format!("Failed to reset image alignment: {e:?}"))
                        })
                    })
            })
            .description("Drop the selected image's alignment attribute."),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec {
            id: "image.attrs".to_string(),
            handler: std::sync::Arc::new(|editor, _args| {
                let Selection::Node(sel) = editor.selection() else {
                    return Ok(Value::Null);
                };
                match node_at_path(editor.doc(), &sel.path) {
                    Some(Node::Void(v)) if v.kind == "image" => serde_json::to_value(&v.attrs)
                        .map_err(|err| QueryError::new(format!("Failed to encode attrs: {err}"))),
                    _ => Ok(Value::Null),
                }
            }),
        }]
    }
}

/// Splits the caret's text run and slots the image between the halves.
/// The caret ends up in the run following the image, so typing continues
/// after it.
fn insert_image(
    editor: &Editor,
    src: String,
    alt: Option<String>,
    title: Option<String>,
) -> Result<Transaction, String> {
    let sel = editor.selection().clone();
    let Selection::Text(sel) = sel else {
        return Err("Selection must be collapsed".into());
    };
    if !sel.is_collapsed() {
        return Err("Selection must be collapsed".into());
    }

    let head = sel.head;
    if head.path.is_empty() {
        return Err("Selection is not in a text node".into());
    }
    let (child_ix, block_path) = head
        .path
        .split_last()
        .ok_or_else(|| "Selection is not in a text node".to_string())?;

    let Some(Node::Element(el)) = node_at_path(editor.doc(), block_path) else {
        return Err("Selection is not in a text block".into());
    };
    let Some(Node::Text(text)) = el.children.get(*child_ix) else {
        return Err("Selection is not in a text node".into());
    };

    let cursor = clamp_to_char_boundary(&text.text, head.offset);
    let left = text.text.get(..cursor).unwrap_or("").to_string();
    let right = text.text.get(cursor..).unwrap_or("").to_string();
    let marks = text.marks.clone();

    let mut replacement: Vec<Node> = Vec::new();
    let base_child_ix = *child_ix;
    let mut image_ix = base_child_ix;

    if !left.is_empty() {
        replacement.push(Node::Text(TextNode {
            text: left,
            marks: marks.clone(),
        }));
        image_ix += 1;
    }

    let mut attrs = Attrs::default();
    attrs.insert("src".to_string(), Value::String(src));
    if let Some(alt) = alt {
        attrs.insert("alt".to_string(), Value::String(alt));
    }
    if let Some(title) = title {
        attrs.insert("title".to_string(), Value::String(title));
    }
    replacement.push(Node::Void(VoidNode {
        kind: "image".to_string(),
        attrs,
    }));

    if right.is_empty() {
        replacement.push(Node::Text(TextNode {
            text: String::new(),
            marks: marks.clone(),
        }));
    } else {
        replacement.push(Node::Text(TextNode { text: right, marks }));
    }

    let mut ops: Vec<Op> = Vec::new();
    ops.push(Op::RemoveNode {
        path: head.path.clone(),
    });
    for (i, node) in replacement.into_iter().enumerate() {
        let mut path = block_path.to_vec();
        path.push(base_child_ix + i);
        ops.push(Op::InsertNode { path, node });
    }

    let mut selection_path = block_path.to_vec();
    selection_path.push(image_ix + 1);
    let selection_after = Selection::caret(Point::new(selection_path, 0));
    Ok(Transaction::new(ops)
        .selection_after(selection_after)
        .source("command:image.insert"))
}

fn selected_image_path(editor: &Editor) -> Result<Path, String> {
    let Selection::Node(sel) = editor.selection() else {
        return Err("Select an image first".into());
    };
    match node_at_path(editor.doc(), &sel.path) {
        Some(Node::Void(v)) if v.kind == "image" => Ok(sel.path.clone()),
        _ => Err("Select an image first".into()),
    }
}

/// Width commits leave the selection alone so repeated adjustments from an
/// attribute input keep targeting the same node. Setting a width always
/// clears height; the rendered image keeps its aspect ratio.
fn set_image_width(editor: &Editor, px: Option<u64>) -> Result<Transaction, String> {
    let path = selected_image_path(editor)?;
    let patch = match px {
        Some(px) => AttrPatch::default()
            .set("width", Value::from(px))
            .remove("height"),
        None => AttrPatch::default().remove("width").remove("height"),
    };
    Ok(Transaction::new(vec![Op::SetNodeAttrs { path, patch }])
        .source("command:image.set_width"))
}

fn set_image_align(editor: &Editor, align: Option<String>) -> Result<Transaction, String> {
    let path = selected_image_path(editor)?;
    let (patch, source) = match align {
        Some(align) => (
            AttrPatch::default().set("align", Value::String(align)),
            "command:image.set_align",
        ),
        None => (
            AttrPatch::default().remove("align"),
            "command:image.unset_align",
        ),
    };
    Ok(Transaction::new(vec![Op::SetNodeAttrs { path, patch }]).source(source))
}

/// `width` and `height` are never both set: width wins and height is
/// dropped, preserving aspect ratio. Values that are not unsigned integers
/// are dropped outright.
struct PairImageDimensions;

impl NormalizePass for PairImageDimensions {
    fn id(&self) -> &'static str {
        "image.pair_dimensions"
    }

    fn run(&self, doc: &Document, _registry: &ExtensionRegistry) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(children: &[Node], path: &mut Vec<usize>, ops: &mut Vec<Op>) {
            for (ix, node) in children.iter().enumerate() {
                path.push(ix);
                match node {
                    Node::Void(v) if v.kind == "image" => {
                        let mut patch = AttrPatch::default();
                        for name in ["width", "height"] {
                            if v.attrs.get(name).is_some_and(|value| !value.is_u64()) {
                                patch = patch.remove(name);
                            }
                        }
                        if v.attr_u64("width").is_some() && v.attr_u64("height").is_some() {
                            patch = patch.remove("height");
                        }
                        if !patch.remove.is_empty() {
                            ops.push(Op::SetNodeAttrs {
                                path: path.clone(),
                                patch,
                            });
                        }
                    }
                    Node::Element(el) => walk(&el.children, path, ops),
                    _ => {}
                }
                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), &mut ops);
        ops
    }
}

struct DropInvalidImageAlign;

impl NormalizePass for DropInvalidImageAlign {
    fn id(&self) -> &'static str {
        "image.drop_invalid_align"
    }

    fn run(&self, doc: &Document, _registry: &ExtensionRegistry) -> Vec<Op> {
        let mut ops = Vec::new();

        fn walk(children: &[Node], path: &mut Vec<usize>, ops: &mut Vec<Op>) {
            for (ix, node) in children.iter().enumerate() {
                path.push(ix);
                match node {
                    Node::Void(v) if v.kind == "image" => {
                        let valid = match v.attrs.get("align") {
                            None => true,
                            Some(Value::String(s)) => IMAGE_ALIGNMENTS.contains(&s.as_str()),
                            Some(_) => false,
                        };
                        if !valid {
                            ops.push(Op::SetNodeAttrs {
                                path: path.clone(),
                                patch: AttrPatch::default().remove("align"),
                            });
                        }
                    }
                    Node::Element(el) => walk(&el.children, path, ops),
                    _ => {}
                }
                path.pop();
            }
        }

        walk(&doc.children, &mut Vec::new(), &mut ops);
        ops
    }
}
