use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::doc::{
    clamp_to_char_boundary, insert_node, node_at_path, node_mut, node_text_mut, patch_apply,
    point_for_global_offset, point_global_offset, remove_node, total_inline_text_len, Document,
    ElementNode, Marks, Node, PathError, Point, Selection, TextNode, TextSelection,
};
use crate::ops::{Op, Path, StoredMarksAfter, Transaction};
use crate::registry::{CommandError, ExtensionRegistry, QueryError};

#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub inverse_ops: Vec<Op>,
    pub selection_before: Selection,
    pub selection_after: Selection,
}

#[derive(Debug, Default)]
pub struct EditorConfig {
    pub max_undo: usize,
    pub max_normalize_iterations: usize,
}

impl EditorConfig {
    fn with_defaults(mut self) -> Self {
        if self.max_undo == 0 {
            self.max_undo = 200;
        }
        if self.max_normalize_iterations == 0 {
            self.max_normalize_iterations = 100;
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("normalization did not converge")]
    NormalizeDidNotConverge,
}

impl From<PathError> for ApplyError {
    fn from(value: PathError) -> Self {
        ApplyError::InvalidPath(value.0)
    }
}

pub struct Editor {
    doc: Document,
    selection: Selection,
    stored_marks: Option<Marks>,
    registry: ExtensionRegistry,
    config: EditorConfig,
    undo_stack: Vec<UndoRecord>,
    redo_stack: Vec<UndoRecord>,
}

impl Editor {
    pub fn new(doc: Document, selection: Selection, registry: ExtensionRegistry) -> Self {
        let config = EditorConfig::default().with_defaults();
        let mut editor = Self {
            doc,
            selection,
            stored_marks: None,
            registry,
            config,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
        };
        editor.normalize_in_place();
        editor
    }

    pub fn with_cms_extensions() -> Self {
        let registry = ExtensionRegistry::cms_profile();
        let doc = Document {
            children: vec![Node::paragraph("")],
        };
        let selection = Selection::caret(Point::new(vec![0, 0], 0));
        Self::new(doc, selection, registry)
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn stored_marks(&self) -> Option<&Marks> {
        self.stored_marks.as_ref()
    }

    /// Stages marks for the next insertion at the caret. Stored marks are not
    /// document state, so this records no undo step; they are consumed by the
    /// next insert and dropped when the selection moves.
    pub fn set_stored_marks(&mut self, marks: Option<Marks>) {
        self.stored_marks = marks;
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// Moving the selection drops any pending stored marks.
    pub fn set_selection(&mut self, selection: Selection) {
        self.selection = selection;
        self.stored_marks = None;
        self.normalize_selection_in_place();
    }

    pub fn select_node(&mut self, path: Path) {
        self.set_selection(Selection::node(path));
    }

    /// Wholesale content replacement: fresh selection, history and stored
    /// marks are discarded. Used when an external owner supplies new content.
    pub fn replace_document(&mut self, doc: Document) {
        self.doc = doc;
        self.selection = Selection::caret(Point::new(vec![0, 0], 0));
        self.stored_marks = None;
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.normalize_in_place();
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo(&mut self) -> bool {
        let Some(record) = self.undo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        } = record;

        let mut redo_ops: Vec<Op> = Vec::new();
        for op in inverse_ops.iter().cloned() {
            if let Ok(inv) = self.apply_op(op) {
                redo_ops.push(inv);
            } else {
                // If we can't apply inverse ops, bail out and stop mutating further.
                break;
            }
        }
        redo_ops.reverse();

        self.selection = selection_before.clone();
        self.stored_marks = None;
        self.normalize_in_place();

        self.redo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: redo_ops,
        });
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(record) = self.redo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        } = record;

        let mut undo_ops: Vec<Op> = Vec::new();
        for op in inverse_ops.iter().cloned() {
            if let Ok(inv) = self.apply_op(op) {
                undo_ops.push(inv);
            } else {
                break;
            }
        }
        undo_ops.reverse();

        self.selection = selection_after.clone();
        self.stored_marks = None;
        self.normalize_in_place();

        self.undo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: undo_ops,
        });
        true
    }

    /// Applies a transaction as one logical step: the ops, then a single
    /// edit-validator pass over the result, then normalization to fixpoint.
    /// Everything lands in one undo record, so corrections are never visible
    /// as separate states.
    pub fn apply(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        let selection_before = self.selection.clone();
        let before = (!self.registry.edit_validators().is_empty()).then(|| self.doc.clone());

        let mut inverse_ops: Vec<Op> = Vec::new();
        for op in tx.ops.iter().cloned() {
            let inv = self.apply_op(op)?;
            inverse_ops.push(inv);
        }

        if let Some(sel) = &tx.selection_after {
            self.selection = sel.clone();
        }
        match &tx.stored_marks_after {
            StoredMarksAfter::Keep => {}
            StoredMarksAfter::Clear => self.stored_marks = None,
            StoredMarksAfter::Set(marks) => self.stored_marks = Some(marks.clone()),
        }

        // Validators run once per transaction; their corrections are applied
        // inside the same record and are not themselves re-validated.
        if let Some(before) = before {
            let corrections: Vec<_> = self
                .registry
                .edit_validators()
                .iter()
                .filter_map(|validator| {
                    validator.validate(
                        &before,
                        &self.doc,
                        &self.selection,
                        self.stored_marks.as_ref(),
                        &tx,
                        &self.registry,
                    )
                })
                .collect();
            for correction in corrections {
                for op in correction.ops {
                    let inv = self.apply_op(op)?;
                    inverse_ops.push(inv);
                }
                match correction.stored_marks {
                    StoredMarksAfter::Keep => {}
                    StoredMarksAfter::Clear => self.stored_marks = None,
                    StoredMarksAfter::Set(marks) => self.stored_marks = Some(marks),
                }
            }
        }

        let mut inverse_normalize = self.normalize_with_inverse_ops()?;
        inverse_ops.append(&mut inverse_normalize);
        inverse_ops.reverse();

        self.normalize_selection_in_place();

        // A transaction that changed nothing (caret mark toggles carry only
        // stored marks) leaves no history entry.
        if inverse_ops.is_empty() {
            return Ok(());
        }

        let selection_after = self.selection.clone();

        self.undo_stack.push(UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        });
        self.redo_stack.clear();
        if self.undo_stack.len() > self.config.max_undo {
            self.undo_stack.remove(0);
        }

        Ok(())
    }

    /// Types `text` at the selection. A range or node selection is deleted
    /// first, stored marks are consumed by the inserted run, and embedded
    /// newlines split paragraphs. One undo record.
    pub fn insert_text(&mut self, text: &str) -> Result<(), ApplyError> {
        if text.is_empty() {
            return Ok(());
        }

        let mut draft = EditDraft::new(self.doc.clone(), self.selection.clone());
        let mut caret = match self.selection.clone() {
            Selection::Text(sel) if !sel.is_collapsed() => delete_text_selection(&mut draft, &sel)?,
            Selection::Text(sel) => sel.head,
            Selection::Node(sel) => delete_node_selection(&mut draft, &sel.path)?,
        };

        let marks = self.stored_marks.clone();
        let mut first = true;
        for segment in text.split('\n') {
            if !first {
                caret = split_paragraph_at(&mut draft, &caret)?;
            }
            if !segment.is_empty() {
                caret = insert_plain(&mut draft, &caret, segment, marks.clone())?;
            }
            first = false;
        }

        self.apply(
            Transaction::new(draft.ops)
                .selection_after(Selection::caret(caret))
                .stored_marks_after(StoredMarksAfter::Clear)
                .source("edit:insert_text"),
        )
    }

    pub fn delete_selection(&mut self) -> Result<(), ApplyError> {
        let mut draft = EditDraft::new(self.doc.clone(), self.selection.clone());
        let caret = match self.selection.clone() {
            Selection::Text(sel) if !sel.is_collapsed() => delete_text_selection(&mut draft, &sel)?,
            Selection::Node(sel) => delete_node_selection(&mut draft, &sel.path)?,
            Selection::Text(_) => return Ok(()),
        };
        if draft.ops.is_empty() {
            return Ok(());
        }
        self.apply(
            Transaction::new(draft.ops)
                .selection_after(Selection::caret(caret))
                .stored_marks_after(StoredMarksAfter::Clear)
                .source("edit:delete_selection"),
        )
    }

    /// Deletes backwards from a caret. A caret sitting right after a void
    /// leaf selects the leaf instead of removing it, so a second press
    /// confirms the deletion.
    pub fn backspace(&mut self) -> Result<(), ApplyError> {
        match self.selection.clone() {
            Selection::Node(_) => self.delete_selection(),
            Selection::Text(sel) if !sel.is_collapsed() => self.delete_selection(),
            Selection::Text(sel) => self.backspace_at_caret(sel.head),
        }
    }

    fn backspace_at_caret(&mut self, head: Point) -> Result<(), ApplyError> {
        let Some((&child_ix, block_path)) = head.path.split_last().map(|(ix, p)| (ix, p.to_vec()))
        else {
            return Err(ApplyError::InvalidPath("Caret is not in a text node".into()));
        };
        let Some(Node::Text(t)) = node_at_path(&self.doc, &head.path) else {
            return Err(ApplyError::InvalidPath("Caret is not in a text node".into()));
        };

        let end = clamp_to_char_boundary(&t.text, head.offset);
        if end > 0 {
            let start = prev_char_boundary(&t.text, end);
            let tx = Transaction::new(vec![Op::RemoveText {
                path: head.path.clone(),
                range: start..end,
            }])
            .selection_after(Selection::caret(Point::new(head.path, start)))
            .stored_marks_after(StoredMarksAfter::Clear)
            .source("edit:backspace");
            return self.apply(tx);
        }

        // Caret at run start: look left through the block for something to
        // delete or select.
        let children = match node_at_path(&self.doc, &block_path) {
            Some(Node::Element(el)) => el.children.clone(),
            _ => {
                return Err(ApplyError::InvalidPath("Caret is not in a text block".into()));
            }
        };
        for prev_ix in (0..child_ix).rev() {
            match &children[prev_ix] {
                Node::Text(prev) if prev.text.is_empty() => continue,
                Node::Text(prev) => {
                    let end = prev.text.len();
                    let start = prev_char_boundary(&prev.text, end);
                    let mut path = block_path.clone();
                    path.push(prev_ix);
                    let tx = Transaction::new(vec![Op::RemoveText {
                        path: path.clone(),
                        range: start..end,
                    }])
                    .selection_after(Selection::caret(Point::new(path, start)))
                    .stored_marks_after(StoredMarksAfter::Clear)
                    .source("edit:backspace");
                    return self.apply(tx);
                }
                Node::Void(_) => {
                    let mut path = block_path.clone();
                    path.push(prev_ix);
                    self.select_node(path);
                    return Ok(());
                }
                Node::Element(_) => break,
            }
        }

        // Block start: join with the previous block.
        let Some(&block_ix) = block_path.first().filter(|_| block_path.len() == 1) else {
            return Ok(());
        };
        if block_ix == 0 {
            return Ok(());
        }

        let mut draft = EditDraft::new(self.doc.clone(), self.selection.clone());
        let caret = merge_block_with_previous(&mut draft, block_ix)?;
        self.apply(
            Transaction::new(draft.ops)
                .selection_after(Selection::caret(caret))
                .stored_marks_after(StoredMarksAfter::Clear)
                .source("edit:backspace"),
        )
    }

    pub fn split_paragraph(&mut self) -> Result<(), ApplyError> {
        let mut draft = EditDraft::new(self.doc.clone(), self.selection.clone());
        let caret = match self.selection.clone() {
            Selection::Text(sel) => {
                let caret = if sel.is_collapsed() {
                    sel.head
                } else {
                    delete_text_selection(&mut draft, &sel)?
                };
                split_paragraph_at(&mut draft, &caret)?
            }
            Selection::Node(sel) => {
                let Some(&block_ix) = sel.path.first() else {
                    return Err(ApplyError::InvalidPath("Empty selection path".into()));
                };
                draft.push(Op::InsertNode {
                    path: vec![block_ix + 1],
                    node: Node::paragraph(""),
                })?;
                Point::new(vec![block_ix + 1, 0], 0)
            }
        };
        self.apply(
            Transaction::new(draft.ops)
                .selection_after(Selection::caret(caret))
                .stored_marks_after(StoredMarksAfter::Clear)
                .source("edit:split_paragraph"),
        )
    }

    pub fn run_command(
        &mut self,
        id: &str,
        args: Option<serde_json::Value>,
    ) -> Result<(), CommandError> {
        let Some(command) = self.registry.command(id) else {
            return Err(CommandError::new(format!("Unknown command: {id}")));
        };
        (command.handler)(self, args)
    }

    pub fn run_query_json(&self, id: &str, args: Option<Value>) -> Result<Value, QueryError> {
        let Some(query) = self.registry.query(id) else {
            return Err(QueryError::new(format!("Unknown query: {id}")));
        };
        (query.handler)(self, args)
    }

    pub fn run_query<T>(&self, id: &str, args: Option<Value>) -> Result<T, QueryError>
    where
        T: DeserializeOwned,
    {
        let value = self.run_query_json(id, args)?;
        serde_json::from_value(value)
            .map_err(|err| QueryError::new(format!("Failed to decode query result: {err}")))
    }

    fn normalize_in_place(&mut self) {
        let _ = self.normalize_with_inverse_ops();
        self.normalize_selection_in_place();
    }

    fn normalize_selection_in_place(&mut self) {
        self.selection = self
            .registry
            .normalize_selection(&self.doc, &self.selection);
    }

    fn normalize_with_inverse_ops(&mut self) -> Result<Vec<Op>, ApplyError> {
        let mut inverse_ops: Vec<Op> = Vec::new();
        for _ in 0..self.config.max_normalize_iterations {
            let ops = self.registry.normalize(&self.doc);
            if ops.is_empty() {
                return Ok(inverse_ops);
            }
            for op in ops {
                let inv = self.apply_op(op)?;
                inverse_ops.push(inv);
            }
        }
        Err(ApplyError::NormalizeDidNotConverge)
    }

    fn apply_op(&mut self, op: Op) -> Result<Op, ApplyError> {
        apply_op_to(&mut self.doc, &mut self.selection, op)
    }
}

pub(crate) fn apply_op_to(
    doc: &mut Document,
    selection: &mut Selection,
    op: Op,
) -> Result<Op, ApplyError> {
    match op {
        Op::InsertText { path, offset, text } => {
            let text_node = node_text_mut(doc, &path)?;
            let offset = clamp_to_char_boundary(&text_node.text, offset);
            text_node.text.insert_str(offset, &text);
            transform_selection_insert_text(selection, &path, offset, text.len());
            Ok(Op::RemoveText {
                path,
                range: offset..offset + text.len(),
            })
        }
        Op::RemoveText { path, range } => {
            let text_node = node_text_mut(doc, &path)?;
            let start =
                clamp_to_char_boundary(&text_node.text, range.start.min(text_node.text.len()));
            let end = clamp_to_char_boundary(&text_node.text, range.end.min(text_node.text.len()));
            if start >= end {
                return Ok(Op::InsertText {
                    path,
                    offset: start,
                    text: String::new(),
                });
            }
            let removed = text_node.text[start..end].to_string();
            text_node.text.replace_range(start..end, "");
            transform_selection_remove_text(selection, &path, start..end);
            Ok(Op::InsertText {
                path,
                offset: start,
                text: removed,
            })
        }
        Op::InsertNode { path, node } => {
            insert_node(doc, &path, node)?;
            transform_selection_insert_node(selection, &path);
            Ok(Op::RemoveNode { path })
        }
        Op::RemoveNode { path } => {
            let removed = remove_node(doc, &path)?;
            transform_selection_remove_node(selection, &path, &removed, doc);
            Ok(Op::InsertNode {
                path,
                node: removed,
            })
        }
        Op::SetNodeAttrs { path, patch } => {
            let node = node_mut(doc, &path)?;
            let old = match node {
                Node::Element(el) => patch_apply(&mut el.attrs, &patch),
                Node::Void(v) => patch_apply(&mut v.attrs, &patch),
                Node::Text(_) => return Err(ApplyError::InvalidPath("Text has no attrs".into())),
            };
            Ok(Op::SetNodeAttrs { path, patch: old })
        }
        Op::SetTextMarks { path, marks } => {
            let text_node = node_text_mut(doc, &path)?;
            let old = std::mem::replace(&mut text_node.marks, marks);
            Ok(Op::SetTextMarks { path, marks: old })
        }
    }
}

fn transform_selection_insert_text(
    selection: &mut Selection,
    path: &[usize],
    offset: usize,
    len: usize,
) {
    let Selection::Text(sel) = selection else {
        return;
    };
    for point in [&mut sel.anchor, &mut sel.head] {
        if point.path == path && point.offset >= offset {
            point.offset = point.offset.saturating_add(len);
        }
    }
}

fn transform_selection_remove_text(
    selection: &mut Selection,
    path: &[usize],
    range: std::ops::Range<usize>,
) {
    let Selection::Text(sel) = selection else {
        return;
    };
    let removed_len = range.end.saturating_sub(range.start);
    for point in [&mut sel.anchor, &mut sel.head] {
        if point.path != path {
            continue;
        }
        if point.offset <= range.start {
            continue;
        }
        if point.offset >= range.end {
            point.offset = point.offset.saturating_sub(removed_len);
        } else {
            point.offset = range.start;
        }
    }
}

fn shift_path_for_insert(path: &mut Path, parent_path: &[usize], index: usize) {
    if path.len() <= parent_path.len() {
        return;
    }
    if !path.starts_with(parent_path) {
        return;
    }
    let depth = parent_path.len();
    if path[depth] >= index {
        path[depth] += 1;
    }
}

fn transform_selection_insert_node(selection: &mut Selection, path: &[usize]) {
    if path.is_empty() {
        return;
    }
    let (parent_path, index) = path.split_at(path.len() - 1);
    let index = index[0];

    match selection {
        Selection::Text(sel) => {
            for point in [&mut sel.anchor, &mut sel.head] {
                shift_path_for_insert(&mut point.path, parent_path, index);
            }
        }
        Selection::Node(sel) => shift_path_for_insert(&mut sel.path, parent_path, index),
    }
}

fn transform_selection_remove_node(
    selection: &mut Selection,
    path: &[usize],
    removed: &Node,
    doc_after_remove: &Document,
) {
    if path.is_empty() {
        return;
    }
    let (parent_path, index) = path.split_at(path.len() - 1);
    let index = index[0];

    match selection {
        Selection::Node(sel) => {
            if sel.path.len() <= parent_path.len() || !sel.path.starts_with(parent_path) {
                return;
            }
            let depth = parent_path.len();
            let ix = sel.path[depth];
            if ix > index {
                sel.path[depth] = ix - 1;
            } else if ix == index {
                // The selected node went away. Degrade to a caret nearby and
                // let selection normalization settle it on real text.
                let mut p = sel.path.clone();
                p.truncate(depth + 1);
                p[depth] = index.saturating_sub(1);
                *selection = Selection::caret(Point::new(p, 0));
            }
        }
        Selection::Text(sel) => {
            let merge_prefix_len = match (removed, index.checked_sub(1)) {
                (Node::Text(removed_text), Some(left_index)) => {
                    let mut left_path = parent_path.to_vec();
                    left_path.push(left_index);
                    match node_at_path(doc_after_remove, &left_path) {
                        Some(Node::Text(left_text))
                            if left_text.marks == removed_text.marks
                                && left_text.text.ends_with(&removed_text.text) =>
                        {
                            Some(left_text.text.len().saturating_sub(removed_text.text.len()))
                        }
                        _ => None,
                    }
                }
                _ => None,
            };

            for point in [&mut sel.anchor, &mut sel.head] {
                if point.path.len() <= parent_path.len() {
                    continue;
                }
                if !point.path.starts_with(parent_path) {
                    continue;
                }
                let depth = parent_path.len();
                let ix = point.path[depth];
                if ix > index {
                    point.path[depth] = ix - 1;
                    continue;
                }
                if ix < index {
                    continue;
                }

                // Point was inside the removed subtree. Map it to a nearby point.
                if let (Some(prefix), Node::Text(removed_text), Some(left_index)) =
                    (merge_prefix_len, removed, index.checked_sub(1))
                {
                    point.path.truncate(depth + 1);
                    point.path[depth] = left_index;
                    point.offset = (prefix + point.offset).min(prefix + removed_text.text.len());
                } else {
                    point.path.truncate(depth + 1);
                    point.path[depth] = index.saturating_sub(1);
                    point.offset = 0;
                }
            }
        }
    }
}

fn prev_char_boundary(s: &str, mut ix: usize) -> usize {
    ix = ix.min(s.len());
    if ix == 0 {
        return 0;
    }
    ix -= 1;
    while ix > 0 && !s.is_char_boundary(ix) {
        ix -= 1;
    }
    ix
}

/// Scratch document the editing methods build ops against, so a compound
/// edit lands in one transaction with paths that were valid at each step.
struct EditDraft {
    doc: Document,
    selection: Selection,
    ops: Vec<Op>,
}

impl EditDraft {
    fn new(doc: Document, selection: Selection) -> Self {
        Self {
            doc,
            selection,
            ops: Vec::new(),
        }
    }

    fn push(&mut self, op: Op) -> Result<(), ApplyError> {
        apply_op_to(&mut self.doc, &mut self.selection, op.clone())?;
        self.ops.push(op);
        Ok(())
    }

    fn block_children(&self, block_path: &[usize]) -> Result<Vec<Node>, ApplyError> {
        if block_path.is_empty() {
            return Err(ApplyError::InvalidPath("Empty block path".into()));
        }
        match node_at_path(&self.doc, block_path) {
            Some(Node::Element(el)) => Ok(el.children.clone()),
            _ => Err(ApplyError::InvalidPath("Not a text block".into())),
        }
    }
}

enum InlineCut {
    Text { child_ix: usize, range: std::ops::Range<usize> },
    Whole { child_ix: usize },
}

/// Removes `[start_global, end_global)` of a block's inline space: partial
/// text cuts become RemoveText, fully covered leaves are removed outright.
fn delete_inline_range(
    draft: &mut EditDraft,
    block_path: &[usize],
    start_global: usize,
    end_global: usize,
) -> Result<(), ApplyError> {
    if start_global >= end_global {
        return Ok(());
    }

    let children = draft.block_children(block_path)?;
    let mut cuts: Vec<InlineCut> = Vec::new();
    let mut cursor = 0usize;

    for (child_ix, node) in children.iter().enumerate() {
        let (node_start, node_end) = match node {
            Node::Text(t) => {
                let start = cursor;
                cursor += t.text.len();
                (start, cursor)
            }
            Node::Void(v) => {
                let start = cursor;
                cursor += v.inline_text_len();
                (start, cursor)
            }
            Node::Element(_) => continue,
        };

        if end_global <= node_start || start_global >= node_end {
            continue;
        }

        match node {
            Node::Text(t) => {
                let s = start_global.saturating_sub(node_start).min(t.text.len());
                let e = end_global.saturating_sub(node_start).min(t.text.len());
                if s < e {
                    cuts.push(InlineCut::Text {
                        child_ix,
                        range: s..e,
                    });
                }
            }
            Node::Void(_) => {
                if start_global <= node_start && node_end <= end_global {
                    cuts.push(InlineCut::Whole { child_ix });
                }
            }
            Node::Element(_) => {}
        }
    }

    // Right to left so recorded indices stay valid as leaves disappear.
    for cut in cuts.into_iter().rev() {
        match cut {
            InlineCut::Text { child_ix, range } => {
                let mut path = block_path.to_vec();
                path.push(child_ix);
                draft.push(Op::RemoveText { path, range })?;
            }
            InlineCut::Whole { child_ix } => {
                let mut path = block_path.to_vec();
                path.push(child_ix);
                draft.push(Op::RemoveNode { path })?;
            }
        }
    }
    Ok(())
}

fn delete_text_selection(
    draft: &mut EditDraft,
    sel: &TextSelection,
) -> Result<Point, ApplyError> {
    let (start, end) = sel.ordered();
    let Some((&start_ix, start_block)) = start.path.split_last().map(|(ix, p)| (ix, p.to_vec()))
    else {
        return Err(ApplyError::InvalidPath("Selection start has no block".into()));
    };
    let Some((&end_ix, end_block)) = end.path.split_last().map(|(ix, p)| (ix, p.to_vec())) else {
        return Err(ApplyError::InvalidPath("Selection end has no block".into()));
    };

    if start_block == end_block {
        let children = draft.block_children(&start_block)?;
        let start_global = point_global_offset(&children, start_ix, start.offset);
        let end_global = point_global_offset(&children, end_ix, end.offset);
        delete_inline_range(draft, &start_block, start_global, end_global)?;
        let children = draft.block_children(&start_block)?;
        return Ok(point_for_global_offset(&start_block, &children, start_global));
    }

    // Cross-block ranges only occur between sibling top-level blocks here.
    let (&start_block_ix, &end_block_ix) = match (start_block.as_slice(), end_block.as_slice()) {
        ([s], [e]) if s < e => (s, e),
        _ => {
            return Err(ApplyError::InvalidPath(
                "Selection spans incompatible blocks".into(),
            ));
        }
    };

    let start_children = draft.block_children(&start_block)?;
    let start_global = point_global_offset(&start_children, start_ix, start.offset);
    let start_len = total_inline_text_len(&start_children);

    let end_children = draft.block_children(&end_block)?;
    let end_global = point_global_offset(&end_children, end_ix, end.offset);

    delete_inline_range(draft, &end_block, 0, end_global)?;
    delete_inline_range(draft, &start_block, start_global, start_len)?;

    for block_ix in (start_block_ix + 1..end_block_ix).rev() {
        draft.push(Op::RemoveNode {
            path: vec![block_ix],
        })?;
    }

    merge_block_with_previous(draft, start_block_ix + 1)?;

    let children = draft.block_children(&[start_block_ix])?;
    Ok(point_for_global_offset(
        &[start_block_ix],
        &children,
        start_global,
    ))
}

fn delete_node_selection(draft: &mut EditDraft, path: &[usize]) -> Result<Point, ApplyError> {
    let Some((&child_ix, block_path)) = path.split_last().map(|(ix, p)| (ix, p.to_vec())) else {
        return Err(ApplyError::InvalidPath("Empty selection path".into()));
    };
    let children = draft.block_children(&block_path)?;
    if !matches!(children.get(child_ix), Some(Node::Void(_))) {
        return Err(ApplyError::InvalidPath("Selected node is not a leaf".into()));
    }

    let global = point_global_offset(&children, child_ix, 0);
    draft.push(Op::RemoveNode {
        path: path.to_vec(),
    })?;

    let mut children = draft.block_children(&block_path)?;
    if !children.iter().any(|n| matches!(n, Node::Text(_))) {
        let mut text_path = block_path.clone();
        text_path.push(0);
        draft.push(Op::InsertNode {
            path: text_path,
            node: Node::Text(TextNode {
                text: String::new(),
                marks: Marks::default(),
            }),
        })?;
        children = draft.block_children(&block_path)?;
    }

    Ok(point_for_global_offset(&block_path, &children, global))
}

/// Moves every child of block `block_ix` to the end of the block before it
/// and drops the emptied block. Returns a caret at the junction.
fn merge_block_with_previous(draft: &mut EditDraft, block_ix: usize) -> Result<Point, ApplyError> {
    let Some(prev_ix) = block_ix.checked_sub(1) else {
        return Err(ApplyError::InvalidPath("No previous block".into()));
    };

    let prev_children = draft.block_children(&[prev_ix])?;
    let moved = draft.block_children(&[block_ix])?;
    let junction = total_inline_text_len(&prev_children);

    for _ in 0..moved.len() {
        draft.push(Op::RemoveNode {
            path: vec![block_ix, 0],
        })?;
    }
    draft.push(Op::RemoveNode {
        path: vec![block_ix],
    })?;

    let base = prev_children.len();
    for (k, node) in moved.iter().cloned().enumerate() {
        draft.push(Op::InsertNode {
            path: vec![prev_ix, base + k],
            node,
        })?;
    }

    let mut merged = prev_children;
    merged.extend(moved);
    Ok(point_for_global_offset(&[prev_ix], &merged, junction))
}

/// Splits the block at a caret: the text right of the caret and all later
/// inline siblings move into a fresh paragraph after the block.
fn split_paragraph_at(draft: &mut EditDraft, caret: &Point) -> Result<Point, ApplyError> {
    let Some((&child_ix, block_path)) = caret.path.split_last().map(|(ix, p)| (ix, p.to_vec()))
    else {
        return Err(ApplyError::InvalidPath("Caret is not in a text node".into()));
    };
    let Some(&block_ix) = block_path.last() else {
        return Err(ApplyError::InvalidPath("Caret is not in a text block".into()));
    };

    let children = draft.block_children(&block_path)?;
    let Some(Node::Text(t)) = children.get(child_ix) else {
        return Err(ApplyError::InvalidPath("Caret is not in a text node".into()));
    };
    let kind = match node_at_path(&draft.doc, &block_path) {
        Some(Node::Element(el)) => el.kind.clone(),
        _ => return Err(ApplyError::InvalidPath("Caret is not in a text block".into())),
    };

    let cursor = clamp_to_char_boundary(&t.text, caret.offset);
    let right = t.text.get(cursor..).unwrap_or("").to_string();
    let marks = t.marks.clone();
    let tail: Vec<Node> = children.get(child_ix + 1..).unwrap_or(&[]).to_vec();

    if cursor < t.text.len() {
        let mut path = block_path.clone();
        path.push(child_ix);
        draft.push(Op::RemoveText {
            path,
            range: cursor..t.text.len(),
        })?;
    }
    for k in (child_ix + 1..children.len()).rev() {
        let mut path = block_path.clone();
        path.push(k);
        draft.push(Op::RemoveNode { path })?;
    }

    let mut new_children = vec![Node::Text(TextNode { text: right, marks })];
    new_children.extend(tail);

    let mut new_block_path = block_path.clone();
    let last = new_block_path.len() - 1;
    new_block_path[last] = block_ix + 1;
    draft.push(Op::InsertNode {
        path: new_block_path.clone(),
        node: Node::Element(ElementNode {
            kind,
            attrs: Default::default(),
            children: new_children,
        }),
    })?;

    let mut caret_path = new_block_path;
    caret_path.push(0);
    Ok(Point::new(caret_path, 0))
}

/// Inserts `text` at a caret inside a text node. When `marks` differ from
/// the node's, the node is split and a freshly marked run carries the text.
fn insert_plain(
    draft: &mut EditDraft,
    caret: &Point,
    text: &str,
    marks: Option<Marks>,
) -> Result<Point, ApplyError> {
    let Some(Node::Text(t)) = node_at_path(&draft.doc, &caret.path) else {
        return Err(ApplyError::InvalidPath("Caret is not in a text node".into()));
    };
    let cursor = clamp_to_char_boundary(&t.text, caret.offset);

    let marks = match marks {
        Some(m) if m != t.marks => m,
        _ => {
            draft.push(Op::InsertText {
                path: caret.path.clone(),
                offset: cursor,
                text: text.to_string(),
            })?;
            return Ok(Point::new(caret.path.clone(), cursor + text.len()));
        }
    };

    let Some((&child_ix, block_path)) = caret.path.split_last().map(|(ix, p)| (ix, p.to_vec()))
    else {
        return Err(ApplyError::InvalidPath("Caret is not in a text node".into()));
    };

    let node_marks = t.marks.clone();
    let left = t.text.get(..cursor).unwrap_or("").to_string();
    let right = t.text.get(cursor..).unwrap_or("").to_string();

    let mut replacement: Vec<Node> = Vec::new();
    let mut caret_child_ix = child_ix;

    if !left.is_empty() {
        replacement.push(Node::Text(TextNode {
            text: left,
            marks: node_marks.clone(),
        }));
        caret_child_ix += 1;
    }
    replacement.push(Node::Text(TextNode {
        text: text.to_string(),
        marks,
    }));
    if !right.is_empty() {
        replacement.push(Node::Text(TextNode {
            text: right,
            marks: node_marks,
        }));
    }

    draft.push(Op::RemoveNode {
        path: caret.path.clone(),
    })?;
    for (i, node) in replacement.into_iter().enumerate() {
        let mut path = block_path.clone();
        path.push(child_ix + i);
        draft.push(Op::InsertNode { path, node })?;
    }

    let mut caret_path = block_path;
    caret_path.push(caret_child_ix);
    Ok(Point::new(caret_path, text.len()))
}
