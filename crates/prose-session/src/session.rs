use std::time::Instant;

use kurso_prose_core::{
    ApplyError, CommandError, Editor, ExtensionRegistry, Marks, Path, Point, QueryError,
    Selection, parse, serialize,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;

use crate::debounce::{DebouncedField, FieldCommit};
use crate::options::SessionOptions;
use crate::sync::{ReconcileDecision, reconcile};
use crate::url_rewrite::{OriginError, UrlRewriter};

/// Handle for one in-flight image upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UploadId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("image upload failed: {0}")]
pub struct UploadError(pub String);

type ChangeHandler = Box<dyn FnMut(&str)>;

/// A controlled editing session over one rich text value.
///
/// The host owns the value: edits flow out through `on_change` as normalized
/// storage HTML, and the host feeds values back in with [`set_value`]. The
/// session keeps the two directions from fighting each other: values equal to
/// the current content are ignored, and differing values are deferred while
/// the editor has focus so they cannot clobber in-progress typing.
///
/// [`set_value`]: ProseSession::set_value
pub struct ProseSession {
    editor: Editor,
    rewriter: UrlRewriter,
    options: SessionOptions,
    has_focus: bool,
    /// Latest inbound value deferred while focused, in storage form.
    pending_value: Option<String>,
    last_emitted: String,
    on_change: Option<ChangeHandler>,
    font_size: DebouncedField<u32>,
    image_width: DebouncedField<u64>,
    pending_uploads: Vec<UploadId>,
    next_upload_id: u64,
}

impl ProseSession {
    pub fn new(value: &str, options: SessionOptions) -> Result<Self, OriginError> {
        let rewriter = UrlRewriter::new(&options.origin, options.uploads_prefix.clone())?;
        let registry = ExtensionRegistry::cms_profile();
        let mut doc = parse(value, &registry);
        rewriter.rewrite_for_display(&mut doc);
        let selection = Selection::caret(Point::new(vec![0, 0], 0));
        let editor = Editor::new(doc, selection, registry);

        let mut session = Self {
            editor,
            rewriter,
            has_focus: false,
            pending_value: None,
            last_emitted: String::new(),
            on_change: None,
            font_size: DebouncedField::new(options.debounce_window),
            image_width: DebouncedField::new(options.debounce_window),
            pending_uploads: Vec::new(),
            next_upload_id: 0,
            options,
        };
        session.last_emitted = session.serialized_value();
        session.refresh_attribute_inputs();
        Ok(session)
    }

    pub fn on_change(mut self, handler: impl FnMut(&str) + 'static) -> Self {
        self.on_change = Some(Box::new(handler));
        self
    }

    pub fn editor(&self) -> &Editor {
        &self.editor
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Current content in normalized storage form.
    pub fn value(&self) -> String {
        self.serialized_value()
    }

    pub fn plain_text(&self) -> String {
        self.editor.doc().to_plain_text()
    }

    pub fn is_empty(&self) -> bool {
        self.editor.doc().is_blank()
    }

    pub fn show_placeholder(&self) -> bool {
        self.is_empty() && !self.has_focus
    }

    pub fn is_disabled(&self) -> bool {
        self.options.disabled
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        if self.options.disabled == disabled {
            return;
        }
        self.options.disabled = disabled;
        if disabled {
            self.has_focus = false;
            self.font_size.cancel();
            self.image_width.cancel();
        }
    }

    // ---- Controlled value flow ----------------------------------------

    /// Reconcile an inbound value from the host. Equal values are ignored so
    /// echoes of our own emissions never reload the document; differing
    /// values are deferred while the editor has focus and applied on blur.
    pub fn set_value(&mut self, value: &str) {
        let inbound = self.normalize_inbound(value);
        match reconcile(&self.serialized_value(), &inbound, self.has_focus) {
            ReconcileDecision::Keep => {
                // A stale deferred value must not be applied later.
                self.pending_value = None;
            }
            ReconcileDecision::Defer => {
                self.pending_value = Some(inbound);
            }
            ReconcileDecision::Replace => self.load_value(&inbound),
        }
    }

    pub fn has_focus(&self) -> bool {
        self.has_focus
    }

    pub fn focus(&mut self) {
        if self.options.disabled {
            return;
        }
        self.has_focus = true;
    }

    /// Drop focus and apply any inbound value deferred while typing.
    pub fn blur(&mut self) {
        self.has_focus = false;
        if let Some(pending) = self.pending_value.take() {
            if pending != self.serialized_value() {
                self.load_value(&pending);
            }
        }
    }

    // ---- Editing entry points -----------------------------------------

    pub fn insert_text(&mut self, text: &str) -> Result<(), ApplyError> {
        if self.options.disabled {
            return Ok(());
        }
        self.editor.insert_text(text)?;
        self.after_edit();
        Ok(())
    }

    pub fn delete_selection(&mut self) -> Result<(), ApplyError> {
        if self.options.disabled {
            return Ok(());
        }
        self.editor.delete_selection()?;
        self.after_edit();
        Ok(())
    }

    pub fn backspace(&mut self) -> Result<(), ApplyError> {
        if self.options.disabled {
            return Ok(());
        }
        self.editor.backspace()?;
        self.after_edit();
        Ok(())
    }

    pub fn split_paragraph(&mut self) -> Result<(), ApplyError> {
        if self.options.disabled {
            return Ok(());
        }
        self.editor.split_paragraph()?;
        self.after_edit();
        Ok(())
    }

    pub fn undo(&mut self) -> bool {
        if self.options.disabled || !self.editor.undo() {
            return false;
        }
        self.after_edit();
        true
    }

    pub fn redo(&mut self) -> bool {
        if self.options.disabled || !self.editor.redo() {
            return false;
        }
        self.after_edit();
        true
    }

    pub fn set_selection(&mut self, selection: Selection) {
        self.editor.set_selection(selection);
        self.refresh_attribute_inputs();
    }

    pub fn select_node(&mut self, path: Path) {
        self.editor.select_node(path);
        self.refresh_attribute_inputs();
    }

    pub fn run_command(&mut self, id: &str, args: Option<Value>) -> Result<(), CommandError> {
        if self.options.disabled {
            return Ok(());
        }
        self.editor.run_command(id, args)?;
        self.after_edit();
        Ok(())
    }

    pub fn run_query<T>(&self, id: &str, args: Option<Value>) -> Result<T, QueryError>
    where
        T: DeserializeOwned,
    {
        self.editor.run_query(id, args)
    }

    pub fn run_query_json(&self, id: &str, args: Option<Value>) -> Result<Value, QueryError> {
        self.editor.run_query_json(id, args)
    }

    // ---- Debounced attribute inputs -----------------------------------

    pub fn staged_font_size(&self) -> Option<u32> {
        self.font_size.staged().copied()
    }

    pub fn staged_image_width(&self) -> Option<u64> {
        self.image_width.staged().copied()
    }

    pub fn font_size_input(&mut self, pt: Option<u32>, now: Instant) {
        if self.options.disabled {
            return;
        }
        self.font_size.on_input(pt, now);
    }

    pub fn image_width_input(&mut self, px: Option<u64>, now: Instant) {
        if self.options.disabled {
            return;
        }
        self.image_width.on_input(px, now);
    }

    pub fn font_size_input_focused(&mut self, focused: bool) {
        self.font_size.set_input_focused(focused);
    }

    pub fn image_width_input_focused(&mut self, focused: bool) {
        self.image_width.set_input_focused(focused);
    }

    /// Advance the debounce clocks, committing any staged attribute edit
    /// whose quiet period has elapsed. Timer-driven commits leave focus and
    /// selection where they are.
    pub fn tick(&mut self, now: Instant) {
        if let Some(commit) = self.font_size.poll(now) {
            self.apply_font_size_commit(commit);
        }
        if let Some(commit) = self.image_width.poll(now) {
            self.apply_image_width_commit(commit);
        }
    }

    /// Commit the staged font size immediately (Enter in the input) and hand
    /// focus back to the document.
    pub fn commit_font_size(&mut self) {
        if self.options.disabled {
            return;
        }
        if let Some(commit) = self.font_size.flush() {
            self.apply_font_size_commit(commit);
        }
        self.has_focus = true;
    }

    /// Commit the staged image width immediately (Enter in the input) and
    /// hand focus back to the document.
    pub fn commit_image_width(&mut self) {
        if self.options.disabled {
            return;
        }
        if let Some(commit) = self.image_width.flush() {
            self.apply_image_width_commit(commit);
        }
        self.has_focus = true;
    }

    // ---- Image uploads ------------------------------------------------

    pub fn begin_image_upload(&mut self) -> UploadId {
        let id = UploadId(self.next_upload_id);
        self.next_upload_id += 1;
        self.pending_uploads.push(id);
        id
    }

    pub fn is_uploading(&self) -> bool {
        !self.pending_uploads.is_empty()
    }

    /// Resolve an upload begun with [`begin_image_upload`]. On success the
    /// image is inserted at the current cursor; on failure the loading
    /// indicator is cleared, nothing is mutated, and the error is returned.
    ///
    /// [`begin_image_upload`]: ProseSession::begin_image_upload
    pub fn finish_image_upload(
        &mut self,
        id: UploadId,
        result: Result<String, UploadError>,
    ) -> Result<(), UploadError> {
        let Some(ix) = self.pending_uploads.iter().position(|p| *p == id) else {
            log::warn!("ignoring resolution of unknown upload {id:?}");
            return result.map(|_| ());
        };
        self.pending_uploads.swap_remove(ix);
        let url = result?;
        if self.options.disabled {
            return Ok(());
        }

        // An image selected at resolution time would reject the insert; put
        // the caret right after it instead.
        if let Some(node_sel) = self.editor.selection().as_node() {
            let mut path = node_sel.path.clone();
            if let Some(last) = path.last_mut() {
                *last += 1;
            }
            self.editor.set_selection(Selection::caret(Point::new(path, 0)));
        }

        let src = self.rewriter.to_display(&url);
        match self
            .editor
            .run_command("image.insert", Some(json!({ "src": src })))
        {
            Ok(()) => {
                self.after_edit();
                Ok(())
            }
            Err(err) => Err(UploadError(err.message().to_string())),
        }
    }

    // ---- Internals ----------------------------------------------------

    fn serialized_value(&self) -> String {
        let mut doc = self.editor.doc().clone();
        self.rewriter.rewrite_for_storage(&mut doc);
        serialize(&doc, self.editor.registry())
    }

    /// Bring an inbound value onto the same canonical storage form the
    /// session emits, so comparison is semantic rather than textual.
    fn normalize_inbound(&self, value: &str) -> String {
        let mut doc = parse(value, self.editor.registry());
        self.rewriter.rewrite_for_storage(&mut doc);
        serialize(&doc, self.editor.registry())
    }

    /// Replace the document wholesale with a storage-form value. Resets
    /// history and pending attribute edits, and does not emit.
    fn load_value(&mut self, storage_html: &str) {
        let mut doc = parse(storage_html, self.editor.registry());
        self.rewriter.rewrite_for_display(&mut doc);
        self.editor.replace_document(doc);
        self.pending_value = None;
        self.font_size.cancel();
        self.image_width.cancel();
        self.last_emitted = self.serialized_value();
        self.refresh_attribute_inputs();
    }

    fn after_edit(&mut self) {
        self.emit_change();
        self.refresh_attribute_inputs();
    }

    fn emit_change(&mut self) {
        let value = self.serialized_value();
        if value == self.last_emitted {
            return;
        }
        self.last_emitted = value;
        if let Some(handler) = self.on_change.as_mut() {
            handler(&self.last_emitted);
        }
    }

    fn apply_font_size_commit(&mut self, commit: FieldCommit<u32>) {
        let result = match commit {
            FieldCommit::Set(pt) => self
                .editor
                .run_command("marks.set_font_size", Some(json!({ "pt": pt }))),
            FieldCommit::Unset => self.editor.run_command("marks.unset_font_size", None),
        };
        match result {
            Ok(()) => self.after_edit(),
            Err(err) => log::warn!("font size commit failed: {}", err.message()),
        }
    }

    fn apply_image_width_commit(&mut self, commit: FieldCommit<u64>) {
        let args = match commit {
            FieldCommit::Set(px) => json!({ "px": px }),
            FieldCommit::Unset => json!({ "px": null }),
        };
        match self.editor.run_command("image.set_width", Some(args)) {
            Ok(()) => self.after_edit(),
            Err(err) => log::warn!("image width commit failed: {}", err.message()),
        }
    }

    /// Mirror the document's current attribute values into the inputs.
    fn refresh_attribute_inputs(&mut self) {
        let font_size = self
            .editor
            .run_query::<Marks>("marks.active", None)
            .ok()
            .and_then(|marks| marks.font_size);
        self.font_size.reflect(font_size);

        let width = self
            .editor
            .run_query_json("image.attrs", None)
            .ok()
            .and_then(|attrs| attrs.get("width").and_then(|v| v.as_u64()));
        self.image_width.reflect(width);
    }
}
