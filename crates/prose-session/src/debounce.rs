use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// What a matured debounce window asks the document to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCommit<T> {
    Set(T),
    /// The input was cleared; remove the attribute entirely.
    Unset,
}

/// Debounced numeric input backing one document attribute.
///
/// `staged` is what the input currently shows, `committed` is what the
/// document holds. Keystrokes stage a value and arm a deadline; the commit
/// happens when the owner polls past the deadline (or flushes on Enter), so a
/// burst of keystrokes lands as a single document mutation.
#[derive(Debug)]
pub struct DebouncedField<T> {
    staged: Option<T>,
    committed: Option<T>,
    deadline: Option<Instant>,
    input_focused: bool,
    window: Duration,
}

impl<T: Clone + PartialEq> DebouncedField<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            staged: None,
            committed: None,
            deadline: None,
            input_focused: false,
            window,
        }
    }

    pub fn staged(&self) -> Option<&T> {
        self.staged.as_ref()
    }

    pub fn committed(&self) -> Option<&T> {
        self.committed.as_ref()
    }

    pub fn has_pending_commit(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn set_input_focused(&mut self, focused: bool) {
        self.input_focused = focused;
    }

    /// Stage a new value from the input and restart the window. `None` means
    /// the input was cleared.
    pub fn on_input(&mut self, value: Option<T>, now: Instant) {
        self.staged = value;
        self.deadline = Some(now + self.window);
    }

    /// Commit the staged value if the window has elapsed. Losing input focus
    /// does not cancel the deadline, so a commit can mature after blur.
    pub fn poll(&mut self, now: Instant) -> Option<FieldCommit<T>> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        self.take_commit()
    }

    /// Commit immediately, regardless of the window. Used for Enter.
    pub fn flush(&mut self) -> Option<FieldCommit<T>> {
        self.deadline = None;
        self.take_commit()
    }

    /// Adopt the document's authoritative value, e.g. after the selection
    /// moved. Suppressed while the input has focus so typing is not clobbered.
    pub fn reflect(&mut self, committed: Option<T>) {
        self.committed = committed;
        if !self.input_focused {
            self.staged = self.committed.clone();
            self.deadline = None;
        }
    }

    /// Drop any pending commit and snap the input back to the document.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.staged = self.committed.clone();
    }

    fn take_commit(&mut self) -> Option<FieldCommit<T>> {
        if self.staged == self.committed {
            return None;
        }
        self.committed = self.staged.clone();
        match &self.committed {
            Some(value) => Some(FieldCommit::Set(value.clone())),
            None => Some(FieldCommit::Unset),
        }
    }
}
