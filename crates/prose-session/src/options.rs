use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::debounce::DEFAULT_DEBOUNCE_WINDOW;

pub const DEFAULT_UPLOADS_PREFIX: &str = "/uploads/";

/// Host-supplied configuration for a [`ProseSession`](crate::ProseSession).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Origin the stored upload paths resolve against, e.g. `https://cms.local`.
    pub origin: String,
    /// Path prefix identifying own uploads. Only sources under it are
    /// rewritten between storage and display forms.
    pub uploads_prefix: String,
    /// Quiet period before a staged attribute edit is committed.
    pub debounce_window: Duration,
    /// Shown by the host while the document is blank.
    pub placeholder: String,
    /// A disabled session renders but ignores every mutation.
    pub disabled: bool,
    /// Minimum content height in pixels, if the host wants one.
    pub min_height: Option<f32>,
}

impl SessionOptions {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            uploads_prefix: DEFAULT_UPLOADS_PREFIX.to_string(),
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            placeholder: String::new(),
            disabled: false,
            min_height: None,
        }
    }

    pub fn uploads_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.uploads_prefix = prefix.into();
        self
    }

    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    pub fn placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn min_height(mut self, px: f32) -> Self {
        self.min_height = Some(px);
        self
    }
}
