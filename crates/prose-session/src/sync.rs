/// What a controlled session should do with an inbound value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileDecision {
    /// Inbound matches the current content; nothing to do.
    Keep,
    /// The editor has focus; hold the inbound value until focus is lost.
    Defer,
    /// Replace the document wholesale.
    Replace,
}

/// Decide how to reconcile an inbound value against the session's current
/// serialization. Both sides must already be in normalized storage form, so
/// representational differences (attribute order, entity spelling, legacy
/// tags) compare equal and do not force a reload.
pub fn reconcile(current: &str, inbound: &str, has_focus: bool) -> ReconcileDecision {
    if current == inbound {
        return ReconcileDecision::Keep;
    }
    if has_focus {
        return ReconcileDecision::Defer;
    }
    ReconcileDecision::Replace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_values_are_kept_regardless_of_focus() {
        assert_eq!(reconcile("<p>a</p>", "<p>a</p>", false), ReconcileDecision::Keep);
        assert_eq!(reconcile("<p>a</p>", "<p>a</p>", true), ReconcileDecision::Keep);
    }

    #[test]
    fn focus_defers_differing_values() {
        assert_eq!(reconcile("<p>a</p>", "<p>b</p>", true), ReconcileDecision::Defer);
    }

    #[test]
    fn unfocused_differing_values_replace() {
        assert_eq!(reconcile("<p>a</p>", "<p>b</p>", false), ReconcileDecision::Replace);
    }
}
