//! Process-wide APDU transcript tracing.
//!
//! One atomic flag, checked on every transceive, feeding into the `log`
//! facade rather than stdout so callers keep control over where trace
//! output goes.

use std::sync::atomic::{AtomicBool, Ordering};

static APDU_TRACE: AtomicBool = AtomicBool::new(false);

/// Enable or disable hex logging of every APDU exchanged with a card.
///
/// Purely diagnostic: it must never change protocol behavior.
pub fn set_apdu_trace(enabled: bool) {
    APDU_TRACE.store(enabled, Ordering::Relaxed);
}

/// Whether APDU tracing is currently enabled.
pub fn apdu_trace_enabled() -> bool {
    APDU_TRACE.load(Ordering::Relaxed)
}

/// Log a direction-tagged hex dump if tracing is enabled.
pub(crate) fn trace(direction: &str, bytes: &[u8]) {
    if APDU_TRACE.load(Ordering::Relaxed) {
        log::trace!("{direction} {}", hex::encode(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disabled() {
        assert!(!apdu_trace_enabled());
    }

    #[test]
    fn toggles() {
        set_apdu_trace(true);
        assert!(apdu_trace_enabled());
        set_apdu_trace(false);
        assert!(!apdu_trace_enabled());
    }
}
