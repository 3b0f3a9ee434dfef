// SPDX-License-Identifier: AGPL-3.0

//! Terminal output helpers: verdict coloring and de-duplicated warnings.

use colored::*;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Mutex;

/// Format a passing verdict or other good news.
pub fn color_good(text: &str) -> String {
    text.green().to_string()
}

/// Format a failing verdict, counterexample, or warning.
pub fn color_warn(text: &str) -> String {
    text.red().to_string()
}

static UNIQUE_MESSAGES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn is_logged(message: &str) -> bool {
    let messages = UNIQUE_MESSAGES.lock().unwrap();
    messages.contains(message)
}

fn mark_logged(message: &str) {
    let mut messages = UNIQUE_MESSAGES.lock().unwrap();
    messages.insert(message.to_string());
}

/// Log a warning message to stderr.
pub fn warn(text: &str, allow_duplicate: bool) {
    if allow_duplicate || !is_logged(text) {
        eprintln!("{}", text.yellow());
        if !allow_duplicate {
            mark_logged(text);
        }
    }
}

/// Log a warning once per process.
pub fn warn_unique(text: &str) {
    warn(text, false);
}

/// Log a dimmed debug message to stderr.
pub fn debug(text: &str) {
    eprintln!("{}", text.dimmed());
}

/// Clear the unique-message registry (used by tests).
pub fn clear_logged_messages() {
    let mut messages = UNIQUE_MESSAGES.lock().unwrap();
    messages.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_warnings() {
        clear_logged_messages();

        let msg = "a warning that should appear once";
        assert!(!is_logged(msg));

        warn_unique(msg);
        assert!(is_logged(msg));

        // a second call is a no-op
        warn_unique(msg);
        assert!(is_logged(msg));

        clear_logged_messages();
        assert!(!is_logged(msg));
    }

    #[test]
    fn test_allow_duplicate_is_not_tracked() {
        clear_logged_messages();

        let msg = "a repeatable warning";
        warn(msg, true);
        assert!(!is_logged(msg));
    }

    #[test]
    fn test_colors_wrap_text() {
        // colored may disable escape codes on non-tty; the text itself
        // must survive either way.
        assert!(color_good("[PASS]").contains("[PASS]"));
        assert!(color_warn("[FAIL]").contains("[FAIL]"));
    }
}
