//! Process-wide no-route HTML cell.
//!
//! Holds the body rendered for 404 responses. Replaced atomically by the
//! no-route watcher; readers load the current value per response.

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use std::sync::Arc;

static HTML: Lazy<ArcSwap<String>> = Lazy::new(|| ArcSwap::from_pointee(String::new()));

/// Returns the current no-route HTML. Empty means "no body configured".
pub fn html() -> Arc<String> {
    HTML.load_full()
}

/// Replaces the no-route HTML.
pub fn set_html(html: String) {
    HTML.store(Arc::new(html));
}

