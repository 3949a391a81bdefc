//! Purpose: Placeholder grammar and virtual-module id resolution for deferred layers.
//! Exports: `LAYER_MARK_ALL`, `layer_placeholder`, `hash_placeholder`, `strip_hash_placeholders`,
//! `resolve_id`, `resolve_layer`, `get_path`, `is_css_id`, `ModuleRecord`, `EntrySet`.
//! Role: Writers (virtual module `load`) and readers (finalize) share these patterns.
//! Invariants: Placeholders are plain ASCII and survive minification and concatenation verbatim.
//! Invariants: Constructors and patterns change together; a pattern must match its constructor.
//!
//! Grammar, in CSS text as served by the virtual module:
//!
//! ```text
//! #--unocss--{layer:<name>}
//! #--unocss-hash--{content:"<hash>"}
//! ```
//!
//! After the quickapp style compiler has turned that CSS into a style object, the layer marker
//! appears either as an object entry `"#--unocss--": {"layer": "<name>"}` or, for the tuple
//! runtime, as `[[[<n>, "#--unocss--"]], {"layer": "<name>"}]`. Those two shapes are matched
//! by [`crate::finalize::HostAdapter`].
use std::borrow::Cow;
use std::sync::{LazyLock, Mutex, PoisonError};

use regex::Regex;

/// Layer name meaning "every layer, entry layers first".
pub const LAYER_MARK_ALL: &str = "__ALL__";

pub fn layer_placeholder(layer: &str) -> String {
    format!("#--unocss--{{layer:{layer}}}")
}

pub fn hash_placeholder(hash: &str) -> String {
    format!("#--unocss-hash--{{content:\"{hash}\"}}")
}

static HASH_PLACEHOLDER_CSS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\\?")?#--unocss-hash--\s*\{\s*content\s*:\s*\\*"(.+?)\\*";?\s*\}"#)
        .expect("hash placeholder pattern compiles")
});

static HASH_PLACEHOLDER_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r##""#--unocss-hash--"\s*:\s*\{\s*"content"\s*:\s*"(?:\\.|[^"\\])*"\s*\}\s*(?:,\s*)?"##,
    )
    .expect("object hash placeholder pattern compiles")
});

static HASH_PLACEHOLDER_TUPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r##"\[\s*\[\s*\[\s*\d+\s*,\s*"#?--unocss-hash--"\s*\]\s*\]\s*,\s*\{\s*"content"\s*:\s*"(?:\\.|[^"\\])*"\s*\}\s*\]\s*(?:,\s*)?"##,
    )
    .expect("tuple hash placeholder pattern compiles")
});

static VIRTUAL_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:virtual:)?uno(?::(.+))?\.css(\?.*)?$").expect("virtual entry pattern compiles")
});

static RESOLVED_ID_WITH_QUERY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[/\\]__uno(_.*?)?\.css(\?.*)?$").expect("resolved id pattern compiles")
});

static RESOLVED_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[/\\]__uno(?:_(.*?))?\.css$").expect("resolved id pattern compiles")
});

static CSS_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(css|postcss|sass|scss|less|stylus|styl)($|\?)").expect("css id pattern compiles")
});

/// Removes hash markers in every serialized form. Returns the number removed.
pub fn strip_hash_placeholders(code: &str) -> (Cow<'_, str>, usize) {
    let mut count = 0;
    let mut out = Cow::Borrowed(code);
    for pattern in [
        &*HASH_PLACEHOLDER_TUPLE,
        &*HASH_PLACEHOLDER_OBJECT,
        &*HASH_PLACEHOLDER_CSS,
    ] {
        let found = pattern.find_iter(&out).count();
        if found > 0 {
            count += found;
            out = Cow::Owned(pattern.replace_all(&out, "").into_owned());
        }
    }
    (out, count)
}

/// Strips a `?query` suffix.
pub fn get_path(id: &str) -> &str {
    id.split_once('?').map_or(id, |(path, _)| path)
}

pub fn is_css_id(id: &str) -> bool {
    CSS_ID.is_match(id)
}

/// Whether `id` is an already-resolved virtual stylesheet id (query allowed).
pub fn is_resolved_id(id: &str) -> bool {
    RESOLVED_ID_WITH_QUERY.is_match(id)
}

/// Maps `uno.css` / `virtual:uno.css` / `uno:<layer>.css` to `/__uno.css` / `/__uno_<layer>.css`.
/// Already-resolved ids map to themselves; anything else is not a virtual stylesheet.
pub fn resolve_id(id: &str) -> Option<String> {
    if is_resolved_id(id) {
        return Some(id.to_string());
    }
    let caps = VIRTUAL_ENTRY.captures(id)?;
    Some(match caps.get(1) {
        Some(layer) => format!("/__uno_{}.css", layer.as_str()),
        None => "/__uno.css".to_string(),
    })
}

/// Layer requested by a resolved id: `/__uno.css` → `__ALL__`, `/__uno_<x>.css` → `x`.
pub fn resolve_layer(id: &str) -> Option<String> {
    let caps = RESOLVED_ID.captures(id)?;
    Some(
        caps.get(1)
            .map(|layer| layer.as_str())
            .filter(|layer| !layer.is_empty())
            .unwrap_or(LAYER_MARK_ALL)
            .to_string(),
    )
}

/// Layer for any id the bundler asks to load: physical path first, then virtual resolution.
pub fn layer_for_id(id: &str) -> Option<String> {
    resolve_layer(get_path(id)).or_else(|| resolve_id(id).and_then(|entry| resolve_layer(&entry)))
}

/// A module id the bundler asked this pipeline to resolve.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleRecord {
    pub id: String,
    pub layer: Option<String>,
    pub resolved_path: String,
}

impl ModuleRecord {
    pub fn new(id: impl Into<String>, resolved_path: impl Into<String>) -> Self {
        let id = id.into();
        let resolved_path = resolved_path.into();
        let layer = resolve_layer(get_path(&resolved_path));
        Self {
            id,
            layer,
            resolved_path,
        }
    }
}

/// Entry ids in first-seen order.
#[derive(Debug, Default)]
pub struct EntrySet {
    entries: Mutex<Vec<String>>,
}

impl EntrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the entry was new.
    pub fn add(&self, entry: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|existing| existing == entry) {
            return false;
        }
        entries.push(entry.to_string());
        true
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Layers of the registered entries, in entry order.
    pub fn layers(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter_map(|entry| resolve_layer(entry))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
