//! Page script extraction
//!
//! Walks `<script>` elements in document order. Inline code wins over a
//! `src` reference on the same element; `src` URLs matching the ad/tracker
//! blocklist are skipped.

use crate::arena::DomArena;
use crate::error::Result;
use crate::types::NodeId;
use crate::utils::get_text_content;

/// Substrings of script URLs that are never loaded
pub const BLOCKED_SOURCES: &[&str] = &[
    "adsense",
    "adsystem",
    "adservice",
    "googletagservice",
    "googletagmanager",
    "script.ioam.de",
    "googlesyndication",
    "adserver",
    "nativeads",
    "prebid",
    ".ads.",
    "google-analytics.com",
];

const JS_MEDIA_TYPES: &[&str] = &[
    "application/javascript",
    "application/ecmascript",
    "text/javascript",
    "text/ecmascript",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageScript {
    Inline(String),
    External(String),
}

pub fn is_blocked(src: &str) -> bool {
    BLOCKED_SOURCES.iter().any(|pattern| src.contains(pattern))
}

/// Empty or missing `type` means JavaScript; media-type parameters are ignored
pub fn is_js_type(type_attr: Option<&str>) -> bool {
    let Some(value) = type_attr else {
        return true;
    };
    let media_type = value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    media_type.is_empty() || JS_MEDIA_TYPES.contains(&media_type.as_str())
}

/// Scripts under `scope`, in document order
pub fn collect_scripts(arena: &DomArena, scope: NodeId) -> Result<Vec<PageScript>> {
    let mut scripts = Vec::new();

    for id in arena.find_by_tag(scope, "script")? {
        let node = arena.get(id)?;
        if !is_js_type(node.attr("type")) {
            continue;
        }

        let code = get_text_content(arena, id)?;
        if !code.trim().is_empty() {
            scripts.push(PageScript::Inline(code));
            continue;
        }

        if let Some(src) = node.attr("src").map(str::trim) {
            if !src.is_empty() && !is_blocked(src) {
                scripts.push(PageScript::External(src.to_string()));
            }
        }
    }

    Ok(scripts)
}
