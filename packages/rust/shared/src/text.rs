//! Canonical text and URL helpers shared by fetchers and the dedup layer.
//!
//! Item identity depends on these functions, so their output must stay
//! stable across releases: changing them re-ingests every known item.

use sha2::{Digest, Sha256};
use url::Url;

/// Collapse every run of whitespace into a single space and trim the ends.
pub fn compact_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical form of an item URL: query and fragment removed, empty path as `/`.
///
/// Strings that do not parse as absolute URLs are returned trimmed.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            if url.path().is_empty() {
                url.set_path("/");
            }
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}

/// Lowercased host of a URL string, if it has one.
pub fn host_of(raw: &str) -> Option<String> {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Deterministic item identifier.
///
/// SHA-256 (lowercase hex) over `source_id|normalized_url|compacted_title`.
pub fn stable_item_uid(source_id: &str, url: &str, title: &str) -> String {
    let payload = format!(
        "{}|{}|{}",
        source_id,
        normalize_url(url),
        compact_text(title)
    );
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}
