//! Candidate feed URL generation and feed-content detection.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

/// Suffixes tried under both the home path and the site origin.
const COMMON_FEED_SUFFIXES: &[&str] = &[
    "/feed",
    "/feed/",
    "/rss",
    "/rss/",
    "/rss.xml",
    "/feed.xml",
    "/atom.xml",
    "/all.atom",
    "/index.xml",
];

/// Markers that identify a feed document body.
const FEED_BODY_MARKERS: &[&str] = &["<rss", "<feed", "<rdf:rdf"];

// ---------------------------------------------------------------------------
// Selectors (compiled once)
// ---------------------------------------------------------------------------

static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("link[rel][href]").expect("link selector"));

// ---------------------------------------------------------------------------
// Candidate generation
// ---------------------------------------------------------------------------

/// Feed URLs advertised by `<link rel="alternate">` tags in a home page.
///
/// Only links whose `type` mentions rss, atom or xml are returned, resolved
/// against `home`, in document order.
pub fn feed_links_from_html(home: &Url, html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut links = Vec::new();

    for el in document.select(&LINK_SEL) {
        let rel = el.value().attr("rel").unwrap_or("").to_ascii_lowercase();
        if !rel.split_whitespace().any(|r| r == "alternate") {
            continue;
        }
        let kind = el.value().attr("type").unwrap_or("").to_ascii_lowercase();
        if !["rss", "atom", "xml"].iter().any(|k| kind.contains(k)) {
            continue;
        }
        let Some(href) = el.value().attr("href").map(str::trim) else {
            continue;
        };
        if let Ok(resolved) = home.join(href) {
            links.push(resolved.to_string());
        }
    }

    links
}

/// Well-known feed locations under the home path, then under the origin.
pub fn common_feed_candidates(home: &Url) -> Vec<String> {
    let origin = home.origin().ascii_serialization();
    let home_path = home.path().trim_end_matches('/');

    let mut out = Vec::new();
    if !home_path.is_empty() {
        for suffix in COMMON_FEED_SUFFIXES {
            out.push(format!("{origin}{home_path}{suffix}"));
        }
    }
    for suffix in COMMON_FEED_SUFFIXES {
        out.push(format!("{origin}{suffix}"));
    }
    out
}

/// Whether a response looks like a feed: a feed-ish content type and a feed
/// root element in the body.
pub fn is_feed_content(content_type: &str, body: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    if !["xml", "rss", "atom"].iter().any(|k| content_type.contains(k)) {
        return false;
    }
    let body = body.to_ascii_lowercase();
    FEED_BODY_MARKERS.iter().any(|m| body.contains(m))
}
