//! Best-effort article extraction from a source's listing page.
//!
//! Used when a source has no usable feed. Candidate links are same-site,
//! article-looking anchors; titles and dates are recovered from the anchor
//! itself or from the smallest enclosing "card" around it. Precision is
//! lower than feed parsing by nature.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use sourcewatch_shared::{FetchConfig, FetchError, Item, Source, compact_text, normalize_url};

use crate::get_body;

/// Path fragments that mark a link as article-like.
const ARTICLE_PATH_HINTS: &[&str] = &["blog", "news", "engineering", "research", "agent", "ai"];

/// Path fragments that mark a link as site chrome.
const IGNORE_LINK_HINTS: &[&str] = &[
    "login", "signup", "sign-up", "sign-in", "privacy", "terms", "careers", "jobs", "contact",
];

/// Call-to-action texts that never make a usable title (exact or prefix).
const GENERIC_LINK_TITLES: &[&str] = &[
    "read more",
    "ask questions about this page",
    "subscribe",
    "learn more",
    "blog posts",
    "featured",
    "next",
    "previous",
];

/// Single-topic labels that are replaced by the URL slug when it is richer.
const GENERIC_SECTION_TITLES: &[&str] = &["open source", "research", "product", "news"];

const STATIC_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".svg", ".gif", ".pdf", ".zip"];

/// Ancestor levels searched for a heading.
const TITLE_SEARCH_DEPTH: usize = 6;

/// Ancestor levels searched for a date.
const DATE_SEARCH_DEPTH: usize = 8;

/// Ancestors with more text than this are not treated as a card.
const MAX_CARD_TEXT: usize = 500;

static ANCHOR_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

static HEADING_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4").expect("heading selector"));

/// Matches `Sep 12, 2025`, `September 12, 2025`, `Sept 12, 2025`.
static DATE_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:Jan(?:uary)?|Feb(?:ruary)?|Mar(?:ch)?|Apr(?:il)?|May|Jun(?:e)?|Jul(?:y)?|Aug(?:ust)?|Sep(?:t(?:ember)?)?|Oct(?:ober)?|Nov(?:ember)?|Dec(?:ember)?)\s+\d{1,2},\s+\d{4}\b",
    )
    .expect("date regex")
});

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

/// Fetches a source's home page and extracts article candidates.
pub struct PageFetcher {
    client: Client,
    config: FetchConfig,
}

impl PageFetcher {
    pub fn new(client: Client, config: FetchConfig) -> Self {
        Self { client, config }
    }

    /// Retrieve `source.home_url` and extract up to `source.max_items` items.
    #[instrument(skip_all, fields(source = %source.id))]
    pub async fn fetch(&self, source: &Source) -> Result<Vec<Item>, FetchError> {
        let body = get_body(
            &self.client,
            source.home_url.as_str(),
            self.config.timeout_secs,
        )
        .await?;
        let html = String::from_utf8_lossy(&body);
        let scan_limit = self.config.html_scan_limit.max(source.max_items);
        let items = extract_page_items(source, &html, scan_limit, Utc::now());
        debug!(url = %source.home_url, items = items.len(), "page extracted");
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

struct Candidate {
    url: String,
    title: String,
    published_at: Option<DateTime<Utc>>,
}

/// Extract article candidates from a listing page.
///
/// Duplicate URLs keep their first position and the longest title. When
/// every candidate carries a date, output is ordered newest first.
pub fn extract_page_items(
    source: &Source,
    html: &str,
    scan_limit: usize,
    collected_at: DateTime<Utc>,
) -> Vec<Item> {
    let doc = Html::parse_document(html);
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut index_by_url: HashMap<String, usize> = HashMap::new();

    for anchor in doc.select(&ANCHOR_SEL).take(scan_limit) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() {
            continue;
        }
        let Ok(resolved) = source.home_url.join(href) else {
            continue;
        };
        let url = normalize_url(resolved.as_str());
        if !likely_article_link(&source.home_url, &url) {
            continue;
        }

        let title = prefer_slug_title(&card_title(anchor), &url);
        if !is_meaningful_title(&title) {
            continue;
        }
        let published_at = card_published_at(anchor);

        match index_by_url.get(&url) {
            Some(&idx) => {
                let existing = &mut candidates[idx];
                if title.len() > existing.title.len() {
                    existing.title = title;
                    if published_at.is_some() {
                        existing.published_at = published_at;
                    }
                }
            }
            None => {
                index_by_url.insert(url.clone(), candidates.len());
                candidates.push(Candidate {
                    url,
                    title,
                    published_at,
                });
            }
        }
    }

    if !candidates.is_empty() && candidates.iter().all(|c| c.published_at.is_some()) {
        // Stable: equal dates keep page order.
        candidates.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    }

    candidates
        .into_iter()
        .take(source.max_items)
        .map(|c| {
            Item::new(
                &source.id,
                &c.url,
                &c.title,
                c.published_at,
                String::new(),
                collected_at,
            )
        })
        .collect()
}

/// Whether `url` looks like an article under the source's site section.
fn likely_article_link(home: &Url, url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let home_host = home.host_str().unwrap_or("").to_ascii_lowercase();
    if parsed.host_str().unwrap_or("").to_ascii_lowercase() != home_host {
        return false;
    }
    if parsed.port_or_known_default() != home.port_or_known_default() {
        return false;
    }

    let root_path = home.path().trim_end_matches('/').to_ascii_lowercase();
    let root_normalized = if root_path.is_empty() { "/" } else { root_path.as_str() };
    let path = parsed.path().to_ascii_lowercase();
    let path_normalized = match path.trim_end_matches('/') {
        "" => "/",
        p => p,
    };

    if path_normalized == "/" || path_normalized == root_normalized {
        return false;
    }
    if IGNORE_LINK_HINTS.iter().any(|hint| path.contains(hint)) {
        return false;
    }
    if path.contains("/category/") || path.contains("/tag/") {
        return false;
    }
    if !root_path.is_empty()
        && ARTICLE_PATH_HINTS.iter().any(|hint| root_path.contains(hint))
        && !path.starts_with(&format!("{root_path}/"))
    {
        return false;
    }
    if !ARTICLE_PATH_HINTS.iter().any(|hint| path.contains(hint)) {
        return false;
    }
    !STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Ancestors of `anchor` that still look like a single card: bounded text
/// and no links to other destinations.
fn card_ancestors<'a>(anchor: ElementRef<'a>, depth: usize) -> Vec<ElementRef<'a>> {
    let own = href_key(anchor);
    let mut cards = Vec::new();
    for parent in anchor.ancestors().filter_map(ElementRef::wrap).take(depth) {
        let foreign_link = parent
            .select(&ANCHOR_SEL)
            .any(|a| href_key(a) != own);
        if foreign_link {
            break;
        }
        cards.push(parent);
    }
    cards
}

/// Href without fragment, for card-boundary comparisons.
fn href_key(anchor: ElementRef<'_>) -> String {
    let href = anchor.value().attr("href").unwrap_or("").trim();
    href.split('#').next().unwrap_or("").to_string()
}

fn element_text(el: ElementRef<'_>) -> String {
    compact_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn card_title(anchor: ElementRef<'_>) -> String {
    let title = clean_anchor_title(&element_text(anchor));
    if is_meaningful_title(&title) {
        return title;
    }
    for attr in ["aria-label", "title"] {
        let value = clean_anchor_title(anchor.value().attr(attr).unwrap_or(""));
        if is_meaningful_title(&value) {
            return value;
        }
    }
    for parent in card_ancestors(anchor, TITLE_SEARCH_DEPTH) {
        for heading in parent.select(&HEADING_SEL) {
            let candidate = clean_anchor_title(&element_text(heading));
            if is_meaningful_title(&candidate) {
                return candidate;
            }
        }
    }
    title
}

fn card_published_at(anchor: ElementRef<'_>) -> Option<DateTime<Utc>> {
    let own = [
        element_text(anchor),
        anchor.value().attr("aria-label").unwrap_or("").to_string(),
        anchor.value().attr("title").unwrap_or("").to_string(),
    ];
    for text in &own {
        if let Some(date) = find_date(text) {
            return Some(date);
        }
    }
    for parent in card_ancestors(anchor, DATE_SEARCH_DEPTH) {
        let text = element_text(parent);
        if text.is_empty() || text.len() > MAX_CARD_TEXT {
            continue;
        }
        if let Some(date) = find_date(&text) {
            return Some(date);
        }
    }
    None
}

/// First human-readable date in `text`, as midnight UTC.
fn find_date(text: &str) -> Option<DateTime<Utc>> {
    let found = DATE_TEXT_RE.find(text)?;
    parse_human_date(found.as_str())
}

fn parse_human_date(raw: &str) -> Option<DateTime<Utc>> {
    let mut value = compact_text(raw);
    if value.to_ascii_lowercase().starts_with("sept ") {
        value = format!("Sep {}", &value[5..]);
    }
    NaiveDate::parse_from_str(&value, "%B %d, %Y")
        .or_else(|_| NaiveDate::parse_from_str(&value, "%b %d, %Y"))
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Strip "Read " / "Learn more " call-to-action prefixes.
fn clean_anchor_title(raw: &str) -> String {
    let mut candidate = compact_text(raw);
    let lowered = candidate.to_ascii_lowercase();
    if lowered.starts_with("learn more ") {
        candidate = candidate[11..].trim().to_string();
    } else if lowered.starts_with("read ") {
        candidate = candidate[5..].trim().to_string();
    }
    candidate
}

fn slug_title(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return String::new();
    };
    let slug = parsed
        .path()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .replace(['-', '_'], " ");
    let words: Vec<String> = slug
        .split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    words.join(" ")
}

/// Replace thin anchor titles with a richer title derived from the URL slug.
fn prefer_slug_title(title: &str, url: &str) -> String {
    let normalized = clean_anchor_title(title);
    let slug = slug_title(url);
    let slug_words = slug.split_whitespace().count();
    if GENERIC_SECTION_TITLES.contains(&normalized.to_ascii_lowercase().as_str()) && slug_words >= 3
    {
        return slug;
    }
    if normalized.split_whitespace().count() <= 2 && slug_words >= 4 {
        return slug;
    }
    normalized
}

fn is_meaningful_title(title: &str) -> bool {
    let normalized = compact_text(title);
    if normalized.chars().count() < 8 {
        return false;
    }
    let lowered = normalized.to_lowercase();
    !GENERIC_LINK_TITLES
        .iter()
        .any(|generic| lowered.starts_with(generic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, source};
    use chrono::TimeZone;
    use sourcewatch_shared::FetchStrategy;

    fn listing_source() -> Source {
        source(
            "example-blog",
            "https://example.com/blog",
            None,
            FetchStrategy::FallbackOnly,
        )
    }

    #[test]
    fn extracts_cards_from_listing_fixture() {
        let items = extract_page_items(
            &listing_source(),
            &fixture("html/blog_listing.html"),
            500,
            Utc::now(),
        );

        let titles: Vec<&str> = items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "Introducing tool use for everyone",
                "Building reliable agent pipelines",
                "A Deep Dive Into Token Budgets",
            ]
        );

        // Query string is dropped, date comes from the card.
        assert_eq!(items[1].url, "https://example.com/blog/reliable-agent-pipelines");
        assert_eq!(
            items[1].published_at,
            Some(Utc.with_ymd_and_hms(2025, 9, 12, 0, 0, 0).unwrap())
        );
        // "Sept" is accepted.
        assert_eq!(
            items[0].published_at,
            Some(Utc.with_ymd_and_hms(2025, 9, 30, 0, 0, 0).unwrap())
        );
        assert!(items.iter().all(|i| i.raw_summary.is_empty()));
    }

    #[test]
    fn undated_listing_keeps_page_order() {
        let html = r#"<html><body>
            <div><a href="/blog/zeta-agent-launch">Zeta agent launch notes</a></div>
            <div><a href="/blog/alpha-agent-launch">Alpha agent launch notes</a><p>Jan 2, 2024</p></div>
        </body></html>"#;
        let items = extract_page_items(&listing_source(), html, 500, Utc::now());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Zeta agent launch notes");
        assert!(items[0].published_at.is_none());
        assert!(items[1].published_at.is_some());
    }

    #[test]
    fn max_items_and_scan_limit() {
        let html = fixture("html/blog_listing.html");
        let mut src = listing_source();
        src.max_items = 1;
        assert_eq!(extract_page_items(&src, &html, 500, Utc::now()).len(), 1);

        // The first four anchors are navigation only.
        let src = listing_source();
        assert!(extract_page_items(&src, &html, 4, Utc::now()).is_empty());
    }

    #[test]
    fn article_link_rules() {
        let home = Url::parse("https://example.com/blog").unwrap();
        assert!(likely_article_link(&home, "https://example.com/blog/new-model"));
        assert!(!likely_article_link(&home, "https://example.com/blog"));
        assert!(!likely_article_link(&home, "https://example.com/"));
        assert!(!likely_article_link(&home, "https://example.com/news/other-section"));
        assert!(!likely_article_link(&home, "https://example.com/blog/tag/agents"));
        assert!(!likely_article_link(&home, "https://example.com/blog/jobs-at-example"));
        assert!(!likely_article_link(&home, "https://example.com/blog/chart.svg"));
        assert!(!likely_article_link(&home, "https://cdn.example.com/blog/post"));
        assert!(!likely_article_link(&home, "mailto:team@example.com"));

        let root = Url::parse("https://example.com/").unwrap();
        assert!(likely_article_link(&root, "https://example.com/research/paper-one"));
        assert!(!likely_article_link(&root, "https://example.com/pricing"));
    }

    #[test]
    fn title_helpers() {
        assert_eq!(clean_anchor_title("Read  The launch post"), "The launch post");
        assert_eq!(clean_anchor_title("Learn more about agents"), "about agents");
        assert!(!is_meaningful_title("Short"));
        assert!(!is_meaningful_title("Read more about it"));
        assert!(!is_meaningful_title("Next page of posts"));
        assert!(is_meaningful_title("Agents in production"));

        assert_eq!(
            prefer_slug_title("Research", "https://e.com/blog/new-sparse-models"),
            "New Sparse Models"
        );
        assert_eq!(
            prefer_slug_title("Launch", "https://e.com/blog/our-biggest-launch-yet"),
            "Our Biggest Launch Yet"
        );
        assert_eq!(
            prefer_slug_title("A clear descriptive title", "https://e.com/blog/x-y-z-w"),
            "A clear descriptive title"
        );
    }

    #[test]
    fn human_dates() {
        assert_eq!(
            find_date("Posted on Sept 3, 2025 by the team"),
            Some(Utc.with_ymd_and_hms(2025, 9, 3, 0, 0, 0).unwrap())
        );
        assert_eq!(
            find_date("december 24, 2024"),
            Some(Utc.with_ymd_and_hms(2024, 12, 24, 0, 0, 0).unwrap())
        );
        assert_eq!(find_date("2024-12-24"), None);
    }

    #[tokio::test]
    async fn fetch_error_status_is_failure_not_empty() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blog"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let src = source(
            "s",
            &format!("{}/blog", server.uri()),
            None,
            FetchStrategy::FallbackOnly,
        );
        let fetcher = PageFetcher::new(
            crate::build_client(&FetchConfig::default()).unwrap(),
            FetchConfig::default(),
        );
        let err = fetcher.fetch(&src).await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 502, .. }));
    }
}
