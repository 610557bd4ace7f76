//! RSS/Atom feed retrieval and normalization.
//!
//! A well-formed feed with no usable entries is a successful, empty fetch.
//! Entries without a title or a link are dropped silently, and entries that
//! point off-site are discarded so aggregator feeds cannot inject foreign items.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use reqwest::Client;
use scraper::Html;
use tracing::{debug, instrument};

use sourcewatch_shared::{FetchConfig, FetchError, Item, Source, compact_text, host_of, normalize_url};

use crate::get_body;

/// Fetches and normalizes a source's structured feed.
pub struct FeedFetcher {
    client: Client,
    config: FetchConfig,
}

impl FeedFetcher {
    pub fn new(client: Client, config: FetchConfig) -> Self {
        Self { client, config }
    }

    /// Retrieve `source.feed_url` and return its items in feed order.
    pub async fn fetch(&self, source: &Source) -> Result<Vec<Item>, FetchError> {
        let feed_url = source
            .feed_url
            .as_ref()
            .ok_or_else(|| FetchError::MissingFeedUrl(source.id.clone()))?;
        self.fetch_url(source, feed_url.as_str()).await
    }

    /// Retrieve a feed at `feed_url` on behalf of `source`, e.g. one found by
    /// discovery rather than configured.
    #[instrument(skip_all, fields(source = %source.id, %feed_url))]
    pub async fn fetch_url(&self, source: &Source, feed_url: &str) -> Result<Vec<Item>, FetchError> {
        let body = get_body(&self.client, feed_url, self.config.timeout_secs).await?;
        let items = parse_feed(source, &body, Utc::now())?;
        debug!(items = items.len(), "feed parsed");
        Ok(items)
    }
}

/// Parse a raw feed document into items for `source`.
///
/// Items are capped at `source.max_items` after filtering.
pub fn parse_feed(
    source: &Source,
    body: &[u8],
    collected_at: DateTime<Utc>,
) -> Result<Vec<Item>, FetchError> {
    let feed = feed_rs::parser::parse(Cursor::new(body))
        .map_err(|e| FetchError::Parse(format!("{}: {e}", source.id)))?;

    let site = site_host(source);
    let mut items = Vec::new();

    for entry in feed.entries {
        let title = entry
            .title
            .as_ref()
            .map(|t| compact_text(&t.content))
            .unwrap_or_default();
        let link = select_entry_link(&entry);
        if title.is_empty() || link.is_empty() {
            continue;
        }

        if let (Some(site), Some(link_host)) = (site.as_deref(), host_of(&link)) {
            if !link_host.contains(site) {
                debug!(%link, "dropping off-site feed entry");
                continue;
            }
        }

        let summary = entry
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
            .map(|raw| strip_markup(&raw))
            .unwrap_or_default();

        items.push(Item::new(
            &source.id,
            &normalize_url(&link),
            &title,
            entry.published.or(entry.updated),
            summary,
            collected_at,
        ));

        if items.len() >= source.max_items {
            break;
        }
    }

    Ok(items)
}

/// Host used for the same-site check, without a leading `www.`.
fn site_host(source: &Source) -> Option<String> {
    source
        .home_url
        .host_str()
        .map(|h| h.to_ascii_lowercase().trim_start_matches("www.").to_string())
}

/// Prefer an alternate link, then any link, then an absolute entry id.
fn select_entry_link(entry: &feed_rs::model::Entry) -> String {
    for link in &entry.links {
        let href = link.href.trim();
        if href.is_empty() {
            continue;
        }
        let rel = link.rel.as_deref().unwrap_or("");
        if rel.is_empty() || rel.eq_ignore_ascii_case("alternate") {
            return href.to_string();
        }
    }
    if let Some(link) = entry.links.iter().find(|l| !l.href.trim().is_empty()) {
        return link.href.trim().to_string();
    }
    let id = entry.id.trim();
    if id.starts_with("http://") || id.starts_with("https://") {
        return id.to_string();
    }
    String::new()
}

/// Reduce an HTML fragment to compacted plain text.
fn strip_markup(raw: &str) -> String {
    let fragment = Html::parse_fragment(raw);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    compact_text(&text)
}
