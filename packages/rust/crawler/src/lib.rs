//! Source fetching: structured feeds first, page extraction as fallback.
//!
//! This crate provides:
//! - [`feed`]: RSS/Atom retrieval and normalization
//! - [`page`]: heuristic article extraction from a listing page
//! - [`SourceFetcher`]: the seam the orchestrator fetches through
//! - [`HttpSourceFetcher`]: strategy dispatch over the two fetchers, with
//!   feed discovery when a configured feed is missing or broken

pub mod feed;
pub mod page;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use sourcewatch_discovery::{DiscoveryOptions, DiscoveryResult, discover_feed};
use sourcewatch_shared::{
    FetchConfig, FetchError, FetchStrategy, Item, ItemVia, Result, Source, SourcewatchError,
    normalize_url,
};

pub use feed::{FeedFetcher, parse_feed};
pub use page::{PageFetcher, extract_page_items};

/// User-Agent string for all outbound requests.
pub const USER_AGENT: &str = concat!("sourcewatch/", env!("CARGO_PKG_VERSION"));

/// Maximum redirects followed per request.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// Harvest
// ---------------------------------------------------------------------------

/// Items from one successful source attempt, tagged by extraction path.
#[derive(Debug, Clone)]
pub enum Harvest {
    /// Items came from a structured feed. `discovered` is set when the feed
    /// was found by probing rather than configured.
    Feed {
        feed_url: String,
        items: Vec<Item>,
        discovered: bool,
    },
    /// Items came from page extraction. `feed_error` is set when the page
    /// was used because the feed attempt failed.
    Page {
        items: Vec<Item>,
        feed_error: Option<FetchError>,
    },
}

impl Harvest {
    pub fn items(&self) -> &[Item] {
        match self {
            Self::Feed { items, .. } | Self::Page { items, .. } => items,
        }
    }

    pub fn into_items(self) -> Vec<Item> {
        match self {
            Self::Feed { items, .. } | Self::Page { items, .. } => items,
        }
    }

    /// Feed URL found by discovery during this attempt, if any.
    pub fn discovered_feed(&self) -> Option<&str> {
        match self {
            Self::Feed {
                feed_url,
                discovered: true,
                ..
            } => Some(feed_url.as_str()),
            _ => None,
        }
    }

    pub fn via(&self) -> ItemVia {
        match self {
            Self::Feed { .. } => ItemVia::Feed,
            Self::Page { .. } => ItemVia::Page,
        }
    }
}

// ---------------------------------------------------------------------------
// SourceFetcher
// ---------------------------------------------------------------------------

/// Fetch the current items of one source.
///
/// Implementations must not touch dedup or health state, and must map every
/// failure into a [`FetchError`] rather than panicking.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &Source) -> std::result::Result<Harvest, FetchError>;
}

/// Network-backed fetcher that applies each source's [`FetchStrategy`].
pub struct HttpSourceFetcher {
    client: Client,
    feed: FeedFetcher,
    page: PageFetcher,
    discovery: DiscoveryOptions,
}

impl HttpSourceFetcher {
    /// Create a fetcher sharing one HTTP client between feed, discovery and
    /// page paths.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = build_client(&config)?;
        let discovery = DiscoveryOptions {
            timeout_secs: config.timeout_secs,
            probe_limit: config.feed_probe_limit,
        };
        Ok(Self {
            feed: FeedFetcher::new(client.clone(), config.clone()),
            page: PageFetcher::new(client.clone(), config),
            client,
            discovery,
        })
    }

    /// Configured feed, then a discovered feed when the configured one is
    /// missing or broken, then page extraction. All within one attempt.
    async fn feed_then_fallback(
        &self,
        source: &Source,
    ) -> std::result::Result<Harvest, FetchError> {
        let mut feed_error = None;

        if let Some(feed_url) = source.feed_url.as_ref() {
            match self.feed.fetch(source).await {
                Ok(items) if !items.is_empty() => {
                    return Ok(Harvest::Feed {
                        feed_url: feed_url.to_string(),
                        items,
                        discovered: false,
                    });
                }
                Ok(empty) => {
                    info!(%feed_url, "feed is empty, trying page extraction");
                    return Ok(self.page_after_empty_feed(source, feed_url.to_string(), false, empty).await);
                }
                Err(e) => {
                    warn!(%feed_url, error = %e, "feed failed, looking for another feed");
                    feed_error = Some(e);
                }
            }
        } else {
            debug!("no feed configured, looking for one");
        }

        if let Some(found) = self.discover(source).await {
            match self.feed.fetch_url(source, &found).await {
                Ok(items) if !items.is_empty() => {
                    info!(feed_url = %found, items = items.len(), "using discovered feed");
                    return Ok(Harvest::Feed {
                        feed_url: found,
                        items,
                        discovered: true,
                    });
                }
                Ok(empty) => {
                    info!(feed_url = %found, "discovered feed is empty, trying page extraction");
                    return Ok(self.page_after_empty_feed(source, found, true, empty).await);
                }
                Err(e) => {
                    warn!(feed_url = %found, error = %e, "discovered feed failed");
                    if feed_error.is_none() {
                        feed_error = Some(e);
                    }
                }
            }
        }

        match self.page.fetch(source).await {
            Ok(items) => Ok(Harvest::Page { items, feed_error }),
            Err(page_err) => Err(match feed_error {
                Some(feed_err) => FetchError::Both {
                    feed: Box::new(feed_err),
                    page: Box::new(page_err),
                },
                None => page_err,
            }),
        }
    }

    /// A feed answered with no entries. Page items win when there are any;
    /// a failing page leaves the empty feed as a successful harvest.
    async fn page_after_empty_feed(
        &self,
        source: &Source,
        feed_url: String,
        discovered: bool,
        empty: Vec<Item>,
    ) -> Harvest {
        match self.page.fetch(source).await {
            Ok(items) => Harvest::Page {
                items,
                feed_error: None,
            },
            Err(e) => {
                warn!(error = %e, "page extraction failed after empty feed");
                Harvest::Feed {
                    feed_url,
                    items: empty,
                    discovered,
                }
            }
        }
    }

    /// Look for a feed other than the configured one.
    async fn discover(&self, source: &Source) -> Option<String> {
        let configured = source.feed_url.as_ref().map(|u| normalize_url(u.as_str()));
        let without_feed = Source {
            feed_url: None,
            ..source.clone()
        };
        let audit = discover_feed(&self.client, &without_feed, &self.discovery).await;
        match audit.result() {
            DiscoveryResult::Found { feed_url } if configured.as_deref() != Some(feed_url.as_str()) => {
                Some(feed_url)
            }
            DiscoveryResult::Found { .. } => None,
            DiscoveryResult::NotFound => {
                debug!(candidates = audit.probes.len(), "no feed discovered");
                None
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    #[instrument(skip_all, fields(source = %source.id, strategy = source.strategy.as_str()))]
    async fn fetch(&self, source: &Source) -> std::result::Result<Harvest, FetchError> {
        match source.strategy {
            FetchStrategy::FeedOnly => {
                let feed_url = source
                    .feed_url
                    .as_ref()
                    .ok_or_else(|| FetchError::MissingFeedUrl(source.id.clone()))?;
                let items = self.feed.fetch(source).await?;
                Ok(Harvest::Feed {
                    feed_url: feed_url.to_string(),
                    items,
                    discovered: false,
                })
            }
            FetchStrategy::FallbackOnly => {
                let items = self.page.fetch(source).await?;
                Ok(Harvest::Page {
                    items,
                    feed_error: None,
                })
            }
            FetchStrategy::FeedThenFallback => self.feed_then_fallback(source).await,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Build a reqwest client with the configured timeouts.
pub fn build_client(config: &FetchConfig) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()
        .map_err(|e| SourcewatchError::Network(format!("failed to build HTTP client: {e}")))
}

/// GET `url` and return the body, mapping transport failures and error statuses.
pub(crate) async fn get_body(
    client: &Client,
    url: &str,
    timeout_secs: u64,
) -> std::result::Result<Vec<u8>, FetchError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::from_transport(format!("{url}: {e}"), e.is_timeout(), timeout_secs))?;

    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(FetchError::Http {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let bytes = response.bytes().await.map_err(|e| {
        FetchError::from_transport(
            format!("{url}: body read failed: {e}"),
            e.is_timeout(),
            timeout_secs,
        )
    })?;
    Ok(bytes.to_vec())
}
