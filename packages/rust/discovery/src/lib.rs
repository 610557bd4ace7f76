//! Feed autodiscovery for registry sources.
//!
//! For each source we build an ordered list of candidate feed URLs (the
//! configured feed, configured candidates, `<link rel="alternate">` feeds
//! declared by the home page, then common suffixes) and probe them in order
//! until one answers with feed-looking content.

mod candidates;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use sourcewatch_shared::{Result, Source, SourcewatchError, normalize_url};

pub use candidates::{common_feed_candidates, feed_links_from_html, is_feed_content};

/// Maximum number of redirects to follow per probe.
const MAX_REDIRECTS: usize = 3;

/// Default timeout in seconds for each probe.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of candidates probed per source.
const DEFAULT_PROBE_LIMIT: usize = 8;

/// Concurrent sources audited at once.
const AUDIT_CONCURRENCY: usize = 4;

/// User-Agent string for discovery requests.
const USER_AGENT: &str = concat!("sourcewatch/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// DiscoveryResult
// ---------------------------------------------------------------------------

/// Outcome of probing one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryResult {
    /// A candidate answered with feed content.
    Found { feed_url: String },
    /// No candidate within the probe limit looked like a feed.
    NotFound,
}

/// One probe attempt and its verdict (`ok`, `http_404`, `request_error: ...`).
#[derive(Debug, Clone, Serialize)]
pub struct ProbeLog {
    pub url: String,
    pub result: String,
}

/// Discovery report for a single source.
#[derive(Debug, Clone, Serialize)]
pub struct FeedAudit {
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,
    /// `confirmed` or `not_found`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage_error: Option<String>,
    pub probes: Vec<ProbeLog>,
    pub checked_at: DateTime<Utc>,
}

impl FeedAudit {
    pub fn result(&self) -> DiscoveryResult {
        match &self.feed_url {
            Some(url) => DiscoveryResult::Found {
                feed_url: url.clone(),
            },
            None => DiscoveryResult::NotFound,
        }
    }
}

/// Discovery report for a whole registry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub confirmed: usize,
    pub sources: Vec<FeedAudit>,
}

// ---------------------------------------------------------------------------
// Discovery options
// ---------------------------------------------------------------------------

/// Configuration for the discovery process.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,
    /// Candidates probed per source (clamped to 1..=20).
    pub probe_limit: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            probe_limit: DEFAULT_PROBE_LIMIT,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Audit every source, a few at a time. Report order follows registry order.
pub async fn audit_sources(sources: &[Source], opts: &DiscoveryOptions) -> Result<AuditReport> {
    let client = build_client(opts)?;
    let semaphore = Arc::new(Semaphore::new(AUDIT_CONCURRENCY));
    let mut handles = Vec::with_capacity(sources.len());

    for source in sources {
        let client = client.clone();
        let sem = semaphore.clone();
        let source = source.clone();
        let opts = opts.clone();
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            discover_feed(&client, &source, &opts).await
        }));
    }

    let mut audits = Vec::with_capacity(handles.len());
    for (handle, source) in handles.into_iter().zip(sources) {
        match handle.await {
            Ok(audit) => audits.push(audit),
            Err(e) => {
                warn!(source = %source.id, error = %e, "audit task failed");
                audits.push(FeedAudit {
                    source_id: source.id.clone(),
                    feed_url: None,
                    status: "not_found",
                    homepage_error: Some(format!("task failed: {e}")),
                    probes: Vec::new(),
                    checked_at: Utc::now(),
                });
            }
        }
    }

    let confirmed = audits.iter().filter(|a| a.feed_url.is_some()).count();
    info!(total = audits.len(), confirmed, "feed audit completed");

    Ok(AuditReport {
        generated_at: Utc::now(),
        total: audits.len(),
        confirmed,
        sources: audits,
    })
}

/// Probe candidate feed URLs for one source.
#[instrument(skip_all, fields(source = %source.id))]
pub async fn discover_feed(client: &Client, source: &Source, opts: &DiscoveryOptions) -> FeedAudit {
    let home = source.home_url.as_str();

    let mut candidates: Vec<String> = Vec::new();
    if let Some(feed_url) = &source.feed_url {
        candidates.push(feed_url.to_string());
    }
    candidates.extend(source.feed_candidates.iter().cloned());

    let (homepage_html, homepage_error) = match fetch_text(client, home).await {
        Ok((_, body)) => (Some(body), None),
        Err(reason) => {
            debug!(%reason, "home page unavailable");
            (None, Some(reason))
        }
    };
    if let Some(html) = homepage_html.as_deref() {
        candidates.extend(feed_links_from_html(&source.home_url, html));
    }
    candidates.extend(common_feed_candidates(&source.home_url));

    let candidates = unique_keep_order(candidates.iter().map(|c| normalize_url(c)));
    let limit = opts.probe_limit.clamp(1, 20);

    let mut probes = Vec::new();
    for candidate in candidates.into_iter().take(limit) {
        let result = probe_feed_url(client, &candidate).await;
        let ok = result == "ok";
        probes.push(ProbeLog {
            url: candidate.clone(),
            result,
        });
        if ok {
            info!(feed_url = %candidate, "feed confirmed");
            return FeedAudit {
                source_id: source.id.clone(),
                feed_url: Some(candidate),
                status: "confirmed",
                homepage_error,
                probes,
                checked_at: Utc::now(),
            };
        }
    }

    FeedAudit {
        source_id: source.id.clone(),
        feed_url: None,
        status: "not_found",
        homepage_error,
        probes,
        checked_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a reqwest client with appropriate settings.
pub fn build_client(opts: &DiscoveryOptions) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(opts.timeout_secs))
        .build()
        .map_err(|e| SourcewatchError::Network(format!("failed to build HTTP client: {e}")))
}

/// GET `url`; returns `(content_type, body)` or a short failure reason.
async fn fetch_text(client: &Client, url: &str) -> std::result::Result<(String, String), String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request_error: {e}"))?;

    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(format!("http_{}", status.as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body = response
        .text()
        .await
        .map_err(|e| format!("request_error: {e}"))?;
    Ok((content_type, body))
}

/// Probe a candidate; returns `"ok"` or the reason it was rejected.
async fn probe_feed_url(client: &Client, url: &str) -> String {
    match fetch_text(client, url).await {
        Ok((content_type, body)) if is_feed_content(&content_type, &body) => "ok".to_string(),
        Ok((content_type, _)) => format!("not_feed_content_type:{content_type}"),
        Err(reason) => reason,
    }
}

fn unique_keep_order(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sourcewatch_shared::{FetchStrategy, HealthRecord, SourceCategory};
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(home: &str, feed: Option<&str>) -> Source {
        Source {
            id: "probe-me".into(),
            name: "Probe Me".into(),
            category: SourceCategory::Other,
            home_url: Url::parse(home).unwrap(),
            feed_url: feed.map(|f| Url::parse(f).unwrap()),
            strategy: FetchStrategy::FeedThenFallback,
            max_items: 20,
            feed_candidates: Vec::new(),
            health: HealthRecord::default(),
        }
    }

    const RSS_BODY: &str = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>t</title></channel></rss>"#;

    #[tokio::test]
    async fn discovers_feed_declared_in_homepage() {
        let server = MockServer::start().await;

        let homepage = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="/blog/posts.rss">
        </head><body></body></html>"#;

        Mock::given(method("GET"))
            .and(path("/blog"))
            .respond_with(ResponseTemplate::new(200).set_body_string(homepage))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/blog/posts.rss"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(RSS_BODY, "application/rss+xml"),
            )
            .mount(&server)
            .await;

        let client = build_client(&DiscoveryOptions::default()).unwrap();
        let src = source(&format!("{}/blog", server.uri()), None);
        let audit = discover_feed(&client, &src, &DiscoveryOptions::default()).await;

        assert_eq!(audit.status, "confirmed");
        assert_eq!(
            audit.result(),
            DiscoveryResult::Found {
                feed_url: format!("{}/blog/posts.rss", server.uri())
            }
        );
        assert_eq!(audit.probes.len(), 1);
        assert!(audit.homepage_error.is_none());
    }

    #[tokio::test]
    async fn configured_feed_is_probed_first() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/custom/feed"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    r#"<feed xmlns="http://www.w3.org/2005/Atom"></feed>"#,
                    "application/atom+xml",
                ),
            )
            .mount(&server)
            .await;

        let client = build_client(&DiscoveryOptions::default()).unwrap();
        let src = source(
            &format!("{}/", server.uri()),
            Some(&format!("{}/custom/feed", server.uri())),
        );
        let audit = discover_feed(&client, &src, &DiscoveryOptions::default()).await;

        assert_eq!(audit.probes[0].url, format!("{}/custom/feed", server.uri()));
        assert_eq!(audit.probes[0].result, "ok");
        assert_eq!(audit.homepage_error.as_deref(), Some("http_404"));
    }

    #[tokio::test]
    async fn html_served_as_feed_is_rejected_and_limit_applies() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body>home</body></html>", "text/html"),
            )
            .mount(&server)
            .await;

        let client = build_client(&DiscoveryOptions::default()).unwrap();
        let src = source(&format!("{}/news", server.uri()), None);
        let opts = DiscoveryOptions {
            probe_limit: 3,
            ..DiscoveryOptions::default()
        };
        let audit = discover_feed(&client, &src, &opts).await;

        assert_eq!(audit.result(), DiscoveryResult::NotFound);
        assert_eq!(audit.status, "not_found");
        assert_eq!(audit.probes.len(), 3);
        assert!(audit.probes[0].result.starts_with("not_feed_content_type:text/html"));
    }

    #[tokio::test]
    async fn audit_preserves_registry_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut a = source(&format!("{}/a", server.uri()), None);
        a.id = "a".into();
        let mut b = source(&format!("{}/b", server.uri()), None);
        b.id = "b".into();

        let opts = DiscoveryOptions {
            probe_limit: 1,
            ..DiscoveryOptions::default()
        };
        let report = audit_sources(&[a, b], &opts).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.confirmed, 0);
        assert_eq!(report.sources[0].source_id, "a");
        assert_eq!(report.sources[1].source_id, "b");
        assert_eq!(report.sources[0].probes[0].result, "http_404");
    }
}
