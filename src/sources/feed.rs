//! Generic RSS/Atom feed adapter.

use super::{FeedSource, SeriesQuery};
use crate::error::FetchError;
use crate::types::{RawFeedItem, SeriesId, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::time::Duration;

/// Placeholder substituted with the URL-encoded search keyword
const KEYWORD_PLACEHOLDER: &str = "{keyword}";

const USER_AGENT: &str = concat!("bangumi-dl/", env!("CARGO_PKG_VERSION"));

/// Adapter for any site that serves search results as an RSS 2.0 or Atom feed
///
/// mikan, bangumi.moe, dmhy and nyaa all do; they differ only in URL and in
/// where the torrent URI sits in an item.
pub struct RssFeedSource {
    kind: SourceKind,
    url_template: String,
    client: reqwest::Client,
}

impl RssFeedSource {
    /// Create an adapter for `kind` querying `url_template`
    pub fn new(kind: SourceKind, url_template: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::permanent(kind, format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            kind,
            url_template: url_template.to_string(),
            client,
        })
    }

    /// Feed URL for one search keyword
    pub fn feed_url(&self, keyword: &str) -> String {
        self.url_template
            .replace(KEYWORD_PLACEHOLDER, &urlencoding::encode(keyword))
    }

    fn request_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() || e.is_connect() {
            FetchError::transient(self.kind, format!("request failed: {}", e))
        } else {
            FetchError::permanent(self.kind, format!("request failed: {}", e))
        }
    }
}

#[async_trait]
impl FeedSource for RssFeedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, query: &SeriesQuery) -> Result<Vec<RawFeedItem>, FetchError> {
        let url = self.feed_url(&query.keyword);
        tracing::debug!(source = %self.kind, url = %url, "Checking feed");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        // Check HTTP status before trying to parse the response body
        let status = response.status();
        if !status.is_success() {
            let reason = format!("feed returned HTTP {}: {}", status.as_u16(), url);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                FetchError::transient(self.kind, reason)
            } else {
                FetchError::permanent(self.kind, reason)
            });
        }

        let content = response.text().await.map_err(|e| self.request_error(e))?;

        let items = parse_feed(self.kind, query.series, &content)
            .map_err(|reason| FetchError::permanent(self.kind, reason))?;
        tracing::debug!(source = %self.kind, items = items.len(), "Parsed feed");
        Ok(items)
    }
}

/// Parse a feed document, trying RSS first and then Atom
pub(crate) fn parse_feed(
    kind: SourceKind,
    series: SeriesId,
    content: &str,
) -> Result<Vec<RawFeedItem>, String> {
    match parse_as_rss(kind, series, content) {
        Ok(items) => Ok(items),
        Err(rss_err) => {
            tracing::debug!(source = %kind, error = %rss_err, "Failed to parse as RSS, trying Atom");
            parse_as_atom(kind, series, content).map_err(|atom_err| {
                format!(
                    "not an RSS or Atom feed. RSS error: {}. Atom error: {}",
                    rss_err, atom_err
                )
            })
        }
    }
}

fn parse_as_rss(kind: SourceKind, series: SeriesId, content: &str) -> Result<Vec<RawFeedItem>, String> {
    let channel = content
        .parse::<rss::Channel>()
        .map_err(|e| format!("RSS parse error: {}", e))?;

    let items = channel
        .items()
        .iter()
        .filter_map(|item| {
            let title = item.title().unwrap_or_default().trim().to_string();

            // Enclosure first, then a torrent-looking link, then nyaa's info hash
            let uri = item
                .enclosure()
                .map(|enc| enc.url().to_string())
                .filter(|url| !url.is_empty())
                .or_else(|| item.link().filter(|link| is_torrent_uri(link)).map(str::to_string))
                .or_else(|| extension_value(item, "infoHash").map(magnet_from_hash));

            let Some(uri) = uri else {
                tracing::debug!(source = %kind, title = %title, "Feed item has no torrent URI, skipping");
                return None;
            };

            let published = item
                .pub_date()
                .and_then(parse_date)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            Some(RawFeedItem {
                series,
                title,
                uri,
                published,
                source: kind,
            })
        })
        .collect();

    Ok(items)
}

fn parse_as_atom(kind: SourceKind, series: SeriesId, content: &str) -> Result<Vec<RawFeedItem>, String> {
    let feed = atom_syndication::Feed::read_from(content.as_bytes())
        .map_err(|e| format!("Atom parse error: {}", e))?;

    let items = feed
        .entries()
        .iter()
        .filter_map(|entry| {
            let title = entry.title().as_str().trim().to_string();

            let uri = entry
                .links()
                .iter()
                .find(|link| link.rel() == "enclosure" || is_torrent_uri(link.href()))
                .map(|link| link.href().to_string());

            let Some(uri) = uri else {
                tracing::debug!(source = %kind, title = %title, "Feed entry has no torrent URI, skipping");
                return None;
            };

            // Publication date (prefer published, fallback to updated)
            let published = entry
                .published()
                .unwrap_or_else(|| entry.updated())
                .with_timezone(&Utc);

            Some(RawFeedItem {
                series,
                title,
                uri,
                published,
                source: kind,
            })
        })
        .collect();

    Ok(items)
}

fn is_torrent_uri(uri: &str) -> bool {
    uri.starts_with("magnet:?") || uri.ends_with(".torrent")
}

fn magnet_from_hash(hash: &str) -> String {
    format!("magnet:?xt=urn:btih:{}", hash.trim().to_ascii_lowercase())
}

/// First value of a namespaced extension element with local name `name`
fn extension_value<'a>(item: &'a rss::Item, name: &str) -> Option<&'a str> {
    item.extensions()
        .values()
        .filter_map(|elements| elements.get(name))
        .flatten()
        .find_map(|ext| ext.value())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// RFC 2822, then RFC 3339, then a naive ISO timestamp taken as UTC
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
