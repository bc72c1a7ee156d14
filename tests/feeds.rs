//! Configuration-driven passes against mock feeds and a mock aria2 daemon

use bangumi_dl::{
    BackendConfig, Config, EpisodeNumber, LedgerKey, LedgerStatus, Reconciler, RetryConfig,
    SeriesConfig, SeriesId, SourceConfig, SourceKind,
};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MIKAN_FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0">
  <channel>
    <title>Mikan Project - Frieren</title>
    <link>https://mikanani.me</link>
    <description>Search results</description>
    <item>
      <title>[LoliHouse] Frieren - 05 [WebRip 1080p HEVC-10bit AAC]</title>
      <link>https://mikanani.me/Home/Episode/five</link>
      <pubDate>2023-10-06T23:44:00</pubDate>
      <enclosure type="application/x-bittorrent" length="1" url="https://mikanani.me/Download/five.torrent" />
    </item>
    <item>
      <title>[LoliHouse] Frieren - 06 [WebRip 1080p HEVC-10bit AAC]</title>
      <link>https://mikanani.me/Home/Episode/six</link>
      <pubDate>2023-10-13T23:44:00</pubDate>
      <enclosure type="application/x-bittorrent" length="1" url="https://mikanani.me/Download/six.torrent" />
    </item>
  </channel>
</rss>"#;

const NYAA_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss xmlns:nyaa="https://nyaa.si/xmlns/nyaa" version="2.0">
  <channel>
    <title>Nyaa - "Frieren"</title>
    <description>RSS Feed</description>
    <link>https://nyaa.si/</link>
    <item>
      <title>[SubsPlease] Frieren - 06 (1080p) [ABCD1234].mkv</title>
      <link>https://nyaa.si/view/6</link>
      <pubDate>Fri, 13 Oct 2023 15:01:45 -0000</pubDate>
      <nyaa:infoHash>0123456789ABCDEF0123456789ABCDEF01234567</nyaa:infoHash>
    </item>
    <item>
      <title>[SubsPlease] Frieren (01-04) (1080p) [Batch]</title>
      <link>https://nyaa.si/view/1</link>
      <pubDate>Fri, 13 Oct 2023 10:00:00 -0000</pubDate>
      <nyaa:infoHash>FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF</nyaa:infoHash>
    </item>
  </channel>
</rss>"#;

struct Env {
    feeds: MockServer,
    aria2: MockServer,
    dir: TempDir,
}

impl Env {
    async fn start() -> Self {
        Self {
            feeds: MockServer::start().await,
            aria2: MockServer::start().await,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self) -> Config {
        let source = |kind, route: &str, param: &str| SourceConfig {
            kind,
            url_template: format!("{}{}?{}={{keyword}}", self.feeds.uri(), route, param),
            timeout: Duration::from_secs(5),
            enabled: true,
        };

        let mut config = Config {
            subscriptions: vec![SeriesConfig {
                name: "Frieren".to_string(),
                keyword: None,
                filters: Default::default(),
                active: true,
            }],
            sources: vec![
                source(SourceKind::Mikan, "/RSS/Search", "searchstr"),
                source(SourceKind::Nyaa, "/", "q"),
            ],
            backend: BackendConfig::Aria2 {
                rpc_url: format!("{}/jsonrpc", self.aria2.uri()),
                secret: Some("s3cret".to_string()),
            },
            retry: RetryConfig::disabled(),
            ..Config::default()
        };
        config.persistence.database_path = self.dir.path().join("bangumi-dl.db");
        config.storage.save_path = self.dir.path().join("downloads");
        config
    }

    async fn serve_feeds(&self, nyaa: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/RSS/Search"))
            .and(query_param("searchstr", "Frieren"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MIKAN_FEED))
            .mount(&self.feeds)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("q", "Frieren"))
            .respond_with(nyaa)
            .mount(&self.feeds)
            .await;
    }

    async fn accept_downloads(&self, gid: &str) {
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_partial_json(json!({ "method": "aria2.addUri" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": "bangumi-dl",
                "result": gid
            })))
            .mount(&self.aria2)
            .await;
    }
}

fn key(episode: u32) -> LedgerKey {
    LedgerKey::new(SeriesId(1), EpisodeNumber::from_whole(episode))
}

#[tokio::test]
async fn feeds_are_reconciled_and_submitted() {
    let env = Env::start().await;
    env.serve_feeds(ResponseTemplate::new(200).set_body_string(NYAA_FEED))
        .await;
    env.accept_downloads("2089b05ecca3d829").await;

    let reconciler = Reconciler::new(env.config()).await.unwrap();
    let report = reconciler.run_pass(&CancellationToken::new()).await.unwrap();

    let outcome = report.outcome(SeriesId(1)).unwrap();
    assert_eq!(outcome.fetched, 4);
    assert_eq!(outcome.unparsed, 1);
    assert_eq!(outcome.dispatched, 2);
    assert!(outcome.fetch_errors.is_empty());

    // Episode 6 is listed by both sites; the earlier nyaa release wins
    let db = reconciler.database();
    let six = db.get_latest(&key(6)).await.unwrap().unwrap();
    assert_eq!(six.source, SourceKind::Nyaa);
    assert_eq!(
        six.uri,
        "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567"
    );
    assert_eq!(six.handle.as_deref(), Some("2089b05ecca3d829"));

    let five = db.get_latest(&key(5)).await.unwrap().unwrap();
    assert_eq!(five.uri, "https://mikanani.me/Download/five.torrent");
    assert_eq!(five.status, LedgerStatus::Downloading);

    let requests = env.aria2.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["params"][0], "token:s3cret");
    assert!(
        body["params"][2]["dir"]
            .as_str()
            .unwrap()
            .ends_with("Frieren")
    );

    reconciler.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_feed_is_reported_without_blocking_others() {
    let env = Env::start().await;
    env.serve_feeds(ResponseTemplate::new(503)).await;
    env.accept_downloads("gid-1").await;

    let reconciler = Reconciler::new(env.config()).await.unwrap();
    let report = reconciler.run_pass(&CancellationToken::new()).await.unwrap();

    let outcome = report.outcome(SeriesId(1)).unwrap();
    assert_eq!(outcome.fetched, 2);
    assert_eq!(outcome.dispatched, 2);
    assert_eq!(outcome.fetch_errors.len(), 1);
    assert!(outcome.fetch_errors[0].contains("nyaa"));
}

#[tokio::test]
async fn completed_downloads_are_not_resubmitted() {
    let env = Env::start().await;
    env.serve_feeds(ResponseTemplate::new(200).set_body_string(NYAA_FEED))
        .await;
    env.accept_downloads("gid-1").await;
    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .and(body_partial_json(json!({ "method": "aria2.tellStatus" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": "bangumi-dl",
            "result": { "gid": "gid-1", "status": "complete" }
        })))
        .mount(&env.aria2)
        .await;

    let reconciler = Reconciler::new(env.config()).await.unwrap();
    let cancel = CancellationToken::new();
    reconciler.run_pass(&cancel).await.unwrap();
    let second = reconciler.run_pass(&cancel).await.unwrap();

    let outcome = second.outcome(SeriesId(1)).unwrap();
    assert_eq!(outcome.dispatched, 0);
    assert_eq!(outcome.skipped_duplicate, 2);

    let db = reconciler.database();
    assert_eq!(db.get_latest(&key(5)).await.unwrap().unwrap().status, LedgerStatus::Done);
    assert_eq!(db.get_latest(&key(6)).await.unwrap().unwrap().status, LedgerStatus::Done);
}

#[tokio::test]
async fn state_survives_restart() {
    let env = Env::start().await;
    env.serve_feeds(ResponseTemplate::new(200).set_body_string(NYAA_FEED))
        .await;
    env.accept_downloads("gid-1").await;
    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .and(body_partial_json(json!({ "method": "aria2.tellStatus" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": "bangumi-dl",
            "result": { "gid": "gid-1", "status": "active" }
        })))
        .mount(&env.aria2)
        .await;

    {
        let reconciler = Reconciler::new(env.config()).await.unwrap();
        reconciler.run_pass(&CancellationToken::new()).await.unwrap();
        reconciler.shutdown().await.unwrap();
    }

    let reconciler = Reconciler::new(env.config()).await.unwrap();
    let report = reconciler.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.dispatched(), 0);

    let add_uri_calls = env
        .aria2
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| String::from_utf8_lossy(&r.body).contains("aria2.addUri"))
        .count();
    assert_eq!(add_uri_calls, 2);
}
