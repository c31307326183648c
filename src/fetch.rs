//!
//! src/fetch.rs  Andrew Belles  Oct 3rd, 2025
//!
//! Defines methods for hitting catalog endpoints and returning unparsed
//! json, handling retries, backoff and rate gates. Outcomes are decided
//! from status codes and reqwest's error kinds, never from message text
//!

use std::time::{Duration, Instant};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use reqwest::{Client, RequestBuilder, StatusCode, header, redirect};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::config::{DiscogsConfig, HttpConfig, IdentityConfig, RetryConfig, SpotifyConfig};
use crate::errors::{IngestError, SourceError};

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

fn client_with_headers(http: &HttpConfig, headers: header::HeaderMap) ->
    Result<Client, IngestError> {
    client_helper(http)
        .default_headers(headers)
        .build()
        .map_err(|e| IngestError::Http(format!("build client: {e}")))
}

/// json client carrying our user agent, shared shape for all catalogs
pub fn catalog_client(http: &HttpConfig, identity: &IdentityConfig) ->
    Result<Client, IngestError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    h.insert(
        header::USER_AGENT,
        header::HeaderValue::from_str(&identity.user_agent)
            .map_err(|e| IngestError::Config(format!("invalid user-agent {e}")))?
    );
    client_with_headers(http, h)
}

fn endpoint(base: &Url, path: &str) -> Result<Url, SourceError> {
    base.join(path)
        .map_err(|e| SourceError::Fatal(format!("bad endpoint {path}: {e}")))
}

/// Spaces out requests to a catalog with a hard per-minute quota
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    state: tokio::sync::Mutex<Option<Instant>>
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: tokio::sync::Mutex::new(None)
        }
    }

    pub async fn wait(&self) {
        let mut last = self.state.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    NotFound,
    Retryable,
    Fatal
}

pub fn classify_status(status: StatusCode, retry: &RetryConfig) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::NOT_FOUND {
        StatusClass::NotFound
    } else if retry.retryable_statuses.contains(&status.as_u16()) {
        StatusClass::Retryable
    } else {
        StatusClass::Fatal
    }
}

/// Random wait for http_with_retry, exponential in attempt and capped
pub fn generate_backoff(retry: &RetryConfig, attempt: u8, rng: &mut SmallRng) -> Duration {
    let base = retry.base_backoff.as_millis() as u64;
    let exp = (1_u64 << attempt.min(6)) * base;
    let jitter = if retry.jitter { rng.gen_range(50..=200) as u64 } else { 0 };
    Duration::from_millis(exp + jitter).min(retry.max_backoff)
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Connection level failures worth another attempt
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Sends a request until it succeeds, is rejected, or attempts run out.
///
/// 404 is `Ok(None)`. Retryable statuses and connection failures back
/// off exponentially (honouring Retry-After) and end as `Transient`;
/// anything else is `Fatal` straight away.
pub async fn http_with_retry(request: RequestBuilder, retry: &RetryConfig) ->
    Result<Option<Value>, SourceError> {
    let mut rng = SmallRng::from_entropy();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0_u8;
    loop {
        let response = request.try_clone()
            .ok_or_else(|| SourceError::Fatal("non-cloneable request".to_string()))?
            .send()
            .await;

        let (reason, wait_hint) = match response {
            Ok(resp) => {
                let status = resp.status();
                match classify_status(status, retry) {
                    StatusClass::Success => {
                        return resp.json::<Value>().await
                            .map(Some)
                            .map_err(|e| SourceError::Fatal(format!("decode body: {e}")));
                    }
                    StatusClass::NotFound => {
                        debug!(url = %resp.url(), "http.not_found");
                        return Ok(None);
                    }
                    StatusClass::Retryable => {
                        let hint = retry_after(&resp);
                        let reason = if status == StatusCode::TOO_MANY_REQUESTS {
                            "rate limited".to_string()
                        } else {
                            format!("status {status}")
                        };
                        (reason, hint)
                    }
                    StatusClass::Fatal => {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(SourceError::Fatal(
                            format!("status {status}: {}", snippet(&body))
                        ));
                    }
                }
            },
            Err(e) if is_transient(&e) => (format!("request: {e}"), None),
            Err(e) => return Err(SourceError::Fatal(format!("request: {e}")))
        };

        attempt += 1;
        if attempt >= max_attempts {
            return Err(SourceError::Transient(
                format!("{reason} after {attempt} attempts")
            ));
        }
        let backoff = generate_backoff(retry, attempt - 1, &mut rng)
            .max(wait_hint.unwrap_or_default().min(retry.max_backoff));
        warn!(reason = %reason, attempt, backoff = ?backoff.as_millis(), "http.retry");
        sleep(backoff).await;
    }
}

#[derive(Clone, Debug)]
pub struct SpotifyClient {
    pub http: Client,
    pub cfg: SpotifyConfig
}

impl SpotifyClient {
    pub fn new(
        http_config: &HttpConfig,
        identity: &IdentityConfig,
        cfg: &SpotifyConfig
    ) -> Result<Self, IngestError> {
        let http = catalog_client(http_config, identity)?;
        Ok( Self {
            http,
            cfg: cfg.clone()
        })
    }

    /// POST client-credentials grant
    pub fn token_request(&self) -> RequestBuilder {
        self.http
            .post(self.cfg.token_url.clone())
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
    }

    /// GET /v1/search?type=album&q=artist:... album:...&limit=
    pub fn search_album(&self, artist: &str, title: &str, limit: u32, bearer: &str) ->
        Result<RequestBuilder, SourceError> {
        let url = endpoint(&self.cfg.api_base, "search")?;
        let query = format!("artist:{artist} album:{title}");
        let limit = limit.to_string();
        let mut rb = self.http.get(url).bearer_auth(bearer).query(&[
            ("type", "album"),
            ("q", query.as_str()),
            ("limit", limit.as_str())
        ]);
        if let Some(market) = &self.cfg.market {
            rb = rb.query(&[("market", market.as_str())]);
        }
        Ok(rb)
    }

    /// GET /v1/albums/{id}
    pub fn album(&self, album_id: &str, bearer: &str) -> Result<RequestBuilder, SourceError> {
        let url = endpoint(&self.cfg.api_base, &format!("albums/{album_id}"))?;
        Ok(self.http.get(url).bearer_auth(bearer))
    }
}

#[derive(Clone, Debug)]
pub struct DiscogsClient {
    pub http: Client,
    pub cfg: DiscogsConfig
}

impl DiscogsClient {
    pub fn new(
        http_config: &HttpConfig,
        identity: &IdentityConfig,
        cfg: &DiscogsConfig
    ) -> Result<Self, IngestError> {
        let http = catalog_client(http_config, identity)?;
        Ok( Self { http, cfg: cfg.clone() } )
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        rb.header(header::AUTHORIZATION, format!("Discogs token={}", self.cfg.token))
    }

    /// GET /database/search?artist=...&release_title=...&type=release&per_page=&page=
    pub fn search_release(&self, artist: &str, title: &str, per_page: u32, page: u32) ->
        Result<RequestBuilder, SourceError> {
        let url = endpoint(&self.cfg.base_url, "database/search")?;
        let (per_page, page) = (per_page.to_string(), page.to_string());
        let rb = self.http.get(url).query(&[
            ("artist", artist),
            ("release_title", title),
            ("type", "release"),
            ("per_page", per_page.as_str()),
            ("page", page.as_str()),
        ]);
        Ok(self.authorize(rb))
    }

    /// GET /releases/{id}
    pub fn release(&self, release_id: u64) -> Result<RequestBuilder, SourceError> {
        let url = endpoint(&self.cfg.base_url, &format!("releases/{release_id}"))?;
        Ok(self.authorize(self.http.get(url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn live() -> bool {
        std::env::var("LIVE_HTTP").ok().as_deref() == Some("1")
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            jitter: false,
            ..RetryConfig::default()
        };
        let mut rng = SmallRng::seed_from_u64(7);
        assert_eq!(generate_backoff(&retry, 0, &mut rng), Duration::from_millis(100));
        assert_eq!(generate_backoff(&retry, 2, &mut rng), Duration::from_millis(400));
        assert_eq!(generate_backoff(&retry, 5, &mut rng), Duration::from_millis(1000));

        let jittered = RetryConfig { jitter: true, ..retry };
        let wait = generate_backoff(&jittered, 0, &mut rng);
        assert!(wait >= Duration::from_millis(150) && wait <= Duration::from_millis(300));
    }

    #[test]
    fn statuses_map_to_outcomes() {
        let retry = RetryConfig::default();
        assert_eq!(classify_status(StatusCode::OK, &retry), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::NOT_FOUND, &retry), StatusClass::NotFound);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS, &retry), StatusClass::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY, &retry), StatusClass::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, &retry), StatusClass::Fatal);
        assert_eq!(classify_status(StatusCode::NOT_IMPLEMENTED, &retry), StatusClass::Fatal);
    }

    #[test]
    fn endpoints_keep_base_path() {
        let base = Url::parse("https://api.spotify.com/v1/").unwrap();
        assert_eq!(
            endpoint(&base, "albums/abc").unwrap().as_str(),
            "https://api.spotify.com/v1/albums/abc"
        );
    }

    #[tokio::test]
    async fn rate_gate_spaces_calls() {
        let gate = RateGate::new(Duration::from_millis(40));
        let start = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let http = HttpConfig {
            timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(300),
            retry: RetryConfig {
                max_attempts: 2,
                base_backoff: Duration::from_millis(1),
                jitter: false,
                ..RetryConfig::default()
            },
            ..HttpConfig::default()
        };
        let identity = IdentityConfig { user_agent: "album-ingest-test/0".into() };
        let client = catalog_client(&http, &identity).unwrap();

        // nothing listens on the discard port
        let request = client.get("http://127.0.0.1:9/");
        let err = http_with_retry(request, &http.retry).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[tokio::test]
    #[allow(dead_code)]
    async fn spotify_client_testbench() -> Result<(), IngestError> {
        dotenvy::dotenv().ok();

        if !live() {
            eprintln!("Set LIVE_HTTP=1 to run");
            return Ok(())
        }

        let cfgs = config::load_config()?;
        let spotify_cfg = cfgs.spotify.as_ref()
            .ok_or_else(|| IngestError::Config("spotify not configured".into()))?;
        let spotify = SpotifyClient::new(&cfgs.http, &cfgs.identity, spotify_cfg)?;

        let token = http_with_retry(spotify.token_request(), &cfgs.http.retry).await?
            .expect("token endpoint answered 404");
        let bearer = token["access_token"].as_str().unwrap();

        let found = http_with_retry(
            spotify.search_album("Miles Davis", "Kind of Blue", 1, bearer)?,
            &cfgs.http.retry
        ).await?.unwrap();
        println!("search: {}", serde_json::to_string_pretty(&found)?);
        assert!(found.pointer("/albums/items/0/id").is_some());

        Ok(())
    }

    #[tokio::test]
    #[allow(dead_code)]
    async fn discogs_client_testbench() -> Result<(), IngestError> {
        dotenvy::dotenv().ok();

        if !live() {
            eprintln!("Set LIVE_HTTP=1 to run");
            return Ok(())
        }

        let cfgs = config::load_config()?;
        let discogs_cfg = cfgs.discogs.as_ref()
            .ok_or_else(|| IngestError::Config("discogs not configured".into()))?;
        let discogs = DiscogsClient::new(&cfgs.http, &cfgs.identity, discogs_cfg)?;

        let found = http_with_retry(
            discogs.search_release("Miles Davis", "Kind of Blue", 1, 1)?,
            &cfgs.http.retry
        ).await?.unwrap();
        println!("search: {}", serde_json::to_string_pretty(&found)?);
        assert!(found.pointer("/results/0/id").is_some());

        Ok(())
    }
}
