use serde::Deserialize;
use url::Url;
use std::{str::FromStr, time};
use crate::errors::IngestError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 8000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

pub const RETRY_MAX_ATTEMPTS: u8 = 4;
pub const RETRY_BASE_BACKOFF: u64 = 250;
pub const RETRY_MAX_BACKOFF: u64 = 30000;
pub const RETRY_JITTER: bool = true;
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

pub const DEFAULT_SOURCES: &str = "discogs,spotify";

/// Wrapper over env::var, treats blank values as unset
fn env_opt(s: &str) -> Option<String> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None
    }
}

/// Parses an env var, falling back to `default` when unset or garbage
fn env_or<T: FromStr>(s: &str, default: T) -> T {
    env_opt(s)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(s: &str, default: bool) -> bool {
    match env_opt(s).as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default
    }
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

/// Parses and checks a catalog base url, adds the trailing slash that
/// `Url::join` needs to keep the last path segment
fn catalog_url(var: &str, default: &str, expected_host: &str) ->
    Result<Url, IngestError> {
    let raw = env_opt(var).unwrap_or_else(|| default.to_string());
    let mut url = Url::parse(&raw)
        .map_err(|e| IngestError::Config(format!("{var} invalid {e}")))?;

    ensure_https(&url).map_err(IngestError::Config)?;
    ensure_host(&url, expected_host).map_err(IngestError::Config)?;

    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
    Ok(url)
}

/// User agent sent to every catalog, Discogs rejects requests without one
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub user_agent: String,
}

fn build_identity() -> IdentityConfig {
    let user_agent = env_opt("APP_USER_AGENT").unwrap_or_else(|| {
        format!("album-ingest/{}", env!("CARGO_PKG_VERSION"))
    });
    IdentityConfig { user_agent }
}

/// Configuration that Spotify expects when hitting endpoints
#[derive(Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: Url,
    pub api_base: Url,
    pub market: Option<String>,
    pub max_concurrency: usize
}

impl std::fmt::Debug for SpotifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url.as_str())
            .field("api_base", &self.api_base.as_str())
            .field("market", &self.market)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

/// Returns `None` when no Spotify credentials are set at all, a config
/// error when only half of them are
fn build_spotify() -> Result<Option<SpotifyConfig>, IngestError> {
    let (client_id, client_secret) = match (
        env_opt("SPOTIFY_CLIENT_ID"), env_opt("SPOTIFY_CLIENT_SECRET")
    ) {
        (Some(id), Some(secret)) => (id, secret),
        (None, None) => return Ok(None),
        _ => return Err(IngestError::Config(
            "SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET must be set together".into()
        ))
    };

    let token_url = env_opt("SPOTIFY_TOKEN_URL")
        .unwrap_or_else(|| "https://accounts.spotify.com/api/token".to_string());
    let token_url = Url::parse(&token_url)
        .map_err(|e| IngestError::Config(format!("SPOTIFY_TOKEN_URL invalid {e}")))?;
    ensure_https(&token_url).map_err(IngestError::Config)?;
    ensure_host(&token_url, "accounts.spotify.com").map_err(IngestError::Config)?;

    let api_base = catalog_url(
        "SPOTIFY_API_BASE", "https://api.spotify.com/v1/", "api.spotify.com"
    )?;

    Ok( Some(SpotifyConfig {
        client_id,
        client_secret,
        token_url,
        api_base,
        market: env_opt("SPOTIFY_MARKET"),
        max_concurrency: env_or("SPOTIFY_CONCURRENCY", 4_usize).max(1)
    }))
}

///
/// Configuration for the Discogs database api
///
#[derive(Clone)]
pub struct DiscogsConfig {
    pub base_url: Url,
    pub token: String,
    pub fetch_release: bool,               // follow search hit to /releases/{id}
    pub min_interval: time::Duration       // 60 req/min when authenticated
}

impl std::fmt::Debug for DiscogsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscogsConfig")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .field("fetch_release", &self.fetch_release)
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

fn build_discogs() -> Result<Option<DiscogsConfig>, IngestError> {
    let Some(token) = env_opt("DISCOGS_TOKEN") else {
        return Ok(None);
    };

    let base_url = catalog_url(
        "DISCOGS_BASE_URL", "https://api.discogs.com/", "api.discogs.com"
    )?;

    Ok( Some(DiscogsConfig {
        base_url,
        token,
        fetch_release: env_flag("DISCOGS_FETCH_RELEASE", true),
        min_interval: time::Duration::from_millis(env_or("DISCOGS_MIN_INTERVAL_MS", 1000_u64))
    }))
}

///
/// Which catalogs enrich albums, and in what order. Later sources win
/// scalar conflicts
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Discogs,
    Spotify
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Discogs => "discogs",
            SourceKind::Spotify => "spotify"
        }
    }
    pub fn parse(s: &str) -> Option<SourceKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discogs" => Some(SourceKind::Discogs),
            "spotify" => Some(SourceKind::Spotify),
            _ => None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourcesConfig {
    pub order: Vec<SourceKind>
}

fn parse_source_order(raw: &str) -> Result<Vec<SourceKind>, IngestError> {
    let mut order = Vec::new();
    for name in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let kind = SourceKind::parse(name).ok_or_else(|| IngestError::Config(
            format!("unknown source in ENRICH_SOURCES: {name}")
        ))?;
        if !order.contains(&kind) {
            order.push(kind);
        }
    }
    Ok(order)
}

fn build_sources() -> Result<SourcesConfig, IngestError> {
    let raw = env_opt("ENRICH_SOURCES").unwrap_or_else(|| DEFAULT_SOURCES.to_string());
    Ok( SourcesConfig { order: parse_source_order(&raw)? } )
}

///
/// Configuration for Http timeouts, retries, etc.
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u8,
    pub base_backoff: time::Duration,
    pub max_backoff: time::Duration,
    pub jitter: bool,
    pub retryable_statuses: Vec<u16>
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_backoff: time::Duration::from_millis(RETRY_BASE_BACKOFF),
            max_backoff: time::Duration::from_millis(RETRY_MAX_BACKOFF),
            jitter: RETRY_JITTER,
            retryable_statuses: RETRYABLE_STATUSES.to_vec()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
    pub retry: RetryConfig
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
            retry: RetryConfig::default()
        }
    }
}

fn build_http() -> HttpConfig {
    let defaults = HttpConfig::default();
    let retry = RetryConfig {
        max_attempts: env_or("HTTP_RETRY_ATTEMPTS", RETRY_MAX_ATTEMPTS),
        base_backoff: time::Duration::from_millis(
            env_or("HTTP_RETRY_BACKOFF_MS", RETRY_BASE_BACKOFF)
        ),
        ..RetryConfig::default()
    };
    HttpConfig {
        timeout: time::Duration::from_millis(env_or("HTTP_TIMEOUT_MS", HTTP_TIMEOUT)),
        retry,
        ..defaults
    }
}

///
/// Rules for how many albums and catalog calls run at once
///
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub max_inflight_albums: usize,
    pub source_timeout: time::Duration  // whole fetch incl. retries, per source
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_inflight_albums: 8,
            source_timeout: time::Duration::from_secs(60)
        }
    }
}

fn build_concurrency() -> ConcurrencyConfig {
    let defaults = ConcurrencyConfig::default();
    ConcurrencyConfig {
        max_inflight_albums: env_or("MAX_INFLIGHT_ALBUMS", defaults.max_inflight_albums)
            .max(1),
        source_timeout: time::Duration::from_millis(
            env_or("SOURCE_TIMEOUT_MS", defaults.source_timeout.as_millis() as u64)
        )
    }
}

///
/// Configuration for persistent storage in sqlite db and raw payloads
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String,
    pub archive_raw: bool,
    pub raw_store_root: String,
    pub raw_compression_level: i32
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:./data/albums.db".to_string(),
            archive_raw: false,
            raw_store_root: "./data".to_string(),
            raw_compression_level: 3
        }
    }
}

fn build_persistence() -> PersistenceConfig {
    let defaults = PersistenceConfig::default();
    PersistenceConfig {
        db_url: env_opt("DATABASE_URL").unwrap_or(defaults.db_url),
        archive_raw: env_flag("ARCHIVE_RAW", defaults.archive_raw),
        raw_store_root: env_opt("RAW_STORE_ROOT").unwrap_or(defaults.raw_store_root),
        raw_compression_level: env_or("RAW_ZSTD_LEVEL", defaults.raw_compression_level)
    }
}

///
/// Configuration for the vector index used by search
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    Hashing,
    /// ONNX model, only available with the `embeddings` feature
    FastEmbed
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub db_url: String,
    pub collection: String,
    pub embedder: EmbedderKind,
    pub dimensions: usize,
    pub min_score: f32
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:./data/vectors.db".to_string(),
            collection: "albums".to_string(),
            embedder: EmbedderKind::Hashing,
            dimensions: 384,
            min_score: 0.0
        }
    }
}

fn build_index() -> IndexConfig {
    let defaults = IndexConfig::default();
    let embedder = match env_opt("VECTOR_EMBEDDER").as_deref() {
        Some("fastembed") => EmbedderKind::FastEmbed,
        _ => defaults.embedder
    };
    IndexConfig {
        db_url: env_opt("VECTOR_DATABASE_URL").unwrap_or(defaults.db_url),
        collection: env_opt("VECTOR_COLLECTION").unwrap_or(defaults.collection),
        embedder,
        dimensions: env_or("VECTOR_DIMENSIONS", defaults.dimensions).max(8),
        min_score: env_or("VECTOR_MIN_SCORE", defaults.min_score)
    }
}

///
/// Configuration for Logger
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,album_ingest=debug,sqlx=warn,reqwest=warn".to_string(),
            format: LogFormat::Json,
            with_ansi: false,
            include_file_line: true,
            include_target: true
        }
    }
}

fn build_logging() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    let format = match env_opt("LOG_FORMAT").as_deref() {
        Some("pretty") => LogFormat::Pretty,
        _ => defaults.format
    };
    LoggingConfig {
        filter_directives: env_opt("LOG_FILTER").unwrap_or(defaults.filter_directives),
        format,
        with_ansi: env_flag("LOG_ANSI", format == LogFormat::Pretty),
        ..defaults
    }
}

///
/// AppConfig which holds everything the pipeline needs
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub spotify: Option<SpotifyConfig>,
    pub discogs: Option<DiscogsConfig>,
    pub sources: SourcesConfig,
    pub http: HttpConfig,
    pub concurrency: ConcurrencyConfig,
    pub persistence: PersistenceConfig,
    pub index: IndexConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, IngestError> {
    dotenvy::dotenv().ok();

    let identity    = build_identity();
    let spotify     = build_spotify()?;
    let discogs     = build_discogs()?;
    let sources     = build_sources()?;
    let http        = build_http();
    let concurrency = build_concurrency();
    let persistence = build_persistence();
    let index       = build_index();
    let logging     = build_logging();

    Ok( AppConfig {
        identity, spotify, discogs, sources, http,
        concurrency, persistence, index, logging
    } )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_and_host_checks() {
        let good = Url::parse("https://api.discogs.com/").unwrap();
        assert!(ensure_https(&good).is_ok());
        assert!(ensure_host(&good, "api.discogs.com").is_ok());
        assert!(ensure_host(&good, "API.DISCOGS.COM").is_ok());

        let plain = Url::parse("http://api.discogs.com/").unwrap();
        assert!(ensure_https(&plain).is_err());

        let other = Url::parse("https://evil.example.com/").unwrap();
        assert!(ensure_host(&other, "api.discogs.com").is_err());
    }

    #[test]
    fn source_order_keeps_first_mention() {
        let order = parse_source_order("spotify, discogs,spotify").unwrap();
        assert_eq!(order, vec![SourceKind::Spotify, SourceKind::Discogs]);

        let order = parse_source_order(DEFAULT_SOURCES).unwrap();
        assert_eq!(order, vec![SourceKind::Discogs, SourceKind::Spotify]);

        assert!(parse_source_order("").unwrap().is_empty());
        assert!(matches!(
            parse_source_order("discogs,lastfm"),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn secrets_stay_out_of_debug_output() {
        let cfg = DiscogsConfig {
            base_url: Url::parse("https://api.discogs.com/").unwrap(),
            token: "very-secret".into(),
            fetch_release: true,
            min_interval: time::Duration::from_millis(1000)
        };
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("very-secret"));
        assert!(printed.contains("<redacted>"));
    }
}
