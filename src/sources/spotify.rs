//!
//! src/sources/spotify.rs  Andrew Belles  Oct 4th, 2025
//!
//! Spotify web api source. Client-credentials token is cached until just
//! before it expires; in-flight lookups are capped by a semaphore
//!

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::album::{non_empty, AlbumPatch, Track, TrackPosition};
use crate::config::{HttpConfig, IdentityConfig, RetryConfig, SpotifyConfig};
use crate::errors::{IngestError, SourceError};
use crate::fetch::{http_with_retry, SpotifyClient};
use crate::sink::{DiskZstdSink, RawType};
use crate::sources::{archive_payload, AlbumSource};

const SOURCE: &str = "spotify";
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    refresh_at: Instant
}

impl CachedToken {
    fn from_response(v: &Value, now: Instant) -> Result<Self, SourceError> {
        let bearer = non_empty(v.get("access_token").and_then(Value::as_str))
            .ok_or_else(|| SourceError::Fatal("token response without access_token".into()))?;
        let expires_in = Duration::from_secs(
            v.get("expires_in").and_then(Value::as_u64).unwrap_or(3600)
        );
        Ok( Self {
            bearer,
            refresh_at: now + expires_in.saturating_sub(TOKEN_SLACK)
        })
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_at
    }
}

pub struct SpotifySource {
    client: SpotifyClient,
    retry: RetryConfig,
    token: Mutex<Option<CachedToken>>,
    permits: Semaphore,
    archive: Option<Arc<DiskZstdSink>>
}

impl SpotifySource {
    pub fn new(
        http: &HttpConfig,
        identity: &IdentityConfig,
        cfg: &SpotifyConfig,
        archive: Option<Arc<DiskZstdSink>>
    ) -> Result<Self, IngestError> {
        Ok( Self {
            client: SpotifyClient::new(http, identity, cfg)?,
            retry: http.retry.clone(),
            token: Mutex::new(None),
            permits: Semaphore::new(cfg.max_concurrency.max(1)),
            archive
        })
    }

    /// Returns the cached bearer, refreshing it when close to expiry.
    /// The lock is held across the refresh so only one task asks for it
    async fn bearer(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Instant::now())) {
            return Ok(token.bearer.clone());
        }

        let response = http_with_retry(self.client.token_request(), &self.retry).await?
            .ok_or_else(|| SourceError::Fatal("token endpoint not found".into()))?;
        let token = CachedToken::from_response(&response, Instant::now())?;
        debug!(refresh_in = ?token.refresh_at.saturating_duration_since(Instant::now()),
            "spotify.token_refreshed");

        let bearer = token.bearer.clone();
        *cached = Some(token);
        Ok(bearer)
    }
}

#[async_trait]
impl AlbumSource for SpotifySource {
    fn name(&self) -> &str { SOURCE }

    async fn fetch(&self, artist: &str, title: &str) ->
        Result<Option<AlbumPatch>, SourceError> {
        let _permit = self.permits.acquire().await
            .map_err(|_| SourceError::Fatal("spotify limiter closed".into()))?;
        let bearer = self.bearer().await?;

        let search = self.client.search_album(artist, title, 1, &bearer)?;
        let Some(found) = http_with_retry(search, &self.retry).await? else {
            return Ok(None);
        };
        let Some(hit) = found.pointer("/albums/items/0") else {
            debug!(artist, title, "spotify.no_results");
            return Ok(None);
        };
        let album_id = hit.get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SourceError::Fatal("search hit without id".into()))?;

        // search hits are simplified albums, the full object has tracks,
        // genres, label and popularity
        let full = http_with_retry(self.client.album(album_id, &bearer)?, &self.retry).await?;
        let payload = full.as_ref().unwrap_or(hit);
        archive_payload(self.archive.as_deref(), RawType::SpotifyAlbum, album_id, payload);

        Ok(Some(album_to_patch(payload)))
    }
}

/// Year from "YYYY", "YYYY-MM" or "YYYY-MM-DD", unknown on anything else
pub fn parse_year(release_date: &str) -> Option<i32> {
    let year = release_date.trim().split('-').next()?;
    if year.is_empty() || !year.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    year.parse::<i32>().ok().filter(|y| *y > 0)
}

fn tracks(v: Option<&Value>) -> Vec<Track> {
    let Some(items) = v.and_then(Value::as_array) else {
        return Vec::new();
    };
    let multi_disc = items.iter()
        .any(|t| t.get("disc_number").and_then(Value::as_u64).unwrap_or(1) > 1);

    items.iter()
        .filter_map(|t| Some((t, non_empty(t.get("name").and_then(Value::as_str))?)))
        .enumerate()
        .map(|(i, (t, title))| {
            let number = t.get("track_number")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or_else(|| u32::try_from(i + 1).unwrap_or(u32::MAX));
            let position = if multi_disc {
                let disc = t.get("disc_number").and_then(Value::as_u64).unwrap_or(1);
                TrackPosition::Label(format!("{disc}-{number}"))
            } else {
                TrackPosition::Number(number)
            };
            let duration = t.get("duration_ms")
                .and_then(Value::as_u64)
                .and_then(|ms| u32::try_from(ms.saturating_add(500) / 1000).ok());
            Track::new(position, title, duration)
        })
        .collect()
}

/// Maps a full or simplified album object
pub fn album_to_patch(album: &Value) -> AlbumPatch {
    let mut patch = AlbumPatch {
        title: non_empty(album.get("name").and_then(Value::as_str)),
        artist: non_empty(album.pointer("/artists/0/name").and_then(Value::as_str)),
        year: album.get("release_date").and_then(Value::as_str).and_then(parse_year),
        genres: album.get("genres")
            .and_then(Value::as_array)
            .map(|g| g.iter().filter_map(|s| non_empty(s.as_str())).collect())
            .unwrap_or_default(),
        labels: non_empty(album.get("label").and_then(Value::as_str))
            .into_iter()
            .collect::<BTreeSet<_>>(),
        popularity: album.get("popularity")
            .and_then(Value::as_i64)
            .and_then(|p| i32::try_from(p).ok()),
        tracklist: tracks(album.pointer("/tracks/items")),
        ..AlbumPatch::default()
    };

    if let Some(urls) = album.get("external_urls").and_then(Value::as_object) {
        for (k, v) in urls {
            if let Some(url) = non_empty(v.as_str()) {
                patch.external_urls.insert(k.clone(), url);
            }
        }
    }

    if let Some(id) = non_empty(album.get("id").and_then(Value::as_str)) {
        patch.album_id = Some(format!("{SOURCE}_{id}"));
        patch.external_urls.entry(SOURCE.to_string())
            .or_insert_with(|| format!("https://open.spotify.com/album/{id}"));
        patch.external_ids.insert(SOURCE.to_string(), id);
    }
    patch
}
