//!
//! src/sources/discogs.rs  Andrew Belles  Oct 4th, 2025
//!
//! Discogs database source. A search picks the best release for
//! (artist, title), the full release document supplies tracklist and
//! credits. Calls are spaced by a rate gate, Discogs allows 60/min
//!

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::album::{non_empty, AlbumPatch, Track, TrackPosition};
use crate::config::{DiscogsConfig, HttpConfig, IdentityConfig, RetryConfig};
use crate::errors::{IngestError, SourceError};
use crate::fetch::{http_with_retry, DiscogsClient, RateGate};
use crate::sink::{DiskZstdSink, RawType};
use crate::sources::{archive_payload, AlbumSource};

const SOURCE: &str = "discogs";
const SITE: &str = "https://www.discogs.com";

pub struct DiscogsSource {
    client: DiscogsClient,
    retry: RetryConfig,
    gate: RateGate,
    archive: Option<Arc<DiskZstdSink>>
}

impl DiscogsSource {
    pub fn new(
        http: &HttpConfig,
        identity: &IdentityConfig,
        cfg: &DiscogsConfig,
        archive: Option<Arc<DiskZstdSink>>
    ) -> Result<Self, IngestError> {
        Ok( Self {
            client: DiscogsClient::new(http, identity, cfg)?,
            retry: http.retry.clone(),
            gate: RateGate::new(cfg.min_interval),
            archive
        })
    }

    async fn get(&self, request: reqwest::RequestBuilder) ->
        Result<Option<Value>, SourceError> {
        self.gate.wait().await;
        http_with_retry(request, &self.retry).await
    }
}

#[async_trait]
impl AlbumSource for DiscogsSource {
    fn name(&self) -> &str { SOURCE }

    async fn fetch(&self, artist: &str, title: &str) ->
        Result<Option<AlbumPatch>, SourceError> {
        let Some(found) = self.get(self.client.search_release(artist, title, 1, 1)?).await? else {
            return Ok(None);
        };
        let Some(hit) = found.pointer("/results/0") else {
            debug!(artist, title, "discogs.no_results");
            return Ok(None);
        };
        let release_id = hit.get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| SourceError::Fatal("search hit without id".to_string()))?;

        if self.client.cfg.fetch_release {
            if let Some(release) = self.get(self.client.release(release_id)?).await? {
                archive_payload(
                    self.archive.as_deref(), RawType::DiscogsRelease,
                    &release_id.to_string(), &release
                );
                return Ok(Some(release_to_patch(&release)));
            }
            debug!(release_id, "discogs.release_missing");
        }
        Ok(Some(search_hit_to_patch(hit)))
    }
}

/// "Artist - Title" search titles, split on the first separator
pub fn parse_title(raw: &str) -> (Option<String>, String) {
    match raw.split_once(" - ") {
        Some((artist, title)) => (non_empty(Some(artist)), title.trim().to_string()),
        None => (None, raw.trim().to_string())
    }
}

/// Drops the numeric suffix Discogs uses to tell namesakes apart,
/// "Nirvana (2)" -> "Nirvana"
pub fn strip_disambiguation(name: &str) -> String {
    let name = name.trim();
    if let Some(open) = name.rfind(" (") {
        let inner = &name[open + 2..];
        if let Some(digits) = inner.strip_suffix(')') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return name[..open].trim_end().to_string();
            }
        }
    }
    name.to_string()
}

/// "m:ss" or "h:mm:ss" into seconds
pub fn parse_duration(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.split(':').try_fold(0_u32, |acc, part| {
        let n = part.trim().parse::<u32>().ok()?;
        acc.checked_mul(60)?.checked_add(n)
    })
}

fn year_of(v: Option<&Value>) -> Option<i32> {
    let year = match v? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None
    };
    // discogs reports unknown years as 0
    (year > 0).then_some(year).and_then(|y| i32::try_from(y).ok())
}

fn strings(v: Option<&Value>) -> BTreeSet<String> {
    v.and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|s| non_empty(s.as_str())).collect())
        .unwrap_or_default()
}

fn names(v: Option<&Value>) -> BTreeSet<String> {
    v.and_then(Value::as_array)
        .map(|arr| arr.iter()
            .filter_map(|o| non_empty(o.get("name").and_then(Value::as_str)))
            .collect())
        .unwrap_or_default()
}

fn tracks(v: Option<&Value>) -> Vec<Track> {
    let Some(items) = v.and_then(Value::as_array) else {
        return Vec::new();
    };
    items.iter()
        .filter(|t| matches!(t.get("type_").and_then(Value::as_str), None | Some("track")))
        .filter_map(|t| {
            let title = non_empty(t.get("title").and_then(Value::as_str))?;
            Some((t, title))
        })
        .enumerate()
        .map(|(i, (t, title))| {
            let position = non_empty(t.get("position").and_then(Value::as_str))
                .map(TrackPosition::Label)
                .unwrap_or(TrackPosition::Number(i as u32 + 1));
            let duration = t.get("duration").and_then(Value::as_str).and_then(parse_duration);
            Track::new(position, title, duration)
        })
        .collect()
}

/// "Name (Role)" for every extra artist, joined
fn credits(v: Option<&Value>) -> Option<String> {
    let people = v.and_then(Value::as_array)?
        .iter()
        .filter_map(|p| {
            let name = strip_disambiguation(p.get("name").and_then(Value::as_str)?);
            if name.is_empty() {
                return None;
            }
            Some(match non_empty(p.get("role").and_then(Value::as_str)) {
                Some(role) => format!("{name} ({role})"),
                None => name
            })
        })
        .collect::<Vec<_>>();
    (!people.is_empty()).then(|| people.join(", "))
}

fn site_url(uri: Option<&str>) -> Option<String> {
    let uri = non_empty(uri)?;
    if uri.starts_with('/') {
        Some(format!("{SITE}{uri}"))
    } else {
        Some(uri)
    }
}

fn identify(patch: &mut AlbumPatch, payload: &Value) {
    let id = match payload.get("id") {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) => non_empty(Some(s.as_str())),
        _ => None
    };
    if let Some(id) = id {
        patch.album_id = Some(format!("{SOURCE}_{id}"));
        patch.external_ids.insert(SOURCE.to_string(), id);
    }
    if let Some(url) = site_url(payload.get("uri").and_then(Value::as_str)) {
        patch.external_urls.insert(SOURCE.to_string(), url);
    }
}

/// Maps an entry of `/database/search` results
pub fn search_hit_to_patch(hit: &Value) -> AlbumPatch {
    let (artist, title) = hit.get("title")
        .and_then(Value::as_str)
        .map(parse_title)
        .map(|(a, t)| (a, non_empty(Some(t.as_str()))))
        .unwrap_or((None, None));

    let mut patch = AlbumPatch {
        title,
        artist: artist.map(|a| strip_disambiguation(&a)),
        year: year_of(hit.get("year")),
        genres: strings(hit.get("genre")),
        styles: strings(hit.get("style")),
        labels: strings(hit.get("label")),
        country: non_empty(hit.get("country").and_then(Value::as_str)),
        ..AlbumPatch::default()
    };
    identify(&mut patch, hit);
    patch
}

/// Maps a `/releases/{id}` document
pub fn release_to_patch(release: &Value) -> AlbumPatch {
    let artist = release.pointer("/artists/0/name")
        .and_then(Value::as_str)
        .map(strip_disambiguation)
        .filter(|a| !a.is_empty());

    let mut patch = AlbumPatch {
        title: non_empty(release.get("title").and_then(Value::as_str)),
        artist,
        year: year_of(release.get("year")),
        genres: strings(release.get("genres")),
        styles: strings(release.get("styles")),
        labels: names(release.get("labels")),
        country: non_empty(release.get("country").and_then(Value::as_str)),
        tracklist: tracks(release.get("tracklist")),
        credits: credits(release.get("extraartists")),
        ..AlbumPatch::default()
    };
    identify(&mut patch, release);
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use serde_json::json;

    fn release_fixture() -> Value {
        json!({
            "id": 1434225,
            "title": "Kind Of Blue",
            "artists": [{ "name": "Miles Davis (2)", "id": 23755 }],
            "year": 1959,
            "genres": ["Jazz"],
            "styles": ["Modal", "Cool Jazz"],
            "labels": [{ "name": "Columbia", "catno": "CL 1355" }, { "name": "" }],
            "country": "US",
            "uri": "https://www.discogs.com/release/1434225-Miles-Davis-Kind-Of-Blue",
            "tracklist": [
                { "position": "", "type_": "heading", "title": "Side One" },
                { "position": "A1", "type_": "track", "title": "So What", "duration": "9:22" },
                { "position": "A2", "type_": "track", "title": "Freddie Freeloader", "duration": "" },
                { "position": "B1", "type_": "track", "title": "", "duration": "5:37" },
                { "position": "B3", "type_": "track", "title": "Flamenco Sketches", "duration": "1:09:26" }
            ],
            "extraartists": [
                { "name": "John Coltrane", "role": "Tenor Saxophone" },
                { "name": "Bill Evans (3)", "role": "Piano" },
                { "name": "Teo Macero", "role": "" }
            ]
        })
    }

    #[test]
    fn titles_split_on_first_separator() {
        assert_eq!(
            parse_title("Miles Davis - Kind Of Blue"),
            (Some("Miles Davis".to_string()), "Kind Of Blue".to_string())
        );
        assert_eq!(
            parse_title("Sonic Youth - Daydream Nation - Deluxe"),
            (Some("Sonic Youth".to_string()), "Daydream Nation - Deluxe".to_string())
        );
        assert_eq!(parse_title("Untitled"), (None, "Untitled".to_string()));
    }

    #[test]
    fn disambiguation_suffix_is_stripped() {
        assert_eq!(strip_disambiguation("Nirvana (2)"), "Nirvana");
        assert_eq!(strip_disambiguation("Prince (12) "), "Prince");
        assert_eq!(strip_disambiguation("Love (Band)"), "Love (Band)");
        assert_eq!(strip_disambiguation("Chic"), "Chic");
    }

    #[test]
    fn durations_become_seconds() {
        assert_eq!(parse_duration("9:22"), Some(562));
        assert_eq!(parse_duration("1:09:26"), Some(4166));
        assert_eq!(parse_duration("45"), Some(45));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("n/a"), None);
        assert_eq!(parse_duration("99999999:99"), None);
        assert_eq!(parse_duration("4294967295:0"), None);
    }

    #[test]
    fn release_maps_onto_patch() {
        let patch = release_to_patch(&release_fixture());

        assert_eq!(patch.album_id.as_deref(), Some("discogs_1434225"));
        assert_eq!(patch.title.as_deref(), Some("Kind Of Blue"));
        assert_eq!(patch.artist.as_deref(), Some("Miles Davis"));
        assert_eq!(patch.year, Some(1959));
        assert!(patch.genres.contains("Jazz"));
        assert_eq!(patch.styles.len(), 2);
        assert_eq!(patch.labels.iter().collect::<Vec<_>>(), vec!["Columbia"]);
        assert_eq!(patch.country.as_deref(), Some("US"));
        assert_eq!(patch.external_ids["discogs"], "1434225");
        assert!(patch.external_urls["discogs"].starts_with("https://www.discogs.com/release/"));

        // heading and untitled rows are skipped
        let titles: Vec<_> = patch.tracklist.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["So What", "Freddie Freeloader", "Flamenco Sketches"]);
        assert_eq!(patch.tracklist[0].position, TrackPosition::Label("A1".into()));
        assert_eq!(patch.tracklist[0].duration, Some(562));
        assert_eq!(patch.tracklist[1].duration, None);

        assert_eq!(
            patch.credits.as_deref(),
            Some("John Coltrane (Tenor Saxophone), Bill Evans (Piano), Teo Macero")
        );
    }

    #[test]
    fn search_hit_maps_onto_patch() {
        let hit = json!({
            "id": 249504,
            "title": "Rick Astley (3) - Never Gonna Give You Up",
            "year": "1987",
            "genre": ["Electronic", "Pop"],
            "style": ["Synth-pop"],
            "label": ["RCA", "BMG"],
            "country": "UK",
            "uri": "/release/249504-Rick-Astley-Never-Gonna-Give-You-Up"
        });
        let patch = search_hit_to_patch(&hit);

        assert_eq!(patch.title.as_deref(), Some("Never Gonna Give You Up"));
        assert_eq!(patch.artist.as_deref(), Some("Rick Astley"));
        assert_eq!(patch.year, Some(1987));
        assert_eq!(patch.labels.len(), 2);
        assert_eq!(
            patch.external_urls["discogs"],
            "https://www.discogs.com/release/249504-Rick-Astley-Never-Gonna-Give-You-Up"
        );
        assert!(patch.tracklist.is_empty());
        assert!(patch.credits.is_none());
    }

    #[test]
    fn unknown_year_is_absent() {
        let patch = search_hit_to_patch(&json!({ "id": 1, "title": "A - B", "year": "0" }));
        assert_eq!(patch.year, None);
        let patch = release_to_patch(&json!({ "id": 1, "title": "B", "year": 0 }));
        assert_eq!(patch.year, None);
    }

    #[tokio::test]
    #[allow(dead_code)]
    async fn discogs_source_testbench() -> Result<(), IngestError> {
        dotenvy::dotenv().ok();

        if std::env::var("LIVE_HTTP").ok().as_deref() != Some("1") {
            eprintln!("Set LIVE_HTTP=1 to run");
            return Ok(())
        }

        let cfgs = config::load_config()?;
        let cfg = cfgs.discogs.as_ref()
            .ok_or_else(|| IngestError::Config("discogs not configured".into()))?;
        let source = DiscogsSource::new(&cfgs.http, &cfgs.identity, cfg, None)?;

        let patch = source.fetch("Miles Davis", "Kind of Blue").await?
            .expect("no discogs match");
        println!("{patch:#?}");
        assert!(patch.genres.contains("Jazz"));
        Ok(())
    }
}
