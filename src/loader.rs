//!
//! src/loader.rs  Andrew Belles  Oct 6th, 2025
//!
//! Reads album exports into `Album`s and writes albums back out. Each
//! record converts on its own, a bad record lands in the report instead
//! of failing the file
//!

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::album::{non_empty, Album, AlbumFields, Track};
use crate::errors::{ConversionError, IngestError};

/// Ids and years show up as numbers or strings depending on the exporter
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Text(String)
}

impl Scalar {
    fn as_text(&self) -> Option<String> {
        match self {
            Scalar::Int(n) => Some(n.to_string()),
            Scalar::Float(f) if f.fract() == 0.0 => Some(format!("{}", *f as i64)),
            Scalar::Float(f) => Some(f.to_string()),
            Scalar::Text(s) => non_empty(Some(s.as_str()))
        }
    }

    fn as_year(&self) -> Option<i32> {
        let year = match self {
            Scalar::Int(n) => *n,
            Scalar::Float(f) if f.fract() == 0.0 => *f as i64,
            Scalar::Float(_) => return None,
            Scalar::Text(s) => s.trim().parse::<i64>().ok()?
        };
        i32::try_from(year).ok()
    }
}

/// One record as found in the file. Accepts both the loop export shape
/// (`id`, `album`) and our own export shape (`album_id`, `title`)
#[derive(Debug, Deserialize)]
struct RawAlbumRecord {
    #[serde(default, alias = "album_id")]
    id: Option<Scalar>,
    #[serde(default, alias = "album")]
    title: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    year: Option<Scalar>,
    #[serde(default)]
    genres: Option<Vec<String>>,
    #[serde(default)]
    styles: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<Vec<String>>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    tracklist: Option<Vec<Track>>,
    #[serde(default)]
    credits: Option<String>,
    #[serde(default)]
    popularity: Option<i32>,
    #[serde(default)]
    external_urls: Option<BTreeMap<String, String>>,
    #[serde(default)]
    external_ids: Option<BTreeMap<String, String>>
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub albums: Vec<Album>,
    pub rejected: Vec<ConversionError>
}

fn clean_set(items: Option<Vec<String>>) -> std::collections::BTreeSet<String> {
    items.unwrap_or_default()
        .iter()
        .filter_map(|s| non_empty(Some(s.as_str())))
        .collect()
}

fn convert(index: usize, raw: RawAlbumRecord) -> Result<Album, ConversionError> {
    let album_id = raw.id.as_ref().and_then(Scalar::as_text);
    let reject = |reason: String| ConversionError {
        index,
        album_id: album_id.clone(),
        reason
    };

    let id = album_id.clone().ok_or_else(|| reject("missing id".to_string()))?;
    let artist = raw.artist.ok_or_else(|| reject("missing artist".to_string()))?;
    let year = match &raw.year {
        Some(y) => y.as_year().ok_or_else(|| reject(format!("unreadable year {y:?}")))?,
        None => return Err(reject("missing year".to_string()))
    };

    let fields = AlbumFields {
        album_id: id,
        title: raw.title.unwrap_or_default(),
        artist: artist.trim().to_string(),
        year,
        genres: clean_set(raw.genres),
        styles: clean_set(raw.styles),
        labels: clean_set(raw.labels),
        country: non_empty(raw.country.as_deref()),
        tracklist: raw.tracklist.unwrap_or_default(),
        credits: non_empty(raw.credits.as_deref()),
        popularity: raw.popularity,
        external_urls: raw.external_urls.unwrap_or_default(),
        external_ids: raw.external_ids.unwrap_or_default()
    };
    Album::new(fields).map_err(|e| reject(e.to_string()))
}

/// Best effort id for records that did not even deserialize
fn peek_id(v: &Value) -> Option<String> {
    match v.get("id").or_else(|| v.get("album_id"))? {
        Value::String(s) => non_empty(Some(s.as_str())),
        Value::Number(n) => Some(n.to_string()),
        _ => None
    }
}

/// Accepts a top-level array or `{"result": {"albums_loop": [...]}}`
pub fn parse_document(text: &str) -> Result<LoadReport, IngestError> {
    let doc: Value = serde_json::from_str(text)?;
    let records = match doc {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("result")
            .and_then(|mut r| r.get_mut("albums_loop").map(Value::take))
        {
            Some(Value::Array(items)) => items,
            _ => return Err(IngestError::Parse(
                "expected an array or result.albums_loop".to_string()
            ))
        },
        _ => return Err(IngestError::Parse("expected an array or object".to_string()))
    };

    let mut report = LoadReport::default();
    for (index, record) in records.into_iter().enumerate() {
        let id = peek_id(&record);
        let converted = serde_json::from_value::<RawAlbumRecord>(record)
            .map_err(|e| ConversionError { index, album_id: id, reason: e.to_string() })
            .and_then(|raw| convert(index, raw));

        match converted {
            Ok(album) => report.albums.push(album),
            Err(e) => {
                warn!(index = e.index, album_id = ?e.album_id, reason = %e.reason, "load.rejected");
                report.rejected.push(e);
            }
        }
    }
    Ok(report)
}

pub fn read_albums(path: impl AsRef<Path>) -> Result<LoadReport, IngestError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| IngestError::Io(
        std::io::Error::new(e.kind(), format!("read {}: {e}", path.display()))
    ))?;
    let report = parse_document(&text)?;
    info!(
        path = %path.display(),
        loaded = report.albums.len(),
        rejected = report.rejected.len(),
        "load.done"
    );
    Ok(report)
}

/// Writes albums as a pretty json array, replacing `path` atomically
pub fn save_albums(path: impl AsRef<Path>, albums: &[Album]) -> Result<(), IngestError> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new(".")
    };
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut temp, albums)?;
    temp.write_all(b"\n")?;
    temp.persist(path).map_err(|e| IngestError::Io(e.error))?;

    info!(path = %path.display(), albums = albums.len(), "export.done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::TrackPosition;

    #[test]
    fn reads_loop_export() {
        let text = r#"{
            "result": { "albums_loop": [
                { "id": 12, "album": "Blue", "artist": "Joni Mitchell", "year": 1971 },
                { "id": "13", "album": "Hejira", "artist": "Joni Mitchell", "year": "1976",
                  "genres": ["Folk", ""], "country": "" }
            ]}
        }"#;
        let report = parse_document(text).unwrap();

        assert!(report.rejected.is_empty());
        assert_eq!(report.albums.len(), 2);
        assert_eq!(report.albums[0].album_id(), "12");
        assert_eq!(report.albums[0].title(), "Blue");
        assert_eq!(report.albums[1].year(), 1976);
        assert_eq!(report.albums[1].genres().len(), 1);
        assert_eq!(report.albums[1].country(), None);
    }

    #[test]
    fn bad_records_are_reported_not_fatal() {
        let text = r#"[
            { "album_id": "ok", "title": "Fine", "artist": "A", "year": 2001 },
            { "title": "No Id", "artist": "A", "year": 2001 },
            { "id": "no-artist", "title": "T", "year": 2001 },
            { "id": "bad-year", "title": "T", "artist": "A", "year": "soon" },
            { "id": "future", "title": "T", "artist": "A", "year": 3000 },
            { "id": "blank", "title": " ", "artist": "A", "year": 2000 },
            { "id": 7, "title": ["not", "a", "string"], "artist": "A", "year": 2000 },
            "just a string"
        ]"#;
        let report = parse_document(text).unwrap();

        assert_eq!(report.albums.len(), 1);
        assert_eq!(report.albums[0].album_id(), "ok");

        let rejected: Vec<_> = report.rejected.iter()
            .map(|e| (e.index, e.album_id.clone()))
            .collect();
        assert_eq!(rejected, vec![
            (1, None),
            (2, Some("no-artist".to_string())),
            (3, Some("bad-year".to_string())),
            (4, Some("future".to_string())),
            (5, Some("blank".to_string())),
            (6, Some("7".to_string())),
            (7, None),
        ]);
        assert!(report.rejected[0].reason.contains("missing id"));
    }

    #[test]
    fn unknown_document_shape_is_an_error() {
        assert!(matches!(parse_document(r#"{"albums": []}"#), Err(IngestError::Parse(_))));
        assert!(matches!(parse_document("42"), Err(IngestError::Parse(_))));
        assert!(matches!(parse_document("not json"), Err(IngestError::Parse(_))));
    }

    #[test]
    fn export_reloads_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/albums.json");

        let mut fields = AlbumFields::new("spotify-1", "Kind Of Blue", "Miles Davis", 1959);
        fields.genres.insert("Jazz".into());
        fields.tracklist = vec![
            Track::new(TrackPosition::Label("A1".into()), "So What", Some(562)),
            Track::new(TrackPosition::Number(2), "Freddie Freeloader", None),
        ];
        fields.popularity = Some(79);
        fields.external_ids.insert("spotify".into(), "1weenld".into());
        let albums = vec![Album::new(fields).unwrap()];

        save_albums(&path, &albums).unwrap();
        let report = read_albums(&path).unwrap();
        assert!(report.rejected.is_empty());
        assert_eq!(report.albums, albums);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_albums(dir.path().join("nope.json")),
            Err(IngestError::Io(_))
        ));
    }
}
