//!
//! src/album.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Album and track value types. An `Album` can only be built through
//! `Album::new`, which validates every invariant, and is never mutated
//! afterwards. Changes go through an `AlbumFields` draft
//!

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

pub const POPULARITY_MAX: i32 = 100;

/// Ordering key of a track, numeric for streaming catalogs and
/// free-form ("A1", "2-05") for discography catalogs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackPosition {
    Number(u32),
    Label(String)
}

impl fmt::Display for TrackPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackPosition::Number(n) => write!(f, "{n}"),
            TrackPosition::Label(s)  => write!(f, "{s}")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub position: TrackPosition,
    pub title: String,
    /// seconds
    #[serde(default)]
    pub duration: Option<u32>
}

impl Track {
    pub fn new(position: TrackPosition, title: impl Into<String>, duration: Option<u32>)
        -> Self {
        Self { position, title: title.into(), duration }
    }
}

/// Mutable draft of every album field, used as the merge accumulator
/// and as the serialized shape of an album
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumFields {
    pub album_id: String,
    pub title: String,
    pub artist: String,
    pub year: i32,
    #[serde(default)]
    pub genres: BTreeSet<String>,
    #[serde(default)]
    pub styles: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub tracklist: Vec<Track>,
    #[serde(default)]
    pub credits: Option<String>,
    #[serde(default)]
    pub popularity: Option<i32>,
    #[serde(default)]
    pub external_urls: BTreeMap<String, String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>
}

impl AlbumFields {
    pub fn new(
        album_id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        year: i32
    ) -> Self {
        Self {
            album_id: album_id.into(),
            title: title.into(),
            artist: artist.into(),
            year,
            ..Self::default()
        }
    }

    /// Folds one source's payload into the draft.
    ///
    /// Scalars and the tracklist are last-writer-wins, sets are unioned,
    /// maps are merged key-wise. `album_id` is left alone.
    pub fn apply(&mut self, patch: &AlbumPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(artist) = &patch.artist {
            self.artist = artist.clone();
        }
        if let Some(year) = patch.year {
            self.year = year;
        }
        if let Some(country) = &patch.country {
            self.country = Some(country.clone());
        }
        if let Some(credits) = &patch.credits {
            self.credits = Some(credits.clone());
        }
        if let Some(popularity) = patch.popularity {
            self.popularity = Some(popularity);
        }

        self.genres.extend(patch.genres.iter().cloned());
        self.styles.extend(patch.styles.iter().cloned());
        self.labels.extend(patch.labels.iter().cloned());

        for (k, v) in &patch.external_urls {
            self.external_urls.insert(k.clone(), v.clone());
        }
        for (k, v) in &patch.external_ids {
            self.external_ids.insert(k.clone(), v.clone());
        }

        if !patch.tracklist.is_empty() {
            self.tracklist = patch.tracklist.clone();
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }

        let max = chrono::Utc::now().year();
        if self.year < 0 || self.year > max {
            return Err(ValidationError::YearOutOfRange { year: self.year, max });
        }

        if let Some(p) = self.popularity {
            if !(0..=POPULARITY_MAX).contains(&p) {
                return Err(ValidationError::PopularityOutOfRange(p));
            }
        }

        if let Some(track) = self.tracklist.iter().find(|t| t.title.trim().is_empty()) {
            return Err(ValidationError::EmptyTrackTitle {
                position: track.position.to_string()
            });
        }
        Ok(())
    }
}

/// Canonical album entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AlbumFields", into = "AlbumFields")]
pub struct Album {
    fields: AlbumFields
}

impl Album {
    pub fn new(fields: AlbumFields) -> Result<Self, ValidationError> {
        fields.validate()?;
        Ok( Self { fields } )
    }

    /// Copy of the fields, the starting point for a derived album
    pub fn to_fields(&self) -> AlbumFields {
        self.fields.clone()
    }

    pub fn album_id(&self) -> &str { &self.fields.album_id }
    pub fn title(&self) -> &str { &self.fields.title }
    pub fn artist(&self) -> &str { &self.fields.artist }
    pub fn year(&self) -> i32 { self.fields.year }
    pub fn genres(&self) -> &BTreeSet<String> { &self.fields.genres }
    pub fn styles(&self) -> &BTreeSet<String> { &self.fields.styles }
    pub fn labels(&self) -> &BTreeSet<String> { &self.fields.labels }
    pub fn country(&self) -> Option<&str> { self.fields.country.as_deref() }
    pub fn tracklist(&self) -> &[Track] { &self.fields.tracklist }
    pub fn credits(&self) -> Option<&str> { self.fields.credits.as_deref() }
    pub fn popularity(&self) -> Option<i32> { self.fields.popularity }

    pub fn external_urls(&self) -> &BTreeMap<String, String> {
        &self.fields.external_urls
    }

    pub fn external_ids(&self) -> &BTreeMap<String, String> {
        &self.fields.external_ids
    }
}

impl TryFrom<AlbumFields> for Album {
    type Error = ValidationError;

    fn try_from(fields: AlbumFields) -> Result<Self, Self::Error> {
        Album::new(fields)
    }
}

impl From<Album> for AlbumFields {
    fn from(album: Album) -> Self { album.fields }
}

impl fmt::Display for Album {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} by {} released in {}", self.title(), self.artist(), self.year())
    }
}

/// Partial album metadata returned by one catalog.
///
/// `None` scalars and empty collections contribute nothing to a merge.
/// `album_id` is the catalog's own identifier and is never copied onto
/// the merged album
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumPatch {
    pub album_id: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub year: Option<i32>,
    pub genres: BTreeSet<String>,
    pub styles: BTreeSet<String>,
    pub labels: BTreeSet<String>,
    pub country: Option<String>,
    pub tracklist: Vec<Track>,
    pub credits: Option<String>,
    pub popularity: Option<i32>,
    pub external_urls: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>
}

impl AlbumPatch {
    /// True when applying the patch would change nothing
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.year.is_none()
            && self.genres.is_empty()
            && self.styles.is_empty()
            && self.labels.is_empty()
            && self.country.is_none()
            && self.tracklist.is_empty()
            && self.credits.is_none()
            && self.popularity.is_none()
            && self.external_urls.is_empty()
            && self.external_ids.is_empty()
    }
}

/// Trims and drops empty strings coming off catalog payloads
pub(crate) fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
