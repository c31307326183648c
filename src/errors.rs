//!
//! src/errors.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Defines enums and methods of error conversion for the ingester.
//! Source failures and validation failures get their own kinds so the
//! reconciler and batch runner can decide what is fatal for an album
//!
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("invalid album: {0}")]
    Validation(#[from] ValidationError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self { IngestError::Http(e.to_string()) }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self { IngestError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for IngestError {
    fn from(e: sqlx::Error) -> Self { IngestError::Db(e.to_string()) }
}

impl From<url::ParseError> for IngestError {
    fn from(e: url::ParseError) -> Self { IngestError::Config(e.to_string()) }
}

/// Final outcome of a catalog call that did not produce metadata.
/// Not-found is not an error, sources return `Ok(None)` for it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// rate limit, timeout, connection reset, 5xx; retries exhausted
    #[error("transient: {0}")]
    Transient(String),
    /// auth, malformed payload, rejected request
    #[error("fatal: {0}")]
    Fatal(String)
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Transient(_) => "transient",
            SourceError::Fatal(_)     => "fatal"
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("year {year} outside 0..={max}")]
    YearOutOfRange { year: i32, max: i32 },
    #[error("popularity {0} outside 0..=100")]
    PopularityOutOfRange(i32),
    #[error("track at position {position} has no title")]
    EmptyTrackTitle { position: String }
}

/// A raw input record that could not become an `Album`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("record {index} ({}): {reason}", .album_id.as_deref().unwrap_or("no id"))]
pub struct ConversionError {
    pub index: usize,
    pub album_id: Option<String>,
    pub reason: String
}
