//!
//! src/reconcile.rs  Andrew Belles  Oct 5th, 2025
//!
//! Fans one album out to every configured source at once and folds the
//! answers into a new album. Answers are applied in source order, never
//! in the order they arrive, so later sources win scalar conflicts
//!

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::album::{Album, AlbumPatch};
use crate::errors::{SourceError, ValidationError};
use crate::sources::AlbumSource;

/// What one source said about one album
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Found(AlbumPatch),
    NotFound,
    Failed(SourceError)
}

impl SourceOutcome {
    pub fn patch(&self) -> Option<&AlbumPatch> {
        match self {
            SourceOutcome::Found(patch) => Some(patch),
            _ => None
        }
    }
}

pub struct Reconciler {
    sources: Vec<Arc<dyn AlbumSource>>,
    source_timeout: Duration
}

impl Reconciler {
    pub fn new(sources: Vec<Arc<dyn AlbumSource>>, source_timeout: Duration) -> Self {
        Self { sources, source_timeout }
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Queries every source concurrently. Outcomes come back in source
    /// order whatever order the calls finish in
    pub async fn fetch_all(&self, album: &Album) -> Vec<SourceOutcome> {
        let calls = self.sources.iter()
            .map(|source| self.fetch_one(source.as_ref(), album));
        join_all(calls).await
    }

    async fn fetch_one(&self, source: &dyn AlbumSource, album: &Album) -> SourceOutcome {
        let call = source.fetch(album.artist(), album.title());
        let result = match timeout(self.source_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Transient(
                format!("no answer within {}ms", self.source_timeout.as_millis())
            ))
        };

        match result {
            Ok(Some(patch)) => {
                debug!(album_id = album.album_id(), source = source.name(), "source.found");
                SourceOutcome::Found(patch)
            },
            Ok(None) => {
                debug!(album_id = album.album_id(), source = source.name(), "source.not_found");
                SourceOutcome::NotFound
            },
            Err(e) => {
                warn!(
                    album_id = album.album_id(),
                    source = source.name(),
                    kind = e.kind(),
                    error = %e,
                    "source.failed"
                );
                SourceOutcome::Failed(e)
            }
        }
    }

    /// Builds the enriched album. Source failures never fail this call,
    /// an out-of-range value coming from a source does
    pub async fn enrich(&self, album: &Album) -> Result<Album, ValidationError> {
        debug!(album_id = album.album_id(), sources = self.sources.len(), "enrich.start");
        let outcomes = self.fetch_all(album).await;
        merge(album, outcomes)
    }
}

/// Folds outcomes into `base` in iteration order. Returns `base`
/// untouched when no outcome carries anything
pub fn merge(
    base: &Album,
    outcomes: impl IntoIterator<Item = SourceOutcome>
) -> Result<Album, ValidationError> {
    let mut draft = base.to_fields();
    let mut applied = 0_usize;

    for outcome in outcomes {
        if let SourceOutcome::Found(patch) = outcome {
            if patch.is_empty() {
                continue;
            }
            draft.apply(&patch);
            applied += 1;
        }
    }

    if applied == 0 {
        return Ok(base.clone());
    }
    Album::new(draft)
}
