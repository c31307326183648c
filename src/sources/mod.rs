//!
//! src/sources/mod.rs  Andrew Belles  Oct 4th, 2025
//!
//! External catalogs that can enrich an album. Each source maps its own
//! payload into an `AlbumPatch` and owns its retry policy
//!

pub mod discogs;
pub mod spotify;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::album::AlbumPatch;
use crate::config::{AppConfig, SourceKind};
use crate::errors::{IngestError, SourceError};
use crate::sink::{DiskZstdSink, RawType};

pub use discogs::DiscogsSource;
pub use spotify::SpotifySource;

/// One external catalog, keyed by (artist, title).
///
/// `Ok(None)` means the catalog has no match, `Err` means the lookup
/// itself failed after the source's own retries.
#[async_trait]
pub trait AlbumSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, artist: &str, title: &str) ->
        Result<Option<AlbumPatch>, SourceError>;
}

/// Builds every configured source in `ENRICH_SOURCES` order, skipping
/// the ones without credentials
pub fn build_sources(cfgs: &AppConfig) -> Result<Vec<Arc<dyn AlbumSource>>, IngestError> {
    let archive = cfgs.persistence.archive_raw.then(|| Arc::new(DiskZstdSink::new(
        &cfgs.persistence.raw_store_root,
        cfgs.persistence.raw_compression_level
    )));

    let mut sources: Vec<Arc<dyn AlbumSource>> = Vec::new();
    for kind in &cfgs.sources.order {
        match kind {
            SourceKind::Discogs => match &cfgs.discogs {
                Some(cfg) => sources.push(Arc::new(DiscogsSource::new(
                    &cfgs.http, &cfgs.identity, cfg, archive.clone()
                )?)),
                None => warn!(source = kind.as_str(), "sources.disabled")
            },
            SourceKind::Spotify => match &cfgs.spotify {
                Some(cfg) => sources.push(Arc::new(SpotifySource::new(
                    &cfgs.http, &cfgs.identity, cfg, archive.clone()
                )?)),
                None => warn!(source = kind.as_str(), "sources.disabled")
            }
        }
    }
    Ok(sources)
}

/// Archive failures never reach the caller
pub(crate) fn archive_payload(
    archive: Option<&DiskZstdSink>,
    kind: RawType,
    key: &str,
    payload: &Value
) {
    if let Some(sink) = archive {
        if let Err(e) = sink.write_json(kind, key, payload.clone()) {
            warn!(key, error = %e, "archive.failed");
        }
    }
}
