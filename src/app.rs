//!
//! src/app.rs  Andrew Belles  Oct 9th, 2025
//!
//! Wires config into sources, reconciler, stores and the batch runner
//! for each cli command
//!

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::album::Album;
use crate::batch::BatchProcessor;
use crate::config::AppConfig;
use crate::errors::IngestError;
use crate::gateway::AlbumSearch;
use crate::index::{build_embedder, VectorIndex};
use crate::loader;
use crate::persistent::AlbumRepository;
use crate::reconcile::Reconciler;
use crate::sources::build_sources;

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub file: PathBuf,
    pub enrich: bool,
    pub store: bool,
    pub index: bool,
    pub export: Option<PathBuf>
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub loaded: usize,
    pub rejected: usize,
    pub processed: usize,
    pub failed: usize
}

/// Creates the directory of a file-backed sqlite url, sqlite only
/// creates the file itself
fn ensure_sqlite_dir(url: &str) -> Result<(), IngestError> {
    if url.contains(":memory:") {
        return Ok(());
    }
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return Ok(());
    };
    let path = rest.trim_start_matches("//");
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub struct App {
    cfgs: AppConfig
}

impl App {
    pub fn new(cfgs: AppConfig) -> Self {
        Self { cfgs }
    }

    fn reconciler(&self) -> Result<Arc<Reconciler>, IngestError> {
        let sources = build_sources(&self.cfgs)?;
        if sources.is_empty() {
            warn!("enrich.no_sources");
        }
        let reconciler = Reconciler::new(sources, self.cfgs.concurrency.source_timeout);
        info!(sources = ?reconciler.source_names(), "enrich.ready");
        Ok(Arc::new(reconciler))
    }

    async fn repository(&self) -> Result<AlbumRepository, IngestError> {
        ensure_sqlite_dir(&self.cfgs.persistence.db_url)?;
        AlbumRepository::init(&self.cfgs.persistence.db_url).await
    }

    async fn vector_index(&self) -> Result<VectorIndex, IngestError> {
        ensure_sqlite_dir(&self.cfgs.index.db_url)?;
        let embedder = build_embedder(&self.cfgs.index)?;
        VectorIndex::init(&self.cfgs.index, embedder).await
    }

    pub async fn ingest(&self, opts: &IngestOptions) -> Result<IngestSummary, IngestError> {
        let report = loader::read_albums(&opts.file)?;
        let loaded = report.albums.len();

        let mut processor = BatchProcessor::new(self.cfgs.concurrency.max_inflight_albums);
        if opts.enrich {
            processor = processor.with_reconciler(self.reconciler()?);
        }
        if opts.store {
            processor = processor.with_store(Arc::new(self.repository().await?));
        }
        if opts.index {
            processor = processor.with_indexer(Arc::new(self.vector_index().await?));
        }

        let albums = processor.process(report.albums).await;

        if let Some(out) = &opts.export {
            loader::save_albums(out, &albums)?;
        }

        Ok( IngestSummary {
            loaded,
            rejected: report.rejected.len(),
            processed: albums.len(),
            failed: loaded - albums.len()
        })
    }

    pub async fn search(&self, query: &str, top_k: usize) ->
        Result<Vec<(Album, f32)>, IngestError> {
        self.vector_index().await?.search(query, top_k).await
    }

    pub async fn show(&self, album_id: &str) -> Result<Album, IngestError> {
        self.repository().await?
            .get_album(album_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("album {album_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ConcurrencyConfig, HttpConfig, IdentityConfig, IndexConfig, LoggingConfig,
        PersistenceConfig, SourcesConfig
    };

    fn offline_config(dir: &Path) -> AppConfig {
        AppConfig {
            identity: IdentityConfig { user_agent: "album-ingest-test/0".into() },
            spotify: None,
            discogs: None,
            sources: SourcesConfig { order: Vec::new() },
            http: HttpConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            persistence: PersistenceConfig {
                db_url: format!("sqlite:{}", dir.join("db/albums.db").display()),
                ..PersistenceConfig::default()
            },
            index: IndexConfig {
                db_url: format!("sqlite:{}", dir.join("db/vectors.db").display()),
                ..IndexConfig::default()
            },
            logging: LoggingConfig::default()
        }
    }

    #[test]
    fn sqlite_dirs_are_derived_from_urls() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/albums.db");
        ensure_sqlite_dir(&format!("sqlite://{}?mode=rwc", nested.display())).unwrap();
        assert!(dir.path().join("a/b").is_dir());

        ensure_sqlite_dir("sqlite::memory:").unwrap();
    }

    #[tokio::test]
    async fn ingest_store_index_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("albums.json");
        std::fs::write(&input, r#"[
            { "id": 1, "album": "Kind Of Blue", "artist": "Miles Davis", "year": 1959,
              "genres": ["Jazz"] },
            { "id": 2, "album": "Blue", "artist": "Joni Mitchell", "year": 1971,
              "genres": ["Folk"] },
            { "album": "No Id", "artist": "Nobody", "year": 2000 }
        ]"#).unwrap();

        let app = App::new(offline_config(dir.path()));
        let export = dir.path().join("out/albums.json");
        let summary = app.ingest(&IngestOptions {
            file: input,
            enrich: true,
            store: true,
            index: true,
            export: Some(export.clone())
        }).await.unwrap();

        assert_eq!(summary, IngestSummary { loaded: 2, rejected: 1, processed: 2, failed: 0 });

        let shown = app.show("1").await.unwrap();
        assert_eq!(shown.title(), "Kind Of Blue");
        assert!(matches!(app.show("99").await, Err(IngestError::NotFound(_))));

        let hits = app.search("miles davis jazz", 1).await.unwrap();
        assert_eq!(hits[0].0.album_id(), "1");

        let exported = loader::read_albums(&export).unwrap();
        assert_eq!(exported.albums.len(), 2);
    }
}
