//!
//! src/batch.rs  Andrew Belles  Oct 6th, 2025
//!
//! Runs every album of a batch through enrich -> store -> index as its
//! own task. One album failing is logged and dropped, the rest carry on
//!
//!

use std::collections::HashMap;
use std::sync::Arc;

use tokio::{sync::Semaphore, task::{Id, JoinSet}};
use tracing::{error, info, info_span, warn, Instrument};

use crate::album::Album;
use crate::errors::IngestError;
use crate::gateway::{AlbumIndexer, AlbumStore};
use crate::reconcile::Reconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Admit,
    Enrich,
    Store,
    Index
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Admit  => "admit",
            Stage::Enrich => "enrich",
            Stage::Store  => "store",
            Stage::Index  => "index"
        }
    }
}

#[derive(Debug)]
struct AlbumFailure {
    album_id: String,
    stage: Stage,
    error: IngestError
}

/// The optional stages, cloned into every album task
#[derive(Clone, Default)]
struct Pipeline {
    reconciler: Option<Arc<Reconciler>>,
    store: Option<Arc<dyn AlbumStore>>,
    indexer: Option<Arc<dyn AlbumIndexer>>
}

impl Pipeline {
    async fn run(&self, album: Album) -> Result<Album, AlbumFailure> {
        let fail = |stage: Stage, album: &Album, error: IngestError| AlbumFailure {
            album_id: album.album_id().to_string(),
            stage,
            error
        };

        let album = match &self.reconciler {
            Some(reconciler) => reconciler.enrich(&album).await
                .map_err(|e| fail(Stage::Enrich, &album, e.into()))?,
            None => album
        };

        if let Some(store) = &self.store {
            let storage_id = store.store(&album).await
                .map_err(|e| fail(Stage::Store, &album, e))?;
            tracing::debug!(storage_id = %storage_id, "album.stored");
        }

        if let Some(indexer) = &self.indexer {
            indexer.index(&album).await
                .map_err(|e| fail(Stage::Index, &album, e))?;
        }
        Ok(album)
    }
}

pub struct BatchProcessor {
    pipeline: Pipeline,
    inflight: Arc<Semaphore>,
    max_inflight: usize
}

impl BatchProcessor {
    pub fn new(max_inflight: usize) -> Self {
        let max_inflight = max_inflight.max(1);
        Self {
            pipeline: Pipeline::default(),
            inflight: Arc::new(Semaphore::new(max_inflight)),
            max_inflight
        }
    }

    pub fn with_reconciler(mut self, reconciler: Arc<Reconciler>) -> Self {
        self.pipeline.reconciler = Some(reconciler);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn AlbumStore>) -> Self {
        self.pipeline.store = Some(store);
        self
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn AlbumIndexer>) -> Self {
        self.pipeline.indexer = Some(indexer);
        self
    }

    /// Processes every album concurrently, at most `max_inflight` at a
    /// time. Returns the albums that made it through every stage, in the
    /// order they finished
    pub async fn process(&self, albums: Vec<Album>) -> Vec<Album> {
        let submitted = albums.len();
        info!(
            submitted,
            max_inflight = self.max_inflight,
            enrich = self.pipeline.reconciler.is_some(),
            store = self.pipeline.store.is_some(),
            index = self.pipeline.indexer.is_some(),
            "batch.start"
        );

        let mut tasks = JoinSet::new();
        let mut owners: HashMap<Id, String> = HashMap::with_capacity(submitted);
        for album in albums {
            let pipeline = self.pipeline.clone();
            let inflight = self.inflight.clone();
            let album_id = album.album_id().to_string();
            let span = info_span!("album", album_id = %album_id);

            let handle = tasks.spawn(async move {
                let _permit = match inflight.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return Err(AlbumFailure {
                        album_id: album.album_id().to_string(),
                        stage: Stage::Admit,
                        error: IngestError::Config(format!("album limiter closed: {e}"))
                    })
                };
                pipeline.run(album).await
            }.instrument(span));
            owners.insert(handle.id(), album_id);
        }

        let mut done = Vec::with_capacity(submitted);
        let mut failed = 0_usize;
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(album))) => done.push(album),
                Ok((_, Err(failure))) => {
                    failed += 1;
                    warn!(
                        album_id = %failure.album_id,
                        stage = failure.stage.as_str(),
                        error = %failure.error,
                        "album.failed"
                    );
                },
                Err(e) => {
                    failed += 1;
                    let album_id = owners.get(&e.id()).map_or("unknown", String::as_str);
                    error!(
                        album_id,
                        error = %e,
                        panicked = e.is_panic(),
                        "album.task_lost"
                    );
                }
            }
        }

        info!(submitted, succeeded = done.len(), failed, "batch.done");
        done
    }
}
