//!
//! src/gateway.rs  Andrew Belles  Oct 5th, 2025
//!
//! Seams between the pipeline and wherever finished albums go. The
//! batch runner only sees these traits, sqlite backs them in production
//!

use async_trait::async_trait;

use crate::album::Album;
use crate::errors::IngestError;

/// Persists a finished album, returns its storage identifier
#[async_trait]
pub trait AlbumStore: Send + Sync {
    async fn store(&self, album: &Album) -> Result<String, IngestError>;
}

/// Makes a finished album findable by similarity search
#[async_trait]
pub trait AlbumIndexer: Send + Sync {
    async fn index(&self, album: &Album) -> Result<(), IngestError>;
}

/// Answers free-text queries with albums ranked by score, best first
#[async_trait]
pub trait AlbumSearch: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) ->
        Result<Vec<(Album, f32)>, IngestError>;
}
