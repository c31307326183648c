//!
//! src/index.rs  Andrew Belles  Oct 8th, 2025
//!
//! Vector index over finished albums. Each album is flattened to a line
//! of text, embedded, and stored with its payload in sqlite; search scores
//! every vector in the collection by cosine similarity
//!

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::album::Album;
use crate::config::{EmbedderKind, IndexConfig};
use crate::errors::IngestError;
use crate::gateway::{AlbumIndexer, AlbumSearch};

/// Turns text into a fixed-size vector. Swappable so a model-backed
/// embedder can replace the hashing one
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, IngestError>;
}

/// Signed feature hashing over lowercase word tokens, L2 normalized.
/// Deterministic across runs and machines
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn fnv1a(token: &str) -> u64 {
        token.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize { self.dims }

    fn embed(&self, text: &str) -> Result<Vec<f32>, IngestError> {
        let mut v = vec![0.0_f32; self.dims];
        for token in tokens(text) {
            let h = Self::fnv1a(&token);
            let slot = (h % self.dims as u64) as usize;
            v[slot] += if h >> 63 == 1 { -1.0 } else { 1.0 };
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

#[cfg(feature = "embeddings")]
mod fastembed_impl {
    use std::sync::Mutex;

    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

    use super::Embedder;
    use crate::errors::IngestError;

    /// all-MiniLM-L6-v2 through ONNX Runtime. `TextEmbedding::embed` needs
    /// `&mut self`, hence the mutex
    pub struct FastEmbedder {
        model: Mutex<TextEmbedding>
    }

    impl FastEmbedder {
        pub const DIMENSIONS: usize = 384;

        pub fn new() -> Result<Self, IngestError> {
            let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(false);
            let model = TextEmbedding::try_new(options)
                .map_err(|e| IngestError::Index(format!("embedding model: {e}")))?;
            Ok( Self { model: Mutex::new(model) })
        }
    }

    impl Embedder for FastEmbedder {
        fn dimensions(&self) -> usize { Self::DIMENSIONS }

        fn embed(&self, text: &str) -> Result<Vec<f32>, IngestError> {
            let mut model = self.model.lock()
                .map_err(|_| IngestError::Index("embedding model lock poisoned".into()))?;
            model.embed(vec![text], None)
                .map_err(|e| IngestError::Index(format!("embed: {e}")))?
                .pop()
                .ok_or_else(|| IngestError::Index("embedder returned nothing".into()))
        }
    }
}

#[cfg(feature = "embeddings")]
pub use fastembed_impl::FastEmbedder;

/// Embedder selected by config. The model-backed one needs the
/// `embeddings` feature
pub fn build_embedder(cfg: &IndexConfig) -> Result<Arc<dyn Embedder>, IngestError> {
    match cfg.embedder {
        EmbedderKind::Hashing => Ok(Arc::new(HashingEmbedder::new(cfg.dimensions))),
        #[cfg(feature = "embeddings")]
        EmbedderKind::FastEmbed => Ok(Arc::new(FastEmbedder::new()?)),
        #[cfg(not(feature = "embeddings"))]
        EmbedderKind::FastEmbed => Err(IngestError::Config(
            "VECTOR_EMBEDDER=fastembed requires the `embeddings` feature".into()
        ))
    }
}

/// 0.0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// The text an album is embedded as
pub fn album_to_text(album: &Album) -> String {
    let mut parts = vec![
        album.album_id().to_string(),
        album.title().to_string(),
        album.artist().to_string(),
        album.year().to_string(),
    ];
    parts.extend(album.genres().iter().cloned());
    parts.extend(album.styles().iter().cloned());
    parts.retain(|p| !p.trim().is_empty());
    parts.join(" ")
}

fn to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn from_blob(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(bytes.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub struct VectorIndex {
    pool: Pool<Sqlite>,
    collection: String,
    min_score: f32,
    embedder: Arc<dyn Embedder>
}

impl VectorIndex {
    pub async fn init(cfg: &IndexConfig, embedder: Arc<dyn Embedder>) ->
        Result<Self, IngestError> {
        let is_memory = cfg.db_url == "sqlite::memory:";

        let mut opts = SqliteConnectOptions::from_str(&cfg.db_url)?
            .create_if_missing(true);
        if !is_memory {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                       .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let mut pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if is_memory {1} else {4});
        if is_memory {
            pool = pool.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool.connect_with(opts).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS album_vectors (
              collection  TEXT NOT NULL,
              album_id    TEXT NOT NULL,
              point_id    TEXT NOT NULL,
              dims        INTEGER NOT NULL,
              vector      BLOB NOT NULL,
              payload     TEXT NOT NULL,
              updated_at  INTEGER NOT NULL,
              PRIMARY KEY (collection, album_id)
            );
            "#
        ).execute(&pool).await?;

        debug!(collection = %cfg.collection, dims = embedder.dimensions(), "index.ready");
        Ok( Self {
            pool,
            collection: cfg.collection.clone(),
            min_score: cfg.min_score,
            embedder
        })
    }

    pub async fn count(&self) -> Result<i64, IngestError> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM album_vectors WHERE collection = ?1;"
        )
        .bind(&self.collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Adds or refreshes one album, keeping its point id across refreshes
    pub async fn upsert(&self, album: &Album) -> Result<String, IngestError> {
        let vector = self.embedder.embed(&album_to_text(album))?;
        if vector.len() != self.embedder.dimensions() {
            return Err(IngestError::Index(format!(
                "embedder returned {} dims, expected {}",
                vector.len(), self.embedder.dimensions()
            )));
        }

        let point_id: String = sqlx::query_scalar(
            r"
            INSERT INTO album_vectors (
                collection, album_id, point_id, dims, vector, payload, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(collection, album_id) DO UPDATE SET
                dims = excluded.dims,
                vector = excluded.vector,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            RETURNING point_id;
            "
        )
        .bind(&self.collection)
        .bind(album.album_id())
        .bind(Uuid::new_v4().to_string())
        .bind(vector.len() as i64)
        .bind(to_blob(&vector))
        .bind(serde_json::to_string(album)?)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;

        debug!(album_id = album.album_id(), point_id = %point_id, "index.upsert");
        Ok(point_id)
    }

    /// Albums ranked by similarity to `query`, best first, scores at or
    /// above the configured floor
    pub async fn search_albums(&self, query: &str, top_k: usize) ->
        Result<Vec<(Album, f32)>, IngestError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed(query)?;

        let rows = sqlx::query(
            "SELECT album_id, vector, payload FROM album_vectors WHERE collection = ?1;"
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::new();
        for row in rows {
            let album_id: String = row.get("album_id");
            let Some(vector) = from_blob(&row.get::<Vec<u8>, _>("vector")) else {
                warn!(album_id = %album_id, "index.corrupt_vector");
                continue;
            };
            if vector.len() != query_vec.len() {
                warn!(album_id = %album_id, dims = vector.len(), "index.dims_mismatch");
                continue;
            }

            let score = cosine_similarity(&query_vec, &vector);
            if score < self.min_score {
                continue;
            }
            let album = match serde_json::from_str::<Album>(&row.get::<String, _>("payload")) {
                Ok(album) => album,
                Err(e) => {
                    warn!(album_id = %album_id, error = %e, "index.corrupt_payload");
                    continue;
                }
            };
            scored.push((album, score));
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[async_trait]
impl AlbumIndexer for VectorIndex {
    async fn index(&self, album: &Album) -> Result<(), IngestError> {
        self.upsert(album).await.map(|_| ())
    }
}

#[async_trait]
impl AlbumSearch for VectorIndex {
    async fn search(&self, query: &str, top_k: usize) ->
        Result<Vec<(Album, f32)>, IngestError> {
        self.search_albums(query, top_k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::AlbumFields;

    fn cfg(min_score: f32) -> IndexConfig {
        IndexConfig {
            db_url: "sqlite::memory:".to_string(),
            collection: "albums".to_string(),
            embedder: EmbedderKind::Hashing,
            dimensions: 4096,
            min_score
        }
    }

    async fn index(min_score: f32) -> VectorIndex {
        let embedder = Arc::new(HashingEmbedder::new(4096));
        VectorIndex::init(&cfg(min_score), embedder).await.unwrap()
    }

    fn album(id: &str, title: &str, artist: &str, year: i32, genre: &str) -> Album {
        let mut fields = AlbumFields::new(id, title, artist, year);
        fields.genres.insert(genre.to_string());
        Album::new(fields).unwrap()
    }

    #[test]
    fn hashing_embedder_is_stable_and_normalized() {
        let e = HashingEmbedder::new(384);
        let a = e.embed("Kind of Blue Miles Davis").unwrap();
        let b = e.embed("kind OF blue, miles davis").unwrap();
        assert_eq!(a.len(), 384);
        assert_eq!(a, b);

        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        assert!(e.embed("").unwrap().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn config_picks_the_embedder() {
        let hashing = build_embedder(&cfg(0.0)).unwrap();
        assert_eq!(hashing.dimensions(), 4096);

        let model = IndexConfig { embedder: EmbedderKind::FastEmbed, ..cfg(0.0) };
        #[cfg(not(feature = "embeddings"))]
        assert!(matches!(build_embedder(&model), Err(IngestError::Config(_))));
        #[cfg(feature = "embeddings")]
        let _ = model;
    }

    #[cfg(feature = "embeddings")]
    #[test]
    #[ignore] // downloads the model
    fn fastembed_embeds_album_text() {
        let embedder = FastEmbedder::new().unwrap();
        let v = embedder.embed("42 Kind Of Blue Miles Davis 1959 Jazz").unwrap();
        assert_eq!(v.len(), FastEmbedder::DIMENSIONS);
    }

    #[test]
    fn cosine_edge_cases() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn album_text_lists_identity_and_tags() {
        let a = album("42", "Kind Of Blue", "Miles Davis", 1959, "Jazz");
        assert_eq!(album_to_text(&a), "42 Kind Of Blue Miles Davis 1959 Jazz");
    }

    #[tokio::test]
    async fn search_ranks_closest_album_first() {
        let idx = index(0.0).await;
        idx.index(&album("42", "Kind Of Blue", "Miles Davis", 1959, "Jazz")).await.unwrap();
        idx.index(&album("43", "Blue", "Joni Mitchell", 1971, "Folk")).await.unwrap();
        idx.index(&album("44", "Bitches Brew", "Miles Davis", 1970, "Fusion")).await.unwrap();

        let hits = idx.search("miles davis jazz", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.album_id(), "42");
        assert_eq!(hits[1].0.album_id(), "44");
        assert!(hits[0].1 >= hits[1].1);

        assert!(idx.search("anything", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn min_score_filters_weak_matches() {
        let idx = index(0.5).await;
        idx.index(&album("42", "Kind Of Blue", "Miles Davis", 1959, "Jazz")).await.unwrap();
        idx.index(&album("43", "Hejira", "Joni Mitchell", 1976, "Folk")).await.unwrap();

        let hits = idx.search("miles davis jazz", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.title(), "Kind Of Blue");
    }

    #[tokio::test]
    async fn corrupt_payload_is_skipped() {
        let idx = index(0.0).await;
        idx.index(&album("42", "Kind Of Blue", "Miles Davis", 1959, "Jazz")).await.unwrap();
        idx.index(&album("44", "Bitches Brew", "Miles Davis", 1970, "Fusion")).await.unwrap();

        sqlx::query("UPDATE album_vectors SET payload = ?1 WHERE album_id = ?2;")
            .bind(r#"{"album_id":"42","title":"","artist":"","year":-1}"#)
            .bind("42")
            .execute(&idx.pool)
            .await
            .unwrap();

        let hits = idx.search("miles davis", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.album_id(), "44");
    }

    #[tokio::test]
    async fn reindexing_keeps_one_point() {
        let idx = index(0.0).await;
        let first = idx.upsert(&album("42", "Kind Of Blue", "Miles Davis", 1959, "Jazz"))
            .await.unwrap();
        let second = idx.upsert(&album("42", "Kind Of Blue", "Miles Davis", 1959, "Modal"))
            .await.unwrap();

        assert_eq!(first, second);
        assert_eq!(idx.count().await.unwrap(), 1);
        let hits = idx.search("modal", 1).await.unwrap();
        assert!(hits[0].0.genres().contains("Modal"));
    }
}
