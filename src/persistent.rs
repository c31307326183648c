//!
//! src/persistent.rs  Andrew Belles  Oct 7th, 2025
//!
//! Sqlite storage for finished albums. Scalars live in `albums`, set and
//! map fields as json text, and the tracklist in its own table so that
//! a re-ingest replaces it in one transaction
//!

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite
};
use tracing::debug;
use uuid::Uuid;

use crate::album::{Album, AlbumFields, Track, TrackPosition};
use crate::errors::IngestError;
use crate::gateway::AlbumStore;

pub struct AlbumRepository {
    pool: Pool<Sqlite>
}

fn to_json<T: Serialize>(v: &T) -> Result<String, IngestError> {
    Ok(serde_json::to_string(v)?)
}

fn from_json<T: DeserializeOwned + Default>(raw: Option<String>) -> Result<T, IngestError> {
    match raw {
        Some(s) if !s.is_empty() => Ok(serde_json::from_str(&s)?),
        _ => Ok(T::default())
    }
}

impl AlbumRepository {
    async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS albums (
              id              TEXT PRIMARY KEY,
              album_id        TEXT NOT NULL UNIQUE,
              title           TEXT NOT NULL,
              artist          TEXT NOT NULL,
              year            INTEGER NOT NULL,
              genres          TEXT NOT NULL,
              styles          TEXT NOT NULL,
              labels          TEXT NOT NULL,
              country         TEXT,
              credits         TEXT,
              popularity      INTEGER,
              external_urls   TEXT NOT NULL,
              external_ids    TEXT NOT NULL,
              created_at      INTEGER NOT NULL,
              updated_at      INTEGER NOT NULL
            );
            "#
        ).execute(pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracks (
              album_row   TEXT NOT NULL REFERENCES albums(id) ON DELETE CASCADE,
              seq         INTEGER NOT NULL,
              position    TEXT NOT NULL,
              title       TEXT NOT NULL,
              duration    INTEGER,
              PRIMARY KEY (album_row, seq)
            );
            "#
        ).execute(pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_albums_artist ON albums(artist);")
            .execute(pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_albums_title ON albums(title);")
            .execute(pool).await?;

        Ok(())
    }

    pub async fn init(database_url: &str) -> Result<Self, IngestError> {
        let is_memory = database_url == "sqlite::memory:";

        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // WAL is file-only
        if !is_memory {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                       .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let mut pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if is_memory {1} else {8});
        if is_memory {
            // the database lives only as long as its one connection
            pool = pool.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool.connect_with(opts).await?;

        Self::ensure_schema(&pool).await?;
        Ok( Self { pool } )
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    pub async fn count_albums(&self) -> Result<i64, IngestError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM albums;")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Inserts or updates by `album_id`, replacing the tracklist.
    /// Returns the row id and whether the album was new
    pub async fn upsert_album(&self, album: &Album) -> Result<(String, bool), IngestError> {
        let mut tx = self.pool.begin().await?;
        let now = Self::now();

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM albums WHERE album_id = ?1 LIMIT 1;"
        )
        .bind(album.album_id())
        .fetch_optional(&mut *tx)
        .await?;

        let created = existing.is_none();
        let row_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

        sqlx::query(
            r"
            INSERT INTO albums (
                id, album_id, title, artist, year, genres, styles, labels,
                country, credits, popularity, external_urls, external_ids,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                artist = excluded.artist,
                year = excluded.year,
                genres = excluded.genres,
                styles = excluded.styles,
                labels = excluded.labels,
                country = excluded.country,
                credits = excluded.credits,
                popularity = excluded.popularity,
                external_urls = excluded.external_urls,
                external_ids = excluded.external_ids,
                updated_at = excluded.updated_at;
            "
        )
        .bind(&row_id)
        .bind(album.album_id())
        .bind(album.title())
        .bind(album.artist())
        .bind(album.year())
        .bind(to_json(album.genres())?)
        .bind(to_json(album.styles())?)
        .bind(to_json(album.labels())?)
        .bind(album.country())
        .bind(album.credits())
        .bind(album.popularity())
        .bind(to_json(album.external_urls())?)
        .bind(to_json(album.external_ids())?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tracks WHERE album_row = ?1;")
            .bind(&row_id)
            .execute(&mut *tx)
            .await?;

        for (seq, track) in album.tracklist().iter().enumerate() {
            sqlx::query(
                "INSERT INTO tracks (album_row, seq, position, title, duration)
                 VALUES (?1, ?2, ?3, ?4, ?5);"
            )
            .bind(&row_id)
            .bind(seq as i64)
            .bind(to_json(&track.position)?)
            .bind(&track.title)
            .bind(track.duration.map(i64::from))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(album_id = album.album_id(), row_id = %row_id, created, "db.upsert");
        Ok((row_id, created))
    }

    async fn tracks_for(&self, row_id: &str) -> Result<Vec<Track>, IngestError> {
        let rows = sqlx::query(
            "SELECT position, title, duration FROM tracks WHERE album_row = ?1 ORDER BY seq;"
        )
        .bind(row_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<Track, IngestError> {
                let position: TrackPosition = serde_json::from_str(&r.get::<String, _>("position"))?;
                let duration = r.get::<Option<i64>, _>("duration")
                    .and_then(|d| u32::try_from(d).ok());
                Ok(Track::new(position, r.get::<String, _>("title"), duration))
            })
            .collect()
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<Album, IngestError> {
        let row_id: String = row.get("id");
        let year = i32::try_from(row.get::<i64, _>("year"))
            .map_err(|e| IngestError::Db(format!("year column: {e}")))?;

        let fields = AlbumFields {
            album_id: row.get("album_id"),
            title: row.get("title"),
            artist: row.get("artist"),
            year,
            genres: from_json::<BTreeSet<String>>(row.get("genres"))?,
            styles: from_json::<BTreeSet<String>>(row.get("styles"))?,
            labels: from_json::<BTreeSet<String>>(row.get("labels"))?,
            country: row.get("country"),
            tracklist: self.tracks_for(&row_id).await?,
            credits: row.get("credits"),
            popularity: row.get::<Option<i64>, _>("popularity")
                .and_then(|p| i32::try_from(p).ok()),
            external_urls: from_json::<BTreeMap<String, String>>(row.get("external_urls"))?,
            external_ids: from_json::<BTreeMap<String, String>>(row.get("external_ids"))?
        };
        Ok(Album::new(fields)?)
    }

    async fn hydrate_all(&self, rows: Vec<SqliteRow>) -> Result<Vec<Album>, IngestError> {
        let mut albums = Vec::with_capacity(rows.len());
        for row in &rows {
            albums.push(self.hydrate(row).await?);
        }
        Ok(albums)
    }

    pub async fn get_album(&self, album_id: &str) -> Result<Option<Album>, IngestError> {
        let row = sqlx::query("SELECT * FROM albums WHERE album_id = ?1 LIMIT 1;")
            .bind(album_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None)
        }
    }

    pub async fn list_albums(&self) -> Result<Vec<Album>, IngestError> {
        let rows = sqlx::query("SELECT * FROM albums ORDER BY artist, year, title;")
            .fetch_all(&self.pool)
            .await?;
        self.hydrate_all(rows).await
    }

    /// Case-insensitive substring match on the artist
    pub async fn albums_by_artist(&self, artist: &str) -> Result<Vec<Album>, IngestError> {
        let rows = sqlx::query(
            "SELECT * FROM albums WHERE artist LIKE '%' || ?1 || '%' ORDER BY year, title;"
        )
        .bind(artist)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(rows).await
    }

    pub async fn albums_by_title(&self, title: &str) -> Result<Vec<Album>, IngestError> {
        let rows = sqlx::query("SELECT * FROM albums WHERE title = ?1 ORDER BY artist;")
            .bind(title)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate_all(rows).await
    }
}

#[async_trait]
impl AlbumStore for AlbumRepository {
    async fn store(&self, album: &Album) -> Result<String, IngestError> {
        let (row_id, _) = self.upsert_album(album).await?;
        Ok(row_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> AlbumRepository {
        AlbumRepository::init("sqlite::memory:").await.unwrap()
    }

    fn kind_of_blue() -> Album {
        let mut fields = AlbumFields::new("42", "Kind Of Blue", "Miles Davis", 1959);
        fields.genres = ["Jazz".to_string()].into();
        fields.labels = ["Columbia".to_string()].into();
        fields.country = Some("US".into());
        fields.popularity = Some(79);
        fields.external_ids.insert("discogs".into(), "1434225".into());
        fields.tracklist = vec![
            Track::new(TrackPosition::Label("A1".into()), "So What", Some(562)),
            Track::new(TrackPosition::Number(2), "Freddie Freeloader", None),
        ];
        Album::new(fields).unwrap()
    }

    #[tokio::test]
    async fn album_round_trips_through_db() {
        let repo = repo().await;
        let album = kind_of_blue();

        let (row_id, created) = repo.upsert_album(&album).await.unwrap();
        assert!(created);
        assert!(!row_id.is_empty());

        let back = repo.get_album("42").await.unwrap().unwrap();
        assert_eq!(back, album);
        assert!(repo.get_album("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_fields_and_tracks() {
        let repo = repo().await;
        let album = kind_of_blue();
        let (first_id, _) = repo.upsert_album(&album).await.unwrap();

        let mut fields = album.to_fields();
        fields.popularity = Some(90);
        fields.tracklist = vec![Track::new(TrackPosition::Number(1), "So What", Some(565))];
        let updated = Album::new(fields).unwrap();

        let (second_id, created) = repo.upsert_album(&updated).await.unwrap();
        assert!(!created);
        assert_eq!(first_id, second_id);
        assert_eq!(repo.count_albums().await.unwrap(), 1);

        let back = repo.get_album("42").await.unwrap().unwrap();
        assert_eq!(back.popularity(), Some(90));
        assert_eq!(back.tracklist().len(), 1);
    }

    #[tokio::test]
    async fn lookups_by_artist_and_title() {
        let repo = repo().await;
        repo.upsert_album(&kind_of_blue()).await.unwrap();
        repo.store(&Album::new(AlbumFields::new("43", "Blue", "Joni Mitchell", 1971)).unwrap())
            .await.unwrap();
        repo.store(&Album::new(AlbumFields::new("44", "Bitches Brew", "Miles Davis", 1970)).unwrap())
            .await.unwrap();

        let miles = repo.albums_by_artist("miles").await.unwrap();
        assert_eq!(
            miles.iter().map(|a| a.album_id()).collect::<Vec<_>>(),
            vec!["42", "44"]
        );
        let blue = repo.albums_by_title("Blue").await.unwrap();
        assert_eq!(blue.len(), 1);
        assert_eq!(blue[0].artist(), "Joni Mitchell");

        let all = repo.list_albums().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].artist(), "Joni Mitchell");
    }
}
