//! SQLite pool creation and embedded schema bootstrap.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// Database connection settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.url = url;
        }
        if let Some(n) = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.max_connections = n;
        }
        config
    }
}

/// Create a connection pool and make sure the schema exists.
pub async fn initialize_database(config: DatabaseConfig) -> Result<SqlitePool> {
    // Keeping one connection open pins in-memory databases for the pool's
    // whole lifetime.
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(1)
        .connect(&config.url)
        .await?;

    initialize_schema(&pool).await?;

    tracing::info!(url = %config.url, "database initialized");
    Ok(pool)
}

/// Idempotent schema bootstrap. Unique indexes back the identity
/// invariants: one link per (track, platform), one link per
/// (platform, external_id), one binding per (playlist, platform) and per
/// (platform, external playlist).
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        "PRAGMA foreign_keys = ON",
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            primary_artist TEXT NOT NULL,
            album TEXT,
            duration_ms INTEGER,
            year INTEGER,
            bpm REAL,
            is_local_file INTEGER NOT NULL DEFAULT 0,
            local_path TEXT,
            content_hash TEXT,
            quality_rating INTEGER CHECK (quality_rating BETWEEN 0 AND 5),
            created_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS platform_links (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            track_id INTEGER NOT NULL REFERENCES tracks(id),
            platform TEXT NOT NULL,
            external_id TEXT NOT NULL CHECK (external_id <> ''),
            external_uri TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            last_synced_at TEXT NOT NULL,
            needs_refresh INTEGER NOT NULL DEFAULT 0,
            match_confidence REAL NOT NULL DEFAULT 1.0,
            UNIQUE (track_id, platform),
            UNIQUE (platform, external_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS playlists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            parent_id INTEGER REFERENCES playlists(id),
            is_system INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS playlist_members (
            playlist_id INTEGER NOT NULL REFERENCES playlists(id),
            track_id INTEGER NOT NULL REFERENCES tracks(id),
            position INTEGER NOT NULL,
            added_at TEXT NOT NULL,
            PRIMARY KEY (playlist_id, track_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS playlist_platform_bindings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            playlist_id INTEGER NOT NULL REFERENCES playlists(id),
            platform TEXT NOT NULL,
            external_playlist_id TEXT NOT NULL,
            sync_mode TEXT NOT NULL,
            is_personal INTEGER NOT NULL DEFAULT 1,
            last_synced_at TEXT,
            UNIQUE (playlist_id, platform)
        )
        "#,
        // Partial index: multiple bindings may await remote creation with an
        // empty external id, but a non-empty external playlist id is unique
        // per platform.
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_bindings_platform_external
            ON playlist_platform_bindings (platform, external_playlist_id)
            WHERE external_playlist_id <> ''
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            binding_id INTEGER PRIMARY KEY REFERENCES playlist_platform_bindings(id),
            taken_at TEXT NOT NULL,
            body TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS artwork_blobs (
            owner_id INTEGER NOT NULL,
            owner_kind TEXT NOT NULL CHECK (owner_kind IN ('track', 'album')),
            size_variant TEXT NOT NULL CHECK (size_variant IN ('thumb', 'small', 'medium', 'large')),
            data BLOB NOT NULL,
            PRIMARY KEY (owner_id, owner_kind, size_variant)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_tracks_title ON tracks (title)",
        "CREATE INDEX IF NOT EXISTS idx_tracks_artist ON tracks (primary_artist)",
        "CREATE INDEX IF NOT EXISTS idx_members_playlist ON playlist_members (playlist_id, position)",
        "CREATE INDEX IF NOT EXISTS idx_links_platform ON platform_links (platform)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_backed_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("library.db").display());

        let pool = initialize_database(DatabaseConfig {
            url: url.clone(),
            max_connections: 2,
        })
        .await
        .unwrap();
        sqlx::query("INSERT INTO tracks (title, primary_artist, created_at) VALUES (?, ?, ?)")
            .bind("Persisted")
            .bind("Artist")
            .bind(chrono::Utc::now())
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let pool = initialize_database(DatabaseConfig {
            url,
            max_connections: 2,
        })
        .await
        .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let pool = initialize_database(DatabaseConfig::default()).await.unwrap();
        // Running the DDL a second time must be a no-op.
        initialize_schema(&pool).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(count >= 6);
    }
}
