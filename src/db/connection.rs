//! Database connection pool and management.

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::time::Duration;

/// Type alias for our connection pool.
pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Type alias for a pooled connection.
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Connection timeout in seconds.
    pub connection_timeout: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "starload.db".to_string(),
            max_connections: 10,
            connection_timeout: 30,
        }
    }
}

impl DbConfig {
    /// Create a new database configuration.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    /// Build a connection pool from this configuration.
    pub fn build_pool(&self) -> Result<DbPool, Box<dyn std::error::Error>> {
        let manager = ConnectionManager::<SqliteConnection>::new(&self.database_url);

        Pool::builder()
            .max_size(self.max_connections)
            .connection_timeout(Duration::from_secs(self.connection_timeout))
            .build(manager)
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
    }
}

/// Run the SQL migrations to set up the star schema.
///
/// Tables must be created dimension-first so the foreign key clauses on
/// the fact table have something to reference.
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Dimension table: artists
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            artist_id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            location TEXT,
            latitude DOUBLE,
            longitude DOUBLE,
            CHECK (latitude IS NULL OR (latitude >= -90 AND latitude <= 90)),
            CHECK (longitude IS NULL OR (longitude >= -180 AND longitude <= 180))
        )
        "#,
    )
    .execute(conn)?;

    diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_artists_name ON artists(name)")
        .execute(conn)?;

    // Dimension table: songs. Year 0 means "unknown" in the source data.
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS songs (
            song_id TEXT PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            artist_id TEXT REFERENCES artists(artist_id) ON DELETE SET NULL,
            year INTEGER NOT NULL,
            duration DOUBLE NOT NULL,
            CHECK (year = 0 OR (year >= 1900 AND year <= 2999)),
            CHECK (duration > 0)
        )
        "#,
    )
    .execute(conn)?;

    diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_songs_title ON songs(title)")
        .execute(conn)?;

    diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_songs_artist_id ON songs(artist_id)")
        .execute(conn)?;

    // Dimension table: users
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY NOT NULL,
            first_name TEXT,
            last_name TEXT,
            gender CHAR(1),
            level TEXT,
            CHECK (user_id >= 0),
            CHECK (gender IS NULL OR gender IN ('F', 'M'))
        )
        "#,
    )
    .execute(conn)?;

    // Dimension table: time. Start times are truncated to second precision.
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS "time" (
            start_time TIMESTAMP PRIMARY KEY NOT NULL,
            hour INTEGER NOT NULL,
            day INTEGER NOT NULL,
            week INTEGER NOT NULL,
            month INTEGER NOT NULL,
            year INTEGER NOT NULL,
            weekday INTEGER NOT NULL,
            CHECK (hour >= 0 AND hour <= 23),
            CHECK (day >= 1 AND day <= 31),
            CHECK (week >= 1 AND week <= 53),
            CHECK (month >= 1 AND month <= 12),
            CHECK (year > 1900 AND year <= 2999),
            CHECK (weekday >= 1 AND weekday <= 8)
        )
        "#,
    )
    .execute(conn)?;

    // Fact table: songplays. The (start_time, session_id) pair is the
    // natural key; reruns upsert on it instead of piling up duplicates.
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS songplays (
            songplay_id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            start_time TIMESTAMP NOT NULL REFERENCES "time"(start_time),
            user_id INTEGER REFERENCES users(user_id) ON DELETE SET NULL,
            level TEXT,
            song_id TEXT REFERENCES songs(song_id) ON DELETE SET NULL,
            artist_id TEXT REFERENCES artists(artist_id) ON DELETE SET NULL,
            session_id INTEGER NOT NULL,
            location TEXT,
            user_agent TEXT,
            CHECK (session_id > 0),
            UNIQUE (start_time, session_id)
        )
        "#,
    )
    .execute(conn)?;

    diesel::sql_query(
        "CREATE INDEX IF NOT EXISTS idx_songplays_start_time ON songplays(start_time)",
    )
    .execute(conn)?;

    diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_songplays_user_id ON songplays(user_id)")
        .execute(conn)?;

    // Manifest of processed source files, used to skip unchanged files
    // on incremental reruns.
    diesel::sql_query(
        r#"
        CREATE TABLE IF NOT EXISTS etl_files (
            path TEXT PRIMARY KEY NOT NULL,
            mtime BIGINT NOT NULL,
            processed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(conn)?;

    Ok(())
}

/// Drop every table the pipeline owns, fact table first so the foreign
/// key clauses never dangle.
pub fn drop_all_tables(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    for stmt in [
        "DROP TABLE IF EXISTS songplays",
        "DROP TABLE IF EXISTS songs",
        "DROP TABLE IF EXISTS artists",
        "DROP TABLE IF EXISTS users",
        "DROP TABLE IF EXISTS \"time\"",
        "DROP TABLE IF EXISTS etl_files",
    ] {
        diesel::sql_query(stmt).execute(conn)?;
    }
    Ok(())
}

/// Build a single-connection in-memory pool with the schema applied.
///
/// The pool is capped at one connection because every `:memory:` SQLite
/// connection gets its own private database.
#[cfg(test)]
pub(crate) fn test_pool() -> DbPool {
    let config = DbConfig {
        database_url: ":memory:".to_string(),
        max_connections: 1,
        connection_timeout: 5,
    };
    let pool = config.build_pool().expect("failed to build test pool");
    let mut conn = pool.get().expect("failed to get test connection");
    run_migrations(&mut conn).expect("failed to run migrations");
    pool
}
