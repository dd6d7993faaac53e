//! Database repositories for the star schema and the file manifest.
//!
//! Every load path is an idempotent upsert: dimension tables conflict on
//! their primary key, the fact table on its (start_time, session_id)
//! natural key. All values go through Diesel's bind parameters, so
//! embedded quotes in titles and names need no escaping.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::upsert::excluded;
use thiserror::Error;

use crate::db::DbPool;
use crate::db::schema::{artists, etl_files, songplays, songs, time, users};

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum EtlRepoError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
}

/// Row for the `artists` dimension table.
#[derive(Debug, Clone, PartialEq, Insertable, Queryable)]
#[diesel(table_name = artists)]
#[diesel(treat_none_as_default_value = false)]
pub struct ArtistRow {
    pub artist_id: String,
    pub name: String,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Row for the `songs` dimension table.
#[derive(Debug, Clone, PartialEq, Insertable, Queryable)]
#[diesel(table_name = songs)]
#[diesel(treat_none_as_default_value = false)]
pub struct SongRow {
    pub song_id: String,
    pub title: String,
    pub artist_id: Option<String>,
    pub year: i32,
    pub duration: f64,
}

/// Row for the `users` dimension table.
#[derive(Debug, Clone, PartialEq, Insertable, Queryable)]
#[diesel(table_name = users)]
#[diesel(treat_none_as_default_value = false)]
pub struct UserRow {
    pub user_id: i32,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub level: Option<String>,
}

/// Row for the `time` dimension table.
#[derive(Debug, Clone, PartialEq, Insertable, Queryable)]
#[diesel(table_name = time)]
#[diesel(treat_none_as_default_value = false)]
pub struct TimeRow {
    pub start_time: NaiveDateTime,
    pub hour: i32,
    pub day: i32,
    pub week: i32,
    pub month: i32,
    pub year: i32,
    pub weekday: i32,
}

/// Insert data for the `songplays` fact table. The surrogate
/// `songplay_id` is assigned by the database.
#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = songplays)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewSongplay {
    pub start_time: NaiveDateTime,
    pub user_id: Option<i32>,
    pub level: Option<String>,
    pub song_id: Option<String>,
    pub artist_id: Option<String>,
    pub session_id: i32,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

/// Lookup key for resolving a songplay against the song/artist dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct SongKey {
    pub title: String,
    pub artist: String,
    pub duration: f64,
}

/// Repository for the star-schema tables.
#[derive(Clone)]
pub struct WarehouseRepository {
    pool: DbPool,
}

impl WarehouseRepository {
    /// Create a new warehouse repository.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Bulk-upsert artist rows, keyed on artist_id.
    pub fn upsert_artists(&self, rows: &[ArtistRow]) -> Result<usize, EtlRepoError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;

        let affected = diesel::insert_into(artists::table)
            .values(rows)
            .on_conflict(artists::artist_id)
            .do_update()
            .set((
                artists::name.eq(excluded(artists::name)),
                artists::location.eq(excluded(artists::location)),
                artists::latitude.eq(excluded(artists::latitude)),
                artists::longitude.eq(excluded(artists::longitude)),
            ))
            .execute(&mut conn)?;

        Ok(affected)
    }

    /// Bulk-upsert song rows, keyed on song_id.
    pub fn upsert_songs(&self, rows: &[SongRow]) -> Result<usize, EtlRepoError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;

        let affected = diesel::insert_into(songs::table)
            .values(rows)
            .on_conflict(songs::song_id)
            .do_update()
            .set((
                songs::title.eq(excluded(songs::title)),
                songs::artist_id.eq(excluded(songs::artist_id)),
                songs::year.eq(excluded(songs::year)),
                songs::duration.eq(excluded(songs::duration)),
            ))
            .execute(&mut conn)?;

        Ok(affected)
    }

    /// Bulk-upsert user rows, keyed on user_id. The caller is expected to
    /// have already collapsed the batch to one row per user.
    pub fn upsert_users(&self, rows: &[UserRow]) -> Result<usize, EtlRepoError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;

        let affected = diesel::insert_into(users::table)
            .values(rows)
            .on_conflict(users::user_id)
            .do_update()
            .set((
                users::first_name.eq(excluded(users::first_name)),
                users::last_name.eq(excluded(users::last_name)),
                users::gender.eq(excluded(users::gender)),
                users::level.eq(excluded(users::level)),
            ))
            .execute(&mut conn)?;

        Ok(affected)
    }

    /// Bulk-upsert time rows, keyed on start_time. The non-key columns are
    /// a pure function of the key, so the update rewrites identical values.
    pub fn upsert_time(&self, rows: &[TimeRow]) -> Result<usize, EtlRepoError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;

        let affected = diesel::insert_into(time::table)
            .values(rows)
            .on_conflict(time::start_time)
            .do_update()
            .set((
                time::hour.eq(excluded(time::hour)),
                time::day.eq(excluded(time::day)),
                time::week.eq(excluded(time::week)),
                time::month.eq(excluded(time::month)),
                time::year.eq(excluded(time::year)),
                time::weekday.eq(excluded(time::weekday)),
            ))
            .execute(&mut conn)?;

        Ok(affected)
    }

    /// Bulk-upsert songplay rows on the (start_time, session_id) natural
    /// key, so reloading the same log file never duplicates facts.
    pub fn upsert_songplays(&self, rows: &[NewSongplay]) -> Result<usize, EtlRepoError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;

        let affected = diesel::insert_into(songplays::table)
            .values(rows)
            .on_conflict((songplays::start_time, songplays::session_id))
            .do_update()
            .set((
                songplays::user_id.eq(excluded(songplays::user_id)),
                songplays::level.eq(excluded(songplays::level)),
                songplays::song_id.eq(excluded(songplays::song_id)),
                songplays::artist_id.eq(excluded(songplays::artist_id)),
                songplays::location.eq(excluded(songplays::location)),
                songplays::user_agent.eq(excluded(songplays::user_agent)),
            ))
            .execute(&mut conn)?;

        Ok(affected)
    }

    /// Resolve (title, artist name, duration) lookup keys to
    /// (song_id, artist_id) pairs.
    ///
    /// Candidates are fetched in one songs-join-artists query filtered on
    /// the batch's titles, then matched in memory on exact equality of all
    /// three fields. The output is positionally aligned with `keys`;
    /// unmatched keys yield `None`.
    pub fn resolve_song_ids(
        &self,
        keys: &[SongKey],
    ) -> Result<Vec<Option<(String, String)>>, EtlRepoError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get()?;

        let titles: Vec<&str> = keys.iter().map(|k| k.title.as_str()).collect();

        let candidates: Vec<(String, String, f64, String, String)> = songs::table
            .inner_join(artists::table)
            .filter(songs::title.eq_any(titles))
            .select((
                songs::title,
                artists::name,
                songs::duration,
                songs::song_id,
                artists::artist_id,
            ))
            .load(&mut conn)?;

        // Exact duration equality, matching the source schema's join; the
        // bits representation keeps f64 usable as a hash key.
        let by_key: HashMap<(String, String, u64), (String, String)> = candidates
            .into_iter()
            .map(|(title, name, duration, song_id, artist_id)| {
                ((title, name, duration.to_bits()), (song_id, artist_id))
            })
            .collect();

        Ok(keys
            .iter()
            .map(|k| {
                by_key
                    .get(&(k.title.clone(), k.artist.clone(), k.duration.to_bits()))
                    .cloned()
            })
            .collect())
    }

    /// Count fact rows where both dimension ids resolved.
    pub fn count_resolved_songplays(&self) -> Result<i64, EtlRepoError> {
        let mut conn = self.pool.get()?;

        let count = songplays::table
            .filter(songplays::song_id.is_not_null())
            .filter(songplays::artist_id.is_not_null())
            .count()
            .get_result(&mut conn)?;

        Ok(count)
    }

    /// Count all fact rows.
    pub fn count_songplays(&self) -> Result<i64, EtlRepoError> {
        let mut conn = self.pool.get()?;

        let count = songplays::table.count().get_result(&mut conn)?;

        Ok(count)
    }
}

/// Insert data for the processed-file manifest.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = etl_files)]
struct NewManifestEntry<'a> {
    path: &'a str,
    mtime: i64,
}

/// Repository for the processed-file manifest.
#[derive(Clone)]
pub struct ManifestRepository {
    pool: DbPool,
}

impl ManifestRepository {
    /// Create a new manifest repository.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Load the whole manifest as a path -> mtime map.
    pub fn load_all(&self) -> Result<HashMap<String, i64>, EtlRepoError> {
        let mut conn = self.pool.get()?;

        let entries: Vec<(String, i64)> = etl_files::table
            .select((etl_files::path, etl_files::mtime))
            .load(&mut conn)?;

        Ok(entries.into_iter().collect())
    }

    /// Record a file as fully processed at the given modification time.
    pub fn record_processed(&self, path: &str, mtime: i64) -> Result<(), EtlRepoError> {
        let mut conn = self.pool.get()?;

        diesel::insert_into(etl_files::table)
            .values(&NewManifestEntry { path, mtime })
            .on_conflict(etl_files::path)
            .do_update()
            .set((
                etl_files::mtime.eq(excluded(etl_files::mtime)),
                etl_files::processed_at.eq(diesel::dsl::now),
            ))
            .execute(&mut conn)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_pool;
    use chrono::NaiveDate;

    fn artist(id: &str, name: &str) -> ArtistRow {
        ArtistRow {
            artist_id: id.to_string(),
            name: name.to_string(),
            location: Some("NY".to_string()),
            latitude: Some(40.7),
            longitude: Some(-74.0),
        }
    }

    fn song(id: &str, title: &str, artist_id: &str, duration: f64) -> SongRow {
        SongRow {
            song_id: id.to_string(),
            title: title.to_string(),
            artist_id: Some(artist_id.to_string()),
            year: 2000,
            duration,
        }
    }

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 11, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn play(start: NaiveDateTime, session_id: i32) -> NewSongplay {
        NewSongplay {
            start_time: start,
            user_id: Some(7),
            level: Some("free".to_string()),
            song_id: None,
            artist_id: None,
            session_id,
            location: None,
            user_agent: None,
        }
    }

    #[test]
    fn test_artist_upsert_is_idempotent() {
        let repo = WarehouseRepository::new(test_pool());
        let rows = vec![artist("A1", "O'Brien"), artist("A2", "Daft Punk")];

        repo.upsert_artists(&rows).unwrap();
        repo.upsert_artists(&rows).unwrap();

        let mut conn = repo.pool.get().unwrap();
        let stored: Vec<ArtistRow> = artists::table
            .order(artists::artist_id)
            .load(&mut conn)
            .unwrap();
        assert_eq!(stored, rows);
    }

    #[test]
    fn test_artist_upsert_updates_non_key_columns() {
        let repo = WarehouseRepository::new(test_pool());
        repo.upsert_artists(&[artist("A1", "Old Name")]).unwrap();
        repo.upsert_artists(&[artist("A1", "New Name")]).unwrap();

        let mut conn = repo.pool.get().unwrap();
        let stored: Vec<ArtistRow> = artists::table.load(&mut conn).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "New Name");
    }

    #[test]
    fn test_embedded_quote_round_trips() {
        let repo = WarehouseRepository::new(test_pool());
        repo.upsert_artists(&[artist("A1", "O'Brien")]).unwrap();

        let mut conn = repo.pool.get().unwrap();
        let name: String = artists::table
            .filter(artists::artist_id.eq("A1"))
            .select(artists::name)
            .first(&mut conn)
            .unwrap();
        assert_eq!(name, "O'Brien");
    }

    #[test]
    fn test_song_upsert_is_idempotent() {
        let repo = WarehouseRepository::new(test_pool());
        repo.upsert_artists(&[artist("A1", "Casual")]).unwrap();
        let rows = vec![song("S1", "Test", "A1", 200.5)];

        repo.upsert_songs(&rows).unwrap();
        repo.upsert_songs(&rows).unwrap();

        let mut conn = repo.pool.get().unwrap();
        let stored: Vec<SongRow> = songs::table.load(&mut conn).unwrap();
        assert_eq!(stored, rows);
    }

    #[test]
    fn test_user_upsert_last_level_wins() {
        let repo = WarehouseRepository::new(test_pool());
        let free = UserRow {
            user_id: 7,
            first_name: Some("Jayden".to_string()),
            last_name: Some("Fox".to_string()),
            gender: Some("M".to_string()),
            level: Some("free".to_string()),
        };
        let paid = UserRow {
            level: Some("paid".to_string()),
            ..free.clone()
        };

        repo.upsert_users(&[free]).unwrap();
        repo.upsert_users(&[paid.clone()]).unwrap();

        let mut conn = repo.pool.get().unwrap();
        let stored: Vec<UserRow> = users::table.load(&mut conn).unwrap();
        assert_eq!(stored, vec![paid]);
    }

    #[test]
    fn test_time_upsert_is_idempotent() {
        let repo = WarehouseRepository::new(test_pool());
        let rows = vec![TimeRow {
            start_time: ts(16, 35, 0),
            hour: 16,
            day: 15,
            week: 46,
            month: 11,
            year: 2018,
            weekday: 4,
        }];

        repo.upsert_time(&rows).unwrap();
        repo.upsert_time(&rows).unwrap();

        let mut conn = repo.pool.get().unwrap();
        let stored: Vec<TimeRow> = time::table.load(&mut conn).unwrap();
        assert_eq!(stored, rows);
    }

    #[test]
    fn test_resolution_preserves_input_order() {
        let repo = WarehouseRepository::new(test_pool());
        repo.upsert_artists(&[artist("A1", "Casual"), artist("A2", "Survivor")])
            .unwrap();
        repo.upsert_songs(&[
            song("S1", "Test", "A1", 200.5),
            song("S2", "Eye Of The Tiger", "A2", 245.36771),
        ])
        .unwrap();

        let keys = vec![
            SongKey {
                title: "Eye Of The Tiger".to_string(),
                artist: "Survivor".to_string(),
                duration: 245.36771,
            },
            SongKey {
                title: "No Such Song".to_string(),
                artist: "Nobody".to_string(),
                duration: 1.0,
            },
            SongKey {
                title: "Test".to_string(),
                artist: "Casual".to_string(),
                duration: 200.5,
            },
        ];

        let resolved = repo.resolve_song_ids(&keys).unwrap();
        assert_eq!(
            resolved,
            vec![
                Some(("S2".to_string(), "A2".to_string())),
                None,
                Some(("S1".to_string(), "A1".to_string())),
            ]
        );
    }

    #[test]
    fn test_resolution_requires_exact_duration() {
        let repo = WarehouseRepository::new(test_pool());
        repo.upsert_artists(&[artist("A1", "Casual")]).unwrap();
        repo.upsert_songs(&[song("S1", "Test", "A1", 200.5)]).unwrap();

        let keys = vec![SongKey {
            title: "Test".to_string(),
            artist: "Casual".to_string(),
            duration: 200.6,
        }];
        assert_eq!(repo.resolve_song_ids(&keys).unwrap(), vec![None]);
    }

    #[test]
    fn test_songplay_rerun_does_not_duplicate() {
        let repo = WarehouseRepository::new(test_pool());
        repo.upsert_time(&[TimeRow {
            start_time: ts(16, 35, 0),
            hour: 16,
            day: 15,
            week: 46,
            month: 11,
            year: 2018,
            weekday: 4,
        }])
        .unwrap();

        let rows = vec![play(ts(16, 35, 0), 100)];
        repo.upsert_songplays(&rows).unwrap();
        repo.upsert_songplays(&rows).unwrap();

        assert_eq!(repo.count_songplays().unwrap(), 1);
    }

    #[test]
    fn test_count_resolved_songplays() {
        let repo = WarehouseRepository::new(test_pool());
        repo.upsert_artists(&[artist("A1", "Casual")]).unwrap();
        repo.upsert_songs(&[song("S1", "Test", "A1", 200.5)]).unwrap();
        repo.upsert_time(&[
            TimeRow {
                start_time: ts(16, 35, 0),
                hour: 16,
                day: 15,
                week: 46,
                month: 11,
                year: 2018,
                weekday: 4,
            },
            TimeRow {
                start_time: ts(16, 36, 0),
                hour: 16,
                day: 15,
                week: 46,
                month: 11,
                year: 2018,
                weekday: 4,
            },
        ])
        .unwrap();

        let mut resolved = play(ts(16, 35, 0), 100);
        resolved.song_id = Some("S1".to_string());
        resolved.artist_id = Some("A1".to_string());
        let unresolved = play(ts(16, 36, 0), 100);

        repo.upsert_songplays(&[resolved, unresolved]).unwrap();

        assert_eq!(repo.count_songplays().unwrap(), 2);
        assert_eq!(repo.count_resolved_songplays().unwrap(), 1);
    }

    #[test]
    fn test_manifest_round_trip() {
        let repo = ManifestRepository::new(test_pool());
        repo.record_processed("data/log_data/2018-11-15.json", 1_542_240_000)
            .unwrap();
        repo.record_processed("data/log_data/2018-11-15.json", 1_542_326_400)
            .unwrap();

        let manifest = repo.load_all().unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(
            manifest.get("data/log_data/2018-11-15.json"),
            Some(&1_542_326_400)
        );
    }
}
