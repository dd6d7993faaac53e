//! Batch ETL pipeline.
//!
//! Walks the song and log directory trees, derives dimension and fact
//! rows, and loads them into the star schema with chunked upserts. The
//! run is a strict linear sequence: song files first (so the song/artist
//! dimensions exist), then log files, then a verification count.

pub mod source;
pub mod transform;

use std::path::Path;
use std::time::UNIX_EPOCH;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::db::repository::{NewSongplay, SongKey};
use crate::db::{DbPool, EtlRepoError, ManifestRepository, WarehouseRepository};
use crate::models::LogEvent;
use crate::etl::transform::NEXT_SONG_PAGE;

/// Errors that can occur during an ETL run.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Database error: {0}")]
    Database(#[from] EtlRepoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}:{line}: invalid JSON record: {source}")]
    Parse {
        path: String,
        line: usize,
        source: serde_json::Error,
    },

    #[error("Data directory not found: {0}")]
    RootNotFound(String),
}

/// Rows per upsert statement. Bounds statement size and transaction
/// duration; must also keep rows x columns under SQLite's bound-variable
/// cap (32766 for the bundled build).
pub const BATCH_SIZE: usize = 1000;

/// Load mode controlling how already-seen files are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Reprocess every file regardless of the manifest.
    Full,
    /// Skip files whose (path, mtime) match the processed-file manifest.
    #[default]
    Incremental,
}

/// Kind of source file a directory tree holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Song,
    Log,
}

/// Counters accumulated over one pipeline run.
#[derive(Debug, Default)]
pub struct LoadStats {
    pub files_found: usize,
    pub files_skipped: usize,
    pub artists: usize,
    pub songs: usize,
    pub time_rows: usize,
    pub users: usize,
    pub songplays: usize,
    pub songplays_resolved: usize,
}

/// The batch ETL pipeline.
pub struct Pipeline {
    warehouse: WarehouseRepository,
    manifest: ManifestRepository,
}

impl Pipeline {
    /// Create a new pipeline over an already-migrated database.
    pub fn new(pool: DbPool) -> Self {
        Self {
            warehouse: WarehouseRepository::new(pool.clone()),
            manifest: ManifestRepository::new(pool),
        }
    }

    /// Run the whole pipeline: song files, then log files, then the
    /// resolved-fact verification count.
    pub fn run(
        &self,
        song_root: &Path,
        log_root: &Path,
        mode: LoadMode,
    ) -> Result<LoadStats, EtlError> {
        let mut stats = LoadStats::default();

        self.process_tree(song_root, FileKind::Song, mode, &mut stats)?;
        self.process_tree(log_root, FileKind::Log, mode, &mut stats)?;

        stats.songplays_resolved = self.warehouse.count_resolved_songplays()? as usize;
        Ok(stats)
    }

    /// Enumerate one directory tree and load each file in order. A
    /// failure on any file aborts the run.
    fn process_tree(
        &self,
        root: &Path,
        kind: FileKind,
        mode: LoadMode,
        stats: &mut LoadStats,
    ) -> Result<(), EtlError> {
        let files = source::discover_json_files(root)?;
        tracing::info!("{} files found in {}", files.len(), root.display());
        stats.files_found += files.len();

        let manifest = self.manifest.load_all()?;
        let total = files.len();

        for (index, file) in files.iter().enumerate() {
            let path_key = file.display().to_string();
            let mtime = file_mtime(file)?;

            if mode == LoadMode::Incremental
                && let Some(seen) = mtime
                && manifest.get(&path_key) == Some(&seen)
            {
                tracing::debug!("skipping unchanged file {}", path_key);
                stats.files_skipped += 1;
                continue;
            }

            match kind {
                FileKind::Song => self.load_song_file(file, stats)?,
                FileKind::Log => self.load_log_file(file, stats)?,
            }

            if let Some(seen) = mtime {
                self.manifest.record_processed(&path_key, seen)?;
            }
            tracing::debug!("{}/{} files processed", index + 1, total);
        }

        Ok(())
    }

    /// Load one song metadata file: artist dimension first so the song's
    /// foreign key has a target.
    fn load_song_file(&self, path: &Path, stats: &mut LoadStats) -> Result<(), EtlError> {
        let records = source::read_song_records(path)?;

        let artist_rows: Vec<_> = records.iter().map(transform::artist_row).collect();
        let song_rows: Vec<_> = records.iter().map(transform::song_row).collect();

        for chunk in artist_rows.chunks(BATCH_SIZE) {
            self.warehouse.upsert_artists(chunk)?;
        }
        for chunk in song_rows.chunks(BATCH_SIZE) {
            self.warehouse.upsert_songs(chunk)?;
        }

        stats.artists += artist_rows.len();
        stats.songs += song_rows.len();
        Ok(())
    }

    /// Load one activity log file: time and user dimensions, then the
    /// songplay facts with per-chunk dimension resolution.
    fn load_log_file(&self, path: &Path, stats: &mut LoadStats) -> Result<(), EtlError> {
        let events = source::read_log_events(path)?;

        let mut plays: Vec<(&LogEvent, NaiveDateTime)> = Vec::new();
        for event in events.iter().filter(|e| e.page == NEXT_SONG_PAGE) {
            match transform::event_time(event.ts) {
                Some(start) => plays.push((event, start)),
                None => {
                    tracing::warn!(ts = event.ts, "skipping event with out-of-range timestamp")
                }
            }
        }

        let time_rows = transform::distinct_time_rows(plays.iter().map(|(_, start)| *start));
        for chunk in time_rows.chunks(BATCH_SIZE) {
            self.warehouse.upsert_time(chunk)?;
        }
        stats.time_rows += time_rows.len();

        let user_rows = transform::latest_users(plays.iter().map(|(event, _)| *event));
        for chunk in user_rows.chunks(BATCH_SIZE) {
            self.warehouse.upsert_users(chunk)?;
        }
        stats.users += user_rows.len();

        let drafts: Vec<_> = plays
            .iter()
            .map(|(event, start)| transform::songplay_draft(event, *start))
            .collect();

        for chunk in drafts.chunks(BATCH_SIZE) {
            let rows = self.resolve_chunk(chunk)?;
            self.warehouse.upsert_songplays(&rows)?;
            stats.songplays += rows.len();
        }

        Ok(())
    }

    /// Fill song_id/artist_id into one chunk of drafts. Drafts without a
    /// lookup key, and keys with no dimension match, keep NULL in both
    /// columns.
    fn resolve_chunk(
        &self,
        chunk: &[transform::SongplayDraft],
    ) -> Result<Vec<NewSongplay>, EtlError> {
        let mut rows: Vec<NewSongplay> = chunk.iter().map(|draft| draft.row.clone()).collect();

        let mut positions: Vec<usize> = Vec::new();
        let mut keys: Vec<SongKey> = Vec::new();
        for (at, draft) in chunk.iter().enumerate() {
            if let Some(key) = &draft.key {
                positions.push(at);
                keys.push(key.clone());
            }
        }

        let resolved = self.warehouse.resolve_song_ids(&keys)?;
        for (at, hit) in positions.into_iter().zip(resolved) {
            if let Some((song_id, artist_id)) = hit {
                rows[at].song_id = Some(song_id);
                rows[at].artist_id = Some(artist_id);
            }
        }

        Ok(rows)
    }
}

/// File modification time as Unix seconds, if the filesystem reports one.
fn file_mtime(path: &Path) -> Result<Option<i64>, EtlError> {
    let metadata = std::fs::metadata(path)?;
    Ok(metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64))
}
