//! Source file discovery and JSON-lines parsing.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use walkdir::WalkDir;

use crate::etl::EtlError;
use crate::models::{LogEvent, SongRecord};

/// Recursively discover `.json` files under a root directory, sorted for
/// deterministic processing order.
pub fn discover_json_files(root: &Path) -> Result<Vec<PathBuf>, EtlError> {
    if !root.is_dir() {
        return Err(EtlError::RootNotFound(root.display().to_string()));
    }

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        })
        .collect();

    files.sort();
    Ok(files)
}

/// Read a line-delimited JSON file into records, skipping blank lines.
fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, EtlError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| EtlError::Parse {
            path: path.display().to_string(),
            line: number + 1,
            source,
        })?;
        records.push(record);
    }

    Ok(records)
}

/// Read one song metadata file. Observed files hold a single record, but
/// every line is honored.
pub fn read_song_records(path: &Path) -> Result<Vec<SongRecord>, EtlError> {
    read_json_lines(path)
}

/// Read one activity log file.
pub fn read_log_events(path: &Path) -> Result<Vec<LogEvent>, EtlError> {
    read_json_lines(path)
}
