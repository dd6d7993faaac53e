//! Derivation of dimension and fact rows from parsed input records.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};

use crate::db::repository::{ArtistRow, NewSongplay, SongKey, SongRow, TimeRow, UserRow};
use crate::models::{LogEvent, SongRecord};

/// Page value marking an event as an actual song play.
pub const NEXT_SONG_PAGE: &str = "NextSong";

/// A songplay fact row awaiting dimension resolution.
///
/// The lookup key is dropped once song_id/artist_id are filled in,
/// mirroring the original's helper-column cleanup.
#[derive(Debug, Clone)]
pub struct SongplayDraft {
    pub row: NewSongplay,
    pub key: Option<SongKey>,
}

/// Parse an epoch-millisecond event timestamp, truncated to second
/// precision (the grain of the time dimension).
pub fn event_time(ts_ms: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(ts_ms.div_euclid(1000), 0).map(|dt| dt.naive_utc())
}

/// Derive the time-dimension fields for one timestamp. Weekday is
/// Monday=1 through Sunday=7, the source data's weekday+1 convention.
pub fn time_row(start: NaiveDateTime) -> TimeRow {
    TimeRow {
        hour: start.hour() as i32,
        day: start.day() as i32,
        week: start.iso_week().week() as i32,
        month: start.month() as i32,
        year: start.year(),
        weekday: start.weekday().number_from_monday() as i32,
        start_time: start,
    }
}

/// Collapse event timestamps to distinct time rows, keeping first-seen
/// order. Running this over its own output is a no-op.
pub fn distinct_time_rows<I>(starts: I) -> Vec<TimeRow>
where
    I: IntoIterator<Item = NaiveDateTime>,
{
    let mut seen = HashSet::new();
    starts
        .into_iter()
        .filter(|start| seen.insert(*start))
        .map(time_row)
        .collect()
}

/// Derive user rows from events, collapsed to one row per user id with
/// last-write-wins semantics (most recent subscription level survives).
/// Events without a user id contribute nothing.
pub fn latest_users<'a, I>(events: I) -> Vec<UserRow>
where
    I: IntoIterator<Item = &'a LogEvent>,
{
    let mut index: HashMap<i32, usize> = HashMap::new();
    let mut rows: Vec<UserRow> = Vec::new();

    for event in events {
        let Some(user_id) = event.user_id else {
            continue;
        };
        let row = UserRow {
            user_id,
            first_name: event.first_name.clone(),
            last_name: event.last_name.clone(),
            gender: event.gender.as_deref().map(str::to_uppercase),
            level: event.level.clone(),
        };
        match index.get(&user_id) {
            Some(&at) => rows[at] = row,
            None => {
                index.insert(user_id, rows.len());
                rows.push(row);
            }
        }
    }

    rows
}

/// Derive a songplay draft from one event. The lookup key is only present
/// when the event carries all three resolution fields.
pub fn songplay_draft(event: &LogEvent, start: NaiveDateTime) -> SongplayDraft {
    let key = match (&event.song, &event.artist, event.length) {
        (Some(title), Some(artist), Some(duration)) => Some(SongKey {
            title: title.clone(),
            artist: artist.clone(),
            duration,
        }),
        _ => None,
    };

    SongplayDraft {
        row: NewSongplay {
            start_time: start,
            user_id: event.user_id,
            level: event.level.clone(),
            song_id: None,
            artist_id: None,
            session_id: event.session_id,
            location: event.location.clone(),
            user_agent: event.user_agent.clone(),
        },
        key,
    }
}

/// Project the artist dimension columns from a song record. Empty
/// location strings in the source data become NULL.
pub fn artist_row(record: &SongRecord) -> ArtistRow {
    ArtistRow {
        artist_id: record.artist_id.clone(),
        name: record.artist_name.clone(),
        location: record
            .artist_location
            .as_deref()
            .filter(|loc| !loc.is_empty())
            .map(str::to_string),
        latitude: record.artist_latitude,
        longitude: record.artist_longitude,
    }
}

/// Project the song dimension columns from a song record.
pub fn song_row(record: &SongRecord) -> SongRow {
    SongRow {
        song_id: record.song_id.clone(),
        title: record.title.clone(),
        artist_id: Some(record.artist_id.clone()),
        year: record.year,
        duration: record.duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_song_event(ts: i64, user_id: Option<i32>, level: &str) -> LogEvent {
        LogEvent {
            ts,
            page: NEXT_SONG_PAGE.to_string(),
            user_id,
            first_name: Some("Jayden".to_string()),
            last_name: Some("Fox".to_string()),
            gender: Some("m".to_string()),
            level: Some(level.to_string()),
            song: Some("Eye Of The Tiger".to_string()),
            artist: Some("Survivor".to_string()),
            length: Some(245.36771),
            session_id: 100,
            location: Some("New Orleans-Metairie, LA".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        }
    }

    #[test]
    fn test_event_time_truncates_to_seconds() {
        // 2018-11-15T16:35:00.796Z
        let start = event_time(1_542_299_700_796).unwrap();
        assert_eq!(start.to_string(), "2018-11-15 16:35:00");
    }

    #[test]
    fn test_time_row_derived_fields() {
        // 2018-11-15 was a Thursday in ISO week 46.
        let start = event_time(1_542_299_700_796).unwrap();
        let row = time_row(start);
        assert_eq!(row.hour, 16);
        assert_eq!(row.day, 15);
        assert_eq!(row.week, 46);
        assert_eq!(row.month, 11);
        assert_eq!(row.year, 2018);
        assert_eq!(row.weekday, 4);
    }

    #[test]
    fn test_distinct_time_rows_collapses_duplicates() {
        let a = event_time(1_542_299_700_796).unwrap();
        let b = event_time(1_542_299_700_998).unwrap(); // same second as a
        let c = event_time(1_542_299_761_000).unwrap();

        let rows = distinct_time_rows([a, b, c]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].start_time, a);
        assert_eq!(rows[1].start_time, c);
    }

    #[test]
    fn test_distinct_time_rows_is_idempotent() {
        let starts = vec![
            event_time(1_542_299_700_000).unwrap(),
            event_time(1_542_299_700_500).unwrap(),
            event_time(1_542_299_761_000).unwrap(),
        ];
        let once = distinct_time_rows(starts);
        let twice = distinct_time_rows(once.iter().map(|r| r.start_time));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_latest_users_keeps_last_occurrence() {
        let events = vec![
            next_song_event(1, Some(7), "free"),
            next_song_event(2, Some(9), "free"),
            next_song_event(3, Some(7), "paid"),
        ];

        let rows = latest_users(&events);
        assert_eq!(rows.len(), 2);
        let user7 = rows.iter().find(|r| r.user_id == 7).unwrap();
        assert_eq!(user7.level.as_deref(), Some("paid"));
    }

    #[test]
    fn test_latest_users_uppercases_gender() {
        let rows = latest_users(&[next_song_event(1, Some(7), "free")]);
        assert_eq!(rows[0].gender.as_deref(), Some("M"));
    }

    #[test]
    fn test_latest_users_skips_anonymous_events() {
        let rows = latest_users(&[next_song_event(1, None, "free")]);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_songplay_draft_carries_lookup_key() {
        let event = next_song_event(1_542_299_700_796, Some(7), "free");
        let draft = songplay_draft(&event, event_time(event.ts).unwrap());

        let key = draft.key.unwrap();
        assert_eq!(key.title, "Eye Of The Tiger");
        assert_eq!(key.artist, "Survivor");
        assert!(draft.row.song_id.is_none());
        assert_eq!(draft.row.session_id, 100);
    }

    #[test]
    fn test_songplay_draft_without_song_has_no_key() {
        let mut event = next_song_event(1, Some(7), "free");
        event.song = None;
        let draft = songplay_draft(&event, event_time(event.ts).unwrap());
        assert!(draft.key.is_none());
    }

    #[test]
    fn test_artist_row_blank_location_becomes_null() {
        let record = SongRecord {
            artist_id: "A1".to_string(),
            artist_name: "Casual".to_string(),
            artist_location: Some(String::new()),
            artist_latitude: None,
            artist_longitude: None,
            song_id: "S1".to_string(),
            title: "Test".to_string(),
            year: 0,
            duration: 218.93179,
        };
        assert!(artist_row(&record).location.is_none());

        let song = song_row(&record);
        assert_eq!(song.artist_id.as_deref(), Some("A1"));
        assert_eq!(song.year, 0);
    }
}
