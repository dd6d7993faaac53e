//! Database schema definitions for Diesel.

diesel::table! {
    artists (artist_id) {
        artist_id -> Text,
        name -> Text,
        location -> Nullable<Text>,
        latitude -> Nullable<Double>,
        longitude -> Nullable<Double>,
    }
}

diesel::table! {
    songs (song_id) {
        song_id -> Text,
        title -> Text,
        artist_id -> Nullable<Text>,
        year -> Integer,
        duration -> Double,
    }
}

diesel::table! {
    users (user_id) {
        user_id -> Integer,
        first_name -> Nullable<Text>,
        last_name -> Nullable<Text>,
        gender -> Nullable<Text>,
        level -> Nullable<Text>,
    }
}

diesel::table! {
    time (start_time) {
        start_time -> Timestamp,
        hour -> Integer,
        day -> Integer,
        week -> Integer,
        month -> Integer,
        year -> Integer,
        weekday -> Integer,
    }
}

diesel::table! {
    songplays (songplay_id) {
        songplay_id -> Integer,
        start_time -> Timestamp,
        user_id -> Nullable<Integer>,
        level -> Nullable<Text>,
        song_id -> Nullable<Text>,
        artist_id -> Nullable<Text>,
        session_id -> Integer,
        location -> Nullable<Text>,
        user_agent -> Nullable<Text>,
    }
}

diesel::table! {
    etl_files (path) {
        path -> Text,
        mtime -> BigInt,
        processed_at -> Timestamp,
    }
}

// Define foreign key relationships
diesel::joinable!(songs -> artists (artist_id));
diesel::joinable!(songplays -> songs (song_id));
diesel::joinable!(songplays -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(
    artists,
    songs,
    users,
    time,
    songplays,
);
