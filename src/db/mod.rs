//! Database module for SQLite persistence.

pub mod connection;
pub mod repository;
pub mod schema;

pub use connection::{DbConfig, DbConn, DbPool, drop_all_tables, run_migrations};
pub use repository::{
    ArtistRow, EtlRepoError, ManifestRepository, NewSongplay, SongKey, SongRow, TimeRow, UserRow,
    WarehouseRepository,
};
