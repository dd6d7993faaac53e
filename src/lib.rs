//! Batch ETL pipeline loading song metadata and listening logs into a
//! star schema.

pub mod db;
pub mod etl;
pub mod models;
