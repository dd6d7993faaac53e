//! Star-schema ETL command line interface.

use std::path::Path;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use starload::db::{DbConfig, DbPool, WarehouseRepository, drop_all_tables, run_migrations};
use starload::etl::{LoadMode, Pipeline};

/// Batch ETL loading song metadata and listening logs into a star schema.
#[derive(Parser)]
#[command(name = "starload")]
#[command(about = "Load song metadata and activity logs into a SQLite star schema")]
struct Cli {
    /// Database file path (falls back to DATABASE_URL, then starload.db)
    #[arg(short, long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema (optionally dropping existing tables first)
    InitDb {
        /// Drop all tables before creating them
        #[arg(long)]
        drop: bool,
    },

    /// Run the ETL pipeline (default)
    Run {
        /// Root directory of song metadata files
        #[arg(long, default_value = "data/song_data")]
        song_data: String,

        /// Root directory of activity log files
        #[arg(long, default_value = "data/log_data")]
        log_data: String,

        /// Reprocess all files regardless of the processed-file manifest
        #[arg(long)]
        full: bool,
    },

    /// Print the number of songplays with resolved song and artist ids
    Verify,
}

fn setup_database(database_url: &str) -> DbPool {
    let config = DbConfig::new(database_url);
    let pool = config.build_pool().expect("Failed to create database pool");

    // Run migrations
    let mut conn = pool.get().expect("Failed to get database connection");
    run_migrations(&mut conn).expect("Failed to run migrations");

    pool
}

fn run_pipeline(pool: DbPool, song_data: &str, log_data: &str, full: bool) {
    let mode = if full {
        LoadMode::Full
    } else {
        LoadMode::Incremental
    };

    let pipeline = Pipeline::new(pool);
    match pipeline.run(Path::new(song_data), Path::new(log_data), mode) {
        Ok(stats) => {
            println!("\nLoad complete:");
            println!("  Files found:         {}", stats.files_found);
            println!("  Files skipped:       {}", stats.files_skipped);
            println!("  Artists upserted:    {}", stats.artists);
            println!("  Songs upserted:      {}", stats.songs);
            println!("  Time rows upserted:  {}", stats.time_rows);
            println!("  Users upserted:      {}", stats.users);
            println!("  Songplays upserted:  {}", stats.songplays);
            println!("  Songplays resolved:  {}", stats.songplays_resolved);
        }
        Err(e) => {
            tracing::error!("ETL run failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "starload=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = cli
        .database
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| "starload.db".to_string());

    match cli.command {
        Some(Commands::InitDb { drop }) => {
            let config = DbConfig::new(&database_url);
            let pool = config.build_pool().expect("Failed to create database pool");
            let mut conn = pool.get().expect("Failed to get database connection");

            if drop {
                if let Err(e) = drop_all_tables(&mut conn) {
                    eprintln!("Failed to drop tables: {}", e);
                    std::process::exit(1);
                }
            }
            if let Err(e) = run_migrations(&mut conn) {
                eprintln!("Failed to create tables: {}", e);
                std::process::exit(1);
            }
            println!("Schema ready in {}", database_url);
        }
        Some(Commands::Run {
            song_data,
            log_data,
            full,
        }) => {
            let pool = setup_database(&database_url);
            run_pipeline(pool, &song_data, &log_data, full);
        }
        Some(Commands::Verify) => {
            let pool = setup_database(&database_url);
            let repo = WarehouseRepository::new(pool);
            match repo.count_resolved_songplays() {
                Ok(count) => {
                    println!(
                        "{} songplays have both song_id and artist_id resolved",
                        count
                    );
                }
                Err(e) => {
                    eprintln!("Verification query failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            // Default: incremental run over the conventional data layout
            let pool = setup_database(&database_url);
            run_pipeline(pool, "data/song_data", "data/log_data", false);
        }
    }
}
