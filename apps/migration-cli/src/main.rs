use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use db_infra::{orchestrate_revision, DbKind, MigrateConfig, RuntimeEnv};
use migration::Description;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "migration=info,db_infra=info,sqlx=warn";

#[derive(Clone, Debug, ValueEnum)]
enum Env {
    Prod,
    Test,
}

#[derive(Clone, Debug, ValueEnum)]
enum Db {
    Postgres,
    SqliteFile,
}

#[derive(Parser, Debug)]
#[command(name = "migration")]
#[command(about = "Generate a schema revision from the declared model and apply it")]
struct Args {
    /// What the revision changes, e.g. "add user table"
    description: Option<String>,

    /// Runtime environment
    #[arg(short, long, value_enum, default_value = "prod")]
    env: Env,

    /// Database type
    #[arg(
        short,
        long,
        value_enum,
        default_value = "postgres",
        help = "Database type: postgres, sqlite-file"
    )]
    db: Db,

    /// Artifact store directory (overrides MIGRATIONS_DIR)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Declared model file (overrides MODEL_PATH)
    #[arg(long)]
    model: Option<PathBuf>,
}

fn print_supported_databases() {
    eprintln!("❌ Unsupported database type provided.");
    eprintln!();
    eprintln!("Note: SQLite in-memory databases are not supported for CLI operations.");
    eprintln!("Reason: an in-memory database disappears when the command exits, so the");
    eprintln!("applied revision would be lost immediately.");
    eprintln!();
    eprintln!("Supported database types:");
    eprintln!("  • postgres    - PostgreSQL database");
    eprintln!("  • sqlite-file - SQLite file database (path from SQLITE_DB_PATH)");
    eprintln!();
    eprintln!("Example: migration --db sqlite-file \"add user table\"");
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .without_time()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_env_filter(filter)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let rendered = e.to_string();
            if e.kind() == ErrorKind::InvalidValue && rendered.contains("--db") {
                print_supported_databases();
                return ExitCode::from(2);
            }
            // Help and version go to stdout with exit 0, real errors exit 2.
            e.exit();
        }
    };

    let Some(raw) = args.description.as_deref() else {
        eprintln!("A revision description is required, e.g.: migration \"add user table\"");
        return ExitCode::from(1);
    };
    let description = match Description::new(raw) {
        Ok(description) => description,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    let env = match args.env {
        Env::Prod => RuntimeEnv::Prod,
        Env::Test => RuntimeEnv::Test,
    };
    let db_kind = match args.db {
        Db::Postgres => DbKind::Postgres,
        Db::SqliteFile => DbKind::SqliteFile,
    };

    // Variables already set in the process take precedence over `.env`.
    dotenvy::dotenv().ok();

    let mut config = match MigrateConfig::from_env(env, db_kind) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Migration failed: {e}");
            return ExitCode::from(1);
        }
    };
    if let Some(store) = args.store {
        config = config.with_store_dir(store);
    }
    if let Some(model) = args.model {
        config = config.with_model_path(model);
    }
    info!(env = ?env, db_kind = ?db_kind, "configuration resolved");

    match orchestrate_revision(&config, description.as_str()).await {
        Ok(outcome) => {
            println!(
                "✅ Generated revision {} ({}) in {}",
                outcome.artifact.revision,
                outcome.artifact.file_name(),
                config.store_dir.display()
            );
            println!(
                "✅ Applied {} revision(s); database is at {}",
                outcome.applied.len(),
                outcome.marker.as_deref().unwrap_or("<base>")
            );
            ExitCode::SUCCESS
        }
        Err(e) if e.is_usage() => {
            eprintln!("{e}");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("Migration failed: {e}");
            ExitCode::from(1)
        }
    }
}
