use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use reqsync_sync::{
    collaboflow_client, connect_store, fetch_and_normalize, run_sync_once, SyncConfig, SyncError,
};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reqsync")]
#[command(about = "Copy approved purchase requisitions from Collaboflow into a database")]
struct Cli {
    /// YAML file with table_name and request_factory_list
    #[arg(long, global = true, default_value = "config.yml")]
    config: PathBuf,

    #[arg(long, global = true, default_value = "check_approved_requests.log")]
    log_file: PathBuf,

    /// Log to stderr only
    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch documents approved since today and store the new ones
    Sync(SyncArgs),
    /// Create the destination table if it is missing
    Migrate,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Approval date lower bound (YYYY-MM-DD); defaults to today
    #[arg(long)]
    since: Option<NaiveDate>,

    /// Workflow form to search; defaults to the configured form_id
    #[arg(long)]
    form_id: Option<i64>,

    /// Print normalized documents as JSON lines without writing to the database
    #[arg(long)]
    dry_run: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

/// Loads `KEY=value` pairs into the process environment. Variables that are
/// already set win; a missing file is not an error.
fn load_env_file(path: &Path) -> bool {
    dotenv::from_path(path).is_ok()
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    load_env_file(Path::new(".env"));
    let cli = Cli::parse();
    init_logging((!cli.no_log_file).then_some(cli.log_file.as_path()))?;

    let mut config = SyncConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            if let Some(form_id) = args.form_id {
                config.form_id = form_id;
            }
            let today = args.since.unwrap_or_else(|| Local::now().date_naive());
            if args.dry_run {
                dry_run(&config, today).await
            } else {
                sync(&config, today, args.json).await
            }
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.ensure_table().await?;
            store.close().await;
            println!(
                "table {} is ready in {}",
                config.table,
                config.database_label()
            );
            Ok(())
        }
    }
}

async fn sync(config: &SyncConfig, today: NaiveDate, json: bool) -> Result<()> {
    match run_sync_once(config, today).await {
        Ok(summary) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "saved approved documents to table {} in {}",
                    summary.table,
                    config.database_label()
                );
                println!("newly added: {}", summary.newly_added);
            }
            if summary.newly_added > 0 {
                info!(
                    table = %summary.table,
                    newly_added = summary.newly_added,
                    "saved approved documents"
                );
            }
            Ok(())
        }
        Err(SyncError::Fetch(err)) => {
            println!("could not retrieve search results: {err}");
            error!(error = %err, "document search failed; nothing was written");
            Err(err.into())
        }
        Err(SyncError::Persist(err)) => {
            println!("database error: {err}");
            error!(error = %err, "persisting documents failed; transaction rolled back");
            Err(err.into())
        }
    }
}

async fn dry_run(config: &SyncConfig, today: NaiveDate) -> Result<()> {
    let client = collaboflow_client(config)?;
    let (fetched, normalized) =
        fetch_and_normalize(&client, config.form_id, today, &config.factory_map)
            .await
            .inspect_err(|err| println!("could not retrieve search results: {err}"))?;
    for document in &normalized.documents {
        println!("{}", serde_json::to_string(document)?);
    }
    info!(
        fetched,
        normalized = normalized.documents.len(),
        rejected = normalized.rejected.len(),
        "dry run finished; nothing was written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_file_fills_unset_variables_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "REQSYNC_CLI_TEST_API_URL=https://collaboflow.test/api\nREQSYNC_CLI_TEST_USER_ID=from-file\n",
        )
        .unwrap();
        std::env::set_var("REQSYNC_CLI_TEST_USER_ID", "from-shell");

        assert!(load_env_file(&path));
        assert_eq!(
            std::env::var("REQSYNC_CLI_TEST_API_URL").unwrap(),
            "https://collaboflow.test/api"
        );
        assert_eq!(std::env::var("REQSYNC_CLI_TEST_USER_ID").unwrap(), "from-shell");
    }

    #[test]
    fn missing_env_file_is_ignored() {
        let dir = tempdir().unwrap();
        assert!(!load_env_file(&dir.path().join(".env")));
    }
}
