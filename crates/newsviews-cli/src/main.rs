use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use newsviews::{Command, Config, CursorAction, ExportFormat};
use newsviews_client::{ChatModerationClient, LocalImageStore, SheetsAuth, SheetsClient};
use newsviews_core::{
    load_config, AppConfig, AppError, CursorStore, PassOutcome, Scheduler, StopOutcome,
    Storage, Submission, SubmissionDraft, SubmissionFilter, SubmissionStatus, SyncEngine,
    SyncSummary,
};
use newsviews_db::SubmissionRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Parse command line arguments
    let config = Config::parse();

    // Setup logging (stderr to keep stdout clean for exports)
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(config).await {
        match operator_hint(&e) {
            Some(hint) => {
                error!("{:#}", e);
                eprintln!("\n{}", hint);
                std::process::exit(1);
            }
            None => return Err(e),
        }
    }
    Ok(())
}

/// The operator hint for the storage or transport error behind `e`, if any.
fn operator_hint(e: &anyhow::Error) -> Option<String> {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<AppError>())
        .map(AppError::user_message)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let app_config =
        load_config(config.config.as_deref()).context("Failed to load configuration")?;
    app_config.validate().context("Invalid configuration")?;

    // Database connection
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(app_config.db.max_connections)
        .connect(&config.database_url)
        .await
        .map_err(AppError::from)
        .context("Failed to connect to database")?;
    newsviews_db::migrate(&pool)
        .await
        .context("Failed to run database migrations")?;

    let repo = SubmissionRepository::new(pool);

    // Execute command
    match config.command.clone() {
        Command::Sync => {
            let engine = build_engine(&config, &app_config, &repo)?;
            sync_once(&engine).await?;
        }
        Command::Serve { interval } => {
            let engine = build_engine(&config, &app_config, &repo)?;
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| app_config.sync.interval());
            serve(Arc::new(engine), interval).await?;
        }
        Command::List {
            format,
            status,
            city,
            category,
            origin,
            limit,
            offset,
        } => {
            let filter = SubmissionFilter {
                status,
                city,
                category,
                origin,
            };
            list(&repo, format, &filter, limit, offset).await?;
        }
        Command::Show { id } => {
            let submission = repo
                .get(&id)
                .await?
                .ok_or(AppError::SubmissionNotFound(id))?;
            println!("{}", serde_json::to_string_pretty(&submission)?);
        }
        Command::Stats => {
            show_stats(&repo).await?;
        }
        Command::Submit {
            title,
            description,
            city,
            category,
            publisher_name,
            publisher_phone,
            image,
        } => {
            let engine = build_engine(&config, &app_config, &repo)?;
            let draft = SubmissionDraft {
                title,
                description,
                city,
                category,
                publisher_name,
                publisher_phone,
                image_reference: image,
            };
            submit(&engine, draft).await?;
        }
        Command::Cursor { action } => match action {
            CursorAction::Show => {
                show_cursor(&repo, &app_config.sync.source_name).await?;
            }
            CursorAction::Reset => {
                let engine = build_engine(&config, &app_config, &repo)?;
                engine.reset_cursor().await?;
                println!(
                    "Cursor for '{}' reset. The next pass re-reads the whole sheet.",
                    app_config.sync.source_name
                );
            }
        },
    }

    Ok(())
}

/// Wire the Sheets source, repository, moderation and image store into an engine
fn build_engine(
    config: &Config,
    app_config: &AppConfig,
    repo: &SubmissionRepository,
) -> anyhow::Result<SyncEngine> {
    app_config
        .validate_for_sync()
        .context("Sync needs a configured spreadsheet")?;

    let auth = match (&config.sheets_token, &config.google_api_key) {
        (Some(token), _) => SheetsAuth::Bearer(token.clone()),
        (None, Some(key)) => {
            warn!("Using GOOGLE_API_KEY: rows can be read but not annotated");
            SheetsAuth::ApiKey(key.clone())
        }
        (None, None) => {
            anyhow::bail!("Set GOOGLE_SHEETS_TOKEN or GOOGLE_API_KEY to read the form sheet")
        }
    };

    let sheets = SheetsClient::new(
        app_config.sheet.clone(),
        &app_config.http,
        auth,
        app_config.sync.has_header_row,
    )
    .context("Failed to create Sheets client")?;

    let repo = Arc::new(repo.clone());
    let mut engine = SyncEngine::new(
        Arc::new(sheets),
        repo.clone(),
        repo,
        app_config.sync.clone(),
    )
    .with_image_store(Arc::new(LocalImageStore::new(config.image_dir.clone())));

    if app_config.moderation.enabled {
        match &config.moderation_api_key {
            Some(key) => {
                let moderation =
                    ChatModerationClient::new(&app_config.moderation, &app_config.http, key)
                        .context("Failed to create moderation client")?
                        .with_image_root(config.image_dir.clone());
                engine = engine.with_moderation(Arc::new(moderation));
            }
            None => {
                warn!("Image moderation is enabled but MODERATION_API_KEY is not set; images pass unchecked");
            }
        }
    }

    Ok(engine)
}

/// Run a single reconciliation pass
async fn sync_once(engine: &SyncEngine) -> anyhow::Result<()> {
    engine.load().await.context("Failed to load sync cursor")?;

    match engine.run_pass(&CancellationToken::new()).await? {
        PassOutcome::Completed(summary) => print_summary(&summary),
        PassOutcome::AlreadyRunning => info!("A pass is already running"),
    }
    Ok(())
}

/// Run the scheduler until Ctrl+C
async fn serve(engine: Arc<SyncEngine>, interval: Duration) -> anyhow::Result<()> {
    engine.load().await.context("Failed to load sync cursor")?;

    let scheduler = Scheduler::new(engine);
    scheduler.start(interval).await;
    info!(
        interval_secs = interval.as_secs(),
        "Scheduler started. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down...");

    match scheduler.stop().await {
        StopOutcome::Joined => info!("Scheduler stopped"),
        StopOutcome::Abandoned => warn!("Running pass did not finish in time and was abandoned"),
        StopOutcome::NotRunning => {}
    }

    let status = scheduler.status().await;
    if let Some(summary) = status.last_summary {
        print_summary(&summary);
    }
    if let Some(error) = status.last_error {
        warn!(error = %error, "Last pass failed");
    }
    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    let stats = &summary.stats;

    println!("\nSync Summary\n");
    println!("  Approved:              {}", stats.approved);
    println!("  Rejected:              {}", stats.rejected);
    println!("  Duplicates:            {}", stats.duplicate);
    println!("  Already present:       {}", stats.already_present);
    println!("  Stale:                 {}", stats.stale);
    println!("  Malformed:             {}", stats.malformed);
    println!("  Failed:                {}", stats.failed);
    println!("  Deleted:               {}", summary.deleted);
    println!(
        "  Cursor:                row {} at {}",
        summary.cursor.last_processed_row,
        summary.cursor.last_processed_time.format("%Y-%m-%dT%H:%M:%SZ")
    );
    if summary.cancelled {
        println!("  Pass was cancelled before completion");
    }
    for error in &summary.errors {
        println!("  Error: {}", error);
    }
    println!();
}

/// Submit a news item directly
async fn submit(engine: &SyncEngine, draft: SubmissionDraft) -> anyhow::Result<()> {
    let stored = engine.submit_direct(draft).await?;

    match stored.status {
        SubmissionStatus::Approved => info!(id = %stored.id, "Submission approved"),
        status => warn!(id = %stored.id, status = %status, "Submission not approved"),
    }
    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}

/// Show the persisted cursor for a source
async fn show_cursor(repo: &SubmissionRepository, source: &str) -> anyhow::Result<()> {
    match repo.load_cursor(source).await? {
        Some(cursor) => println!("{}", serde_json::to_string_pretty(&cursor)?),
        None => println!("No cursor stored for '{}'. The next pass starts from the top.", source),
    }
    Ok(())
}

/// Show database statistics
async fn show_stats(repo: &SubmissionRepository) -> anyhow::Result<()> {
    let stats = repo.get_stats().await?;

    println!("\nDatabase Statistics\n");
    println!("  Total submissions:     {}", stats.total_submissions);
    println!("  Approved:              {}", stats.approved);
    println!("  Rejected:              {}", stats.rejected);
    println!("  Duplicates:            {}", stats.duplicate);
    println!("  Pending:               {}", stats.pending);
    println!("  From the form sheet:   {}", stats.from_sheet);
    if let Some(last_update) = stats.last_update {
        println!("  Last update:           {}", last_update);
    }
    println!();

    Ok(())
}

/// List submissions in the requested format
async fn list(
    repo: &SubmissionRepository,
    format: ExportFormat,
    filter: &SubmissionFilter,
    limit: usize,
    offset: usize,
) -> anyhow::Result<()> {
    let submissions = repo.query(filter, limit, offset).await?;

    if submissions.is_empty() {
        eprintln!("No submissions found.");
        return Ok(());
    }

    match format {
        ExportFormat::Jsonl => {
            export_jsonl(&submissions)?;
        }
        ExportFormat::Json => {
            export_json(&submissions)?;
        }
        ExportFormat::Csv => {
            export_csv(&submissions);
        }
    }

    info!("Listed {} submissions", submissions.len());
    Ok(())
}

/// Export submissions in JSON Lines format (one JSON object per line)
fn export_jsonl(submissions: &[Submission]) -> anyhow::Result<()> {
    for submission in submissions {
        println!("{}", serde_json::to_string(submission)?);
    }
    Ok(())
}

/// Export submissions as a JSON array
fn export_json(submissions: &[Submission]) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(submissions)?);
    Ok(())
}

/// Export submissions in CSV format
fn export_csv(submissions: &[Submission]) {
    println!("id,status,origin,title,city,category,publisher_name,created_at,duplicate_of");

    for submission in submissions {
        println!("{}", csv_line(submission));
    }
}

fn csv_line(submission: &Submission) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{}",
        escape_csv(&submission.id),
        submission.status,
        submission.origin,
        escape_csv(&submission.title),
        escape_csv(&submission.city),
        escape_csv(&submission.category),
        escape_csv(&submission.publisher_name),
        submission.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
        submission
            .duplicate_of
            .as_deref()
            .map(escape_csv)
            .unwrap_or_default(),
    )
}

/// Escape a string for CSV output
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
