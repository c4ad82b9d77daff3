use clap::{Parser, Subcommand, ValueEnum};
use newsviews_core::{Origin, SubmissionStatus};
use std::path::PathBuf;

/// Command line and environment for the `newsviews` binary
#[derive(Parser, Debug)]
#[command(name = "newsviews")]
#[command(
    author,
    version,
    about = "Reconciles Google Form news submissions into the NewsViews database"
)]
#[command(after_help = "Examples:
  newsviews sync
  newsviews serve --interval 150
  newsviews list --status approved --format csv > approved.csv
  newsviews stats")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Path to the TOML configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// OAuth access token for the Google Sheets API (required for row annotations)
    #[arg(long, env = "GOOGLE_SHEETS_TOKEN", hide_env_values = true)]
    pub sheets_token: Option<String>,

    /// Google API key for reading a public sheet
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    pub google_api_key: Option<String>,

    /// API key for the image moderation service
    #[arg(long, env = "MODERATION_API_KEY", hide_env_values = true)]
    pub moderation_api_key: Option<String>,

    /// Directory that relative image references resolve against
    #[arg(long, env = "IMAGE_DIR", value_name = "DIR")]
    pub image_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a single reconciliation pass against the form sheet
    Sync,
    /// Keep the database in sync on a timer until interrupted
    #[command(after_help = "Examples:
  newsviews serve                 # Interval from config (default 150s)
  newsviews serve --interval 60")]
    Serve {
        /// Seconds between passes (shortened to a third after a pass adds rows)
        #[arg(short, long, value_name = "SECS")]
        interval: Option<u64>,
    },
    /// List stored submissions
    #[command(after_help = "Examples:
  newsviews list --status duplicate
  newsviews list --city Lagos --format json
  newsviews list --origin direct --limit 20 --offset 40")]
    List {
        /// Output format
        #[arg(short, long, default_value = "jsonl")]
        format: ExportFormat,
        /// Filter by status (pending, approved, rejected, duplicate)
        #[arg(short, long)]
        status: Option<SubmissionStatus>,
        /// Filter by city (case-insensitive)
        #[arg(long)]
        city: Option<String>,
        /// Filter by category (case-insensitive)
        #[arg(long)]
        category: Option<String>,
        /// Filter by origin (sheet, direct)
        #[arg(long)]
        origin: Option<Origin>,
        /// Maximum number of submissions to return
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Number of submissions to skip
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show one submission as JSON
    Show {
        /// Submission id
        id: String,
    },
    /// Show database statistics
    Stats,
    /// Submit a news item directly, through the same content gate as the sheet
    Submit {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        city: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        publisher_name: String,
        #[arg(long)]
        publisher_phone: String,
        /// Image path or URL
        #[arg(long, value_name = "REF")]
        image: Option<String>,
    },
    /// Inspect or reset the sync cursor
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
}

/// Cursor maintenance actions
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorAction {
    /// Print the persisted cursor
    Show,
    /// Reset the cursor so the next pass re-reads the whole sheet
    Reset,
}

/// Output formats for `list`
#[derive(Debug, Clone, ValueEnum)]
pub enum ExportFormat {
    /// One JSON object per line
    Jsonl,
    /// A single pretty-printed JSON array
    Json,
    /// One header line, then one CSV line per submission
    Csv,
}
