//! Intake command-line shell.
//!
//! Drives the core through the v1 API so the same commands the touch UI uses
//! can be run from a terminal or a script.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use intake_core::api::v1::{self, ApiResult, ApiState};
use intake_core::inbound::InboundStatus;
use intake_core::session::{AdminGate, Identity};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "intake")]
#[command(about = "Offline intake of delivery documents")]
#[command(version)]
struct Cli {
    /// Directory holding the intake database
    #[arg(long, env = "INTAKE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Name recorded as the actor of every change
    #[arg(long, env = "INTAKE_USER")]
    user: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a delivery document
    NewInbound {
        #[arg(long)]
        ls_nr: String,
        #[arg(long)]
        supplier: String,
        /// Document date, YYYY-MM-DD
        #[arg(long)]
        date: String,
        /// Create even if a matching document exists
        #[arg(long)]
        force: bool,
    },

    /// Check an image file and attach it as the next page
    Capture { inbound_id: String, file: PathBuf },

    /// Mark the pages of a document as printed and filed
    Confirm { inbound_id: String },

    /// List the pages of a document
    Pages { inbound_id: String },

    /// List documents awaiting their drawing
    Open,

    /// Show pages not yet uploaded
    Pending,

    /// Show the audit trail of one document, or the latest actions
    History {
        inbound_id: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Upload pending pages
    Sync {
        /// Pretend the device is offline
        #[arg(long)]
        offline: bool,
    },

    /// Add a line to the reorder cart
    CartAdd {
        name: String,
        qty: u32,
        #[arg(long, default_value = "")]
        note: String,
    },

    /// Write the cart as CSV to stdout or a file
    ExportCart {
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Set the admin PIN if none is configured yet
    ProvisionPin { pin: String },

    /// List settings
    Settings,

    /// Change a setting (requires the admin PIN)
    Set {
        key: String,
        /// JSON value, e.g. `false` or `45.0`
        value: String,
        #[arg(long, env = "INTAKE_ADMIN_PIN")]
        pin: String,
    },
}

fn workspace_dir() -> PathBuf {
    if let Some(proj) = ProjectDirs::from("com", "Intake", "Intake") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("Intake")
    }
}

fn api<T>(result: ApiResult<T>) -> Result<T> {
    result.map_err(|e| anyhow!("[{}] {}\n{}", e.code, e.message, e.explain))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let identity = Identity::new(cli.user.as_str()).context("invalid --user")?;
    let data_dir = cli.data_dir.unwrap_or_else(workspace_dir);
    let state = ApiState::open(data_dir, identity.clone()).await?;

    match cli.command {
        Commands::NewInbound {
            ls_nr,
            supplier,
            date,
            force,
        } => {
            let input = v1::CreateInboundInput {
                ls_nr,
                supplier,
                date_doc: date,
                force,
            };
            print_json(&api(v1::create_inbound(&state, input).await)?)?;
        }
        Commands::Capture { inbound_id, file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let input = v1::CapturePageInput { inbound_id, bytes };
            print_json(&api(v1::capture_page(&state, input).await)?)?;
        }
        Commands::Confirm { inbound_id } => {
            print_json(&api(v1::confirm_drawing(&state, &inbound_id).await)?)?;
        }
        Commands::Pages { inbound_id } => {
            let pages = state.registry.pages(&inbound_id).await.map_err(v1::ApiError::from);
            print_json(&api(pages)?)?;
        }
        Commands::Open => {
            let docs = v1::list_by_status(&state, InboundStatus::AwaitingDrawing).await;
            print_json(&api(docs)?)?;
        }
        Commands::Pending => {
            print_json(&api(v1::pending_uploads(&state).await)?)?;
        }
        Commands::History { inbound_id, limit } => {
            let entries = match inbound_id {
                Some(id) => v1::inbound_history(&state, &id).await,
                None => v1::recent_activity(&state, limit).await,
            };
            print_json(&api(entries)?)?;
        }
        Commands::Sync { offline } => {
            print_json(&api(v1::sync_now(&state, !offline).await)?)?;
        }
        Commands::CartAdd { name, qty, note } => {
            let input = v1::CartLineInput { name, qty, note };
            print_json(&api(v1::add_cart_line(&state, input).await)?)?;
        }
        Commands::ExportCart { out } => {
            let csv = api(v1::export_cart(&state).await)?;
            match out {
                Some(path) => tokio::fs::write(&path, csv)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => print!("{csv}"),
            }
        }
        Commands::ProvisionPin { pin } => {
            let provisioned = AdminGate::provision(&state.store, &identity, &pin)
                .await
                .map_err(v1::ApiError::from);
            if api(provisioned)? {
                log::info!("admin PIN configured");
            } else {
                return Err(anyhow!("an admin PIN is already configured"));
            }
        }
        Commands::Settings => {
            print_json(&api(v1::list_settings(&state).await)?)?;
        }
        Commands::Set { key, value, pin } => {
            let value: serde_json::Value = serde_json::from_str(&value)
                .with_context(|| format!("{value} is not a JSON value"))?;
            let session = api(v1::unlock_admin(&state, &pin).await)?;
            let changed = v1::update_setting(&state, &session, &key, value).await;
            print_json(&api(changed)?)?;
        }
    }
    Ok(())
}
