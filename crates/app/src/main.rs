use anyhow::{bail, Context};
use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tally_core::money::format_cents;
use tally_import::{ConfirmOutcome, ImportConfig, ImportController, PendingBatches, UploadOutcome};

#[derive(Parser)]
#[command(name = "tally", about = "Personal ledger with bank-statement import")]
struct Cli {
    /// Path to the ledger database.
    #[arg(long, default_value = "ledger.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account.
    AddAccount { name: String },

    /// Show an account's balances.
    Balance {
        #[arg(long)]
        account: i64,
    },

    /// Import a QFX/OFX or CSV bank statement into an account.
    Import {
        #[arg(long)]
        account: i64,

        /// Statement file; the extension selects the parser.
        file: PathBuf,

        /// Ignore statement records dated before this day. Defaults to the
        /// account's saved cutoff, or 30 days ago for a first import.
        #[arg(long)]
        cutoff: Option<NaiveDate>,

        /// Optional TOML file overriding the import settings.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let pool = tally_storage::create_db(&cli.db)
        .await
        .with_context(|| format!("opening database {}", cli.db.display()))?;

    match cli.command {
        Command::AddAccount { name } => {
            let mut conn = pool.acquire().await?;
            let id = tally_storage::create_account(&mut conn, &name).await?;
            println!("Created account {id}: {name}");
        }
        Command::Balance { account } => {
            let mut conn = pool.acquire().await?;
            let account = tally_storage::account_by_id(&mut conn, account)
                .await?
                .with_context(|| format!("no account with id {account}"))?;
            println!("{}", account.name);
            println!("  balance:    {}", format_cents(account.balance_cents));
            println!(
                "  reconciled: {}",
                format_cents(account.reconciled_balance_cents)
            );
        }
        Command::Import {
            account,
            file,
            cutoff,
            config,
        } => {
            let config = match config {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    ImportConfig::from_toml(&content)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => ImportConfig::default(),
            };
            import(pool, account, &file, cutoff, config).await?;
        }
    }
    Ok(())
}

async fn import(
    pool: tally_storage::DbPool,
    account_id: i64,
    file: &PathBuf,
    cutoff: Option<NaiveDate>,
    config: ImportConfig,
) -> anyhow::Result<()> {
    let mut conn = pool.acquire().await?;
    let account = tally_storage::account_by_id(&mut conn, account_id)
        .await?
        .with_context(|| format!("no account with id {account_id}"))?;
    drop(conn);

    let cutoff = cutoff
        .or(account.import_cutoff)
        .or_else(|| Utc::now().date_naive().checked_sub_days(Days::new(30)));
    let Some(cutoff) = cutoff else {
        bail!("could not determine an import cutoff date");
    };

    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("bad file name: {}", file.display()))?;

    let controller = ImportController::new(pool, config);
    let mut pending = PendingBatches::default();
    let session = "cli";

    let outcome = controller
        .upload(&mut pending, session, account_id, file_name, &data, cutoff)
        .await?;
    match outcome {
        UploadOutcome::NothingToImport => {
            println!("Nothing to import: every record was imported previously.");
            return Ok(());
        }
        UploadOutcome::Pending { count } => {
            println!("Parsed {count} new transaction(s) from {file_name}.");
        }
    }

    let preview = controller.preview(&pending, session, account_id).await?;
    println!(
        "Will add {} entr{} and merge {} with existing ones.",
        preview.new_entries,
        if preview.new_entries == 1 { "y" } else { "ies" },
        preview.merged,
    );
    println!(
        "Balance after import: {} ({} reconciled)",
        format_cents(preview.balance_cents),
        format_cents(preview.reconciled_balance_cents),
    );

    match controller.confirm(&mut pending, session, account_id).await? {
        ConfirmOutcome::Committed {
            new_entries,
            merged,
        } => {
            println!("Imported: {new_entries} added, {merged} merged.");
        }
        ConfirmOutcome::NothingToImport => {
            println!("Nothing to import: a concurrent import got there first.");
        }
    }
    Ok(())
}
