//! Orchestrates the two-step upload → confirm import workflow.

use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use tally_storage::DbPool;

use crate::batch::{ImportBatch, StagedTransaction};
use crate::categorize::{
    ByNameCategorizer, ByNameCategorizerBuilder, DEFAULT_KEY_LEN, DEFAULT_MIN_HITS,
};
use crate::csv::CsvLoader;
use crate::qfx::QfxLoader;
use crate::{reconcile, ParseError, StatementLoader};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Largest statement file accepted, in bytes.
    pub max_upload_bytes: usize,
    /// Entries without a check number only match when their dates differ by
    /// strictly fewer days than this.
    pub max_day_span: i64,
    /// How many recent entries feed the auto-categorizer.
    pub categorize_lookback: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            max_upload_bytes: 1024 * 1024,
            max_day_span: 7,
            categorize_lookback: 1000,
        }
    }
}

impl ImportConfig {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("File too large")]
    FileTooLarge,
    #[error("Please select a file")]
    EmptyFile,
    #[error("File extension not recognized: {0}")]
    UnknownExtension(String),
    #[error("No pending batch for this session and account")]
    NoPendingBatch,
    #[error("Account {0} not found")]
    UnknownAccount(i64),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Batch parsed and held as pending state awaiting confirm.
    Pending { count: usize },
    /// Every record was already imported previously. Informational, not an
    /// error; nothing is held pending.
    NothingToImport,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Committed { new_entries: usize, merged: usize },
    /// Another import consumed the batch's keys between upload and confirm.
    NothingToImport,
}

/// What a confirm would do, plus projected balances.
#[derive(Debug, PartialEq, Eq)]
pub struct ImportPreview {
    pub new_entries: usize,
    pub merged: usize,
    pub balance_cents: i64,
    pub reconciled_balance_cents: i64,
}

/// Pending uploaded batches, keyed by session and account. One user's
/// pending import never collides with another session's, nor with the same
/// session importing into a different account.
#[derive(Default)]
pub struct PendingBatches {
    batches: HashMap<(String, i64), ImportBatch>,
}

impl PendingBatches {
    pub fn get(&self, session_id: &str, account_id: i64) -> Option<&ImportBatch> {
        self.batches.get(&(session_id.to_string(), account_id))
    }

    pub fn put(&mut self, session_id: &str, account_id: i64, batch: ImportBatch) {
        self.batches
            .insert((session_id.to_string(), account_id), batch);
    }

    pub fn take(&mut self, session_id: &str, account_id: i64) -> Option<ImportBatch> {
        self.batches.remove(&(session_id.to_string(), account_id))
    }
}

pub struct ImportController {
    pool: DbPool,
    config: ImportConfig,
}

impl ImportController {
    pub fn new(pool: DbPool, config: ImportConfig) -> Self {
        ImportController { pool, config }
    }

    /// Parses an uploaded statement, drops already-imported records, and
    /// holds the remainder as pending state for the session. Nothing is
    /// written to the ledger or the dedup store here.
    pub async fn upload(
        &self,
        pending: &mut PendingBatches,
        session_id: &str,
        account_id: i64,
        file_name: &str,
        data: &[u8],
        cutoff: NaiveDate,
    ) -> Result<UploadOutcome, ImportError> {
        if data.len() > self.config.max_upload_bytes {
            return Err(ImportError::FileTooLarge);
        }
        if data.is_empty() {
            return Err(ImportError::EmptyFile);
        }
        let loader = loader_for(file_name)
            .ok_or_else(|| ImportError::UnknownExtension(file_name.to_string()))?;
        let batch = loader.load(account_id, data, cutoff)?;

        let mut conn = self.pool.acquire().await?;
        tally_storage::update_import_cutoff(&mut conn, account_id, cutoff).await?;
        let batch = batch.skip_processed(&mut conn).await?;
        if batch.is_empty() {
            return Ok(UploadOutcome::NothingToImport);
        }
        tracing::info!(account_id, count = batch.len(), "statement uploaded");
        let count = batch.len();
        pending.put(session_id, account_id, batch);
        Ok(UploadOutcome::Pending { count })
    }

    /// Dry-runs the matcher against fresh unreconciled entries to show the
    /// user what confirming would do.
    pub async fn preview(
        &self,
        pending: &PendingBatches,
        session_id: &str,
        account_id: i64,
    ) -> Result<ImportPreview, ImportError> {
        let batch = pending
            .get(session_id, account_id)
            .ok_or(ImportError::NoPendingBatch)?;
        let mut conn = self.pool.acquire().await?;
        let account = tally_storage::account_by_id(&mut conn, account_id)
            .await?
            .ok_or(ImportError::UnknownAccount(account_id))?;
        let unreconciled = tally_storage::unreconciled_entries(&mut conn, account_id).await?;

        let mut staged: Vec<StagedTransaction> = batch.transactions().to_vec();
        reconcile::reconcile(&unreconciled, self.config.max_day_span, &mut staged);

        let mut preview = ImportPreview {
            new_entries: 0,
            merged: 0,
            balance_cents: account.balance_cents,
            reconciled_balance_cents: account.reconciled_balance_cents,
        };
        for t in &staged {
            let total = t.entry.total();
            if t.entry.id == 0 {
                preview.new_entries += 1;
                preview.balance_cents += total;
            } else {
                // Already counted in the running balance; confirm only
                // flips its partner to reconciled.
                preview.merged += 1;
            }
            // Every batch entry ends up reconciled: new ones arrive that
            // way, matched partners gain the flag on confirm.
            preview.reconciled_balance_cents += total;
        }
        Ok(preview)
    }

    /// Discards the pending batch. The ledger and dedup store were never
    /// touched, so there is nothing to roll back.
    pub fn cancel(&self, pending: &mut PendingBatches, session_id: &str, account_id: i64) {
        if pending.take(session_id, account_id).is_some() {
            tracing::info!(account_id, "pending import cancelled");
        }
    }

    /// Commits the pending batch: re-derives it against the dedup store,
    /// re-reads unreconciled entries, matches, categorizes, and applies the
    /// ledger write and the dedup marking in one transaction. Any failure
    /// aborts with pending state already cleared; retrying re-uploads and
    /// re-attempts the same import safely.
    pub async fn confirm(
        &self,
        pending: &mut PendingBatches,
        session_id: &str,
        account_id: i64,
    ) -> Result<ConfirmOutcome, ImportError> {
        let batch = pending
            .take(session_id, account_id)
            .ok_or(ImportError::NoPendingBatch)?;

        // Best effort: a failure here degrades to uncategorized imports.
        let categorizer = match self.build_categorizer().await {
            Ok(c) => Some(c),
            Err(err) => {
                tracing::warn!(%err, "auto-categorizer unavailable, importing uncategorized");
                None
            }
        };

        let mut tx = self.pool.begin().await?;

        // Re-derive: another import may have consumed some keys since the
        // upload-time snapshot.
        let batch = batch.skip_processed(&mut tx).await?;
        if batch.is_empty() {
            return Ok(ConfirmOutcome::NothingToImport);
        }
        let unreconciled = tally_storage::unreconciled_entries(&mut tx, account_id).await?;

        let mut staged: Vec<StagedTransaction> = batch.transactions().to_vec();
        reconcile::reconcile(&unreconciled, self.config.max_day_span, &mut staged);
        // Only transactions becoming new entries get a learned category;
        // matched ones merge into their ledger partner untouched.
        if let Some(categorizer) = &categorizer {
            for t in staged.iter_mut().filter(|t| t.entry.id == 0) {
                categorizer.categorize(&mut t.entry);
            }
        }

        let changes = reconcile::entry_changes(&staged);
        let new_entries = changes.adds.len();
        let merged = changes.updates.len();
        tally_storage::apply_entry_changes(&mut tx, &changes).await?;
        batch.mark_processed(&mut tx).await?;
        tx.commit().await?;

        tracing::info!(account_id, new_entries, merged, "import committed");
        Ok(ConfirmOutcome::Committed {
            new_entries,
            merged,
        })
    }

    async fn build_categorizer(&self) -> Result<ByNameCategorizer, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let history =
            tally_storage::recent_entries(&mut conn, self.config.categorize_lookback).await?;
        let mut builder = ByNameCategorizerBuilder::new(DEFAULT_KEY_LEN, DEFAULT_MIN_HITS);
        for entry in &history {
            builder.add(entry);
        }
        Ok(builder.build())
    }
}

/// Statement dialect selected by file extension.
fn loader_for(file_name: &str) -> Option<Box<dyn StatementLoader>> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())?
        .to_ascii_lowercase();
    match ext.as_str() {
        "qfx" | "ofx" => Some(Box::new(QfxLoader)),
        "csv" => Some(Box::new(CsvLoader)),
        _ => None,
    }
}
