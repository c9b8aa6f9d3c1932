use sqlx::SqliteConnection;
use std::collections::HashSet;

use tally_core::LedgerEntry;

use crate::ParseError;

/// A parsed statement transaction: an unpersisted ledger entry plus the
/// identifier that distinguishes it from every other statement line.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedTransaction {
    pub entry: LedgerEntry,
    pub fit_id: String,
}

impl StagedTransaction {
    /// Required-field check run by every loader before a record is accepted.
    pub(crate) fn check(&self) -> Result<(), ParseError> {
        if self.entry.payee.trim().is_empty() {
            return Err(ParseError::MissingPayee);
        }
        if self.fit_id.trim().is_empty() {
            return Err(ParseError::MissingFitId);
        }
        Ok(())
    }
}

/// The transactions parsed from one uploaded statement file. Instances are
/// immutable; filtering returns a new batch.
#[derive(Debug, Clone)]
pub struct ImportBatch {
    account_id: i64,
    transactions: Vec<StagedTransaction>,
}

impl ImportBatch {
    pub fn new(account_id: i64, transactions: Vec<StagedTransaction>) -> Self {
        ImportBatch {
            account_id,
            transactions,
        }
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub fn transactions(&self) -> &[StagedTransaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// The batch's fit ids, excluding the sentinel "0" used by statements
    /// whose records lack a real identifier. Keeping "0" out of the set on
    /// both the find and the add side means such records never suppress,
    /// nor are suppressed by, any other record.
    pub fn fit_id_set(&self) -> HashSet<String> {
        self.transactions
            .iter()
            .filter(|t| t.fit_id.trim() != "0")
            .map(|t| t.fit_id.clone())
            .collect()
    }

    /// Returns a new batch containing only transactions not yet recorded in
    /// the dedup store. Safe to call repeatedly.
    pub async fn skip_processed(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<ImportBatch, sqlx::Error> {
        let seen = tally_storage::find_processed(conn, self.account_id, &self.fit_id_set()).await?;
        if seen.is_empty() {
            return Ok(self.clone());
        }
        let remaining = self
            .transactions
            .iter()
            .filter(|t| !seen.contains(&t.fit_id))
            .cloned()
            .collect();
        Ok(ImportBatch::new(self.account_id, remaining))
    }

    /// Records the batch's non-sentinel fit ids as imported. Call only
    /// inside the transaction that also writes the ledger entries; marking
    /// earlier would let a crash permanently lose these transactions from
    /// future re-imports.
    pub async fn mark_processed(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        tally_storage::mark_processed(conn, self.account_id, &self.fit_id_set()).await
    }
}
