pub mod batch;
pub mod categorize;
pub mod controller;
pub mod csv;
pub mod qfx;
pub mod reconcile;

pub use batch::{ImportBatch, StagedTransaction};
pub use categorize::{ByNameCategorizer, ByNameCategorizerBuilder};
pub use controller::{
    ConfirmOutcome, ImportConfig, ImportController, ImportError, ImportPreview, PendingBatches,
    UploadOutcome,
};
pub use csv::CsvLoader;
pub use qfx::QfxLoader;

use chrono::NaiveDate;
use thiserror::Error;

/// Errors that abort a statement parse. No partial batch is ever produced;
/// importing half a statement would be silent data loss.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unrecognized statement header")]
    UnrecognizedHeader,
    #[error("Invalid date field: {0}")]
    InvalidDate(String),
    #[error("Invalid amount field: {0}")]
    InvalidAmount(String),
    #[error("Imported record missing payee name")]
    MissingPayee,
    #[error("Imported record missing fit id")]
    MissingFitId,
    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),
}

/// Turns raw statement bytes into a batch of canonical transactions for one
/// account, dropping records dated before `cutoff`.
pub trait StatementLoader {
    fn load(
        &self,
        account_id: i64,
        data: &[u8],
        cutoff: NaiveDate,
    ) -> Result<ImportBatch, ParseError>;
}
