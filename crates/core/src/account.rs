use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A bank account entries are imported into. Balances are computed from the
/// entries table at read time, not stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    /// Earliest date the next statement import should consider. Updated on
    /// every upload so re-imports default to a sensible window.
    pub import_cutoff: Option<NaiveDate>,
    /// Sum of all entry totals for the account.
    pub balance_cents: i64,
    /// Sum of reconciled entry totals only.
    pub reconciled_balance_cents: i64,
}
