use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A spending/income category. `Category::EXPENSE` is the generic top-level
/// expense bucket every imported transaction starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Category(pub i64);

impl Category {
    pub const EXPENSE: Category = Category(0);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub category: Category,
    pub amount_cents: i64,
}

impl Allocation {
    pub fn new(category: Category, amount_cents: i64) -> Self {
        Allocation {
            category,
            amount_cents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReviewStatus {
    #[default]
    NotReviewed,
    InProgress,
    Reviewed,
}

impl ReviewStatus {
    pub fn from_i64(v: i64) -> ReviewStatus {
        match v {
            2 => ReviewStatus::Reviewed,
            1 => ReviewStatus::InProgress,
            _ => ReviewStatus::NotReviewed,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            ReviewStatus::NotReviewed => 0,
            ReviewStatus::InProgress => 1,
            ReviewStatus::Reviewed => 2,
        }
    }
}

/// One ledger transaction against an account. `id == 0` means the entry has
/// not been persisted yet.
///
/// Sign convention: expenses are positive debits, so a bank-reported
/// "-49.99" purchase lands here as allocations totalling 4999 cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: i64,
    pub date: NaiveDate,
    pub payee: String,
    pub memo: String,
    /// Empty string means no check number.
    pub check_no: String,
    pub allocations: Vec<Allocation>,
    pub reconciled: bool,
    pub status: ReviewStatus,
}

impl LedgerEntry {
    /// A fresh unpersisted entry holding the whole amount in the generic
    /// expense category.
    pub fn new_expense(account_id: i64, date: NaiveDate, payee: &str, amount_cents: i64) -> Self {
        LedgerEntry {
            id: 0,
            account_id,
            date,
            payee: payee.to_string(),
            memo: String::new(),
            check_no: String::new(),
            allocations: vec![Allocation::new(Category::EXPENSE, amount_cents)],
            reconciled: false,
            status: ReviewStatus::NotReviewed,
        }
    }

    pub fn total(&self) -> i64 {
        self.allocations.iter().map(|a| a.amount_cents).sum()
    }

    /// True when the entry still carries nothing beyond the single generic
    /// expense allocation it was created with.
    pub fn has_default_category(&self) -> bool {
        self.allocations.len() == 1 && self.allocations[0].category == Category::EXPENSE
    }
}
