pub mod account;
pub mod entry;
pub mod money;

pub use account::Account;
pub use entry::{Allocation, Category, LedgerEntry, ReviewStatus};
pub use money::{format_cents, parse_usd, MoneyError};
