use chrono::NaiveDate;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use tally_core::{Account, Allocation, Category, LedgerEntry, ReviewStatus};

pub type DbPool = Pool<Sqlite>;

/// In-place mutation applied to an existing entry inside
/// [`apply_entry_changes`].
pub type EntryUpdater = Box<dyn Fn(&mut LedgerEntry) + Send + Sync>;

/// A bulk ledger write: brand-new entries plus keyed in-place updates.
/// Applied atomically when the caller wraps it in a transaction.
#[derive(Default)]
pub struct EntryChanges {
    pub adds: Vec<LedgerEntry>,
    pub updates: HashMap<i64, EntryUpdater>,
}

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// An in-memory database with the full schema, for tests and dry runs.
pub async fn create_memory_db() -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            import_cutoff TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            payee TEXT NOT NULL,
            memo TEXT NOT NULL DEFAULT '',
            check_no TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL DEFAULT 0,
            reconciled INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS allocations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id INTEGER NOT NULL,
            category_id INTEGER NOT NULL,
            amount_cents INTEGER NOT NULL,
            FOREIGN KEY (entry_id) REFERENCES entries(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fitids (
            account_id INTEGER NOT NULL,
            fit_id TEXT NOT NULL,
            PRIMARY KEY (account_id, fit_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ── accounts ──────────────────────────────────────────────────────────────

pub async fn create_account(conn: &mut SqliteConnection, name: &str) -> Result<i64, sqlx::Error> {
    let result = sqlx::query("INSERT INTO accounts (name) VALUES (?)")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

pub async fn account_by_id(
    conn: &mut SqliteConnection,
    account_id: i64,
) -> Result<Option<Account>, sqlx::Error> {
    let row = sqlx::query_as::<_, (i64, String, Option<String>)>(
        "SELECT id, name, import_cutoff FROM accounts WHERE id = ?",
    )
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((id, name, cutoff)) = row else {
        return Ok(None);
    };

    let (balance, reconciled_balance) = sqlx::query_as::<_, (Option<i64>, Option<i64>)>(
        r#"
        SELECT SUM(a.amount_cents),
               SUM(CASE WHEN e.reconciled = 1 THEN a.amount_cents ELSE 0 END)
        FROM entries e JOIN allocations a ON a.entry_id = e.id
        WHERE e.account_id = ?
        "#,
    )
    .bind(account_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Some(Account {
        id,
        name,
        import_cutoff: cutoff.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        balance_cents: balance.unwrap_or(0),
        reconciled_balance_cents: reconciled_balance.unwrap_or(0),
    }))
}

pub async fn update_import_cutoff(
    conn: &mut SqliteConnection,
    account_id: i64,
    cutoff: NaiveDate,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE accounts SET import_cutoff = ? WHERE id = ?")
        .bind(cutoff.format("%Y-%m-%d").to_string())
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ── entries ───────────────────────────────────────────────────────────────

type EntryRow = (i64, i64, String, String, String, String, i64, i64);

fn entry_from_row(row: EntryRow, allocations: Vec<Allocation>) -> Result<LedgerEntry, sqlx::Error> {
    let date = NaiveDate::parse_from_str(&row.2, "%Y-%m-%d")
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(LedgerEntry {
        id: row.0,
        account_id: row.1,
        date,
        payee: row.3,
        memo: row.4,
        check_no: row.5,
        status: ReviewStatus::from_i64(row.6),
        reconciled: row.7 != 0,
        allocations,
    })
}

async fn allocations_for(
    conn: &mut SqliteConnection,
    entry_id: i64,
) -> Result<Vec<Allocation>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64, i64)>(
        "SELECT category_id, amount_cents FROM allocations WHERE entry_id = ? ORDER BY id",
    )
    .bind(entry_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(cat, amt)| Allocation::new(Category(cat), amt))
        .collect())
}

async fn load_entries(
    conn: &mut SqliteConnection,
    rows: Vec<EntryRow>,
) -> Result<Vec<LedgerEntry>, sqlx::Error> {
    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        let allocations = allocations_for(conn, row.0).await?;
        result.push(entry_from_row(row, allocations)?);
    }
    Ok(result)
}

const ENTRY_COLUMNS: &str = "id, account_id, date, payee, memo, check_no, status, reconciled";

/// Unreconciled entries for one account, most recent first.
pub async fn unreconciled_entries(
    conn: &mut SqliteConnection,
    account_id: i64,
) -> Result<Vec<LedgerEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, EntryRow>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries \
         WHERE account_id = ? AND reconciled = 0 ORDER BY date DESC, id DESC",
    ))
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await?;
    load_entries(conn, rows).await
}

/// Most recent entries across all accounts, bounded. Feeds the
/// auto-categorizer's lookback window.
pub async fn recent_entries(
    conn: &mut SqliteConnection,
    limit: usize,
) -> Result<Vec<LedgerEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, EntryRow>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY date DESC, id DESC LIMIT ?",
    ))
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;
    load_entries(conn, rows).await
}

async fn entry_by_id(
    conn: &mut SqliteConnection,
    entry_id: i64,
) -> Result<LedgerEntry, sqlx::Error> {
    let row = sqlx::query_as::<_, EntryRow>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?",
    ))
    .bind(entry_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(sqlx::Error::RowNotFound)?;
    let allocations = allocations_for(conn, row.0).await?;
    entry_from_row(row, allocations)
}

pub async fn insert_entry(
    conn: &mut SqliteConnection,
    entry: &LedgerEntry,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO entries (account_id, date, payee, memo, check_no, status, reconciled) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.account_id)
    .bind(entry.date.format("%Y-%m-%d").to_string())
    .bind(&entry.payee)
    .bind(&entry.memo)
    .bind(&entry.check_no)
    .bind(entry.status.as_i64())
    .bind(entry.reconciled as i64)
    .execute(&mut *conn)
    .await?;
    let id = result.last_insert_rowid();
    insert_allocations(conn, id, &entry.allocations).await?;
    Ok(id)
}

async fn insert_allocations(
    conn: &mut SqliteConnection,
    entry_id: i64,
    allocations: &[Allocation],
) -> Result<(), sqlx::Error> {
    for alloc in allocations {
        sqlx::query("INSERT INTO allocations (entry_id, category_id, amount_cents) VALUES (?, ?, ?)")
            .bind(entry_id)
            .bind(alloc.category.0)
            .bind(alloc.amount_cents)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn update_entry(
    conn: &mut SqliteConnection,
    entry: &LedgerEntry,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE entries SET date = ?, payee = ?, memo = ?, check_no = ?, status = ?, \
         reconciled = ? WHERE id = ?",
    )
    .bind(entry.date.format("%Y-%m-%d").to_string())
    .bind(&entry.payee)
    .bind(&entry.memo)
    .bind(&entry.check_no)
    .bind(entry.status.as_i64())
    .bind(entry.reconciled as i64)
    .bind(entry.id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM allocations WHERE entry_id = ?")
        .bind(entry.id)
        .execute(&mut *conn)
        .await?;
    insert_allocations(conn, entry.id, &entry.allocations).await
}

/// Applies adds and in-place updates. Run inside a transaction for
/// atomicity; an update targeting a missing entry yields `RowNotFound`.
pub async fn apply_entry_changes(
    conn: &mut SqliteConnection,
    changes: &EntryChanges,
) -> Result<(), sqlx::Error> {
    for entry in &changes.adds {
        insert_entry(conn, entry).await?;
    }
    // Deterministic order keeps failures reproducible.
    let mut ids: Vec<i64> = changes.updates.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let mut entry = entry_by_id(conn, id).await?;
        (changes.updates[&id])(&mut entry);
        update_entry(conn, &entry).await?;
    }
    Ok(())
}

// ── fitid dedup store ─────────────────────────────────────────────────────

/// Returns the subset of `fit_ids` already recorded for the account.
pub async fn find_processed(
    conn: &mut SqliteConnection,
    account_id: i64,
    fit_ids: &HashSet<String>,
) -> Result<HashSet<String>, sqlx::Error> {
    let mut found = HashSet::new();
    for fit_id in fit_ids {
        let present: Option<(i64,)> = sqlx::query_as(
            "SELECT account_id FROM fitids WHERE account_id = ? AND fit_id = ?",
        )
        .bind(account_id)
        .bind(fit_id)
        .fetch_optional(&mut *conn)
        .await?;
        if present.is_some() {
            found.insert(fit_id.clone());
        }
    }
    Ok(found)
}

/// Records fit ids as imported. Re-adding an existing id is a no-op.
pub async fn mark_processed(
    conn: &mut SqliteConnection,
    account_id: i64,
    fit_ids: &HashSet<String>,
) -> Result<(), sqlx::Error> {
    for fit_id in fit_ids {
        sqlx::query("INSERT OR IGNORE INTO fitids (account_id, fit_id) VALUES (?, ?)")
            .bind(account_id)
            .bind(fit_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn setup() -> (DbPool, i64) {
        let pool = create_memory_db().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let account_id = create_account(&mut conn, "Checking").await.unwrap();
        (pool, account_id)
    }

    #[tokio::test]
    async fn insert_and_read_unreconciled() {
        let (pool, acct) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let older = LedgerEntry::new_expense(acct, date(2024, 1, 10), "OLDER", 500);
        let newer = LedgerEntry::new_expense(acct, date(2024, 1, 20), "NEWER", 700);
        insert_entry(&mut conn, &older).await.unwrap();
        insert_entry(&mut conn, &newer).await.unwrap();

        let entries = unreconciled_entries(&mut conn, acct).await.unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first.
        assert_eq!(entries[0].payee, "NEWER");
        assert_eq!(entries[1].payee, "OLDER");
        assert_eq!(entries[0].total(), 700);
    }

    #[tokio::test]
    async fn unreconciled_excludes_reconciled_and_other_accounts() {
        let (pool, acct) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let other = create_account(&mut conn, "Savings").await.unwrap();

        let mut done = LedgerEntry::new_expense(acct, date(2024, 1, 10), "DONE", 500);
        done.reconciled = true;
        insert_entry(&mut conn, &done).await.unwrap();
        insert_entry(
            &mut conn,
            &LedgerEntry::new_expense(other, date(2024, 1, 11), "ELSEWHERE", 500),
        )
        .await
        .unwrap();
        insert_entry(
            &mut conn,
            &LedgerEntry::new_expense(acct, date(2024, 1, 12), "OPEN", 500),
        )
        .await
        .unwrap();

        let entries = unreconciled_entries(&mut conn, acct).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payee, "OPEN");
    }

    #[tokio::test]
    async fn apply_changes_adds_and_updates() {
        let (pool, acct) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let id = insert_entry(
            &mut conn,
            &LedgerEntry::new_expense(acct, date(2024, 1, 10), "PENCIL", 500),
        )
        .await
        .unwrap();

        let mut changes = EntryChanges::default();
        changes
            .adds
            .push(LedgerEntry::new_expense(acct, date(2024, 1, 11), "PEN", 700));
        changes.updates.insert(
            id,
            Box::new(|e: &mut LedgerEntry| {
                e.payee = "PENCILS INC".to_string();
                e.reconciled = true;
                e.allocations = vec![Allocation::new(Category(9), 500)];
            }),
        );
        apply_entry_changes(&mut conn, &changes).await.unwrap();

        let updated = entry_by_id(&mut conn, id).await.unwrap();
        assert_eq!(updated.payee, "PENCILS INC");
        assert!(updated.reconciled);
        assert_eq!(updated.allocations, vec![Allocation::new(Category(9), 500)]);

        let open = unreconciled_entries(&mut conn, acct).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].payee, "PEN");
    }

    #[tokio::test]
    async fn apply_changes_missing_update_target_errors() {
        let (pool, _) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let mut changes = EntryChanges::default();
        changes
            .updates
            .insert(404, Box::new(|e: &mut LedgerEntry| e.reconciled = true));
        let err = apply_entry_changes(&mut conn, &changes).await;
        assert!(matches!(err, Err(sqlx::Error::RowNotFound)));
    }

    #[tokio::test]
    async fn failed_apply_in_transaction_rolls_back_adds() {
        let (pool, acct) = setup().await;

        let mut tx = pool.begin().await.unwrap();
        let mut changes = EntryChanges::default();
        changes
            .adds
            .push(LedgerEntry::new_expense(acct, date(2024, 1, 11), "PEN", 700));
        changes
            .updates
            .insert(404, Box::new(|e: &mut LedgerEntry| e.reconciled = true));
        let err = apply_entry_changes(&mut tx, &changes).await;
        assert!(matches!(err, Err(sqlx::Error::RowNotFound)));
        tx.rollback().await.unwrap();

        // The add issued before the failing update must not survive.
        let mut conn = pool.acquire().await.unwrap();
        let entries = unreconciled_entries(&mut conn, acct).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn fitids_find_and_idempotent_add() {
        let (pool, acct) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let keys: HashSet<String> = ["A1".to_string(), "B2".to_string()].into();
        mark_processed(&mut conn, acct, &keys).await.unwrap();
        // Second add of the same keys is a no-op.
        mark_processed(&mut conn, acct, &keys).await.unwrap();

        let probe: HashSet<String> = ["A1".to_string(), "C3".to_string()].into();
        let found = find_processed(&mut conn, acct, &probe).await.unwrap();
        assert_eq!(found, HashSet::from(["A1".to_string()]));
    }

    #[tokio::test]
    async fn fitids_scoped_per_account() {
        let (pool, acct) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let other = create_account(&mut conn, "Savings").await.unwrap();

        let keys: HashSet<String> = ["SHARED".to_string()].into();
        mark_processed(&mut conn, acct, &keys).await.unwrap();

        let found = find_processed(&mut conn, other, &keys).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn account_balances_computed() {
        let (pool, acct) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let mut rec = LedgerEntry::new_expense(acct, date(2024, 1, 10), "REC", 300);
        rec.reconciled = true;
        insert_entry(&mut conn, &rec).await.unwrap();
        insert_entry(
            &mut conn,
            &LedgerEntry::new_expense(acct, date(2024, 1, 11), "OPEN", 200),
        )
        .await
        .unwrap();

        let account = account_by_id(&mut conn, acct).await.unwrap().unwrap();
        assert_eq!(account.balance_cents, 500);
        assert_eq!(account.reconciled_balance_cents, 300);
        assert_eq!(account.name, "Checking");
    }

    #[tokio::test]
    async fn create_db_on_disk_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        let pool = create_db(&path).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let acct = create_account(&mut conn, "Checking").await.unwrap();
        drop(conn);
        pool.close().await;

        let pool = create_db(&path).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let account = account_by_id(&mut conn, acct).await.unwrap().unwrap();
        assert_eq!(account.name, "Checking");
    }

    #[tokio::test]
    async fn import_cutoff_roundtrip() {
        let (pool, acct) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        update_import_cutoff(&mut conn, acct, date(2024, 2, 1))
            .await
            .unwrap();
        let account = account_by_id(&mut conn, acct).await.unwrap().unwrap();
        assert_eq!(account.import_cutoff, Some(date(2024, 2, 1)));
    }
}
