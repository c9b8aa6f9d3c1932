pub mod db;

pub use db::{
    account_by_id, apply_entry_changes, create_account, create_db, create_memory_db,
    find_processed, insert_entry, mark_processed, recent_entries, unreconciled_entries,
    update_import_cutoff, DbPool, EntryChanges, EntryUpdater,
};
