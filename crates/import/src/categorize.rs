use std::collections::HashMap;

use tally_core::{Category, LedgerEntry};

/// Normalized-payee prefix length used for the learned name→category map.
pub const DEFAULT_KEY_LEN: usize = 4;
/// Minimum times a category must be seen under a key before it is trusted.
pub const DEFAULT_MIN_HITS: usize = 2;

/// Learns a payee→category mapping from ledger history. Fed with the most
/// recent entries, newest first; entries still on the generic default
/// category teach nothing.
pub struct ByNameCategorizerBuilder {
    key_len: usize,
    min_hits: usize,
    counts: HashMap<String, HashMap<Category, usize>>,
}

impl ByNameCategorizerBuilder {
    pub fn new(key_len: usize, min_hits: usize) -> Self {
        ByNameCategorizerBuilder {
            key_len,
            min_hits,
            counts: HashMap::new(),
        }
    }

    pub fn add(&mut self, entry: &LedgerEntry) {
        if entry.has_default_category() {
            return;
        }
        let key = normalize_payee(&entry.payee, self.key_len);
        if key.is_empty() {
            return;
        }
        let by_category = self.counts.entry(key).or_default();
        for alloc in &entry.allocations {
            *by_category.entry(alloc.category).or_insert(0) += 1;
        }
    }

    pub fn build(self) -> ByNameCategorizer {
        let mut map = HashMap::new();
        for (key, by_category) in self.counts {
            // Most frequent wins; ties go to the smallest category id so
            // the result is deterministic.
            let winner = by_category
                .into_iter()
                .filter(|&(_, count)| count >= self.min_hits)
                .max_by_key(|&(category, count)| (count, std::cmp::Reverse(category)));
            if let Some((category, _)) = winner {
                map.insert(key, category);
            }
        }
        ByNameCategorizer {
            key_len: self.key_len,
            map,
        }
    }
}

/// Best-effort name→category assignment for freshly imported transactions.
/// Never fails; an unknown payee just keeps the default category.
pub struct ByNameCategorizer {
    key_len: usize,
    map: HashMap<String, Category>,
}

impl ByNameCategorizer {
    pub fn categorize(&self, entry: &mut LedgerEntry) {
        if !entry.has_default_category() {
            return;
        }
        let key = normalize_payee(&entry.payee, self.key_len);
        if let Some(category) = self.map.get(&key) {
            entry.allocations[0].category = *category;
        }
    }
}

/// Case- and space-insensitive key: lowercase alphanumerics only, truncated
/// to a fixed prefix. The short prefix deliberately collapses per-store
/// suffixes like "STARBUCKS #123" / "STARBUCKS #456".
fn normalize_payee(payee: &str, key_len: usize) -> String {
    payee
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(key_len)
        .collect()
}
