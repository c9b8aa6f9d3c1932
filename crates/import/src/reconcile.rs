//! Pairs bank-imported transactions against existing unreconciled ledger
//! entries so the two merge instead of duplicating.

use chrono::{Datelike, NaiveDate};
use std::collections::HashMap;

use tally_core::{LedgerEntry, ReviewStatus};
use tally_storage::{EntryChanges, EntryUpdater};

use crate::batch::StagedTransaction;

/// Matches staged bank transactions against the account's unreconciled
/// entries. On return, each matched staged transaction carries the id of
/// its ledger partner; unmatched ones keep id 0.
///
/// Matching is per `(amount, check number)` bucket. A non-empty check
/// number is authoritative regardless of date distance; an empty one
/// requires the pair's dates to differ by strictly fewer than
/// `max_day_span` days.
pub fn reconcile(
    unreconciled: &[LedgerEntry],
    max_day_span: i64,
    from_bank: &mut [StagedTransaction],
) {
    let bank_buckets = bucket(from_bank.iter().map(|t| &t.entry));
    let ledger_buckets = bucket(unreconciled.iter());

    for (key, bank_idx) in bank_buckets {
        let Some(ledger_idx) = ledger_buckets.get(&key) else {
            continue;
        };
        let window = if key.1.is_empty() {
            Some(max_day_span)
        } else {
            None
        };
        let bank_days: Vec<i64> = bank_idx
            .iter()
            .map(|&i| day_number(from_bank[i].entry.date))
            .collect();
        let ledger_days: Vec<i64> = ledger_idx
            .iter()
            .map(|&i| day_number(unreconciled[i].date))
            .collect();
        for (b, l) in align(&bank_days, &ledger_days, window) {
            from_bank[bank_idx[b]].entry.id = unreconciled[ledger_idx[l]].id;
        }
    }
}

/// Converts a reconciled batch into one bulk ledger write: new entries for
/// unmatched transactions, in-place updates for matched ones.
pub fn entry_changes(from_bank: &[StagedTransaction]) -> EntryChanges {
    let mut changes = EntryChanges::default();
    for staged in from_bank {
        if staged.entry.id == 0 {
            changes.adds.push(staged.entry.clone());
        } else {
            changes
                .updates
                .insert(staged.entry.id, reconciler(staged.entry.clone()));
        }
    }
    changes
}

/// The update applied to an existing entry its bank counterpart matched.
/// A reviewed entry only gains the reconciled flag; an unreviewed one also
/// adopts the bank payee and, while still on the single default-category
/// allocation, the bank's allocation.
fn reconciler(bank: LedgerEntry) -> EntryUpdater {
    Box::new(move |existing: &mut LedgerEntry| {
        if existing.status != ReviewStatus::Reviewed {
            existing.payee = bank.payee.clone();
            if existing.has_default_category() {
                existing.allocations = bank.allocations.clone();
            }
        }
        existing.reconciled = true;
    })
}

type BucketKey = (i64, String);

/// Groups entry indexes by (total, check number), each group sorted
/// ascending by (date, position) so alignment sees two ordered sequences.
fn bucket<'a>(entries: impl Iterator<Item = &'a LedgerEntry>) -> HashMap<BucketKey, Vec<usize>> {
    let mut buckets: HashMap<BucketKey, Vec<(NaiveDate, usize)>> = HashMap::new();
    for (i, entry) in entries.enumerate() {
        buckets
            .entry((entry.total(), entry.check_no.clone()))
            .or_default()
            .push((entry.date, i));
    }
    buckets
        .into_iter()
        .map(|(key, mut members)| {
            members.sort();
            (key, members.into_iter().map(|(_, i)| i).collect())
        })
        .collect()
}

fn day_number(date: NaiveDate) -> i64 {
    i64::from(date.num_days_from_ce())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Step {
    Pair,
    SkipBank,
    SkipLedger,
}

/// Maximum non-crossing alignment of two ascending day sequences.
///
/// Returns (bank position, ledger position) pairs such that each position
/// is used at most once, pairings never cross, and every pair's day gap is
/// strictly below `window` when one is given. Among maximal alignments the
/// one with the smallest total gap wins, and remaining ties resolve to the
/// earliest positions, so the result is deterministic.
fn align(bank: &[i64], ledger: &[i64], window: Option<i64>) -> Vec<(usize, usize)> {
    let n = bank.len();
    let m = ledger.len();
    // best[i][j] = (pairs, total gap) achievable aligning bank[i..] with
    // ledger[j..]; more pairs beat fewer, then a smaller gap wins.
    let mut best = vec![vec![(0usize, 0i64); m + 1]; n + 1];
    let mut step = vec![vec![Step::SkipBank; m + 1]; n + 1];

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            let gap = (bank[i] - ledger[j]).abs();
            let pairable = window.map_or(true, |w| gap < w);

            // Preference order on ties: pair, skip bank, skip ledger.
            let mut choice = Step::SkipBank;
            let mut score = best[i + 1][j];
            let skip_ledger = best[i][j + 1];
            if better(skip_ledger, score) {
                choice = Step::SkipLedger;
                score = skip_ledger;
            }
            if pairable {
                let (p, g) = best[i + 1][j + 1];
                let paired = (p + 1, g + gap);
                if paired == score || better(paired, score) {
                    choice = Step::Pair;
                    score = paired;
                }
            }
            best[i][j] = score;
            step[i][j] = choice;
        }
    }

    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        match step[i][j] {
            Step::Pair => {
                result.push((i, j));
                i += 1;
                j += 1;
            }
            Step::SkipBank => i += 1,
            Step::SkipLedger => j += 1,
        }
    }
    result
}

/// True when score `a` beats `b`: more pairs, or equal pairs with a
/// smaller total gap.
fn better(a: (usize, i64), b: (usize, i64)) -> bool {
    a.0 > b.0 || (a.0 == b.0 && a.1 < b.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{Allocation, Category};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ledger(id: i64, d: NaiveDate, amount: i64, check_no: &str) -> LedgerEntry {
        let mut e = LedgerEntry::new_expense(1, d, "EXISTING", amount);
        e.id = id;
        e.check_no = check_no.to_string();
        e
    }

    fn bank(d: NaiveDate, amount: i64, check_no: &str) -> StagedTransaction {
        let mut e = LedgerEntry::new_expense(1, d, "FROM BANK", amount);
        e.check_no = check_no.to_string();
        StagedTransaction {
            entry: e,
            fit_id: format!("F{}{amount}", d),
        }
    }

    #[test]
    fn matches_same_amount_within_window() {
        // A $42.99 debit a day apart pairs up.
        let unrec = vec![ledger(10, date(2023, 10, 11), 4299, "")];
        let mut staged = vec![bank(date(2023, 10, 12), 4299, "")];
        reconcile(&unrec, 7, &mut staged);
        assert_eq!(staged[0].entry.id, 10);
    }

    #[test]
    fn no_match_outside_window() {
        let unrec = vec![ledger(10, date(2023, 9, 1), 4299, "")];
        let mut staged = vec![bank(date(2023, 10, 12), 4299, "")];
        reconcile(&unrec, 7, &mut staged);
        assert_eq!(staged[0].entry.id, 0);
    }

    #[test]
    fn window_bound_is_strict() {
        // Exactly max_day_span days apart must not match.
        let unrec = vec![ledger(10, date(2023, 10, 5), 4299, "")];
        let mut staged = vec![bank(date(2023, 10, 12), 4299, "")];
        reconcile(&unrec, 7, &mut staged);
        assert_eq!(staged[0].entry.id, 0);

        let unrec = vec![ledger(10, date(2023, 10, 6), 4299, "")];
        let mut staged = vec![bank(date(2023, 10, 12), 4299, "")];
        reconcile(&unrec, 7, &mut staged);
        assert_eq!(staged[0].entry.id, 10);
    }

    #[test]
    fn check_number_matches_ignore_date_distance() {
        let unrec = vec![
            ledger(21, date(2023, 1, 10), 5000, "101"),
            ledger(22, date(2023, 1, 15), 5000, "102"),
        ];
        let mut staged = vec![
            bank(date(2023, 6, 1), 5000, "101"),
            bank(date(2023, 6, 20), 5000, "102"),
        ];
        reconcile(&unrec, 7, &mut staged);
        assert_eq!(staged[0].entry.id, 21);
        assert_eq!(staged[1].entry.id, 22);
    }

    #[test]
    fn check_number_is_not_a_wildcard() {
        // Same amount, one side has a check number: different buckets.
        let unrec = vec![ledger(30, date(2023, 10, 11), 5000, "101")];
        let mut staged = vec![bank(date(2023, 10, 11), 5000, "")];
        reconcile(&unrec, 7, &mut staged);
        assert_eq!(staged[0].entry.id, 0);
    }

    #[test]
    fn different_amounts_never_match() {
        let unrec = vec![ledger(40, date(2023, 10, 11), 4299, "")];
        let mut staged = vec![bank(date(2023, 10, 11), 4300, "")];
        reconcile(&unrec, 7, &mut staged);
        assert_eq!(staged[0].entry.id, 0);
    }

    #[test]
    fn pairings_do_not_cross() {
        let unrec = vec![
            ledger(51, date(2023, 10, 10), 1000, ""),
            ledger(52, date(2023, 10, 14), 1000, ""),
        ];
        let mut staged = vec![
            bank(date(2023, 10, 11), 1000, ""),
            bank(date(2023, 10, 15), 1000, ""),
        ];
        reconcile(&unrec, 7, &mut staged);
        // Earlier bank transaction takes the earlier ledger entry.
        assert_eq!(staged[0].entry.id, 51);
        assert_eq!(staged[1].entry.id, 52);
    }

    #[test]
    fn maximal_matching_preferred_over_greedy() {
        // Greedy would pair the bank txn on the 12th with the entry on the
        // 10th and strand the one on the 16th; the maximal alignment pairs
        // both.
        let unrec = vec![
            ledger(61, date(2023, 10, 10), 1000, ""),
            ledger(62, date(2023, 10, 12), 1000, ""),
        ];
        let mut staged = vec![
            bank(date(2023, 10, 12), 1000, ""),
            bank(date(2023, 10, 16), 1000, ""),
        ];
        reconcile(&unrec, 7, &mut staged);
        assert_eq!(staged[0].entry.id, 61);
        assert_eq!(staged[1].entry.id, 62);
    }

    #[test]
    fn tie_break_prefers_smaller_gap() {
        // One bank txn, two candidates a day away vs three days away.
        let unrec = vec![
            ledger(71, date(2023, 10, 9), 1000, ""),
            ledger(72, date(2023, 10, 11), 1000, ""),
        ];
        let mut staged = vec![bank(date(2023, 10, 12), 1000, "")];
        reconcile(&unrec, 7, &mut staged);
        assert_eq!(staged[0].entry.id, 72);
    }

    #[test]
    fn deterministic_across_runs_and_input_order() {
        let unrec = vec![
            ledger(81, date(2023, 10, 10), 1000, ""),
            ledger(82, date(2023, 10, 11), 1000, ""),
            ledger(83, date(2023, 10, 12), 1000, ""),
        ];
        let make_staged = |order: [u32; 3]| {
            order
                .iter()
                .map(|&d| bank(date(2023, 10, d), 1000, ""))
                .collect::<Vec<_>>()
        };
        let mut a = make_staged([10, 11, 12]);
        let mut b = make_staged([10, 11, 12]);
        reconcile(&unrec, 7, &mut a);
        reconcile(&unrec, 7, &mut b);
        let ids = |s: &[StagedTransaction]| s.iter().map(|t| t.entry.id).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(ids(&a), vec![81, 82, 83]);

        // Same dates presented in a different batch order match the same
        // ledger partners per date.
        let mut c = make_staged([12, 10, 11]);
        reconcile(&unrec, 7, &mut c);
        assert_eq!(ids(&c), vec![83, 81, 82]);
    }

    #[test]
    fn unreviewed_match_adopts_payee_and_category() {
        let mut existing = ledger(90, date(2023, 10, 11), 4299, "");
        existing.payee = "HAND ENTERED".to_string();
        let mut from_bank = bank(date(2023, 10, 12), 4299, "");
        from_bank.entry.payee = "ACME HARDWARE".to_string();
        from_bank.entry.allocations = vec![Allocation::new(Category(5), 4299)];
        from_bank.entry.id = 90;

        let changes = entry_changes(&[from_bank]);
        assert!(changes.adds.is_empty());
        (changes.updates[&90])(&mut existing);
        assert_eq!(existing.payee, "ACME HARDWARE");
        assert_eq!(existing.allocations, vec![Allocation::new(Category(5), 4299)]);
        assert!(existing.reconciled);
    }

    #[test]
    fn unreviewed_match_keeps_non_default_allocations() {
        let mut existing = ledger(91, date(2023, 10, 11), 4299, "");
        existing.allocations = vec![Allocation::new(Category(8), 4299)];
        let mut from_bank = bank(date(2023, 10, 12), 4299, "");
        from_bank.entry.allocations = vec![Allocation::new(Category(5), 4299)];
        from_bank.entry.id = 91;

        (entry_changes(&[from_bank]).updates[&91])(&mut existing);
        // Payee adopted, hand-assigned category kept.
        assert_eq!(existing.payee, "FROM BANK");
        assert_eq!(existing.allocations, vec![Allocation::new(Category(8), 4299)]);
        assert!(existing.reconciled);
    }

    #[test]
    fn reviewed_match_only_sets_reconciled() {
        let mut existing = ledger(92, date(2023, 10, 11), 4299, "");
        existing.payee = "CURATED NAME".to_string();
        existing.status = ReviewStatus::Reviewed;
        let mut from_bank = bank(date(2023, 10, 12), 4299, "");
        from_bank.entry.id = 92;

        (entry_changes(&[from_bank]).updates[&92])(&mut existing);
        assert_eq!(existing.payee, "CURATED NAME");
        assert!(existing.has_default_category());
        assert!(existing.reconciled);
    }

    #[test]
    fn unmatched_become_adds() {
        let staged = vec![bank(date(2023, 10, 12), 4299, "")];
        let changes = entry_changes(&staged);
        assert_eq!(changes.adds.len(), 1);
        assert!(changes.updates.is_empty());
        assert_eq!(changes.adds[0].id, 0);
    }

    #[test]
    fn align_empty_inputs() {
        assert!(align(&[], &[1, 2], Some(7)).is_empty());
        assert!(align(&[1, 2], &[], Some(7)).is_empty());
    }
}
