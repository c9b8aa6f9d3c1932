use chrono::NaiveDate;
use regex::Regex;
use std::sync::OnceLock;

use tally_core::{money, LedgerEntry};

use crate::batch::{ImportBatch, StagedTransaction};
use crate::{ParseError, StatementLoader};

const DTPOSTED: &str = "<DTPOSTED>";
const TRNAMT: &str = "<TRNAMT>";
const NAME: &str = "<NAME>";
const MEMO: &str = "<MEMO>";
const CHECKNUM: &str = "<CHECKNUM>";
const FITID: &str = "<FITID>";
const STMTTRN_CLOSE: &str = "</STMTTRN>";

fn header_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[A-Z]+:[A-Z0-9]+\s*$").unwrap())
}

fn tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"</?[A-Z0-9.]+>").unwrap())
}

/// Loader for QFX/OFX statements: a block of `WORD:WORD` header lines
/// followed by a flat stream of SGML-ish tags.
pub struct QfxLoader;

impl StatementLoader for QfxLoader {
    fn load(
        &self,
        account_id: i64,
        data: &[u8],
        cutoff: NaiveDate,
    ) -> Result<ImportBatch, ParseError> {
        let text = String::from_utf8_lossy(data);

        // Header lines are skipped; everything from the first non-header
        // line on is tag-stream body.
        let mut body = String::new();
        let mut in_body = false;
        for line in text.lines() {
            if !in_body && header_pattern().is_match(line) {
                continue;
            }
            in_body = true;
            body.push_str(line.trim());
        }

        let tags: Vec<_> = tag_pattern().find_iter(&body).collect();
        let mut record = PendingRecord::default();
        let mut result = Vec::new();

        for (i, tag) in tags.iter().enumerate() {
            let content = match tags.get(i + 1) {
                Some(next) => &body[tag.end()..next.start()],
                None => &body[tag.end()..],
            };
            match tag.as_str() {
                DTPOSTED => record.date = Some(parse_qfx_date(content)?),
                TRNAMT => {
                    let amt = money::parse_usd(content)
                        .map_err(|_| ParseError::InvalidAmount(content.to_string()))?;
                    // Expenses are positive debits in the ledger.
                    record.amount = -amt;
                }
                NAME => record.name = unescape(content),
                MEMO => record.memo = unescape(content),
                CHECKNUM => record.check_no = content.to_string(),
                FITID => record.fit_id = content.to_string(),
                STMTTRN_CLOSE => {
                    if let Some(staged) = record.finish(account_id, cutoff)? {
                        result.push(staged);
                    }
                    record = PendingRecord::default();
                }
                _ => {}
            }
        }

        Ok(ImportBatch::new(account_id, result))
    }
}

/// Accumulates tag contents until the closing transaction tag.
#[derive(Default)]
struct PendingRecord {
    date: Option<NaiveDate>,
    amount: i64,
    name: String,
    memo: String,
    check_no: String,
    fit_id: String,
}

impl PendingRecord {
    /// Finalizes the record. Records without a posted date or dated before
    /// the cutoff are dropped; a record failing validation aborts the parse.
    fn finish(
        self,
        account_id: i64,
        cutoff: NaiveDate,
    ) -> Result<Option<StagedTransaction>, ParseError> {
        let Some(date) = self.date else {
            return Ok(None);
        };
        if date < cutoff {
            return Ok(None);
        }
        // The payee name tag wins over the memo tag when both are present.
        let (payee, memo) = if !self.name.trim().is_empty() {
            (self.name, self.memo)
        } else {
            (self.memo, String::new())
        };
        let mut entry = LedgerEntry::new_expense(account_id, date, &payee, self.amount);
        entry.memo = memo;
        entry.check_no = self.check_no;
        // The statement itself is the reconciliation evidence.
        entry.reconciled = true;
        let staged = StagedTransaction {
            entry,
            fit_id: self.fit_id,
        };
        staged.check()?;
        Ok(Some(staged))
    }
}

fn parse_qfx_date(s: &str) -> Result<NaiveDate, ParseError> {
    let s = s.trim();
    // Banks append time-of-day and zone suffixes; only YYYYMMDD matters.
    let ymd = s
        .get(..8)
        .ok_or_else(|| ParseError::InvalidDate(s.to_string()))?;
    NaiveDate::parse_from_str(ymd, "%Y%m%d").map_err(|_| ParseError::InvalidDate(s.to_string()))
}

fn unescape(s: &str) -> String {
    s.replace("&amp;", "&")
}
