//! Append-only hash-chained journal.
//!
//! Every state-changing operation lands here as one `LedgerEntry`. The
//! writer is the single authority for `seq` and `hash`: appends are
//! serialized, `seq` strictly increases, and each entry's hash covers its
//! canonical bytes plus the previous hash, so any later mutation or
//! insertion is detectable by a full-chain walk.
//!
//! Entries are durably appended to a JSON-lines file when a path is
//! configured; the same format serves bulk export and import.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::credits::Credits;

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Reserve,
    Settle,
    Refund,
    TransferDebit,
    TransferCredit,
    Rollover,
    Block,
    CacheInvalidate,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Reserve => "reserve",
            EntryKind::Settle => "settle",
            EntryKind::Refund => "refund",
            EntryKind::TransferDebit => "transfer_debit",
            EntryKind::TransferCredit => "transfer_credit",
            EntryKind::Rollover => "rollover",
            EntryKind::Block => "block",
            EntryKind::CacheInvalidate => "cache_invalidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub wallet_id: String,
    pub kind: EntryKind,
    /// Fixed-point credit units
    pub amount: Credits,
    /// Request, reservation, transfer or cycle id this entry belongs to
    pub ref_id: String,
    pub prev_hash: String,
    pub hash: String,
}

/// Canonical byte layout hashed for each entry: a fixed field order with
/// stable encodings (microsecond timestamps, raw credit units).
fn compute_hash(
    prev_hash: &str,
    seq: u64,
    ts: &DateTime<Utc>,
    wallet_id: &str,
    kind: EntryKind,
    amount: Credits,
    ref_id: &str,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}",
        seq,
        ts.timestamp_micros(),
        wallet_id,
        kind.as_str(),
        amount.units(),
        ref_id,
    );
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// A pending append: everything the caller supplies, before the writer
/// assigns `seq`, `ts` and the hash linkage.
#[derive(Debug, Clone)]
pub struct Posting {
    pub wallet_id: String,
    pub kind: EntryKind,
    pub amount: Credits,
    pub ref_id: String,
}

impl Posting {
    pub fn new(
        wallet_id: impl Into<String>,
        kind: EntryKind,
        amount: Credits,
        ref_id: impl Into<String>,
    ) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            kind,
            amount,
            ref_id: ref_id.into(),
        }
    }
}

struct LedgerInner {
    entries: Vec<LedgerEntry>,
    file: Option<File>,
}

pub struct Ledger {
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    /// In-memory journal; nothing is persisted.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                entries: Vec::new(),
                file: None,
            }),
        }
    }

    /// Journal backed by an append-only JSONL file. An existing file is
    /// imported and verified before any new entry is accepted.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LedgerEntry = serde_json::from_str(&line).map_err(|e| {
                    anyhow::anyhow!("journal {} line {}: {}", path.display(), line_no + 1, e)
                })?;
                entries.push(entry);
            }
            if let Err(bad_seq) = Self::verify(&entries) {
                anyhow::bail!(
                    "journal {} failed hash-chain verification at seq {}",
                    path.display(),
                    bad_seq
                );
            }
            tracing::info!(
                entries = entries.len(),
                path = %path.display(),
                "journal imported and verified"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Mutex::new(LedgerInner {
                entries,
                file: Some(file),
            }),
        })
    }

    /// Append a batch of postings as consecutive entries under one lock
    /// acquisition. Multi-wallet operations (chain reserves, transfers) use
    /// this so their entries are adjacent and share one atomic section.
    pub fn append_batch(&self, postings: &[Posting]) -> Vec<LedgerEntry> {
        let mut inner = self.inner.lock().expect("ledger poisoned");
        let mut appended = Vec::with_capacity(postings.len());

        for posting in postings {
            let seq = inner.entries.len() as u64 + 1;
            let prev_hash = inner
                .entries
                .last()
                .map(|e| e.hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            let ts = Utc::now();
            let hash = compute_hash(
                &prev_hash,
                seq,
                &ts,
                &posting.wallet_id,
                posting.kind,
                posting.amount,
                &posting.ref_id,
            );
            let entry = LedgerEntry {
                seq,
                ts,
                wallet_id: posting.wallet_id.clone(),
                kind: posting.kind,
                amount: posting.amount,
                ref_id: posting.ref_id.clone(),
                prev_hash,
                hash,
            };

            if let Some(file) = inner.file.as_mut() {
                match serde_json::to_string(&entry) {
                    Ok(json) => {
                        if let Err(e) = writeln!(file, "{json}") {
                            tracing::error!("journal flush failed: {e}");
                        }
                    }
                    Err(e) => tracing::error!("journal serialization failed: {e}"),
                }
            }

            inner.entries.push(entry.clone());
            appended.push(entry);
        }
        appended
    }

    pub fn append(&self, posting: Posting) -> LedgerEntry {
        self.append_batch(std::slice::from_ref(&posting))
            .into_iter()
            .next()
            .expect("append_batch returns one entry per posting")
    }

    /// Walk a chain and recompute every hash. Returns the `seq` of the
    /// first entry that fails linkage or digest verification.
    pub fn verify(entries: &[LedgerEntry]) -> Result<(), u64> {
        let mut prev_hash = GENESIS_HASH.to_string();
        let mut prev_seq = 0u64;
        for entry in entries {
            if entry.seq <= prev_seq || entry.prev_hash != prev_hash {
                return Err(entry.seq);
            }
            let expected = compute_hash(
                &entry.prev_hash,
                entry.seq,
                &entry.ts,
                &entry.wallet_id,
                entry.kind,
                entry.amount,
                &entry.ref_id,
            );
            if entry.hash != expected {
                return Err(entry.seq);
            }
            prev_seq = entry.seq;
            prev_hash = entry.hash.clone();
        }
        Ok(())
    }

    pub fn verify_all(&self) -> Result<(), u64> {
        let inner = self.inner.lock().expect("ledger poisoned");
        Self::verify(&inner.entries)
    }

    /// Query by wallet and time range, oldest first, bounded by `limit`.
    pub fn query(
        &self,
        wallet_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<LedgerEntry> {
        let inner = self.inner.lock().expect("ledger poisoned");
        inner
            .entries
            .iter()
            .filter(|e| wallet_id.is_none_or(|w| e.wallet_id == w))
            .filter(|e| since.is_none_or(|t| e.ts >= t))
            .filter(|e| until.is_none_or(|t| e.ts <= t))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn export_jsonl(&self) -> String {
        let inner = self.inner.lock().expect("ledger poisoned");
        let mut out = String::new();
        for entry in &inner.entries {
            if let Ok(json) = serde_json::to_string(entry) {
                out.push_str(&json);
                out.push('\n');
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ledger poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Net posted amount for a wallet: settles, transfers and rollovers
    /// move balance; reserves and refunds only move holds.
    pub fn posted_sum(&self, wallet_id: &str) -> Credits {
        let inner = self.inner.lock().expect("ledger poisoned");
        inner
            .entries
            .iter()
            .filter(|e| e.wallet_id == wallet_id)
            .map(|e| match e.kind {
                EntryKind::Settle | EntryKind::TransferDebit => -e.amount,
                EntryKind::TransferCredit => e.amount,
                EntryKind::Rollover => -e.amount,
                _ => Credits::ZERO,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posting(wallet: &str, kind: EntryKind, units: i64, ref_id: &str) -> Posting {
        Posting::new(wallet, kind, Credits::from_units(units), ref_id)
    }

    #[test]
    fn test_chain_links_and_verifies() {
        let ledger = Ledger::in_memory();
        ledger.append(posting("w1", EntryKind::Reserve, 100, "r1"));
        ledger.append(posting("w1", EntryKind::Settle, 80, "r1"));
        ledger.append(posting("w2", EntryKind::TransferCredit, 500, "x1"));
        assert!(ledger.verify_all().is_ok());

        let entries = ledger.query(None, None, None, usize::MAX);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[2].prev_hash, entries[1].hash);
    }

    #[test]
    fn test_tamper_detected_at_first_bad_seq() {
        let ledger = Ledger::in_memory();
        ledger.append(posting("w1", EntryKind::Reserve, 100, "r1"));
        ledger.append(posting("w1", EntryKind::Settle, 80, "r1"));
        ledger.append(posting("w1", EntryKind::Refund, 20, "r1"));

        let mut entries = ledger.query(None, None, None, usize::MAX);
        entries[1].amount = Credits::from_units(8_000);
        assert_eq!(Ledger::verify(&entries), Err(2));
    }

    #[test]
    fn test_inserted_entry_breaks_chain() {
        let ledger = Ledger::in_memory();
        ledger.append(posting("w1", EntryKind::Reserve, 100, "r1"));
        ledger.append(posting("w1", EntryKind::Settle, 100, "r1"));

        let mut entries = ledger.query(None, None, None, usize::MAX);
        let mut forged = entries[1].clone();
        forged.seq = 2;
        forged.wallet_id = "attacker".to_string();
        entries.insert(1, forged);
        assert!(Ledger::verify(&entries).is_err());
    }

    #[test]
    fn test_transfer_entries_are_adjacent() {
        let ledger = Ledger::in_memory();
        let entries = ledger.append_batch(&[
            posting("a", EntryKind::TransferDebit, 500_000, "x1"),
            posting("b", EntryKind::TransferCredit, 500_000, "x1"),
        ]);
        assert_eq!(entries[0].seq + 1, entries[1].seq);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert!(ledger.verify_all().is_ok());
    }

    #[test]
    fn test_jsonl_round_trip_preserves_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.append(posting("w1", EntryKind::Reserve, 100, "r1"));
            ledger.append(posting("w1", EntryKind::Settle, 90, "r1"));
        }
        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.verify_all().is_ok());

        // Appends continue the persisted chain.
        reopened.append(posting("w1", EntryKind::Refund, 10, "r1"));
        assert!(reopened.verify_all().is_ok());
        assert_eq!(reopened.len(), 3);
    }

    #[test]
    fn test_query_filters() {
        let ledger = Ledger::in_memory();
        ledger.append(posting("w1", EntryKind::Settle, 10, "a"));
        ledger.append(posting("w2", EntryKind::Settle, 20, "b"));
        ledger.append(posting("w1", EntryKind::Settle, 30, "c"));

        let w1 = ledger.query(Some("w1"), None, None, usize::MAX);
        assert_eq!(w1.len(), 2);
        let capped = ledger.query(None, None, None, 1);
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_posted_sum() {
        let ledger = Ledger::in_memory();
        ledger.append(posting("w1", EntryKind::Reserve, 1_000, "r1"));
        ledger.append(posting("w1", EntryKind::Settle, 800, "r1"));
        ledger.append(posting("w1", EntryKind::TransferCredit, 500, "x1"));
        assert_eq!(ledger.posted_sum("w1"), Credits::from_units(-300));
    }
}
