//! Audit facade over the ledger.
//!
//! Wallet operations journal themselves through the store; everything else
//! that changes state (refused requests, cache invalidations) lands here so
//! the hash chain stays the single record of truth. Readers query, never
//! mutate.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::credits::Credits;
use crate::wallet::ledger::{EntryKind, Ledger, LedgerEntry, Posting};

pub struct AuditLog {
    ledger: Arc<Ledger>,
}

impl AuditLog {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Refused request (policy block, budget refusal). Zero-amount entry
    /// against the wallet that would have been charged.
    pub fn record_block(&self, wallet_id: &str, request_id: &str, reason: &str) {
        self.ledger.append(Posting::new(
            wallet_id.to_string(),
            EntryKind::Block,
            Credits::ZERO,
            format!("{request_id}:{reason}"),
        ));
    }

    /// Cache namespace flush, attributed to the tenant's org wallet.
    pub fn record_cache_invalidation(&self, wallet_id: &str, namespace: &str, removed: usize) {
        self.ledger.append(Posting::new(
            wallet_id.to_string(),
            EntryKind::CacheInvalidate,
            Credits::ZERO,
            format!("cache:{namespace}:{removed}"),
        ));
    }

    pub fn query(
        &self,
        wallet_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<LedgerEntry> {
        self.ledger.query(wallet_id, since, until, limit)
    }

    pub fn export_jsonl(&self) -> String {
        self.ledger.export_jsonl()
    }

    /// Full-chain verification; `Err` carries the first bad sequence number.
    pub fn verify(&self) -> Result<(), u64> {
        self.ledger.verify_all()
    }

    pub fn len(&self) -> usize {
        self.ledger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_entries_join_the_chain() {
        let ledger = Arc::new(Ledger::in_memory());
        let audit = AuditLog::new(ledger.clone());

        audit.record_block("user:acme:u1", "req-9", "budget_exhausted");
        audit.record_cache_invalidation("org:acme", "frontier", 3);

        assert_eq!(audit.len(), 2);
        assert!(audit.verify().is_ok());

        let entries = audit.query(Some("user:acme:u1"), None, None, 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Block);
        assert_eq!(entries[0].amount, Credits::ZERO);
    }
}
