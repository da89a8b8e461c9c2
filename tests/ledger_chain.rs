//! Hash-chain integrity: verification over real operation mixes, tamper
//! detection, and JSONL durability round trips.

use std::sync::Arc;
use std::time::Duration;

use alfred::audit::AuditLog;
use alfred::config::WalletDefaults;
use alfred::credits::Credits;
use alfred::wallet::ledger::Ledger;
use alfred::wallet::{ChargeScope, WalletStore};

fn defaults() -> WalletDefaults {
    serde_json::from_value(serde_json::json!({
        "transfer_daily_cap": 1000.0,
        "transfer_cooldown_secs": 0,
    }))
    .unwrap()
}

fn scope<'a>(user: &'a str) -> ChargeScope<'a> {
    ChargeScope {
        tenant_id: "acme",
        team_id: None,
        user_id: user,
        project_id: None,
    }
}

async fn run_operation_mix(store: &WalletStore) {
    let cfg = defaults();
    let a = store.ensure_chain(&scope("a"), &cfg);
    let b = store.ensure_chain(&scope("b"), &cfg);

    let r1 = store
        .reserve(&a, Credits::from_decimal(2.0), Duration::from_secs(60))
        .await
        .unwrap();
    store
        .settle(&r1.id, Credits::from_decimal(1.5), "req-1")
        .await
        .unwrap();

    let r2 = store
        .reserve(&a, Credits::from_decimal(1.0), Duration::from_secs(60))
        .await
        .unwrap();
    store.refund(&r2.id).await.unwrap();

    store
        .transfer(&a, &b, Credits::from_decimal(5.0), &cfg)
        .await
        .unwrap();
}

#[tokio::test]
async fn full_chain_verifies_after_mixed_operations() {
    let ledger = Arc::new(Ledger::in_memory());
    let store = WalletStore::new(ledger.clone());
    run_operation_mix(&store).await;

    assert!(ledger.len() > 5);
    assert!(ledger.verify_all().is_ok());

    // Every prefix of the journal also verifies.
    let entries = ledger.query(None, None, None, usize::MAX);
    for cut in 0..=entries.len() {
        assert!(Ledger::verify(&entries[..cut]).is_ok());
    }
}

#[tokio::test]
async fn mutation_detected_at_exact_seq() {
    let ledger = Arc::new(Ledger::in_memory());
    let store = WalletStore::new(ledger.clone());
    run_operation_mix(&store).await;

    let entries = ledger.query(None, None, None, usize::MAX);
    for victim in [0, entries.len() / 2, entries.len() - 1] {
        let mut tampered = entries.clone();
        tampered[victim].amount = tampered[victim].amount + Credits::from_decimal(99.0);
        assert_eq!(
            Ledger::verify(&tampered),
            Err(entries[victim].seq),
            "tampering entry {victim} must fail at its own seq"
        );
    }
}

#[tokio::test]
async fn insertion_and_reorder_detected() {
    let ledger = Arc::new(Ledger::in_memory());
    let store = WalletStore::new(ledger.clone());
    run_operation_mix(&store).await;

    let entries = ledger.query(None, None, None, usize::MAX);

    let mut inserted = entries.clone();
    let mut forged = entries[2].clone();
    forged.wallet_id = "user:intruder:x".to_string();
    inserted.insert(2, forged);
    assert!(Ledger::verify(&inserted).is_err());

    let mut reordered = entries.clone();
    reordered.swap(1, 2);
    assert!(Ledger::verify(&reordered).is_err());
}

#[tokio::test]
async fn jsonl_round_trip_preserves_integrity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.jsonl");

    {
        let ledger = Arc::new(Ledger::open(&path).unwrap());
        let store = WalletStore::new(ledger);
        run_operation_mix(&store).await;
    }

    // Reopen: import verifies and appends continue the chain.
    let reopened = Arc::new(Ledger::open(&path).unwrap());
    let persisted = reopened.len();
    assert!(persisted > 5);
    assert!(reopened.verify_all().is_ok());

    let store = WalletStore::new(reopened.clone());
    run_operation_mix(&store).await;
    assert!(reopened.len() > persisted);
    assert!(reopened.verify_all().is_ok());

    // Export matches what the file holds, line for line.
    let exported = reopened.export_jsonl();
    assert_eq!(exported.lines().count(), reopened.len());
}

#[tokio::test]
async fn corrupted_journal_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.jsonl");

    {
        let ledger = Arc::new(Ledger::open(&path).unwrap());
        let store = WalletStore::new(ledger);
        run_operation_mix(&store).await;
    }

    // Flip one amount in place.
    let content = std::fs::read_to_string(&path).unwrap();
    let tampered: String = content
        .lines()
        .enumerate()
        .map(|(i, line)| {
            if i == 1 {
                line.replace("\"amount\":", "\"amount\":9")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(&path, tampered + "\n").unwrap();

    assert!(Ledger::open(&path).is_err());
}

#[tokio::test]
async fn audit_entries_share_the_chain() {
    let ledger = Arc::new(Ledger::in_memory());
    let store = WalletStore::new(ledger.clone());
    let audit = AuditLog::new(ledger.clone());

    run_operation_mix(&store).await;
    audit.record_block("user:acme:a", "req-9", "forbidden");
    audit.record_cache_invalidation("org:acme", "frontier", 2);
    run_operation_mix(&store).await;

    assert!(audit.verify().is_ok());
    let blocks = audit.query(Some("user:acme:a"), None, None, usize::MAX);
    assert!(blocks.iter().any(|e| e.ref_id.starts_with("req-9")));
}
