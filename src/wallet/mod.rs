//! Hierarchical wallets and the two-phase reserve→settle protocol.
//!
//! Wallets form a tree (org → team → user → optional project). A charge
//! holds credits on the target wallet and every ancestor, so availability is
//! always the minimum of the effective remainders along the chain. Per-wallet
//! `tokio::sync::Mutex`es serialize conflicting writes; multi-wallet
//! operations take their locks in wallet-id order, which keeps lock
//! acquisition globally deterministic and deadlock-free.
//!
//! Every mutation appends to the hash-chained [`ledger`]; wallets are never
//! deleted, only soft-retired.

pub mod ledger;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::WalletDefaults;
use crate::credits::Credits;
use crate::error::GatewayError;
use ledger::{EntryKind, Ledger, Posting};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    Org,
    Team,
    User,
    Project,
}

impl WalletKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletKind::Org => "org",
            WalletKind::Team => "team",
            WalletKind::User => "user",
            WalletKind::Project => "project",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: WalletKind,
    pub limit: Credits,
    pub balance: Credits,
    pub reserved: Credits,
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
    pub hard_cap: bool,
    pub overdraft_bps: u32,
    /// Soft-retirement tombstone; retired wallets refuse all charges
    pub retired: bool,
    /// Credits received via transfer in the current cycle
    pub transferred_in: Credits,
}

impl Wallet {
    /// Spendable headroom: balance minus holds, extended by the overdraft
    /// allowance when the cap is soft.
    pub fn available(&self) -> Credits {
        let allowance = if self.hard_cap {
            Credits::ZERO
        } else {
            self.limit.bps(self.overdraft_bps)
        };
        self.balance - self.reserved + allowance
    }
}

/// Read-only view handed to routing policy and the balance endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WalletSnapshot {
    pub id: String,
    pub kind: WalletKind,
    pub limit: Credits,
    pub balance: Credits,
    pub reserved: Credits,
    pub available: Credits,
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: DateTime<Utc>,
    pub transferred_in: Credits,
}

impl WalletSnapshot {
    fn of(wallet: &Wallet) -> Self {
        Self {
            id: wallet.id.clone(),
            kind: wallet.kind,
            limit: wallet.limit,
            balance: wallet.balance,
            reserved: wallet.reserved,
            available: wallet.available(),
            cycle_start: wallet.cycle_start,
            cycle_end: wallet.cycle_end,
            transferred_in: wallet.transferred_in,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Open,
    Settled,
    Expired,
    Refunded,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: String,
    pub wallet_id: String,
    /// Wallet ids holding this reservation, leaf first
    pub chain: Vec<String>,
    pub reserved: Credits,
    pub created: DateTime<Utc>,
    pub ttl: Duration,
    pub state: ReservationState,
    pub settled_amount: Option<Credits>,
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient funds")]
    BudgetExhausted {
        shortfall: Credits,
        available: Credits,
    },
    #[error("wallet {0} is retired")]
    Closed(String),
    #[error("wallet {0} not found")]
    NotFound(String),
    #[error("reservation {0} not found")]
    ReservationNotFound(String),
    #[error("{0}")]
    TransferLimit(String),
}

impl From<WalletError> for GatewayError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::BudgetExhausted {
                shortfall,
                available,
            } => GatewayError::BudgetExhausted {
                shortfall,
                available,
            },
            WalletError::Closed(id) => GatewayError::Forbidden(format!("wallet {id} is retired")),
            WalletError::NotFound(id) => GatewayError::NotFound(format!("wallet {id}")),
            WalletError::ReservationNotFound(id) => {
                GatewayError::NotFound(format!("reservation {id}"))
            }
            WalletError::TransferLimit(msg) => GatewayError::TransferLimit(msg),
        }
    }
}

/// Identity facts a request charges against.
#[derive(Debug, Clone)]
pub struct ChargeScope<'a> {
    pub tenant_id: &'a str,
    pub team_id: Option<&'a str>,
    pub user_id: &'a str,
    pub project_id: Option<&'a str>,
}

pub struct WalletStore {
    wallets: DashMap<String, Arc<Mutex<Wallet>>>,
    /// Tree topology, immutable once a wallet exists; lets chain walks skip
    /// wallet locks entirely.
    parents: DashMap<String, Option<String>>,
    reservations: DashMap<String, StdMutex<Reservation>>,
    /// Outbound transfer history per wallet, for daily caps and cooldowns
    transfer_log: DashMap<String, Arc<Mutex<Vec<(DateTime<Utc>, Credits)>>>>,
    ledger: Arc<Ledger>,
}

impl WalletStore {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            wallets: DashMap::new(),
            parents: DashMap::new(),
            reservations: DashMap::new(),
            transfer_log: DashMap::new(),
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn wallets_count(&self) -> usize {
        self.wallets.len()
    }

    pub fn open_reservations(&self) -> usize {
        self.reservations
            .iter()
            .filter(|r| {
                r.value()
                    .lock()
                    .map(|res| res.state == ReservationState::Open)
                    .unwrap_or(false)
            })
            .count()
    }

    // -------------------------------------------------------------------------
    // Provisioning
    // -------------------------------------------------------------------------

    pub fn org_wallet_id(tenant_id: &str) -> String {
        format!("org:{tenant_id}")
    }

    pub fn user_wallet_id(tenant_id: &str, user_id: &str) -> String {
        format!("user:{tenant_id}:{user_id}")
    }

    /// Tenant segment of a wallet id ("kind:tenant[:rest]").
    pub fn wallet_tenant(wallet_id: &str) -> Option<&str> {
        let mut parts = wallet_id.splitn(3, ':');
        parts.next()?;
        parts.next()
    }

    fn create_if_absent(
        &self,
        id: &str,
        parent_id: Option<&str>,
        kind: WalletKind,
        limit: Credits,
        defaults: &WalletDefaults,
    ) {
        if self.wallets.contains_key(id) {
            return;
        }
        let now = Utc::now();
        let wallet = Wallet {
            id: id.to_string(),
            parent_id: parent_id.map(str::to_string),
            kind,
            limit,
            balance: limit,
            reserved: Credits::ZERO,
            cycle_start: now,
            cycle_end: now + ChronoDuration::days(defaults.cycle_days as i64),
            hard_cap: defaults.hard_cap,
            overdraft_bps: defaults.overdraft_bps,
            retired: false,
            transferred_in: Credits::ZERO,
        };
        self.parents
            .insert(id.to_string(), parent_id.map(str::to_string));
        self.wallets
            .insert(id.to_string(), Arc::new(Mutex::new(wallet)));
        tracing::debug!(wallet_id = %id, kind = kind.as_str(), "wallet provisioned");
    }

    /// Lazily provision the wallet chain for a request scope and return the
    /// id of the leaf the charge lands on.
    pub fn ensure_chain(&self, scope: &ChargeScope<'_>, defaults: &WalletDefaults) -> String {
        let org_id = Self::org_wallet_id(scope.tenant_id);
        self.create_if_absent(
            &org_id,
            None,
            WalletKind::Org,
            Credits::from_decimal(defaults.org_limit),
            defaults,
        );

        let mut parent = org_id;
        if let Some(team) = scope.team_id {
            let team_id = format!("team:{}:{}", scope.tenant_id, team);
            self.create_if_absent(
                &team_id,
                Some(&parent),
                WalletKind::Team,
                Credits::from_decimal(defaults.team_limit),
                defaults,
            );
            parent = team_id;
        }

        let user_id = Self::user_wallet_id(scope.tenant_id, scope.user_id);
        self.create_if_absent(
            &user_id,
            Some(&parent),
            WalletKind::User,
            Credits::from_decimal(defaults.user_limit),
            defaults,
        );

        match scope.project_id {
            Some(project) => {
                let project_id = format!("project:{}:{}", scope.tenant_id, project);
                self.create_if_absent(
                    &project_id,
                    Some(&user_id),
                    WalletKind::Project,
                    Credits::from_decimal(defaults.project_limit),
                    defaults,
                );
                project_id
            }
            None => user_id,
        }
    }

    /// Soft-retire; history and the journal stay intact.
    pub async fn retire(&self, wallet_id: &str) -> Result<(), WalletError> {
        let handle = self
            .wallets
            .get(wallet_id)
            .map(|w| w.value().clone())
            .ok_or_else(|| WalletError::NotFound(wallet_id.to_string()))?;
        handle.lock().await.retired = true;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Chain plumbing
    // -------------------------------------------------------------------------

    /// Wallet ids from leaf to root, following parent pointers.
    fn chain_ids(&self, leaf_id: &str) -> Result<Vec<String>, WalletError> {
        let mut chain = Vec::new();
        let mut cursor = Some(leaf_id.to_string());
        while let Some(id) = cursor {
            if chain.contains(&id) {
                // Parent pointers form a tree by construction; a repeated id
                // would mean corrupted topology.
                break;
            }
            let parent = self
                .parents
                .get(&id)
                .map(|p| p.value().clone())
                .ok_or_else(|| WalletError::NotFound(id.clone()))?;
            chain.push(id);
            cursor = parent;
        }
        Ok(chain)
    }

    /// Lock a set of wallets in id order and return the guards keyed by id.
    async fn lock_wallets(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, OwnedMutexGuard<Wallet>>, WalletError> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = HashMap::with_capacity(sorted.len());
        for id in sorted {
            let handle = self
                .wallets
                .get(id)
                .map(|w| w.value().clone())
                .ok_or_else(|| WalletError::NotFound(id.clone()))?;
            guards.insert(id.clone(), handle.lock_owned().await);
        }
        Ok(guards)
    }

    // -------------------------------------------------------------------------
    // Reserve / settle / refund
    // -------------------------------------------------------------------------

    /// Atomically hold `amount` on the leaf wallet and every ancestor.
    /// Availability is checked on the whole chain before any hold is taken;
    /// concurrent reservers are serialized by the wallet locks, so the store
    /// never oversells.
    pub async fn reserve(
        &self,
        leaf_id: &str,
        amount: Credits,
        ttl: Duration,
    ) -> Result<Reservation, WalletError> {
        let chain = self.chain_ids(leaf_id)?;
        let mut guards = self.lock_wallets(&chain).await?;

        let mut min_available: Option<Credits> = None;
        for id in &chain {
            let wallet = &guards[id];
            if wallet.retired {
                return Err(WalletError::Closed(id.clone()));
            }
            let available = wallet.available();
            min_available = Some(match min_available {
                Some(current) => current.min(available),
                None => available,
            });
        }
        let available = min_available.unwrap_or(Credits::ZERO);
        if available < amount {
            return Err(WalletError::BudgetExhausted {
                shortfall: amount - available,
                available: available.max(Credits::ZERO),
            });
        }

        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            wallet_id: leaf_id.to_string(),
            chain: chain.clone(),
            reserved: amount,
            created: Utc::now(),
            ttl,
            state: ReservationState::Open,
            settled_amount: None,
        };

        let mut postings = Vec::with_capacity(chain.len());
        for id in &chain {
            let wallet = guards.get_mut(id).expect("guard for chain wallet");
            wallet.reserved += amount;
            postings.push(Posting::new(
                id.clone(),
                EntryKind::Reserve,
                amount,
                reservation.id.clone(),
            ));
        }
        self.ledger.append_batch(&postings);

        self.reservations
            .insert(reservation.id.clone(), StdMutex::new(reservation.clone()));
        Ok(reservation)
    }

    /// Claim an open reservation for a terminal transition. Returns the
    /// chain and held amount; `None` when another caller got there first.
    fn claim(
        &self,
        reservation_id: &str,
        next: ReservationState,
        settled_amount: Option<Credits>,
    ) -> Result<Option<(Vec<String>, Credits)>, WalletError> {
        let entry = self
            .reservations
            .get(reservation_id)
            .ok_or_else(|| WalletError::ReservationNotFound(reservation_id.to_string()))?;
        let mut reservation = entry.value().lock().expect("reservation poisoned");
        if reservation.state != ReservationState::Open {
            return Ok(None);
        }
        reservation.state = next;
        reservation.settled_amount = settled_amount;
        Ok(Some((reservation.chain.clone(), reservation.reserved)))
    }

    fn settled_amount(&self, reservation_id: &str) -> Credits {
        self.reservations
            .get(reservation_id)
            .and_then(|entry| {
                entry
                    .value()
                    .lock()
                    .ok()
                    .and_then(|res| res.settled_amount)
            })
            .unwrap_or(Credits::ZERO)
    }

    /// Finalize a reservation with the actual consumed amount, clamped into
    /// `[0, reserved]`. The unused remainder of the hold is released in the
    /// same atomic section. Idempotent: repeat calls return the original
    /// charge without touching balances.
    pub async fn settle(
        &self,
        reservation_id: &str,
        actual: Credits,
        ref_id: &str,
    ) -> Result<Credits, WalletError> {
        let charge_cap = {
            let entry = self
                .reservations
                .get(reservation_id)
                .ok_or_else(|| WalletError::ReservationNotFound(reservation_id.to_string()))?;
            let reservation = entry.value().lock().expect("reservation poisoned");
            reservation.reserved
        };
        let charge = actual.clamp(Credits::ZERO, charge_cap);

        let Some((chain, reserved)) =
            self.claim(reservation_id, ReservationState::Settled, Some(charge))?
        else {
            return Ok(self.settled_amount(reservation_id));
        };

        let mut guards = self.lock_wallets(&chain).await?;
        let mut postings = Vec::with_capacity(chain.len());
        for id in &chain {
            let wallet = guards.get_mut(id).expect("guard for chain wallet");
            wallet.reserved -= reserved;
            wallet.balance -= charge;
            postings.push(Posting::new(
                id.clone(),
                EntryKind::Settle,
                charge,
                ref_id.to_string(),
            ));
        }
        self.ledger.append_batch(&postings);

        tracing::debug!(
            reservation_id,
            charged = %charge,
            released = %(reserved - charge),
            "reservation settled"
        );
        Ok(charge)
    }

    /// Release the entire hold without charging. Idempotent.
    pub async fn refund(&self, reservation_id: &str) -> Result<(), WalletError> {
        let Some((chain, reserved)) =
            self.claim(reservation_id, ReservationState::Refunded, None)?
        else {
            return Ok(());
        };
        self.release_hold(&chain, reserved, reservation_id).await
    }

    async fn release_hold(
        &self,
        chain: &[String],
        reserved: Credits,
        ref_id: &str,
    ) -> Result<(), WalletError> {
        let mut guards = self.lock_wallets(chain).await?;
        let mut postings = Vec::with_capacity(chain.len());
        for id in chain {
            let wallet = guards.get_mut(id).expect("guard for chain wallet");
            wallet.reserved -= reserved;
            postings.push(Posting::new(
                id.clone(),
                EntryKind::Refund,
                reserved,
                ref_id.to_string(),
            ));
        }
        self.ledger.append_batch(&postings);
        Ok(())
    }

    /// Janitor sweep: expire reservations past their TTL and release their
    /// holds so no orphan survives a crashed or abandoned request.
    pub async fn expire_reservations(&self, now: DateTime<Utc>) -> usize {
        let mut expirable = Vec::new();
        for entry in self.reservations.iter() {
            let reservation = entry.value().lock().expect("reservation poisoned");
            if reservation.state == ReservationState::Open {
                let deadline = reservation.created
                    + ChronoDuration::milliseconds(reservation.ttl.as_millis() as i64);
                if now >= deadline {
                    expirable.push(entry.key().clone());
                }
            }
        }

        let mut expired = 0;
        for id in expirable {
            match self.claim(&id, ReservationState::Expired, None) {
                Ok(Some((chain, reserved))) => {
                    if self.release_hold(&chain, reserved, &id).await.is_ok() {
                        expired += 1;
                        tracing::warn!(reservation_id = %id, "reservation expired by janitor");
                    }
                }
                _ => continue,
            }
        }
        expired
    }

    // -------------------------------------------------------------------------
    // Transfers
    // -------------------------------------------------------------------------

    /// Move credits between two wallets as a linked debit/credit pair of
    /// journal entries in one atomic section. Enforces the sender's daily
    /// cap and cooldown.
    pub async fn transfer(
        &self,
        from_id: &str,
        to_id: &str,
        amount: Credits,
        defaults: &WalletDefaults,
    ) -> Result<String, WalletError> {
        if amount <= Credits::ZERO {
            return Err(WalletError::TransferLimit(
                "transfer amount must be positive".to_string(),
            ));
        }
        if from_id == to_id {
            return Err(WalletError::TransferLimit(
                "cannot transfer a wallet to itself".to_string(),
            ));
        }

        let log_handle = self
            .transfer_log
            .entry(from_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        // Held across the wallet mutation so concurrent transfers from the
        // same sender cannot both pass the cap check.
        let mut log = log_handle.lock().await;

        let now = Utc::now();
        let day_ago = now - ChronoDuration::hours(24);
        log.retain(|(ts, _)| *ts > day_ago);

        if let Some((last_ts, _)) = log.last() {
            let cooldown = ChronoDuration::seconds(defaults.transfer_cooldown_secs as i64);
            if *last_ts + cooldown > now {
                return Err(WalletError::TransferLimit(format!(
                    "cooldown active; retry after {}s",
                    defaults.transfer_cooldown_secs
                )));
            }
        }
        let today_total: Credits = log.iter().map(|(_, amount)| *amount).sum();
        let daily_cap = Credits::from_decimal(defaults.transfer_daily_cap);
        if today_total + amount > daily_cap {
            return Err(WalletError::TransferLimit(format!(
                "daily transfer cap of {daily_cap} credits exceeded"
            )));
        }

        let ids = vec![from_id.to_string(), to_id.to_string()];
        let mut guards = self.lock_wallets(&ids).await?;
        {
            let from = &guards[from_id];
            if from.retired {
                return Err(WalletError::Closed(from_id.to_string()));
            }
            let available = from.available();
            if available < amount {
                return Err(WalletError::BudgetExhausted {
                    shortfall: amount - available,
                    available: available.max(Credits::ZERO),
                });
            }
            if guards[to_id].retired {
                return Err(WalletError::Closed(to_id.to_string()));
            }
        }

        let transfer_id = uuid::Uuid::new_v4().to_string();
        {
            let from = guards.get_mut(from_id).expect("sender guard");
            from.balance -= amount;
        }
        {
            let to = guards.get_mut(to_id).expect("recipient guard");
            to.balance += amount;
            to.transferred_in += amount;
        }
        self.ledger.append_batch(&[
            Posting::new(
                from_id.to_string(),
                EntryKind::TransferDebit,
                amount,
                transfer_id.clone(),
            ),
            Posting::new(
                to_id.to_string(),
                EntryKind::TransferCredit,
                amount,
                transfer_id.clone(),
            ),
        ]);
        log.push((now, amount));

        tracing::info!(
            from = %from_id,
            to = %to_id,
            amount = %amount,
            transfer_id = %transfer_id,
            "transfer completed"
        );
        Ok(transfer_id)
    }

    // -------------------------------------------------------------------------
    // Rollover
    // -------------------------------------------------------------------------

    /// Cycle boundary: sweep the configured percentage of each expired leaf
    /// wallet's unused balance into its org root, then re-initialize the
    /// wallet to its configured limit for the next cycle.
    pub async fn rollover(&self, now: DateTime<Utc>, defaults: &WalletDefaults) -> usize {
        let mut due = Vec::new();
        for entry in self.wallets.iter() {
            // Reading cycle metadata needs the lock; keep it short.
            if let Ok(wallet) = entry.value().try_lock() {
                if wallet.kind != WalletKind::Org && !wallet.retired && wallet.cycle_end <= now {
                    due.push(entry.key().clone());
                }
            }
        }

        let mut swept = 0;
        for id in due {
            let Ok(chain) = self.chain_ids(&id) else {
                continue;
            };
            let Some(org_id) = chain.last().cloned() else {
                continue;
            };
            let ids = vec![id.clone(), org_id.clone()];
            let Ok(mut guards) = self.lock_wallets(&ids).await else {
                continue;
            };

            let cycle_ref = format!("cycle:{}", now.format("%Y-%m-%d"));
            let moved = {
                let wallet = guards.get_mut(&id).expect("leaf guard");
                if wallet.cycle_end > now {
                    continue; // re-checked under the lock
                }
                let moved = if wallet.balance > Credits::ZERO {
                    wallet.balance.bps(defaults.rollover_pct * 100)
                } else {
                    Credits::ZERO
                };
                wallet.balance = wallet.limit;
                wallet.transferred_in = Credits::ZERO;
                wallet.cycle_start = now;
                wallet.cycle_end = now + ChronoDuration::days(defaults.cycle_days as i64);
                moved
            };

            let mut postings = vec![Posting::new(
                id.clone(),
                EntryKind::Rollover,
                moved,
                cycle_ref.clone(),
            )];
            if !moved.is_zero() && org_id != id {
                let org = guards.get_mut(&org_id).expect("org guard");
                org.balance += moved;
                postings.push(Posting::new(
                    org_id.clone(),
                    EntryKind::Rollover,
                    moved,
                    cycle_ref,
                ));
            }
            self.ledger.append_batch(&postings);
            swept += 1;
        }
        swept
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    pub async fn snapshot(&self, wallet_id: &str) -> Result<WalletSnapshot, WalletError> {
        let handle = self
            .wallets
            .get(wallet_id)
            .map(|w| w.value().clone())
            .ok_or_else(|| WalletError::NotFound(wallet_id.to_string()))?;
        let wallet = handle.lock().await;
        Ok(WalletSnapshot::of(&wallet))
    }

    /// Chain snapshot, leaf first.
    pub async fn chain_snapshot(
        &self,
        leaf_id: &str,
    ) -> Result<Vec<WalletSnapshot>, WalletError> {
        let chain = self.chain_ids(leaf_id)?;
        let mut snapshots = Vec::with_capacity(chain.len());
        for id in &chain {
            snapshots.push(self.snapshot(id).await?);
        }
        Ok(snapshots)
    }
}
