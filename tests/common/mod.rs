#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use collateral_backend::config::{EngineConfig, RetryConfig};
use collateral_backend::error::LedgerError;
use collateral_backend::models::collateral::{
    CollateralKind, CollateralProperties, CollateralRecord, LedgerAccount,
};
use collateral_backend::models::ledger::{KeyRef, LedgerReceipt, LedgerTransaction};
use collateral_backend::models::progress::UserEvent;
use collateral_backend::services::ledger_client::LedgerClient;
use collateral_backend::services::repository::{
    PurchaseSettlement, Repository, RepositoryError,
};

pub const PAYMENT_TOKEN: &str = "0.0.1001";
pub const COLLATERAL_TOKEN: &str = "0.0.5005";
pub const INVESTOR_USER: &str = "investor-1";
pub const INVESTOR_ACCOUNT: &str = "0.0.7001";
pub const BENEFICIARY_USER: &str = "pawnshop";
pub const BENEFICIARY_ACCOUNT: &str = "0.0.9001";
/// Owner of freshly minted units in the fake ledger
pub const TREASURY: &str = "treasury";

/// Small caps and near-zero backoff so retries stay fast
pub fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::new(PAYMENT_TOKEN);
    config.batch_size_cap = 5;
    config.default_max_parallel = 2;
    config.retry = RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        jitter_ceiling: Duration::ZERO,
    };
    config
}

#[derive(Default)]
struct LedgerState {
    submitted: Vec<LedgerTransaction>,
    reads: usize,
    next_tx: u64,
    next_serial: i64,
    /// (account, token) -> minor units
    balances: HashMap<(String, String), u64>,
    /// (token, owner) -> unit ids
    units: HashMap<(String, String), BTreeSet<i64>>,
    associations: HashSet<(String, String)>,
    frozen: HashSet<(String, String)>,
    total_supply: u64,
    /// Scripted failures, consumed by the first submit of the matching kind
    failures: Vec<(&'static str, LedgerError)>,
    /// Kinds that always fail
    broken: HashMap<&'static str, LedgerError>,
    /// Mints that succeed without returning serial numbers
    empty_mint_receipts: bool,
}

/// In-memory ledger applying transactions the way the network would
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn new() -> Self {
        let ledger = Self::default();
        ledger.state.lock().next_serial = 1;
        ledger
    }

    pub fn set_balance(&self, account: &str, token: &str, minor: u64) {
        self.state
            .lock()
            .balances
            .insert((account.to_string(), token.to_string()), minor);
    }

    pub fn balance(&self, account: &str, token: &str) -> u64 {
        self.state
            .lock()
            .balances
            .get(&(account.to_string(), token.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_total_supply(&self, supply: u64) {
        self.state.lock().total_supply = supply;
    }

    pub fn give_units(&self, token: &str, owner: &str, ids: impl IntoIterator<Item = i64>) {
        self.state
            .lock()
            .units
            .entry((token.to_string(), owner.to_string()))
            .or_default()
            .extend(ids);
    }

    pub fn units_of(&self, token: &str, owner: &str) -> Vec<i64> {
        self.state
            .lock()
            .units
            .get(&(token.to_string(), owner.to_string()))
            .map(|u| u.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn associate(&self, account: &str, token: &str) {
        self.state
            .lock()
            .associations
            .insert((account.to_string(), token.to_string()));
    }

    pub fn is_frozen(&self, account: &str, token: &str) -> bool {
        self.state
            .lock()
            .frozen
            .contains(&(account.to_string(), token.to_string()))
    }

    /// Fail the next submit of `kind` with `code`
    pub fn fail_next(&self, kind: &'static str, code: &str) {
        self.state
            .lock()
            .failures
            .push((kind, LedgerError::new(code, format!("scripted {}", code))));
    }

    /// Fail every submit of `kind` with `code`
    pub fn break_kind(&self, kind: &'static str, code: &str) {
        self.state
            .lock()
            .broken
            .insert(kind, LedgerError::new(code, format!("scripted {}", code)));
    }

    pub fn return_empty_mint_receipts(&self) {
        self.state.lock().empty_mint_receipts = true;
    }

    /// Every submit attempt, including failed ones
    pub fn submitted(&self) -> Vec<LedgerTransaction> {
        self.state.lock().submitted.clone()
    }

    pub fn submitted_kinds(&self) -> Vec<&'static str> {
        self.state.lock().submitted.iter().map(|t| t.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.state
            .lock()
            .submitted
            .iter()
            .filter(|t| t.kind() == kind)
            .count()
    }

    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    pub fn total_calls(&self) -> usize {
        let state = self.state.lock();
        state.reads + state.submitted.len()
    }
}

fn key(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

impl LedgerState {
    fn apply(&mut self, tx: &LedgerTransaction) -> Result<Vec<i64>, LedgerError> {
        match tx {
            LedgerTransaction::MintUnits { token_id, count, .. } => {
                if self.empty_mint_receipts {
                    return Ok(Vec::new());
                }
                let ids: Vec<i64> = (0..*count as i64).map(|i| self.next_serial + i).collect();
                self.next_serial += *count as i64;
                self.units
                    .entry(key(token_id, TREASURY))
                    .or_default()
                    .extend(ids.iter().copied());
                Ok(ids)
            }
            LedgerTransaction::TransferFungible {
                token_id,
                from_account_id,
                to_account_id,
                amount,
                ..
            } => {
                let from = self.balances.entry(key(from_account_id, token_id)).or_default();
                if *from < *amount {
                    return Err(LedgerError::new(
                        "INSUFFICIENT_ACCOUNT_BALANCE",
                        "insufficient account balance",
                    ));
                }
                *from -= amount;
                *self.balances.entry(key(to_account_id, token_id)).or_default() += amount;
                Ok(Vec::new())
            }
            LedgerTransaction::TransferUnits {
                token_id,
                unit_ids,
                from_account_id,
                to_account_id,
                ..
            } => {
                if self.frozen.contains(&key(to_account_id, token_id)) {
                    return Err(LedgerError::new(
                        "ACCOUNT_FROZEN_FOR_TOKEN",
                        "account frozen for token",
                    ));
                }
                let from = self.units.entry(key(token_id, from_account_id)).or_default();
                if !unit_ids.iter().all(|id| from.contains(id)) {
                    return Err(LedgerError::new(
                        "SENDER_DOES_NOT_OWN_NFT_SERIAL_NO",
                        "sender does not own unit",
                    ));
                }
                for id in unit_ids {
                    from.remove(id);
                }
                self.units
                    .entry(key(token_id, to_account_id))
                    .or_default()
                    .extend(unit_ids.iter().copied());
                Ok(Vec::new())
            }
            LedgerTransaction::Associate {
                token_id,
                account_id,
                ..
            } => {
                if !self.associations.insert(key(account_id, token_id)) {
                    return Err(LedgerError::new(
                        "TOKEN_ALREADY_ASSOCIATED_TO_ACCOUNT",
                        "token already associated",
                    ));
                }
                Ok(Vec::new())
            }
            LedgerTransaction::Freeze {
                token_id,
                account_id,
                ..
            } => {
                self.frozen.insert(key(account_id, token_id));
                Ok(Vec::new())
            }
            LedgerTransaction::Unfreeze {
                token_id,
                account_id,
                ..
            } => {
                if !self.frozen.remove(&key(account_id, token_id)) {
                    return Err(LedgerError::new(
                        "ACCOUNT_NOT_FROZEN_FOR_TOKEN",
                        "account not frozen",
                    ));
                }
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn submit(&self, tx: LedgerTransaction) -> Result<LedgerReceipt, LedgerError> {
        let mut state = self.state.lock();
        state.submitted.push(tx.clone());

        if let Some(pos) = state.failures.iter().position(|(kind, _)| *kind == tx.kind()) {
            let (_, err) = state.failures.remove(pos);
            return Err(err);
        }
        if let Some(err) = state.broken.get(tx.kind()) {
            return Err(err.clone());
        }

        let issued = state.apply(&tx)?;
        state.next_tx += 1;
        Ok(LedgerReceipt {
            transaction_ref: format!("0.0.2@{}", state.next_tx),
            issued_unit_ids: issued,
        })
    }

    async fn account_balance(&self, account_id: &str, token_id: &str) -> Result<u64, LedgerError> {
        let mut state = self.state.lock();
        state.reads += 1;
        Ok(state
            .balances
            .get(&key(account_id, token_id))
            .copied()
            .unwrap_or(0))
    }

    async fn token_total_supply(&self, _token_id: &str) -> Result<u64, LedgerError> {
        let mut state = self.state.lock();
        state.reads += 1;
        Ok(state.total_supply)
    }

    async fn available_units(
        &self,
        token_id: &str,
        owner_account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<i64>, LedgerError> {
        let mut state = self.state.lock();
        state.reads += 1;
        let units = state
            .units
            .get(&key(token_id, owner_account_id))
            .map(|u| u.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(match limit {
            Some(limit) => units.into_iter().take(limit).collect(),
            None => units,
        })
    }
}

#[derive(Default)]
struct RepoState {
    accounts: Vec<LedgerAccount>,
    collateral: HashMap<String, CollateralRecord>,
    minted: HashMap<String, Vec<i64>>,
    settlements: Vec<PurchaseSettlement>,
    fail_settlement: bool,
    fail_reads: bool,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<RepoState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, user_id: &str, ledger_account_id: &str) {
        self.state.lock().accounts.push(LedgerAccount {
            user_id: user_id.to_string(),
            ledger_account_id: ledger_account_id.to_string(),
            key_ref: KeyRef::new(format!("kms://{}", user_id)),
            balance: Decimal::ZERO,
        });
    }

    pub fn add_collateral(&self, record: CollateralRecord) {
        self.state
            .lock()
            .collateral
            .insert(record.token_id.clone(), record);
    }

    pub fn fail_settlement(&self) {
        self.state.lock().fail_settlement = true;
    }

    pub fn fail_reads(&self) {
        self.state.lock().fail_reads = true;
    }

    pub fn settlements(&self) -> Vec<PurchaseSettlement> {
        self.state.lock().settlements.clone()
    }

    pub fn minted_units(&self, token_id: &str) -> Vec<i64> {
        self.state
            .lock()
            .minted
            .get(token_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn collateral(&self, token_id: &str) -> Option<CollateralRecord> {
        self.state.lock().collateral.get(token_id).cloned()
    }

    pub fn account(&self, ledger_account_id: &str) -> Option<LedgerAccount> {
        self.state
            .lock()
            .accounts
            .iter()
            .find(|a| a.ledger_account_id == ledger_account_id)
            .cloned()
    }
}

fn unavailable() -> RepositoryError {
    RepositoryError::Db(sea_orm::DbErr::Custom("database unavailable".to_string()))
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_account_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<LedgerAccount>, RepositoryError> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(unavailable());
        }
        Ok(state.accounts.iter().find(|a| a.user_id == user_id).cloned())
    }

    async fn find_account_by_ledger_id(
        &self,
        ledger_account_id: &str,
    ) -> Result<Option<LedgerAccount>, RepositoryError> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(unavailable());
        }
        Ok(state
            .accounts
            .iter()
            .find(|a| a.ledger_account_id == ledger_account_id)
            .cloned())
    }

    async fn find_collateral_by_token(
        &self,
        token_id: &str,
    ) -> Result<Option<CollateralRecord>, RepositoryError> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(unavailable());
        }
        Ok(state.collateral.get(token_id).cloned())
    }

    async fn collateral_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CollateralRecord>, RepositoryError> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(unavailable());
        }
        let mut found: Vec<CollateralRecord> = state
            .collateral
            .values()
            .filter(|c| c.expired_at.is_some_and(|t| t >= from && t < to))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.token_id.cmp(&b.token_id));
        Ok(found)
    }

    async fn record_minted_units(
        &self,
        token_id: &str,
        unit_ids: &[i64],
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        let Some(record) = state.collateral.get_mut(token_id) else {
            return Err(RepositoryError::NotFound(format!("Collateral {}", token_id)));
        };
        record.minted_units += unit_ids.len() as i64;
        state
            .minted
            .entry(token_id.to_string())
            .or_default()
            .extend_from_slice(unit_ids);
        Ok(())
    }

    async fn settle_purchase(&self, settlement: &PurchaseSettlement) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        if state.fail_settlement {
            return Err(unavailable());
        }
        if let Some(record) = state.collateral.get_mut(&settlement.collateral_token_id) {
            record.properties.sold_share += settlement.units_sold;
        }
        for update in &settlement.balances {
            if let Some(account) = state
                .accounts
                .iter_mut()
                .find(|a| a.ledger_account_id == update.ledger_account_id)
            {
                account.balance = update.balance;
            }
        }
        state.settlements.push(settlement.clone());
        Ok(())
    }
}

pub fn jewelry_collateral(token_id: &str, expired_at: Option<DateTime<Utc>>) -> CollateralRecord {
    CollateralRecord {
        collateral_id: format!("COL-{}", token_id),
        token_id: token_id.to_string(),
        name: "22K gold bangle".to_string(),
        beneficiary_account_id: BENEFICIARY_ACCOUNT.to_string(),
        unit_price: dec!(25),
        properties: CollateralProperties {
            asset: CollateralKind::Jewelry {
                karat: 22,
                weight_g: dec!(30.5),
                purity: dec!(0.916),
                cert_no: Some("CERT-001".to_string()),
            },
            valuation: dec!(2500),
            currency: "MYR".to_string(),
            mint_share: 100,
            sold_share: 0,
            tenor_months: Some(6),
            raw_extension: Map::new(),
        },
        minted_units: 20,
        status: "active".to_string(),
        expired_at,
    }
}

/// Investor with 1000.00 in payment tokens, a beneficiary holding units 1..=20
pub fn seeded() -> (FakeLedger, MemoryRepository) {
    let ledger = FakeLedger::new();
    ledger.set_balance(INVESTOR_ACCOUNT, PAYMENT_TOKEN, 100_000);
    ledger.set_total_supply(1_000_000);
    ledger.give_units(COLLATERAL_TOKEN, BENEFICIARY_ACCOUNT, 1..=20);

    let repository = MemoryRepository::new();
    repository.add_account(INVESTOR_USER, INVESTOR_ACCOUNT);
    repository.add_account(BENEFICIARY_USER, BENEFICIARY_ACCOUNT);
    repository.add_collateral(jewelry_collateral(COLLATERAL_TOKEN, None));

    (ledger, repository)
}

pub fn drain(rx: &mut broadcast::Receiver<UserEvent>) -> Vec<UserEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// `progress` of each event carrying one, in order
pub fn progress_values(events: &[UserEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| e.payload.get("progress").and_then(Value::as_u64))
        .collect()
}

pub fn event_names(events: &[UserEvent]) -> Vec<String> {
    events.iter().map(|e| e.event.clone()).collect()
}
