//! Persistence seam for collateral records, ledger accounts and the payment
//! token, plus its Postgres implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::entities::{collateral_records, ledger_accounts, payment_tokens};
use crate::error::EngineError;
use crate::models::collateral::{CollateralProperties, CollateralRecord, LedgerAccount};
use crate::models::ledger::KeyRef;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Db(#[from] DbErr),

    #[error("Corrupt record {id}: {message}")]
    Decode { id: String, message: String },

    #[error("{0} not found")]
    NotFound(String),
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => EngineError::NotFound(what),
            other => EngineError::Repository(other.to_string()),
        }
    }
}

/// Balance of one account re-read from the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalanceUpdate {
    pub ledger_account_id: String,
    /// Major units
    pub balance: Decimal,
}

/// Everything persisted after a purchase delivered units, written atomically
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseSettlement {
    pub collateral_token_id: String,
    pub units_sold: i64,
    pub payment_token_id: String,
    pub payment_token_decimals: u32,
    /// Major units
    pub payment_token_supply: Decimal,
    pub balances: Vec<AccountBalanceUpdate>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_account_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<LedgerAccount>, RepositoryError>;

    async fn find_account_by_ledger_id(
        &self,
        ledger_account_id: &str,
    ) -> Result<Option<LedgerAccount>, RepositoryError>;

    async fn find_collateral_by_token(
        &self,
        token_id: &str,
    ) -> Result<Option<CollateralRecord>, RepositoryError>;

    /// Collateral whose expiry falls in `[from, to)`
    async fn collateral_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CollateralRecord>, RepositoryError>;

    async fn record_minted_units(
        &self,
        token_id: &str,
        unit_ids: &[i64],
    ) -> Result<(), RepositoryError>;

    /// Bump the sold-share counter and store ledger balances in one transaction
    async fn settle_purchase(&self, settlement: &PurchaseSettlement) -> Result<(), RepositoryError>;
}

fn to_collateral(model: collateral_records::Model) -> Result<CollateralRecord, RepositoryError> {
    let properties: CollateralProperties =
        serde_json::from_value(model.properties).map_err(|e| RepositoryError::Decode {
            id: model.collateral_id.clone(),
            message: e.to_string(),
        })?;

    Ok(CollateralRecord {
        collateral_id: model.collateral_id,
        token_id: model.token_id,
        name: model.name,
        beneficiary_account_id: model.beneficiary_account_id,
        unit_price: model.unit_price,
        properties,
        minted_units: model.minted_units,
        status: model.status,
        expired_at: model.expired_at.map(|t| t.with_timezone(&Utc)),
    })
}

fn to_account(model: ledger_accounts::Model) -> LedgerAccount {
    LedgerAccount {
        user_id: model.user_id,
        ledger_account_id: model.ledger_account_id,
        key_ref: KeyRef::new(model.key_ref),
        balance: model.balance,
    }
}

#[derive(Clone)]
pub struct SeaOrmRepository {
    db: DatabaseConnection,
}

impl SeaOrmRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Repository for SeaOrmRepository {
    async fn find_account_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<LedgerAccount>, RepositoryError> {
        let model = ledger_accounts::Entity::find()
            .filter(ledger_accounts::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?;
        Ok(model.map(to_account))
    }

    async fn find_account_by_ledger_id(
        &self,
        ledger_account_id: &str,
    ) -> Result<Option<LedgerAccount>, RepositoryError> {
        let model = ledger_accounts::Entity::find()
            .filter(ledger_accounts::Column::LedgerAccountId.eq(ledger_account_id))
            .one(&self.db)
            .await?;
        Ok(model.map(to_account))
    }

    async fn find_collateral_by_token(
        &self,
        token_id: &str,
    ) -> Result<Option<CollateralRecord>, RepositoryError> {
        collateral_records::Entity::find()
            .filter(collateral_records::Column::TokenId.eq(token_id))
            .one(&self.db)
            .await?
            .map(to_collateral)
            .transpose()
    }

    async fn collateral_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CollateralRecord>, RepositoryError> {
        collateral_records::Entity::find()
            .filter(collateral_records::Column::ExpiredAt.gte(from))
            .filter(collateral_records::Column::ExpiredAt.lt(to))
            .order_by_asc(collateral_records::Column::ExpiredAt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(to_collateral)
            .collect()
    }

    async fn record_minted_units(
        &self,
        token_id: &str,
        unit_ids: &[i64],
    ) -> Result<(), RepositoryError> {
        let model = collateral_records::Entity::find()
            .filter(collateral_records::Column::TokenId.eq(token_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("Collateral {}", token_id)))?;

        let minted = model.minted_units + unit_ids.len() as i64;
        let mut active: collateral_records::ActiveModel = model.into();
        active.minted_units = Set(minted);
        active.updated_at = Set(Utc::now().into());
        active.update(&self.db).await?;

        debug!(token_id = %token_id, added = unit_ids.len(), minted, "Recorded minted units");
        Ok(())
    }

    async fn settle_purchase(&self, settlement: &PurchaseSettlement) -> Result<(), RepositoryError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();

        // Row lock serialises concurrent purchases of the same collateral
        let model = collateral_records::Entity::find()
            .filter(collateral_records::Column::TokenId.eq(&settlement.collateral_token_id))
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!("Collateral {}", settlement.collateral_token_id))
            })?;

        let collateral_id = model.collateral_id.clone();
        let mut properties = model.properties.clone();
        let sold = properties
            .get("sold_share")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + settlement.units_sold;
        if let Some(object) = properties.as_object_mut() {
            object.insert("sold_share".to_string(), sold.into());
        }

        let mut active: collateral_records::ActiveModel = model.into();
        active.properties = Set(properties);
        active.updated_at = Set(now.into());
        active.update(&txn).await?;

        let token = payment_tokens::ActiveModel {
            token_id: Set(settlement.payment_token_id.clone()),
            total_supply: Set(settlement.payment_token_supply),
            decimals: Set(settlement.payment_token_decimals as i32),
            updated_at: Set(now.into()),
        };
        payment_tokens::Entity::insert(token)
            .on_conflict(
                OnConflict::column(payment_tokens::Column::TokenId)
                    .update_columns([
                        payment_tokens::Column::TotalSupply,
                        payment_tokens::Column::Decimals,
                        payment_tokens::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&txn)
            .await?;

        for update in &settlement.balances {
            ledger_accounts::Entity::update_many()
                .col_expr(ledger_accounts::Column::Balance, Expr::value(update.balance))
                .col_expr(
                    ledger_accounts::Column::UpdatedAt,
                    Expr::value(now.fixed_offset()),
                )
                .filter(ledger_accounts::Column::LedgerAccountId.eq(&update.ledger_account_id))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        info!(
            collateral_id = %collateral_id,
            token_id = %settlement.collateral_token_id,
            units_sold = settlement.units_sold,
            sold_share = sold,
            "Purchase settled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn model(properties: serde_json::Value) -> collateral_records::Model {
        let now = Utc::now().fixed_offset();
        collateral_records::Model {
            collateral_id: "sag-1".to_string(),
            token_id: "0.0.5005".to_string(),
            name: "22K bangle".to_string(),
            beneficiary_account_id: "0.0.9000".to_string(),
            unit_price: dec!(42),
            properties,
            minted_units: 100,
            status: "active".to_string(),
            expired_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_to_collateral_decodes_properties() {
        let record = to_collateral(model(json!({
            "asset": { "asset_type": "gold_bar", "weight_g": "50", "purity": "0.999" },
            "valuation": "19000",
            "mint_share": 100,
            "sold_share": 10
        })))
        .unwrap();

        assert_eq!(record.properties.remaining_share(), 90);
        assert!(record.expired_at.is_some());
    }

    #[test]
    fn test_to_collateral_reports_corrupt_properties() {
        let err = to_collateral(model(json!({ "valuation": "19000" }))).unwrap_err();
        assert!(matches!(err, RepositoryError::Decode { ref id, .. } if id == "sag-1"));
    }

    #[test]
    fn test_not_found_maps_to_engine_not_found() {
        let err: EngineError = RepositoryError::NotFound("Collateral 0.0.1".to_string()).into();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
