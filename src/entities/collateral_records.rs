//! SeaORM Entity for collateral_records table

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "collateral_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub collateral_id: String,
    #[sea_orm(unique)]
    pub token_id: String,
    pub name: String,
    pub beneficiary_account_id: String,
    #[sea_orm(column_type = "Decimal(Some((20, 8)))")]
    pub unit_price: Decimal,
    pub properties: Json,
    pub minted_units: i64,
    pub status: String,
    pub expired_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
