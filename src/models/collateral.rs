//! Collateral (pledged jewelry) records and their metadata
//!
//! Collateral properties arrive from several intake forms that do not agree on
//! a schema. Known shapes are modelled as `CollateralKind`; anything else is
//! kept in `raw_extension` so records round-trip without loss.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Physical asset backing a collateral token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "asset_type", rename_all = "snake_case")]
pub enum CollateralKind {
    Jewelry {
        karat: u32,
        weight_g: Decimal,
        purity: Decimal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cert_no: Option<String>,
    },
    GoldBar {
        weight_g: Decimal,
        purity: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollateralProperties {
    pub asset: CollateralKind,
    pub valuation: Decimal,
    #[serde(default)]
    pub currency: String,
    /// Units offered to investors
    #[serde(default)]
    pub mint_share: i64,
    /// Units already sold to investors
    #[serde(default)]
    pub sold_share: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenor_months: Option<u32>,
    /// Fields not covered above, preserved verbatim
    #[serde(flatten)]
    pub raw_extension: Map<String, Value>,
}

impl CollateralProperties {
    pub fn remaining_share(&self) -> i64 {
        (self.mint_share - self.sold_share).max(0)
    }
}

/// Collateral record as stored by the repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollateralRecord {
    pub collateral_id: String,
    pub token_id: String,
    pub name: String,
    /// Treasury account holding unsold units and receiving payments
    pub beneficiary_account_id: String,
    /// Price of one unit in payment-currency major units
    pub unit_price: Decimal,
    pub properties: CollateralProperties,
    pub minted_units: i64,
    pub status: String,
    pub expired_at: Option<DateTime<Utc>>,
}

/// Ledger account owned by a platform user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub user_id: String,
    pub ledger_account_id: String,
    pub key_ref: crate::models::ledger::KeyRef,
    /// Last persisted payment-currency balance (major units)
    pub balance: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_properties_round_trip_unknown_fields() {
        let raw = json!({
            "asset": {
                "asset_type": "jewelry",
                "karat": 22,
                "weight_g": "12.5",
                "purity": "0.916"
            },
            "valuation": "4200",
            "currency": "MYR",
            "mint_share": 100,
            "sold_share": 40,
            "risk_level": "low",
            "ltv": 0.65
        });

        let props: CollateralProperties = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(props.asset, CollateralKind::Jewelry { karat: 22, .. }));
        assert_eq!(props.valuation, dec!(4200));
        assert_eq!(props.remaining_share(), 60);
        assert_eq!(props.raw_extension.get("risk_level"), Some(&json!("low")));

        let back = serde_json::to_value(&props).unwrap();
        assert_eq!(back["risk_level"], "low");
        assert_eq!(back["ltv"], 0.65);
        assert_eq!(back["asset"]["asset_type"], "jewelry");
        assert!(back.get("asset_type").is_none());
    }

    #[test]
    fn test_gold_bar_variant() {
        let props: CollateralProperties = serde_json::from_value(json!({
            "asset": { "asset_type": "gold_bar", "weight_g": "100", "purity": "0.999" },
            "valuation": "38000"
        }))
        .unwrap();
        assert!(matches!(props.asset, CollateralKind::GoldBar { .. }));
        assert_eq!(props.sold_share, 0);
        assert!(props.raw_extension.is_empty());
    }
}
