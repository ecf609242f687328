//! Ledger transaction and receipt types exchanged with the ledger client

use serde::{Deserialize, Serialize};

/// Reference to a signing key held by the key custody layer.
///
/// The engine never sees key material; the ledger client resolves the
/// reference when it signs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyRef(pub String);

impl KeyRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key references are logged, never the key itself
        write!(f, "{}", self.0)
    }
}

/// Signed transaction submitted to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerTransaction {
    /// Issue `count` new units of a non-fungible collateral token
    MintUnits {
        token_id: String,
        count: usize,
        /// One metadata entry per unit (empty when no metadata)
        metadata: Vec<String>,
        supply_key: KeyRef,
    },
    /// Move fungible payment-currency units between accounts
    TransferFungible {
        token_id: String,
        from_account_id: String,
        to_account_id: String,
        /// Amount in minor units
        amount: u64,
        signer: KeyRef,
    },
    /// Move specific units of a collateral token between accounts
    TransferUnits {
        token_id: String,
        unit_ids: Vec<i64>,
        from_account_id: String,
        to_account_id: String,
        signers: Vec<KeyRef>,
    },
    Associate {
        token_id: String,
        account_id: String,
        signer: KeyRef,
    },
    Freeze {
        token_id: String,
        account_id: String,
        freeze_key: KeyRef,
    },
    Unfreeze {
        token_id: String,
        account_id: String,
        freeze_key: KeyRef,
    },
}

impl LedgerTransaction {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerTransaction::MintUnits { .. } => "mint_units",
            LedgerTransaction::TransferFungible { .. } => "transfer_fungible",
            LedgerTransaction::TransferUnits { .. } => "transfer_units",
            LedgerTransaction::Associate { .. } => "associate",
            LedgerTransaction::Freeze { .. } => "freeze",
            LedgerTransaction::Unfreeze { .. } => "unfreeze",
        }
    }

    pub fn token_id(&self) -> &str {
        match self {
            LedgerTransaction::MintUnits { token_id, .. }
            | LedgerTransaction::TransferFungible { token_id, .. }
            | LedgerTransaction::TransferUnits { token_id, .. }
            | LedgerTransaction::Associate { token_id, .. }
            | LedgerTransaction::Freeze { token_id, .. }
            | LedgerTransaction::Unfreeze { token_id, .. } => token_id,
        }
    }
}

/// Receipt for a transaction the ledger reached consensus on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub transaction_ref: String,
    /// Serial numbers issued by a mint (empty for other transactions)
    #[serde(default)]
    pub issued_unit_ids: Vec<i64>,
}

impl LedgerReceipt {
    pub fn new(transaction_ref: impl Into<String>) -> Self {
        Self {
            transaction_ref: transaction_ref.into(),
            issued_unit_ids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_wire_format() {
        let tx = LedgerTransaction::Freeze {
            token_id: "0.0.5005".to_string(),
            account_id: "0.0.7007".to_string(),
            freeze_key: KeyRef::new("kms://pawnshop"),
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "freeze");
        assert_eq!(json["freeze_key"], "kms://pawnshop");
        assert_eq!(tx.kind(), "freeze");
        assert_eq!(tx.token_id(), "0.0.5005");
    }

    #[test]
    fn test_receipt_defaults_issued_units() {
        let receipt: LedgerReceipt =
            serde_json::from_str(r#"{"transaction_ref":"0.0.2@1700000000.1"}"#).unwrap();
        assert!(receipt.issued_unit_ids.is_empty());
    }
}
