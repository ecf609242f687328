//! Ledger client seam and the HTTP gateway implementation used by the binary
//!
//! The gateway holds the signing keys; transactions carry key references and
//! the gateway signs, submits, and waits for the receipt.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::LedgerError;
use crate::models::ledger::{LedgerReceipt, LedgerTransaction};

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a signed transaction and wait for its receipt
    async fn submit(&self, tx: LedgerTransaction) -> Result<LedgerReceipt, LedgerError>;

    /// Balance of `token_id` held by `account_id`, in minor units
    async fn account_balance(&self, account_id: &str, token_id: &str) -> Result<u64, LedgerError>;

    async fn token_total_supply(&self, token_id: &str) -> Result<u64, LedgerError>;

    /// Non-deleted units of `token_id` held by `owner_account_id`, ascending by id
    async fn available_units(
        &self,
        token_id: &str,
        owner_account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<i64>, LedgerError>;
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: u64,
}

#[derive(Debug, Deserialize)]
struct TokenInfoResponse {
    total_supply: u64,
}

#[derive(Debug, Deserialize)]
struct UnitsResponse {
    units: Vec<UnitEntry>,
}

#[derive(Debug, Deserialize)]
struct UnitEntry {
    serial_number: i64,
    #[serde(default)]
    deleted: bool,
}

/// JSON client for the ledger gateway
#[derive(Clone)]
pub struct GatewayLedgerClient {
    client: Client,
    base_url: String,
}

impl GatewayLedgerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LedgerError::new("CLIENT_INIT", e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, LedgerError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| LedgerError::new("INVALID_RESPONSE", e.to_string()));
        }

        let text = response.text().await.unwrap_or_default();
        Err(error_from_status(status, &text))
    }
}

/// Map a gateway failure onto a ledger error; congestion statuses become the
/// ledger's own transient codes so the retry policy treats them alike
fn error_from_status(status: StatusCode, body: &str) -> LedgerError {
    if let Ok(parsed) = serde_json::from_str::<GatewayErrorBody>(body) {
        return LedgerError::new(parsed.code, parsed.message);
    }

    let code = match status {
        StatusCode::TOO_MANY_REQUESTS => "RATE_LIMIT",
        StatusCode::SERVICE_UNAVAILABLE => "BUSY",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        _ => "GATEWAY_ERROR",
    };
    LedgerError::new(code, format!("gateway returned {}: {}", status, body))
}

fn transport_error(e: reqwest::Error) -> LedgerError {
    if e.is_timeout() || e.is_connect() {
        LedgerError::new("BUSY", format!("gateway unreachable: {}", e))
    } else {
        LedgerError::new("GATEWAY_ERROR", e.to_string())
    }
}

#[async_trait]
impl LedgerClient for GatewayLedgerClient {
    async fn submit(&self, tx: LedgerTransaction) -> Result<LedgerReceipt, LedgerError> {
        debug!(kind = tx.kind(), token_id = %tx.token_id(), "Submitting ledger transaction");

        let response = self
            .client
            .post(format!("{}/transactions", self.base_url))
            .json(&tx)
            .send()
            .await
            .map_err(transport_error)?;

        Self::read_json(response).await
    }

    async fn account_balance(&self, account_id: &str, token_id: &str) -> Result<u64, LedgerError> {
        let response = self
            .client
            .get(format!(
                "{}/accounts/{}/balances/{}",
                self.base_url, account_id, token_id
            ))
            .send()
            .await
            .map_err(transport_error)?;

        let body: BalanceResponse = Self::read_json(response).await?;
        Ok(body.balance)
    }

    async fn token_total_supply(&self, token_id: &str) -> Result<u64, LedgerError> {
        let response = self
            .client
            .get(format!("{}/tokens/{}", self.base_url, token_id))
            .send()
            .await
            .map_err(transport_error)?;

        let body: TokenInfoResponse = Self::read_json(response).await?;
        Ok(body.total_supply)
    }

    async fn available_units(
        &self,
        token_id: &str,
        owner_account_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<i64>, LedgerError> {
        let mut query = vec![
            ("owner", owner_account_id.to_string()),
            ("order", "asc".to_string()),
        ];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/tokens/{}/units", self.base_url, token_id))
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;

        let body: UnitsResponse = Self::read_json(response).await?;
        let mut units: Vec<i64> = body
            .units
            .into_iter()
            .filter(|u| !u.deleted)
            .map(|u| u.serial_number)
            .collect();
        units.sort_unstable();
        if let Some(limit) = limit {
            units.truncate(limit);
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::retry_policy::{classify, ErrorClass};

    #[test]
    fn test_gateway_error_body_is_passed_through() {
        let err = error_from_status(
            StatusCode::BAD_REQUEST,
            r#"{"code":"INSUFFICIENT_TOKEN_BALANCE","message":"not enough"}"#,
        );
        assert_eq!(err.code, "INSUFFICIENT_TOKEN_BALANCE");
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn test_congestion_statuses_are_transient() {
        let throttled = error_from_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(classify(&throttled), ErrorClass::Transient);

        let busy = error_from_status(StatusCode::SERVICE_UNAVAILABLE, "");
        assert_eq!(busy.code, "BUSY");
        assert_eq!(classify(&busy), ErrorClass::Transient);
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let client = GatewayLedgerClient::new("http://gateway:8080/").unwrap();
        assert_eq!(client.base_url, "http://gateway:8080");
    }
}
