use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain request failed: {0}")]
    Request(String),
    #[error("chain request timed out")]
    Timeout,
    #[error("chain http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("chain response decode failed: {0}")]
    Decode(String),
}

impl ChainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Request(_) => "chain_request_failed",
            Self::Timeout => "chain_timeout",
            Self::Http { .. } => "chain_http_error",
            Self::Decode(_) => "chain_decode_failed",
        }
    }
}

/// One denomination of a bank balance, amount still in fixed-point form.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DenomAmount {
    pub denom: String,
    pub amount: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirstTransaction {
    At(DateTime<Utc>),
    /// The sender has never transacted.
    NoHistory,
    /// A transaction exists but carries no timestamp.
    TimestampMissing,
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    async fn get_balances(&self, address: &str) -> Result<Vec<DenomAmount>, ChainError>;

    async fn get_first_transaction(&self, address: &str) -> Result<FirstTransaction, ChainError>;
}

/// Cosmos SDK LCD (REST) gateway.
#[derive(Clone, Debug)]
pub struct LcdChainGateway {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct BalancesResponse {
    #[serde(default)]
    balances: Vec<DenomAmount>,
}

#[derive(Debug, Deserialize)]
struct TxSearchResponse {
    #[serde(default)]
    txs: Vec<Value>,
    #[serde(default)]
    tx_responses: Vec<Value>,
}

impl LcdChainGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            timeout,
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn balances_path(address: &str) -> String {
        format!("/cosmos/bank/v1beta1/balances/{address}")
    }

    async fn get_json<T>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ChainError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(url.as_str())
            .query(query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(ChainError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }
        serde_json::from_slice::<T>(&bytes).map_err(|error| ChainError::Decode(error.to_string()))
    }
}

#[async_trait]
impl ChainGateway for LcdChainGateway {
    async fn get_balances(&self, address: &str) -> Result<Vec<DenomAmount>, ChainError> {
        let response: BalancesResponse = self
            .get_json(Self::balances_path(address).as_str(), &[])
            .await?;
        Ok(response.balances)
    }

    async fn get_first_transaction(&self, address: &str) -> Result<FirstTransaction, ChainError> {
        let response: TxSearchResponse = self
            .get_json(
                "/cosmos/tx/v1beta1/txs",
                &[
                    ("events", format!("message.sender='{address}'")),
                    ("order_by", "ORDER_BY_ASC".to_string()),
                    ("pagination.limit", "1".to_string()),
                ],
            )
            .await?;
        first_transaction_from(&response)
    }
}

fn first_transaction_from(response: &TxSearchResponse) -> Result<FirstTransaction, ChainError> {
    if response.txs.is_empty() && response.tx_responses.is_empty() {
        return Ok(FirstTransaction::NoHistory);
    }
    let timestamp = response
        .tx_responses
        .first()
        .or_else(|| response.txs.first())
        .and_then(|tx| tx.get("timestamp"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let Some(timestamp) = timestamp else {
        return Ok(FirstTransaction::TimestampMissing);
    };
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| FirstTransaction::At(parsed.with_timezone(&Utc)))
        .map_err(|error| ChainError::Decode(format!("timestamp {timestamp}: {error}")))
}

fn map_reqwest_error(error: reqwest::Error) -> ChainError {
    if error.is_timeout() {
        ChainError::Timeout
    } else {
        ChainError::Request(error.to_string())
    }
}
