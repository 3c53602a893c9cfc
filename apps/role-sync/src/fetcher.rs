use std::sync::Arc;
use std::time::Duration;

use crate::chain::{ChainGateway, DenomAmount};
use crate::types::MICRO_UNITS_PER_UNIT;

/// Outcome of one balance lookup. `Failed` keeps the reason so callers can
/// tell an empty wallet from an unreachable gateway.
#[derive(Clone, Debug, PartialEq)]
pub enum BalanceFetch {
    Fetched(f64),
    Failed(String),
}

impl BalanceFetch {
    #[must_use]
    pub fn balance_or_zero(&self) -> f64 {
        match self {
            Self::Fetched(balance) => *balance,
            Self::Failed(_) => 0.0,
        }
    }
}

#[derive(Clone)]
pub struct BalanceFetcher {
    gateway: Arc<dyn ChainGateway>,
    timeout: Duration,
}

impl BalanceFetcher {
    pub fn new(gateway: Arc<dyn ChainGateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    /// Total balance in whole units; any failure reads as zero.
    pub async fn fetch(&self, wallet_address: &str) -> f64 {
        self.fetch_detailed(wallet_address).await.balance_or_zero()
    }

    pub async fn fetch_detailed(&self, wallet_address: &str) -> BalanceFetch {
        let lookup = tokio::time::timeout(self.timeout, self.gateway.get_balances(wallet_address));
        let balances = match lookup.await {
            Ok(Ok(balances)) => balances,
            Ok(Err(error)) => {
                tracing::warn!(
                    wallet = %wallet_address,
                    code = error.code(),
                    reason = %error,
                    "balance lookup failed"
                );
                return BalanceFetch::Failed(error.to_string());
            }
            Err(_) => {
                tracing::warn!(
                    wallet = %wallet_address,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "balance lookup timed out"
                );
                return BalanceFetch::Failed("timeout".to_string());
            }
        };

        match total_balance(&balances) {
            Ok(total) => BalanceFetch::Fetched(total),
            Err(reason) => {
                tracing::warn!(wallet = %wallet_address, reason = %reason, "balance decode failed");
                BalanceFetch::Failed(reason)
            }
        }
    }
}

/// Sums every denomination, converting fixed-point amounts to whole units.
pub fn total_balance(balances: &[DenomAmount]) -> Result<f64, String> {
    let mut total = 0.0;
    for balance in balances {
        let raw = balance
            .amount
            .trim()
            .parse::<f64>()
            .map_err(|error| format!("amount {:?} for {}: {error}", balance.amount, balance.denom))?;
        if !raw.is_finite() {
            return Err(format!("amount for {} is not finite", balance.denom));
        }
        total += raw / MICRO_UNITS_PER_UNIT;
    }
    Ok(total.max(0.0))
}
