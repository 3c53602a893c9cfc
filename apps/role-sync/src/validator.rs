//! Anti-gaming gate consulted before any role grant.
//!
//! Two independent heuristics run per validation: wallet age from the first
//! on-chain transaction, and short-window balance volatility from recorded
//! history. A check that cannot run is fail-open. A check that runs and finds
//! a violation blocks. The one exception is a wallet with no transaction
//! history at all, which blocks outright.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::chain::{ChainError, ChainGateway, FirstTransaction};
use crate::config::{ConfigError, ValidatorConfig};
use crate::store::BalanceHistoryStore;
use crate::types::{CheckDetail, CheckDetails};

pub const WALLET_AGE_CHECK: &str = "wallet_age";
pub const BALANCE_VOLATILITY_CHECK: &str = "balance_volatility";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed(String),
    /// The check could not run; treated as passing.
    VerificationUnavailable(String),
    VerificationFailed(String),
}

impl CheckOutcome {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::VerificationFailed(_))
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Passed(reason)
            | Self::VerificationUnavailable(reason)
            | Self::VerificationFailed(reason) => reason,
        }
    }

    fn detail(&self) -> CheckDetail {
        CheckDetail {
            valid: self.is_valid(),
            reason: self.reason().to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub blocked_reasons: Vec<String>,
    pub checks: CheckDetails,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn allowed_with_warning(warning: String) -> Self {
        Self {
            valid: true,
            blocked_reasons: Vec::new(),
            checks: CheckDetails::new(),
            warnings: vec![warning],
        }
    }
}

/// Partial update for the live thresholds. Absent fields keep their value.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ValidatorConfigPatch {
    pub min_wallet_age_days: Option<i64>,
    pub max_volatility_threshold: Option<f64>,
    pub volatility_window_minutes: Option<i64>,
}

pub struct AntiGamingValidator {
    chain: Arc<dyn ChainGateway>,
    history: Arc<dyn BalanceHistoryStore>,
    config: RwLock<ValidatorConfig>,
}

impl AntiGamingValidator {
    pub fn new(
        chain: Arc<dyn ChainGateway>,
        history: Arc<dyn BalanceHistoryStore>,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            chain,
            history,
            config: RwLock::new(config),
        }
    }

    pub async fn configuration(&self) -> ValidatorConfig {
        self.config.read().await.clone()
    }

    pub async fn update_configuration(
        &self,
        patch: ValidatorConfigPatch,
    ) -> Result<ValidatorConfig, ConfigError> {
        let mut config = self.config.write().await;
        let mut next = config.clone();
        if let Some(days) = patch.min_wallet_age_days {
            if days < 0 {
                return Err(ConfigError::InvalidValidatorConfig(format!(
                    "min_wallet_age_days must be >= 0, got {days}"
                )));
            }
            next.min_wallet_age_days = days;
        }
        if let Some(threshold) = patch.max_volatility_threshold {
            if !threshold.is_finite() || threshold <= 0.0 {
                return Err(ConfigError::InvalidValidatorConfig(format!(
                    "max_volatility_threshold must be > 0, got {threshold}"
                )));
            }
            next.max_volatility_threshold = threshold;
        }
        if let Some(minutes) = patch.volatility_window_minutes {
            if minutes < 1 {
                return Err(ConfigError::InvalidValidatorConfig(format!(
                    "volatility_window_minutes must be >= 1, got {minutes}"
                )));
            }
            next.volatility_window_minutes = minutes;
        }
        *config = next.clone();
        tracing::info!(
            min_wallet_age_days = next.min_wallet_age_days,
            max_volatility_threshold = next.max_volatility_threshold,
            volatility_window_minutes = next.volatility_window_minutes,
            "validator configuration updated"
        );
        Ok(next)
    }

    pub async fn check_wallet_age(&self, wallet_address: &str) -> CheckOutcome {
        let min_days = self.config.read().await.min_wallet_age_days;
        match self.chain.get_first_transaction(wallet_address).await {
            Ok(FirstTransaction::At(first_seen)) => {
                let days = (Utc::now() - first_seen).num_days();
                if days < min_days {
                    CheckOutcome::VerificationFailed(format!(
                        "Wallet too new: {days} days old (minimum: {min_days} days)"
                    ))
                } else {
                    CheckOutcome::Passed(format!("Wallet age verified: {days} days old"))
                }
            }
            Ok(FirstTransaction::NoHistory) => CheckOutcome::VerificationFailed(
                "No transaction history found - wallet appears to be new or inactive".to_string(),
            ),
            Ok(FirstTransaction::TimestampMissing) => CheckOutcome::VerificationUnavailable(
                "Timestamp unavailable - allowed".to_string(),
            ),
            Err(ChainError::Http { status, .. }) => {
                tracing::warn!(wallet = %wallet_address, status, "wallet age lookup unavailable");
                CheckOutcome::VerificationUnavailable(
                    "Age verification unavailable - allowed".to_string(),
                )
            }
            Err(error) => {
                tracing::warn!(wallet = %wallet_address, reason = %error, "wallet age lookup failed");
                CheckOutcome::VerificationUnavailable(format!(
                    "Age check failed - allowed due to error: {error}"
                ))
            }
        }
    }

    pub async fn check_balance_volatility(
        &self,
        wallet_address: &str,
        current_balance: f64,
    ) -> CheckOutcome {
        let config = self.configuration().await;
        let since = Utc::now() - Duration::minutes(config.volatility_window_minutes);
        let records = match self.history.query(wallet_address, since).await {
            Ok(records) => records,
            Err(error) => {
                tracing::warn!(
                    wallet = %wallet_address,
                    reason = %error,
                    "balance history query failed"
                );
                return CheckOutcome::VerificationUnavailable(format!(
                    "Volatility check failed - allowed due to error: {error}"
                ));
            }
        };
        if records.len() < 2 {
            return CheckOutcome::VerificationUnavailable(
                "Insufficient balance history for volatility check".to_string(),
            );
        }

        let mut balances = records
            .iter()
            .map(|record| record.balance)
            .collect::<Vec<_>>();
        balances.push(current_balance);
        volatility_verdict(&balances, &config)
    }

    /// Runs both checks; neither short-circuits the other.
    pub async fn validate_for_role_assignment(
        &self,
        wallet_address: &str,
        current_balance: f64,
    ) -> ValidationResult {
        let checks = async {
            tokio::join!(
                self.check_wallet_age(wallet_address),
                self.check_balance_volatility(wallet_address, current_balance),
            )
        };
        let (age, volatility) = match AssertUnwindSafe(checks).catch_unwind().await {
            Ok(outcomes) => outcomes,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|message| (*message).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(wallet = %wallet_address, reason = %message, "validation aborted");
                return ValidationResult::allowed_with_warning(format!(
                    "Validation error: {message}"
                ));
            }
        };

        let mut result = ValidationResult {
            valid: true,
            blocked_reasons: Vec::new(),
            checks: CheckDetails::new(),
            warnings: Vec::new(),
        };
        for (key, label, outcome) in [
            (WALLET_AGE_CHECK, "Wallet Age", age),
            (BALANCE_VOLATILITY_CHECK, "Balance Volatility", volatility),
        ] {
            match &outcome {
                CheckOutcome::Passed(_) => {}
                CheckOutcome::VerificationUnavailable(reason) => {
                    result.warnings.push(format!("{label}: {reason}"));
                }
                CheckOutcome::VerificationFailed(reason) => {
                    result.valid = false;
                    result.blocked_reasons.push(format!("{label}: {reason}"));
                }
            }
            result.checks.insert(key.to_string(), outcome.detail());
        }

        if !result.valid {
            tracing::warn!(
                wallet = %wallet_address,
                balance = current_balance,
                reasons = ?result.blocked_reasons,
                "role assignment blocked"
            );
        }
        result
    }
}

/// Judges a chronological balance series against the volatility thresholds.
pub fn volatility_verdict(balances: &[f64], config: &ValidatorConfig) -> CheckOutcome {
    if balances.len() < 3 {
        return CheckOutcome::VerificationUnavailable(
            "Insufficient data points for volatility calculation".to_string(),
        );
    }

    // Pairs starting from zero have no defined percentage change.
    let changes = balances
        .windows(2)
        .filter(|pair| pair[0] > 0.0)
        .map(|pair| (pair[1] - pair[0]).abs() / pair[0])
        .collect::<Vec<_>>();
    if changes.is_empty() {
        return CheckOutcome::VerificationUnavailable(
            "No valid balance changes to analyze".to_string(),
        );
    }

    let max_change = changes.iter().copied().fold(0.0_f64, f64::max);
    let avg_change = changes.iter().sum::<f64>() / changes.len() as f64;
    let max_allowed = config.max_volatility_threshold;
    let avg_allowed = config.average_volatility_threshold();

    if max_change > max_allowed {
        return CheckOutcome::VerificationFailed(format!(
            "Extreme balance volatility detected: {} change in {} minutes (max allowed: {})",
            percent(max_change),
            config.volatility_window_minutes,
            percent(max_allowed)
        ));
    }
    if avg_change > avg_allowed {
        return CheckOutcome::VerificationFailed(format!(
            "High average volatility: {} average change (threshold: {})",
            percent(avg_change),
            percent(avg_allowed)
        ));
    }
    CheckOutcome::Passed(format!(
        "Balance volatility acceptable: max {}, avg {}",
        percent(max_change),
        percent(avg_change)
    ))
}

fn percent(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::chain::DenomAmount;
    use crate::store::{MemoryRoleSyncStore, StoreError};
    use crate::types::{BalanceRecord, WalletLink};

    enum AgeBehavior {
        FirstSeenDaysAgo(i64),
        NoHistory,
        TimestampMissing,
        Http(u16),
        Unreachable,
        Panic,
    }

    struct FakeChain(AgeBehavior);

    #[async_trait]
    impl ChainGateway for FakeChain {
        async fn get_balances(&self, _address: &str) -> Result<Vec<DenomAmount>, ChainError> {
            Ok(Vec::new())
        }

        async fn get_first_transaction(
            &self,
            _address: &str,
        ) -> Result<FirstTransaction, ChainError> {
            match self.0 {
                AgeBehavior::FirstSeenDaysAgo(days) => {
                    Ok(FirstTransaction::At(Utc::now() - Duration::days(days)))
                }
                AgeBehavior::NoHistory => Ok(FirstTransaction::NoHistory),
                AgeBehavior::TimestampMissing => Ok(FirstTransaction::TimestampMissing),
                AgeBehavior::Http(status) => Err(ChainError::Http {
                    status,
                    body: "internal".to_string(),
                }),
                AgeBehavior::Unreachable => Err(ChainError::Request("connection refused".into())),
                AgeBehavior::Panic => panic!("gateway exploded"),
            }
        }
    }

    struct BrokenHistory;

    #[async_trait]
    impl BalanceHistoryStore for BrokenHistory {
        async fn append_sample(
            &self,
            _user_id: &str,
            _record: BalanceRecord,
        ) -> Result<(), StoreError> {
            Err(StoreError::Db("offline".to_string()))
        }

        async fn query(
            &self,
            _wallet_address: &str,
            _since: chrono::DateTime<Utc>,
        ) -> Result<Vec<BalanceRecord>, StoreError> {
            Err(StoreError::Db("offline".to_string()))
        }
    }

    const WALLET: &str = "osmo1wallet";

    async fn history_with(balances: &[f64]) -> Arc<MemoryRoleSyncStore> {
        let store = Arc::new(MemoryRoleSyncStore::default());
        store
            .upsert_link(WalletLink {
                user_id: "u1".to_string(),
                account_id: Some("100".to_string()),
                wallet_address: Some(WALLET.to_string()),
                last_known_balance: 0.0,
                last_check_at: None,
            })
            .await;
        let start = Utc::now() - Duration::minutes(5);
        for (index, balance) in balances.iter().enumerate() {
            store
                .append_sample(
                    "u1",
                    BalanceRecord {
                        wallet_address: WALLET.to_string(),
                        balance: *balance,
                        sampled_at: start + Duration::seconds(index as i64 * 30),
                    },
                )
                .await
                .expect("append");
        }
        store
    }

    fn validator(
        age: AgeBehavior,
        history: Arc<dyn BalanceHistoryStore>,
    ) -> AntiGamingValidator {
        AntiGamingValidator::new(
            Arc::new(FakeChain(age)),
            history,
            ValidatorConfig::default(),
        )
    }

    #[test]
    fn sharp_jump_exceeds_max_threshold() {
        let outcome = volatility_verdict(&[100.0, 100.0, 160.0], &ValidatorConfig::default());
        assert!(!outcome.is_valid());
        assert_eq!(
            outcome.reason(),
            "Extreme balance volatility detected: 60.0% change in 10 minutes (max allowed: 50.0%)"
        );
    }

    #[test]
    fn gentle_drift_passes() {
        let outcome = volatility_verdict(&[100.0, 105.0, 108.0], &ValidatorConfig::default());
        assert!(matches!(outcome, CheckOutcome::Passed(_)));
        assert!(outcome.reason().contains("max 5.0%"));
    }

    #[test]
    fn sustained_average_change_blocks_below_the_max() {
        // 40% each step: under the 50% max, over the 35% average bound.
        let outcome = volatility_verdict(&[100.0, 140.0, 196.0], &ValidatorConfig::default());
        assert!(matches!(
            outcome,
            CheckOutcome::VerificationFailed(ref reason) if reason.starts_with("High average volatility")
        ));
    }

    #[test]
    fn zero_priors_are_skipped_and_short_series_pass() {
        let config = ValidatorConfig::default();
        assert_eq!(
            volatility_verdict(&[0.0, 0.0, 50.0], &config),
            CheckOutcome::VerificationUnavailable("No valid balance changes to analyze".to_string())
        );
        assert!(volatility_verdict(&[0.0, 100.0, 101.0], &config).is_valid());
        assert!(volatility_verdict(&[100.0, 500.0], &config).is_valid());
    }

    #[tokio::test]
    async fn young_wallet_is_blocked_with_its_age() {
        let validator = validator(AgeBehavior::FirstSeenDaysAgo(3), history_with(&[]).await);
        let outcome = validator.check_wallet_age(WALLET).await;
        assert!(!outcome.is_valid());
        assert!(outcome.reason().contains("3 days old"), "{}", outcome.reason());
    }

    #[tokio::test]
    async fn wallet_without_history_is_blocked() {
        let validator = validator(AgeBehavior::NoHistory, history_with(&[]).await);
        let outcome = validator.check_wallet_age(WALLET).await;
        assert!(!outcome.is_valid());
        assert!(outcome.reason().contains("No transaction history"));
    }

    #[tokio::test]
    async fn unverifiable_age_fails_open() {
        for behavior in [
            AgeBehavior::Http(500),
            AgeBehavior::TimestampMissing,
            AgeBehavior::Unreachable,
        ] {
            let validator = validator(behavior, history_with(&[]).await);
            let outcome = validator.check_wallet_age(WALLET).await;
            assert!(matches!(outcome, CheckOutcome::VerificationUnavailable(_)));
        }

        let validator = validator(AgeBehavior::FirstSeenDaysAgo(30), history_with(&[]).await);
        assert_eq!(
            validator.check_wallet_age(WALLET).await,
            CheckOutcome::Passed("Wallet age verified: 30 days old".to_string())
        );
    }

    #[tokio::test]
    async fn aggregate_collects_every_failing_reason() {
        let validator = validator(AgeBehavior::NoHistory, history_with(&[100.0, 100.0]).await);
        let result = validator.validate_for_role_assignment(WALLET, 160.0).await;
        assert!(!result.valid);
        assert_eq!(result.blocked_reasons.len(), 2);
        assert!(result.blocked_reasons[0].starts_with("Wallet Age: "));
        assert!(result.blocked_reasons[1].starts_with("Balance Volatility: "));
        assert!(!result.checks[WALLET_AGE_CHECK].valid);
        assert!(!result.checks[BALANCE_VOLATILITY_CHECK].valid);
    }

    #[tokio::test]
    async fn history_query_error_passes_with_a_warning() {
        let validator = validator(AgeBehavior::FirstSeenDaysAgo(30), Arc::new(BrokenHistory));
        let result = validator.validate_for_role_assignment(WALLET, 160.0).await;
        assert!(result.valid);
        assert!(result.blocked_reasons.is_empty());
        assert!(result.checks[BALANCE_VOLATILITY_CHECK].valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("Volatility check failed - allowed due to error"));
    }

    #[tokio::test]
    async fn unexpected_failure_fails_open() {
        let validator = validator(AgeBehavior::Panic, history_with(&[]).await);
        let result = validator.validate_for_role_assignment(WALLET, 10.0).await;
        assert!(result.valid);
        assert_eq!(
            result.warnings,
            vec!["Validation error: gateway exploded".to_string()]
        );
    }

    #[tokio::test]
    async fn configuration_updates_apply_to_later_checks() {
        let validator = validator(AgeBehavior::FirstSeenDaysAgo(10), history_with(&[]).await);
        assert!(validator.check_wallet_age(WALLET).await.is_valid());

        let updated = validator
            .update_configuration(ValidatorConfigPatch {
                min_wallet_age_days: Some(14),
                ..ValidatorConfigPatch::default()
            })
            .await
            .expect("update");
        assert_eq!(updated.min_wallet_age_days, 14);
        assert_eq!(updated.max_volatility_threshold, 0.5);
        assert!(!validator.check_wallet_age(WALLET).await.is_valid());

        assert!(
            validator
                .update_configuration(ValidatorConfigPatch {
                    max_volatility_threshold: Some(-1.0),
                    ..ValidatorConfigPatch::default()
                })
                .await
                .is_err()
        );
        assert_eq!(validator.configuration().await.min_wallet_age_days, 14);
    }
}
