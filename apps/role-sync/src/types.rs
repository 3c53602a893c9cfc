use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const AUDIT_RECORD_SCHEMA_V1: &str = "role_sync.blocked_role_assignment.v1";
pub const STATUS_RESPONSE_SCHEMA_V1: &str = "role_sync.status.v1";

/// Balance differences at or below this are treated as float noise.
pub const BALANCE_EPSILON: f64 = 1e-6;

/// Chain amounts are fixed-point integers with six decimals.
pub const MICRO_UNITS_PER_UNIT: f64 = 1_000_000.0;

/// A platform account linked to a wallet. Only the poller writes the balance fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletLink {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub last_known_balance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
}

impl WalletLink {
    /// Returns `(account_id, wallet_address)` when both are populated.
    #[must_use]
    pub fn linked_pair(&self) -> Option<(&str, &str)> {
        let account_id = self
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?;
        let wallet_address = self
            .wallet_address
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?;
        Some((account_id, wallet_address))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub wallet_address: String,
    pub balance: f64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoleKind {
    Holder,
    Amount { amount_threshold: f64 },
}

impl RoleKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Holder => "holder",
            Self::Amount { .. } => "amount",
        }
    }

    #[must_use]
    pub fn threshold(&self) -> Option<f64> {
        match self {
            Self::Holder => None,
            Self::Amount { amount_threshold } => Some(*amount_threshold),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub role_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: RoleKind,
}

impl RoleDefinition {
    #[must_use]
    pub fn holder(role_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role_id: role_id.into(),
            name: name.into(),
            kind: RoleKind::Holder,
        }
    }

    #[must_use]
    pub fn amount(role_id: impl Into<String>, name: impl Into<String>, threshold: f64) -> Self {
        Self {
            role_id: role_id.into(),
            name: name.into(),
            kind: RoleKind::Amount {
                amount_threshold: threshold,
            },
        }
    }

    /// Builds a definition from its stored columns; the threshold must be
    /// present exactly when the kind is `amount`.
    pub fn from_parts(
        role_id: String,
        name: String,
        kind: &str,
        amount_threshold: Option<f64>,
    ) -> Result<Self, String> {
        let kind = match (kind.trim().to_ascii_lowercase().as_str(), amount_threshold) {
            ("holder", None) => RoleKind::Holder,
            ("holder", Some(_)) => {
                return Err(format!("holder role {role_id} must not carry a threshold"));
            }
            ("amount", Some(threshold)) if threshold.is_finite() => RoleKind::Amount {
                amount_threshold: threshold,
            },
            ("amount", _) => {
                return Err(format!("amount role {role_id} requires a finite threshold"));
            }
            (other, _) => return Err(format!("unknown role kind {other} for {role_id}")),
        };
        Ok(Self {
            role_id,
            name,
            kind,
        })
    }
}

/// Result of one heuristic, as recorded in validation output and the audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDetail {
    pub valid: bool,
    pub reason: String,
}

pub type CheckDetails = BTreeMap<String, CheckDetail>;

/// Audit projection of a blocked reconciliation. Write-once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub schema: String,
    pub audit_id: String,
    pub recorded_at: DateTime<Utc>,
    pub wallet_address: String,
    pub account_id: String,
    pub balance: f64,
    #[serde(default)]
    pub requested_role_ids: Vec<String>,
    pub blocked_reasons: Vec<String>,
    #[serde(default)]
    pub checks: CheckDetails,
}

impl AuditRecord {
    #[must_use]
    pub fn blocked(
        delta: &BalanceDelta,
        requested_role_ids: Vec<String>,
        blocked_reasons: Vec<String>,
        checks: CheckDetails,
    ) -> Self {
        Self {
            schema: AUDIT_RECORD_SCHEMA_V1.to_string(),
            audit_id: format!("audit_{}", uuid::Uuid::now_v7().simple()),
            recorded_at: Utc::now(),
            wallet_address: delta.wallet_address.clone(),
            account_id: delta.account_id.clone(),
            balance: delta.current_balance,
            requested_role_ids,
            blocked_reasons,
            checks,
        }
    }
}

/// A detected balance change, handed from the poller to the executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub user_id: String,
    pub account_id: String,
    pub wallet_address: String,
    pub previous_balance: f64,
    pub current_balance: f64,
    pub sampled_at: DateTime<Utc>,
}

impl BalanceDelta {
    #[must_use]
    pub fn change(&self) -> f64 {
        self.current_balance - self.previous_balance
    }

    #[must_use]
    pub fn to_record(&self) -> BalanceRecord {
        BalanceRecord {
            wallet_address: self.wallet_address.clone(),
            balance: self.current_balance,
            sampled_at: self.sampled_at,
        }
    }
}

#[must_use]
pub fn balance_changed(previous: f64, current: f64) -> bool {
    (current - previous).abs() > BALANCE_EPSILON
}
