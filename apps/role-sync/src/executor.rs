use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::platform::{PlatformError, PlatformRoleApi};
use crate::resolver::roles_for_balance;
use crate::store::{AuditSink, RoleCatalog};
use crate::types::{AuditRecord, BalanceDelta, RoleDefinition};
use crate::validator::AntiGamingValidator;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Managed roles already match eligibility.
    NoChange,
    MemberNotFound,
    PlatformUnavailable(String),
    CatalogUnavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        added: BTreeSet<String>,
        removed: BTreeSet<String>,
    },
    Blocked {
        reasons: Vec<String>,
    },
    Skipped(SkipReason),
}

impl ReconcileOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Blocked { .. } => "blocked",
            Self::Skipped(SkipReason::NoChange) => "skipped",
            Self::Skipped(_) => "failed",
        }
    }
}

/// Minimal change that converges a member's managed roles to eligibility.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleDiff {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl RoleDiff {
    /// Roles outside `managed` are never added or removed.
    #[must_use]
    pub fn compute(
        current: &BTreeSet<String>,
        qualified: &BTreeSet<String>,
        managed: &BTreeSet<String>,
    ) -> Self {
        let held = current
            .intersection(managed)
            .cloned()
            .collect::<BTreeSet<_>>();
        Self {
            to_add: qualified.difference(&held).cloned().collect(),
            to_remove: held.difference(qualified).cloned().collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    #[must_use]
    pub fn apply_to(&self, current: &BTreeSet<String>) -> BTreeSet<String> {
        current
            .difference(&self.to_remove)
            .chain(self.to_add.iter())
            .cloned()
            .collect()
    }
}

pub struct ReconciliationExecutor {
    roles: Arc<dyn RoleCatalog>,
    audit: Arc<dyn AuditSink>,
    platform: Arc<dyn PlatformRoleApi>,
    validator: Arc<AntiGamingValidator>,
}

impl ReconciliationExecutor {
    pub fn new(
        roles: Arc<dyn RoleCatalog>,
        audit: Arc<dyn AuditSink>,
        platform: Arc<dyn PlatformRoleApi>,
        validator: Arc<AntiGamingValidator>,
    ) -> Self {
        Self {
            roles,
            audit,
            platform,
            validator,
        }
    }

    /// Stateless between calls: every invocation re-diffs from scratch, so
    /// repeated or overlapping calls converge to the same role set.
    pub async fn reconcile(&self, delta: &BalanceDelta) -> ReconcileOutcome {
        let balance = delta.current_balance;
        let account_id = delta.account_id.as_str();

        if balance > 0.0 && !delta.wallet_address.trim().is_empty() {
            let validation = self
                .validator
                .validate_for_role_assignment(&delta.wallet_address, balance)
                .await;
            if !validation.valid {
                let requested_role_ids = match self.roles.list_roles().await {
                    Ok(catalog) => role_ids(&roles_for_balance(balance, &catalog))
                        .into_iter()
                        .collect(),
                    Err(_) => Vec::new(),
                };
                let record = AuditRecord::blocked(
                    delta,
                    requested_role_ids,
                    validation.blocked_reasons.clone(),
                    validation.checks,
                );
                let audit_id = record.audit_id.clone();
                if let Err(error) = self.audit.append(record).await {
                    tracing::error!(
                        account_id = %account_id,
                        audit_id = %audit_id,
                        reason = %error,
                        "blocked assignment audit write failed"
                    );
                }
                return ReconcileOutcome::Blocked {
                    reasons: validation.blocked_reasons,
                };
            }
        }

        let catalog = match self.roles.list_roles().await {
            Ok(catalog) => catalog,
            Err(error) => {
                tracing::error!(account_id = %account_id, reason = %error, "role catalog read failed");
                return ReconcileOutcome::Skipped(SkipReason::CatalogUnavailable(error.to_string()));
            }
        };
        let current = match self.platform.get_member_roles(account_id).await {
            Ok(current) => current,
            Err(error) => return skipped_for(account_id, error),
        };

        let qualified = role_ids(&roles_for_balance(balance, &catalog));
        let managed = role_ids(&catalog);
        let diff = RoleDiff::compute(&current, &qualified, &managed);
        if diff.is_empty() {
            return ReconcileOutcome::Skipped(SkipReason::NoChange);
        }

        let desired = diff.apply_to(&current);
        if let Err(error) = self.platform.set_member_roles(account_id, &desired).await {
            return skipped_for(account_id, error);
        }

        tracing::info!(
            account_id = %account_id,
            wallet = %delta.wallet_address,
            balance,
            added = ?diff.to_add,
            removed = ?diff.to_remove,
            "member roles reconciled"
        );
        ReconcileOutcome::Applied {
            added: diff.to_add,
            removed: diff.to_remove,
        }
    }
}

fn role_ids(roles: &[RoleDefinition]) -> BTreeSet<String> {
    roles.iter().map(|role| role.role_id.clone()).collect()
}

fn skipped_for(account_id: &str, error: PlatformError) -> ReconcileOutcome {
    match error {
        PlatformError::MemberNotFound(_) => {
            tracing::warn!(account_id = %account_id, "member not found; skipping");
            ReconcileOutcome::Skipped(SkipReason::MemberNotFound)
        }
        other => {
            tracing::error!(
                account_id = %account_id,
                code = other.code(),
                reason = %other,
                "platform role update failed"
            );
            ReconcileOutcome::Skipped(SkipReason::PlatformUnavailable(other.to_string()))
        }
    }
}
