//! Balance to role eligibility.
//!
//! Holder roles go to every wallet with a positive balance. Amount roles are
//! tiers: a wallet receives only the highest tier whose threshold it meets.

use std::cmp::Ordering;

use crate::types::{RoleDefinition, RoleKind};

pub fn roles_for_balance(balance: f64, catalog: &[RoleDefinition]) -> Vec<RoleDefinition> {
    if balance.is_nan() || balance <= 0.0 {
        return Vec::new();
    }

    let mut qualified = catalog
        .iter()
        .filter(|role| matches!(role.kind, RoleKind::Holder))
        .cloned()
        .collect::<Vec<_>>();

    let mut tiers = catalog
        .iter()
        .filter_map(|role| match role.kind {
            RoleKind::Amount { amount_threshold } if amount_threshold <= balance => {
                Some((amount_threshold, role))
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    // Stable sort keeps catalog order among equal thresholds.
    tiers.sort_by(|left, right| right.0.partial_cmp(&left.0).unwrap_or(Ordering::Equal));
    if let Some((_, top_tier)) = tiers.first() {
        qualified.push((*top_tier).clone());
    }

    qualified
}
