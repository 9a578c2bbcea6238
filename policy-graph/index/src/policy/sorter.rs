use ahash::AHashMap as HashMap;
use policy_graph_core::{
    policy::{cmp_order, PolicyInfo},
    Policy, PolicyKey, Tier,
};
use std::cmp::Ordering;

/// Maintains the global ordering of tiers and of the policies within them.
///
/// Tiers sort by order, then name. Policies sort by order, then name, where a staged policy is
/// compared by its enforced name and placed immediately before the policy it stages. Items
/// without an order sort last.
#[derive(Debug, Default)]
pub struct PolicySorter {
    tiers: HashMap<String, TierState>,
}

/// A tier and its policies, in order.
#[derive(Clone, Debug, PartialEq)]
pub struct SortedTier {
    pub name: String,
    pub order: Option<f64>,
    pub valid: bool,
    pub policies: Vec<PolicyInfo>,
}

#[derive(Debug, Default)]
struct TierState {
    /// Set when the tier object exists. Policies may reference tiers that don't.
    tier: Option<Tier>,
    policies: HashMap<PolicyKey, PolicyInfo>,
}

// === impl PolicySorter ===

impl PolicySorter {
    /// Records a tier change, returning true if the global ordering may have changed.
    pub fn on_tier_update(&mut self, name: &str, tier: Option<&Tier>) -> bool {
        match tier {
            Some(tier) => {
                let state = self.tiers.entry(name.to_string()).or_default();
                if state.tier.as_ref() == Some(tier) {
                    return false;
                }
                state.tier = Some(tier.clone());
                true
            }
            None => {
                let Some(state) = self.tiers.get_mut(name) else {
                    return false;
                };
                if state.tier.take().is_none() {
                    return false;
                }
                if state.policies.is_empty() {
                    self.tiers.remove(name);
                }
                true
            }
        }
    }

    /// Records a policy change, returning true if the global ordering may have changed.
    pub fn on_policy_update(&mut self, key: &PolicyKey, policy: Option<&Policy>) -> bool {
        match policy {
            Some(policy) => {
                let info = PolicyInfo {
                    key: key.clone(),
                    order: policy.order,
                    ingress: policy.applies_to_ingress(),
                    egress: policy.applies_to_egress(),
                    staged: key.is_staged(),
                };
                let state = self.tiers.entry(key.tier.clone()).or_default();
                let old = state.policies.insert(key.clone(), info.clone());
                old.as_ref() != Some(&info)
            }
            None => {
                let Some(state) = self.tiers.get_mut(&key.tier) else {
                    return false;
                };
                if state.policies.remove(key).is_none() {
                    return false;
                }
                if state.policies.is_empty() && state.tier.is_none() {
                    self.tiers.remove(&key.tier);
                }
                true
            }
        }
    }

    /// Returns every tier, and its policies, in order. Tiers that don't exist but are
    /// referenced by policies are marked invalid.
    pub fn sorted(&self) -> Vec<SortedTier> {
        let mut tiers = self
            .tiers
            .iter()
            .map(|(name, state)| {
                let mut policies = state.policies.values().cloned().collect::<Vec<_>>();
                policies.sort_by(cmp_policies);
                SortedTier {
                    name: name.clone(),
                    order: state.tier.as_ref().and_then(|t| t.order),
                    valid: state.tier.is_some(),
                    policies,
                }
            })
            .collect::<Vec<_>>();
        tiers.sort_by(cmp_tiers);
        tiers
    }

    pub fn tiers_len(&self) -> usize {
        self.tiers.len()
    }

    pub fn policies_len(&self) -> usize {
        self.tiers.values().map(|t| t.policies.len()).sum()
    }
}

/// Valid tiers precede invalid ones, which have no order of their own.
fn cmp_tiers(a: &SortedTier, b: &SortedTier) -> Ordering {
    b.valid
        .cmp(&a.valid)
        .then_with(|| cmp_order(a.order, b.order))
        .then_with(|| a.name.cmp(&b.name))
}

fn cmp_policies(a: &PolicyInfo, b: &PolicyInfo) -> Ordering {
    let (a_name, a_staged) = a.key.split_staged();
    let (b_name, b_staged) = b.key.split_staged();
    cmp_order(a.order, b.order)
        .then_with(|| a_name.cmp(&b_name))
        .then_with(|| b_staged.cmp(&a_staged))
}
