use serde::{Deserialize, Serialize};
use std::{borrow::Cow, cmp::Ordering, fmt};

/// Marks a policy that is evaluated for reporting only.
pub const STAGED_PREFIX: &str = "staged:";

/// Identifies a policy within its tier. Namespaced policies are named `<namespace>/<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey {
    pub tier: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    /// Policies without an order sort after every ordered policy in their tier.
    pub order: Option<f64>,

    /// Selects the endpoints the policy applies to. An empty selector selects all endpoints.
    pub selector: String,

    /// The directions the policy applies to. A policy without types applies to ingress.
    pub types: Vec<PolicyType>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyType {
    Ingress,
    Egress,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tier {
    pub order: Option<f64>,
}

/// A tier, and the policies within it, as applied to an endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierInfo {
    pub name: String,
    pub order: Option<f64>,

    /// False when policies reference a tier that does not exist.
    pub valid: bool,

    pub policies: Vec<PolicyInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyInfo {
    pub key: PolicyKey,
    pub order: Option<f64>,
    pub ingress: bool,
    pub egress: bool,
    pub staged: bool,
}

// === impl PolicyKey ===

impl PolicyKey {
    pub fn new(tier: impl ToString, name: impl ToString) -> Self {
        Self {
            tier: tier.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_staged(&self) -> bool {
        self.split_staged().1
    }

    /// Returns the policy's name with any staged marker removed, and whether it was present.
    ///
    /// `staged:pol` yields `pol`; `ns/staged:pol` yields `ns/pol`.
    pub fn split_staged(&self) -> (Cow<'_, str>, bool) {
        match self.name.split_once('/') {
            Some((ns, name)) => match name.strip_prefix(STAGED_PREFIX) {
                Some(base) => (Cow::Owned(format!("{ns}/{base}")), true),
                None => (Cow::Borrowed(self.name.as_str()), false),
            },
            None => match self.name.strip_prefix(STAGED_PREFIX) {
                Some(base) => (Cow::Borrowed(base), true),
                None => (Cow::Borrowed(self.name.as_str()), false),
            },
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier, self.name)
    }
}

// === impl Policy ===

impl Policy {
    pub fn applies_to_ingress(&self) -> bool {
        self.types.is_empty() || self.types.contains(&PolicyType::Ingress)
    }

    pub fn applies_to_egress(&self) -> bool {
        self.types.contains(&PolicyType::Egress)
    }
}

// === impl TierInfo ===

impl TierInfo {
    pub fn ingress_policy_names(&self) -> Vec<&str> {
        self.policies
            .iter()
            .filter(|p| p.ingress)
            .map(|p| p.key.name.as_str())
            .collect()
    }

    pub fn egress_policy_names(&self) -> Vec<&str> {
        self.policies
            .iter()
            .filter(|p| p.egress)
            .map(|p| p.key.name.as_str())
            .collect()
    }
}

/// Orders optional sort keys, placing unordered items last.
pub fn cmp_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_names() {
        let key = PolicyKey::new("default", "staged:pol");
        assert_eq!(key.split_staged(), (Cow::Borrowed("pol"), true));

        let key = PolicyKey::new("default", "ns1/staged:pol");
        assert_eq!(key.split_staged().0, "ns1/pol");
        assert!(key.is_staged());

        let key = PolicyKey::new("default", "ns1/pol");
        assert_eq!(key.split_staged(), (Cow::Borrowed("ns1/pol"), false));
    }

    #[test]
    fn unordered_sorts_last() {
        assert_eq!(cmp_order(Some(10.0), None), Ordering::Less);
        assert_eq!(cmp_order(None, Some(-1.0)), Ordering::Greater);
        assert_eq!(cmp_order(Some(1.5), Some(1.5)), Ordering::Equal);
        assert_eq!(cmp_order(None, None), Ordering::Equal);
    }

    #[test]
    fn policy_types() {
        let policy = Policy::default();
        assert!(policy.applies_to_ingress());
        assert!(!policy.applies_to_egress());

        let policy = Policy {
            types: vec![PolicyType::Egress],
            ..Policy::default()
        };
        assert!(!policy.applies_to_ingress());
        assert!(policy.applies_to_egress());
    }
}
