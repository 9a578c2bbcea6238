use crate::IpNet;
use serde::{Deserialize, Serialize};

/// An egress gateway assignment, as configured on an endpoint or a profile.
///
/// Either `policy` names an [`EgressGatewayPolicy`], or `selector` (optionally narrowed by
/// `namespace_selector`) selects the gateway endpoints directly. A named policy takes
/// precedence over a selector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EgressSpec {
    pub selector: String,
    pub namespace_selector: String,
    pub policy: String,
    pub max_next_hops: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub egress: Option<EgressSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressGatewayPolicy {
    pub rules: Vec<EgressGatewayRule>,
}

/// Routes traffic toward `destination` (or everywhere, when unset) via the selected gateways.
/// A rule without a gateway sends matching traffic out directly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressGatewayRule {
    pub destination: Option<IpNet>,
    pub gateway: Option<EgressGateway>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EgressGateway {
    pub selector: String,
    pub namespace_selector: String,
    pub max_next_hops: u32,
}

/// Egress gateway data computed for an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointEgressData {
    /// The IP set holding the endpoint's gateways, when it uses a selector directly.
    pub ip_set_id: Option<String>,
    pub max_next_hops: u32,

    /// Per-destination rules, when the endpoint uses an egress gateway policy.
    pub rules: Vec<EgressRuleData>,

    /// Whether any egress selector in use matches this endpoint.
    pub is_egress_gateway: bool,

    /// The port the endpoint names for health checks, or 0. Set for every local endpoint,
    /// whether or not it is currently a gateway.
    pub health_port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressRuleData {
    pub destination: Option<IpNet>,
    pub ip_set_id: Option<String>,
    pub max_next_hops: u32,
}

// === impl EgressSpec ===

impl EgressSpec {
    pub fn from_selector(selector: impl ToString) -> Self {
        Self {
            selector: selector.to_string(),
            ..Self::default()
        }
    }

    pub fn from_policy(policy: impl ToString) -> Self {
        Self {
            policy: policy.to_string(),
            ..Self::default()
        }
    }

    /// True when the spec neither names a policy nor carries a selector.
    pub fn is_empty(&self) -> bool {
        self.policy.trim().is_empty()
            && self.selector.trim().is_empty()
            && self.namespace_selector.trim().is_empty()
    }
}
