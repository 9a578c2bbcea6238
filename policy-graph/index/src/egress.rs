//! Resolves each local endpoint's effective egress gateway selectors.
//!
//! An endpoint may carry its own egress assignment or inherit one from the first of its profiles
//! that has one. An assignment either selects gateways directly or names an egress gateway
//! policy, in which case each of the policy's rules selects its own gateways. Every distinct
//! selector in use is backed by a ref-counted IP set (see [`SelectorIpSets`]).
//!
//! Namespace selectors match endpoint labels carrying the [`NAMESPACE_LABEL_PREFIX`]. Nothing
//! here derives those labels: they are expected to be merged into each endpoint's labels
//! upstream, before updates reach the graph.
//!
//! ```text
//! [ Endpoint ] -> [ Profile ] -> [ EgressGatewayPolicy ]
//!       \______________\__________________\__ (selector, rule slot) -> [ IP set ]
//! ```

#[cfg(test)]
mod tests;

use crate::{
    dispatcher::UpdateHandler,
    ip_sets::{IpSetKind, IpSetListener, SelectorIpSets},
};
use ahash::AHashMap as HashMap;
use policy_graph_core::{
    egress::{EgressGatewayPolicy, EgressRuleData, Profile},
    Delta, EgressSpec, Endpoint, EndpointEgressData, EndpointKey, IpNet, Selector, Update,
};

/// Endpoint labels derived from the endpoint's namespace carry this prefix.
pub const NAMESPACE_LABEL_PREFIX: &str = "pcns.";

const IP_SET_KIND: IpSetKind = IpSetKind::EgressGateway;

pub trait EgressListener: IpSetListener {
    fn on_endpoint_egress_data_update(&mut self, key: &EndpointKey, data: &EndpointEgressData);
}

#[derive(Debug)]
pub struct EgressSelectorResolver<L> {
    listener: L,
    ip_sets: SelectorIpSets<SlotKey>,
    endpoints: HashMap<EndpointKey, EndpointState>,

    /// Non-empty egress assignments, by profile name.
    profiles: HashMap<String, EgressSpec>,
    policies: HashMap<String, EgressGatewayPolicy>,
}

/// The egress gateways an endpoint routes through.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum EffectiveEgress {
    #[default]
    None,

    Selector {
        selector: Selector,
        max_next_hops: u32,
    },

    Policy {
        name: String,
        rules: Vec<EffectiveRule>,
    },

    /// The named policy does not exist, so the endpoint's egress traffic is dropped.
    DenyAll { policy: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveRule {
    pub destination: Option<IpNet>,
    pub selector: Option<Selector>,
    pub max_next_hops: u32,
}

/// An upstream object that endpoint egress assignments may reference.
#[derive(Copy, Clone, Debug)]
pub enum Upstream<'a> {
    Profile {
        name: &'a str,
        egress: Option<&'a EgressSpec>,
    },
    Policy {
        name: &'a str,
        policy: Option<&'a EgressGatewayPolicy>,
    },
}

/// Identifies one selector slot of an endpoint: a direct selector occupies slot 0 and each rule
/// of a policy occupies the slot matching its index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SlotKey {
    endpoint: EndpointKey,
    slot: usize,
}

#[derive(Debug)]
struct EndpointState {
    own: Option<EgressSpec>,
    profile_ids: Vec<String>,
    effective: EffectiveEgress,
}

// === impl EgressSelectorResolver ===

impl<L: EgressListener> EgressSelectorResolver<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener,
            ip_sets: SelectorIpSets::new(IP_SET_KIND),
            endpoints: HashMap::default(),
            profiles: HashMap::default(),
            policies: HashMap::default(),
        }
    }

    pub fn on_endpoint_update(&mut self, key: &EndpointKey, endpoint: Option<&Endpoint>) {
        let Some(endpoint) = endpoint else {
            if self.endpoints.contains_key(key) {
                tracing::debug!(%key, "Endpoint deleted");
                self.apply(key, EffectiveEgress::None);
                self.endpoints.remove(key);
            }
            return;
        };

        let own = endpoint.egress.clone().filter(|s| !s.is_empty());
        let effective = resolve_effective(
            own.as_ref(),
            &endpoint.profile_ids,
            &self.profiles,
            &self.policies,
        );
        self.endpoints
            .entry(key.clone())
            .and_modify(|state| {
                state.own = own.clone();
                state.profile_ids = endpoint.profile_ids.clone();
            })
            .or_insert_with(|| EndpointState {
                own,
                profile_ids: endpoint.profile_ids.clone(),
                effective: EffectiveEgress::None,
            });
        self.apply(key, effective);
    }

    /// Records a change to a profile or policy and recomputes the endpoints that depend on it.
    pub fn on_upstream_object_changed(&mut self, upstream: Upstream<'_>) {
        match upstream {
            Upstream::Profile { name, egress } => {
                let new = egress.filter(|s| !s.is_empty()).cloned();
                let old = match new.clone() {
                    Some(spec) => self.profiles.insert(name.to_string(), spec),
                    None => self.profiles.remove(name),
                };
                if old == new {
                    return;
                }
                tracing::debug!(profile = %name, "Profile egress changed");

                // Endpoints with their own assignment ignore their profiles.
                let affected = self
                    .endpoints
                    .iter()
                    .filter(|(_, state)| {
                        state.own.is_none() && state.profile_ids.iter().any(|id| id == name)
                    })
                    .map(|(key, _)| key.clone())
                    .collect::<Vec<_>>();
                self.recompute(affected);
            }

            Upstream::Policy { name, policy } => {
                let old = match policy.cloned() {
                    Some(policy) => self.policies.insert(name.to_string(), policy),
                    None => self.policies.remove(name),
                };
                if old.as_ref() == policy {
                    return;
                }
                tracing::debug!(policy = %name, "Egress gateway policy changed");

                let affected = self
                    .endpoints
                    .iter()
                    .filter(|(_, state)| {
                        winning_spec(state.own.as_ref(), &state.profile_ids, &self.profiles)
                            .map_or(false, |spec| spec.policy.trim() == name)
                    })
                    .map(|(key, _)| key.clone())
                    .collect::<Vec<_>>();
                self.recompute(affected);
            }
        }
    }

    pub fn effective(&self, key: &EndpointKey) -> Option<&EffectiveEgress> {
        self.endpoints.get(key).map(|s| &s.effective)
    }

    /// The number of IP sets currently active.
    pub fn active_ip_sets(&self) -> usize {
        self.ip_sets.len()
    }

    pub fn endpoints_len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    fn recompute(&mut self, mut keys: Vec<EndpointKey>) {
        keys.sort();
        for key in keys {
            let Some(state) = self.endpoints.get(&key) else {
                continue;
            };
            let effective = resolve_effective(
                state.own.as_ref(),
                &state.profile_ids,
                &self.profiles,
                &self.policies,
            );
            self.apply(&key, effective);
        }
    }

    /// Moves an endpoint to a new effective assignment, updating its IP set references and
    /// notifying the listener when anything changed.
    fn apply(&mut self, key: &EndpointKey, effective: EffectiveEgress) {
        let Some(state) = self.endpoints.get_mut(key) else {
            return;
        };
        if state.effective == effective {
            return;
        }
        let old = std::mem::replace(&mut state.effective, effective);

        let old_slots = old.slots().len();
        let new_slots = state.effective.slots();
        let assignments = (0..old_slots.max(new_slots.len())).map(|slot| {
            let owner = SlotKey {
                endpoint: key.clone(),
                slot,
            };
            (owner, new_slots.get(slot).cloned().flatten())
        });
        self.ip_sets.assign_all(assignments, &mut self.listener);

        let data = state.effective.egress_data();
        tracing::debug!(%key, ?data, "Egress data updated");
        self.listener.on_endpoint_egress_data_update(key, &data);
    }
}

impl<L: EgressListener> UpdateHandler for EgressSelectorResolver<L> {
    fn on_update(&mut self, update: &Update) {
        match &update.delta {
            Delta::Endpoint { key, value } => self.on_endpoint_update(key, value.as_ref()),
            Delta::Profile { name, value } => {
                self.on_upstream_object_changed(Upstream::Profile {
                    name,
                    egress: value.as_ref().and_then(|p: &Profile| p.egress.as_ref()),
                })
            }
            Delta::EgressGatewayPolicy { name, value } => {
                self.on_upstream_object_changed(Upstream::Policy {
                    name,
                    policy: value.as_ref(),
                })
            }
            _ => {}
        }
    }
}

// === impl EffectiveEgress ===

impl EffectiveEgress {
    /// The selector occupying each of the endpoint's slots.
    fn slots(&self) -> Vec<Option<Selector>> {
        match self {
            Self::None => vec![],
            Self::Selector { selector, .. } => vec![Some(selector.clone())],
            Self::Policy { rules, .. } => rules.iter().map(|r| r.selector.clone()).collect(),
            Self::DenyAll { .. } => vec![Some(Selector::deny_all())],
        }
    }

    pub fn egress_data(&self) -> EndpointEgressData {
        match self {
            Self::None => EndpointEgressData::default(),
            Self::Selector {
                selector,
                max_next_hops,
            } => EndpointEgressData {
                ip_set_id: Some(IP_SET_KIND.ip_set_id(selector)),
                max_next_hops: *max_next_hops,
                ..Default::default()
            },
            Self::Policy { rules, .. } => EndpointEgressData {
                rules: rules
                    .iter()
                    .map(|rule| EgressRuleData {
                        destination: rule.destination,
                        ip_set_id: rule.selector.as_ref().map(|s| IP_SET_KIND.ip_set_id(s)),
                        max_next_hops: rule.max_next_hops,
                    })
                    .collect(),
                ..Default::default()
            },
            Self::DenyAll { .. } => EndpointEgressData {
                ip_set_id: Some(IP_SET_KIND.ip_set_id(&Selector::deny_all())),
                ..Default::default()
            },
        }
    }
}

/// Computes an endpoint's effective egress assignment.
///
/// The endpoint's own non-empty assignment wins; otherwise the first profile, in the endpoint's
/// profile order, with a non-empty assignment is used. An assignment naming a policy resolves to
/// that policy's rules, or to deny-all when the policy does not exist.
///
/// # Panics
///
/// If a selector fails to parse. Selectors are validated before they are admitted to the
/// datastore.
pub fn resolve_effective(
    own: Option<&EgressSpec>,
    profile_ids: &[String],
    profiles: &HashMap<String, EgressSpec>,
    policies: &HashMap<String, EgressGatewayPolicy>,
) -> EffectiveEgress {
    let Some(spec) = winning_spec(own, profile_ids, profiles) else {
        return EffectiveEgress::None;
    };

    let policy = spec.policy.trim();
    if policy.is_empty() {
        return EffectiveEgress::Selector {
            selector: gateway_selector(&spec.selector, &spec.namespace_selector),
            max_next_hops: spec.max_next_hops,
        };
    }

    match policies.get(policy) {
        Some(p) => EffectiveEgress::Policy {
            name: policy.to_string(),
            rules: p
                .rules
                .iter()
                .map(|rule| EffectiveRule {
                    destination: rule.destination,
                    selector: rule
                        .gateway
                        .as_ref()
                        .map(|gw| gateway_selector(&gw.selector, &gw.namespace_selector)),
                    max_next_hops: rule.gateway.as_ref().map_or(0, |gw| gw.max_next_hops),
                })
                .collect(),
        },
        None => {
            tracing::warn!(%policy, "Egress gateway policy not found; denying all egress");
            EffectiveEgress::DenyAll {
                policy: policy.to_string(),
            }
        }
    }
}

fn winning_spec<'a>(
    own: Option<&'a EgressSpec>,
    profile_ids: &[String],
    profiles: &'a HashMap<String, EgressSpec>,
) -> Option<&'a EgressSpec> {
    own.filter(|s| !s.is_empty()).or_else(|| {
        profile_ids
            .iter()
            .filter_map(|id| profiles.get(id))
            .find(|s| !s.is_empty())
    })
}

/// Combines a gateway selector with its namespace selector, which applies to the gateways'
/// namespace labels.
fn gateway_selector(selector: &str, namespace_selector: &str) -> Selector {
    let selector = parse_selector(selector);
    if namespace_selector.trim().is_empty() {
        return selector;
    }
    parse_selector(namespace_selector)
        .with_label_prefix(NAMESPACE_LABEL_PREFIX)
        .and(&selector)
}

fn parse_selector(s: &str) -> Selector {
    if s.trim().is_empty() {
        return Selector::all();
    }
    Selector::parse(s).unwrap_or_else(|error| panic!("invalid egress selector {s:?}: {error}"))
}
