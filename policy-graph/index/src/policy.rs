//! Computes, for each local endpoint, the ordered tiers of policies that apply to it, together
//! with its egress gateway data.
//!
//! Inputs arrive from several places: endpoint updates, policy/tier updates, policy matches from
//! the label index, egress data from the egress selector resolver, and egress-gateway selector
//! matches. Each input marks the affected endpoints dirty; nothing is published until
//! [`PolicyResolver::flush`] runs after the datastore is in sync. Endpoints that change several
//! times between flushes are published once, with their final state.

mod sorter;

pub use self::sorter::{PolicySorter, SortedTier};
use crate::{dispatcher::UpdateHandler, multimap::BiMultiMap, refcount::RefCounts};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use policy_graph_core::{
    policy::TierInfo, Delta, Endpoint, EndpointEgressData, EndpointKey, Policy, PolicyKey,
    SyncStatus, Tier, Update,
};

pub trait PolicyResolverListener {
    /// Publishes an endpoint's state. A deleted endpoint is published once with no endpoint,
    /// default egress data and no tiers.
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Endpoint>,
        egress: &EndpointEgressData,
        tiers: &[TierInfo],
    );
}

#[derive(Debug)]
pub struct PolicyResolver<L> {
    listener: L,
    health_port_name: String,

    endpoints: HashMap<EndpointKey, Endpoint>,
    policy_matches: BiMultiMap<PolicyKey, EndpointKey>,
    egress: HashMap<EndpointKey, EndpointEgressData>,

    /// Counts the egress gateway selectors in use that match each endpoint.
    gateway_usage: RefCounts<EndpointKey>,

    sorter: PolicySorter,
    sorted_tiers: Vec<SortedTier>,
    sort_required: bool,

    dirty: HashSet<EndpointKey>,
    in_sync: bool,
}

// === impl PolicyResolver ===

impl<L: PolicyResolverListener> PolicyResolver<L> {
    pub fn new(health_port_name: impl ToString, listener: L) -> Self {
        Self {
            listener,
            health_port_name: health_port_name.to_string(),
            endpoints: HashMap::default(),
            policy_matches: BiMultiMap::default(),
            egress: HashMap::default(),
            gateway_usage: RefCounts::default(),
            sorter: PolicySorter::default(),
            sorted_tiers: Vec::new(),
            sort_required: false,
            dirty: HashSet::default(),
            in_sync: false,
        }
    }

    pub fn on_endpoint_update(&mut self, key: &EndpointKey, endpoint: Option<&Endpoint>) {
        match endpoint {
            Some(ep) => {
                self.endpoints.insert(key.clone(), ep.clone());
            }
            None => {
                if self.endpoints.remove(key).is_none() {
                    return;
                }
            }
        }
        self.dirty.insert(key.clone());
    }

    pub fn on_tier_update(&mut self, name: &str, tier: Option<&Tier>) {
        if self.sorter.on_tier_update(name, tier) {
            tracing::debug!(tier = %name, "Tier ordering changed");
            self.sort_required = true;
        }
    }

    pub fn on_policy_update(&mut self, key: &PolicyKey, policy: Option<&Policy>) {
        if self.sorter.on_policy_update(key, policy) {
            tracing::debug!(policy = %key, "Policy ordering changed");
            self.sort_required = true;
        }
        self.dirty.extend(self.policy_matches.get_by_left(key).cloned());
    }

    pub fn on_policy_match(&mut self, policy: PolicyKey, endpoint: EndpointKey) {
        if self.policy_matches.insert(policy, endpoint.clone()) {
            self.dirty.insert(endpoint);
        }
    }

    pub fn on_policy_unmatch(&mut self, policy: &PolicyKey, endpoint: &EndpointKey) {
        if self.policy_matches.remove(policy, endpoint) {
            self.dirty.insert(endpoint.clone());
        }
    }

    pub fn on_endpoint_egress_data_update(&mut self, key: &EndpointKey, data: EndpointEgressData) {
        if data == EndpointEgressData::default() {
            self.egress.remove(key);
        } else {
            self.egress.insert(key.clone(), data);
        }
        self.dirty.insert(key.clone());
    }

    /// An egress gateway selector in use started matching the endpoint.
    pub fn on_egress_gateway_match(&mut self, key: &EndpointKey) {
        if self.gateway_usage.incr(key.clone()) == 1 {
            tracing::debug!(%key, "Endpoint is now an egress gateway");
            self.dirty.insert(key.clone());
        }
    }

    pub fn on_egress_gateway_unmatch(&mut self, key: &EndpointKey) {
        if self.gateway_usage.decr(key) == 0 {
            tracing::debug!(%key, "Endpoint is no longer an egress gateway");
            self.dirty.insert(key.clone());
        }
    }

    pub fn on_datastore_in_sync(&mut self) {
        if !self.in_sync {
            tracing::info!("Datastore in sync; publishing endpoint policy");
            self.in_sync = true;
        }
    }

    /// Publishes every dirty endpoint. Does nothing until the datastore is in sync.
    pub fn flush(&mut self) {
        if !self.in_sync {
            tracing::trace!(dirty = self.dirty.len(), "Not in sync; deferring flush");
            return;
        }

        if self.sort_required {
            self.sorted_tiers = self.sorter.sorted();
            self.sort_required = false;
            self.dirty.extend(self.endpoints.keys().cloned());
        }

        if self.dirty.is_empty() {
            return;
        }
        let mut dirty = self.dirty.drain().collect::<Vec<_>>();
        dirty.sort();
        tracing::debug!(endpoints = dirty.len(), "Flushing");
        for key in dirty {
            self.publish(&key);
        }
    }

    pub fn is_in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn endpoints_len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn tiers_len(&self) -> usize {
        self.sorter.tiers_len()
    }

    pub fn policies_len(&self) -> usize {
        self.sorter.policies_len()
    }

    /// The number of endpoints matched by at least one egress gateway selector.
    pub fn gateways_len(&self) -> usize {
        self.gateway_usage.len()
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    fn publish(&mut self, key: &EndpointKey) {
        let Some(endpoint) = self.endpoints.get(key) else {
            tracing::debug!(%key, "Publishing endpoint removal");
            self.listener
                .on_endpoint_tier_update(key, None, &EndpointEgressData::default(), &[]);
            return;
        };

        let tiers = self.matching_tiers(key);
        let mut egress = self.egress.get(key).cloned().unwrap_or_default();
        egress.is_egress_gateway = self.gateway_usage.get(key) > 0;
        egress.health_port = endpoint.port_named(&self.health_port_name).unwrap_or(0);

        tracing::trace!(%key, tiers = tiers.len(), "Publishing endpoint");
        self.listener
            .on_endpoint_tier_update(key, Some(endpoint), &egress, &tiers);
    }

    /// Filters the sorted tiers down to the policies matching the endpoint, omitting tiers
    /// with no matching policies.
    fn matching_tiers(&self, key: &EndpointKey) -> Vec<TierInfo> {
        self.sorted_tiers
            .iter()
            .filter_map(|tier| {
                let policies = tier
                    .policies
                    .iter()
                    .filter(|p| self.policy_matches.contains(&p.key, key))
                    .cloned()
                    .collect::<Vec<_>>();
                if policies.is_empty() {
                    return None;
                }
                Some(TierInfo {
                    name: tier.name.clone(),
                    order: tier.order,
                    valid: tier.valid,
                    policies,
                })
            })
            .collect()
    }
}

impl<L: PolicyResolverListener> UpdateHandler for PolicyResolver<L> {
    fn on_update(&mut self, update: &Update) {
        match &update.delta {
            Delta::Endpoint { key, value } => self.on_endpoint_update(key, value.as_ref()),
            Delta::Tier { name, value } => self.on_tier_update(name, value.as_ref()),
            Delta::Policy { key, value } => self.on_policy_update(key, value.as_ref()),
            _ => {}
        }
    }

    fn on_status(&mut self, status: SyncStatus) {
        if status == SyncStatus::InSync {
            self.on_datastore_in_sync();
        }
    }
}
