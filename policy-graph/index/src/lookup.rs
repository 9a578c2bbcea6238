//! A reverse-lookup cache from addresses to the objects that own them.
//!
//! The cache is read from outside the calculation graph (e.g. to annotate flow logs), so it is
//! shared behind a lock and cheap to clone. Endpoint deletions are deferred so that lookups for
//! traffic still in flight from a just-deleted endpoint continue to resolve.

use crate::{dispatcher::UpdateHandler, trie::IpTrie};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use policy_graph_core::{
    policy::TierInfo, Delta, Endpoint, EndpointKey, IpNet, IpPool, Labels, NetworkSet, Update,
};
use std::{collections::BTreeSet, net::IpAddr, sync::Arc, time::Duration};
use tokio::task::AbortHandle;

#[derive(Clone, Debug)]
pub struct EndpointLookupsCache {
    inner: Arc<RwLock<Inner>>,
    hostname: Arc<str>,
    deletion_delay: Duration,
}

/// What the cache knows about an endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointData {
    pub key: EndpointKey,
    pub labels: Labels,
    pub profile_ids: Vec<String>,

    /// The policy applied to the endpoint, in tier order. Only known for local endpoints.
    pub tiers: Vec<TierInfo>,

    local: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSetData {
    pub name: String,
    pub net: IpNet,
    pub labels: Labels,
}

#[derive(Debug, Default)]
struct Inner {
    endpoints: HashMap<EndpointKey, EndpointEntry>,
    addr_to_endpoints: HashMap<IpAddr, BTreeSet<EndpointKey>>,

    nodes: HashMap<String, IpAddr>,
    addr_to_nodes: HashMap<IpAddr, BTreeSet<String>>,

    network_sets: HashMap<String, NetworkSet>,
    network_set_nets: IpTrie<BTreeSet<String>>,

    ip_pools: IpTrie<IpPool>,
}

#[derive(Debug)]
struct EndpointEntry {
    data: EndpointData,
    addrs: Vec<IpAddr>,

    /// Incremented on every change so that a superseded deletion timer does nothing.
    generation: u64,
    pending_deletion: Option<AbortHandle>,
}

// === impl EndpointLookupsCache ===

impl EndpointLookupsCache {
    pub fn new(hostname: impl Into<Arc<str>>, deletion_delay: Duration) -> Self {
        Self {
            inner: Default::default(),
            hostname: hostname.into(),
            deletion_delay,
        }
    }

    /// Returns the endpoint owning an address. If several do, endpoints that are not pending
    /// deletion are preferred, then the lowest key.
    pub fn get_endpoint(&self, addr: IpAddr) -> Option<EndpointData> {
        let inner = self.inner.read();
        let keys = inner.addr_to_endpoints.get(&addr)?;
        keys.iter()
            .filter_map(|k| inner.endpoints.get(k))
            .min_by_key(|e| e.pending_deletion.is_some())
            .map(|e| e.data.clone())
    }

    pub fn get_endpoint_by_key(&self, key: &EndpointKey) -> Option<EndpointData> {
        self.inner.read().endpoints.get(key).map(|e| e.data.clone())
    }

    /// Returns the node with the given address, if exactly one node claims it.
    pub fn get_node(&self, addr: IpAddr) -> Option<String> {
        let inner = self.inner.read();
        let nodes = inner.addr_to_nodes.get(&addr)?;
        if nodes.len() != 1 {
            tracing::debug!(%addr, nodes = nodes.len(), "Address claimed by multiple nodes");
            return None;
        }
        nodes.iter().next().cloned()
    }

    /// Returns the network set with the most specific network containing the address.
    pub fn get_network_set(&self, addr: IpAddr) -> Option<NetworkSetData> {
        let inner = self.inner.read();
        let (net, names) = inner.network_set_nets.longest_match(addr)?;
        let name = names.iter().next()?;
        let set = inner.network_sets.get(name)?;
        Some(NetworkSetData {
            name: name.clone(),
            net,
            labels: set.labels.clone(),
        })
    }

    /// Returns the most specific IP pool containing the address.
    pub fn get_ip_pool(&self, addr: IpAddr) -> Option<(IpNet, IpPool)> {
        let inner = self.inner.read();
        inner
            .ip_pools
            .longest_match(addr)
            .map(|(net, pool)| (net, pool.clone()))
    }

    /// Records the policy applied to a local endpoint.
    pub fn on_endpoint_tiers(&self, key: &EndpointKey, tiers: &[TierInfo]) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.endpoints.get_mut(key) {
            if entry.pending_deletion.is_none() {
                entry.data.tiers = tiers.to_vec();
            }
        }
    }

    pub fn endpoints_len(&self) -> usize {
        self.inner.read().endpoints.len()
    }

    pub fn pending_deletions_len(&self) -> usize {
        self.inner
            .read()
            .endpoints
            .values()
            .filter(|e| e.pending_deletion.is_some())
            .count()
    }

    pub fn on_endpoint_update(&self, key: &EndpointKey, endpoint: Option<&Endpoint>) {
        match endpoint {
            Some(endpoint) => self.inner.write().upsert_endpoint(
                key,
                endpoint,
                key.hostname() == &*self.hostname,
            ),
            None => self.delete_endpoint(key),
        }
    }

    fn delete_endpoint(&self, key: &EndpointKey) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.endpoints.get_mut(key) else {
            return;
        };
        if entry.pending_deletion.is_some() {
            return;
        }

        let runtime = tokio::runtime::Handle::try_current();
        let runtime = match runtime {
            Ok(rt) if !self.deletion_delay.is_zero() => rt,
            _ => {
                tracing::debug!(%key, "Removing endpoint");
                inner.remove_endpoint(key);
                return;
            }
        };

        entry.generation += 1;
        entry.data.local = false;
        entry.data.tiers.clear();

        let generation = entry.generation;
        let delay = self.deletion_delay;
        let cache = self.inner.clone();
        let timer_key = key.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = cache.write();
            let expired = inner
                .endpoints
                .get(&timer_key)
                .map_or(false, |e| e.generation == generation);
            if expired {
                tracing::debug!(key = %timer_key, "Removing endpoint after deletion delay");
                inner.remove_endpoint(&timer_key);
            }
        });
        entry.pending_deletion = Some(task.abort_handle());
        tracing::debug!(%key, ?delay, "Deferring endpoint removal");
    }
}

impl UpdateHandler for EndpointLookupsCache {
    fn on_update(&mut self, update: &Update) {
        match &update.delta {
            Delta::Endpoint { key, value } => self.on_endpoint_update(key, value.as_ref()),
            Delta::HostIp { hostname, value } => self.inner.write().update_node(hostname, *value),
            Delta::NetworkSet { name, value } => {
                self.inner.write().update_network_set(name, value.as_ref())
            }
            Delta::IpPool { cidr, value } => {
                let mut inner = self.inner.write();
                match value {
                    Some(pool) => inner.ip_pools.insert(*cidr, pool.clone()),
                    None => inner.ip_pools.remove(cidr),
                };
            }
            _ => {}
        }
    }
}

// === impl Inner ===

impl Inner {
    fn upsert_endpoint(&mut self, key: &EndpointKey, endpoint: &Endpoint, local: bool) {
        let addrs = endpoint
            .ip_nets
            .iter()
            .map(|net| net.addr())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        match self.endpoints.get_mut(key) {
            Some(entry) => {
                if let Some(timer) = entry.pending_deletion.take() {
                    tracing::debug!(%key, "Endpoint recreated; cancelling removal");
                    timer.abort();
                }
                entry.generation += 1;
                for addr in std::mem::replace(&mut entry.addrs, addrs.clone()) {
                    Self::unindex(&mut self.addr_to_endpoints, addr, key);
                }
                entry.data.labels = endpoint.labels.clone();
                entry.data.profile_ids = endpoint.profile_ids.clone();
                entry.data.local = local;
            }
            None => {
                let data = EndpointData {
                    key: key.clone(),
                    labels: endpoint.labels.clone(),
                    profile_ids: endpoint.profile_ids.clone(),
                    tiers: Vec::new(),
                    local,
                };
                self.endpoints.insert(
                    key.clone(),
                    EndpointEntry {
                        data,
                        addrs: addrs.clone(),
                        generation: 0,
                        pending_deletion: None,
                    },
                );
            }
        }
        for addr in addrs {
            self.addr_to_endpoints
                .entry(addr)
                .or_default()
                .insert(key.clone());
        }
    }

    fn remove_endpoint(&mut self, key: &EndpointKey) {
        if let Some(entry) = self.endpoints.remove(key) {
            if let Some(timer) = entry.pending_deletion {
                timer.abort();
            }
            for addr in entry.addrs {
                Self::unindex(&mut self.addr_to_endpoints, addr, key);
            }
        }
    }

    fn unindex(index: &mut HashMap<IpAddr, BTreeSet<EndpointKey>>, addr: IpAddr, key: &EndpointKey) {
        if let Some(keys) = index.get_mut(&addr) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(&addr);
            }
        }
    }

    fn update_node(&mut self, name: &str, addr: Option<IpAddr>) {
        if let Some(old) = self.nodes.remove(name) {
            if let Some(names) = self.addr_to_nodes.get_mut(&old) {
                names.remove(name);
                if names.is_empty() {
                    self.addr_to_nodes.remove(&old);
                }
            }
        }
        if let Some(addr) = addr {
            self.nodes.insert(name.to_string(), addr);
            self.addr_to_nodes
                .entry(addr)
                .or_default()
                .insert(name.to_string());
        }
    }

    fn update_network_set(&mut self, name: &str, set: Option<&NetworkSet>) {
        if let Some(old) = self.network_sets.remove(name) {
            for net in old.nets.iter().map(IpNet::trunc) {
                let now_empty = match self.network_set_nets.get_mut(&net) {
                    Some(names) => {
                        names.remove(name);
                        names.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.network_set_nets.remove(&net);
                }
            }
        }
        if let Some(set) = set {
            for net in &set.nets {
                let net = net.trunc();
                match self.network_set_nets.get_mut(&net) {
                    Some(names) => {
                        names.insert(name.to_string());
                    }
                    None => {
                        self.network_set_nets
                            .insert(net, std::iter::once(name.to_string()).collect());
                    }
                }
            }
            self.network_sets.insert(name.to_string(), set.clone());
        }
    }
}

// === impl EndpointData ===

impl EndpointData {
    /// Whether the endpoint is hosted here and not pending deletion.
    pub fn is_local(&self) -> bool {
        self.local
    }
}
