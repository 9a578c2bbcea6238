//! Resolves which workload addresses sit behind each host's tunnel.
//!
//! Every host address is a tunnel endpoint, and the workloads on a host are reachable through
//! its tunnel. A binding `(tunnel, workload)` is only emitted while it is unambiguous: the
//! workload address must be claimed by exactly one workload endpoint, and that endpoint's host
//! address must be claimed by exactly one *active* host (one with at least one addressed
//! workload). Workload addresses that can't be bound are blacklisted instead, so traffic to them
//! is dropped rather than sent through the wrong tunnel.
//!
//! Host addresses and workload addresses may arrive in any order, be missing for a while, or
//! conflict transiently while objects are recreated. The resolver emits the same bindings for
//! the same final state regardless of the order in which it was reached.


use crate::dispatcher::UpdateHandler;
use ahash::AHashMap as HashMap;
use policy_graph_core::{Delta, Endpoint, TunnelBinding, Update, WorkloadEndpointKey};
use std::{collections::BTreeMap, net::IpAddr};

pub trait TunnelListener {
    fn on_tunnel_added(&mut self, addr: IpAddr);
    fn on_tunnel_removed(&mut self, addr: IpAddr);
    fn on_binding_added(&mut self, binding: TunnelBinding);
    fn on_binding_removed(&mut self, binding: TunnelBinding);
    fn on_blacklist_added(&mut self, addr: IpAddr);
    fn on_blacklist_removed(&mut self, addr: IpAddr);
}

#[derive(Debug)]
pub struct TunnelResolver<L> {
    listener: L,

    nodes: HashMap<String, NodeInfo>,
    addr_to_nodes: HashMap<IpAddr, Vec<String>>,

    workload_addrs: BTreeMap<WorkloadEndpointKey, Vec<IpAddr>>,
    addr_to_workloads: HashMap<IpAddr, Vec<WorkloadEndpointKey>>,
}

#[derive(Clone, Debug, Default)]
struct NodeInfo {
    addr: Option<IpAddr>,

    /// The number of workloads on the node with at least one address.
    workload_count: usize,
}

// === impl TunnelResolver ===

impl<L: TunnelListener> TunnelResolver<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener,
            nodes: HashMap::default(),
            addr_to_nodes: HashMap::default(),
            workload_addrs: BTreeMap::new(),
            addr_to_workloads: HashMap::default(),
        }
    }

    pub fn on_host_ip_update(&mut self, node: &str, new_addr: Option<IpAddr>) {
        let old_info = self.nodes.get(node).cloned().unwrap_or_default();
        if old_info.addr == new_addr {
            tracing::trace!(%node, ?new_addr, "Host address unchanged");
            return;
        }
        tracing::debug!(%node, old = ?old_info.addr, new = ?new_addr, "Host address changed");

        // A change is handled as a removal followed by an addition.
        if let Some(old_addr) = old_info.addr {
            let old_sharing = self.active_nodes_sharing(Some(old_addr));

            if old_info.workload_count == 0 {
                self.nodes.remove(node);
            } else {
                self.nodes.insert(
                    node.to_string(),
                    NodeInfo {
                        addr: None,
                        ..old_info.clone()
                    },
                );
            }
            let remove_tunnel = match self.addr_to_nodes.get_mut(&old_addr) {
                Some(names) => {
                    names.retain(|n| n != node);
                    names.is_empty()
                }
                None => panic!("host {node} address {old_addr} missing from the reverse index"),
            };
            if remove_tunnel {
                self.addr_to_nodes.remove(&old_addr);
            }

            let new_sharing = self.active_nodes_sharing(Some(old_addr));
            if old_sharing > 1 && new_sharing == 1 {
                tracing::debug!(%node, addr = %old_addr, "Host address is now unique to another host");
                let other = self.find_active_node(old_addr, None);
                self.activate_bindings_for_node(&other, old_addr);
            } else if old_sharing == 1 && new_sharing == 0 {
                tracing::debug!(%node, addr = %old_addr, "Host address no longer in use");
                self.deactivate_bindings_for_node(node, old_addr);
            }

            if remove_tunnel {
                self.listener.on_tunnel_removed(old_addr);
            }
        }

        if let Some(new_addr) = new_addr {
            let old_sharing = self.active_nodes_sharing(Some(new_addr));

            self.nodes.insert(
                node.to_string(),
                NodeInfo {
                    addr: Some(new_addr),
                    workload_count: old_info.workload_count,
                },
            );
            let names = self.addr_to_nodes.entry(new_addr).or_default();
            if names.is_empty() {
                self.listener.on_tunnel_added(new_addr);
            }
            names.push(node.to_string());

            let new_sharing = self.active_nodes_sharing(Some(new_addr));
            if old_sharing == 0 && new_sharing == 1 {
                tracing::debug!(%node, addr = %new_addr, "Host address is unique");
                self.activate_bindings_for_node(node, new_addr);
            } else if old_sharing == 1 && new_sharing > 1 {
                tracing::warn!(%node, addr = %new_addr, "Host address is shared with another active host; removing its bindings");
                let other = self.find_active_node(new_addr, Some(node));
                self.deactivate_bindings_for_node(&other, new_addr);
            }
        }
    }

    pub fn on_endpoint_update(&mut self, key: &WorkloadEndpointKey, endpoint: Option<&Endpoint>) {
        let old_addrs = self.workload_addrs.get(key).cloned().unwrap_or_default();
        let new_addrs = endpoint.map(Endpoint::ipv4_addrs).unwrap_or_default();
        tracing::trace!(%key, ?old_addrs, ?new_addrs, "Updating workload addresses");

        // Adding a workload's first address, or removing its last, may activate or deactivate
        // its node, changing whether the node's address is shared.
        let node = key.hostname.as_str();
        let mut info = self.nodes.get(node).cloned().unwrap_or_default();
        let node_addr = info.addr;
        let old_nodes_sharing = self.active_nodes_sharing(node_addr);

        if old_addrs.is_empty() && !new_addrs.is_empty() {
            info.workload_count += 1;
            self.nodes.insert(node.to_string(), info);
        } else if new_addrs.is_empty() && !old_addrs.is_empty() {
            info.workload_count = info
                .workload_count
                .checked_sub(1)
                .unwrap_or_else(|| panic!("workload count for host {node} dropped below zero"));
            if info.workload_count == 0 && info.addr.is_none() {
                self.nodes.remove(node);
            } else {
                self.nodes.insert(node.to_string(), info);
            }
        }

        let new_nodes_sharing = self.active_nodes_sharing(node_addr);
        if let Some(node_addr) = node_addr {
            if old_nodes_sharing == 1 && new_nodes_sharing == 2 {
                tracing::warn!(%node, addr = %node_addr, "Host became active with a shared address; removing the other host's bindings");
                let other = self.find_active_node(node_addr, Some(node));
                self.deactivate_bindings_for_node(&other, node_addr);
            } else if old_nodes_sharing == 2 && new_nodes_sharing == 1 {
                tracing::debug!(%node, addr = %node_addr, "Host became inactive; other host now owns its address");
                let other = self.find_active_node(node_addr, None);
                self.activate_bindings_for_node(&other, node_addr);
            }
        }

        let removed = old_addrs
            .iter()
            .filter(|a| !new_addrs.contains(a))
            .copied()
            .collect::<Vec<_>>();
        let added = new_addrs
            .iter()
            .filter(|a| !old_addrs.contains(a))
            .copied()
            .collect::<Vec<_>>();

        if new_addrs.is_empty() {
            self.workload_addrs.remove(key);
        } else {
            self.workload_addrs.insert(key.clone(), new_addrs);
        }

        for addr in removed {
            self.remove_workload_addr(key, addr, node_addr, old_nodes_sharing);
        }
        for addr in added {
            self.add_workload_addr(key, addr, node_addr, new_nodes_sharing);
        }
    }

    /// The number of host addresses in use as tunnel endpoints.
    pub fn tunnels_len(&self) -> usize {
        self.addr_to_nodes.len()
    }

    pub fn nodes_len(&self) -> usize {
        self.nodes.len()
    }

    pub fn workload_addrs_len(&self) -> usize {
        self.addr_to_workloads.len()
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    fn remove_workload_addr(
        &mut self,
        key: &WorkloadEndpointKey,
        addr: IpAddr,
        node_addr: Option<IpAddr>,
        old_nodes_sharing: usize,
    ) {
        if let Some(keys) = self.addr_to_workloads.get_mut(&addr) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.addr_to_workloads.remove(&addr);
            }
        }

        let remaining = self.addr_to_workloads.get(&addr).map_or(0, Vec::len);
        if remaining > 1 {
            tracing::warn!(%addr, "Workload address is still shared; unable to bind it");
            return;
        }

        if remaining == 1 {
            // The address was shared and was blacklisted. Its remaining owner may now be bound.
            let other = self.addr_to_workloads[&addr][0].hostname.clone();
            let Some(other_addr) = self.nodes.get(&other).and_then(|n| n.addr) else {
                tracing::warn!(node = %other, "Missing host address; unable to bind workloads on that host");
                return;
            };
            if self.active_nodes_sharing(Some(other_addr)) != 1 {
                tracing::warn!(node = %other, addr = %other_addr, "Host address is not unique; unable to bind workloads on that host");
                return;
            }
            self.listener.on_blacklist_removed(addr);
            self.listener.on_binding_added(TunnelBinding {
                tunnel_addr: other_addr,
                workload_addr: addr,
            });
            return;
        }

        // The address was unique. It was bound only if the node's address was unique too.
        match (old_nodes_sharing, node_addr) {
            (1, Some(tunnel_addr)) => self.listener.on_binding_removed(TunnelBinding {
                tunnel_addr,
                workload_addr: addr,
            }),
            _ => {
                tracing::debug!(%addr, ?node_addr, "Removing address of a workload whose host address was missing or shared");
                self.listener.on_blacklist_removed(addr);
            }
        }
    }

    fn add_workload_addr(
        &mut self,
        key: &WorkloadEndpointKey,
        addr: IpAddr,
        node_addr: Option<IpAddr>,
        new_nodes_sharing: usize,
    ) {
        let existing = self.addr_to_workloads.get(&addr).map_or(0, Vec::len);
        if existing == 1 {
            // The address had a unique owner whose binding is now ambiguous.
            let other = self.addr_to_workloads[&addr][0].hostname.clone();
            if let Some(other_addr) = self.nodes.get(&other).and_then(|n| n.addr) {
                if self.active_nodes_sharing(Some(other_addr)) == 1 {
                    tracing::warn!(%addr, "Workload address now claimed by multiple workloads; unable to bind it");
                    self.listener.on_binding_removed(TunnelBinding {
                        tunnel_addr: other_addr,
                        workload_addr: addr,
                    });
                    self.listener.on_blacklist_added(addr);
                }
            }
        }

        self.addr_to_workloads
            .entry(addr)
            .or_default()
            .push(key.clone());

        if existing != 0 {
            tracing::warn!(%addr, "Workload address is not unique; unable to bind it");
            return;
        }

        match (new_nodes_sharing, node_addr) {
            (1, Some(tunnel_addr)) => self.listener.on_binding_added(TunnelBinding {
                tunnel_addr,
                workload_addr: addr,
            }),
            _ => {
                tracing::debug!(%addr, ?node_addr, node = %key.hostname, "Host address missing or shared; unable to bind workload");
                self.listener.on_blacklist_added(addr);
            }
        }
    }

    /// Counts the active nodes claiming an address.
    ///
    /// # Panics
    ///
    /// If the node and address indexes disagree.
    fn active_nodes_sharing(&self, addr: Option<IpAddr>) -> usize {
        let Some(addr) = addr else {
            return 0;
        };
        let mut count = 0;
        for name in self.addr_to_nodes.get(&addr).into_iter().flatten() {
            let info = self.nodes.get(name);
            if info.and_then(|i| i.addr) != Some(addr) {
                panic!(
                    "node index disagrees with address index: {name} should have address {addr}, has {:?}",
                    info.and_then(|i| i.addr)
                );
            }
            if info.map_or(false, |i| i.workload_count > 0) {
                count += 1;
            }
        }
        count
    }

    /// Finds an active node claiming the address, other than `except`.
    ///
    /// # Panics
    ///
    /// If there is none; callers only look for nodes they have just counted.
    fn find_active_node(&self, addr: IpAddr, except: Option<&str>) -> String {
        self.addr_to_nodes
            .get(&addr)
            .into_iter()
            .flatten()
            .find(|name| {
                Some(name.as_str()) != except
                    && self.nodes.get(*name).map_or(false, |i| i.workload_count > 0)
            })
            .cloned()
            .unwrap_or_else(|| panic!("no active node found for address {addr}"))
    }

    fn activate_bindings_for_node(&mut self, node: &str, node_addr: IpAddr) {
        for (key, addrs) in &self.workload_addrs {
            if key.hostname != node {
                continue;
            }
            for addr in addrs {
                if self.addr_to_workloads.get(addr).map_or(0, Vec::len) != 1 {
                    continue;
                }
                self.listener.on_blacklist_removed(*addr);
                self.listener.on_binding_added(TunnelBinding {
                    tunnel_addr: node_addr,
                    workload_addr: *addr,
                });
            }
        }
    }

    fn deactivate_bindings_for_node(&mut self, node: &str, node_addr: IpAddr) {
        for (key, addrs) in &self.workload_addrs {
            if key.hostname != node {
                continue;
            }
            for addr in addrs {
                if self.addr_to_workloads.get(addr).map_or(0, Vec::len) != 1 {
                    continue;
                }
                self.listener.on_binding_removed(TunnelBinding {
                    tunnel_addr: node_addr,
                    workload_addr: *addr,
                });
                self.listener.on_blacklist_added(*addr);
            }
        }
    }
}

impl<L: TunnelListener> UpdateHandler for TunnelResolver<L> {
    fn on_update(&mut self, update: &Update) {
        match &update.delta {
            Delta::HostIp { hostname, value } => self.on_host_ip_update(hostname, *value),
            Delta::Endpoint { key, value } => {
                if let Some(key) = key.as_workload() {
                    self.on_endpoint_update(key, value.as_ref());
                }
            }
            _ => {}
        }
    }
}
