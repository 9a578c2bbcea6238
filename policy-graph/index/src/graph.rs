//! Wires the resolvers into a single calculation graph.
//!
//! Updates are delivered to every interested resolver through a [`Dispatcher`]. Resolvers never
//! call one another: their callbacks land on a shared queue, and the graph pumps that queue,
//! routing each internal event to the resolver that consumes it, until it drains. Only then is
//! the policy resolver flushed, so an endpoint is published once per update with its final state.


use crate::{
    dispatcher::{Dispatcher, LocalEndpoints, SharedHandler},
    egress::{EgressListener, EgressSelectorResolver},
    ip_sets::{IpSetData, IpSetListener},
    labels::{LabelIndex, MatchListener, SelectorId},
    lookup::EndpointLookupsCache,
    policy::{PolicyResolver, PolicyResolverListener},
    tunnel::{TunnelListener, TunnelResolver},
    Config,
};
use parking_lot::{Mutex, RwLock};
use policy_graph_core::{
    policy::TierInfo, DeltaKind, Endpoint, EndpointEgressData, EndpointKey, Selector, SyncStatus,
    TunnelBinding, Update,
};
use serde::Serialize;
use std::{collections::VecDeque, net::IpAddr, sync::Arc};

pub type SharedGraph = Arc<RwLock<CalcGraph>>;

/// Derived state emitted by the graph.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    IpSetActive {
        id: String,
        selector: Selector,
    },
    IpSetInactive {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    EndpointTierUpdate {
        key: EndpointKey,
        endpoint: Option<Endpoint>,
        egress: EndpointEgressData,
        tiers: Vec<TierInfo>,
    },
    TunnelAdded {
        addr: IpAddr,
    },
    TunnelRemoved {
        addr: IpAddr,
    },
    BindingAdded {
        binding: TunnelBinding,
    },
    BindingRemoved {
        binding: TunnelBinding,
    },
    BlacklistAdded {
        addr: IpAddr,
    },
    BlacklistRemoved {
        addr: IpAddr,
    },
}

pub struct CalcGraph {
    hostname: String,
    dispatcher: Dispatcher,
    queue: EventQueue,

    labels: Arc<RwLock<LabelIndex<EventQueue>>>,
    egress: Arc<RwLock<EgressSelectorResolver<EventQueue>>>,
    policies: Arc<RwLock<PolicyResolver<EventQueue>>>,
    tunnels: Arc<RwLock<TunnelResolver<EventQueue>>>,
    lookups: EndpointLookupsCache,

    bindings: usize,
    blacklisted: usize,
}

/// Point-in-time sizes of the graph's indexes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub local_endpoints: usize,
    pub active_ip_sets: usize,
    pub selectors: usize,
    pub tiers: usize,
    pub policies: usize,
    pub tunnel_nodes: usize,
    pub bindings: usize,
    pub blacklisted: usize,
    pub lookup_entries: usize,
}

/// Collects resolver callbacks for the graph to route.
#[derive(Clone, Debug, Default)]
struct EventQueue(Arc<Mutex<VecDeque<Internal>>>);

#[derive(Debug)]
enum Internal {
    IpSetActive(IpSetData),
    IpSetInactive(IpSetData),
    EgressData(EndpointKey, EndpointEgressData),
    Match(SelectorId, EndpointKey),
    Unmatch(SelectorId, EndpointKey),
    Output(Event),
}

// === impl CalcGraph ===

impl CalcGraph {
    pub fn new(config: &Config) -> Self {
        let queue = EventQueue::default();
        let labels = Arc::new(RwLock::new(LabelIndex::new(queue.clone())));
        let egress = Arc::new(RwLock::new(EgressSelectorResolver::new(queue.clone())));
        let policies = Arc::new(RwLock::new(PolicyResolver::new(
            &config.health_port_name,
            queue.clone(),
        )));
        let tunnels = Arc::new(RwLock::new(TunnelResolver::new(queue.clone())));
        let lookups =
            EndpointLookupsCache::new(config.hostname.as_str(), config.endpoint_deletion_delay);

        let lookups_handler: SharedHandler = Arc::new(RwLock::new(lookups.clone()));
        let local_egress: SharedHandler = Arc::new(RwLock::new(LocalEndpoints::new(
            &config.hostname,
            egress.clone(),
        )));
        let local_policies: SharedHandler = Arc::new(RwLock::new(LocalEndpoints::new(
            &config.hostname,
            policies.clone(),
        )));

        let mut dispatcher = Dispatcher::default();
        dispatcher.register(DeltaKind::Endpoint, lookups_handler.clone());
        dispatcher.register(DeltaKind::Endpoint, labels.clone());
        dispatcher.register(DeltaKind::Endpoint, tunnels.clone());
        dispatcher.register(DeltaKind::Endpoint, local_egress);
        dispatcher.register(DeltaKind::Endpoint, local_policies);

        dispatcher.register(DeltaKind::Profile, egress.clone());
        dispatcher.register(DeltaKind::EgressGatewayPolicy, egress.clone());

        dispatcher.register(DeltaKind::Tier, policies.clone());
        dispatcher.register(DeltaKind::Policy, labels.clone());
        dispatcher.register(DeltaKind::Policy, policies.clone());

        dispatcher.register(DeltaKind::HostIp, lookups_handler.clone());
        dispatcher.register(DeltaKind::HostIp, tunnels.clone());
        dispatcher.register(DeltaKind::NetworkSet, lookups_handler.clone());
        dispatcher.register(DeltaKind::IpPool, lookups_handler);

        dispatcher.register_status(policies.clone());

        Self {
            hostname: config.hostname.clone(),
            dispatcher,
            queue,
            labels,
            egress,
            policies,
            tunnels,
            lookups,
            bindings: 0,
            blacklisted: 0,
        }
    }

    /// Applies an update, returning the events it produced in emission order.
    pub fn on_update(&mut self, update: &Update) -> Vec<Event> {
        tracing::trace!(kind = ?update.kind(), change = ?update.change, "Processing update");
        self.dispatcher.deliver(update);
        self.settle()
    }

    pub fn on_status(&mut self, status: SyncStatus) -> Vec<Event> {
        self.dispatcher.on_status(status);
        self.settle()
    }

    /// A handle to the lookup cache, which remains valid as the graph changes.
    pub fn lookups(&self) -> EndpointLookupsCache {
        self.lookups.clone()
    }

    pub fn stats(&self) -> GraphStats {
        let policies = self.policies.read();
        GraphStats {
            local_endpoints: policies.endpoints_len(),
            active_ip_sets: self.egress.read().active_ip_sets(),
            selectors: self.labels.read().selectors_len(),
            tiers: policies.tiers_len(),
            policies: policies.policies_len(),
            tunnel_nodes: self.tunnels.read().nodes_len(),
            bindings: self.bindings,
            blacklisted: self.blacklisted,
            lookup_entries: self.lookups.endpoints_len(),
        }
    }

    fn settle(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        self.pump(&mut events);
        self.policies.write().flush();
        self.pump(&mut events);
        events
    }

    fn pump(&mut self, events: &mut Vec<Event>) {
        while let Some(internal) = self.queue.pop() {
            match internal {
                Internal::IpSetActive(ip_set) => {
                    events.push(Event::IpSetActive {
                        id: ip_set.id.clone(),
                        selector: ip_set.selector.clone(),
                    });
                    self.labels
                        .write()
                        .update_selector(SelectorId::IpSet(ip_set.id), ip_set.selector);
                }

                Internal::IpSetInactive(ip_set) => {
                    events.push(Event::IpSetInactive {
                        id: ip_set.id.clone(),
                    });
                    self.labels
                        .write()
                        .delete_selector(&SelectorId::IpSet(ip_set.id));
                }

                Internal::EgressData(key, data) => {
                    self.policies
                        .write()
                        .on_endpoint_egress_data_update(&key, data);
                }

                Internal::Match(id, key) => {
                    if key.hostname() != self.hostname {
                        continue;
                    }
                    let mut policies = self.policies.write();
                    match id {
                        SelectorId::Policy(policy) => policies.on_policy_match(policy, key),
                        SelectorId::IpSet(_) => policies.on_egress_gateway_match(&key),
                    }
                }

                Internal::Unmatch(id, key) => {
                    if key.hostname() != self.hostname {
                        continue;
                    }
                    let mut policies = self.policies.write();
                    match id {
                        SelectorId::Policy(policy) => policies.on_policy_unmatch(&policy, &key),
                        SelectorId::IpSet(_) => policies.on_egress_gateway_unmatch(&key),
                    }
                }

                Internal::Output(event) => {
                    match &event {
                        Event::EndpointTierUpdate {
                            key,
                            endpoint: Some(_),
                            tiers,
                            ..
                        } => self.lookups.on_endpoint_tiers(key, tiers),
                        Event::BindingAdded { .. } => self.bindings += 1,
                        Event::BindingRemoved { .. } => self.bindings -= 1,
                        Event::BlacklistAdded { .. } => self.blacklisted += 1,
                        Event::BlacklistRemoved { .. } => self.blacklisted -= 1,
                        _ => {}
                    }
                    events.push(event);
                }
            }
        }
    }
}

impl std::fmt::Debug for CalcGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalcGraph")
            .field("hostname", &self.hostname)
            .field("dispatcher", &self.dispatcher)
            .field("stats", &self.stats())
            .finish()
    }
}

// === impl EventQueue ===

impl EventQueue {
    fn push(&self, event: Internal) {
        self.0.lock().push_back(event);
    }

    fn pop(&self) -> Option<Internal> {
        self.0.lock().pop_front()
    }

    fn output(&self, event: Event) {
        self.push(Internal::Output(event));
    }
}

impl IpSetListener for EventQueue {
    fn on_ip_set_active(&mut self, ip_set: &IpSetData) {
        self.push(Internal::IpSetActive(ip_set.clone()));
    }

    fn on_ip_set_inactive(&mut self, ip_set: &IpSetData) {
        self.push(Internal::IpSetInactive(ip_set.clone()));
    }
}

impl EgressListener for EventQueue {
    fn on_endpoint_egress_data_update(&mut self, key: &EndpointKey, data: &EndpointEgressData) {
        self.push(Internal::EgressData(key.clone(), data.clone()));
    }
}

impl MatchListener for EventQueue {
    fn on_match(&mut self, selector: &SelectorId, endpoint: &EndpointKey) {
        self.push(Internal::Match(selector.clone(), endpoint.clone()));
    }

    fn on_unmatch(&mut self, selector: &SelectorId, endpoint: &EndpointKey) {
        self.push(Internal::Unmatch(selector.clone(), endpoint.clone()));
    }
}

impl PolicyResolverListener for EventQueue {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Endpoint>,
        egress: &EndpointEgressData,
        tiers: &[TierInfo],
    ) {
        self.output(Event::EndpointTierUpdate {
            key: key.clone(),
            endpoint: endpoint.cloned(),
            egress: egress.clone(),
            tiers: tiers.to_vec(),
        });
    }
}

impl TunnelListener for EventQueue {
    fn on_tunnel_added(&mut self, addr: IpAddr) {
        self.output(Event::TunnelAdded { addr });
    }

    fn on_tunnel_removed(&mut self, addr: IpAddr) {
        self.output(Event::TunnelRemoved { addr });
    }

    fn on_binding_added(&mut self, binding: TunnelBinding) {
        self.output(Event::BindingAdded { binding });
    }

    fn on_binding_removed(&mut self, binding: TunnelBinding) {
        self.output(Event::BindingRemoved { binding });
    }

    fn on_blacklist_added(&mut self, addr: IpAddr) {
        self.output(Event::BlacklistAdded { addr });
    }

    fn on_blacklist_removed(&mut self, addr: IpAddr) {
        self.output(Event::BlacklistRemoved { addr });
    }
}
