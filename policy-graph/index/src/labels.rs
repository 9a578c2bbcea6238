//! Matches selectors against endpoint labels.
//!
//! The index evaluates every selector against every endpoint, reporting only transitions: a
//! listener hears `on_match` when a (selector, endpoint) pair starts matching and `on_unmatch`
//! when it stops.

use crate::{dispatcher::UpdateHandler, multimap::BiMultiMap};
use policy_graph_core::{Delta, EndpointKey, Labels, PolicyKey, Selector, Update};
use std::collections::BTreeMap;

/// Identifies a selector registered with the index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SelectorId {
    /// A policy's endpoint selector.
    Policy(PolicyKey),

    /// The selector backing an IP set.
    IpSet(String),
}

pub trait MatchListener {
    fn on_match(&mut self, selector: &SelectorId, endpoint: &EndpointKey);
    fn on_unmatch(&mut self, selector: &SelectorId, endpoint: &EndpointKey);
}

#[derive(Debug)]
pub struct LabelIndex<L> {
    listener: L,
    selectors: BTreeMap<SelectorId, Selector>,
    endpoints: BTreeMap<EndpointKey, Labels>,
    matches: BiMultiMap<SelectorId, EndpointKey>,
}

// === impl LabelIndex ===

impl<L: MatchListener> LabelIndex<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener,
            selectors: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            matches: BiMultiMap::default(),
        }
    }

    pub fn update_selector(&mut self, id: SelectorId, selector: Selector) {
        if self.selectors.get(&id) == Some(&selector) {
            return;
        }
        tracing::trace!(?id, %selector, "Updating selector");
        for (key, labels) in &self.endpoints {
            let matches = selector.matches(labels);
            Self::transition(&mut self.matches, &mut self.listener, &id, key, matches);
        }
        self.selectors.insert(id, selector);
    }

    pub fn delete_selector(&mut self, id: &SelectorId) {
        if self.selectors.remove(id).is_none() {
            return;
        }
        tracing::trace!(?id, "Deleting selector");
        let mut keys = self.matches.get_by_left(id).cloned().collect::<Vec<_>>();
        keys.sort();
        for key in keys {
            Self::transition(&mut self.matches, &mut self.listener, id, &key, false);
        }
    }

    pub fn update_labels(&mut self, key: EndpointKey, labels: Labels) {
        if self.endpoints.get(&key) == Some(&labels) {
            return;
        }
        for (id, selector) in &self.selectors {
            let matches = selector.matches(&labels);
            Self::transition(&mut self.matches, &mut self.listener, id, &key, matches);
        }
        self.endpoints.insert(key, labels);
    }

    pub fn delete_labels(&mut self, key: &EndpointKey) {
        if self.endpoints.remove(key).is_none() {
            return;
        }
        let mut ids = self.matches.get_by_right(key).cloned().collect::<Vec<_>>();
        ids.sort();
        for id in ids {
            Self::transition(&mut self.matches, &mut self.listener, &id, key, false);
        }
    }

    pub fn selectors_len(&self) -> usize {
        self.selectors.len()
    }

    pub fn endpoints_len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    fn transition(
        index: &mut BiMultiMap<SelectorId, EndpointKey>,
        listener: &mut L,
        id: &SelectorId,
        key: &EndpointKey,
        matches: bool,
    ) {
        if matches {
            if index.insert(id.clone(), key.clone()) {
                listener.on_match(id, key);
            }
        } else if index.remove(id, key) {
            listener.on_unmatch(id, key);
        }
    }
}

impl<L: MatchListener> UpdateHandler for LabelIndex<L> {
    fn on_update(&mut self, update: &Update) {
        match &update.delta {
            Delta::Endpoint { key, value } => match value {
                Some(ep) => self.update_labels(key.clone(), ep.labels.clone()),
                None => self.delete_labels(key),
            },

            Delta::Policy { key, value } => match value {
                Some(policy) => {
                    let selector = if policy.selector.trim().is_empty() {
                        Selector::all()
                    } else {
                        Selector::parse(&policy.selector).unwrap_or_else(|error| {
                            panic!("invalid selector for policy {key}: {error}")
                        })
                    };
                    self.update_selector(SelectorId::Policy(key.clone()), selector);
                }
                None => self.delete_selector(&SelectorId::Policy(key.clone())),
            },

            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_graph_core::{Endpoint, Policy, WorkloadEndpointKey};

    #[derive(Debug, Default)]
    struct Matches(Vec<(bool, SelectorId, EndpointKey)>);

    impl MatchListener for Matches {
        fn on_match(&mut self, selector: &SelectorId, endpoint: &EndpointKey) {
            self.0.push((true, selector.clone(), endpoint.clone()));
        }

        fn on_unmatch(&mut self, selector: &SelectorId, endpoint: &EndpointKey) {
            self.0.push((false, selector.clone(), endpoint.clone()));
        }
    }

    fn key(name: &str) -> EndpointKey {
        WorkloadEndpointKey::new("node1", "k8s", name, "eth0").into()
    }

    fn ip_set(id: &str) -> SelectorId {
        SelectorId::IpSet(id.to_string())
    }

    fn take(index: &mut LabelIndex<Matches>) -> Vec<(bool, SelectorId, EndpointKey)> {
        std::mem::take(&mut index.listener_mut().0)
    }

    #[test]
    fn reports_transitions_only() {
        let mut index = LabelIndex::new(Matches::default());
        index.update_labels(key("a"), [("role", "gw")].into_iter().collect());
        index.update_labels(key("b"), [("role", "web")].into_iter().collect());
        assert!(take(&mut index).is_empty());

        index.update_selector(ip_set("gw"), "role == 'gw'".parse().unwrap());
        assert_eq!(take(&mut index), vec![(true, ip_set("gw"), key("a"))]);

        // Same labels again: no change.
        index.update_labels(key("a"), [("role", "gw")].into_iter().collect());
        assert!(take(&mut index).is_empty());

        index.update_labels(key("b"), [("role", "gw")].into_iter().collect());
        index.update_labels(key("a"), [("role", "web")].into_iter().collect());
        assert_eq!(
            take(&mut index),
            vec![
                (true, ip_set("gw"), key("b")),
                (false, ip_set("gw"), key("a")),
            ]
        );

        index.update_selector(ip_set("gw"), "has(role)".parse().unwrap());
        assert_eq!(take(&mut index), vec![(true, ip_set("gw"), key("a"))]);

        index.delete_labels(&key("b"));
        assert_eq!(take(&mut index), vec![(false, ip_set("gw"), key("b"))]);

        index.delete_selector(&ip_set("gw"));
        assert_eq!(take(&mut index), vec![(false, ip_set("gw"), key("a"))]);
        assert_eq!(index.selectors_len(), 0);
        assert_eq!(index.endpoints_len(), 1);
    }

    #[test]
    fn handles_policy_and_endpoint_updates() {
        let mut index = LabelIndex::new(Matches::default());
        let pol = PolicyKey::new("default", "allow-web");

        index.on_update(&Update::policy(
            pol.clone(),
            Some(Policy {
                selector: "app == 'web'".to_string(),
                ..Policy::default()
            }),
        ));
        index.on_update(&Update::endpoint(
            key("a"),
            Some(Endpoint {
                labels: [("app", "web")].into_iter().collect(),
                ..Endpoint::default()
            }),
        ));
        assert_eq!(
            take(&mut index),
            vec![(true, SelectorId::Policy(pol.clone()), key("a"))]
        );

        index.on_update(&Update::endpoint(key("a"), None));
        assert_eq!(
            take(&mut index),
            vec![(false, SelectorId::Policy(pol.clone()), key("a"))]
        );

        // An empty selector selects everything.
        index.on_update(&Update::endpoint(key("b"), Some(Endpoint::default())));
        index.on_update(&Update::policy(pol.clone(), Some(Policy::default())));
        assert_eq!(
            take(&mut index),
            vec![(true, SelectorId::Policy(pol.clone()), key("b"))]
        );

        index.on_update(&Update::policy(pol.clone(), None));
        assert_eq!(
            take(&mut index),
            vec![(false, SelectorId::Policy(pol), key("b"))]
        );
    }
}
