//! Ref-counted IP sets keyed by selector.
//!
//! Each owner (an endpoint's rule slot, say) may assign at most one selector. An IP set exists
//! for each selector with at least one owner: it becomes active when its first owner is assigned
//! and inactive when its last owner is released. Selectors that are equal after normalization
//! share a set.

use ahash::AHashMap as HashMap;
use policy_graph_core::Selector;
use serde::Serialize;
use std::{fmt, hash::Hash};

/// Receives IP set lifecycle notifications.
pub trait IpSetListener {
    fn on_ip_set_active(&mut self, ip_set: &IpSetData);
    fn on_ip_set_inactive(&mut self, ip_set: &IpSetData);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpSetKind {
    /// Holds the addresses of egress gateways.
    EgressGateway,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IpSetData {
    pub id: String,
    pub selector: Selector,
    pub kind: IpSetKind,
}

#[derive(Debug)]
pub struct SelectorIpSets<O> {
    kind: IpSetKind,
    assignments: HashMap<O, Selector>,
    sets: HashMap<Selector, RefCounted>,
}

#[derive(Debug)]
struct RefCounted {
    ip_set: IpSetData,
    refs: usize,
}

// === impl IpSetKind ===

impl IpSetKind {
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::EgressGateway => "e",
        }
    }

    pub fn ip_set_id(&self, selector: &Selector) -> String {
        selector.unique_id(self.id_prefix())
    }
}

// === impl SelectorIpSets ===

impl<O: Hash + Eq + Clone + fmt::Debug> SelectorIpSets<O> {
    pub fn new(kind: IpSetKind) -> Self {
        Self {
            kind,
            assignments: HashMap::default(),
            sets: HashMap::default(),
        }
    }

    /// Assigns (or, with `None`, releases) the owner's selector. Reassigning the current
    /// selector does nothing.
    pub fn assign(
        &mut self,
        owner: O,
        selector: Option<Selector>,
        listener: &mut impl IpSetListener,
    ) {
        self.assign_all(std::iter::once((owner, selector)), listener)
    }

    /// Applies a batch of assignments.
    ///
    /// Sets that lose their last owner are deactivated before newly-referenced sets are
    /// activated, and a selector that moves between owners within the batch stays active
    /// throughout.
    pub fn assign_all(
        &mut self,
        assignments: impl IntoIterator<Item = (O, Option<Selector>)>,
        listener: &mut impl IpSetListener,
    ) {
        let mut released = Vec::new();
        let mut activating = Vec::new();
        for (owner, selector) in assignments {
            if self.assignments.get(&owner) == selector.as_ref() {
                continue;
            }

            let old = match selector.clone() {
                Some(sel) => self.assignments.insert(owner, sel),
                None => self.assignments.remove(&owner),
            };
            released.extend(old);

            if let Some(new) = selector {
                if self.ref_count(&new) > 0 {
                    self.reference(new, listener);
                } else {
                    activating.push(new);
                }
            }
        }

        for old in released {
            self.release(&old, listener);
        }
        for new in activating {
            self.reference(new, listener);
        }
    }

    pub fn assignment(&self, owner: &O) -> Option<&Selector> {
        self.assignments.get(owner)
    }

    pub fn ref_count(&self, selector: &Selector) -> usize {
        self.sets.get(selector).map_or(0, |s| s.refs)
    }

    pub fn ip_set(&self, selector: &Selector) -> Option<&IpSetData> {
        self.sets.get(selector).map(|s| &s.ip_set)
    }

    /// The number of active IP sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    fn reference(&mut self, selector: Selector, listener: &mut impl IpSetListener) {
        let kind = self.kind;
        let set = self.sets.entry(selector).or_insert_with_key(|sel| RefCounted {
            ip_set: IpSetData {
                id: kind.ip_set_id(sel),
                selector: sel.clone(),
                kind,
            },
            refs: 0,
        });
        set.refs += 1;
        if set.refs == 1 {
            tracing::debug!(id = %set.ip_set.id, selector = %set.ip_set.selector, "IP set active");
            listener.on_ip_set_active(&set.ip_set);
        }
    }

    fn release(&mut self, selector: &Selector, listener: &mut impl IpSetListener) {
        let Some(set) = self.sets.get_mut(selector) else {
            panic!("released selector {selector} has no references");
        };
        set.refs -= 1;
        if set.refs > 0 {
            return;
        }
        if let Some(set) = self.sets.remove(selector) {
            tracing::debug!(id = %set.ip_set.id, selector = %set.ip_set.selector, "IP set inactive");
            listener.on_ip_set_inactive(&set.ip_set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Vec<(bool, String)>,
        active: BTreeMap<String, i32>,
    }

    impl IpSetListener for Recorder {
        fn on_ip_set_active(&mut self, ip_set: &IpSetData) {
            self.events.push((true, ip_set.selector.to_string()));
            *self.active.entry(ip_set.id.clone()).or_default() += 1;
        }

        fn on_ip_set_inactive(&mut self, ip_set: &IpSetData) {
            self.events.push((false, ip_set.selector.to_string()));
            *self.active.entry(ip_set.id.clone()).or_default() -= 1;
        }
    }

    fn sel(s: &str) -> Selector {
        s.parse().unwrap()
    }

    #[test]
    fn shares_sets_between_owners() {
        let mut sets = SelectorIpSets::new(IpSetKind::EgressGateway);
        let mut rec = Recorder::default();

        sets.assign("a", Some(sel("egress == 'gw'")), &mut rec);
        sets.assign("b", Some(sel(r#"egress=="gw""#)), &mut rec);
        assert_eq!(rec.events, vec![(true, r#"egress == "gw""#.to_string())]);
        assert_eq!(sets.ref_count(&sel("egress == 'gw'")), 2);
        assert_eq!(sets.len(), 1);

        sets.assign("a", None, &mut rec);
        assert_eq!(rec.events.len(), 1);
        sets.assign("b", None, &mut rec);
        assert_eq!(
            rec.events.last(),
            Some(&(false, r#"egress == "gw""#.to_string()))
        );
        assert!(sets.is_empty());
    }

    #[test]
    fn releases_before_referencing() {
        let mut sets = SelectorIpSets::new(IpSetKind::EgressGateway);
        let mut rec = Recorder::default();

        sets.assign("a", Some(sel("has(x)")), &mut rec);
        sets.assign("a", Some(sel("has(y)")), &mut rec);
        assert_eq!(
            rec.events,
            vec![
                (true, "has(x)".to_string()),
                (false, "has(x)".to_string()),
                (true, "has(y)".to_string()),
            ]
        );
        assert_eq!(sets.assignment(&"a"), Some(&sel("has(y)")));
    }

    #[test]
    fn batches_deactivate_first_without_flapping() {
        let mut sets = SelectorIpSets::new(IpSetKind::EgressGateway);
        let mut rec = Recorder::default();
        sets.assign_all(
            [(0, Some(sel("has(a)"))), (1, Some(sel("has(b)")))],
            &mut rec,
        );
        rec.events.clear();

        // has(a) moves from slot 0 to slot 1; has(b) is dropped; has(c) is new.
        sets.assign_all(
            [(0, Some(sel("has(c)"))), (1, Some(sel("has(a)")))],
            &mut rec,
        );
        assert_eq!(
            rec.events,
            vec![(false, "has(b)".to_string()), (true, "has(c)".to_string())]
        );
        assert_eq!(sets.ref_count(&sel("has(a)")), 1);
        assert_eq!(sets.len(), 2);
    }

    #[test]
    fn reassignment_is_a_noop() {
        let mut sets = SelectorIpSets::new(IpSetKind::EgressGateway);
        let mut rec = Recorder::default();
        sets.assign("a", Some(sel("has(x)")), &mut rec);
        sets.assign("a", Some(sel("has( x )")), &mut rec);
        sets.assign("b", None, &mut rec);
        assert_eq!(rec.events.len(), 1);
        assert_eq!(sets.ref_count(&sel("has(x)")), 1);
    }

    #[test]
    fn ids_carry_kind_prefix() {
        let mut sets = SelectorIpSets::new(IpSetKind::EgressGateway);
        let mut rec = Recorder::default();
        sets.assign(1, Some(sel("has(x)")), &mut rec);
        let set = sets.ip_set(&sel("has(x)")).unwrap();
        assert!(set.id.starts_with("e:"));
        assert_eq!(set.id, sel("has(x)").unique_id("e"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Every set is active exactly while its selector has owners, and the reference count
        /// always equals the number of owners assigned to it.
        #[test]
        fn ref_counts_are_conserved(
            ops in prop::collection::vec((0..6u8, prop::option::of(0..4usize)), 1..64),
        ) {
            const SELECTORS: [&str; 4] = ["has(a)", "has(b)", "a == 'x'", "a in {'x'}"];

            let mut sets = SelectorIpSets::new(IpSetKind::EgressGateway);
            let mut rec = Recorder::default();
            let mut model = BTreeMap::<u8, Selector>::new();

            for (owner, choice) in ops {
                let selector = choice.map(|i| sel(SELECTORS[i]));
                match &selector {
                    Some(s) => { model.insert(owner, s.clone()); }
                    None => { model.remove(&owner); }
                }
                sets.assign(owner, selector, &mut rec);

                for s in SELECTORS.iter().map(|s| sel(s)) {
                    let owners = model.values().filter(|m| **m == s).count();
                    prop_assert_eq!(sets.ref_count(&s), owners);
                    let active = rec.active.get(&IpSetKind::EgressGateway.ip_set_id(&s)).copied().unwrap_or(0);
                    prop_assert_eq!(active, i32::from(owners > 0));
                }
            }
        }
    }
}
