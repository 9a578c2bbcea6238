use super::*;
use crate::ip_sets::IpSetData;
use policy_graph_core::{
    egress::{EgressGateway, EgressGatewayRule},
    WorkloadEndpointKey,
};
use std::collections::VecDeque;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Cb {
    Active(String),
    Inactive(String),
    Egress(EndpointKey, EndpointEgressData),
}

#[derive(Debug, Default)]
struct Callbacks(VecDeque<Cb>);

impl IpSetListener for Callbacks {
    fn on_ip_set_active(&mut self, ip_set: &IpSetData) {
        self.0.push_back(Cb::Active(ip_set.id.clone()));
    }

    fn on_ip_set_inactive(&mut self, ip_set: &IpSetData) {
        self.0.push_back(Cb::Inactive(ip_set.id.clone()));
    }
}

impl EgressListener for Callbacks {
    fn on_endpoint_egress_data_update(&mut self, key: &EndpointKey, data: &EndpointEgressData) {
        self.0.push_back(Cb::Egress(key.clone(), data.clone()));
    }
}

struct Test {
    resolver: EgressSelectorResolver<Callbacks>,
}

impl Test {
    fn new() -> Self {
        Self {
            resolver: EgressSelectorResolver::new(Callbacks::default()),
        }
    }

    fn update(&mut self, update: Update) {
        self.resolver.on_update(&update);
    }

    fn next(&mut self) -> Option<Cb> {
        self.resolver.listener_mut().0.pop_front()
    }

    #[track_caller]
    fn expect_active(&mut self) -> String {
        match self.next() {
            Some(Cb::Active(id)) => {
                assert!(id.starts_with("e:"), "unexpected IP set ID {id}");
                id
            }
            cb => panic!("expected an active IP set, got {cb:?}"),
        }
    }

    #[track_caller]
    fn expect_inactive(&mut self, id: &str) {
        assert_eq!(self.next(), Some(Cb::Inactive(id.to_string())));
    }

    #[track_caller]
    fn expect_egress(&mut self, key: &EndpointKey, data: EndpointEgressData) {
        assert_eq!(self.next(), Some(Cb::Egress(key.clone(), data)));
    }

    #[track_caller]
    fn expect_no_more(&mut self) {
        assert_eq!(self.next(), None);
    }
}

fn key(workload: &str) -> EndpointKey {
    WorkloadEndpointKey::new("node1", "k8s", workload, "eth0").into()
}

fn endpoint(egress: Option<EgressSpec>, profiles: &[&str]) -> Endpoint {
    Endpoint {
        name: "eth0".to_string(),
        egress,
        profile_ids: profiles.iter().map(|p| p.to_string()).collect(),
        ..Endpoint::default()
    }
}

fn with_selector(selector: &str) -> Option<EgressSpec> {
    Some(EgressSpec::from_selector(selector))
}

fn profile(selector: &str) -> Option<Profile> {
    Some(Profile {
        egress: with_selector(selector),
    })
}

fn ip_set(id: &str) -> EndpointEgressData {
    EndpointEgressData {
        ip_set_id: Some(id.to_string()),
        ..Default::default()
    }
}

#[test]
fn single_endpoint_lifecycle() {
    let mut test = Test::new();
    let we1 = key("we1");

    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(with_selector("black == 'white'"), &[])),
    ));
    let id1 = test.expect_active();
    test.expect_egress(&we1, ip_set(&id1));
    test.expect_no_more();

    // The old set is released before the new one becomes active.
    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(with_selector("black == 'red'"), &[])),
    ));
    test.expect_inactive(&id1);
    let id2 = test.expect_active();
    test.expect_egress(&we1, ip_set(&id2));
    test.expect_no_more();
    assert_ne!(id1, id2);

    test.update(Update::endpoint(we1.clone(), None));
    test.expect_inactive(&id2);
    test.expect_egress(&we1, EndpointEgressData::default());
    test.expect_no_more();
    assert_eq!(test.resolver.active_ip_sets(), 0);
    assert_eq!(test.resolver.endpoints_len(), 0);
}

#[test]
fn endpoints_share_a_selector() {
    let mut test = Test::new();
    let (we1, we2) = (key("we1"), key("we2"));
    let ep = endpoint(with_selector("black == 'white'"), &[]);

    test.update(Update::endpoint(we1.clone(), Some(ep.clone())));
    test.update(Update::endpoint(we2.clone(), Some(ep)));
    let id = test.expect_active();
    test.expect_egress(&we1, ip_set(&id));
    test.expect_egress(&we2, ip_set(&id));
    test.expect_no_more();

    test.update(Update::endpoint(we1.clone(), None));
    test.expect_egress(&we1, EndpointEgressData::default());
    test.expect_no_more();

    test.update(Update::endpoint(we2.clone(), None));
    test.expect_inactive(&id);
    test.expect_egress(&we2, EndpointEgressData::default());
    test.expect_no_more();
}

#[test]
fn equivalent_selectors_share_an_ip_set() {
    let mut test = Test::new();
    let (we1, we2) = (key("we1"), key("we2"));

    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(with_selector("black == 'white'"), &[])),
    ));
    test.update(Update::endpoint(
        we2.clone(),
        Some(endpoint(with_selector(r#"black=="white""#), &[])),
    ));
    let id = test.expect_active();
    test.expect_egress(&we1, ip_set(&id));
    test.expect_egress(&we2, ip_set(&id));
    test.expect_no_more();
}

#[test]
fn profile_after_endpoint() {
    let mut test = Test::new();
    let we1 = key("we1");

    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(None, &["webclient"])),
    ));
    test.expect_no_more();

    test.update(Update::profile("webclient", profile("black == 'white'")));
    let id = test.expect_active();
    test.expect_egress(&we1, ip_set(&id));
    test.expect_no_more();

    // The same selector again changes nothing.
    test.update(Update::profile("webclient", profile("black == 'white'")));
    test.expect_no_more();

    test.update(Update::profile("webclient", None));
    test.expect_inactive(&id);
    test.expect_egress(&we1, EndpointEgressData::default());
    test.expect_no_more();
}

#[test]
fn profile_before_endpoint() {
    let mut test = Test::new();
    let we1 = key("we1");

    test.update(Update::profile("webclient", profile("black == 'white'")));
    test.expect_no_more();

    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(None, &["webclient"])),
    ));
    let id = test.expect_active();
    test.expect_egress(&we1, ip_set(&id));
    test.expect_no_more();

    test.update(Update::endpoint(we1.clone(), None));
    test.expect_inactive(&id);
    test.expect_egress(&we1, EndpointEgressData::default());
    test.expect_no_more();
}

#[test]
fn own_assignment_overrides_profile() {
    let mut test = Test::new();
    let we1 = key("we1");

    test.update(Update::profile("webclient", profile("profile == 'gw'")));
    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(with_selector("own == 'gw'"), &["webclient"])),
    ));
    let own = test.expect_active();
    assert_eq!(own, Selector::parse("own == 'gw'").unwrap().unique_id("e"));
    test.expect_egress(&we1, ip_set(&own));
    test.expect_no_more();

    // Profile changes do not affect endpoints with their own assignment.
    test.update(Update::profile("webclient", profile("profile == 'other'")));
    test.expect_no_more();

    // Once the endpoint's own assignment is removed, it falls back to the profile.
    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(None, &["webclient"])),
    ));
    test.expect_inactive(&own);
    let inherited = test.expect_active();
    assert_eq!(
        inherited,
        Selector::parse("profile == 'other'")
            .unwrap()
            .unique_id("e")
    );
    test.expect_egress(&we1, ip_set(&inherited));
    test.expect_no_more();
}

#[test]
fn first_profile_with_assignment_wins() {
    let mut test = Test::new();
    let we1 = key("we1");

    test.update(Update::profile("p1", Some(Profile::default())));
    test.update(Update::profile("p2", profile("second == 'true'")));
    test.update(Update::profile("p3", profile("third == 'true'")));
    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(None, &["p1", "p2", "p3"])),
    ));
    let second = test.expect_active();
    test.expect_egress(&we1, ip_set(&second));
    test.expect_no_more();

    test.update(Update::profile("p1", profile("first == 'true'")));
    test.expect_inactive(&second);
    let first = test.expect_active();
    assert_eq!(
        first,
        Selector::parse("first == 'true'").unwrap().unique_id("e")
    );
    test.expect_egress(&we1, ip_set(&first));
    test.expect_no_more();
}

#[test]
fn namespace_selector_applies_to_namespace_labels() {
    let mut test = Test::new();
    let we1 = key("we1");

    let spec = EgressSpec {
        selector: "egress == 'gw'".to_string(),
        namespace_selector: "name == 'gateways'".to_string(),
        max_next_hops: 2,
        ..Default::default()
    };
    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(Some(spec), &[])),
    ));

    let expected = Selector::parse("egress == 'gw' && pcns.name == 'gateways'").unwrap();
    assert_eq!(
        test.resolver.effective(&we1),
        Some(&EffectiveEgress::Selector {
            selector: expected.clone(),
            max_next_hops: 2,
        })
    );
    let id = test.expect_active();
    assert_eq!(id, expected.unique_id("e"));
    test.expect_egress(
        &we1,
        EndpointEgressData {
            ip_set_id: Some(id),
            max_next_hops: 2,
            ..Default::default()
        },
    );
}

#[test]
fn policy_rules_occupy_slots() {
    let mut test = Test::new();
    let we1 = key("we1");

    let dest: IpNet = "10.10.0.0/16".parse().unwrap();
    let policy = EgressGatewayPolicy {
        rules: vec![
            EgressGatewayRule {
                destination: Some(dest),
                gateway: None,
            },
            EgressGatewayRule {
                destination: None,
                gateway: Some(EgressGateway {
                    selector: "egress == 'gw'".to_string(),
                    max_next_hops: 3,
                    ..Default::default()
                }),
            },
        ],
    };
    test.update(Update::egress_gateway_policy("pol", Some(policy)));
    test.expect_no_more();

    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(Some(EgressSpec::from_policy("pol")), &[])),
    ));
    let id = test.expect_active();
    test.expect_egress(
        &we1,
        EndpointEgressData {
            rules: vec![
                EgressRuleData {
                    destination: Some(dest),
                    ip_set_id: None,
                    max_next_hops: 0,
                },
                EgressRuleData {
                    destination: None,
                    ip_set_id: Some(id.clone()),
                    max_next_hops: 3,
                },
            ],
            ..Default::default()
        },
    );
    test.expect_no_more();

    // Changing the policy rescans the endpoints that use it.
    let policy = EgressGatewayPolicy {
        rules: vec![EgressGatewayRule {
            destination: None,
            gateway: Some(EgressGateway {
                selector: "egress == 'other'".to_string(),
                ..Default::default()
            }),
        }],
    };
    test.update(Update::egress_gateway_policy("pol", Some(policy)));
    test.expect_inactive(&id);
    let other = test.expect_active();
    test.expect_egress(
        &we1,
        EndpointEgressData {
            rules: vec![EgressRuleData {
                destination: None,
                ip_set_id: Some(other.clone()),
                max_next_hops: 0,
            }],
            ..Default::default()
        },
    );
    test.expect_no_more();
}

#[test]
fn missing_policy_fails_closed() {
    let mut test = Test::new();
    let we1 = key("we1");
    let deny = Selector::deny_all().unique_id("e");

    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(Some(EgressSpec::from_policy("missing")), &[])),
    ));
    assert_eq!(test.expect_active(), deny);
    test.expect_egress(&we1, ip_set(&deny));
    test.expect_no_more();

    // Once the policy appears the endpoint uses it instead.
    let policy = EgressGatewayPolicy {
        rules: vec![EgressGatewayRule {
            destination: None,
            gateway: Some(EgressGateway {
                selector: "egress == 'gw'".to_string(),
                ..Default::default()
            }),
        }],
    };
    test.update(Update::egress_gateway_policy("missing", Some(policy)));
    test.expect_inactive(&deny);
    let gw = test.expect_active();
    assert_ne!(gw, deny);
    test.next().expect("egress update");
    test.expect_no_more();

    // Deleting it again fails closed.
    test.update(Update::egress_gateway_policy("missing", None));
    test.expect_inactive(&gw);
    assert_eq!(test.expect_active(), deny);
    test.expect_egress(&we1, ip_set(&deny));
    test.expect_no_more();
}

#[test]
fn policy_named_by_profile() {
    let mut test = Test::new();
    let we1 = key("we1");

    test.update(Update::profile(
        "webclient",
        Some(Profile {
            egress: Some(EgressSpec::from_policy("pol")),
        }),
    ));
    test.update(Update::endpoint(
        we1.clone(),
        Some(endpoint(None, &["webclient"])),
    ));
    assert_eq!(
        test.resolver.effective(&we1),
        Some(&EffectiveEgress::DenyAll {
            policy: "pol".to_string()
        })
    );
    test.expect_active();
    test.expect_egress(&we1, ip_set(&Selector::deny_all().unique_id("e")));
    test.expect_no_more();

    // An unrelated policy leaves the endpoint alone.
    test.update(Update::egress_gateway_policy(
        "other",
        Some(EgressGatewayPolicy::default()),
    ));
    test.expect_no_more();
}

#[test]
fn endpoints_without_egress_are_quiet() {
    let mut test = Test::new();
    let we1 = key("we1");

    test.update(Update::endpoint(we1.clone(), Some(endpoint(None, &[]))));
    test.update(Update::endpoint(we1.clone(), None));
    test.update(Update::endpoint(key("never-seen"), None));
    test.expect_no_more();
}

#[test]
#[should_panic(expected = "invalid egress selector")]
fn invalid_selector_panics() {
    let mut test = Test::new();
    test.update(Update::endpoint(
        key("we1"),
        Some(endpoint(with_selector("black ==="), &[])),
    ));
}

#[test]
fn resolution_is_pure() {
    let mut profiles = HashMap::default();
    profiles.insert("p1".to_string(), EgressSpec::from_selector("has(a)"));
    let policies = HashMap::default();

    let own = EgressSpec::default();
    assert_eq!(
        resolve_effective(Some(&own), &["p1".to_string()], &profiles, &policies),
        EffectiveEgress::Selector {
            selector: Selector::parse("has(a)").unwrap(),
            max_next_hops: 0,
        }
    );
    assert_eq!(
        resolve_effective(None, &["p2".to_string()], &profiles, &policies),
        EffectiveEgress::None
    );
}
