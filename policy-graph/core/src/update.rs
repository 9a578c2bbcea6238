//! Datastore updates delivered to the calculation graph.

use crate::{
    egress::{EgressGatewayPolicy, Profile},
    endpoint::{Endpoint, EndpointKey},
    network::{IpPool, NetworkSet},
    policy::{Policy, PolicyKey, Tier},
    IpNet,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A single change to a datastore object. A `None` value deletes the object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub change: ChangeKind,
    pub delta: Delta,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    New,
    #[default]
    Updated,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Delta {
    Endpoint {
        key: EndpointKey,
        value: Option<Endpoint>,
    },
    Profile {
        name: String,
        value: Option<Profile>,
    },
    EgressGatewayPolicy {
        name: String,
        value: Option<EgressGatewayPolicy>,
    },
    Policy {
        key: PolicyKey,
        value: Option<Policy>,
    },
    Tier {
        name: String,
        value: Option<Tier>,
    },
    HostIp {
        hostname: String,
        value: Option<IpAddr>,
    },
    NetworkSet {
        name: String,
        value: Option<NetworkSet>,
    },
    IpPool {
        cidr: IpNet,
        value: Option<IpPool>,
    },
}

/// The kind of object a [`Delta`] describes. Handlers register for updates by kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Endpoint,
    Profile,
    EgressGatewayPolicy,
    Policy,
    Tier,
    HostIp,
    NetworkSet,
    IpPool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    WaitingForDatastore,
    ResyncInProgress,
    InSync,
}

// === impl Update ===

impl Update {
    /// Wraps a delta, inferring the change kind from whether it carries a value.
    pub fn new(delta: Delta) -> Self {
        let change = if delta.is_delete() {
            ChangeKind::Deleted
        } else {
            ChangeKind::Updated
        };
        Self { change, delta }
    }

    pub fn endpoint(key: impl Into<EndpointKey>, value: Option<Endpoint>) -> Self {
        Self::new(Delta::Endpoint {
            key: key.into(),
            value,
        })
    }

    pub fn profile(name: impl ToString, value: Option<Profile>) -> Self {
        Self::new(Delta::Profile {
            name: name.to_string(),
            value,
        })
    }

    pub fn egress_gateway_policy(name: impl ToString, value: Option<EgressGatewayPolicy>) -> Self {
        Self::new(Delta::EgressGatewayPolicy {
            name: name.to_string(),
            value,
        })
    }

    pub fn policy(key: PolicyKey, value: Option<Policy>) -> Self {
        Self::new(Delta::Policy { key, value })
    }

    pub fn tier(name: impl ToString, value: Option<Tier>) -> Self {
        Self::new(Delta::Tier {
            name: name.to_string(),
            value,
        })
    }

    pub fn host_ip(hostname: impl ToString, value: Option<IpAddr>) -> Self {
        Self::new(Delta::HostIp {
            hostname: hostname.to_string(),
            value,
        })
    }

    pub fn network_set(name: impl ToString, value: Option<NetworkSet>) -> Self {
        Self::new(Delta::NetworkSet {
            name: name.to_string(),
            value,
        })
    }

    pub fn ip_pool(cidr: IpNet, value: Option<IpPool>) -> Self {
        Self::new(Delta::IpPool { cidr, value })
    }

    pub fn kind(&self) -> DeltaKind {
        self.delta.kind()
    }
}

// === impl Delta ===

impl Delta {
    pub fn kind(&self) -> DeltaKind {
        match self {
            Self::Endpoint { .. } => DeltaKind::Endpoint,
            Self::Profile { .. } => DeltaKind::Profile,
            Self::EgressGatewayPolicy { .. } => DeltaKind::EgressGatewayPolicy,
            Self::Policy { .. } => DeltaKind::Policy,
            Self::Tier { .. } => DeltaKind::Tier,
            Self::HostIp { .. } => DeltaKind::HostIp,
            Self::NetworkSet { .. } => DeltaKind::NetworkSet,
            Self::IpPool { .. } => DeltaKind::IpPool,
        }
    }

    pub fn is_delete(&self) -> bool {
        match self {
            Self::Endpoint { value, .. } => value.is_none(),
            Self::Profile { value, .. } => value.is_none(),
            Self::EgressGatewayPolicy { value, .. } => value.is_none(),
            Self::Policy { value, .. } => value.is_none(),
            Self::Tier { value, .. } => value.is_none(),
            Self::HostIp { value, .. } => value.is_none(),
            Self::NetworkSet { value, .. } => value.is_none(),
            Self::IpPool { value, .. } => value.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::WorkloadEndpointKey;

    #[test]
    fn infers_change_kind() {
        let key = WorkloadEndpointKey::new("node1", "k8s", "ns1/pod1", "eth0");
        let update = Update::endpoint(key.clone(), Some(Endpoint::default()));
        assert_eq!(update.change, ChangeKind::Updated);
        assert_eq!(update.kind(), DeltaKind::Endpoint);

        let update = Update::endpoint(key, None);
        assert_eq!(update.change, ChangeKind::Deleted);
    }

    #[test]
    fn decodes_json() {
        let update: Update = serde_json::from_str(
            r#"{
                "delta": {
                    "kind": "endpoint",
                    "key": {"workload": {
                        "hostname": "node1",
                        "orchestratorId": "k8s",
                        "workloadId": "ns1/pod1",
                        "endpointId": "eth0"
                    }},
                    "value": {
                        "labels": {"app": "web"},
                        "profileIds": ["kns.ns1"],
                        "ipNets": ["10.0.0.1/32"],
                        "egress": {"selector": "egress == 'gw'", "maxNextHops": 2}
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(update.change, ChangeKind::Updated);

        let Delta::Endpoint { key, value } = update.delta else {
            panic!("unexpected delta");
        };
        assert_eq!(key.hostname(), "node1");
        let ep = value.unwrap();
        assert_eq!(ep.labels.get("app"), Some("web"));
        assert_eq!(ep.ipv4_addrs(), vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        let egress = ep.egress.unwrap();
        assert_eq!(egress.selector, "egress == 'gw'");
        assert_eq!(egress.max_next_hops, 2);
    }

    #[test]
    fn decodes_host_ip_delete() {
        let update: Update = serde_json::from_str(
            r#"{"delta": {"kind": "host-ip", "hostname": "node1", "value": null}}"#,
        )
        .unwrap();
        assert!(update.delta.is_delete());
        assert_eq!(update.kind(), DeltaKind::HostIp);
    }
}
