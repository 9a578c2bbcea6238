//! Data model shared by the policy calculation graph.
//!
//! These types describe the datastore objects that flow into the graph (endpoints, profiles,
//! policies, tiers, host addresses, ...) and the derived values that flow out of it.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod egress;
pub mod endpoint;
mod labels;
pub mod network;
pub mod policy;
pub mod selector;
pub mod update;

pub use self::{
    egress::{EgressSpec, EndpointEgressData},
    endpoint::{Endpoint, EndpointKey, HostEndpointKey, WorkloadEndpointKey},
    labels::Labels,
    network::{IpPool, NetworkSet, TunnelBinding},
    policy::{Policy, PolicyKey, Tier},
    selector::Selector,
    update::{ChangeKind, Delta, DeltaKind, SyncStatus, Update},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
