use crate::{labels::Labels, IpNet};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A named set of external networks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSet {
    #[serde(default)]
    pub nets: Vec<IpNet>,

    #[serde(default)]
    pub labels: Labels,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpPool {
    pub nat_outgoing: bool,
    pub disabled: bool,
}

/// Routes traffic for a workload address through the tunnel terminating at its host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelBinding {
    pub tunnel_addr: IpAddr,
    pub workload_addr: IpAddr,
}
