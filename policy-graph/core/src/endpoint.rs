use crate::{egress::EgressSpec, labels::Labels, IpNet};
use serde::{Deserialize, Serialize};
use std::{fmt, net::IpAddr};

/// Identifies a workload endpoint (e.g. a pod interface) on a host.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpointKey {
    pub hostname: String,
    pub orchestrator_id: String,
    pub workload_id: String,
    pub endpoint_id: String,
}

/// Identifies a host endpoint (an interface of the host itself).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEndpointKey {
    pub hostname: String,
    pub endpoint_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKey {
    Workload(WorkloadEndpointKey),
    Host(HostEndpointKey),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub labels: Labels,

    /// Profiles applied to the endpoint, in precedence order.
    #[serde(default)]
    pub profile_ids: Vec<String>,

    #[serde(default)]
    pub ip_nets: Vec<IpNet>,

    #[serde(default)]
    pub ports: Vec<NamedPort>,

    /// The endpoint's own egress gateway assignment, if any.
    #[serde(default)]
    pub egress: Option<EgressSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPort {
    pub name: String,
    pub port: u16,
}

// === impl EndpointKey ===

impl EndpointKey {
    pub fn hostname(&self) -> &str {
        match self {
            Self::Workload(key) => &key.hostname,
            Self::Host(key) => &key.hostname,
        }
    }

    pub fn as_workload(&self) -> Option<&WorkloadEndpointKey> {
        match self {
            Self::Workload(key) => Some(key),
            Self::Host(_) => None,
        }
    }
}

impl From<WorkloadEndpointKey> for EndpointKey {
    fn from(key: WorkloadEndpointKey) -> Self {
        Self::Workload(key)
    }
}

impl From<HostEndpointKey> for EndpointKey {
    fn from(key: HostEndpointKey) -> Self {
        Self::Host(key)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workload(key) => key.fmt(f),
            Self::Host(key) => key.fmt(f),
        }
    }
}

impl WorkloadEndpointKey {
    pub fn new(
        hostname: impl ToString,
        orchestrator_id: impl ToString,
        workload_id: impl ToString,
        endpoint_id: impl ToString,
    ) -> Self {
        Self {
            hostname: hostname.to_string(),
            orchestrator_id: orchestrator_id.to_string(),
            workload_id: workload_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
        }
    }
}

impl fmt::Display for WorkloadEndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.hostname, self.orchestrator_id, self.workload_id, self.endpoint_id
        )
    }
}

impl HostEndpointKey {
    pub fn new(hostname: impl ToString, endpoint_id: impl ToString) -> Self {
        Self {
            hostname: hostname.to_string(),
            endpoint_id: endpoint_id.to_string(),
        }
    }
}

impl fmt::Display for HostEndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/host/{}", self.hostname, self.endpoint_id)
    }
}

// === impl Endpoint ===

impl Endpoint {
    /// Looks up a named port.
    pub fn port_named(&self, name: &str) -> Option<u16> {
        self.ports.iter().find(|p| p.name == name).map(|p| p.port)
    }

    /// Returns the endpoint's IPv4 addresses, without duplicates, in the order they were listed.
    pub fn ipv4_addrs(&self) -> Vec<IpAddr> {
        let mut addrs = Vec::with_capacity(self.ip_nets.len());
        for net in &self.ip_nets {
            let addr = net.addr();
            if addr.is_ipv4() && !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }
}
