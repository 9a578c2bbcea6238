//! Policy Calculation Graph
//!
//! The graph consumes a stream of datastore updates and incrementally computes the state a
//! host's dataplane needs:
//!
//! - Egress gateway selectors, from endpoints, profiles and egress gateway policies, are
//!   ref-counted into IP sets. A set is activated when its first user appears and deactivated
//!   when its last user goes away.
//! - Each local endpoint is published with the tiers of policies that select it, in order,
//!   together with its egress gateway data.
//! - Host addresses and workload addresses are resolved into tunnel bindings. Any workload
//!   address whose tunnel is ambiguous is blacklisted instead.
//!
//! ```text
//! [ Update ] -> [ Dispatcher ] -> [ Resolvers ] -> [ Event queue ] -> [ Event ]
//!                                       ^                |
//!                                       +-- matches -----+
//! ```
//!
//! Resolvers only see the updates they register for and never call each other; the
//! [`graph::CalcGraph`] routes their callbacks.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dispatcher;
pub mod egress;
pub mod graph;
pub mod ip_sets;
pub mod labels;
pub mod lookup;
pub mod metrics;
pub mod multimap;
pub mod policy;
pub mod refcount;
pub mod trie;
pub mod tunnel;

pub use self::{
    dispatcher::{Dispatcher, UpdateHandler},
    graph::{CalcGraph, Event, SharedGraph},
    lookup::EndpointLookupsCache,
};
use std::time::Duration;

/// Configures a [`CalcGraph`].
#[derive(Clone, Debug)]
pub struct Config {
    /// The local host. Only endpoints on this host are published.
    pub hostname: String,

    /// Names the port on which egress gateways serve health checks.
    pub health_port_name: String,

    /// How long the lookup cache retains deleted endpoints.
    pub endpoint_deletion_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            health_port_name: "health".to_string(),
            endpoint_deletion_delay: Duration::from_secs(5),
        }
    }
}
