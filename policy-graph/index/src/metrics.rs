use crate::graph::SharedGraph;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedGraph);

pub fn register(reg: &mut Registry, graph: SharedGraph) {
    reg.register_collector(Box::new(Instrumented(graph)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let stats = self.0.read().stats();

        let gauges = [
            (
                "local_endpoints",
                "The number of local endpoints in the policy resolver",
                stats.local_endpoints,
            ),
            (
                "active_ip_sets",
                "The number of active egress gateway IP sets",
                stats.active_ip_sets,
            ),
            (
                "selectors",
                "The number of selectors in the label index",
                stats.selectors,
            ),
            ("tiers", "The number of known tiers", stats.tiers),
            ("policies", "The number of known policies", stats.policies),
            (
                "tunnel_nodes",
                "The number of nodes tracked by the tunnel resolver",
                stats.tunnel_nodes,
            ),
            (
                "tunnel_bindings",
                "The number of active tunnel bindings",
                stats.bindings,
            ),
            (
                "blacklisted_addresses",
                "The number of workload addresses without a usable tunnel",
                stats.blacklisted,
            ),
            (
                "lookup_endpoints",
                "The number of endpoints in the lookup cache",
                stats.lookup_entries,
            ),
        ];

        for (name, help, value) in gauges {
            let gauge = ConstGauge::new(value as i64);
            let metric_encoder = encoder.encode_descriptor(name, help, None, MetricType::Gauge)?;
            gauge.encode(metric_encoder)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CalcGraph, Config};
    use parking_lot::RwLock;
    use policy_graph_core::Update;
    use std::sync::Arc;

    #[test]
    fn encodes_index_sizes() {
        let graph: SharedGraph = Arc::new(RwLock::new(CalcGraph::new(&Config {
            hostname: "node1".to_string(),
            ..Config::default()
        })));
        graph
            .write()
            .on_update(&Update::host_ip("node1", Some("192.168.0.1".parse().unwrap())));

        let mut reg = Registry::default();
        register(reg.sub_registry_with_prefix("graph"), graph);

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &reg).unwrap();
        assert!(text.contains("# TYPE graph_tunnel_nodes gauge"), "{text}");
        assert!(text.contains("graph_tunnel_nodes 1"), "{text}");
        assert!(text.contains("graph_tunnel_bindings 0"), "{text}");
    }
}
