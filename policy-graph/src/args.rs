use crate::replay;
use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use policy_graph_index::{metrics, CalcGraph, Config, SharedGraph};
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::io::{self, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(
    name = "policy-graph",
    about = "Replays datastore updates through the policy calculation graph"
)]
pub struct Args {
    #[clap(long, default_value = "policy_graph=info,warn", env = "POLICY_GRAPH_LOG")]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    /// The local host. Only endpoints on this host are published.
    #[clap(long, env = "HOSTNAME")]
    hostname: String,

    /// Names the port on which egress gateways serve health checks.
    #[clap(long, default_value = "health")]
    health_port_name: String,

    #[clap(long, default_value = "5000")]
    endpoint_deletion_delay_ms: u64,

    /// A file of newline-delimited JSON updates, or `-` for stdin.
    #[clap(long, default_value = "-")]
    input: PathBuf,

    /// Writes index metrics to stderr once the input is exhausted.
    #[clap(long)]
    metrics: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            hostname,
            health_port_name,
            endpoint_deletion_delay_ms,
            input,
            metrics,
        } = self;

        init_log(&log_level, log_format)?;

        let config = Config {
            hostname,
            health_port_name,
            endpoint_deletion_delay: Duration::from_millis(endpoint_deletion_delay_ms),
        };
        info!(hostname = %config.hostname, "Starting policy graph");
        let graph: SharedGraph = Arc::new(RwLock::new(CalcGraph::new(&config)));

        let mut prom = <Registry>::default();
        metrics::register(prom.sub_registry_with_prefix("policy_graph"), graph.clone());

        let mut stdout = io::stdout();
        let stats = if input.as_os_str() == "-" {
            replay::replay(&graph, BufReader::new(io::stdin()), &mut stdout).await?
        } else {
            let file = tokio::fs::File::open(&input)
                .await
                .with_context(|| format!("failed to open {}", input.display()))?;
            replay::replay(&graph, BufReader::new(file), &mut stdout).await?
        };
        info!(lines = stats.lines, events = stats.events, "Replay complete");

        if metrics {
            let mut text = String::new();
            prometheus_client::encoding::text::encode(&mut text, &prom)
                .context("failed to encode metrics")?;
            let mut stderr = io::stderr();
            stderr.write_all(text.as_bytes()).await?;
            stderr.flush().await?;
        }

        Ok(())
    }
}

fn init_log(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let init = match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    init.map_err(|error| anyhow::anyhow!("failed to initialize logging: {error}"))
}
