//! Drives a calculation graph from newline-delimited JSON.
//!
//! Each input line is either `{"update": <Update>}` or `{"status": "in-sync"}`. Every event the
//! graph emits is written as one JSON line. Blank lines are skipped.

use anyhow::{Context, Result};
use policy_graph_core::{SyncStatus, Update};
use policy_graph_index::SharedGraph;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Input {
    Update(Update),
    Status(SyncStatus),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub lines: usize,
    pub events: usize,
}

pub async fn replay<R, W>(graph: &SharedGraph, input: R, output: &mut W) -> Result<Stats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = Stats::default();
    let mut lines = input.lines();
    let mut lineno = 0;
    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        lineno += 1;
        if line.trim().is_empty() {
            continue;
        }
        let input = serde_json::from_str::<Input>(&line)
            .with_context(|| format!("line {lineno}: malformed input"))?;
        tracing::trace!(line = lineno, ?input);

        let events = match &input {
            Input::Update(update) => graph.write().on_update(update),
            Input::Status(status) => graph.write().on_status(*status),
        };
        stats.lines += 1;
        stats.events += events.len();

        let mut buf = Vec::new();
        for event in &events {
            serde_json::to_writer(&mut buf, event)
                .with_context(|| format!("line {lineno}: failed to encode event"))?;
            buf.push(b'\n');
        }
        output.write_all(&buf).await?;
    }
    output.flush().await?;
    Ok(stats)
}
