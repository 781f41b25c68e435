//! Ingest of parsed packet records.
//!
//! Capture and L2-L4 parsing live outside this agent; the collaborator
//! delivers one JSON object per line, already reduced to a 5-tuple and a
//! timestamp.

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::flow::FlowKey;

/// One observed packet, reduced to its flow key and capture time.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PacketRecord {
    #[serde(flatten)]
    pub key: FlowKey,
    pub timestamp_seconds: i64,
}

/// Parses a single NDJSON record line.
pub fn parse_record(line: &str) -> Result<PacketRecord> {
    serde_json::from_str(line).context("parsing packet record")
}

/// Reads NDJSON packet records from stdin until EOF or cancellation,
/// forwarding them into the agent's channel.
///
/// Malformed lines are logged and skipped; a full channel applies
/// backpressure to the producer.
pub async fn run_stdin_ingest(tx: mpsc::Sender<PacketRecord>, cancel: CancellationToken) {
    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stdin ingest cancelled");
                return;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("stdin ingest reached EOF");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "reading stdin");
                        return;
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }

                let record = match parse_record(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(error = %e, "skipping malformed record");
                        continue;
                    }
                };

                if tx.send(record).await.is_err() {
                    debug!("ingest channel closed");
                    return;
                }
            }
        }
    }
}
