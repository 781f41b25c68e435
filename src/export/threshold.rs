//! Plaintext heavy-hitter report for local operator inspection.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::flow::table::FLOW_THRESHOLD;
use crate::flow::{FlowTable, Occupancy};

/// Snapshots every unsent slot whose packet count has reached
/// [`FLOW_THRESHOLD`] into the report file, truncating prior contents.
///
/// Record format, in slot-index order:
/// `<idx> <src_ip_hex> <dst_ip_hex> <packet_count>`. IPs are raw (never
/// anonymized) since the report stays on the local host. The table is not
/// mutated; this is purely observational.
pub fn write_thresholded_ips(
    table: &FlowTable,
    path: &Path,
    session_id: u64,
    sequence_number: u32,
) -> Result<()> {
    debug!(path = %path.display(), sequence_number, "writing thresholded flows report");

    let file = File::create(path)
        .with_context(|| format!("opening thresholded flows report {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "{session_id} {sequence_number}").context("writing report header")?;
    writeln!(out).context("writing report header")?;

    for (idx, entry) in table.entries().iter().enumerate() {
        if entry.occupancy == Occupancy::Unsent && entry.packet_count >= FLOW_THRESHOLD {
            writeln!(
                out,
                "{idx} {:x} {:x} {}",
                u32::from(entry.key.src_ip),
                u32::from(entry.key.dst_ip),
                entry.packet_count,
            )
            .context("writing report record")?;
        }
    }

    out.flush().context("flushing thresholded flows report")?;

    Ok(())
}
