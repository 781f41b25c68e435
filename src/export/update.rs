//! Serialization of newly observed flows into the compressed update stream.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::anonymize::Anonymizer;
use crate::flow::{FlowTable, Occupancy};

/// Opens the persistent gzip update stream the agent appends to. One stream
/// per session; each `write_update` call appends one record block.
pub fn open_update_stream(path: &Path) -> Result<GzEncoder<File>> {
    let file = File::create(path)
        .with_context(|| format!("creating update stream {}", path.display()))?;

    Ok(GzEncoder::new(file, Compression::default()))
}

/// Streams newly observed table entries since the last call.
///
/// Each successful call emits one block: a header line with the table's
/// base timestamp and cumulative counters, one record per unsent slot in
/// index order, and a blank terminator line. Written slots are promoted to
/// sent as they go; a failed call leaves already-promoted slots promoted.
pub struct UpdateWriter {
    #[cfg_attr(not(feature = "anonymization"), allow(dead_code))]
    anonymizer: Anonymizer,
}

impl UpdateWriter {
    pub fn new(anonymizer: Anonymizer) -> Self {
        Self { anonymizer }
    }

    /// Writes one update block into `sink`.
    ///
    /// Counters in the header are cumulative totals, not deltas, so
    /// consumers can difference them with their own memory.
    pub fn write_update<W: Write>(&self, table: &mut FlowTable, sink: &mut W) -> Result<()> {
        writeln!(
            sink,
            "{} {} {} {}",
            table.base_timestamp(),
            table.live(),
            table.expired(),
            table.dropped(),
        )
        .context("writing update header")?;

        let mut written = 0usize;
        for idx in 0..table.entries().len() {
            let entry = table.entries()[idx];
            if entry.occupancy != Occupancy::Unsent {
                continue;
            }

            #[cfg(feature = "anonymization")]
            {
                let src = self
                    .anonymizer
                    .digest(entry.key.src_ip)
                    .context("anonymizing source ip")?;
                let dst = self
                    .anonymizer
                    .digest(entry.key.dst_ip)
                    .context("anonymizing destination ip")?;
                writeln!(
                    sink,
                    "{idx} {src:x} {dst:x} {} {} {}",
                    entry.key.protocol, entry.key.src_port, entry.key.dst_port,
                )
                .context("writing update record")?;
            }

            #[cfg(not(feature = "anonymization"))]
            writeln!(
                sink,
                "{idx} {:x} {:x} {} {} {}",
                u32::from(entry.key.src_ip),
                u32::from(entry.key.dst_ip),
                entry.key.protocol,
                entry.key.src_port,
                entry.key.dst_port,
            )
            .context("writing update record")?;

            table.entries_mut()[idx].occupancy = Occupancy::Sent;
            written += 1;
        }

        writeln!(sink).context("writing update terminator")?;

        debug!(records = written, live = table.live(), "update written");

        Ok(())
    }
}
