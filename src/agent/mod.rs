//! Agent orchestration: channel ingest into the flow table plus the
//! periodic update and report jobs.
//!
//! The table and both writers live inside a single worker task, so table
//! operations are serialized by construction; packet ingestion interleaves
//! with reporting only between whole calls.

use std::fs::File;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::anonymize::Anonymizer;
use crate::config::Config;
use crate::export::health::HealthMetrics;
#[cfg(feature = "thresholding")]
use crate::export::threshold;
use crate::export::update::{open_update_stream, UpdateWriter};
use crate::flow::FlowTable;
use crate::ingest::PacketRecord;

/// Agent owning the flow table, writers, and health metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    tx: Option<mpsc::Sender<PacketRecord>>,
    worker: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            tx: None,
            worker: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start the health server and the table worker.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let anonymizer = if cfg!(feature = "anonymization") {
            Anonymizer::from_seed_file(&self.cfg.anonymization.seed_path)
                .context("loading anonymization seed")?
        } else {
            Anonymizer::unseeded()
        };

        let stream = open_update_stream(&self.cfg.update.path)
            .context("opening compressed update stream")?;
        info!(path = %self.cfg.update.path.display(), "update stream opened");

        let (tx, rx) = mpsc::channel(self.cfg.channel_capacity);
        self.tx = Some(tx);

        let worker = Worker {
            health: Arc::clone(&self.health),
            table: FlowTable::new(),
            writer: UpdateWriter::new(anonymizer),
            stream,
            rx,
            cancel: self.cancel.clone(),
            last_expired: 0,
            last_dropped: 0,
            #[cfg(feature = "thresholding")]
            threshold_path: self.cfg.threshold.path.clone(),
            #[cfg(feature = "thresholding")]
            session_id: epoch_seconds() as u64,
            #[cfg(feature = "thresholding")]
            sequence: 0,
        };

        let update_interval = self.cfg.update.interval;
        let threshold_interval = self.cfg.threshold.interval;
        self.worker = Some(tokio::spawn(worker.run(update_interval, threshold_interval)));

        info!("agent started");

        Ok(())
    }

    /// Sender feeding the worker; available once started.
    pub fn sender(&self) -> Option<mpsc::Sender<PacketRecord>> {
        self.tx.clone()
    }

    /// Gracefully stop: drain the channel, write a final update, close the
    /// stream, shut down the health server.
    pub async fn stop(&mut self) -> Result<()> {
        // Close the channel so the worker drains and exits.
        self.tx.take();
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker join failed");
            }
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }
}

/// Single owner of the table and its output streams.
struct Worker {
    health: Arc<HealthMetrics>,
    table: FlowTable,
    writer: UpdateWriter,
    stream: GzEncoder<File>,
    rx: mpsc::Receiver<PacketRecord>,
    cancel: CancellationToken,
    last_expired: u64,
    last_dropped: u64,
    #[cfg(feature = "thresholding")]
    threshold_path: std::path::PathBuf,
    #[cfg(feature = "thresholding")]
    session_id: u64,
    #[cfg(feature = "thresholding")]
    sequence: u32,
}

impl Worker {
    async fn run(
        mut self,
        update_interval: std::time::Duration,
        threshold_interval: std::time::Duration,
    ) {
        let mut update_ticker = tokio::time::interval(update_interval);
        update_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut threshold_ticker = tokio::time::interval(threshold_interval);
        threshold_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("worker cancelled");
                    break;
                }

                record = self.rx.recv() => {
                    match record {
                        Some(record) => self.process(record),
                        None => {
                            debug!("ingest channel closed");
                            break;
                        }
                    }
                }

                _ = update_ticker.tick() => {
                    self.write_update();
                }

                _ = threshold_ticker.tick() => {
                    #[cfg(feature = "thresholding")]
                    self.write_threshold_report();
                }
            }
        }

        // One final update so flows observed since the last tick are not
        // lost, then seal the gzip stream.
        self.write_update();
        if let Err(e) = self.stream.try_finish() {
            warn!(error = %e, "closing update stream");
        }
    }

    fn process(&mut self, record: PacketRecord) {
        self.health.flows_processed.inc();

        if let Err(e) = self
            .table
            .process_flow(&record.key, record.timestamp_seconds)
        {
            debug!(error = %e, "flow not placed");
        }
    }

    fn write_update(&mut self) {
        let now = epoch_seconds();

        // Rebase first so the gate never fires on the caller's own clock.
        let live_before = self.table.live();
        self.table.advance_base_timestamp(now);
        let rebased_out = live_before - self.table.live();
        if rebased_out > 0 {
            self.health
                .flows_rebased_out
                .inc_by(f64::from(rebased_out));
        }

        let result = self
            .writer
            .write_update(&mut self.table, &mut self.stream)
            .and_then(|()| {
                use std::io::Write;
                self.stream.flush().context("flushing update stream")
            });

        match result {
            Ok(()) => self.health.updates_written.inc(),
            Err(e) => {
                self.health.update_errors.inc();
                warn!(error = %e, "update write failed");
            }
        }

        self.sync_health();
    }

    #[cfg(feature = "thresholding")]
    fn write_threshold_report(&mut self) {
        match threshold::write_thresholded_ips(
            &self.table,
            &self.threshold_path,
            self.session_id,
            self.sequence,
        ) {
            Ok(()) => {
                self.sequence += 1;
                self.health.threshold_reports_written.inc();
            }
            Err(e) => warn!(error = %e, "threshold report failed"),
        }
    }

    /// Mirrors the table's cumulative counters into Prometheus as deltas.
    fn sync_health(&mut self) {
        self.health.table_live.set(f64::from(self.table.live()));

        let expired = self.table.expired();
        self.health
            .flows_expired
            .inc_by((expired - self.last_expired) as f64);
        self.last_expired = expired;

        let dropped = self.table.dropped();
        self.health
            .flows_dropped
            .inc_by((dropped - self.last_dropped) as f64);
        self.last_dropped = dropped;
    }
}

/// Wall-clock seconds since the epoch.
fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
