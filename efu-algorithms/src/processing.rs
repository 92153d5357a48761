//! Event formation stage of the processing thread.
//!
//! Parsed readouts are ingested into the time bins; each call to
//! [`EventProcessor::process`] releases the block of bins that is far
//! enough behind the newest readout, clusters it (or passes it through),
//! and routes the result to an [`EventSink`].

use crate::{EventBinning, EventRouter, EventSink, ParallelClusterer, RoutingCounters};
use efu_core::{ClusteringStatistics, EngineConfig, ParseSummary, Readout, Result};
use log::{debug, info, warn};
use std::time::Duration;

/// Time the processing thread waits for input before counting an idle tick.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Counters of the processing thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingCounters {
    /// Buffers received.
    pub rx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Buffers dropped because the input queue was full.
    pub fifo_push_errors: u64,
    /// Undecodable bytes reported by the parser.
    pub readout_byte_errors: u64,
    /// Buffer sequence gaps reported by the parser.
    pub readout_seq_errors: u64,
    /// Buffers the parser rejected outright.
    pub parse_errors: u64,
    /// Readouts dropped for falling outside the time window.
    pub dropped_events: u64,
    /// Time discontinuities that re-anchored the bins.
    pub bin_resets: u64,
    /// Routed output, per event type.
    pub routing: RoutingCounters,
    /// Clustering counters summed over all lanes.
    pub clustering: ClusteringStatistics,
}

/// Bins, clusters and routes readouts for one processing thread.
pub struct EventProcessor {
    binning: EventBinning,
    clusterer: Option<ParallelClusterer>,
    router: EventRouter,
    event_lag: u64,
    /// Block span used once the input has been idle for the demux timeout.
    timeout_span: u64,
    idle_ticks: u64,
    countdown: u64,
    output: Vec<Readout>,
    counters: ProcessingCounters,
}

impl EventProcessor {
    /// Builds the stage from a validated configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the clustering
    /// worker pool cannot be started.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let binning = EventBinning::new(config.binning)?;
        let clusterer = if config.clusters.enabled {
            Some(ParallelClusterer::new(
                config.clusters.num_threads,
                config.clusters.limits,
                config.clusters.active_clusters,
            )?)
        } else {
            None
        };
        let detector = &config.detector;
        let poll_ms = u64::try_from(POLL_INTERVAL.as_millis()).unwrap_or(1).max(1);
        let idle_ticks = (detector.demux_timeout_ms / poll_ms).max(1);

        info!(
            "event processor for {}: clustering {}, event lag {} ns, demux timeout {} ms",
            config.instrument,
            if clusterer.is_some() { "enabled" } else { "disabled" },
            detector.event_lag_ns,
            detector.demux_timeout_ms,
        );

        Ok(Self {
            router: EventRouter::new(detector.clone(), config.binning.fine_width_bits),
            binning,
            clusterer,
            event_lag: detector.event_lag_ns,
            timeout_span: detector.demux_timeout_ns(),
            idle_ticks,
            countdown: idle_ticks,
            output: Vec::new(),
            counters: ProcessingCounters::default(),
        })
    }

    /// Overrides the number of idle ticks before the bins are flushed.
    #[must_use]
    pub fn with_idle_ticks(mut self, ticks: u64) -> Self {
        self.idle_ticks = ticks.max(1);
        self.countdown = self.idle_ticks;
        self
    }

    /// Counts one received buffer of `bytes` bytes.
    pub fn record_packet(&mut self, bytes: usize) {
        self.counters.rx_packets += 1;
        self.counters.rx_bytes += bytes as u64;
    }

    /// Accumulates the error counts of a parsed buffer.
    pub fn record_parse(&mut self, summary: &ParseSummary) {
        self.counters.readout_byte_errors += summary.byte_errors;
        self.counters.readout_seq_errors += summary.seq_errors;
    }

    /// Counts a buffer the parser rejected.
    pub fn record_parse_error(&mut self) {
        self.counters.parse_errors += 1;
    }

    /// Sets the input queue overflow count, owned by the input thread.
    pub fn record_push_errors(&mut self, total: u64) {
        self.counters.fifo_push_errors = total;
    }

    /// Bins a batch of readouts whose earliest timestamp is `ts_min`.
    ///
    /// If `ts_min` is outside the time window the bins, the clusterer and
    /// the frame queue are reset first.
    pub fn ingest(&mut self, readouts: &[Readout], ts_min: u64) {
        if readouts.is_empty() {
            return;
        }
        self.countdown = self.idle_ticks;

        let coarse = self.binning.coarse_bin_width();
        let readout_base = ts_min / coarse * coarse;
        if !self.binning.valid_event_time(readout_base) {
            warn!(
                "reset event bins: {} ms -> {} ms",
                self.binning.base_time() / 1_000_000,
                readout_base / 1_000_000
            );
            let dropped = self.binning.reset_bins(readout_base);
            self.counters.dropped_events += dropped as u64;
            self.counters.bin_resets += 1;
            if let Some(clusterer) = &mut self.clusterer {
                clusterer.clear();
            }
            self.router.reset_frames();
        }

        let accepted = self.binning.insert(readouts);
        self.counters.dropped_events += (readouts.len() - accepted) as u64;
    }

    /// Counts one poll without input.
    pub fn idle(&mut self) {
        self.countdown = self.countdown.saturating_sub(1);
    }

    /// Time span that may be released now.
    ///
    /// Everything older than the event lag, or the idle flush window once
    /// the input has been quiet for the demux timeout.
    #[must_use]
    pub fn block_span(&self) -> u64 {
        let span = self.binning.time_span();
        if span > self.event_lag + self.binning.coarse_bin_width() {
            span - self.event_lag
        } else if !self.binning.empty() && self.countdown == 0 {
            self.timeout_span
        } else {
            0
        }
    }

    /// Releases the current block, routes it to `sink` and returns the
    /// readouts produced, for the audit dump.
    ///
    /// # Errors
    /// Returns the first sink error.
    pub fn process<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> Result<&[Readout]> {
        let span = self.block_span();
        self.output.clear();
        if span == 0 {
            return Ok(&self.output);
        }

        let block_base = self.binning.base_time();
        self.release(span / self.binning.coarse_bin_width(), span);
        debug!("released {span} ns from {block_base}: {} readouts", self.output.len());
        self.router.route(block_base, &self.output, sink)?;
        Ok(&self.output)
    }

    /// Releases every remaining bin and in-flight cluster, e.g. at the end
    /// of a replay.
    ///
    /// # Errors
    /// Returns the first sink error.
    pub fn drain<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> Result<&[Readout]> {
        self.output.clear();
        let block_base = self.binning.base_time();
        let num_coarse = self.binning.num_coarse_bins() as u64;
        self.release(num_coarse, self.binning.event_window());

        // clusters carried past the last bin close against empty fine bins
        if let Some(clusterer) = &mut self.clusterer {
            self.binning.clear_fine_bins();
            clusterer.process_events(
                self.binning.base_time(),
                self.binning.fine_bin_width(),
                self.binning.fine_bins(),
                &mut self.output,
            );
            clusterer.clear();
        }

        self.router.route(block_base, &self.output, sink)?;
        self.router.flush(sink)?;
        Ok(&self.output)
    }

    /// Releases up to `coarse_bins` coarse bins through the clusterer, or
    /// `span` ns of bins directly when clustering is disabled.
    fn release(&mut self, coarse_bins: u64, span: u64) {
        match &mut self.clusterer {
            Some(clusterer) => {
                for _ in 0..coarse_bins {
                    if self.binning.empty() {
                        break;
                    }
                    self.binning.map_to_fine_bins();
                    clusterer.process_events(
                        self.binning.base_time(),
                        self.binning.fine_bin_width(),
                        self.binning.fine_bins(),
                        &mut self.output,
                    );
                    self.binning.clear_fine_bins();
                    self.binning.increment_base();
                }
            }
            None => {
                self.binning.dump_block(span, &mut self.output);
            }
        }
    }

    /// Flushes the sink.
    ///
    /// # Errors
    /// Returns the sink error.
    pub fn flush<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        self.router.flush(sink)
    }

    /// The time bins.
    #[must_use]
    pub fn binning(&self) -> &EventBinning {
        &self.binning
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn counters(&self) -> ProcessingCounters {
        ProcessingCounters {
            routing: self.router.counters(),
            clustering: self
                .clusterer
                .as_ref()
                .map(ParallelClusterer::statistics)
                .unwrap_or_default(),
            ..self.counters
        }
    }
}
