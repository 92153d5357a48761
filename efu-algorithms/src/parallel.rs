//! Parallel clustering across contiguous lanes of fine bins.
//!
//! Each lane owns a [`ClusterManager`] and a private output buffer. Lanes
//! after the first replay the last [`LOOKBACK_BINS`] fine bins of the
//! previous lane so clusters crossing a lane boundary are rebuilt whole.
//! Clusters still open at the end of the last lane are carried into the
//! first lane for the next call.

use crate::ClusterManager;
use efu_core::{ClusterLimits, ClusteringStatistics, Error, Readout, Result};
use log::{debug, trace};
use rayon::prelude::*;
use std::ops::Range;

/// Fine bins replayed by every lane but the first.
///
/// Sufficient while the cluster span does not exceed one fine bin width.
pub const LOOKBACK_BINS: usize = 2;

/// Runs one [`ClusterManager`] per lane on a dedicated worker pool.
pub struct ParallelClusterer {
    lanes: Vec<ClusterManager>,
    outputs: Vec<Vec<Readout>>,
    pool: rayon::ThreadPool,
}

impl ParallelClusterer {
    /// Creates `num_threads` lanes, each with its own pool of `pool_size`
    /// clusters.
    ///
    /// # Errors
    /// Returns an error if `num_threads` is zero or the worker pool cannot
    /// be started.
    pub fn new(num_threads: usize, limits: ClusterLimits, pool_size: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::ConfigError(
                "clustering needs at least one thread".to_string(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("efu-cluster-{i}"))
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;
        debug!("parallel clusterer: {num_threads} lanes of {pool_size} clusters");

        Ok(Self {
            lanes: (0..num_threads)
                .map(|_| ClusterManager::new(limits, pool_size))
                .collect(),
            outputs: vec![Vec::new(); num_threads],
            pool,
        })
    }

    /// Clusters one coarse bin worth of fine bins.
    ///
    /// `fine_bins[i]` covers `[base_time + i * bin_width, base_time + (i + 1) * bin_width)`.
    /// Reduced clusters and any non-neutron readouts are appended to `out`
    /// in lane order; within a lane they follow bin order. Returns the
    /// number of readouts appended.
    pub fn process_events(
        &mut self,
        base_time: u64,
        bin_width: u64,
        fine_bins: &[Vec<Readout>],
        out: &mut Vec<Readout>,
    ) -> usize {
        let num_bins = fine_bins.len();
        let used = self.lanes.len().min(num_bins).max(1);
        let per_lane = num_bins / used;

        let lanes = &mut self.lanes;
        let outputs = &mut self.outputs;
        let emitted: usize = self.pool.install(|| {
            lanes
                .par_iter_mut()
                .zip(outputs.par_iter_mut())
                .enumerate()
                .map(|(lane, (manager, output))| {
                    let range = if lane >= used {
                        num_bins..num_bins
                    } else if lane + 1 == used {
                        lane * per_lane..num_bins
                    } else {
                        lane * per_lane..(lane + 1) * per_lane
                    };
                    process_lane(manager, output, fine_bins, range, lane > 0, base_time, bin_width)
                })
                .sum()
        });

        for output in &mut self.outputs {
            out.append(output);
        }

        if used > 1 {
            // open clusters of every lane but the last were replayed by its successor
            for manager in &mut self.lanes[..used - 1] {
                manager.clear_active();
            }
            let (first, rest) = self.lanes.split_at_mut(1);
            first[0].move_active_clusters(&mut rest[used - 2]);
        }

        trace!("clustered {num_bins} fine bins from {base_time} ns: {emitted} readouts out");
        emitted
    }

    /// Drops every open and pending cluster, e.g. after a time discontinuity.
    pub fn clear(&mut self) {
        for manager in &mut self.lanes {
            manager.clear_active();
            manager.clear_output();
        }
        for output in &mut self.outputs {
            output.clear();
        }
    }

    /// Number of lanes.
    #[must_use]
    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Open clusters across all lanes.
    #[must_use]
    pub fn num_active(&self) -> usize {
        self.lanes.iter().map(ClusterManager::num_active).sum()
    }

    /// Counters summed over all lanes.
    #[must_use]
    pub fn statistics(&self) -> ClusteringStatistics {
        let mut total = ClusteringStatistics::default();
        for manager in &self.lanes {
            total += manager.statistics();
        }
        total
    }
}

/// Clusters the fine bins in `range`, optionally replaying the lookback
/// bins first. Returns the number of readouts appended to `output`.
#[allow(clippy::cast_possible_truncation)]
fn process_lane(
    manager: &mut ClusterManager,
    output: &mut Vec<Readout>,
    fine_bins: &[Vec<Readout>],
    range: Range<usize>,
    lookback: bool,
    base_time: u64,
    bin_width: u64,
) -> usize {
    if range.is_empty() {
        return 0;
    }

    if lookback {
        let replay = range.start.saturating_sub(LOOKBACK_BINS)..range.start;
        for evt in fine_bins[replay].iter().flatten().filter(|r| r.is_neutron()) {
            manager.add_event(evt);
        }
    }

    let mut emitted = 0;
    let start = range.start;
    for (offset, bin) in fine_bins[range].iter().enumerate() {
        for evt in bin {
            if evt.is_neutron() {
                manager.add_event(evt);
            } else {
                output.push(*evt);
                emitted += 1;
            }
        }

        // clusters that started before this bin can no longer grow
        let bin_time = base_time + bin_width * (start + offset) as u64;
        manager.process_active(bin_time.saturating_sub(bin_width), bin_time);
        emitted += manager.flush_output(output);
    }
    emitted + manager.flush_output(output)
}
