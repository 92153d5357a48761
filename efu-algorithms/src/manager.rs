//! Pooled cluster manager.
//!
//! Key characteristics:
//! - Fixed arena of clusters allocated once at construction
//! - Free, active and output index lists partition the arena, so every
//!   slot is referenced by exactly one list at all times
//! - Bounding-box prefilter before the per-hit proximity scan
//! - Pool exhaustion drops the readout and counts it, it never grows

use efu_core::{Cluster, ClusterLimits, ClusteringStatistics, Readout};
use log::{debug, warn};

/// Precomputed proximity test for a set of limits.
#[derive(Clone, Debug)]
struct Proximity {
    limits: ClusterLimits,
    del_x2: u128,
    del_y2: u128,
    del_xy2: u128,
}

impl Proximity {
    fn new(limits: ClusterLimits) -> Self {
        let del_x2 = u128::from(limits.del_x) * u128::from(limits.del_x);
        let del_y2 = u128::from(limits.del_y) * u128::from(limits.del_y);
        Self {
            limits,
            del_x2,
            del_y2,
            del_xy2: del_x2 * del_y2,
        }
    }

    /// Time gap within `del_t` and inside the `del_x` by `del_y` ellipse.
    #[inline]
    fn events_close(&self, a: &Readout, b: &Readout) -> bool {
        if a.timestamp.abs_diff(b.timestamp) > self.limits.del_t {
            return false;
        }
        let dx = u128::from(a.x_posn.abs_diff(b.x_posn));
        let dy = u128::from(a.y_posn.abs_diff(b.y_posn));
        dx * dx * self.del_y2 + dy * dy * self.del_x2 <= self.del_xy2
    }

    fn matches(&self, cluster: &Cluster, evt: &Readout) -> bool {
        let limits = &self.limits;
        let t = evt.timestamp;
        let time = &cluster.time_range;
        if t.saturating_add(limits.del_t) < time.lo
            || t > time.hi.saturating_add(limits.del_t)
            || t > time.lo.saturating_add(limits.span_t)
        {
            return false;
        }

        let (x, y) = (u32::from(evt.x_posn), u32::from(evt.y_posn));
        let (del_x, del_y) = (u32::from(limits.del_x), u32::from(limits.del_y));
        if x + del_x < u32::from(cluster.x_range.lo)
            || x > u32::from(cluster.x_range.hi) + del_x
            || y + del_y < u32::from(cluster.y_range.lo)
            || y > u32::from(cluster.y_range.hi) + del_y
        {
            return false;
        }

        cluster.hits.iter().any(|hit| self.events_close(hit, evt))
    }
}

/// Groups neutron readouts into clusters using a fixed pool of slots.
///
/// Clusters move Free -> Active -> (merged away | Output) -> Free.
pub struct ClusterManager {
    /// Cluster arena, never resized after construction.
    pool: Vec<Cluster>,
    /// Slots available for new clusters.
    free: Vec<usize>,
    /// Open clusters that may still receive readouts.
    active: Vec<usize>,
    /// Closed clusters waiting to be flushed.
    output: Vec<usize>,
    /// Positions in `active` matched by the current readout.
    matches: Vec<usize>,
    proximity: Proximity,
    stats: ClusteringStatistics,
    /// Set while the pool is exhausted, so the warning is logged once.
    saturated: bool,
}

impl ClusterManager {
    /// Creates a manager with `pool_size` cluster slots.
    #[must_use]
    pub fn new(limits: ClusterLimits, pool_size: usize) -> Self {
        let mut pool = Vec::with_capacity(pool_size);
        pool.resize_with(pool_size, Cluster::new);
        Self {
            pool,
            // reversed so slots are handed out in ascending order
            free: (0..pool_size).rev().collect(),
            active: Vec::with_capacity(pool_size),
            output: Vec::with_capacity(pool_size),
            matches: Vec::with_capacity(8),
            proximity: Proximity::new(limits),
            stats: ClusteringStatistics::default(),
            saturated: false,
        }
    }

    /// Replaces the proximity limits.
    pub fn set_limits(&mut self, limits: ClusterLimits) {
        self.proximity = Proximity::new(limits);
    }

    /// Current proximity limits.
    #[must_use]
    pub fn limits(&self) -> ClusterLimits {
        self.proximity.limits
    }

    /// Adds a readout to the matching active cluster.
    ///
    /// With no match a new cluster is started, dropping the readout if the
    /// pool is exhausted. When the readout bridges several clusters they are
    /// all merged into the first match before it is appended.
    pub fn add_event(&mut self, evt: &Readout) {
        let Self {
            pool,
            active,
            matches,
            proximity,
            ..
        } = self;
        matches.clear();
        matches.extend(
            active
                .iter()
                .enumerate()
                .filter(|&(_, &slot)| proximity.matches(&pool[slot], evt))
                .map(|(pos, _)| pos),
        );

        let Some(&first) = self.matches.first() else {
            self.start_cluster(evt);
            return;
        };

        let target = self.active[first];
        // highest position first so swap_remove never moves a pending match
        for i in (1..self.matches.len()).rev() {
            let slot = self.active.swap_remove(self.matches[i]);
            debug_assert_ne!(slot, target);
            let source = std::mem::take(&mut self.pool[slot]);
            self.pool[target].add_cluster(&source);
            self.pool[slot] = source;
            self.pool[slot].clear();
            self.free.push(slot);
            self.stats.clusters_merged += 1;
        }
        self.pool[target].add_event(evt);
        self.stats.events_added += 1;
    }

    fn start_cluster(&mut self, evt: &Readout) {
        if let Some(slot) = self.free.pop() {
            self.pool[slot].new_cluster(evt);
            self.active.push(slot);
            self.stats.clusters_created += 1;
            self.stats.events_added += 1;
            self.saturated = false;
        } else {
            if !self.saturated {
                warn!(
                    "cluster pool of {} exhausted, dropping readouts",
                    self.pool.len()
                );
                self.saturated = true;
            }
            self.stats.events_dropped += 1;
        }
    }

    /// Closes active clusters by their earliest hit time.
    ///
    /// Clusters starting before `start` are discarded, those starting in
    /// `[start, end)` move to the output list and the rest stay active.
    /// Returns the number of discarded clusters.
    pub fn process_active(&mut self, start: u64, end: u64) -> usize {
        let Self {
            pool,
            free,
            active,
            output,
            ..
        } = self;
        let mut discarded = 0;
        active.retain(|&slot| {
            let lo = pool[slot].start_time();
            if lo < start {
                free.push(slot);
                discarded += 1;
                false
            } else if lo < end {
                output.push(slot);
                false
            } else {
                true
            }
        });
        self.stats.clusters_discarded += discarded as u64;
        discarded
    }

    /// Returns every active cluster to the pool without emitting it.
    pub fn clear_active(&mut self) -> usize {
        let n = self.active.len();
        self.free.append(&mut self.active);
        n
    }

    /// Returns every output cluster to the pool without emitting it.
    pub fn clear_output(&mut self) -> usize {
        let n = self.output.len();
        self.free.append(&mut self.output);
        n
    }

    /// Reduces every output cluster into `out` and returns the slots to the
    /// pool. Returns the number of readouts appended.
    pub fn flush_output(&mut self, out: &mut Vec<Readout>) -> usize {
        let n = self.output.len();
        out.reserve(n);
        for slot in self.output.drain(..) {
            out.push(self.pool[slot].as_readout());
            self.free.push(slot);
        }
        self.stats.clusters_emitted += n as u64;
        n
    }

    /// Copies every active cluster of `other` into this manager and
    /// releases them from `other`.
    ///
    /// Clusters that do not fit in the remaining pool are dropped and their
    /// hits counted as dropped. Returns the number of clusters moved.
    pub fn move_active_clusters(&mut self, other: &mut ClusterManager) -> usize {
        let mut moved = 0;
        for slot in other.active.drain(..) {
            if let Some(dst) = self.free.pop() {
                self.pool[dst].clone_from(&other.pool[slot]);
                self.active.push(dst);
                moved += 1;
            } else {
                self.stats.events_dropped += other.pool[slot].len() as u64;
            }
            other.free.push(slot);
        }
        if moved > 0 {
            debug!("carried {moved} open clusters across lanes");
        }
        self.stats.clusters_transferred += moved as u64;
        moved
    }

    /// Iterates over the open clusters.
    pub fn active_clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.active.iter().map(|&slot| &self.pool[slot])
    }

    /// Number of open clusters.
    #[must_use]
    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    /// Number of closed clusters waiting to be flushed.
    #[must_use]
    pub fn num_output(&self) -> usize {
        self.output.len()
    }

    /// Number of free cluster slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.free.len()
    }

    /// Total number of cluster slots.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Counters accumulated since construction.
    #[must_use]
    pub fn statistics(&self) -> ClusteringStatistics {
        self.stats
    }
}
