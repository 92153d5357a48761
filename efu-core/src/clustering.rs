//! Cluster accumulator and clustering parameter types.

use crate::Readout;
use std::ops::AddAssign;

/// Inclusive running range of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Range<T> {
    /// Smallest value seen.
    pub lo: T,
    /// Largest value seen.
    pub hi: T,
}

impl<T: Copy + Ord> Range<T> {
    /// Creates a range covering a single value.
    #[inline]
    pub fn point(value: T) -> Self {
        Self {
            lo: value,
            hi: value,
        }
    }

    /// Widens the range to include `value`.
    #[inline]
    pub fn extend(&mut self, value: T) {
        self.lo = self.lo.min(value);
        self.hi = self.hi.max(value);
    }

    /// Widens the range to include `other`.
    #[inline]
    pub fn merge(&mut self, other: &Self) {
        self.lo = self.lo.min(other.lo);
        self.hi = self.hi.max(other.hi);
    }
}

/// Weighted first and second moments of hit positions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Moments {
    /// Sum of weights.
    pub wgt: f64,
    /// Sum of `w * x`.
    pub wgt_x: f64,
    /// Sum of `w * y`.
    pub wgt_y: f64,
    /// Sum of `w * x^2`.
    pub wgt_x2: f64,
    /// Sum of `w * y^2`.
    pub wgt_y2: f64,
}

impl Moments {
    /// Moments of a single weighted point.
    #[must_use]
    pub fn new(w: f64, x: f64, y: f64) -> Self {
        Self {
            wgt: w,
            wgt_x: w * x,
            wgt_y: w * y,
            wgt_x2: w * x * x,
            wgt_y2: w * y * y,
        }
    }

    /// Folds a weighted point into the moments.
    #[inline]
    pub fn add(&mut self, w: f64, x: f64, y: f64) {
        self.wgt += w;
        self.wgt_x += w * x;
        self.wgt_y += w * y;
        self.wgt_x2 += w * x * x;
        self.wgt_y2 += w * y * y;
    }

    /// Folds another set of moments into these.
    pub fn merge(&mut self, other: &Self) {
        self.wgt += other.wgt;
        self.wgt_x += other.wgt_x;
        self.wgt_y += other.wgt_y;
        self.wgt_x2 += other.wgt_x2;
        self.wgt_y2 += other.wgt_y2;
    }

    /// Resets all sums to zero.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Weighted mean x position.
    #[must_use]
    pub fn mean_x(&self) -> f64 {
        self.wgt_x / self.wgt
    }

    /// Weighted mean y position.
    #[must_use]
    pub fn mean_y(&self) -> f64 {
        self.wgt_y / self.wgt
    }

    /// Unnormalised second central moment in x: `sum(w*x^2) - sum(w*x)^2 / sum(w)`.
    #[must_use]
    pub fn scatter_x(&self) -> f64 {
        self.wgt_x2 - self.wgt_x * self.wgt_x / self.wgt
    }

    /// Unnormalised second central moment in y.
    #[must_use]
    pub fn scatter_y(&self) -> f64 {
        self.wgt_y2 - self.wgt_y * self.wgt_y / self.wgt
    }

    /// Weighted variance in x.
    #[must_use]
    pub fn variance_x(&self) -> f64 {
        self.scatter_x() / self.wgt
    }

    /// Weighted variance in y.
    #[must_use]
    pub fn variance_y(&self) -> f64 {
        self.scatter_y() / self.wgt
    }
}

/// A group of readouts believed to come from one neutron capture.
///
/// Ranges and moments are maintained incrementally as hits are added and
/// are never recomputed from the hit list.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    /// Hits belonging to this cluster.
    pub hits: Vec<Readout>,
    /// Time range of the hits (ns).
    pub time_range: Range<u64>,
    /// X range of the hits.
    pub x_range: Range<u16>,
    /// Y range of the hits.
    pub y_range: Range<u16>,
    /// Amplitude weighted moments.
    pub moment: Moments,
    /// Moments weighted by amplitude squared.
    pub moment2: Moments,
}

impl Cluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hits: Vec::with_capacity(16),
            ..Self::default()
        }
    }

    /// Discards any existing hits and seeds the cluster from `evt`.
    pub fn new_cluster(&mut self, evt: &Readout) {
        self.hits.clear();
        self.hits.push(*evt);
        self.time_range = Range::point(evt.timestamp);
        self.x_range = Range::point(evt.x_posn);
        self.y_range = Range::point(evt.y_posn);
        let (w, x, y) = weighted_point(evt);
        self.moment = Moments::new(w, x, y);
        self.moment2 = Moments::new(w * w, x, y);
    }

    /// Appends `evt`, extending the ranges and folding the moments.
    pub fn add_event(&mut self, evt: &Readout) {
        if self.hits.is_empty() {
            self.new_cluster(evt);
            return;
        }
        self.hits.push(*evt);
        self.time_range.extend(evt.timestamp);
        self.x_range.extend(evt.x_posn);
        self.y_range.extend(evt.y_posn);
        let (w, x, y) = weighted_point(evt);
        self.moment.add(w, x, y);
        self.moment2.add(w * w, x, y);
    }

    /// Folds every hit of `other` into this cluster.
    ///
    /// The caller is responsible for clearing `other`.
    pub fn add_cluster(&mut self, other: &Cluster) {
        for evt in &other.hits {
            self.add_event(evt);
        }
    }

    /// Removes all hits and zeroes the moments.
    pub fn clear(&mut self) {
        self.hits.clear();
        self.moment.clear();
        self.moment2.clear();
    }

    /// Number of hits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Returns true if the cluster holds no hits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Timestamp of the earliest hit.
    #[must_use]
    pub fn start_time(&self) -> u64 {
        self.time_range.lo
    }

    /// Reduces the cluster to a single readout.
    ///
    /// The result carries the earliest hit time, the weighted centroid and
    /// the total weight; type, source and data come from the first hit.
    /// An empty cluster reduces to a zeroed readout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn as_readout(&self) -> Readout {
        let Some(first) = self.hits.first() else {
            return Readout::default();
        };
        let mut readout = *first;
        readout.timestamp = self.time_range.lo;
        let wgt = self.moment.wgt;
        if wgt > 0.0 {
            // `as` saturates on out-of-range floats
            readout.x_posn = (self.moment.wgt_x / wgt).round() as u16;
            readout.y_posn = (self.moment.wgt_y / wgt).round() as u16;
        } else {
            readout.x_posn = self.x_range.lo;
            readout.y_posn = self.y_range.lo;
        }
        readout.weight = wgt.round() as u16;
        readout
    }
}

#[inline]
fn weighted_point(evt: &Readout) -> (f64, f64, f64) {
    (
        f64::from(evt.weight),
        f64::from(evt.x_posn),
        f64::from(evt.y_posn),
    )
}

/// Proximity limits used to decide whether readouts belong together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterLimits {
    /// Maximum duration of a cluster from its first hit (ns).
    pub span_t: u64,
    /// Maximum time gap between neighbouring hits (ns).
    pub del_t: u64,
    /// Maximum x gap between neighbouring hits (pixels).
    pub del_x: u16,
    /// Maximum y gap between neighbouring hits (pixels).
    pub del_y: u16,
}

impl Default for ClusterLimits {
    fn default() -> Self {
        Self {
            span_t: 900,
            del_t: 100,
            del_x: 2,
            del_y: 2,
        }
    }
}

impl ClusterLimits {
    /// Creates limits from explicit values.
    #[must_use]
    pub fn new(span_t: u64, del_t: u64, del_x: u16, del_y: u16) -> Self {
        Self {
            span_t,
            del_t,
            del_x,
            del_y,
        }
    }

    /// Sets the maximum cluster span.
    #[must_use]
    pub fn with_span_t(mut self, span_t: u64) -> Self {
        self.span_t = span_t;
        self
    }

    /// Sets the maximum time gap.
    #[must_use]
    pub fn with_del_t(mut self, del_t: u64) -> Self {
        self.del_t = del_t;
        self
    }

    /// Sets the maximum spatial gaps.
    #[must_use]
    pub fn with_del_xy(mut self, del_x: u16, del_y: u16) -> Self {
        self.del_x = del_x;
        self.del_y = del_y;
        self
    }
}

/// Running counters kept by a cluster manager.
///
/// Summed over parallel lanes, the counters include the lookback readouts
/// each lane replays: a cluster rebuilt from a neighbour's bins counts as
/// created (and its readouts as added) in both lanes, and is discarded by
/// the lane that does not own it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusteringStatistics {
    /// Readouts accepted into a cluster.
    pub events_added: u64,
    /// Readouts dropped because the cluster pool was exhausted.
    pub events_dropped: u64,
    /// Clusters started.
    pub clusters_created: u64,
    /// Clusters absorbed into another by a bridging readout.
    pub clusters_merged: u64,
    /// Clusters discarded because they started before the processing window.
    pub clusters_discarded: u64,
    /// Clusters reduced and emitted.
    pub clusters_emitted: u64,
    /// Clusters copied in from another manager.
    pub clusters_transferred: u64,
}

impl AddAssign for ClusteringStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.events_added += rhs.events_added;
        self.events_dropped += rhs.events_dropped;
        self.clusters_created += rhs.clusters_created;
        self.clusters_merged += rhs.clusters_merged;
        self.clusters_discarded += rhs.clusters_discarded;
        self.clusters_emitted += rhs.clusters_emitted;
        self.clusters_transferred += rhs.clusters_transferred;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_events(xs: &[u16], ys: &[u16]) -> Vec<Readout> {
        xs.iter()
            .zip(ys)
            .enumerate()
            .map(|(i, (&x, &y))| Readout::neutron(1000 + 500 * i as u64, x, y, 1))
            .collect()
    }

    fn stats_events() -> Vec<Readout> {
        unit_events(
            &[101, 99, 102, 98, 102, 98, 103, 97],
            &[108, 92, 100, 100, 100, 100, 100, 100],
        )
    }

    #[test]
    fn test_cluster_statistics() {
        let mut cluster = Cluster::new();
        for evt in &stats_events() {
            cluster.add_event(evt);
        }

        assert_eq!(cluster.len(), 8);
        assert_relative_eq!(cluster.moment.mean_x(), 100.0);
        assert_relative_eq!(cluster.moment.scatter_x(), 36.0);
        assert_relative_eq!(cluster.moment.variance_x(), 4.5);
        assert_relative_eq!(cluster.moment2.mean_x(), 100.0);
        assert_relative_eq!(cluster.moment2.scatter_x(), 36.0);
        assert_relative_eq!(cluster.moment.mean_y(), 100.0);
        assert_eq!(cluster.time_range, Range { lo: 1000, hi: 4500 });
        assert_eq!(cluster.x_range, Range { lo: 97, hi: 103 });
        assert_eq!(cluster.y_range, Range { lo: 92, hi: 108 });
    }

    #[test]
    fn test_cluster_merge_matches_single_pass() {
        let events = stats_events();
        let mut whole = Cluster::new();
        for evt in &events {
            whole.add_event(evt);
        }

        let mut first = Cluster::new();
        let mut second = Cluster::new();
        for evt in &events[..4] {
            first.add_event(evt);
        }
        for evt in &events[4..] {
            second.add_event(evt);
        }
        first.add_cluster(&second);
        second.clear();

        assert_eq!(first.len(), whole.len());
        assert!(second.is_empty());
        assert_relative_eq!(first.moment.wgt, whole.moment.wgt);
        assert_relative_eq!(first.moment.wgt_x, whole.moment.wgt_x);
        assert_relative_eq!(first.moment.wgt_y2, whole.moment.wgt_y2);
        assert_relative_eq!(first.moment.scatter_x(), 36.0);
        assert_relative_eq!(first.moment2.scatter_x(), 36.0);
        assert_eq!(first.time_range, whole.time_range);
    }

    #[test]
    fn test_new_cluster_discards_hits() {
        let mut cluster = Cluster::new();
        for evt in &stats_events() {
            cluster.add_event(evt);
        }
        let seed = Readout::neutron(7, 3, 4, 10);
        cluster.new_cluster(&seed);

        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster.time_range, Range::point(7));
        assert_relative_eq!(cluster.moment.wgt, 10.0);
        assert_relative_eq!(cluster.moment2.wgt, 100.0);
    }

    #[test]
    fn test_as_readout() {
        let mut cluster = Cluster::new();
        cluster.add_event(&Readout::neutron(2000, 10, 20, 3));
        cluster.add_event(&Readout::neutron(1500, 14, 20, 1));

        let reduced = cluster.as_readout();
        assert_eq!(reduced.timestamp, 1500);
        assert_eq!(reduced.x_posn, 11);
        assert_eq!(reduced.y_posn, 20);
        assert_eq!(reduced.weight, 4);
        assert!(reduced.is_neutron());
    }

    #[test]
    fn test_as_readout_empty_and_saturating() {
        assert_eq!(Cluster::new().as_readout(), Readout::default());

        let mut cluster = Cluster::new();
        for i in 0..3 {
            cluster.add_event(&Readout::neutron(i, 1, 1, u16::MAX));
        }
        assert_eq!(cluster.as_readout().weight, u16::MAX);
    }

    #[test]
    fn test_statistics_add_assign() {
        let mut total = ClusteringStatistics::default();
        let lane = ClusteringStatistics {
            events_added: 5,
            clusters_created: 2,
            clusters_emitted: 1,
            ..Default::default()
        };
        total += lane;
        total += lane;
        assert_eq!(total.events_added, 10);
        assert_eq!(total.clusters_created, 4);
        assert_eq!(total.clusters_emitted, 2);
    }
}
