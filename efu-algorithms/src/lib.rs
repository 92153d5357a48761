//! efu-algorithms: Time binning and clustering of neutron readouts.
//!
//! This crate provides the event formation engine:
//! - **`ClusterManager`** - pooled, merge-on-bridge clustering of a readout stream
//! - **`EventBinning`** - power-of-two coarse/fine time bins
//! - **`ParallelClusterer`** - fork-join clustering of fine bins across lanes
//! - **`EventRouter`** - pulse tracking and per-type routing to an `EventSink`
//! - **`EventProcessor`** - the stage run by the processing thread
//!
#![warn(missing_docs)]

mod binning;
mod manager;
mod parallel;
mod processing;
mod routing;

pub use binning::EventBinning;
pub use manager::ClusterManager;
pub use parallel::{ParallelClusterer, LOOKBACK_BINS};
pub use processing::{EventProcessor, ProcessingCounters, POLL_INTERVAL};
pub use routing::{EventRouter, EventSink, RoutingCounters};

// Re-export core clustering types
pub use efu_core::clustering::{Cluster, ClusterLimits, ClusteringStatistics};
