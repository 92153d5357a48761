//! efu-core: Core types for neutron event formation.
//!
//! This crate provides the readout record produced by detector parsers,
//! the cluster accumulator used by the clustering engine, and the engine
//! configuration.
//!

pub mod clustering;
pub mod config;
pub mod error;
pub mod parser;
pub mod readout;

pub use clustering::{Cluster, ClusterLimits, ClusteringStatistics, Moments, Range};
pub use config::{BinningParams, ClusterParams, DetectorParams, EngineConfig};
pub use error::{Error, Result};
pub use parser::{ParseSummary, ReadoutParser};
pub use readout::{EventType, Readout};
