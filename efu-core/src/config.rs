//! Engine configuration loaded from the detector JSON file.
//!
//! The JSON schema uses PascalCase keys grouped into `Detector`, `Clusters`
//! and `EventBinning` sections. Every numeric parameter is validated once at
//! load time; nothing is clamped silently because the binning relies on
//! power-of-two widths.

use crate::{ClusterLimits, Error, Result};
use log::info;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_MICRO: u64 = 1_000;

/// Power-of-two bin layout of the event binning rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinningParams {
    /// Number of coarse bins is `2^coarse_bin_bits`.
    pub coarse_bin_bits: u32,
    /// Fine bin width is `2^fine_width_bits` ns.
    pub fine_width_bits: u32,
    /// Number of fine bins (per coarse bin) is `2^fine_bin_bits`.
    pub fine_bin_bits: u32,
}

impl Default for BinningParams {
    fn default() -> Self {
        Self {
            coarse_bin_bits: 10,
            fine_width_bits: 10,
            fine_bin_bits: 10,
        }
    }
}

impl BinningParams {
    /// Creates a bin layout from the three exponents.
    #[must_use]
    pub fn new(coarse_bin_bits: u32, fine_width_bits: u32, fine_bin_bits: u32) -> Self {
        Self {
            coarse_bin_bits,
            fine_width_bits,
            fine_bin_bits,
        }
    }

    /// Bit shift from a timestamp to its coarse bin number.
    #[inline]
    #[must_use]
    pub fn coarse_width_bits(&self) -> u32 {
        self.fine_bin_bits + self.fine_width_bits
    }

    /// Coarse bin width in ns.
    #[inline]
    #[must_use]
    pub fn coarse_bin_width(&self) -> u64 {
        1 << self.coarse_width_bits()
    }

    /// Fine bin width in ns.
    #[inline]
    #[must_use]
    pub fn fine_bin_width(&self) -> u64 {
        1 << self.fine_width_bits
    }

    /// Number of coarse bins in the ring.
    #[inline]
    #[must_use]
    pub fn num_coarse_bins(&self) -> usize {
        1 << self.coarse_bin_bits
    }

    /// Number of fine bins per coarse bin.
    #[inline]
    #[must_use]
    pub fn num_fine_bins(&self) -> usize {
        1 << self.fine_bin_bits
    }

    /// Checks that the layout yields a usable ring.
    ///
    /// # Errors
    /// Returns an error if there are fewer than two coarse bins or the
    /// combined window does not fit a 64-bit nanosecond timestamp.
    pub fn validate(&self) -> Result<()> {
        if self.coarse_bin_bits == 0 {
            return Err(Error::ConfigError(
                "CoarseBinBits must be at least 1".to_string(),
            ));
        }
        let total = u64::from(self.coarse_bin_bits)
            + u64::from(self.fine_width_bits)
            + u64::from(self.fine_bin_bits);
        // the ring index math keeps the number of coarse bins in a usize
        if total >= 63 || self.coarse_bin_bits >= usize::BITS - 1 {
            return Err(Error::ConfigError(format!(
                "event binning window of 2^{total} ns is too large"
            )));
        }
        Ok(())
    }
}

/// Detector level parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorParams {
    /// Pixel id of the first pixel.
    pub base_pixel: u32,
    /// Detector width in pixels.
    pub x_pixels: u16,
    /// Detector height in pixels.
    pub y_pixels: u16,
    /// How far behind the newest readout the pipeline may run (ns).
    pub event_lag_ns: u64,
    /// Time of flight is measured against chopper frame starts.
    pub tof_mode: bool,
    /// Minimum time of flight in TOF mode (ns).
    pub min_tof_ns: u64,
    /// Idle time before partially filled bins are flushed (ms).
    pub demux_timeout_ms: u64,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            base_pixel: 0,
            x_pixels: 1024,
            y_pixels: 1024,
            event_lag_ns: 50 * NANOS_PER_MILLI,
            tof_mode: false,
            min_tof_ns: 3_000 * NANOS_PER_MICRO,
            demux_timeout_ms: 100,
        }
    }
}

impl DetectorParams {
    /// Maps a detector position to its pixel id.
    ///
    /// Pixels are numbered column-major from `base_pixel`. Returns `None`
    /// for positions outside the detector.
    #[inline]
    #[must_use]
    pub fn pixel_id(&self, x: u16, y: u16) -> Option<u32> {
        if x >= self.x_pixels || y >= self.y_pixels {
            return None;
        }
        let offset = u32::from(x) * u32::from(self.y_pixels) + u32::from(y);
        self.base_pixel.checked_add(offset)
    }

    /// Idle flush window in ns.
    #[must_use]
    pub fn demux_timeout_ns(&self) -> u64 {
        self.demux_timeout_ms.saturating_mul(NANOS_PER_MILLI)
    }
}

/// Clustering stage parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterParams {
    /// Run the clustering stage; otherwise readouts are passed through.
    pub enabled: bool,
    /// Number of parallel lanes.
    pub num_threads: usize,
    /// Proximity limits.
    pub limits: ClusterLimits,
    /// Cluster pool size per lane.
    pub active_clusters: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            enabled: true,
            num_threads: 1,
            limits: ClusterLimits::default(),
            active_clusters: 1000,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Instrument name, informational.
    pub instrument: String,
    /// Readout parser name.
    pub reader: String,
    /// Input transport name.
    pub dae_comms: String,
    /// Detector parameters.
    pub detector: DetectorParams,
    /// Clustering parameters.
    pub clusters: ClusterParams,
    /// Event binning layout.
    pub binning: BinningParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instrument: String::new(),
            reader: "packed".to_string(),
            dae_comms: "udp".to_string(),
            detector: DetectorParams::default(),
            clusters: ClusterParams::default(),
            binning: BinningParams::default(),
        }
    }
}

// Intermediate structs mirroring the JSON schema
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonConfig {
    #[serde(default)]
    instrument: String,
    #[serde(default = "default_reader")]
    reader: String,
    #[serde(rename = "DAEComms", default = "default_comms")]
    dae_comms: String,
    #[serde(default)]
    detector: JsonDetector,
    #[serde(default)]
    clusters: JsonClusters,
    #[serde(default)]
    event_binning: JsonEventBinning,
}

fn default_reader() -> String {
    "packed".to_string()
}

fn default_comms() -> String {
    "udp".to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct JsonDetector {
    base_pixel: u32,
    x_pixels: u16,
    y_pixels: u16,
    /// milliseconds
    event_lag: u64,
    #[serde(rename = "TOFMode")]
    tof_mode: bool,
    /// microseconds
    #[serde(rename = "MinTOF")]
    min_tof: u64,
    demux_timeout: u64,
}

impl Default for JsonDetector {
    fn default() -> Self {
        Self {
            base_pixel: 0,
            x_pixels: 1024,
            y_pixels: 1024,
            event_lag: 50,
            tof_mode: false,
            min_tof: 3_000,
            demux_timeout: 100,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct JsonClusters {
    enabled: bool,
    num_threads: usize,
    max_span: u64,
    #[serde(rename = "MaxDT")]
    max_dt: u64,
    #[serde(rename = "MaxDX")]
    max_dx: u16,
    #[serde(rename = "MaxDY")]
    max_dy: u16,
    active_clusters: usize,
}

impl Default for JsonClusters {
    fn default() -> Self {
        let limits = ClusterLimits::default();
        Self {
            enabled: true,
            num_threads: 1,
            max_span: limits.span_t,
            max_dt: limits.del_t,
            max_dx: limits.del_x,
            max_dy: limits.del_y,
            active_clusters: 1000,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct JsonEventBinning {
    coarse_bin_bits: u32,
    fine_width_bits: u32,
    fine_bin_bits: u32,
}

impl Default for JsonEventBinning {
    fn default() -> Self {
        let params = BinningParams::default();
        Self {
            coarse_bin_bits: params.coarse_bin_bits,
            fine_width_bits: params.fine_width_bits,
            fine_bin_bits: params.fine_bin_bits,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`EngineConfig::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("loading configuration from {}", path.display());
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let json_config: JsonConfig = serde_json::from_reader(reader)?;
        Self::from_json_config(json_config)
    }

    /// Load configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the string is not valid JSON or fails
    /// [`EngineConfig::validate`].
    pub fn from_json(json: &str) -> Result<Self> {
        let json_config: JsonConfig = serde_json::from_str(json)?;
        Self::from_json_config(json_config)
    }

    fn from_json_config(config: JsonConfig) -> Result<Self> {
        let detector = config.detector;
        let clusters = config.clusters;
        let binning = config.event_binning;

        let config = Self {
            instrument: config.instrument,
            reader: config.reader,
            dae_comms: config.dae_comms,
            detector: DetectorParams {
                base_pixel: detector.base_pixel,
                x_pixels: detector.x_pixels,
                y_pixels: detector.y_pixels,
                event_lag_ns: detector.event_lag.saturating_mul(NANOS_PER_MILLI),
                tof_mode: detector.tof_mode,
                min_tof_ns: detector.min_tof.saturating_mul(NANOS_PER_MICRO),
                demux_timeout_ms: detector.demux_timeout,
            },
            clusters: ClusterParams {
                enabled: clusters.enabled,
                num_threads: clusters.num_threads,
                limits: ClusterLimits::new(
                    clusters.max_span,
                    clusters.max_dt,
                    clusters.max_dx,
                    clusters.max_dy,
                ),
                active_clusters: clusters.active_clusters,
            },
            binning: BinningParams::new(
                binning.coarse_bin_bits,
                binning.fine_width_bits,
                binning.fine_bin_bits,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Sets the clustering parameters.
    #[must_use]
    pub fn with_clusters(mut self, clusters: ClusterParams) -> Self {
        self.clusters = clusters;
        self
    }

    /// Sets the binning layout.
    #[must_use]
    pub fn with_binning(mut self, binning: BinningParams) -> Self {
        self.binning = binning;
        self
    }

    /// Sets the detector parameters.
    #[must_use]
    pub fn with_detector(mut self, detector: DetectorParams) -> Self {
        self.detector = detector;
        self
    }

    /// Check every parameter the engine depends on.
    ///
    /// This is called automatically when loading from JSON. For
    /// programmatically built configs, call this before constructing the
    /// engine.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] describing the first invalid parameter.
    pub fn validate(&self) -> Result<()> {
        self.binning.validate()?;

        if self.detector.x_pixels == 0 || self.detector.y_pixels == 0 {
            return Err(Error::ConfigError(
                "XPixels and YPixels must be non-zero".to_string(),
            ));
        }

        if !self.clusters.enabled {
            return Ok(());
        }

        let clusters = &self.clusters;
        if clusters.num_threads == 0 {
            return Err(Error::ConfigError(
                "NumThreads must be at least 1".to_string(),
            ));
        }
        if clusters.active_clusters == 0 {
            return Err(Error::ConfigError(
                "ActiveClusters must be at least 1".to_string(),
            ));
        }
        if clusters.limits.del_x == 0 || clusters.limits.del_y == 0 {
            return Err(Error::ConfigError(
                "MaxDX and MaxDY must be non-zero".to_string(),
            ));
        }

        // each lane replays two fine bins of lookback, which only covers
        // clusters no longer than one fine bin
        let fine_width = self.binning.fine_bin_width();
        if clusters.limits.span_t > fine_width {
            return Err(Error::ConfigError(format!(
                "MaxSpan {} ns exceeds the fine bin width {} ns",
                clusters.limits.span_t, fine_width
            )));
        }
        let min_fine_bins = clusters.num_threads.saturating_mul(2);
        if self.binning.num_fine_bins() < min_fine_bins {
            return Err(Error::ConfigError(format!(
                "{} fine bins cannot be split across {} threads (need at least {})",
                self.binning.num_fine_bins(),
                clusters.num_threads,
                min_fine_bins
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL_CONFIG: &str = r#"{
        "Instrument": "Bilby",
        "Reader": "packed",
        "DAEComms": "udp",
        "Detector": {
            "BasePixel": 100,
            "XPixels": 64,
            "YPixels": 128,
            "EventLag": 20,
            "TOFMode": true,
            "MinTOF": 500,
            "DemuxTimeout": 250
        },
        "Clusters": {
            "Enabled": true,
            "NumThreads": 4,
            "MaxSpan": 900,
            "MaxDT": 300,
            "MaxDX": 5,
            "MaxDY": 10,
            "ActiveClusters": 2000
        },
        "EventBinning": {
            "CoarseBinBits": 8,
            "FineWidthBits": 10,
            "FineBinBits": 6
        }
    }"#;

    #[test]
    fn test_json_loading() {
        let config = EngineConfig::from_json(FULL_CONFIG).expect("Failed to parse JSON");

        assert_eq!(config.instrument, "Bilby");
        assert_eq!(config.reader, "packed");
        assert_eq!(config.dae_comms, "udp");
        assert_eq!(config.detector.base_pixel, 100);
        assert_eq!(config.detector.event_lag_ns, 20_000_000);
        assert!(config.detector.tof_mode);
        assert_eq!(config.detector.min_tof_ns, 500_000);
        assert_eq!(config.detector.demux_timeout_ns(), 250_000_000);
        assert_eq!(config.clusters.num_threads, 4);
        assert_eq!(config.clusters.limits, ClusterLimits::new(900, 300, 5, 10));
        assert_eq!(config.clusters.active_clusters, 2000);
        assert_eq!(config.binning.num_coarse_bins(), 256);
        assert_eq!(config.binning.fine_bin_width(), 1024);
        assert_eq!(config.binning.coarse_bin_width(), 1 << 16);
    }

    #[test]
    fn test_json_defaults() {
        let config = EngineConfig::from_json(r#"{ "Instrument": "Pelican" }"#)
            .expect("Should parse minimal config");

        assert_eq!(config.instrument, "Pelican");
        assert_eq!(config.dae_comms, "udp");
        assert_eq!(config.detector, DetectorParams::default());
        assert_eq!(config.clusters, ClusterParams::default());
        assert_eq!(config.binning, BinningParams::default());
        assert_eq!(config.detector.min_tof_ns, 3_000_000);
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(FULL_CONFIG.as_bytes()).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.detector.x_pixels, 64);
        assert!(EngineConfig::from_file("/nonexistent/efu.json").is_err());
    }

    #[test]
    fn test_rejects_malformed_json() {
        let result = EngineConfig::from_json(r#"{ "Clusters": { "NumThreads": "four" } }"#);
        assert!(matches!(result, Err(Error::Json(_))));
    }

    fn assert_config_error(json: &str, needle: &str) {
        match EngineConfig::from_json(json) {
            Err(Error::ConfigError(msg)) => {
                assert!(msg.contains(needle), "unexpected message: {msg}");
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_failures() {
        assert_config_error(r#"{ "Clusters": { "NumThreads": 0 } }"#, "NumThreads");
        assert_config_error(r#"{ "Clusters": { "ActiveClusters": 0 } }"#, "ActiveClusters");
        assert_config_error(r#"{ "Clusters": { "MaxDX": 0 } }"#, "MaxDX");
        assert_config_error(r#"{ "Clusters": { "MaxSpan": 5000 } }"#, "MaxSpan");
        assert_config_error(r#"{ "EventBinning": { "CoarseBinBits": 0 } }"#, "CoarseBinBits");
        assert_config_error(
            r#"{ "EventBinning": { "CoarseBinBits": 30, "FineWidthBits": 20, "FineBinBits": 20 } }"#,
            "too large",
        );
        assert_config_error(
            r#"{ "Clusters": { "NumThreads": 8 }, "EventBinning": { "FineBinBits": 3 } }"#,
            "fine bins",
        );
        assert_config_error(r#"{ "Detector": { "XPixels": 0 } }"#, "XPixels");
    }

    #[test]
    fn test_disabled_clustering_skips_cluster_checks() {
        let config = EngineConfig::from_json(
            r#"{ "Clusters": { "Enabled": false, "NumThreads": 0, "MaxSpan": 100000 } }"#,
        )
        .unwrap();
        assert!(!config.clusters.enabled);
    }

    #[test]
    fn test_pixel_id() {
        let detector = DetectorParams {
            base_pixel: 1000,
            x_pixels: 4,
            y_pixels: 8,
            ..DetectorParams::default()
        };
        assert_eq!(detector.pixel_id(0, 0), Some(1000));
        assert_eq!(detector.pixel_id(0, 7), Some(1007));
        assert_eq!(detector.pixel_id(1, 0), Some(1008));
        assert_eq!(detector.pixel_id(3, 7), Some(1031));
        assert_eq!(detector.pixel_id(4, 0), None);
        assert_eq!(detector.pixel_id(0, 8), None);
    }
}
