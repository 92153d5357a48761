//! Readout parser interface.

use crate::{Readout, Result};

/// Outcome of parsing one raw buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseSummary {
    /// Earliest readout timestamp, `u64::MAX` if nothing was decoded.
    pub ts_min: u64,
    /// Latest readout timestamp, 0 if nothing was decoded.
    pub ts_max: u64,
    /// Bytes that could not be decoded.
    pub byte_errors: u64,
    /// Buffer sequence gaps detected.
    pub seq_errors: u64,
}

impl Default for ParseSummary {
    fn default() -> Self {
        Self {
            ts_min: u64::MAX,
            ts_max: 0,
            byte_errors: 0,
            seq_errors: 0,
        }
    }
}

impl ParseSummary {
    /// Widens the timestamp range to include `ts`.
    #[inline]
    pub fn observe(&mut self, ts: u64) {
        self.ts_min = self.ts_min.min(ts);
        self.ts_max = self.ts_max.max(ts);
    }

    /// Returns true if at least one timestamp was observed.
    #[must_use]
    pub fn has_readouts(&self) -> bool {
        self.ts_min <= self.ts_max
    }
}

/// Decodes vendor buffers into [`Readout`] records.
///
/// The parser owns its output buffer so it can be reused between calls;
/// `readouts` returns the records decoded by the most recent `parse`.
pub trait ReadoutParser: Send {
    /// Decodes one raw buffer.
    ///
    /// # Errors
    /// Returns an error only if the buffer cannot be interpreted at all;
    /// partially corrupt buffers are reported through the byte and sequence
    /// error counts of the summary.
    fn parse(&mut self, buffer: &[u8]) -> Result<ParseSummary>;

    /// Readouts decoded by the last call to `parse`.
    fn readouts(&self) -> &[Readout];

    /// Returns the name of the parser.
    fn name(&self) -> &'static str;
}
