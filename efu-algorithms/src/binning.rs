//! Two-level time binning of readouts.
//!
//! Readouts are buffered in a ring of coarse bins covering the event window.
//! The base coarse bin is expanded into fine bins for clustering, then
//! released by advancing the base. All widths and counts are powers of two,
//! so bin indices are shifts and masks.
#![allow(clippy::cast_possible_truncation)]

use efu_core::{BinningParams, Readout, Result};
use log::debug;

/// Ring of coarse time bins feeding a set of fine bins.
pub struct EventBinning {
    params: BinningParams,
    /// Ring index of the bin holding `base_time`.
    base_ix: usize,
    /// Ring index one past the newest occupied bin.
    end_ix: usize,
    /// Start of the base coarse bin, always coarse aligned (ns).
    base_time: u64,
    coarse_width_bits: u32,
    fine_width_bits: u32,
    coarse_mask: usize,
    fine_mask: usize,
    coarse_bins: Vec<Vec<Readout>>,
    fine_bins: Vec<Vec<Readout>>,
}

impl EventBinning {
    /// Creates empty bins anchored at time zero.
    ///
    /// # Errors
    /// Returns an error if the bin layout is invalid.
    pub fn new(params: BinningParams) -> Result<Self> {
        params.validate()?;
        let num_coarse = params.num_coarse_bins();
        let num_fine = params.num_fine_bins();
        debug!(
            "event binning: {num_coarse} coarse bins of {} ns, {num_fine} fine bins of {} ns",
            params.coarse_bin_width(),
            params.fine_bin_width()
        );
        Ok(Self {
            params,
            base_ix: 0,
            end_ix: 0,
            base_time: 0,
            coarse_width_bits: params.coarse_width_bits(),
            fine_width_bits: params.fine_width_bits,
            coarse_mask: num_coarse - 1,
            fine_mask: num_fine - 1,
            coarse_bins: vec![Vec::new(); num_coarse],
            fine_bins: (0..num_fine).map(|_| Vec::with_capacity(128)).collect(),
        })
    }

    /// Appends every readout inside the valid window to its coarse bin.
    ///
    /// Returns the number of readouts accepted; the rest are dropped.
    pub fn insert(&mut self, readouts: &[Readout]) -> usize {
        let mut valid = 0;
        let mut max_t = self.base_time;
        for readout in readouts {
            if self.valid_event_time(readout.timestamp) {
                let ix = self.coarse_index(readout.timestamp);
                self.coarse_bins[ix].push(*readout);
                valid += 1;
                max_t = max_t.max(readout.timestamp);
            }
        }
        if valid > 0 && max_t - self.base_time >= self.time_span() {
            self.end_ix = (self.coarse_index(max_t) + 1) & self.coarse_mask;
        }
        valid
    }

    /// Returns true if `ts` falls inside the window, excluding the last
    /// coarse bin which is kept free so the ring never wraps onto the base.
    #[inline]
    #[must_use]
    pub fn valid_event_time(&self, ts: u64) -> bool {
        ts.checked_sub(self.base_time)
            .is_some_and(|delta| (delta >> self.coarse_width_bits) < self.coarse_mask as u64)
    }

    /// Coarse ring index of `ts`.
    #[inline]
    #[must_use]
    pub fn coarse_index(&self, ts: u64) -> usize {
        (ts >> self.coarse_width_bits) as usize & self.coarse_mask
    }

    /// Fine bin index of `ts`.
    #[inline]
    #[must_use]
    pub fn fine_index(&self, ts: u64) -> usize {
        (ts >> self.fine_width_bits) as usize & self.fine_mask
    }

    /// Moves the base to the coarse bin containing `new_base`.
    ///
    /// Inside the current window the base is advanced bin by bin, dropping
    /// what it passes. Otherwise, or if the bins drain before the new base
    /// is reached, everything is cleared and the ring is re-anchored.
    /// Returns the number of readouts dropped.
    pub fn reset_bins(&mut self, new_base: u64) -> usize {
        let mut dropped = 0;
        if !self.empty() && self.valid_event_time(new_base) {
            let new_ix = self.coarse_index(new_base);
            if self.base_ix != new_ix {
                self.clear_fine_bins();
            }
            while !self.empty() && self.base_ix != new_ix {
                dropped += self.increment_base();
            }
            if self.base_ix == new_ix {
                return dropped;
            }
        }

        self.clear_fine_bins();
        dropped += self.clear_coarse_bins();
        self.base_time = (new_base >> self.coarse_width_bits) << self.coarse_width_bits;
        self.base_ix = self.coarse_index(new_base);
        self.end_ix = self.base_ix;
        dropped
    }

    /// Copies the base coarse bin into the fine bins.
    ///
    /// The coarse bin is left intact. Returns the number of readouts copied.
    pub fn map_to_fine_bins(&mut self) -> usize {
        if self.empty() {
            return 0;
        }
        let (shift, mask) = (self.fine_width_bits, self.fine_mask);
        let bin = &self.coarse_bins[self.base_ix];
        for readout in bin {
            let ix = (readout.timestamp >> shift) as usize & mask;
            self.fine_bins[ix].push(*readout);
        }
        bin.len()
    }

    /// Empties the fine bins, returning the number of readouts removed.
    pub fn clear_fine_bins(&mut self) -> usize {
        clear_all(&mut self.fine_bins)
    }

    /// Empties every coarse bin, returning the number of readouts removed.
    ///
    /// The ring indices are left untouched.
    pub fn clear_coarse_bins(&mut self) -> usize {
        clear_all(&mut self.coarse_bins)
    }

    /// Releases the base coarse bin and advances the base by one bin.
    ///
    /// Returns the number of readouts released. Does nothing when empty.
    pub fn increment_base(&mut self) -> usize {
        if self.empty() {
            return 0;
        }
        let bin = &mut self.coarse_bins[self.base_ix];
        let n = bin.len();
        bin.clear();
        self.base_ix = (self.base_ix + 1) & self.coarse_mask;
        self.base_time += self.params.coarse_bin_width();
        n
    }

    /// Drains whole coarse bins into `out` while the base is earlier than
    /// `base_time + window`. Returns the number of readouts appended.
    pub fn dump_block(&mut self, window: u64, out: &mut Vec<Readout>) -> usize {
        let end_time = self.base_time.saturating_add(window);
        let mut sum = 0;
        while !self.empty() && self.base_time < end_time {
            let bin = &self.coarse_bins[self.base_ix];
            out.extend_from_slice(bin);
            sum += bin.len();
            self.increment_base();
        }
        sum
    }

    /// Returns true if no coarse bin is occupied.
    #[inline]
    #[must_use]
    pub fn empty(&self) -> bool {
        self.base_ix == self.end_ix
    }

    /// Duration covered by the occupied coarse bins (ns).
    #[must_use]
    pub fn time_span(&self) -> u64 {
        let occupied = self.end_ix.wrapping_sub(self.base_ix) & self.coarse_mask;
        self.params.coarse_bin_width() * occupied as u64
    }

    /// Duration covered by the whole coarse ring (ns).
    #[must_use]
    pub fn event_window(&self) -> u64 {
        self.params.coarse_bin_width() * self.params.num_coarse_bins() as u64
    }

    /// Start of the base coarse bin (ns).
    #[inline]
    #[must_use]
    pub fn base_time(&self) -> u64 {
        self.base_time
    }

    /// Start time of the coarse bin `ix` bins after the base.
    #[must_use]
    pub fn bin_time(&self, ix: usize) -> u64 {
        ix as u64 * self.params.coarse_bin_width() + self.base_time
    }

    /// All fine bins, in time order within the base coarse bin.
    #[must_use]
    pub fn fine_bins(&self) -> &[Vec<Readout>] {
        &self.fine_bins
    }

    /// Fine bin at `ix`.
    #[must_use]
    pub fn fine_bin(&self, ix: usize) -> &[Readout] {
        &self.fine_bins[ix]
    }

    /// Coarse bin at ring index `ix`.
    #[must_use]
    pub fn coarse_bin(&self, ix: usize) -> &[Readout] {
        &self.coarse_bins[ix]
    }

    /// Bin layout.
    #[must_use]
    pub fn params(&self) -> BinningParams {
        self.params
    }

    /// Coarse bin width (ns).
    #[must_use]
    pub fn coarse_bin_width(&self) -> u64 {
        self.params.coarse_bin_width()
    }

    /// Fine bin width (ns).
    #[must_use]
    pub fn fine_bin_width(&self) -> u64 {
        self.params.fine_bin_width()
    }

    /// Fine bin width as a power of two.
    #[must_use]
    pub fn fine_width_bits(&self) -> u32 {
        self.fine_width_bits
    }

    /// Number of fine bins.
    #[must_use]
    pub fn num_fine_bins(&self) -> usize {
        self.fine_bins.len()
    }

    /// Number of coarse bins.
    #[must_use]
    pub fn num_coarse_bins(&self) -> usize {
        self.coarse_bins.len()
    }
}

fn clear_all(bins: &mut [Vec<Readout>]) -> usize {
    bins.iter_mut()
        .map(|bin| {
            let n = bin.len();
            bin.clear();
            n
        })
        .sum()
}
