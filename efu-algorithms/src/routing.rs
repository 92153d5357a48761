//! Routing of processed readouts to an event sink.
//!
//! The router converts neutrons into (time-of-flight, pixel id) pairs and
//! forwards frame, beam monitor and custom events. It owns the pulse time
//! the time of flight is measured against.

use efu_core::{DetectorParams, EventType, Readout, Result};
use log::trace;
use std::collections::VecDeque;

const ONE_SECOND_NS: u64 = 1_000_000_000;

/// Consumer of routed events.
///
/// Neutrons are reported relative to the most recent `pulse`; a sink
/// typically batches them per pulse and publishes the batch on the next
/// `pulse` or `flush`.
pub trait EventSink {
    /// Starts a new pulse. Pending neutrons belong to the previous pulse.
    ///
    /// # Errors
    /// Returns an error if pending output cannot be written.
    fn pulse(&mut self, pulse_time: u64) -> Result<()>;

    /// A neutron `tof` ns after the current pulse.
    ///
    /// # Errors
    /// Returns an error if the event cannot be written.
    fn neutron(&mut self, tof: u64, pixel: u32) -> Result<()>;

    /// A chopper frame start, primary or auxiliary.
    ///
    /// # Errors
    /// Returns an error if the event cannot be written.
    fn frame(&mut self, timestamp: u64, auxiliary: bool) -> Result<()>;

    /// A beam monitor reading.
    ///
    /// # Errors
    /// Returns an error if the event cannot be written.
    fn beam_monitor(&mut self, timestamp: u64, count: u32) -> Result<()>;

    /// A custom event with an opaque payload.
    ///
    /// # Errors
    /// Returns an error if the event cannot be written.
    fn custom(&mut self, timestamp: u64, data: u32) -> Result<()>;

    /// Publishes everything pending.
    ///
    /// # Errors
    /// Returns an error if pending output cannot be written.
    fn flush(&mut self) -> Result<()>;
}

/// Per-type counts of routed readouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingCounters {
    /// Neutrons forwarded to the sink.
    pub events: u64,
    /// Neutrons without a pulse or pixel, and readouts of unroutable type.
    pub event_errors: u64,
    /// Primary frame starts.
    pub frames: u64,
    /// Auxiliary frame starts.
    pub aux_frames: u64,
    /// Beam monitor readings.
    pub beam_monitor: u64,
    /// Custom events.
    pub custom_events: u64,
}

/// Routes readouts by type and tracks the pulse time.
pub struct EventRouter {
    detector: DetectorParams,
    fine_width_bits: u32,
    /// Frame starts must lead a neutron by this much to be its pulse (TOF mode).
    tof_delay: u64,
    pulse_time: Option<u64>,
    /// Neutrons sent since the last pulse or flush.
    pending: u64,
    /// Queued frame starts not yet in use (TOF mode).
    frames: VecDeque<u64>,
    cur_frame: Option<u64>,
    /// Fine bin floor of the latest neutron checked against the frame queue.
    event_base_time: u64,
    counters: RoutingCounters,
}

impl EventRouter {
    /// Creates a router for `detector`. In TOF mode, neutron times are
    /// floored to the fine bin width `2^fine_width_bits` before looking up
    /// their frame.
    #[must_use]
    pub fn new(detector: DetectorParams, fine_width_bits: u32) -> Self {
        let tof_delay = detector.min_tof_ns + (1u64 << fine_width_bits);
        Self {
            detector,
            fine_width_bits,
            tof_delay,
            pulse_time: None,
            pending: 0,
            frames: VecDeque::new(),
            cur_frame: None,
            event_base_time: 0,
            counters: RoutingCounters::default(),
        }
    }

    /// Routes one processed block whose first coarse bin starts at
    /// `block_base`.
    ///
    /// # Errors
    /// Returns the first sink error; the rest of the block is not routed.
    pub fn route<S: EventSink + ?Sized>(
        &mut self,
        block_base: u64,
        readouts: &[Readout],
        sink: &mut S,
    ) -> Result<()> {
        if readouts.is_empty() {
            return Ok(());
        }
        if !self.detector.tof_mode {
            // clusters carried over from the previous block start before its base
            let start = readouts
                .iter()
                .filter(|evt| evt.is_neutron())
                .map(|evt| evt.timestamp)
                .min()
                .map_or(block_base, |ts| ts.min(block_base));
            self.check_pulse_time(block_base, start, sink)?;
        }

        for evt in readouts {
            match evt.event_type {
                EventType::Neutron => self.route_neutron(evt, sink)?,
                EventType::FrameStart => {
                    sink.frame(evt.timestamp, false)?;
                    if self.detector.tof_mode {
                        self.frames.push_back(evt.timestamp);
                        if self.cur_frame.is_none() {
                            if let Some(first) = self.frames.pop_front() {
                                self.cur_frame = Some(first);
                                self.set_pulse_time(first, sink)?;
                            }
                        }
                    }
                    self.counters.frames += 1;
                }
                EventType::FrameAuxStart => {
                    sink.frame(evt.timestamp, true)?;
                    self.counters.aux_frames += 1;
                }
                EventType::BeamMonitor => {
                    sink.beam_monitor(evt.timestamp, evt.data)?;
                    self.counters.beam_monitor += 1;
                }
                EventType::OtherEvent => {
                    sink.custom(evt.timestamp, evt.data)?;
                    self.counters.custom_events += 1;
                }
                EventType::Blank => {}
                EventType::FrameDeassert | EventType::Veto | EventType::Invalid => {
                    trace!("unroutable readout: {evt}");
                    self.counters.event_errors += 1;
                }
            }
        }
        Ok(())
    }

    fn route_neutron<S: EventSink + ?Sized>(&mut self, evt: &Readout, sink: &mut S) -> Result<()> {
        let pulse = if self.detector.tof_mode {
            self.check_chopper_pulse(evt.timestamp, sink)?
        } else {
            self.pulse_time
        };

        let tof = pulse.and_then(|p| evt.timestamp.checked_sub(p));
        let pixel = self.detector.pixel_id(evt.x_posn, evt.y_posn);
        match (tof, pixel) {
            (Some(tof), Some(pixel)) => {
                sink.neutron(tof, pixel)?;
                self.pending += 1;
                self.counters.events += 1;
            }
            _ => self.counters.event_errors += 1,
        }
        Ok(())
    }

    /// Starts a new pulse at `start` when nothing is pending, when the block
    /// at `base` precedes the pulse, or when it is over a second after it.
    /// `start` is at most `base`.
    fn check_pulse_time<S: EventSink + ?Sized>(
        &mut self,
        base: u64,
        start: u64,
        sink: &mut S,
    ) -> Result<()> {
        let restart = match self.pulse_time {
            Some(pulse) => self.pending == 0 || base < pulse || base > pulse + ONE_SECOND_NS,
            None => true,
        };
        if restart {
            self.set_pulse_time(start, sink)?;
        }
        Ok(())
    }

    /// Advances the frame queue to the latest frame far enough ahead of
    /// `ts` and returns the current frame.
    fn check_chopper_pulse<S: EventSink + ?Sized>(
        &mut self,
        ts: u64,
        sink: &mut S,
    ) -> Result<Option<u64>> {
        let floor = (ts >> self.fine_width_bits) << self.fine_width_bits;
        if self.event_base_time < floor {
            self.event_base_time = floor;
            let mut shifted = false;
            while let Some(&front) = self.frames.front() {
                if front + self.tof_delay > floor {
                    break;
                }
                self.cur_frame = Some(front);
                self.frames.pop_front();
                shifted = true;
            }
            if let (true, Some(frame)) = (shifted, self.cur_frame) {
                self.set_pulse_time(frame, sink)?;
            }
        }
        Ok(self.cur_frame)
    }

    fn set_pulse_time<S: EventSink + ?Sized>(&mut self, ts: u64, sink: &mut S) -> Result<()> {
        if self.pulse_time != Some(ts) {
            sink.pulse(ts)?;
            self.pulse_time = Some(ts);
            self.pending = 0;
        }
        Ok(())
    }

    /// Flushes the sink; the next block may start a new pulse.
    ///
    /// # Errors
    /// Returns the sink error.
    pub fn flush<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        self.pending = 0;
        sink.flush()
    }

    /// Forgets queued frames after a time discontinuity.
    pub fn reset_frames(&mut self) {
        self.frames.clear();
        self.cur_frame = None;
        self.event_base_time = 0;
    }

    /// Current pulse time, if one has been set.
    #[must_use]
    pub fn pulse_time(&self) -> Option<u64> {
        self.pulse_time
    }

    /// Frame starts queued but not yet used as a pulse.
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    /// Routing counters since construction.
    #[must_use]
    pub fn counters(&self) -> RoutingCounters {
        self.counters
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every sink call.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub pulses: Vec<u64>,
        pub neutrons: Vec<(u64, u32)>,
        pub frames: Vec<(u64, bool)>,
        pub monitors: Vec<(u64, u32)>,
        pub custom: Vec<(u64, u32)>,
        pub flushes: usize,
    }

    impl EventSink for RecordingSink {
        fn pulse(&mut self, pulse_time: u64) -> Result<()> {
            self.pulses.push(pulse_time);
            Ok(())
        }
        fn neutron(&mut self, tof: u64, pixel: u32) -> Result<()> {
            self.neutrons.push((tof, pixel));
            Ok(())
        }
        fn frame(&mut self, timestamp: u64, auxiliary: bool) -> Result<()> {
            self.frames.push((timestamp, auxiliary));
            Ok(())
        }
        fn beam_monitor(&mut self, timestamp: u64, count: u32) -> Result<()> {
            self.monitors.push((timestamp, count));
            Ok(())
        }
        fn custom(&mut self, timestamp: u64, data: u32) -> Result<()> {
            self.custom.push((timestamp, data));
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn detector(tof_mode: bool) -> DetectorParams {
        DetectorParams {
            base_pixel: 100,
            x_pixels: 16,
            y_pixels: 8,
            tof_mode,
            min_tof_ns: 1_000,
            ..DetectorParams::default()
        }
    }

    #[test]
    fn test_neutron_pixel_and_tof() {
        let mut router = EventRouter::new(detector(false), 4);
        let mut sink = RecordingSink::default();
        let block = [Readout::neutron(5_250, 2, 3, 1), Readout::neutron(5_300, 15, 7, 1)];

        router.route(5_000, &block, &mut sink).unwrap();
        assert_eq!(sink.pulses, vec![5_000]);
        assert_eq!(sink.neutrons, vec![(250, 100 + 2 * 8 + 3), (300, 100 + 15 * 8 + 7)]);
        assert_eq!(router.counters().events, 2);
    }

    #[test]
    fn test_pixel_out_of_range_is_an_error() {
        let mut router = EventRouter::new(detector(false), 4);
        let mut sink = RecordingSink::default();
        router
            .route(0, &[Readout::neutron(10, 16, 0, 1), Readout::neutron(10, 0, 8, 1)], &mut sink)
            .unwrap();
        assert!(sink.neutrons.is_empty());
        assert_eq!(router.counters().event_errors, 2);
    }

    #[test]
    fn test_pulse_kept_within_one_second() {
        let mut router = EventRouter::new(detector(false), 4);
        let mut sink = RecordingSink::default();
        router.route(1_000, &[Readout::neutron(1_100, 0, 0, 1)], &mut sink).unwrap();
        router
            .route(500_000_000, &[Readout::neutron(500_000_100, 0, 0, 1)], &mut sink)
            .unwrap();
        assert_eq!(sink.pulses, vec![1_000]);
        assert_eq!(sink.neutrons[1].0, 500_000_100 - 1_000);

        // more than a second past the pulse
        router
            .route(1_000_001_001, &[Readout::neutron(1_000_001_050, 0, 0, 1)], &mut sink)
            .unwrap();
        assert_eq!(sink.pulses, vec![1_000, 1_000_001_001]);

        // a block before the pulse
        router.route(2_000, &[Readout::neutron(2_010, 0, 0, 1)], &mut sink).unwrap();
        assert_eq!(sink.pulses.last(), Some(&2_000));
    }

    #[test]
    fn test_flush_lets_next_block_restart_pulse() {
        let mut router = EventRouter::new(detector(false), 4);
        let mut sink = RecordingSink::default();
        router.route(1_000, &[Readout::neutron(1_100, 0, 0, 1)], &mut sink).unwrap();
        router.flush(&mut sink).unwrap();
        router.route(3_000, &[Readout::neutron(3_100, 0, 0, 1)], &mut sink).unwrap();
        assert_eq!(sink.flushes, 1);
        assert_eq!(sink.pulses, vec![1_000, 3_000]);
        assert_eq!(sink.neutrons[1].0, 100);
    }

    #[test]
    fn test_restarted_pulse_covers_carried_neutrons() {
        let mut router = EventRouter::new(detector(false), 4);
        let mut sink = RecordingSink::default();
        router.route(0, &[Readout::neutron(100, 0, 0, 1)], &mut sink).unwrap();
        router.flush(&mut sink).unwrap();

        // the first neutron started in the previous block
        let block = [Readout::neutron(4_090, 0, 1, 1), Readout::neutron(4_200, 0, 2, 1)];
        router.route(4_096, &block, &mut sink).unwrap();
        assert_eq!(sink.pulses, vec![0, 4_090]);
        assert_eq!(sink.neutrons[1..], [(0, 101), (110, 102)]);
        assert_eq!(router.counters().event_errors, 0);
    }

    #[test]
    fn test_tof_mode_needs_a_frame() {
        let mut router = EventRouter::new(detector(true), 4);
        let mut sink = RecordingSink::default();
        router.route(0, &[Readout::neutron(50_000, 1, 1, 1)], &mut sink).unwrap();
        assert!(sink.neutrons.is_empty());
        assert_eq!(router.counters().event_errors, 1);
        assert_eq!(router.pulse_time(), None);
    }

    #[test]
    fn test_tof_mode_frame_queue() {
        // fine width 16 ns, tof delay 1016 ns
        let mut router = EventRouter::new(detector(true), 4);
        let mut sink = RecordingSink::default();
        let block = [
            Readout::marker(EventType::FrameStart, 10_000, 0),
            Readout::marker(EventType::FrameStart, 20_000, 0),
            Readout::neutron(15_000, 0, 0, 1),
            // floor 21008 is under 20000 + 1016
            Readout::neutron(21_010, 0, 1, 1),
            Readout::neutron(21_030, 0, 2, 1),
        ];
        router.route(0, &block, &mut sink).unwrap();
        assert_eq!(sink.frames, vec![(10_000, false), (20_000, false)]);
        assert_eq!(sink.pulses, vec![10_000, 20_000]);
        assert_eq!(sink.neutrons, vec![(5_000, 100), (11_010, 101), (1_030, 102)]);
        assert_eq!(router.queued_frames(), 0);
        assert_eq!(router.counters().frames, 2);
    }

    #[test]
    fn test_reset_frames() {
        let mut router = EventRouter::new(detector(true), 4);
        let mut sink = RecordingSink::default();
        let block = [
            Readout::marker(EventType::FrameStart, 10_000, 0),
            Readout::marker(EventType::FrameStart, 20_000, 0),
        ];
        router.route(0, &block, &mut sink).unwrap();
        assert_eq!(router.queued_frames(), 1);

        router.reset_frames();
        assert_eq!(router.queued_frames(), 0);
        router.route(0, &[Readout::neutron(50_000, 0, 0, 1)], &mut sink).unwrap();
        assert_eq!(router.counters().event_errors, 1);
    }

    #[test]
    fn test_other_types() {
        let mut router = EventRouter::new(detector(false), 4);
        let mut sink = RecordingSink::default();
        let block = [
            Readout::marker(EventType::FrameAuxStart, 1, 0),
            Readout::marker(EventType::BeamMonitor, 2, 17),
            Readout::marker(EventType::OtherEvent, 3, 0xABCD),
            Readout::marker(EventType::Blank, 4, 0),
            Readout::marker(EventType::Veto, 5, 0),
            Readout::marker(EventType::Invalid, 6, 0),
        ];
        router.route(0, &block, &mut sink).unwrap();
        assert_eq!(sink.frames, vec![(1, true)]);
        assert_eq!(sink.monitors, vec![(2, 17)]);
        assert_eq!(sink.custom, vec![(3, 0xABCD)]);

        let counters = router.counters();
        assert_eq!(counters.aux_frames, 1);
        assert_eq!(counters.beam_monitor, 1);
        assert_eq!(counters.custom_events, 1);
        assert_eq!(counters.event_errors, 2);
    }
}
