//! Input and processing threads.
//!
//! [`UdpInput`] receives datagrams on its own thread and hands them to the
//! processing thread over a bounded channel. [`ProcessingLoop`] parses,
//! bins, clusters and routes them, optionally dumping the processed
//! readouts.

use crate::{DumpFileWriter, ReadoutBatch, Result};
use crossbeam_channel::{self as xch, RecvTimeoutError, TrySendError};
use efu_algorithms::{EventProcessor, EventSink, ProcessingCounters, POLL_INTERVAL};
use efu_core::ReadoutParser;
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Read timeout of the input socket, bounding shutdown latency.
pub const SOCKET_TIMEOUT: Duration = Duration::from_millis(100);

const MAX_DATAGRAM: usize = 65_536;

/// UDP receive thread feeding a bounded channel.
///
/// A full channel drops the datagram and counts a push error; the thread
/// never blocks on the consumer.
pub struct UdpInput {
    local_addr: SocketAddr,
    push_errors: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
    join_handle: Option<JoinHandle<()>>,
}

impl UdpInput {
    /// Binds `addr` and starts the receive thread.
    ///
    /// The thread exits once `running` is cleared or the receiver is
    /// dropped.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound or configured.
    pub fn spawn(
        addr: SocketAddr,
        capacity: usize,
        running: Arc<AtomicBool>,
    ) -> Result<(Self, xch::Receiver<Vec<u8>>)> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        let local_addr = socket.local_addr()?;
        info!("receiving readouts on {local_addr}");

        let (tx, rx) = xch::bounded(capacity.max(1));
        let push_errors = Arc::new(AtomicU64::new(0));
        let received = Arc::new(AtomicU64::new(0));
        let push_errors_clone = push_errors.clone();
        let received_clone = received.clone();

        let join_handle = std::thread::Builder::new()
            .name("efu-input".to_string())
            .spawn(move || {
                let mut buffer = vec![0u8; MAX_DATAGRAM];
                while running.load(Ordering::Relaxed) {
                    match socket.recv(&mut buffer) {
                        Ok(len) => {
                            received_clone.fetch_add(1, Ordering::Relaxed);
                            match tx.try_send(buffer[..len].to_vec()) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    push_errors_clone.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(TrySendError::Disconnected(_)) => {
                                    debug!("input consumer disconnected");
                                    break;
                                }
                            }
                        }
                        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                        Err(e) => warn!("receive failed: {e}"),
                    }
                }
                debug!("input thread exiting");
            })?;

        Ok((
            Self {
                local_addr,
                push_errors,
                received,
                join_handle: Some(join_handle),
            },
            rx,
        ))
    }

    /// Address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared count of datagrams dropped on a full channel.
    #[must_use]
    pub fn push_errors(&self) -> Arc<AtomicU64> {
        self.push_errors.clone()
    }

    /// Datagrams received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Waits for the receive thread to exit. The caller clears `running`
    /// first.
    pub fn join(mut self) {
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                warn!("input thread panicked");
            }
        }
    }
}

/// Processing thread body: parse, bin, cluster, route and dump.
pub struct ProcessingLoop<P, S> {
    parser: P,
    processor: EventProcessor,
    sink: S,
    dump: Option<DumpFileWriter>,
    update_interval: Duration,
}

impl<P: ReadoutParser, S: EventSink> ProcessingLoop<P, S> {
    /// Creates a loop without a dump file that flushes the sink every second.
    #[must_use]
    pub fn new(parser: P, processor: EventProcessor, sink: S) -> Self {
        Self {
            parser,
            processor,
            sink,
            dump: None,
            update_interval: Duration::from_secs(1),
        }
    }

    /// Dumps every processed block to `dump`.
    #[must_use]
    pub fn with_dump(mut self, dump: DumpFileWriter) -> Self {
        self.dump = Some(dump);
        self
    }

    /// Sets how often the sink is flushed and the counters logged.
    #[must_use]
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Runs until `running` is cleared or the input channel closes.
    ///
    /// Clusters still in flight at shutdown are dropped.
    ///
    /// # Errors
    /// Returns the first sink or dump file error.
    pub fn run(
        &mut self,
        rx: &xch::Receiver<Vec<u8>>,
        running: &AtomicBool,
        push_errors: &AtomicU64,
    ) -> Result<ProcessingCounters> {
        let mut last_update = Instant::now();
        while running.load(Ordering::Relaxed) {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(buffer) => self.handle_buffer(&buffer),
                Err(RecvTimeoutError::Timeout) => self.processor.idle(),
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("input channel closed");
                    break;
                }
            }
            self.process_block()?;

            if last_update.elapsed() >= self.update_interval {
                self.processor
                    .record_push_errors(push_errors.load(Ordering::Relaxed));
                self.update()?;
                last_update = Instant::now();
            }
        }

        self.processor
            .record_push_errors(push_errors.load(Ordering::Relaxed));
        self.finish()
    }

    /// Processes readouts read back from dump files, then drains every
    /// remaining bin and cluster.
    ///
    /// # Errors
    /// Returns the first sink or dump file error.
    pub fn replay<I>(&mut self, batches: I) -> Result<ProcessingCounters>
    where
        I: IntoIterator<Item = ReadoutBatch>,
    {
        for batch in batches {
            self.processor.record_packet(batch.readouts.len() * crate::codec::RECORD_SIZE);
            self.processor.record_parse(&batch.summary);
            if batch.summary.has_readouts() {
                self.processor.ingest(&batch.readouts, batch.summary.ts_min);
            }
            self.process_block()?;
        }

        let out = self.processor.drain(&mut self.sink)?;
        if let (Some(dump), false) = (&mut self.dump, out.is_empty()) {
            dump.push(out)?;
        }
        self.finish()
    }

    fn handle_buffer(&mut self, buffer: &[u8]) {
        self.processor.record_packet(buffer.len());
        match self.parser.parse(buffer) {
            Ok(summary) => {
                self.processor.record_parse(&summary);
                if summary.has_readouts() {
                    self.processor.ingest(self.parser.readouts(), summary.ts_min);
                }
            }
            Err(e) => {
                debug!("{} parser rejected buffer: {e}", self.parser.name());
                self.processor.record_parse_error();
            }
        }
    }

    fn process_block(&mut self) -> Result<()> {
        let out = self.processor.process(&mut self.sink)?;
        if let Some(dump) = &mut self.dump {
            if !out.is_empty() {
                dump.push(out)?;
            }
            dump.check_rotate()?;
        }
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.processor.flush(&mut self.sink)?;
        let counters = self.processor.counters();
        info!(
            "rx {} packets, {} events, {} event errors, {} dropped, {} bin resets",
            counters.rx_packets,
            counters.routing.events,
            counters.routing.event_errors,
            counters.dropped_events,
            counters.bin_resets,
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<ProcessingCounters> {
        self.processor.flush(&mut self.sink)?;
        if let Some(dump) = &mut self.dump {
            dump.flush()?;
        }
        let counters = self.processor.counters();
        info!(
            "processing finished: {} events, {} readout byte errors, {} sequence errors",
            counters.routing.events, counters.readout_byte_errors, counters.readout_seq_errors,
        );
        Ok(counters)
    }

    /// The event sink.
    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Consumes the loop, returning the event sink.
    #[must_use]
    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CsvEventSink, PackedReadoutParser, PacketEncoder};
    use efu_core::{BinningParams, ClusterParams, DetectorParams, EngineConfig, Readout};

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_binning(BinningParams::new(4, 6, 4))
            .with_clusters(ClusterParams {
                enabled: false,
                ..ClusterParams::default()
            })
            .with_detector(DetectorParams {
                event_lag_ns: 2048,
                ..DetectorParams::default()
            })
    }

    fn processing_loop() -> ProcessingLoop<PackedReadoutParser, CsvEventSink<Vec<u8>>> {
        ProcessingLoop::new(
            PackedReadoutParser::new(),
            EventProcessor::new(&config()).unwrap(),
            CsvEventSink::new(Vec::new()).unwrap(),
        )
    }

    #[test]
    fn test_run_until_channel_closes() {
        let (tx, rx) = xch::bounded(8);
        let mut encoder = PacketEncoder::default();
        tx.send(encoder.encode(&[Readout::neutron(100, 1, 1, 1), Readout::neutron(1_100, 1, 2, 1)]))
            .unwrap();
        tx.send(vec![0u8; 3]).unwrap();
        tx.send(encoder.encode(&[Readout::neutron(4_100, 1, 3, 1)])).unwrap();
        drop(tx);

        let running = AtomicBool::new(true);
        let mut pipeline = processing_loop();
        let counters = pipeline.run(&rx, &running, &AtomicU64::new(2)).unwrap();

        assert_eq!(counters.rx_packets, 3);
        assert_eq!(counters.parse_errors, 1);
        assert_eq!(counters.fifo_push_errors, 2);
        // bins 0 and 1 are older than the event lag
        assert_eq!(counters.routing.events, 2);
        assert_eq!(pipeline.sink().neutrons(), 2);
    }

    #[test]
    fn test_stops_when_not_running() {
        let (_tx, rx) = xch::bounded::<Vec<u8>>(1);
        let running = AtomicBool::new(false);
        let counters = processing_loop()
            .run(&rx, &running, &AtomicU64::new(0))
            .unwrap();
        assert_eq!(counters.rx_packets, 0);
    }

    #[test]
    fn test_replay_drains() {
        let batch = ReadoutBatch {
            readouts: vec![Readout::neutron(100, 1, 1, 1), Readout::neutron(1_100, 1, 2, 1)],
            summary: efu_core::ParseSummary {
                ts_min: 100,
                ts_max: 1_100,
                ..Default::default()
            },
        };
        let mut pipeline = processing_loop();
        let counters = pipeline.replay([batch]).unwrap();
        assert_eq!(counters.routing.events, 2);

        let csv = String::from_utf8(pipeline.into_sink().into_inner()).unwrap();
        assert_eq!(csv.lines().filter(|l| l.starts_with("neutron,")).count(), 2);
    }
}
