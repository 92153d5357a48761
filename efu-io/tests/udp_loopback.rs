use efu_algorithms::EventProcessor;
use efu_core::{BinningParams, ClusterParams, EngineConfig, Readout};
use efu_io::{CsvEventSink, PackedReadoutParser, PacketEncoder, ProcessingLoop, UdpInput};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_datagrams_reach_processing_loop() {
    let config = EngineConfig::default()
        .with_binning(BinningParams::new(4, 6, 4))
        .with_clusters(ClusterParams {
            enabled: false,
            ..ClusterParams::default()
        });

    let running = Arc::new(AtomicBool::new(true));
    let (input, rx) = UdpInput::spawn("127.0.0.1:0".parse().unwrap(), 64, running.clone()).unwrap();
    let target = input.local_addr();
    let push_errors = input.push_errors();

    let worker_running = running.clone();
    let worker = std::thread::spawn(move || {
        let mut pipeline = ProcessingLoop::new(
            PackedReadoutParser::new(),
            EventProcessor::new(&config).unwrap(),
            CsvEventSink::new(Vec::new()).unwrap(),
        );
        pipeline.run(&rx, &worker_running, &push_errors).unwrap()
    });

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut encoder = PacketEncoder::default();
    for i in 0..5u64 {
        let buffer = encoder.encode(&[Readout::neutron(i * 100, 1, 1, 1)]);
        sender.send_to(&buffer, target).unwrap();
    }

    std::thread::sleep(Duration::from_millis(300));
    running.store(false, Ordering::Relaxed);
    let counters = worker.join().unwrap();
    input.join();

    assert_eq!(counters.rx_packets, 5);
    assert_eq!(counters.readout_seq_errors, 0);
    assert_eq!(counters.parse_errors, 0);
}
