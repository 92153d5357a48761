//! efu: Neutron event formation command-line interface.
//!
//! Runs the event formation pipeline on live UDP input or on dump files,
//! and provides tools to inspect, generate and send packed readouts.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand};
use efu_algorithms::{EventProcessor, ProcessingCounters};
use efu_core::{EngineConfig, EventType, Readout};
use efu_io::{
    CsvEventSink, DumpFileReader, DumpFileWriter, PackedReadoutParser, PacketEncoder,
    ProcessingLoop, UdpInput,
};
use log::info;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    EfuIo(#[from] efu_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] efu_core::Error),

    #[error("Signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("Unsupported {0}")]
    Unsupported(String),
}

/// Neutron event formation pipeline.
#[derive(Parser)]
#[command(name = "efu")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive packed readouts over UDP and form events
    Run {
        /// Engine configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Address to receive on
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        host: IpAddr,

        /// UDP port to receive on
        #[arg(short, long, default_value = "9000")]
        port: u16,

        /// Output CSV file for routed events
        #[arg(short, long)]
        output: PathBuf,

        /// Dump processed readouts to `<prefix>-<n>.bin`
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Start a new dump file every N seconds (0 disables)
        #[arg(long, default_value = "0")]
        split_secs: u64,

        /// Stop after N seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,

        /// Input queue capacity in datagrams
        #[arg(long, default_value = "1024")]
        queue: usize,
    },

    /// Form events from dump files
    Replay {
        /// Input dump file(s), processed in order
        #[arg(required = true)]
        input: Vec<PathBuf>,

        /// Engine configuration (JSON), defaults if omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output CSV file for routed events
        #[arg(short, long)]
        output: PathBuf,

        /// Dump processed readouts to `<prefix>-<n>.bin`
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Readouts per batch
        #[arg(long, default_value = "4096")]
        batch_size: usize,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show information about a dump file
    Info {
        /// Input dump file
        input: PathBuf,
    },

    /// Write synthetic neutron streaks to a dump file
    Generate {
        /// Output prefix, written as `<prefix>-0.bin`
        #[arg(short, long)]
        output: PathBuf,

        /// Number of neutron clusters
        #[arg(short, long, default_value = "10000")]
        clusters: u64,

        /// Readouts per cluster
        #[arg(long, default_value = "4")]
        hits: u16,

        /// Frame start period in nanoseconds (0 disables)
        #[arg(long, default_value = "1000000")]
        frame_period_ns: u64,

        /// Detector width and height in pixels
        #[arg(long, default_value = "1024")]
        pixels: u16,

        /// Random seed
        #[arg(long, default_value = "12345")]
        seed: u64,
    },

    /// Send dump files to a running pipeline as packed UDP buffers
    Send {
        /// Input dump file(s)
        #[arg(required = true)]
        input: Vec<PathBuf>,

        /// Destination address
        #[arg(short, long, default_value = "127.0.0.1:9000")]
        target: SocketAddr,

        /// Readouts per datagram
        #[arg(long, default_value = "400")]
        records: usize,

        /// Pause between datagrams in microseconds
        #[arg(long, default_value = "50")]
        interval_us: u64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            host,
            port,
            output,
            dump,
            split_secs,
            duration,
            queue,
        } => {
            let config = EngineConfig::from_file(&config)?;
            check_supported(&config)?;

            let running = Arc::new(AtomicBool::new(true));
            let handler_flag = running.clone();
            ctrlc::set_handler(move || handler_flag.store(false, Ordering::Relaxed))?;
            if let Some(secs) = duration {
                let timer_flag = running.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_secs(secs));
                    timer_flag.store(false, Ordering::Relaxed);
                });
            }

            let (input, rx) = UdpInput::spawn(SocketAddr::new(host, port), queue, running.clone())?;
            let mut pipeline = ProcessingLoop::new(
                PackedReadoutParser::new(),
                EventProcessor::new(&config)?,
                CsvEventSink::create(&output)?,
            );
            if let Some(prefix) = dump {
                let split = Duration::from_secs(split_secs);
                pipeline = pipeline.with_dump(DumpFileWriter::create(prefix, Some(split))?);
            }

            let push_errors = input.push_errors();
            let result = pipeline.run(&rx, &running, &push_errors);
            running.store(false, Ordering::Relaxed);
            input.join();

            print_counters(&result?);
        }

        Commands::Replay {
            input,
            config,
            output,
            dump,
            batch_size,
            verbose,
        } => {
            let config = match config {
                Some(path) => EngineConfig::from_file(path)?,
                None => EngineConfig::default(),
            };
            if verbose {
                eprintln!("Replaying {} file(s)...", input.len());
                eprintln!(
                    "Clustering: {} ({} threads)",
                    config.clusters.enabled, config.clusters.num_threads
                );
                eprintln!("Writing events to: {}", output.display());
            }

            let readers = input
                .iter()
                .map(DumpFileReader::open)
                .collect::<efu_io::Result<Vec<_>>>()?;

            let start = Instant::now();
            let mut pipeline = ProcessingLoop::new(
                PackedReadoutParser::new(),
                EventProcessor::new(&config)?,
                CsvEventSink::create(&output)?,
            );
            if let Some(prefix) = dump {
                pipeline = pipeline.with_dump(DumpFileWriter::create(prefix, None)?);
            }

            let batches = readers.iter().flat_map(|r| r.batches(batch_size));
            let counters = pipeline.replay(batches)?;
            let elapsed = start.elapsed();

            print_counters(&counters);
            println!(
                "Replayed {} readouts in {:.2?} ({:.0} readouts/s)",
                readers.iter().map(DumpFileReader::record_count).sum::<usize>(),
                elapsed,
                counters.rx_bytes as f64 / 20.0 / elapsed.as_secs_f64().max(1e-9)
            );
        }

        Commands::Info { input } => {
            let reader = DumpFileReader::open(&input)?;
            let file_size = reader.file_size();
            println!("File: {}", input.display());
            println!(
                "Size: {} bytes ({:.2} MB)",
                file_size,
                file_size as f64 / 1_000_000.0
            );
            println!("Records: {}", reader.record_count());

            let readouts = reader.read_all();
            let mut by_type: BTreeMap<u8, (EventType, usize)> = BTreeMap::new();
            for readout in &readouts {
                by_type
                    .entry(readout.event_type.code())
                    .or_insert((readout.event_type, 0))
                    .1 += 1;
            }
            for (event_type, count) in by_type.values() {
                println!("  {}: {}", event_type, count);
            }

            if let (Some(min_t), Some(max_t)) = (
                readouts.iter().map(|r| r.timestamp).min(),
                readouts.iter().map(|r| r.timestamp).max(),
            ) {
                println!("Time range: {} - {} ns", min_t, max_t);
            }
            let neutrons: Vec<_> = readouts.iter().filter(|r| r.is_neutron()).collect();
            if let (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) = (
                neutrons.iter().map(|r| r.x_posn).min(),
                neutrons.iter().map(|r| r.x_posn).max(),
                neutrons.iter().map(|r| r.y_posn).min(),
                neutrons.iter().map(|r| r.y_posn).max(),
            ) {
                println!("X range: {} - {}", min_x, max_x);
                println!("Y range: {} - {}", min_y, max_y);
            }
        }

        Commands::Generate {
            output,
            clusters,
            hits,
            frame_period_ns,
            pixels,
            seed,
        } => {
            let readouts = synthetic_streaks(clusters, hits, frame_period_ns, pixels, seed);
            let mut writer = DumpFileWriter::create(&output, None)?;
            writer.push(&readouts)?;
            writer.flush()?;
            println!(
                "Wrote {} readouts to {}",
                writer.records(),
                display_paths(writer.paths())
            );
        }

        Commands::Send {
            input,
            target,
            records,
            interval_us,
        } => {
            let socket = UdpSocket::bind(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                0,
            ))?;
            let mut encoder = PacketEncoder::default();
            let mut sent = 0usize;
            for path in &input {
                let reader = DumpFileReader::open(path)?;
                for batch in reader.batches(records.clamp(1, 3000)) {
                    socket.send_to(&encoder.encode(&batch.readouts), target)?;
                    sent += 1;
                    if interval_us > 0 {
                        std::thread::sleep(Duration::from_micros(interval_us));
                    }
                }
            }
            info!("sent {} datagrams to {}", sent, target);
            println!("Sent {} datagrams to {}", sent, target);
        }
    }

    Ok(())
}

fn check_supported(config: &EngineConfig) -> Result<()> {
    if !config.reader.eq_ignore_ascii_case("packed") {
        return Err(CliError::Unsupported(format!("reader: {}", config.reader)));
    }
    if !config.dae_comms.eq_ignore_ascii_case("udp") {
        return Err(CliError::Unsupported(format!(
            "DAE comms: {}",
            config.dae_comms
        )));
    }
    Ok(())
}

/// Time-ordered streaks of `hits` readouts each, interleaved with frame
/// starts every `frame_period_ns`.
fn synthetic_streaks(
    clusters: u64,
    hits: u16,
    frame_period_ns: u64,
    pixels: u16,
    seed: u64,
) -> Vec<Readout> {
    let mut rng_seed = seed;
    let mut rand = || {
        rng_seed = (rng_seed.wrapping_mul(1_103_515_245).wrapping_add(12345)) & 0x7fff_ffff;
        rng_seed
    };

    let span = u64::from(pixels.max(2) - 1);
    let mut readouts = Vec::with_capacity(clusters as usize * usize::from(hits));
    let mut next_frame = 0;
    let mut t = 1_000;
    for _ in 0..clusters {
        while frame_period_ns > 0 && next_frame <= t {
            readouts.push(Readout::marker(EventType::FrameStart, next_frame, 0));
            next_frame += frame_period_ns;
        }
        let x = (rand() % span) as u16;
        let y = (rand() % span) as u16;
        for k in 0..u64::from(hits) {
            let dx = u16::from(k % 2 == 1);
            readouts.push(Readout::neutron(t + k * 40, x + dx, y, 1 + (rand() % 8) as u16));
        }
        t += 200 + rand() % 1000;
    }
    readouts
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_counters(counters: &ProcessingCounters) {
    println!("Packets received: {}", counters.rx_packets);
    println!("Bytes received: {}", counters.rx_bytes);
    println!("Queue overflows: {}", counters.fifo_push_errors);
    println!(
        "Readout errors: {} bytes, {} sequence, {} rejected buffers",
        counters.readout_byte_errors, counters.readout_seq_errors, counters.parse_errors
    );
    println!(
        "Dropped readouts: {} ({} bin resets)",
        counters.dropped_events, counters.bin_resets
    );

    let routing = &counters.routing;
    println!("Events: {} ({} errors)", routing.events, routing.event_errors);
    println!(
        "Frames: {}, aux frames: {}, beam monitor: {}, custom: {}",
        routing.frames, routing.aux_frames, routing.beam_monitor, routing.custom_events
    );

    let clustering = &counters.clustering;
    if clustering.events_added > 0 {
        println!(
            "Clusters: {} created, {} merged, {} emitted, {} readouts dropped",
            clustering.clusters_created,
            clustering.clusters_merged,
            clustering.clusters_emitted,
            clustering.events_dropped
        );
    }
}
