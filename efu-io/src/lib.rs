//! efu-io: Wire codec, dump files and processing threads for efu.
//!
//! This crate provides the packed readout format and its parser, the
//! rotating audit dump with a memory-mapped reader (via memmap2), a CSV
//! event sink, and the UDP input and processing loop.
//!

pub mod codec;
mod dump;
mod error;
pub mod pipeline;
mod reader;
mod writer;

pub use codec::{PackedReadoutParser, PacketEncoder};
pub use dump::DumpFileWriter;
pub use error::{Error, Result};
pub use pipeline::{ProcessingLoop, UdpInput};
pub use reader::{DumpFileReader, MappedFileReader, ReadoutBatch};
pub use writer::CsvEventSink;
