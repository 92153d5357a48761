//! CSV output of routed events.

use efu_algorithms::EventSink;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes routed events as `kind,time,value` lines.
///
/// | kind      | time              | value |
/// |-----------|-------------------|-------|
/// | `pulse`   | pulse time        | empty |
/// | `neutron` | time of flight    | pixel id |
/// | `frame`   | timestamp         | 0 primary, 1 auxiliary |
/// | `monitor` | timestamp         | count |
/// | `custom`  | timestamp         | payload |
pub struct CsvEventSink<W: Write> {
    writer: W,
    neutrons: u64,
}

impl CsvEventSink<BufWriter<File>> {
    /// Creates a CSV file and writes the header.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file))?)
    }
}

impl<W: Write> CsvEventSink<W> {
    /// Wraps `writer` and writes the header.
    ///
    /// # Errors
    /// Returns an error if the header cannot be written.
    pub fn new(mut writer: W) -> efu_core::Result<Self> {
        writeln!(writer, "kind,time,value")?;
        Ok(Self {
            writer,
            neutrons: 0,
        })
    }

    /// Neutrons written so far.
    #[must_use]
    pub fn neutrons(&self) -> u64 {
        self.neutrons
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for CsvEventSink<W> {
    fn pulse(&mut self, pulse_time: u64) -> efu_core::Result<()> {
        writeln!(self.writer, "pulse,{pulse_time},")?;
        Ok(())
    }

    fn neutron(&mut self, tof: u64, pixel: u32) -> efu_core::Result<()> {
        writeln!(self.writer, "neutron,{tof},{pixel}")?;
        self.neutrons += 1;
        Ok(())
    }

    fn frame(&mut self, timestamp: u64, auxiliary: bool) -> efu_core::Result<()> {
        writeln!(self.writer, "frame,{timestamp},{}", u8::from(auxiliary))?;
        Ok(())
    }

    fn beam_monitor(&mut self, timestamp: u64, count: u32) -> efu_core::Result<()> {
        writeln!(self.writer, "monitor,{timestamp},{count}")?;
        Ok(())
    }

    fn custom(&mut self, timestamp: u64, data: u32) -> efu_core::Result<()> {
        writeln!(self.writer, "custom,{timestamp},{data}")?;
        Ok(())
    }

    fn flush(&mut self) -> efu_core::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_events_csv() {
        let mut sink = CsvEventSink::new(Vec::new()).unwrap();
        sink.pulse(1_000).unwrap();
        sink.neutron(250, 42).unwrap();
        sink.frame(1_100, true).unwrap();
        sink.beam_monitor(1_200, 7).unwrap();
        sink.custom(1_300, 99).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.neutrons(), 1);

        let content = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            content,
            "kind,time,value\npulse,1000,\nneutron,250,42\nframe,1100,1\nmonitor,1200,7\ncustom,1300,99\n"
        );
    }

    #[test]
    fn test_create_file() {
        let file = NamedTempFile::new().unwrap();
        let mut sink = CsvEventSink::create(file.path()).unwrap();
        sink.neutron(1, 2).unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.starts_with("kind,time,value\n"));
        assert!(content.contains("neutron,1,2"));
    }
}
