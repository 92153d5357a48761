//! Packed readout wire format.
//!
//! A buffer is an 8 byte header followed by 20 byte readout records, all
//! little-endian:
//!
//! | offset | header field | record field |
//! |--------|--------------|--------------|
//! | 0      | magic `u16`  | timestamp `u64` |
//! | 2      | version `u8` |  |
//! | 3      | reserved `u8`|  |
//! | 4      | sequence `u32` |  |
//! | 8      |              | event type `u8`, source `u8` |
//! | 10     |              | x `u16`, y `u16`, weight `u16` |
//! | 16     |              | data `u32` |
//!
//! Dump files hold bare records without the header.

use efu_core::{Error, EventType, ParseSummary, Readout, ReadoutParser, Result};
use log::trace;

/// Buffer header magic, "EF".
pub const MAGIC: u16 = 0x4546;
/// Supported header version.
pub const VERSION: u8 = 0;
/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;
/// Record size in bytes.
pub const RECORD_SIZE: usize = 20;

/// Appends the packed form of `readout` to `out`.
pub fn encode_readout(readout: &Readout, out: &mut Vec<u8>) {
    out.extend_from_slice(&readout.timestamp.to_le_bytes());
    out.push(readout.event_type.code());
    out.push(readout.source);
    out.extend_from_slice(&readout.x_posn.to_le_bytes());
    out.extend_from_slice(&readout.y_posn.to_le_bytes());
    out.extend_from_slice(&readout.weight.to_le_bytes());
    out.extend_from_slice(&readout.data.to_le_bytes());
}

/// Decodes one record. Unknown event codes decode as [`EventType::Invalid`].
#[must_use]
pub fn decode_readout(record: &[u8; RECORD_SIZE]) -> Readout {
    let u16_at = |i: usize| u16::from_le_bytes([record[i], record[i + 1]]);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&record[0..8]);
    let mut data = [0u8; 4];
    data.copy_from_slice(&record[16..20]);

    Readout {
        timestamp: u64::from_le_bytes(ts),
        event_type: EventType::from_u8(record[8]),
        source: record[9],
        x_posn: u16_at(10),
        y_posn: u16_at(12),
        weight: u16_at(14),
        data: u32::from_le_bytes(data),
    }
}

/// Decodes every whole record of `bytes` into `out`.
///
/// Records with an unknown event code and any trailing partial record are
/// skipped and counted as byte errors in the returned summary.
pub fn decode_records(bytes: &[u8], out: &mut Vec<Readout>) -> ParseSummary {
    let mut summary = ParseSummary::default();
    let records = bytes.chunks_exact(RECORD_SIZE);
    summary.byte_errors += records.remainder().len() as u64;
    for chunk in records {
        let Ok(record) = <&[u8; RECORD_SIZE]>::try_from(chunk) else {
            continue;
        };
        let readout = decode_readout(record);
        if readout.event_type == EventType::Invalid {
            summary.byte_errors += RECORD_SIZE as u64;
            continue;
        }
        summary.observe(readout.timestamp);
        out.push(readout);
    }
    summary
}

/// Builds headered buffers with consecutive sequence numbers.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    sequence: u32,
}

impl PacketEncoder {
    /// Creates an encoder whose first buffer has sequence `sequence`.
    #[must_use]
    pub fn new(sequence: u32) -> Self {
        Self { sequence }
    }

    /// Encodes `readouts` into one buffer.
    #[must_use]
    pub fn encode(&mut self, readouts: &[Readout]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HEADER_SIZE + readouts.len() * RECORD_SIZE);
        buffer.extend_from_slice(&MAGIC.to_le_bytes());
        buffer.push(VERSION);
        buffer.push(0);
        buffer.extend_from_slice(&self.sequence.to_le_bytes());
        for readout in readouts {
            encode_readout(readout, &mut buffer);
        }
        self.sequence = self.sequence.wrapping_add(1);
        buffer
    }

    /// Sequence number of the next buffer.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Parser for packed readout buffers.
#[derive(Debug, Default)]
pub struct PackedReadoutParser {
    readouts: Vec<Readout>,
    next_sequence: Option<u32>,
}

impl PackedReadoutParser {
    /// Creates a parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadoutParser for PackedReadoutParser {
    fn parse(&mut self, buffer: &[u8]) -> Result<ParseSummary> {
        self.readouts.clear();
        if buffer.len() < HEADER_SIZE {
            return Err(Error::ParseError(format!(
                "buffer of {} bytes is shorter than the header",
                buffer.len()
            )));
        }
        let magic = u16::from_le_bytes([buffer[0], buffer[1]]);
        if magic != MAGIC {
            return Err(Error::ParseError(format!("bad magic {magic:#06x}")));
        }
        if buffer[2] != VERSION {
            return Err(Error::ParseError(format!(
                "unsupported version {}",
                buffer[2]
            )));
        }

        let sequence = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        let mut summary = decode_records(&buffer[HEADER_SIZE..], &mut self.readouts);
        if let Some(expected) = self.next_sequence {
            if sequence != expected {
                trace!("sequence gap: expected {expected}, got {sequence}");
                summary.seq_errors += 1;
            }
        }
        self.next_sequence = Some(sequence.wrapping_add(1));
        Ok(summary)
    }

    fn readouts(&self) -> &[Readout] {
        &self.readouts
    }

    fn name(&self) -> &'static str {
        "packed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Readout> {
        vec![
            Readout::neutron(1_000, 10, 20, 3),
            Readout::marker(EventType::FrameStart, 900, 0),
            Readout {
                source: 7,
                ..Readout::marker(EventType::BeamMonitor, 1_500, 0xDEAD_BEEF)
            },
        ]
    }

    #[test]
    fn test_record_layout() {
        let mut bytes = Vec::new();
        encode_readout(&Readout::neutron(0x0102_0304_0506_0708, 0x1234, 0x5678, 9), &mut bytes);
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(bytes[0], 0x08);
        assert_eq!(bytes[7], 0x01);
        assert_eq!(bytes[8], EventType::Neutron.code());
        assert_eq!(&bytes[10..12], &[0x34, 0x12]);
        assert_eq!(&bytes[14..16], &[9, 0]);
    }

    #[test]
    fn test_parse_buffer() {
        let mut encoder = PacketEncoder::new(5);
        let buffer = encoder.encode(&sample());
        assert_eq!(buffer.len(), HEADER_SIZE + 3 * RECORD_SIZE);

        let mut parser = PackedReadoutParser::new();
        let summary = parser.parse(&buffer).unwrap();
        assert_eq!(parser.readouts(), &sample()[..]);
        assert_eq!(summary.ts_min, 900);
        assert_eq!(summary.ts_max, 1_500);
        assert_eq!(summary.byte_errors, 0);
        assert_eq!(summary.seq_errors, 0);
        assert_eq!(parser.name(), "packed");
    }

    #[test]
    fn test_sequence_gap() {
        let mut encoder = PacketEncoder::new(u32::MAX);
        let mut parser = PackedReadoutParser::new();

        let first = encoder.encode(&sample());
        let second = encoder.encode(&sample());
        assert_eq!(parser.parse(&first).unwrap().seq_errors, 0);
        // sequence wraps to 0
        assert_eq!(parser.parse(&second).unwrap().seq_errors, 0);

        let _skipped = encoder.encode(&sample());
        let fourth = encoder.encode(&sample());
        assert_eq!(parser.parse(&fourth).unwrap().seq_errors, 1);
    }

    #[test]
    fn test_byte_errors() {
        let mut buffer = PacketEncoder::default().encode(&sample());
        // unknown event code in the second record
        buffer[HEADER_SIZE + RECORD_SIZE + 8] = 0x42;
        buffer.extend_from_slice(&[1, 2, 3]);

        let mut parser = PackedReadoutParser::new();
        let summary = parser.parse(&buffer).unwrap();
        assert_eq!(parser.readouts().len(), 2);
        assert_eq!(summary.byte_errors, RECORD_SIZE as u64 + 3);
    }

    #[test]
    fn test_rejects_bad_header() {
        let mut parser = PackedReadoutParser::new();
        assert!(matches!(parser.parse(&[0x46, 0x45]), Err(Error::ParseError(_))));

        let mut buffer = PacketEncoder::default().encode(&[]);
        buffer[0] = 0;
        assert!(parser.parse(&buffer).is_err());

        let mut buffer = PacketEncoder::default().encode(&[]);
        buffer[2] = 1;
        assert!(parser.parse(&buffer).is_err());
        assert!(parser.readouts().is_empty());
    }

    #[test]
    fn test_empty_buffer_has_no_readouts() {
        let mut parser = PackedReadoutParser::new();
        let summary = parser.parse(&PacketEncoder::default().encode(&[])).unwrap();
        assert!(!summary.has_readouts());
    }
}
