//! Readout record shared by every parser and by the clustering engine.

use crate::Error;
use std::fmt;
use std::str::FromStr;

/// Detector acquisition event classification.
///
/// The numeric codes are part of the packed readout format and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EventType {
    /// Padding or empty slot, ignored downstream.
    #[default]
    Blank = 0,
    /// Neutron detection, the only type that is clustered.
    Neutron = 1,
    /// Primary frame (chopper) start.
    FrameStart = 2,
    /// Auxiliary frame start.
    FrameAuxStart = 3,
    /// Frame deassert marker.
    FrameDeassert = 4,
    /// Veto signal.
    Veto = 5,
    /// Beam monitor count carried in `data`.
    BeamMonitor = 6,
    /// Instrument specific event carried in `data`.
    OtherEvent = 7,
    /// Unrecognised event code.
    Invalid = 0xFF,
}

impl EventType {
    /// Converts a wire code into an event type, mapping unknown codes to
    /// [`EventType::Invalid`].
    #[must_use]
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => Self::Blank,
            1 => Self::Neutron,
            2 => Self::FrameStart,
            3 => Self::FrameAuxStart,
            4 => Self::FrameDeassert,
            5 => Self::Veto,
            6 => Self::BeamMonitor,
            7 => Self::OtherEvent,
            _ => Self::Invalid,
        }
    }

    /// Returns the wire code.
    #[inline]
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Returns the canonical name used in configuration files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Blank => "Blank",
            Self::Neutron => "Neutron",
            Self::FrameStart => "FrameStart",
            Self::FrameAuxStart => "FrameAuxStart",
            Self::FrameDeassert => "FrameDeassert",
            Self::Veto => "Veto",
            Self::BeamMonitor => "BeamMonitor",
            Self::OtherEvent => "OtherEvent",
            Self::Invalid => "Invalid",
        }
    }
}

impl From<u8> for EventType {
    fn from(code: u8) -> Self {
        Self::from_u8(code)
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Blank" => Ok(Self::Blank),
            "Neutron" => Ok(Self::Neutron),
            "FrameStart" => Ok(Self::FrameStart),
            "FrameAuxStart" => Ok(Self::FrameAuxStart),
            "FrameDeassert" => Ok(Self::FrameDeassert),
            "Veto" => Ok(Self::Veto),
            "BeamMonitor" => Ok(Self::BeamMonitor),
            "OtherEvent" => Ok(Self::OtherEvent),
            "Invalid" => Ok(Self::Invalid),
            other => Err(Error::InvalidEventType(other.to_string())),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single decoded detector readout.
///
/// Produced by the readout parsers and consumed by the time binning and
/// clustering stages. Timestamps are nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readout {
    /// Event time in nanoseconds.
    pub timestamp: u64,
    /// Event classification.
    pub event_type: EventType,
    /// Source channel or module.
    pub source: u8,
    /// X position in detector pixel space.
    pub x_posn: u16,
    /// Y position in detector pixel space.
    pub y_posn: u16,
    /// Amplitude or charge.
    pub weight: u16,
    /// Event type specific payload.
    pub data: u32,
}

impl Readout {
    /// Creates a neutron readout.
    #[inline]
    #[must_use]
    pub fn neutron(timestamp: u64, x_posn: u16, y_posn: u16, weight: u16) -> Self {
        Self {
            timestamp,
            event_type: EventType::Neutron,
            x_posn,
            y_posn,
            weight,
            ..Self::default()
        }
    }

    /// Creates a non-positional readout of the given type.
    #[inline]
    #[must_use]
    pub fn marker(event_type: EventType, timestamp: u64, data: u32) -> Self {
        Self {
            timestamp,
            event_type,
            data,
            ..Self::default()
        }
    }

    /// Returns true if this readout takes part in clustering.
    #[inline]
    #[must_use]
    pub fn is_neutron(&self) -> bool {
        self.event_type == EventType::Neutron
    }
}

impl fmt::Display for Readout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event={} time={} id={} x={} y={} w={} data={}",
            self.event_type,
            self.timestamp,
            self.source,
            self.x_posn,
            self.y_posn,
            self.weight,
            self.data
        )
    }
}
