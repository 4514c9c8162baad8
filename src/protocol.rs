use crate::{
    error::{BikeError, Result},
    types::TelemetryReading,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::{debug, trace, warn};

/// Fixed first byte of every frame
pub const PREAMBLE: u8 = 0xF0;

/// Size of outgoing command frames in bytes
pub const COMMAND_SIZE: usize = 5;

/// Start exercise command observed from the bike's companion app
pub const START_EXERCISE: [u8; COMMAND_SIZE] = [PREAMBLE, 0xB0, 0x01, 0x01, 0xA2];

/// Message types carried in byte 1 of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Start the exercise session (app to bike)
    Start = 0xB0,
    /// Periodic frame without known meaning
    Unknown = 0xD0,
    /// Workout timer and cadence
    Telemetry = 0xD1,
    /// Difficulty level, reported by the bike or requested by the app
    Difficulty = 0xD2,
}

impl MessageType {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xB0 => Some(Self::Start),
            0xD0 => Some(Self::Unknown),
            0xD1 => Some(Self::Telemetry),
            0xD2 => Some(Self::Difficulty),
            _ => None,
        }
    }

    /// Minimum frame length needed to interpret this message type
    #[must_use]
    pub const fn min_frame_len(self) -> usize {
        match self {
            Self::Unknown => 2,
            Self::Start => COMMAND_SIZE,
            Self::Telemetry => 11,
            Self::Difficulty => 4,
        }
    }
}

/// One protocol message as raw bytes
///
/// Outgoing frames always start with [`PREAMBLE`]. Inbound frames are kept
/// as received and validated by [`parse_frame`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame(Bytes);

impl Frame {
    /// Wrap raw bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes of the frame
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Cheap clone of the underlying buffer
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Frame length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame holds no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the first byte is the protocol preamble
    #[must_use]
    pub fn has_preamble(&self) -> bool {
        self.0.first() == Some(&PREAMBLE)
    }

    /// Raw message type discriminator
    #[must_use]
    pub fn discriminator(&self) -> Option<u8> {
        self.0.get(1).copied()
    }

    /// Known message type of this frame
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        self.discriminator().and_then(MessageType::from_u8)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Frame {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Additive checksum: sum of all bytes truncated to 8 bits
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Check that the last byte of a command frame is the checksum of the rest
#[must_use]
pub fn verify_checksum(frame: &Frame) -> bool {
    match frame.as_bytes().split_last() {
        Some((last, body)) if !body.is_empty() => checksum(body) == *last,
        _ => false,
    }
}

/// Commands the app sends to the bike
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start the exercise session and telemetry stream
    StartExercise,
    /// Request a difficulty level
    ///
    /// The level is sent as given; clamping to what the bike supports is up
    /// to the caller.
    SetDifficulty(u8),
}

impl Command {
    /// Message type of the command
    #[must_use]
    pub const fn message_type(self) -> MessageType {
        match self {
            Self::StartExercise => MessageType::Start,
            Self::SetDifficulty(_) => MessageType::Difficulty,
        }
    }

    /// Serialize the command to a frame
    #[must_use]
    pub fn to_frame(self) -> Frame {
        match self {
            Self::StartExercise => Frame::new(Bytes::from_static(&START_EXERCISE)),
            Self::SetDifficulty(level) => {
                let mut buf = BytesMut::with_capacity(COMMAND_SIZE);

                buf.put_u8(PREAMBLE);
                buf.put_u8(MessageType::Difficulty as u8);
                buf.put_u8(0x01);
                buf.put_u8(level);

                let sum = checksum(&buf);
                buf.put_u8(sum);

                Frame::new(buf.freeze())
            }
        }
    }
}

/// Build the start exercise command frame
#[must_use]
pub fn build_start_command() -> Frame {
    Command::StartExercise.to_frame()
}

/// Build a difficulty command frame `[F0, D2, 01, level, checksum]`
#[must_use]
pub fn build_difficulty_command(level: u8) -> Frame {
    Command::SetDifficulty(level).to_frame()
}

/// Event decoded from an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// Recognized frame without semantic payload
    Unknown,
    /// Workout timer and cadence update
    Telemetry {
        /// Elapsed workout time in seconds
        workout_timer_seconds: u16,
        /// Pedalling cadence
        cadence: u16,
    },
    /// Difficulty level reported by the bike
    DifficultyChange {
        /// New difficulty level
        level: u8,
    },
}

impl TelemetryEvent {
    /// Merge the event into a reading
    ///
    /// Timer and cadence are updated together, difficulty on its own.
    /// Returns whether the reading changed.
    pub fn apply_to(self, reading: &mut TelemetryReading) -> bool {
        let before = *reading;
        match self {
            Self::Unknown => {}
            Self::Telemetry {
                workout_timer_seconds,
                cadence,
            } => {
                reading.workout_timer_seconds = workout_timer_seconds;
                reading.cadence = cadence;
            }
            Self::DifficultyChange { level } => {
                reading.difficulty_level = level;
            }
        }
        before != *reading
    }
}

/// Parse an inbound frame into an event
///
/// Frame layout:
/// - Byte 0: preamble `0xF0`
/// - Byte 1: message type
/// - Byte 2: sub-length/flag, not interpreted
/// - Telemetry: bytes 3-4 workout timer, bytes 9-10 cadence (u16 big-endian)
/// - Difficulty: byte 3 level
///
/// # Errors
///
/// Returns [`BikeError::MalformedFrame`] when the preamble is missing, the
/// message type is not an inbound type, or the frame is shorter than its
/// type requires.
pub fn parse_frame(frame: &Frame) -> Result<TelemetryEvent> {
    if !frame.has_preamble() {
        return Err(BikeError::MalformedFrame(format!(
            "missing preamble in [{frame}]"
        )));
    }

    let discriminator = frame
        .discriminator()
        .ok_or_else(|| BikeError::MalformedFrame("missing message type".to_string()))?;

    let message_type = match MessageType::from_u8(discriminator) {
        Some(message_type @ (MessageType::Unknown
        | MessageType::Telemetry
        | MessageType::Difficulty)) => message_type,
        _ => {
            return Err(BikeError::MalformedFrame(format!(
                "unexpected message type {discriminator:02X}"
            )))
        }
    };

    let required = message_type.min_frame_len();
    if frame.len() < required {
        return Err(BikeError::MalformedFrame(format!(
            "{message_type:?} frame too short: {} bytes, expected {required}",
            frame.len()
        )));
    }

    let event = match message_type {
        MessageType::Telemetry => {
            let mut buf = &frame.as_bytes()[3..];
            let workout_timer_seconds = buf.get_u16();
            buf.advance(4);
            let cadence = buf.get_u16();
            TelemetryEvent::Telemetry {
                workout_timer_seconds,
                cadence,
            }
        }
        MessageType::Difficulty => TelemetryEvent::DifficultyChange {
            level: frame.as_bytes()[3],
        },
        MessageType::Unknown | MessageType::Start => TelemetryEvent::Unknown,
    };

    Ok(event)
}

/// Decode an inbound frame, discarding anything malformed
///
/// A malformed frame is logged and yields `None`; it never fails the caller.
#[must_use]
pub fn decode(frame: &Frame) -> Option<TelemetryEvent> {
    match parse_frame(frame) {
        Ok(event) => {
            match event {
                TelemetryEvent::Unknown => trace!("Unknown frame: [{frame}]"),
                TelemetryEvent::DifficultyChange { .. } => debug!("Difficulty frame: [{frame}]"),
                TelemetryEvent::Telemetry { .. } => trace!("Telemetry frame: [{frame}]"),
            }
            Some(event)
        }
        Err(e) => {
            warn!("Discarding frame: {e}");
            None
        }
    }
}
