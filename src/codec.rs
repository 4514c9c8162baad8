use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

use crate::{
    error::{BikeError, Result},
    protocol::Frame,
};

/// Largest payload a single write or notification carries
///
/// Default ATT MTU of 23 bytes minus the 3-byte ATT header.
pub const MAX_PAYLOAD_SIZE: usize = 20;

/// Encoding a transport uses for payloads crossing its boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    /// Raw bytes
    #[default]
    Binary,
    /// Standard base64 text
    Base64,
}

/// Payload as handed to or received from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    /// Raw bytes
    Binary(Bytes),
    /// Standard base64 text
    Base64(String),
}

impl WirePayload {
    /// Encoding of this payload
    #[must_use]
    pub const fn encoding(&self) -> PayloadEncoding {
        match self {
            Self::Binary(_) => PayloadEncoding::Binary,
            Self::Base64(_) => PayloadEncoding::Base64,
        }
    }
}

/// Convert a transport payload to a frame
///
/// # Errors
///
/// Returns [`BikeError::MalformedEncoding`] if a base64 payload uses characters
/// outside the alphabet or has invalid padding.
pub fn decode_bytes(payload: &WirePayload) -> Result<Frame> {
    match payload {
        WirePayload::Binary(bytes) => Ok(Frame::new(bytes.clone())),
        WirePayload::Base64(text) => STANDARD
            .decode(text.as_bytes())
            .map(Frame::from)
            .map_err(|e| BikeError::MalformedEncoding(e.to_string())),
    }
}

/// Convert a frame to a transport payload
#[must_use]
pub fn encode_bytes(frame: &Frame, encoding: PayloadEncoding) -> WirePayload {
    match encoding {
        PayloadEncoding::Binary => WirePayload::Binary(frame.to_bytes()),
        PayloadEncoding::Base64 => WirePayload::Base64(STANDARD.encode(frame.as_bytes())),
    }
}
