use thiserror::Error;

/// Errors that can occur when working with exercise bikes
#[derive(Error, Debug)]
pub enum BikeError {
    /// Bluetooth adapter level errors
    #[error("BLE error: {0}")]
    Ble(#[source] btleplug::Error),

    /// The platform refused Bluetooth access
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// Transport payload could not be decoded to bytes
    #[error("Malformed payload encoding: {0}")]
    MalformedEncoding(String),

    /// Frame decoded but too short or unrecognized for its declared type
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Connect, write or subscribe rejected by the transport
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Service or characteristic identifier could not be parsed
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Device not found during scanning or connecting
    #[error("Bike not found")]
    DeviceNotFound,

    /// The bike dropped the link before the operation reached it
    #[error("Bike disconnected")]
    Disconnected,

    /// Operation not valid in the current session state
    #[error("Invalid session state: {state}")]
    InvalidState {
        /// Current session state description
        state: String,
    },

    /// Connection attempt timeout
    #[error("Connection timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
}

impl From<btleplug::Error> for BikeError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            other => Self::Ble(other),
        }
    }
}

/// Result type for bike operations
pub type Result<T> = std::result::Result<T, BikeError>;

impl BikeError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::TransportFailure(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::Timeout { .. }
        )
    }

    /// Check if this error is discarded locally without affecting the session
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedEncoding(_) | Self::MalformedFrame(_))
    }

    /// Check if this error ends an in-progress connection attempt
    #[must_use]
    pub const fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::TransportFailure(_)
                | Self::PermissionDenied
                | Self::DeviceNotFound
                | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transport_error = BikeError::TransportFailure("write rejected".to_string());
        assert!(transport_error.is_connection_error());
        assert!(!transport_error.is_recoverable());
        assert!(transport_error.is_fatal_to_session());

        let frame_error = BikeError::MalformedFrame("too short".to_string());
        assert!(!frame_error.is_connection_error());
        assert!(frame_error.is_recoverable());
        assert!(!frame_error.is_fatal_to_session());

        let state_error = BikeError::InvalidState {
            state: "Streaming".to_string(),
        };
        assert!(!state_error.is_connection_error());
        assert!(!state_error.is_recoverable());
        assert!(!state_error.is_fatal_to_session());
    }

    #[test]
    fn test_permission_denied_mapping() {
        let error = BikeError::from(btleplug::Error::PermissionDenied);
        assert!(matches!(error, BikeError::PermissionDenied));

        let error = BikeError::from(btleplug::Error::DeviceNotFound);
        assert!(matches!(error, BikeError::Ble(_)));
    }

    #[test]
    fn test_error_display() {
        let error = BikeError::MalformedEncoding("invalid byte 33".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Malformed payload encoding"));
        assert!(error_string.contains("invalid byte 33"));

        let error = BikeError::Timeout { timeout_ms: 30_000 };
        assert_eq!(error.to_string(), "Connection timed out after 30000ms");
    }
}
