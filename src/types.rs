use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::{error::BikeError, DEVICE_SERVICE};

/// Display name used when a bike advertises without a local name
pub const UNKNOWN_BIKE_NAME: &str = "Unknown Bike";

/// 128-bit GATT service identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId(Uuid);

/// 128-bit GATT characteristic identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId(Uuid);

macro_rules! gatt_id {
    ($name:ident) => {
        impl $name {
            /// Create an identifier from its 128-bit value
            #[must_use]
            pub const fn from_u128(value: u128) -> Self {
                Self(Uuid::from_u128(value))
            }

            /// Underlying UUID
            #[must_use]
            pub const fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = BikeError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(value).map(Self).map_err(|e| {
                    BikeError::InvalidIdentifier(format!("{value:?}: {e}"))
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0.hyphenated(), f)
            }
        }
    };
}

gatt_id!(ServiceId);
gatt_id!(CharacteristicId);

/// Opaque device identifier as reported by the platform BLE stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create a new peripheral identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discovered bike awaiting connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralRef {
    /// Device identifier
    pub id: PeripheralId,
    /// Advertised display name
    pub name: String,
    /// Signal strength (RSSI) at discovery time
    pub rssi: Option<i16>,
}

impl PeripheralRef {
    /// Create a new peripheral reference
    #[must_use]
    pub fn new(id: PeripheralId, name: Option<String>) -> Self {
        Self {
            id,
            name: name.unwrap_or_else(|| UNKNOWN_BIKE_NAME.to_string()),
            rssi: None,
        }
    }

    /// Attach the signal strength observed at discovery
    #[must_use]
    pub const fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

impl fmt::Display for PeripheralRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Latest workout readings reported by the bike
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryReading {
    /// Elapsed workout time in seconds
    pub workout_timer_seconds: u16,
    /// Pedalling cadence
    pub cadence: u16,
    /// Difficulty level, either device reported or set locally
    pub difficulty_level: u8,
}

impl TelemetryReading {
    /// Workout timer formatted as `m:ss`
    #[must_use]
    pub fn formatted_timer(&self) -> String {
        let minutes = self.workout_timer_seconds / 60;
        let seconds = self.workout_timer_seconds % 60;
        format!("{minutes}:{seconds:02}")
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No bike connected
    #[default]
    Disconnected,
    /// Connection requested, waiting for the transport
    Connecting(PeripheralRef),
    /// Connected and services discovered
    Connected(PeripheralRef),
    /// Exercise started and telemetry subscribed
    Streaming(PeripheralRef),
}

impl SessionState {
    /// Peripheral of the active session, if any
    #[must_use]
    pub const fn peripheral(&self) -> Option<&PeripheralRef> {
        match self {
            Self::Disconnected => None,
            Self::Connecting(p) | Self::Connected(p) | Self::Streaming(p) => Some(p),
        }
    }

    /// Whether a connection target is held
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }

    /// Whether telemetry is flowing
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting(p) => write!(f, "Connecting to {p}"),
            Self::Connected(p) => write!(f, "Connected to {p}"),
            Self::Streaming(p) => write!(f, "Streaming from {p}"),
        }
    }
}

/// Immutable view of the session handed to observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Lifecycle state
    pub state: SessionState,
    /// Latest readings
    pub reading: TelemetryReading,
    /// Discovered bikes in first-seen order
    pub devices: Vec<PeripheralRef>,
    /// Whether a scan is running
    pub scanning: bool,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Advertised service to scan for
    pub scan_filter: ServiceId,
    /// Connection timeout in milliseconds, `None` waits indefinitely
    pub connect_timeout_ms: Option<u64>,
    /// Stop the running scan once a connection is established
    pub stop_scan_on_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_filter: DEVICE_SERVICE,
            connect_timeout_ms: Some(30_000),
            stop_scan_on_connect: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bike() -> PeripheralRef {
        PeripheralRef::new(PeripheralId::new("AA:BB:CC:DD:EE:01"), Some("Bike".into()))
    }

    #[test]
    fn test_formatted_timer() {
        let mut reading = TelemetryReading::default();
        assert_eq!(reading.formatted_timer(), "0:00");

        reading.workout_timer_seconds = 300;
        assert_eq!(reading.formatted_timer(), "5:00");

        reading.workout_timer_seconds = 65;
        assert_eq!(reading.formatted_timer(), "1:05");

        reading.workout_timer_seconds = u16::MAX;
        assert_eq!(reading.formatted_timer(), "1092:15");
    }

    #[test]
    fn test_peripheral_name_fallback() {
        let unnamed = PeripheralRef::new(PeripheralId::new("id-1"), None);
        assert_eq!(unnamed.name, UNKNOWN_BIKE_NAME);
        assert!(unnamed.rssi.is_none());

        let named = bike().with_rssi(-60);
        assert_eq!(named.name, "Bike");
        assert_eq!(named.rssi, Some(-60));
        assert_eq!(named.to_string(), "Bike (AA:BB:CC:DD:EE:01)");
    }

    #[test]
    fn test_session_state_accessors() {
        let state = SessionState::default();
        assert_eq!(state, SessionState::Disconnected);
        assert!(state.peripheral().is_none());
        assert!(!state.is_active());

        let state = SessionState::Streaming(bike());
        assert!(state.is_active());
        assert!(state.is_streaming());
        assert_eq!(state.peripheral(), Some(&bike()));
        assert_eq!(state.to_string(), "Streaming from Bike (AA:BB:CC:DD:EE:01)");

        assert!(!SessionState::Connecting(bike()).is_streaming());
    }

    #[test]
    fn test_gatt_id_parsing() {
        let parsed: ServiceId = "0bf669f0-45f2-11e7-9598-0800200c9a66".parse().unwrap();
        assert_eq!(parsed, DEVICE_SERVICE);
        assert_eq!(parsed.to_string(), "0bf669f0-45f2-11e7-9598-0800200c9a66");

        let parsed: Result<CharacteristicId, _> = "not-a-uuid".parse();
        assert!(parsed.is_err());
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.scan_filter, DEVICE_SERVICE);
        assert_eq!(config.connect_timeout_ms, Some(30_000));
        assert!(config.stop_scan_on_connect);
    }
}
