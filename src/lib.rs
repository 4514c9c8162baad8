#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Pedalers 🚴
//!
//! A Rust library for streaming workout telemetry from exercise bikes and
//! adjusting their difficulty via Bluetooth Low Energy.
//!
//! The bike speaks a small proprietary protocol over two GATT characteristics
//! of a single service: the app writes commands without response, and the bike
//! notifies telemetry frames back.
//!
//! ## Protocol Overview
//!
//! - **Discovery**: bikes advertise [`DEVICE_SERVICE`]
//! - **Frames**: every frame starts with the preamble `0xF0`, followed by a
//!   message type byte (`0xB0` start, `0xD0` unknown, `0xD1` telemetry,
//!   `0xD2` difficulty)
//! - **Telemetry**: workout timer at bytes 3-4 and cadence at bytes 9-10,
//!   both big-endian
//! - **Commands**: fixed 5-byte frames, difficulty commands carry an additive
//!   checksum in their last byte
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use pedalers::{ble::BtleplugTransport, BikeSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let session = BikeSession::new(transport, SessionConfig::default());
//!
//!     // Collect advertising bikes for a while
//!     session.start_scan().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(bike) = session.discovered_devices().await.into_iter().next() {
//!         session.connect(bike).await?;
//!         session.set_difficulty(5).await?;
//!
//!         let reading = session.reading().await;
//!         println!("cadence {} at {}", reading.cadence, reading.formatted_timer());
//!     }
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy backend built on btleplug
pub mod ble;
/// Transport encoding of frame payloads
pub mod codec;
/// Error types and handling
pub mod error;
/// Protocol frames, commands and telemetry decoding
pub mod protocol;
/// Deduplicated list of discovered bikes
pub mod registry;
/// Connection lifecycle and telemetry state
pub mod session;
/// Transport boundary between the session and a BLE stack
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use codec::{PayloadEncoding, WirePayload};
pub use error::{BikeError, Result};
pub use protocol::{Command, Frame, MessageType, TelemetryEvent};
pub use registry::ScanRegistry;
pub use session::BikeSession;
pub use transport::{BleTransport, ConnectionHandle, ServiceInfo};
pub use types::{
    CharacteristicId, PeripheralId, PeripheralRef, ServiceId, SessionConfig, SessionSnapshot,
    SessionState, TelemetryReading,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service advertised by the bike, used as the scan filter
pub const DEVICE_SERVICE: ServiceId =
    ServiceId::from_u128(0x0bf6_69f0_45f2_11e7_9598_0800_200c_9a66);

/// Service hosting the command and telemetry characteristics
pub const CONNECT_SERVICE: ServiceId =
    ServiceId::from_u128(0x0bf6_69f1_45f2_11e7_9598_0800_200c_9a66);

/// Characteristic accepting commands (write without response)
///
/// Writing commands to the telemetry characteristic is rejected by the bike.
pub const WRITE_CHARACTERISTIC: CharacteristicId =
    CharacteristicId::from_u128(0x0bf6_69f2_45f2_11e7_9598_0800_200c_9a66);

/// Characteristic notifying telemetry and difficulty frames
pub const TELEMETRY_CHARACTERISTIC: CharacteristicId =
    CharacteristicId::from_u128(0x0bf6_69f4_45f2_11e7_9598_0800_200c_9a66);
