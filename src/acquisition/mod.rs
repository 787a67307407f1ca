//! Acquisition of orientation streams from the garments.
//!
//! This module contains:
//! - The notification packet codec
//! - The transport abstraction and a scripted in-process transport
//! - Per-device sessions (connect, record, close)
//! - Concurrent capture across devices with sibling cancellation
//!
//! The btleplug-backed transport is only available with the `ble` feature.

pub mod capture;
pub mod packet;
pub mod session;
pub mod transport;

#[cfg(feature = "ble")]
pub mod ble;

// Re-export commonly used types
pub use capture::{CaptureCoordinator, CaptureError, CaptureOutcome, DeviceLink};
pub use packet::{DecodeError, PacketDecoder, PacketSchema, BYTES_PER_SENSOR};
pub use session::{DeviceSession, DeviceSpec, RecordOutcome, SessionConfig, SessionError};
pub use transport::{
    bluetooth_uuid, LinkEvent, LinkProbe, SimulatedTransport, Transport, TransportError,
};

#[cfg(feature = "ble")]
pub use ble::BleTransport;
