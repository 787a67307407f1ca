//! Orientation characteristic packet format.
//!
//! Each notification carries `sensors_per_device` quaternions. Every
//! quaternion is four little-endian `i16` slots scaled by 1/32768, so one
//! sensor takes 8 bytes. The slot-to-component mapping is part of the device
//! profile because firmware revisions differ.

use crate::core::quaternion::{ComponentOrder, Orientation};
use crate::core::recording::Frame;
use serde::{Deserialize, Serialize};

/// Bytes per sensor in a notification payload.
pub const BYTES_PER_SENSOR: usize = 8;

/// Fixed-point scale of one quaternion slot.
pub const SLOT_SCALE: f64 = 32768.0;

/// Typed layout of one device's notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSchema {
    pub sensors_per_device: usize,
    pub order: ComponentOrder,
}

impl PacketSchema {
    pub fn new(sensors_per_device: usize, order: ComponentOrder) -> Self {
        Self {
            sensors_per_device,
            order,
        }
    }

    /// Exact payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.sensors_per_device * BYTES_PER_SENSOR
    }

    /// Decode a notification payload into a frame.
    ///
    /// Payloads of any other length than [`payload_len`](Self::payload_len)
    /// are rejected, never padded or truncated.
    pub fn decode(&self, raw: &[u8], sequence_number: u64) -> Result<Frame, DecodeError> {
        if raw.len() != self.payload_len() {
            return Err(DecodeError::MalformedPacket {
                expected: self.payload_len(),
                actual: raw.len(),
            });
        }

        let orientations = raw
            .chunks_exact(BYTES_PER_SENSOR)
            .map(|sensor| {
                let mut slots = [0.0; 4];
                for (slot, bytes) in sensor.chunks_exact(2).enumerate() {
                    slots[slot] = i16::from_le_bytes([bytes[0], bytes[1]]) as f64 / SLOT_SCALE;
                }
                self.order.assemble(slots)
            })
            .collect();

        Ok(Frame::new(sequence_number, orientations))
    }

    /// Encode orientations into a notification payload.
    ///
    /// Components are rounded to the nearest step and clamped to the `i16`
    /// range, so `1.0` is sent as `32767`.
    pub fn encode(&self, orientations: &[Orientation]) -> Result<Vec<u8>, DecodeError> {
        if orientations.len() != self.sensors_per_device {
            return Err(DecodeError::SensorCount {
                expected: self.sensors_per_device,
                actual: orientations.len(),
            });
        }

        let mut out = Vec::with_capacity(self.payload_len());
        for orientation in orientations {
            for value in self.order.arrange(orientation) {
                let fixed = (value * SLOT_SCALE)
                    .round()
                    .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                out.extend_from_slice(&fixed.to_le_bytes());
            }
        }
        Ok(out)
    }
}

/// Stream decoder for one device.
///
/// Numbers payloads in arrival order, malformed ones included, so gaps in
/// the sequence of decoded frames show where packets were dropped.
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    schema: PacketSchema,
    next_sequence: u64,
}

impl PacketDecoder {
    pub fn new(schema: PacketSchema) -> Self {
        Self {
            schema,
            next_sequence: 0,
        }
    }

    pub fn schema(&self) -> &PacketSchema {
        &self.schema
    }

    pub fn decode(&mut self, raw: &[u8]) -> Result<Frame, DecodeError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.schema.decode(raw, sequence)
    }
}

/// Packet-level errors. These are counted and skipped by sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload length does not match the schema
    MalformedPacket { expected: usize, actual: usize },
    /// Wrong number of orientations passed to the encoder
    SensorCount { expected: usize, actual: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::MalformedPacket { expected, actual } => write!(
                f,
                "Malformed packet: expected {expected} bytes, got {actual}"
            ),
            DecodeError::SensorCount { expected, actual } => {
                write!(f, "Expected {expected} orientations, got {actual}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}
