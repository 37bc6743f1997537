//! Core identifier and message types shared by every layer.
//!
//! A `Message` is the unit of IPC: a fixed 64-byte record that is copied
//! bit-for-bit through channel queues and AEAD plaintext. The layout on the
//! wire is specified here explicitly (little-endian fields, then the opaque
//! body) so the format is defined by bytes, not by compiler layout.

#![forbid(unsafe_code)]

/// Process identifier within one node. Zero is reserved for "none".
pub type Pid = i64;

/// Logical network node identifier. Non-zero once a driver is initialized.
pub type NodeId = u64;

/// Opaque payload bytes carried by every message.
pub const MESSAGE_BODY_SIZE: usize = 48;

/// Serialized size of a [`Message`]: source + type + body.
pub const MESSAGE_WIRE_SIZE: usize = 16 + MESSAGE_BODY_SIZE;

/// Fixed-size IPC message.
///
/// The core reads none of the content except `source`, which it stamps on
/// every successful delivery with the sending pid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    /// Sender pid, written by the IPC layer on delivery.
    pub source: Pid,
    /// Application-defined discriminant.
    pub mtype: i64,
    /// Application-defined payload, opaque to the IPC core.
    pub body: [u8; MESSAGE_BODY_SIZE],
}

impl Message {
    /// Creates a message with the given type and an all-zero body.
    pub fn new(mtype: i64) -> Self {
        Self {
            source: 0,
            mtype,
            body: [0u8; MESSAGE_BODY_SIZE],
        }
    }

    /// Serializes to the fixed wire image: `source LE ‖ mtype LE ‖ body`.
    pub fn to_wire(&self) -> [u8; MESSAGE_WIRE_SIZE] {
        let mut out = [0u8; MESSAGE_WIRE_SIZE];
        out[0..8].copy_from_slice(&self.source.to_le_bytes());
        out[8..16].copy_from_slice(&self.mtype.to_le_bytes());
        out[16..].copy_from_slice(&self.body);
        out
    }

    /// Rebuilds a message from its wire image.
    pub fn from_wire(raw: &[u8; MESSAGE_WIRE_SIZE]) -> Self {
        let mut source = [0u8; 8];
        let mut mtype = [0u8; 8];
        source.copy_from_slice(&raw[0..8]);
        mtype.copy_from_slice(&raw[8..16]);
        let mut body = [0u8; MESSAGE_BODY_SIZE];
        body.copy_from_slice(&raw[16..]);
        Self {
            source: Pid::from_le_bytes(source),
            mtype: i64::from_le_bytes(mtype),
            body,
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_preserves_every_field() {
        let mut m = Message::new(77);
        m.source = -42;
        m.body[0] = 0xAB;
        m.body[MESSAGE_BODY_SIZE - 1] = 0xCD;

        let raw = m.to_wire();
        assert_eq!(raw.len(), MESSAGE_WIRE_SIZE);
        assert_eq!(Message::from_wire(&raw), m);
    }

    #[test]
    fn fields_are_little_endian_at_fixed_offsets() {
        let mut m = Message::new(0x0102_0304);
        m.source = 9;
        let raw = m.to_wire();
        assert_eq!(raw[0], 9);
        assert_eq!(raw[8], 0x04);
        assert_eq!(raw[9], 0x03);
    }
}
