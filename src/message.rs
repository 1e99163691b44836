//! Administrative message codec
//!
//! Administrative records are the only payloads the pipeline looks inside.
//! They carry a fixed 8-byte message header followed by an MMB header with
//! the emitting node id. All fields are little-endian and bit-exact so that
//! replicated streams agree on the wire image.

use crossbeam::queue::SegQueue;

use crate::constants::MARKER_QUEUE_LIMIT;
use crate::error::{ RelayError, Result };

/// Length of the fixed message header in bytes
pub const MESSAGE_HEADER_LENGTH: usize = 8;

/// Length of the MMB header in bytes
pub const MMB_HEADER_LENGTH: usize = 2;

/// Total length of a snapshot marker record payload
pub const SNAPSHOT_MESSAGE_LENGTH: usize = MESSAGE_HEADER_LENGTH + MMB_HEADER_LENGTH;

/// Template id of the load-snapshot marker
pub const LOAD_SNAPSHOT_TEMPLATE_ID: u16 = 1;

/// Template id of the save-snapshot marker
pub const SAVE_SNAPSHOT_TEMPLATE_ID: u16 = 2;

/// Schema id shared by the snapshot templates
pub const SNAPSHOT_SCHEMA_ID: u16 = 7;

/// Schema version of the snapshot templates
pub const SNAPSHOT_SCHEMA_VERSION: u16 = 0;

/// Fixed header preceding every administrative message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Length of the body block that follows the header
    pub block_length: u16,
    /// Template id discriminating the body layout
    pub template_id: u16,
    /// Schema id
    pub schema_id: u16,
    /// Schema version
    pub version: u16,
}

impl MessageHeader {
    /// Encode into an 8-byte little-endian header
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.block_length.to_le_bytes());
        buf[2..4].copy_from_slice(&self.template_id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.schema_id.to_le_bytes());
        buf[6..8].copy_from_slice(&self.version.to_le_bytes());
    }

    /// Decode from a little-endian header
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MESSAGE_HEADER_LENGTH {
            return Err(RelayError::invalid_message("message header truncated"));
        }
        Ok(Self {
            block_length: u16::from_le_bytes([buf[0], buf[1]]),
            template_id: u16::from_le_bytes([buf[2], buf[3]]),
            schema_id: u16::from_le_bytes([buf[4], buf[5]]),
            version: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

/// Body header carried by the snapshot templates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmbHeader {
    /// Identifier of the node that emitted the marker
    pub node_id: u16,
}

impl MmbHeader {
    /// Encode into a 2-byte little-endian body header
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.node_id.to_le_bytes());
    }

    /// Decode from a little-endian body header
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MMB_HEADER_LENGTH {
            return Err(RelayError::invalid_message("MMB header truncated"));
        }
        Ok(Self {
            node_id: u16::from_le_bytes([buf[0], buf[1]]),
        })
    }
}

/// Build a complete snapshot marker payload for the given template
pub fn encode_snapshot(template_id: u16, node_id: u16) -> [u8; SNAPSHOT_MESSAGE_LENGTH] {
    let mut buf = [0u8; SNAPSHOT_MESSAGE_LENGTH];
    let header = MessageHeader {
        block_length: MMB_HEADER_LENGTH as u16,
        template_id,
        schema_id: SNAPSHOT_SCHEMA_ID,
        version: SNAPSHOT_SCHEMA_VERSION,
    };
    header.encode(&mut buf[..MESSAGE_HEADER_LENGTH]);
    MmbHeader { node_id }.encode(&mut buf[MESSAGE_HEADER_LENGTH..]);
    buf
}

/// Decode a snapshot marker payload into its header pair
pub fn decode_snapshot(buf: &[u8]) -> Result<(MessageHeader, MmbHeader)> {
    let header = MessageHeader::decode(buf)?;
    let body = MmbHeader::decode(&buf[MESSAGE_HEADER_LENGTH..])?;
    Ok((header, body))
}

/// Hand-off of administrative markers to the ingress worker
///
/// The ingress ring has exactly one producer thread, so the timer never
/// writes it directly; it enqueues encoded markers here and the ingress
/// worker drains them into the ring ahead of its subscription poll. The
/// queue is bounded: with the ingress worker stalled long enough, new
/// markers are dropped rather than piling up (the next interval re-emits).
pub struct MarkerQueue {
    markers: SegQueue<[u8; SNAPSHOT_MESSAGE_LENGTH]>,
}

impl MarkerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            markers: SegQueue::new(),
        }
    }

    /// Enqueue one marker for injection
    pub fn enqueue(&self, template_id: u16, node_id: u16) {
        if self.markers.len() >= MARKER_QUEUE_LIMIT {
            tracing::warn!(template_id, "marker queue full, snapshot marker dropped");
            return;
        }
        self.markers.push(encode_snapshot(template_id, node_id));
    }

    /// Take the oldest pending marker
    pub fn pop(&self) -> Option<[u8; SNAPSHOT_MESSAGE_LENGTH]> {
        self.markers.pop()
    }

    /// Pending markers
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

impl Default for MarkerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = MessageHeader {
            block_length: 2,
            template_id: SAVE_SNAPSHOT_TEMPLATE_ID,
            schema_id: SNAPSHOT_SCHEMA_ID,
            version: SNAPSHOT_SCHEMA_VERSION,
        };
        let mut buf = [0u8; MESSAGE_HEADER_LENGTH];
        header.encode(&mut buf);
        assert_eq!(MessageHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_snapshot_wire_image_is_little_endian() {
        let buf = encode_snapshot(SAVE_SNAPSHOT_TEMPLATE_ID, 0x1234);
        // block length 2, template 2, schema 7, version 0, node id 0x1234
        assert_eq!(&buf, &[0x02, 0x00, 0x02, 0x00, 0x07, 0x00, 0x00, 0x00, 0x34, 0x12]);
    }

    #[test]
    fn test_decode_snapshot() {
        let buf = encode_snapshot(LOAD_SNAPSHOT_TEMPLATE_ID, 42);
        let (header, body) = decode_snapshot(&buf).unwrap();
        assert_eq!(header.template_id, LOAD_SNAPSHOT_TEMPLATE_ID);
        assert_eq!(header.block_length, MMB_HEADER_LENGTH as u16);
        assert_eq!(body.node_id, 42);
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        assert!(MessageHeader::decode(&[0u8; 4]).is_err());
        assert!(decode_snapshot(&[0u8; MESSAGE_HEADER_LENGTH]).is_err());
    }

    #[test]
    fn test_marker_queue_fifo() {
        let queue = MarkerQueue::new();
        assert!(queue.is_empty());

        queue.enqueue(LOAD_SNAPSHOT_TEMPLATE_ID, 1);
        queue.enqueue(SAVE_SNAPSHOT_TEMPLATE_ID, 1);
        assert_eq!(queue.len(), 2);

        let first = queue.pop().unwrap();
        assert_eq!(decode_snapshot(&first).unwrap().0.template_id, LOAD_SNAPSHOT_TEMPLATE_ID);
        let second = queue.pop().unwrap();
        assert_eq!(decode_snapshot(&second).unwrap().0.template_id, SAVE_SNAPSHOT_TEMPLATE_ID);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_marker_queue_bounded() {
        let queue = MarkerQueue::new();
        for _ in 0..MARKER_QUEUE_LIMIT + 10 {
            queue.enqueue(SAVE_SNAPSHOT_TEMPLATE_ID, 1);
        }
        assert_eq!(queue.len(), MARKER_QUEUE_LIMIT);
    }
}
