use bytes::BytesMut;

use crate::checksum::checksum_no_fold;

/// A received link-layer datagram moving through the dispatcher.
///
/// The buffer holds the full IPv4 packet, headers included. Ownership is
/// the reference-accounting model: `dispatch` consumes the packet and
/// exactly one of forward, stage, or merge-and-drop happens to it. A
/// staged packet's buffer grows in place as later segments of the same
/// flow are appended to it.
#[derive(Debug)]
pub struct Packet {
    data: BytesMut,
    /// Set when the link layer (or this dispatcher) has already verified
    /// the IPv4 and transport checksums, so upper layers can skip them.
    pub rx_checksum_validated: bool,
}

impl Packet {
    pub fn new(data: BytesMut) -> Packet {
        Packet {
            data,
            rx_checksum_validated: false,
        }
    }

    pub fn from_slice(data: &[u8]) -> Packet {
        Packet::new(BytesMut::from(data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the first `n` bytes if the packet is at least that long.
    ///
    /// The buffer is contiguous, so this is a bounds check rather than a
    /// copy; it still fails on truncated input, which is the behavior the
    /// dispatch path depends on.
    pub fn pull_up(&self, n: usize) -> Option<&[u8]> {
        self.data.get(..n)
    }

    /// Unfolded checksum accumulator over everything from `offset` to the
    /// end of the buffer.
    pub fn checksum_at_offset(&self, offset: usize) -> u64 {
        checksum_no_fold(&self.data[offset.min(self.data.len())..], 0)
    }

    /// Appends payload bytes to the logical datagram. Used when a later
    /// segment of the flow is merged into this staged packet.
    pub fn append_payload(&mut self, payload: &[u8]) {
        self.data.extend_from_slice(payload);
    }

    /// Mutable access to the raw bytes, for patching staged header fields
    /// in place.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
