use crate::bucket::{GroEntry, GRO_MAX_PACKET_SIZE};
use crate::headers::{Ipv4Hdr, TcpHdr, TCP_FLAG_CWR, TCP_FLAG_FIN, TCP_FLAG_PSH};

/// Outcome of comparing an arriving segment against a staged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowMatch {
    /// Different 4-tuple; keep scanning.
    NoMatch,
    /// Same flow and wire-compatible: the segment may be appended.
    Mergeable,
    /// Same flow but the headers disagree in a way that forbids merging;
    /// the staged entry must be delivered before the segment proceeds.
    FlushRequired,
}

/// Classifies `ip`/`tcp` (with `payload_len` payload bytes) against a
/// staged entry.
///
/// Merging requires more than sequence adjacency: any header difference
/// the upper stack could observe (TTL, TOS, ACK, option bytes) forces the
/// staged entry out first so nothing is papered over.
pub(crate) fn classify<B1, B2>(
    ip: &Ipv4Hdr<B1>,
    tcp: &TcpHdr<B2>,
    payload_len: u16,
    entry: &GroEntry,
) -> FlowMatch
where
    B1: AsRef<[u8]>,
    B2: AsRef<[u8]>,
{
    if ip.source_addr() != entry.ip_hdr.source_addr()
        || ip.dest_addr() != entry.ip_hdr.dest_addr()
    {
        return FlowMatch::NoMatch;
    }
    if tcp.source_port() != entry.tcp_hdr.source_port()
        || tcp.dest_port() != entry.tcp_hdr.dest_port()
    {
        return FlowMatch::NoMatch;
    }

    // Same flow from here on: the only question is merge or flush.

    if ip.ttl() != entry.ip_hdr.ttl() || ip.tos() != entry.ip_hdr.tos() {
        return FlowMatch::FlushRequired;
    }

    let flags = tcp.flags();
    let entry_flags = entry.tcp_hdr.flags();
    if flags & TCP_FLAG_CWR != 0 // congestion signal must surface promptly
        || (flags ^ entry_flags) & !(TCP_FLAG_CWR | TCP_FLAG_FIN | TCP_FLAG_PSH) != 0
        || tcp.ack_number() != entry.tcp_hdr.ack_number()
        || tcp.data_offset() != entry.tcp_hdr.data_offset()
        || entry
            .tcp_hdr
            .sequence_number()
            .wrapping_add(entry.payload_size() as u32)
            != tcp.sequence_number()
    {
        return FlowMatch::FlushRequired;
    }

    // Options, timestamps included, must be byte-identical.
    if tcp.options() != entry.tcp_hdr.options() {
        return FlowMatch::FlushRequired;
    }

    // Cap on the coalesced packet size.
    if payload_len as usize + entry.pkt.len() >= GRO_MAX_PACKET_SIZE {
        return FlowMatch::FlushRequired;
    }

    FlowMatch::Mergeable
}
