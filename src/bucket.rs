use std::sync::Arc;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};

use crate::dispatcher::NetworkEndpoint;
use crate::flow::{classify, FlowMatch};
use crate::headers::{
    Ipv4Hdr, Ipv4HdrOwned, TcpHdr, TcpHdrOwned, IPV4_MIN_HEADER_LEN, TCP_FLAG_FIN, TCP_FLAG_PSH,
};
use crate::packet::Packet;

/// Number of buckets in the flow table. Must be a power of two so the
/// flow hash can be masked instead of divided.
pub const GRO_BUCKET_COUNT: usize = 8;

const GRO_BUCKET_MASK: usize = GRO_BUCKET_COUNT - 1;

/// Staged entries per bucket.
pub const GRO_BUCKET_SIZE: usize = 8;

/// Upper bound on a coalesced packet, headers included.
pub const GRO_MAX_PACKET_SIZE: usize = 1 << 16;

/// An in-progress coalesced packet.
///
/// The packet buffer grows as segments merge; the header copies track what
/// the buffer's leading bytes say and exist so flow matching never
/// re-parses the staged datagram.
pub(crate) struct GroEntry {
    pub(crate) pkt: Packet,
    pub(crate) ip_hdr: Ipv4HdrOwned,
    pub(crate) tcp_hdr: TcpHdrOwned,
    pub(crate) created: Instant,
    pub(crate) ep: Arc<dyn NetworkEndpoint>,
}

impl GroEntry {
    /// Coalesced TCP payload bytes, excluding network and transport
    /// headers.
    pub(crate) fn payload_size(&self) -> u16 {
        self.ip_hdr.total_length()
            - IPV4_MIN_HEADER_LEN as u16
            - self.tcp_hdr.data_offset() as u16
    }

    /// Absorbs a mergeable segment: appends its payload and folds its
    /// FIN/PSH flags into the staged headers. Both the header copies and
    /// the buffer's leading bytes are patched so the delivered datagram
    /// agrees with what matching saw. The IPv4 header checksum is left
    /// stale; the packet goes up with `rx_checksum_validated` set.
    pub(crate) fn merge_segment(&mut self, candidate: &Packet, data_off: usize, payload_len: u16) {
        self.pkt
            .append_payload(&candidate.as_slice()[IPV4_MIN_HEADER_LEN + data_off..]);

        let folded =
            candidate.as_slice()[IPV4_MIN_HEADER_LEN + 13] & (TCP_FLAG_FIN | TCP_FLAG_PSH);
        let flags = self.tcp_hdr.flags() | folded;
        self.tcp_hdr.set_flags(flags);
        let total = self.ip_hdr.total_length().wrapping_add(payload_len);
        self.ip_hdr.set_total_length(total);

        let buf = self.pkt.as_mut_slice();
        BigEndian::write_u16(&mut buf[2..4], total);
        buf[IPV4_MIN_HEADER_LEN + 13] |= folded;
    }
}

struct Slot {
    entry: Option<GroEntry>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            entry: None,
            prev: None,
            next: None,
        }
    }
}

/// Fixed-capacity holding area for staged packets of the flows that hash
/// here.
///
/// Storage is a preallocated slot arena with a LIFO free-index stack;
/// arrival order is kept by an index-linked list threaded through the
/// slots (front = oldest). Slot indices identify physical storage and
/// never move, so no allocation or copying happens on insert or remove.
pub(crate) struct Bucket {
    slots: [Slot; GRO_BUCKET_SIZE],
    free: [usize; GRO_BUCKET_SIZE],
    len: usize,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Bucket {
    fn new() -> Bucket {
        Bucket {
            slots: std::array::from_fn(|_| Slot::empty()),
            free: std::array::from_fn(|i| i),
            len: 0,
            head: None,
            tail: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn full(&self) -> bool {
        self.len == GRO_BUCKET_SIZE
    }

    /// Oldest entry's slot index, if any.
    pub(crate) fn front(&self) -> Option<usize> {
        self.head
    }

    /// Next-younger entry after `idx`.
    pub(crate) fn next_after(&self, idx: usize) -> Option<usize> {
        self.slots[idx].next
    }

    pub(crate) fn entry(&self, idx: usize) -> &GroEntry {
        self.slots[idx].entry.as_ref().expect("slot on list holds an entry")
    }

    pub(crate) fn entry_mut(&mut self, idx: usize) -> &mut GroEntry {
        self.slots[idx].entry.as_mut().expect("slot on list holds an entry")
    }

    /// Stages a packet. The caller must have checked `full()`.
    pub(crate) fn insert(
        &mut self,
        pkt: Packet,
        ip_hdr: Ipv4HdrOwned,
        tcp_hdr: TcpHdrOwned,
        ep: Arc<dyn NetworkEndpoint>,
    ) {
        debug_assert!(!self.full());
        let idx = self.free[self.len];
        self.len += 1;

        self.slots[idx].entry = Some(GroEntry {
            pkt,
            ip_hdr,
            tcp_hdr,
            created: Instant::now(),
            ep,
        });
        self.slots[idx].prev = self.tail;
        self.slots[idx].next = None;
        match self.tail {
            Some(tail) => self.slots[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    /// Detaches and returns the front (oldest) entry. The caller must have
    /// checked the bucket is non-empty.
    pub(crate) fn remove_oldest(&mut self) -> GroEntry {
        let idx = self.head.expect("remove_oldest on an empty bucket");
        self.remove(idx)
    }

    /// Detaches the entry at `idx`, returning its slot to the free stack.
    pub(crate) fn remove(&mut self, idx: usize) -> GroEntry {
        let prev = self.slots[idx].prev;
        let next = self.slots[idx].next;
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;

        let entry = self.slots[idx].entry.take().expect("slot on list holds an entry");
        self.len -= 1;
        self.free[self.len] = idx;
        entry
    }

    /// Scans for the staged entry of the candidate's flow.
    ///
    /// Returns the matching slot index (there is at most one entry per
    /// 4-tuple) and whether it must be flushed instead of merged.
    pub(crate) fn find<B1, B2>(
        &self,
        ip: &Ipv4Hdr<B1>,
        tcp: &TcpHdr<B2>,
        payload_len: u16,
    ) -> (Option<usize>, bool)
    where
        B1: AsRef<[u8]>,
        B2: AsRef<[u8]>,
    {
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            match classify(ip, tcp, payload_len, self.entry(idx)) {
                FlowMatch::NoMatch => cursor = self.slots[idx].next,
                FlowMatch::Mergeable => return (Some(idx), false),
                FlowMatch::FlushRequired => return (Some(idx), true),
            }
        }
        (None, false)
    }
}

/// All buckets, indexed by the flow hash. The dispatcher serializes access
/// with a single mutex around the whole table; per-bucket locking is a
/// possible refinement.
pub(crate) struct BucketTable {
    buckets: [Bucket; GRO_BUCKET_COUNT],
}

impl BucketTable {
    pub(crate) fn new() -> BucketTable {
        BucketTable {
            buckets: std::array::from_fn(|_| Bucket::new()),
        }
    }

    pub(crate) fn bucket_for_flow<B1, B2>(
        &mut self,
        ip: &Ipv4Hdr<B1>,
        tcp: &TcpHdr<B2>,
    ) -> &mut Bucket
    where
        B1: AsRef<[u8]>,
        B2: AsRef<[u8]>,
    {
        &mut self.buckets[hash_flow(ip, tcp) & GRO_BUCKET_MASK]
    }

    pub(crate) fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub(crate) fn buckets_mut(&mut self) -> &mut [Bucket] {
        &mut self.buckets
    }
}

/// Byte-sum flow hash. Deliberately simple: the only property dispatch
/// relies on is that equal 4-tuples land in the same bucket. A stronger
/// mix (Jenkins, or reusing the IP header checksum) is a possible
/// refinement.
fn hash_flow<B1, B2>(ip: &Ipv4Hdr<B1>, tcp: &TcpHdr<B2>) -> usize
where
    B1: AsRef<[u8]>,
    B2: AsRef<[u8]>,
{
    let mut sum = 0usize;
    for byte in ip.source_addr() {
        sum += byte as usize;
    }
    for byte in ip.dest_addr() {
        sum += byte as usize;
    }
    sum + tcp.source_port() as usize + tcp.dest_port() as usize
}
