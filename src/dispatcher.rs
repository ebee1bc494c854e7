use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};

use crate::bucket::BucketTable;
use crate::headers::{
    Ipv4Hdr, TcpHdr, IPV4_FLAG_DONT_FRAGMENT, IPV4_FLAG_MORE_FRAGMENTS, IPV4_MIN_HEADER_LEN,
    TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN, TCP_FLAG_URG, TCP_MIN_HEADER_LEN,
};
use crate::packet::Packet;

/// The upstream sink for fully assembled packets.
///
/// `handle_packet` is called exactly once per packet delivered upward. It
/// may be invoked from a dispatch caller's context or from the background
/// flush thread, and the bucket table lock is held across the call, so
/// implementations must not call back into the dispatcher.
pub trait NetworkEndpoint: Send + Sync {
    fn handle_packet(&self, pkt: Packet);
}

/// Network protocol of an arriving datagram, as reported by the link
/// layer. Only IPv4 traffic is considered for coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

/// Coalesces in-order TCP/IPv4 segments of a flow into larger packets
/// before they travel up the stack.
///
/// Arrivals enter through [`dispatch`](GroDispatcher::dispatch); a
/// background thread periodically delivers staged packets older than the
/// configured interval. An interval of zero disables coalescing and turns
/// dispatch into a synchronous pass-through.
pub struct GroDispatcher {
    shared: Arc<Shared>,
    /// Wakes the flush worker to re-read the interval. Capacity 1: a
    /// pending wakeup already covers any number of updates since the
    /// worker reloads the atomic, not the message.
    new_interval_tx: Sender<()>,
    stop_tx: Sender<()>,
    worker: Option<thread::JoinHandle<()>>,
}

struct Shared {
    /// Flush interval in nanoseconds. Zero means disabled.
    interval_ns: AtomicU64,
    /// One mutex serializes dispatch, the flush worker and shutdown over
    /// every bucket. Per-bucket locking is a possible refinement.
    buckets: Mutex<BucketTable>,
}

impl Shared {
    fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_ns.load(Ordering::Acquire))
    }

    /// Delivers every staged entry older than the current interval.
    fn flush_aged(&self) {
        let interval = self.interval();
        let now = Instant::now();
        let mut table = self.buckets.lock().unwrap();
        for bucket in table.buckets_mut() {
            while let Some(idx) = bucket.front() {
                if now.duration_since(bucket.entry(idx).created) > interval {
                    let entry = bucket.remove(idx);
                    entry.ep.handle_packet(entry.pkt);
                } else {
                    // Entries are age-ordered; everything behind the
                    // front survivor is younger still.
                    break;
                }
            }
        }
    }

    /// Delivers every staged entry regardless of age.
    fn flush_all(&self) {
        let mut table = self.buckets.lock().unwrap();
        let mut flushed = 0usize;
        for bucket in table.buckets_mut() {
            while let Some(idx) = bucket.front() {
                let entry = bucket.remove(idx);
                entry.ep.handle_packet(entry.pkt);
                flushed += 1;
            }
        }
        if flushed > 0 {
            log::debug!("delivered {flushed} staged packets on reconfiguration");
        }
    }
}

impl GroDispatcher {
    /// Creates the dispatcher and spawns its flush worker. An interval of
    /// zero starts the dispatcher disabled.
    pub fn new(interval: Duration) -> io::Result<GroDispatcher> {
        let shared = Arc::new(Shared {
            interval_ns: AtomicU64::new(duration_to_ns(interval)),
            buckets: Mutex::new(BucketTable::new()),
        });
        let (new_interval_tx, new_interval_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);

        let worker = thread::Builder::new().name("gro-flush".into()).spawn({
            let shared = shared.clone();
            move || flush_worker(shared, new_interval_rx, stop_rx)
        })?;

        Ok(GroDispatcher {
            shared,
            new_interval_tx,
            stop_tx,
            worker: Some(worker),
        })
    }

    /// Current flush interval. Zero means coalescing is disabled.
    pub fn interval(&self) -> Duration {
        self.shared.interval()
    }

    /// Reconfigures the flush interval. Setting zero disables coalescing
    /// and makes the worker deliver everything currently staged.
    pub fn set_interval(&self, interval: Duration) {
        self.shared
            .interval_ns
            .store(duration_to_ns(interval), Ordering::Release);
        let _ = self.new_interval_tx.try_send(());
    }

    /// Runs one packet through coalescing.
    ///
    /// The packet is consumed: it is forwarded to `ep` immediately, staged
    /// in a bucket, or its payload is absorbed into a staged packet of the
    /// same flow. Any packet that cannot or must not be coalesced is
    /// delivered unchanged, so anomalies cost only the optimization, never
    /// correctness. `mtu` is the link MTU; full-size segments signal an
    /// ongoing burst and are the ones worth holding back briefly.
    pub fn dispatch(
        &self,
        mut pkt: Packet,
        net_proto: NetworkProtocol,
        ep: &Arc<dyn NetworkEndpoint>,
        mtu: u32,
    ) {
        // Disabled: hand the packet straight up.
        if self.shared.interval_ns.load(Ordering::Acquire) == 0 {
            ep.handle_packet(pkt);
            return;
        }

        if net_proto != NetworkProtocol::Ipv4 {
            ep.handle_packet(pkt);
            return;
        }

        // Both headers are needed up front: hashing the packet into its
        // bucket requires addresses and ports.
        if pkt.pull_up(IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN).is_none() {
            ep.handle_packet(pkt);
            return;
        }
        let ip = Ipv4Hdr::new(&pkt.as_slice()[..IPV4_MIN_HEADER_LEN]);

        // Only atomic datagrams: fragments are the rare case and would
        // complicate matching.
        if ip.fragment_offset() != 0
            || ip.flags() & IPV4_FLAG_MORE_FRAGMENTS != 0
            || ip.flags() & IPV4_FLAG_DONT_FRAGMENT == 0
        {
            ep.handle_packet(pkt);
            return;
        }

        // Only TCP without IP options.
        if ip.header_length() != IPV4_MIN_HEADER_LEN
            || ip.protocol() != libc::IPPROTO_TCP as u8
        {
            ep.handle_packet(pkt);
            return;
        }

        let data_off =
            TcpHdr::new(&pkt.as_slice()[IPV4_MIN_HEADER_LEN..]).data_offset();
        if data_off < TCP_MIN_HEADER_LEN
            || pkt.pull_up(IPV4_MIN_HEADER_LEN + data_off).is_none()
        {
            // Malformed; let the upper stack reject it.
            ep.handle_packet(pkt);
            return;
        }

        let ip = Ipv4Hdr::new(&pkt.as_slice()[..IPV4_MIN_HEADER_LEN]);
        let tcp = TcpHdr::new(&pkt.as_slice()[IPV4_MIN_HEADER_LEN..IPV4_MIN_HEADER_LEN + data_off]);

        let total_len = ip.total_length();
        let flags = tcp.flags();
        let Some(payload_len) = total_len.checked_sub((IPV4_MIN_HEADER_LEN + data_off) as u16)
        else {
            ep.handle_packet(pkt);
            return;
        };

        // With a bad checksum the flow identity itself is suspect, so the
        // packet cannot be matched or staged. A successful validation is
        // recorded so upper layers skip the work.
        let validate = !pkt.rx_checksum_validated;
        if validate {
            if !ip.is_valid(pkt.len()) || !ip.is_checksum_valid() {
                ep.handle_packet(pkt);
                return;
            }
            let payload_sum = pkt.checksum_at_offset(IPV4_MIN_HEADER_LEN + data_off);
            if !tcp.is_checksum_valid(
                &ip.source_addr(),
                &ip.dest_addr(),
                payload_sum,
                payload_len,
            ) {
                ep.handle_packet(pkt);
                return;
            }
        }

        let ip_owned = ip.owned();
        let tcp_owned = tcp.owned();
        if validate {
            pkt.rx_checksum_validated = true;
        }

        let mut table = self.shared.buckets.lock().unwrap();
        let bucket = table.bucket_for_flow(&ip_owned, &tcp_owned);
        let (matched, flush_required) = bucket.find(&ip_owned, &tcp_owned, payload_len);

        // Apply the lookup result.
        let merged = match (matched, flush_required) {
            (Some(idx), true) => {
                // Same flow but incompatible headers: the staged peer goes
                // up first so per-flow ordering holds.
                let entry = bucket.remove(idx);
                entry.ep.handle_packet(entry.pkt);
                None
            }
            (Some(idx), false) => {
                bucket.entry_mut(idx).merge_segment(&pkt, data_off, payload_len);
                Some(idx)
            }
            (None, _) => None,
        };

        // Flush decision for the incoming segment, judged on the raw
        // candidate. A non-MTU-sized segment is likely the end of a
        // message; senders keep emitting full segments while they have
        // data. URG/PSH/RST/SYN/FIN carry semantics the upper layers must
        // see promptly. MTU stands in for the connection's MSS here, which
        // can misclassify locally generated GSO packets.
        let flush = total_len as u32 != mtu
            || flags & (TCP_FLAG_URG | TCP_FLAG_PSH | TCP_FLAG_RST | TCP_FLAG_SYN | TCP_FLAG_FIN)
                != 0;

        match (merged, flush) {
            (Some(idx), true) => {
                // The merge result itself must go up now.
                drop(pkt);
                let entry = bucket.remove(idx);
                entry.ep.handle_packet(entry.pkt);
            }
            (Some(_), false) => {
                // Payload absorbed into the staged entry.
                drop(pkt);
            }
            (None, true) => {
                ep.handle_packet(pkt);
            }
            (None, false) => {
                if bucket.full() {
                    // Head is always the oldest packet.
                    let oldest = bucket.remove_oldest();
                    oldest.ep.handle_packet(oldest.pkt);
                }
                bucket.insert(pkt, ip_owned, tcp_owned, ep.clone());
            }
        }
    }

    /// Stops the flush worker and drops all staged packets without
    /// delivering them. Idempotent; also runs on drop. Arrivals must be
    /// quiesced before calling this.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.stop_tx.send(());
        let _ = worker.join();

        let mut table = self.shared.buckets.lock().unwrap();
        let mut dropped = 0usize;
        for bucket in table.buckets_mut() {
            while let Some(idx) = bucket.front() {
                drop(bucket.remove(idx));
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::debug!("dropped {dropped} staged packets on shutdown");
        }
    }

    /// Diagnostic snapshot of the staged state, see also the `Display`
    /// implementation.
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GroDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.shared.buckets.lock().unwrap();
        writeln!(f, "GRO state:")?;
        for (i, bucket) in table.buckets().iter().enumerate() {
            write!(f, "bucket {i}: {} packets:", bucket.len())?;
            let mut cursor = bucket.front();
            while let Some(idx) = cursor {
                let entry = bucket.entry(idx);
                write!(
                    f,
                    " age={:?} size={}B,",
                    entry.created.elapsed(),
                    entry.pkt.len()
                )?;
                cursor = bucket.next_after(idx);
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl Drop for GroDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background flush loop: a ticker paced at the configured interval, a
/// reconfiguration wakeup, and a stop signal.
fn flush_worker(shared: Arc<Shared>, new_interval: Receiver<()>, stop: Receiver<()>) {
    let mut ticks = ticker(shared.interval());
    loop {
        let mut rearm = None;
        select! {
            recv(new_interval) -> _ => {
                let interval = shared.interval();
                log::debug!("flush interval now {interval:?}");
                if interval.is_zero() {
                    // Disabled: surface whatever is staged, then idle
                    // until the next reconfiguration.
                    shared.flush_all();
                }
                rearm = Some(ticker(interval));
            }
            recv(ticks) -> _ => shared.flush_aged(),
            recv(stop) -> _ => return,
        }
        if let Some(new_ticks) = rearm {
            ticks = new_ticks;
        }
    }
}

fn ticker(interval: Duration) -> Receiver<Instant> {
    if interval.is_zero() {
        never()
    } else {
        tick(interval)
    }
}

fn duration_to_ns(interval: Duration) -> u64 {
    u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX)
}
