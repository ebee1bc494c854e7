use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::TcpPacket;

use softgro::{GroDispatcher, NetworkEndpoint, NetworkProtocol, Packet};

const MTU: u32 = 1500;
const MSS: usize = 1460;
const HDR: usize = 40; // IPv4 min header + TCP min header

const TCP_FIN: u8 = 0x01;
const TCP_PSH: u8 = 0x08;
const TCP_ACK: u8 = 0x10;

/// Endpoint that records every delivered datagram together with its
/// RX-checksum-validated mark.
#[derive(Default)]
struct Collector {
    delivered: Mutex<Vec<(Vec<u8>, bool)>>,
}

impl Collector {
    fn packets(&self) -> Vec<Vec<u8>> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(bytes, _)| bytes.clone())
            .collect()
    }

    fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    /// Polls until `count` deliveries arrived or two seconds passed.
    fn wait_for(&self, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.count() < count {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

impl NetworkEndpoint for Collector {
    fn handle_packet(&self, pkt: Packet) {
        self.delivered
            .lock()
            .unwrap()
            .push((pkt.as_slice().to_vec(), pkt.rx_checksum_validated));
    }
}

struct Flow {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    ack: u32,
}

impl Flow {
    fn new(sport: u16) -> Flow {
        Flow {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            sport,
            dport: 443,
            ack: 555,
        }
    }

    /// Builds a full TCP/IPv4 segment with valid checksums; the payload is
    /// a pattern derived from the sequence number so delivered bytes can
    /// be matched against what entered.
    fn segment(&self, seq: u32, payload_len: usize, flags: u8) -> Packet {
        let total_len = HDR + payload_len;
        let mut bytes = vec![0u8; total_len];

        bytes[0] = 0x45; // version 4, 20-byte header
        bytes[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        bytes[6] = 0x40; // DF, fragment offset 0
        bytes[8] = 64; // TTL
        bytes[9] = 6; // TCP
        bytes[12..16].copy_from_slice(&self.src.octets());
        bytes[16..20].copy_from_slice(&self.dst.octets());

        bytes[20..22].copy_from_slice(&self.sport.to_be_bytes());
        bytes[22..24].copy_from_slice(&self.dport.to_be_bytes());
        bytes[24..28].copy_from_slice(&seq.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.ack.to_be_bytes());
        bytes[32] = 5 << 4; // 20-byte TCP header
        bytes[33] = flags;

        for (i, byte) in bytes[HDR..].iter_mut().enumerate() {
            *byte = (seq as usize + i) as u8;
        }

        let ip_csum = pnet_packet::ipv4::checksum(&Ipv4Packet::new(&bytes[..20]).unwrap());
        bytes[10..12].copy_from_slice(&ip_csum.to_be_bytes());
        let tcp_csum = pnet_packet::tcp::ipv4_checksum(
            &TcpPacket::new(&bytes[20..]).unwrap(),
            &self.src,
            &self.dst,
        );
        bytes[36..38].copy_from_slice(&tcp_csum.to_be_bytes());

        Packet::from_slice(&bytes)
    }
}

fn setup(interval: Duration) -> (GroDispatcher, Arc<Collector>, Arc<dyn NetworkEndpoint>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let gro = GroDispatcher::new(interval).unwrap();
    let collector = Arc::new(Collector::default());
    let ep: Arc<dyn NetworkEndpoint> = collector.clone();
    (gro, collector, ep)
}

#[test]
fn two_inorder_mss_segments_merge_and_surface_on_timer() {
    let (gro, collector, ep) = setup(Duration::from_millis(50));
    let flow = Flow::new(40001);

    let seg1 = flow.segment(1000, MSS, TCP_ACK);
    let seg2 = flow.segment(1000 + MSS as u32, MSS, TCP_ACK);
    let expected_payload: Vec<u8> = seg1.as_slice()[HDR..]
        .iter()
        .chain(&seg2.as_slice()[HDR..])
        .copied()
        .collect();

    gro.dispatch(seg1, NetworkProtocol::Ipv4, &ep, MTU);
    gro.dispatch(seg2, NetworkProtocol::Ipv4, &ep, MTU);

    assert!(collector.wait_for(1), "timer flush never arrived");
    let got = collector.packets();
    assert_eq!(got.len(), 1);

    let merged = &got[0];
    assert_eq!(merged.len(), HDR + 2 * MSS);
    let ip = Ipv4Packet::new(merged).unwrap();
    assert_eq!(ip.get_total_length() as usize, HDR + 2 * MSS);
    let tcp = TcpPacket::new(&merged[20..]).unwrap();
    assert_eq!(tcp.get_sequence(), 1000);
    assert_eq!(merged[33], TCP_ACK);
    assert_eq!(&merged[HDR..], &expected_payload[..]);

    // The dispatcher validated the checksums once; upper layers are told
    // not to repeat the work.
    assert!(collector.delivered.lock().unwrap()[0].1);
}

#[test]
fn short_psh_trailer_flushes_the_coalesced_chain() {
    // Interval far beyond the test runtime: the flush below must be
    // driven by the trailer, not the timer.
    let (gro, collector, ep) = setup(Duration::from_secs(3600));
    let flow = Flow::new(40002);

    let seg1 = flow.segment(1000, MSS, TCP_ACK);
    let seg2 = flow.segment(1000 + MSS as u32, MSS, TCP_ACK);
    let trailer = flow.segment(1000 + 2 * MSS as u32, 500, TCP_ACK | TCP_PSH);
    let expected_payload: Vec<u8> = seg1.as_slice()[HDR..]
        .iter()
        .chain(&seg2.as_slice()[HDR..])
        .chain(&trailer.as_slice()[HDR..])
        .copied()
        .collect();

    gro.dispatch(seg1, NetworkProtocol::Ipv4, &ep, MTU);
    gro.dispatch(seg2, NetworkProtocol::Ipv4, &ep, MTU);
    assert_eq!(collector.count(), 0);

    // Sequence-adjacent, so the trailer joins the chain; being short and
    // PSH it forces the whole chain up synchronously.
    gro.dispatch(trailer, NetworkProtocol::Ipv4, &ep, MTU);

    let got = collector.packets();
    assert_eq!(got.len(), 1);
    let merged = &got[0];
    assert_eq!(merged.len(), HDR + 2 * MSS + 500);
    let ip = Ipv4Packet::new(merged).unwrap();
    assert_eq!(ip.get_total_length() as usize, HDR + 2 * MSS + 500);
    assert_eq!(merged[33], TCP_ACK | TCP_PSH);
    assert_eq!(&merged[HDR..], &expected_payload[..]);
}

#[test]
fn differing_ack_numbers_break_the_merge() {
    let (gro, collector, ep) = setup(Duration::from_secs(3600));
    let mut flow = Flow::new(40003);

    let seg1 = flow.segment(1000, MSS, TCP_ACK);
    let first = seg1.as_slice().to_vec();
    gro.dispatch(seg1, NetworkProtocol::Ipv4, &ep, MTU);
    assert_eq!(collector.count(), 0);

    // Same flow, in-sequence, but the peer ACKed something new.
    flow.ack = 9999;
    let seg2 = flow.segment(1000 + MSS as u32, MSS, TCP_ACK);
    gro.dispatch(seg2, NetworkProtocol::Ipv4, &ep, MTU);

    // The staged packet went up alone; the new arrival is itself
    // staged-eligible and stays behind.
    let got = collector.packets();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], first);
}

#[test]
fn bucket_overflow_evicts_the_oldest_flow() {
    let (gro, collector, ep) = setup(Duration::from_secs(3600));

    // Source ports eight apart keep the byte-sum hash congruent, so all
    // nine flows land in one bucket.
    for i in 0..9u16 {
        let flow = Flow::new(41000 + 8 * i);
        gro.dispatch(
            flow.segment(1000, MSS, TCP_ACK),
            NetworkProtocol::Ipv4,
            &ep,
            MTU,
        );
    }

    let got = collector.packets();
    assert_eq!(got.len(), 1, "exactly the evicted entry is delivered");
    let tcp = TcpPacket::new(&got[0][20..]).unwrap();
    assert_eq!(tcp.get_source(), 41000, "oldest flow is evicted first");
}

#[test]
fn disabling_flushes_staged_then_passes_through() {
    let (gro, collector, ep) = setup(Duration::from_secs(3600));
    let flow = Flow::new(40004);

    gro.dispatch(flow.segment(1000, MSS, TCP_ACK), NetworkProtocol::Ipv4, &ep, MTU);
    assert_eq!(collector.count(), 0);

    gro.set_interval(Duration::ZERO);
    assert!(collector.wait_for(1), "flush on disable never arrived");

    // With coalescing off, even a staged-eligible segment goes straight
    // up, byte-identical.
    let seg = flow.segment(1000 + MSS as u32, MSS, TCP_ACK);
    let bytes = seg.as_slice().to_vec();
    gro.dispatch(seg, NetworkProtocol::Ipv4, &ep, MTU);
    let got = collector.packets();
    assert_eq!(got.len(), 2);
    assert_eq!(got[1], bytes);
}

#[test]
fn close_releases_staged_packets_without_delivery() {
    let (mut gro, collector, ep) = setup(Duration::from_secs(3600));

    for sport in [42000u16, 42001, 42002] {
        let flow = Flow::new(sport);
        gro.dispatch(flow.segment(1, MSS, TCP_ACK), NetworkProtocol::Ipv4, &ep, MTU);
    }
    assert_eq!(collector.count(), 0);

    gro.close();
    assert_eq!(collector.count(), 0, "shutdown must not deliver upward");
}

#[test]
fn per_flow_payload_bytes_stay_fifo() {
    let (gro, collector, ep) = setup(Duration::from_secs(3600));
    let mut flow = Flow::new(40005);

    let mut seq = 1000u32;
    let mut entered: Vec<u8> = Vec::new();
    let mut push = |gro: &GroDispatcher, flow: &Flow, seq: &mut u32, len: usize, flags: u8| {
        let seg = flow.segment(*seq, len, flags);
        entered.extend_from_slice(&seg.as_slice()[HDR..]);
        *seq += len as u32;
        gro.dispatch(seg, NetworkProtocol::Ipv4, &ep, MTU);
    };

    push(&gro, &flow, &mut seq, MSS, TCP_ACK);
    push(&gro, &flow, &mut seq, MSS, TCP_ACK);
    push(&gro, &flow, &mut seq, 300, TCP_ACK | TCP_PSH); // flushes the chain
    flow.ack = 1234; // ACK change breaks the next merge
    push(&gro, &flow, &mut seq, MSS, TCP_ACK);
    push(&gro, &flow, &mut seq, MSS, TCP_ACK);
    push(&gro, &flow, &mut seq, 80, TCP_ACK | TCP_FIN); // flushes again

    let delivered: Vec<u8> = collector
        .packets()
        .iter()
        .flat_map(|pkt| pkt[HDR..].to_vec())
        .collect();
    assert_eq!(delivered, entered);
}

#[test]
fn bad_checksum_is_passed_through_unvalidated() {
    let (gro, collector, ep) = setup(Duration::from_secs(3600));
    let flow = Flow::new(40006);

    let mut seg = flow.segment(1000, MSS, TCP_ACK);
    let mut bytes = seg.as_slice().to_vec();
    bytes[HDR + 7] ^= 0xFF; // corrupt one payload byte
    seg = Packet::from_slice(&bytes);

    gro.dispatch(seg, NetworkProtocol::Ipv4, &ep, MTU);

    // Corrupt packets cannot be tied to a flow, so the segment is handed
    // up unchanged and unvalidated despite being staged-eligible.
    let delivered = collector.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, bytes);
    assert!(!delivered[0].1);
}

#[test]
fn non_atomic_datagrams_are_not_coalesced() {
    let (gro, collector, ep) = setup(Duration::from_secs(3600));
    let flow = Flow::new(40007);

    // DF clear: a fragmentable datagram must bypass coalescing even
    // though everything else qualifies.
    let seg = flow.segment(1000, MSS, TCP_ACK);
    let mut bytes = seg.as_slice().to_vec();
    bytes[6] = 0; // clear DF
    let ip_csum = pnet_packet::ipv4::checksum(&Ipv4Packet::new(&bytes[..20]).unwrap());
    bytes[10..12].copy_from_slice(&ip_csum.to_be_bytes());

    gro.dispatch(
        Packet::from_slice(&bytes),
        NetworkProtocol::Ipv4,
        &ep,
        MTU,
    );
    let got = collector.packets();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], bytes);
}
