/*!
# softgro: software generic receive offload

A software-side packet coalescer that sits between a link-layer receive
path and the upper network stack. Consecutive in-order TCP/IPv4 segments of
a flow are merged into one larger pseudo-packet before delivery, amortizing
per-packet overheads (header parsing, protocol state transitions, scheduler
entries) across many segments.

## How it works

Arrivals enter through [`GroDispatcher::dispatch`]. A segment that passes
the wire-level compatibility checks is either appended to an in-progress
packet of its flow or staged as the start of a new one; everything else is
delivered unchanged. Staged packets are held in a small fixed-size bucket
table and surface when:

- a later segment of the flow is incompatible (header differences must not
  be papered over),
- the arriving segment is short or carries URG/PSH/RST/SYN/FIN (end of a
  message, or semantics the upper layers must observe promptly),
- a bucket overflows (the oldest entry is delivered to make room),
- the background flush timer finds them older than the configured
  interval.

## Usage

```no_run
use std::sync::Arc;
use std::time::Duration;
use softgro::{GroDispatcher, NetworkEndpoint, NetworkProtocol, Packet};

struct Upper;

impl NetworkEndpoint for Upper {
    fn handle_packet(&self, pkt: Packet) {
        println!("delivered {} bytes", pkt.len());
    }
}

let gro = GroDispatcher::new(Duration::from_millis(10))?;
let upper: Arc<dyn NetworkEndpoint> = Arc::new(Upper);

// On every link-layer arrival:
let pkt = Packet::from_slice(&[/* full IPv4 datagram */]);
gro.dispatch(pkt, NetworkProtocol::Ipv4, &upper, 1500);
# Ok::<(), std::io::Error>(())
```

Setting the interval to zero (at construction or via
[`GroDispatcher::set_interval`]) disables coalescing; dispatch then
delivers every packet synchronously and unchanged.

## Guarantees

- **Per-flow FIFO**: for any 4-tuple, payload bytes are delivered upward
  in exactly the order they arrived.
- **Bounded staging**: at most [`GRO_BUCKET_SIZE`] entries per bucket
  across [`GRO_BUCKET_COUNT`] buckets, and no coalesced packet grows past
  [`GRO_MAX_PACKET_SIZE`].
- **Checksums checked once**: packets not already validated by the link
  layer are verified (IPv4 header and TCP, pseudo-header included) before
  they can be matched to a flow, and marked so upper layers skip the work.
- **Clean shutdown**: [`GroDispatcher::close`] stops the flush worker and
  drops staged packets without delivering them; callers quiesce arrivals
  first.

Out of scope: IPv6 coalescing, IP fragments, non-TCP transports, and
packets carrying IP options. All of these are passed through untouched.
*/

mod bucket;
mod checksum;
mod dispatcher;
mod flow;
mod headers;
mod packet;

pub use bucket::{GRO_BUCKET_COUNT, GRO_BUCKET_SIZE, GRO_MAX_PACKET_SIZE};
pub use dispatcher::{GroDispatcher, NetworkEndpoint, NetworkProtocol};
pub use packet::Packet;
