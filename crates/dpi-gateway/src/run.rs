//! Ingress loop (§5 "single-threaded cooperative event loop"): drive the
//! UDP socket listener, parse each frame, run it through the accumulator
//! store and dispatcher, and report the verdict back to the datapath.

use crate::world::DpiWorld;
use dpi_common::header::NetHeader;
use dpi_dataplane::Verdict;
use dpi_ingress::socket::SocketListener;
use dpi_ingress::IngressVerdict;
use tracing::{debug, warn};

/// Map an aggregated dispatch [`Verdict`] to the ingress-facing
/// [`IngressVerdict`] (§4.4 step 8, §6 "Conntrack mark values").
fn to_ingress_verdict(verdict: Verdict, flow_marker: u32) -> IngressVerdict {
    match verdict {
        Verdict::Drop => IngressVerdict::Drop,
        Verdict::Inspect => IngressVerdict::Inspect,
        Verdict::Passthru if flow_marker != 0 => IngressVerdict::Marked(flow_marker),
        Verdict::Passthru => IngressVerdict::Accept,
    }
}

/// Run the UDP-framed ingress loop until the socket errors fatally or the
/// process is signaled to stop. Per-packet parse/dispatch errors are
/// logged and the packet is dropped from DPI (fail-open), per §7.
pub fn run_socket_loop(world: &DpiWorld, listener: &mut SocketListener) -> std::io::Result<()> {
    loop {
        let (framed, mut frame, peer) = match listener.recv() {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "ingress recv failed");
                continue;
            }
        };

        let smac = framed.client_mac;
        let dmac = world.config.gateway_mac;
        let frame_len = frame.len as u64;

        let mut header = match NetHeader::parse(frame.as_mut_slice(), dpi_common::header::IngressSource::Socket) {
            Ok(Some(header)) => header,
            Ok(None) => {
                // Fragment: skip DPI entirely, fail-open (§4.1).
                world.dispatch_stats.record_fragment_bypass();
                let _ = listener.send_verdict(peer, framed.packet_id, IngressVerdict::Accept.mark());
                continue;
            }
            Err(err) => {
                debug!(%err, "header parse failed, fail-open");
                let _ = listener.send_verdict(peer, framed.packet_id, IngressVerdict::Accept.mark());
                continue;
            }
        };

        let Some(flow_key) = header.flow_key else {
            let _ = listener.send_verdict(peer, framed.packet_id, IngressVerdict::Accept.mark());
            continue;
        };

        let acc = match world.store.lookup(&flow_key) {
            Some(acc) => acc,
            None => {
                world.dispatch_stats.record_flow_created();
                world.store.insert(flow_key)
            }
        };

        world.dispatch_stats.record_packet();
        let payload_len = header.payload_len() as u64;
        let dir_idx = world.store.with(acc, |a| if a.key == flow_key { 0usize } else { 1usize }).unwrap_or(0);
        world.store.with_mut(acc, |a| a.touch(dir_idx, frame_len, payload_len));

        // §4.4 step 1: a UDP datagram with no payload carries nothing for
        // any attribute plugin to inspect, so it bypasses DPI entirely
        // (counters above are still updated, but no plugin runs).
        let verdict = if header.ip_protocol == 17 && payload_len == 0 {
            Verdict::Passthru
        } else {
            let started = std::time::Instant::now();
            let v = world.dispatcher.dispatch(&mut header, acc, &world.store, smac, dmac);
            world.dispatch_latency.record(started.elapsed().as_micros() as u64);
            v
        };
        world.dispatch_stats.record_verdict(verdict);

        let flow_marker = world.store.with(acc, |a| a.flow_marker).unwrap_or(0);
        let mark = to_ingress_verdict(verdict, flow_marker).mark();

        if let Err(err) = listener.send_verdict(peer, framed.packet_id, mark) {
            warn!(%err, "failed to send verdict reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthru_with_no_marker_is_accept() {
        assert_eq!(to_ingress_verdict(Verdict::Passthru, 0), IngressVerdict::Accept);
    }

    #[test]
    fn passthru_with_marker_is_marked() {
        assert_eq!(to_ingress_verdict(Verdict::Passthru, 7), IngressVerdict::Marked(7));
    }

    #[test]
    fn drop_maps_to_drop() {
        assert_eq!(to_ingress_verdict(Verdict::Drop, 0), IngressVerdict::Drop);
    }
}
