//! Ingress adapters (C2, §6): turn raw datagrams from a custom-framed UDP
//! socket or a netfilter queue into an owned, padded packet buffer a
//! [`dpi_common::header::NetHeader`] can be parsed over, and carry the
//! final verdict back out as a conntrack mark (or datagram reinjection).
//!
//! Grounded on the socket/queue split in
//! `dpi_common::header::IngressSource`; the netfilter-queue framing
//! (`rx_vidx/tx_vidx/rx_pidx/tx_pidx`, synthetic Ethernet prepend) follows
//! `SPIN-UMass-censorlab`'s nfq listener mode, which is where this tree's
//! `nfq` dependency choice comes from (see DESIGN.md).

pub mod queue;
pub mod socket;

use dpi_common::header::IngressSource;

/// `CT_MARK_*` values set back into the kernel once a verdict is reached (§6).
pub const CT_MARK_ACCEPT: u32 = 1;
pub const CT_MARK_DROP: u32 = 2;
pub const CT_MARK_INSPECT: u32 = 3;

/// Ethernet header length, used when prepending a synthetic frame for
/// queue-sourced packets (§6).
pub const ETH_HLEN: usize = 14;

/// One ingested frame: an owned buffer with slack at the tail so an
/// attribute plugin can append bytes (DHCP option-82) without the
/// dispatcher needing to reallocate mid-packet, plus where it came from.
pub struct IngressFrame {
    pub buf: Vec<u8>,
    /// Length of the actual frame within `buf`; bytes past this are
    /// zeroed slack a plugin may grow into before handing back to the
    /// adapter for reinjection.
    pub len: usize,
    pub source: IngressSource,
}

/// Extra tail capacity reserved for in-place datagram growth (DHCP relay
/// option append, §4.6) — generous enough for a handful of option-82 TLVs.
pub const GROWTH_SLACK: usize = 64;

impl IngressFrame {
    pub fn new(frame: &[u8], source: IngressSource) -> Self {
        let mut buf = vec![0u8; frame.len() + GROWTH_SLACK];
        buf[..frame.len()].copy_from_slice(frame);
        Self { buf, len: frame.len(), source }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

/// Verdict handed back to the adapter once dispatch for one packet
/// completes (§6 "Conntrack mark values").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressVerdict {
    Accept,
    Drop,
    Inspect,
    /// A plugin-supplied marker (`action = passthru ∧ flow_marker ≠ 0`, §6).
    Marked(u32),
}

impl IngressVerdict {
    pub fn mark(self) -> u32 {
        match self {
            IngressVerdict::Accept => CT_MARK_ACCEPT,
            IngressVerdict::Drop => CT_MARK_DROP,
            IngressVerdict::Inspect => CT_MARK_INSPECT,
            IngressVerdict::Marked(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reserves_growth_slack() {
        let frame = IngressFrame::new(&[1, 2, 3], IngressSource::Socket);
        assert_eq!(frame.buf.len(), 3 + GROWTH_SLACK);
        assert_eq!(frame.len, 3);
    }

    #[test]
    fn verdict_mark_matches_ct_constants() {
        assert_eq!(IngressVerdict::Accept.mark(), CT_MARK_ACCEPT);
        assert_eq!(IngressVerdict::Drop.mark(), CT_MARK_DROP);
        assert_eq!(IngressVerdict::Marked(42).mark(), 42);
    }
}
