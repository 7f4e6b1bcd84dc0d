//! UDP socket listener (§6 "Ingress framing — UDP listener").
//!
//! Datagrams arrive L2-stripped, framed as:
//!
//! ```text
//! offset  size  field
//! 0       6     client MAC address (network order)
//! 6       2     hw_protocol (ethertype, network order)
//! 8       4     packet_id (network order)
//! 12      N     raw L2-stripped IP payload (starts at IP header)
//! ```
//!
//! [`NetHeader::parse`](dpi_common::header::NetHeader::parse) expects a
//! full Ethernet frame, so this adapter synthesizes a 14-byte Ethernet
//! header (src = the framed client MAC, dst = the configured gateway MAC,
//! ethertype = `hw_protocol`) ahead of the payload before handing the
//! buffer to [`crate::IngressFrame`].

use crate::{IngressFrame, ETH_HLEN};
use dpi_common::header::IngressSource;
use std::net::{SocketAddr, UdpSocket};
use thiserror::Error;

const FRAME_HEADER_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SocketIngressError {
    #[error("datagram too short for the framing header: {0} bytes")]
    Truncated(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded framed datagram, before Ethernet synthesis.
#[derive(Debug, Clone, Copy)]
pub struct FramedHeader {
    pub client_mac: [u8; 6],
    pub hw_protocol: u16,
    pub packet_id: u32,
}

fn decode_frame(datagram: &[u8]) -> Result<(FramedHeader, &[u8]), SocketIngressError> {
    if datagram.len() < FRAME_HEADER_LEN {
        return Err(SocketIngressError::Truncated(datagram.len()));
    }
    let client_mac: [u8; 6] = datagram[0..6].try_into().unwrap();
    let hw_protocol = u16::from_be_bytes([datagram[6], datagram[7]]);
    let packet_id = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
    Ok((FramedHeader { client_mac, hw_protocol, packet_id }, &datagram[FRAME_HEADER_LEN..]))
}

/// Build the full Ethernet-framed buffer a `NetHeader` can parse, from one
/// decoded datagram.
pub fn build_ingress_frame(datagram: &[u8], gateway_mac: [u8; 6]) -> Result<(FramedHeader, IngressFrame), SocketIngressError> {
    let (header, payload) = decode_frame(datagram)?;
    let mut eth_frame = vec![0u8; ETH_HLEN + payload.len()];
    eth_frame[0..6].copy_from_slice(&gateway_mac);
    eth_frame[6..12].copy_from_slice(&header.client_mac);
    eth_frame[12..14].copy_from_slice(&header.hw_protocol.to_be_bytes());
    eth_frame[ETH_HLEN..].copy_from_slice(payload);
    Ok((header, IngressFrame::new(&eth_frame, IngressSource::Socket)))
}

/// Blocking UDP listener (§6). One `recv` per call; the caller drives the
/// read loop (the single-threaded cooperative event loop, §5).
pub struct SocketListener {
    socket: UdpSocket,
    gateway_mac: [u8; 6],
    buf: Vec<u8>,
}

impl SocketListener {
    pub fn bind(addr: SocketAddr, gateway_mac: [u8; 6]) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self { socket, gateway_mac, buf: vec![0u8; 65535] })
    }

    /// Receive one datagram and decode it into an ingest-ready frame, along
    /// with the peer address the verdict reply must go back to.
    /// Per §7 ("ingress errors are logged and dropped"), callers should
    /// treat an `Err` as non-fatal and keep looping.
    pub fn recv(&mut self) -> Result<(FramedHeader, IngressFrame, SocketAddr), SocketIngressError> {
        let (n, peer) = self.socket.recv_from(&mut self.buf)?;
        let (header, frame) = build_ingress_frame(&self.buf[..n], self.gateway_mac)?;
        Ok((header, frame, peer))
    }

    /// Tell the datapath the verdict for `packet_id` (§6: "C2 enacts it —
    /// mark-set or packet rewrite"). Reply framing mirrors the request:
    /// `packet_id(4) | mark(4)`, network order.
    pub fn send_verdict(&self, peer: SocketAddr, packet_id: u32, mark: u32) -> std::io::Result<()> {
        let mut reply = [0u8; 8];
        reply[0..4].copy_from_slice(&packet_id.to_be_bytes());
        reply[4..8].copy_from_slice(&mark.to_be_bytes());
        self.socket.send_to(&reply, peer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_datagram() -> Vec<u8> {
        let mut d = Vec::new();
        d.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]); // client mac
        d.extend_from_slice(&0x0800u16.to_be_bytes()); // ipv4
        d.extend_from_slice(&42u32.to_be_bytes()); // packet id
        d.extend_from_slice(&[0x45, 0, 0, 20]); // fake IP header start
        d
    }

    #[test]
    fn decodes_framing_header() {
        let datagram = sample_datagram();
        let (header, payload) = decode_frame(&datagram).unwrap();
        assert_eq!(header.client_mac, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(header.hw_protocol, 0x0800);
        assert_eq!(header.packet_id, 42);
        assert_eq!(payload, &[0x45, 0, 0, 20]);
    }

    #[test]
    fn synthesizes_ethernet_header() {
        let datagram = sample_datagram();
        let (header, frame) = build_ingress_frame(&datagram, [1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(header.packet_id, 42);
        assert_eq!(&frame.buf[0..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&frame.buf[6..12], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(&frame.buf[12..14], &0x0800u16.to_be_bytes());
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        assert!(matches!(decode_frame(&[1, 2, 3]), Err(SocketIngressError::Truncated(3))));
    }
}
