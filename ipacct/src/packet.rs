//! Header fields handed to the packet-path callback.

use std::net::Ipv4Addr;

use smoltcp::wire::Ipv4Packet;

/// Immutable fields the accounting path reads from one IPv4 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// IPv4 total length (header plus payload) in bytes.
    pub total_len: u16,
}

impl PacketInfo {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, total_len: u16) -> Self {
        PacketInfo {
            src,
            dst,
            total_len,
        }
    }

    /// Read the fields from a raw IPv4 packet (starting at the IP header).
    pub fn parse(bytes: &[u8]) -> smoltcp::wire::Result<Self> {
        let packet = Ipv4Packet::new_checked(bytes)?;
        Ok(PacketInfo {
            src: Ipv4Addr::from(packet.src_addr()),
            dst: Ipv4Addr::from(packet.dst_addr()),
            total_len: packet.total_len(),
        })
    }
}

/// What the filtering pipeline should do with the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep processing; accounting never drops or alters packets.
    Continue,
}
