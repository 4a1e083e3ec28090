//! Shared helpers for ipacct integration tests

#![allow(dead_code)]

use std::net::Ipv4Addr;

use ipacct::{AccountConfig, PacketInfo, Realm, RealmId};
use smoltcp::wire::{IpProtocol, Ipv4Packet};

/// Create a realm with logging enabled.
pub fn realm(config: AccountConfig) -> Realm {
    let _ = tracing_subscriber::fmt::try_init();
    Realm::new(RealmId(1), config).expect("Failed to create realm")
}

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().expect("Invalid IPv4 address")
}

/// Header fields of a packet from `src` to `dst` of `len` bytes.
pub fn packet(src: &str, dst: &str, len: u16) -> PacketInfo {
    PacketInfo::new(ip(src), ip(dst), len)
}

/// Build a raw IPv4/UDP packet of `total_len` bytes.
pub fn raw_ipv4(src: &str, dst: &str, total_len: u16) -> Vec<u8> {
    let mut buffer = vec![0u8; total_len as usize];
    let mut packet = Ipv4Packet::new_unchecked(&mut buffer[..]);
    packet.set_version(4);
    packet.set_header_len(20);
    packet.set_total_len(total_len);
    packet.set_hop_limit(64);
    packet.set_next_header(IpProtocol::Udp);
    packet.set_src_addr(ip(src));
    packet.set_dst_addr(ip(dst));
    packet.fill_checksum();
    buffer
}
