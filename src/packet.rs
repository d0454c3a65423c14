//! Raw IP header parsing.
//!
//! Every frame crossing the engine is a complete layer-3 packet; the
//! forwarding decisions only need the version and the address pair, so this
//! module decodes exactly that from the fixed header offsets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Minimum length of an IPv4 header.
const IPV4_HEADER_LEN: usize = 20;
/// Fixed length of an IPv6 base header.
const IPV6_HEADER_LEN: usize = 40;

/// Source/destination addresses extracted from a raw IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// True for IPv6 frames.
    pub is_ipv6: bool,
    /// Source address.
    pub src: IpAddr,
    /// Destination address.
    pub dst: IpAddr,
}

/// Parse the addresses out of a raw IP frame.
///
/// Returns `None` for frames shorter than the fixed header of their version
/// and for unknown version nibbles; callers treat such frames as
/// undeliverable and drop them.
pub fn parse_header(frame: &[u8]) -> Option<PacketHeader> {
    if frame.is_empty() {
        return None;
    }

    match frame[0] >> 4 {
        4 => {
            if frame.len() < IPV4_HEADER_LEN {
                return None;
            }
            let src = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
            let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
            Some(PacketHeader {
                is_ipv6: false,
                src: IpAddr::V4(src),
                dst: IpAddr::V4(dst),
            })
        }
        6 => {
            if frame.len() < IPV6_HEADER_LEN {
                return None;
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&frame[8..24]);
            dst.copy_from_slice(&frame[24..40]);
            Some(PacketHeader {
                is_ipv6: true,
                src: IpAddr::V6(Ipv6Addr::from(src)),
                dst: IpAddr::V6(Ipv6Addr::from(dst)),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> [u8; 20] {
        let mut packet = [0u8; 20];
        packet[0] = 0x45; // version 4, IHL 5
        packet[12..16].copy_from_slice(&src);
        packet[16..20].copy_from_slice(&dst);
        packet
    }

    #[test]
    fn test_parse_ipv4() {
        let packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 3]);
        let header = parse_header(&packet).unwrap();
        assert!(!header.is_ipv6);
        assert_eq!(header.src, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(header.dst, "10.0.0.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_ipv6() {
        let mut packet = [0u8; 40];
        packet[0] = 0x60;
        packet[23] = 1; // src ::1
        packet[39] = 2; // dst ::2
        let header = parse_header(&packet).unwrap();
        assert!(header.is_ipv6);
        assert_eq!(header.src, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(header.dst, "::2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_short_frames_rejected() {
        assert_eq!(parse_header(&[]), None);
        assert_eq!(parse_header(&[0x45; 10]), None);
        // IPv6 needs the full 40-byte base header.
        let mut packet = [0u8; 39];
        packet[0] = 0x60;
        assert_eq!(parse_header(&packet), None);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut packet = [0u8; 40];
        packet[0] = 0x50; // version 5
        assert_eq!(parse_header(&packet), None);
    }
}
