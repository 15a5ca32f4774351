//! IP prefix helpers and raw-header parsing.
//!
//! Prefix arithmetic builds on [`ipnet`]; the raw parsing here is the minimum
//! the server demultiplexer needs to route an egress packet: version sniffing
//! and the destination address field.

use crate::error::{Error, Result};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Byte range of the destination address in an IPv4 header.
const IPV4_DST: std::ops::Range<usize> = 16..20;
/// Byte range of the destination address in an IPv6 header.
const IPV6_DST: std::ops::Range<usize> = 24..40;

/// Last address covered by the prefix (the broadcast address for IPv4
/// networks).
pub fn last_address(net: &IpNet) -> IpAddr {
    net.broadcast()
}

/// The address immediately after `addr`, incrementing with carry across
/// bytes. Wraps around at the top of the address space.
pub fn next_address(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            for b in octets.iter_mut().rev() {
                let (n, carry) = b.overflowing_add(1);
                *b = n;
                if !carry {
                    break;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            for b in octets.iter_mut().rev() {
                let (n, carry) = b.overflowing_add(1);
                *b = n;
                if !carry {
                    break;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

/// A host prefix for `addr`: /32 for IPv4, /128 for IPv6.
pub fn host_prefix(addr: IpAddr) -> IpNet {
    let len = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    // Prefix length equals the address width, so this cannot fail.
    #[allow(clippy::unwrap_used)]
    IpNet::new(addr, len).unwrap()
}

/// Extract the destination address from a raw IP packet.
///
/// Rejects frames shorter than the fixed header and frames whose version
/// nibble is neither 4 nor 6.
pub fn destination(packet: &[u8]) -> Result<IpAddr> {
    let version = packet.first().map(|b| b >> 4);
    match version {
        Some(4) => {
            if packet.len() < IPV4_DST.end {
                return Err(Error::protocol("short ipv4 frame"));
            }
            let mut dst = [0u8; 4];
            dst.copy_from_slice(&packet[IPV4_DST]);
            Ok(IpAddr::V4(Ipv4Addr::from(dst)))
        }
        Some(6) => {
            if packet.len() < IPV6_DST.end {
                return Err(Error::protocol("short ipv6 frame"));
            }
            let mut dst = [0u8; 16];
            dst.copy_from_slice(&packet[IPV6_DST]);
            Ok(IpAddr::V6(Ipv6Addr::from(dst)))
        }
        Some(v) => Err(Error::protocol(format!("unknown ip version {v}"))),
        None => Err(Error::protocol("empty frame")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_address_carries_across_octets() {
        let a: IpAddr = "10.0.0.255".parse().unwrap();
        assert_eq!(next_address(a), "10.0.1.0".parse::<IpAddr>().unwrap());

        let b: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(next_address(b), "10.0.0.2".parse::<IpAddr>().unwrap());

        let v6: IpAddr = "fd00::ff".parse().unwrap();
        assert_eq!(next_address(v6), "fd00::100".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn last_address_is_broadcast() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        assert_eq!(last_address(&net), "10.0.0.255".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn host_prefix_width() {
        assert_eq!(
            host_prefix("10.0.0.2".parse().unwrap()).to_string(),
            "10.0.0.2/32"
        );
        assert_eq!(
            host_prefix("fd00::2".parse().unwrap()).to_string(),
            "fd00::2/128"
        );
    }

    #[test]
    fn destination_ipv4() {
        // 20-byte IPv4 header, 10.0.0.2 -> 10.0.0.1.
        let pkt: [u8; 20] = [
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x01, 0x00, 0x00, 0x40, 0x01, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x02, 0x0a, 0x00, 0x00, 0x01,
        ];
        assert_eq!(
            destination(&pkt).unwrap(),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn destination_rejects_short_and_unknown() {
        assert!(destination(&[0x45, 0x00]).is_err());
        assert!(destination(&[0x00; 40]).is_err());
        assert!(destination(&[]).is_err());

        let mut v6 = [0u8; 40];
        v6[0] = 0x60;
        v6[24..40].copy_from_slice(&"fd00::1".parse::<Ipv6Addr>().unwrap().octets());
        assert_eq!(
            destination(&v6).unwrap(),
            "fd00::1".parse::<IpAddr>().unwrap()
        );
    }
}
