//! Utility functions
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// transform bytes into a human readable format.
pub fn to_human_readable(n: u64) -> String {
    let mut n = n as f64;

    let units = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let delimiter = 1000_f64;

    if n < delimiter {
        return format!("{} {}", n, "B");
    }

    let mut u: i32 = 0;
    let r = 10_f64;

    while (n * r).round() / r >= delimiter && u < (units.len() as i32) - 1 {
        n /= delimiter;
        u += 1;
    }

    format!("{:.2} {}", n, units[u as usize])
}

/// Parse a compact peer list (BEP 23), `stride` is 6 for IPv4 and 18 for
/// IPv6. A trailing partial entry is ignored.
pub fn parse_compact_peers(buf: &[u8], stride: usize) -> Vec<SocketAddr> {
    buf.chunks_exact(stride)
        .filter_map(|hostport| {
            let (ip, port) = hostport.split_at(stride - 2);
            let ip = match ip.len() {
                4 => IpAddr::from(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
                16 => {
                    let octets: [u8; 16] = ip.try_into().ok()?;
                    IpAddr::from(Ipv6Addr::from(octets))
                }
                _ => return None,
            };
            let port = u16::from_be_bytes([port[0], port[1]]);
            Some(SocketAddr::new(ip, port))
        })
        .collect()
}

/// Encode IPv4 peers in the compact form, 4 bytes of ip followed by 2 bytes
/// of port. IPv6 peers are skipped.
pub fn to_compact_v4<'a>(
    peers: impl IntoIterator<Item = &'a SocketAddr>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    for peer in peers {
        if let SocketAddr::V4(v4) = peer {
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    buf
}
