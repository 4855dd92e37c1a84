//! Byte layouts of the kernel structures faultline reads from and writes to
//! tracee memory.

use std::net::{Ipv4Addr, SocketAddrV4};

/// `sizeof(struct sockaddr_in)`.
pub const SOCKADDR_IN_LEN: usize = 16;

/// `sizeof(struct timeval)` and `sizeof(struct timespec)` on x86_64.
pub const TIME_STRUCT_LEN: usize = 16;

pub const AF_INET: u16 = libc::AF_INET as u16;

/// Decodes a `sockaddr_in`. Returns `None` unless the family is `AF_INET`.
pub fn decode_sockaddr_in(bytes: &[u8]) -> Option<SocketAddrV4> {
    if bytes.len() < 8 {
        return None;
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]);
    if family != AF_INET {
        return None;
    }
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
    Some(SocketAddrV4::new(ip, port))
}

pub fn encode_sockaddr_in(addr: SocketAddrV4) -> [u8; SOCKADDR_IN_LEN] {
    let mut out = [0u8; SOCKADDR_IN_LEN];
    out[0..2].copy_from_slice(&AF_INET.to_ne_bytes());
    out[2..4].copy_from_slice(&addr.port().to_be_bytes());
    out[4..8].copy_from_slice(&addr.ip().octets());
    out
}

/// A `struct timeval` or `struct timespec`: seconds plus a sub-second field
/// whose unit depends on the structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimePair {
    pub secs: i64,
    pub sub: i64,
}

impl TimePair {
    pub fn new(secs: i64, sub: i64) -> Self {
        Self { secs, sub }
    }

    pub fn decode(bytes: &[u8; TIME_STRUCT_LEN]) -> Self {
        let mut secs = [0u8; 8];
        let mut sub = [0u8; 8];
        secs.copy_from_slice(&bytes[..8]);
        sub.copy_from_slice(&bytes[8..]);
        Self {
            secs: i64::from_ne_bytes(secs),
            sub: i64::from_ne_bytes(sub),
        }
    }

    pub fn encode(self) -> [u8; TIME_STRUCT_LEN] {
        let mut out = [0u8; TIME_STRUCT_LEN];
        out[..8].copy_from_slice(&self.secs.to_ne_bytes());
        out[8..].copy_from_slice(&self.sub.to_ne_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_layout_matches_kernel() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), 8080);
        let bytes = encode_sockaddr_in(addr);
        assert_eq!(&bytes[2..4], &[0x1f, 0x90]);
        assert_eq!(&bytes[4..8], &[127, 0, 0, 2]);
        assert!(bytes[8..].iter().all(|&b| b == 0));
        assert_eq!(decode_sockaddr_in(&bytes), Some(addr));
    }

    #[test]
    fn non_inet_family_is_ignored() {
        let mut bytes = encode_sockaddr_in(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        bytes[0..2].copy_from_slice(&(libc::AF_UNIX as u16).to_ne_bytes());
        assert_eq!(decode_sockaddr_in(&bytes), None);
        assert_eq!(decode_sockaddr_in(&bytes[..4]), None);
    }

    #[test]
    fn time_pair_layout() {
        let pair = TimePair::new(3, 999_999);
        let bytes = pair.encode();
        assert_eq!(&bytes[..8], &3i64.to_ne_bytes());
        assert_eq!(TimePair::decode(&bytes), pair);
    }
}
