//! B/IP address codec.
//!
//! A BACnet/IP MAC is six bytes: an IPv4 host followed by a big-endian UDP
//! port. The metadata store and configuration use the `a.b.c.d:port` form.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};

/// A six-byte BACnet/IP MAC address.
pub type Mac = [u8; 6];

/// Render a six-byte B/IP address as `a.b.c.d:port`.
pub fn encode(bytes: &[u8]) -> Result<String> {
    let mac: &Mac = bytes.try_into().map_err(|_| {
        Error::MalformedAddress(format!("expected 6 bytes, got {}", bytes.len()))
    })?;

    let host = Ipv4Addr::new(mac[0], mac[1], mac[2], mac[3]);
    let port = u16::from_be_bytes([mac[4], mac[5]]);
    Ok(format!("{}:{}", host, port))
}

/// Parse `a.b.c.d:port` back into its six-byte form.
pub fn decode(address: &str) -> Result<Mac> {
    let socket: SocketAddrV4 = address
        .trim()
        .parse()
        .map_err(|_| Error::MalformedAddress(format!("'{}' is not a.b.c.d:port", address)))?;

    let [a, b, c, d] = socket.ip().octets();
    let [hi, lo] = socket.port().to_be_bytes();
    Ok([a, b, c, d, hi, lo])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_standard_port() {
        let mac = [192, 168, 1, 10, 0xBA, 0xC0];
        assert_eq!(encode(&mac).unwrap(), "192.168.1.10:47808");
    }

    #[test]
    fn test_roundtrip() {
        let samples: [Mac; 4] = [
            [0, 0, 0, 0, 0, 0],
            [255, 255, 255, 255, 0xFF, 0xFF],
            [10, 0, 42, 7, 0xBA, 0xC1],
            [172, 16, 254, 1, 0x00, 0x50],
        ];

        for mac in samples {
            let text = encode(&mac).unwrap();
            assert_eq!(decode(&text).unwrap(), mac, "roundtrip of {}", text);
        }
    }

    #[test]
    fn test_encode_wrong_length() {
        for len in [0usize, 4, 5, 7, 16] {
            let bytes = vec![1u8; len];
            assert!(
                matches!(encode(&bytes), Err(Error::MalformedAddress(_))),
                "length {} should be rejected",
                len
            );
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        for text in [
            "",
            "192.168.1.10",
            "192.168.1:47808",
            "192.168.1.300:47808",
            "192.168.1.10:70000",
            "host:47808",
        ] {
            assert!(
                matches!(decode(text), Err(Error::MalformedAddress(_))),
                "'{}' should be rejected",
                text
            );
        }
    }
}
