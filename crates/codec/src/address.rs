//! CONNECT address descriptor: `atype(1) | address | port(2, BE)`.
//!
//! `atype` is one of `IPV4(0x01)`, `DOMAIN(0x03)`, `IPV6(0x04)`. For
//! `DOMAIN`, the address is `len(1) | len bytes of ASCII hostname`; for
//! `IPV4`/`IPV6` it is the raw 4 or 16 address bytes. Lengths are validated
//! before any slice is taken, so a truncated or out-of-range payload always
//! yields [`crate::Error::MalformedAddress`] rather than panicking.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

const IPV4: u8 = 0x01;
const DOMAIN: u8 = 0x03;
const IPV6: u8 = 0x04;

/// A CONNECT target address. Domain labels are kept as raw bytes: no IDN
/// normalization is performed here, matching the wire format's silence on
/// the subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(Vec<u8>, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Self::V4(_, port) | Self::V6(_, port) | Self::Domain(_, port) => *port,
        }
    }

    /// Decode a CONNECT frame payload into an address descriptor.
    ///
    /// ```
    /// use tunnel_agent_codec::address::Address;
    /// use std::net::Ipv4Addr;
    ///
    /// let payload = [0x01, 127, 0, 0, 1, 0x00, 0x09];
    /// assert_eq!(Address::decode(&payload).unwrap(), Address::V4(Ipv4Addr::new(127, 0, 0, 1), 9));
    /// ```
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let (&atype, rest) = payload.split_first().ok_or(Error::MalformedAddress)?;

        match atype {
            IPV4 => {
                if rest.len() != 4 + 2 {
                    return Err(Error::MalformedAddress);
                }

                let octets: [u8; 4] = rest[..4].try_into().expect("checked length");
                let port = u16::from_be_bytes(rest[4..6].try_into().expect("checked length"));
                Ok(Self::V4(Ipv4Addr::from(octets), port))
            }
            IPV6 => {
                if rest.len() != 16 + 2 {
                    return Err(Error::MalformedAddress);
                }

                let octets: [u8; 16] = rest[..16].try_into().expect("checked length");
                let port = u16::from_be_bytes(rest[16..18].try_into().expect("checked length"));
                Ok(Self::V6(Ipv6Addr::from(octets), port))
            }
            DOMAIN => {
                let (&len, rest) = rest.split_first().ok_or(Error::MalformedAddress)?;
                let len = len as usize;

                if rest.len() != len + 2 {
                    return Err(Error::MalformedAddress);
                }

                let domain = rest[..len].to_vec();
                let port = u16::from_be_bytes(rest[len..len + 2].try_into().expect("checked length"));
                Ok(Self::Domain(domain, port))
            }
            _ => Err(Error::MalformedAddress),
        }
    }

    /// Encode this address back into a CONNECT frame payload. Primarily
    /// useful for tests (`decode(encode(addr)) == addr`); the agent only
    /// ever decodes addresses sent by the orchestrator.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Self::V4(ip, port) => {
                buf.put_u8(IPV4);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Self::V6(ip, port) => {
                buf.put_u8(IPV6);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Self::Domain(domain, port) => {
                buf.put_u8(DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain);
                buf.put_u16(*port);
            }
        }

        buf.freeze()
    }
}

/// `host:port`, used for logging. Domain bytes are rendered lossily since
/// this is for human consumption only; no implicit UTF-8 validity is
/// assumed elsewhere.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(ip, port) => write!(f, "{ip}:{port}"),
            Self::V6(ip, port) => write!(f, "[{ip}]:{port}"),
            Self::Domain(domain, port) => {
                write!(f, "{}:{port}", String::from_utf8_lossy(domain))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ipv4() {
        let addr = Address::V4(Ipv4Addr::new(127, 0, 0, 1), 9);
        assert_eq!(Address::decode(&addr.encode()).unwrap(), addr);
    }

    #[test]
    fn round_trips_ipv6() {
        let addr = Address::V6(Ipv6Addr::LOCALHOST, 443);
        assert_eq!(Address::decode(&addr.encode()).unwrap(), addr);
    }

    #[test]
    fn round_trips_domain() {
        let addr = Address::Domain(b"nonexistent.invalid".to_vec(), 80);
        assert_eq!(Address::decode(&addr.encode()).unwrap(), addr);
    }

    #[test]
    fn dns_failure_scenario_payload_parses() {
        // 03 13 "nonexistent.invalid" 0050
        let mut payload = vec![DOMAIN, 20];
        payload.extend_from_slice(b"nonexistent.invalid");
        payload.extend_from_slice(&80u16.to_be_bytes());

        assert_eq!(
            Address::decode(&payload).unwrap(),
            Address::Domain(b"nonexistent.invalid".to_vec(), 80)
        );
    }

    #[test]
    fn empty_payload_is_malformed() {
        assert!(matches!(Address::decode(&[]), Err(Error::MalformedAddress)));
    }

    #[test]
    fn truncated_ipv4_is_malformed() {
        assert!(matches!(
            Address::decode(&[IPV4, 127, 0, 0]),
            Err(Error::MalformedAddress)
        ));
    }

    #[test]
    fn truncated_domain_length_prefix_is_malformed() {
        // Claims a 10-byte label but only supplies 3.
        let payload = [DOMAIN, 10, b'a', b'b', b'c'];
        assert!(matches!(Address::decode(&payload), Err(Error::MalformedAddress)));
    }

    #[test]
    fn unknown_atype_is_malformed() {
        assert!(matches!(
            Address::decode(&[0x02, 0, 0]),
            Err(Error::MalformedAddress)
        ));
    }

    #[test]
    fn display_renders_host_port() {
        assert_eq!(Address::V4(Ipv4Addr::new(1, 2, 3, 4), 80).to_string(), "1.2.3.4:80");
        assert_eq!(
            Address::Domain(b"example.com".to_vec(), 443).to_string(),
            "example.com:443"
        );
    }
}
