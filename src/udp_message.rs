//! UDP association messages
//!
//! Every message starts with `6, type, total_length(u16), assoc_id(u64)`.
//! The same framing is used on the datagram channel and, for
//! UDP-over-TCP, on the control stream.

use crate::address::{Addr, Host};
use crate::error::{Error, Result};
use crate::protocol::{RSV, VERSION};
use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const UDP_HEADER_LEN: usize = 12;

const TYPE_ASSOC_INIT: u8 = 1;
const TYPE_ASSOC_ACK: u8 = 2;
const TYPE_DATAGRAM: u8 = 3;
const TYPE_ERROR: u8 = 4;

/// UdpErrorCode classifies an ICMP error reported back to the client
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpErrorCode {
    NetworkUnreachable = 1,
    HostUnreachable = 2,
    TtlExpired = 3,
    DatagramTooBig = 4,
}

impl UdpErrorCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(UdpErrorCode::NetworkUnreachable),
            2 => Some(UdpErrorCode::HostUnreachable),
            3 => Some(UdpErrorCode::TtlExpired),
            4 => Some(UdpErrorCode::DatagramTooBig),
            _ => None,
        }
    }

    /// from_icmpv4 maps an ICMPv4 (type, code); unmapped pairs are dropped
    pub fn from_icmpv4(icmp_type: u8, code: u8) -> Option<Self> {
        match (icmp_type, code) {
            // destination unreachable
            (3, 0) | (3, 6) | (3, 11) => Some(UdpErrorCode::NetworkUnreachable),
            (3, 1) | (3, 7) | (3, 12) => Some(UdpErrorCode::HostUnreachable),
            (3, 4) => Some(UdpErrorCode::DatagramTooBig),
            // time exceeded in transit
            (11, 0) => Some(UdpErrorCode::TtlExpired),
            _ => None,
        }
    }

    /// from_icmpv6 maps an ICMPv6 (type, code); unmapped pairs are dropped
    pub fn from_icmpv6(icmp_type: u8, code: u8) -> Option<Self> {
        match (icmp_type, code) {
            (1, 0) => Some(UdpErrorCode::NetworkUnreachable),
            (1, 3) => Some(UdpErrorCode::HostUnreachable),
            (2, _) => Some(UdpErrorCode::DatagramTooBig),
            (3, 0) => Some(UdpErrorCode::TtlExpired),
            _ => None,
        }
    }
}

/// UdpMessage is one message of a UDP association
#[derive(Debug, Clone, PartialEq)]
pub enum UdpMessage {
    AssocInit {
        assoc_id: u64,
    },
    AssocAck {
        assoc_id: u64,
    },
    Datagram {
        assoc_id: u64,
        endpoint: Addr,
        data: Vec<u8>,
    },
    Error {
        assoc_id: u64,
        endpoint: Addr,
        code: UdpErrorCode,
        reporter: Host,
    },
}

impl UdpMessage {
    pub fn assoc_id(&self) -> u64 {
        match self {
            UdpMessage::AssocInit { assoc_id }
            | UdpMessage::AssocAck { assoc_id }
            | UdpMessage::Datagram { assoc_id, .. }
            | UdpMessage::Error { assoc_id, .. } => *assoc_id,
        }
    }

    fn message_type(&self) -> u8 {
        match self {
            UdpMessage::AssocInit { .. } => TYPE_ASSOC_INIT,
            UdpMessage::AssocAck { .. } => TYPE_ASSOC_ACK,
            UdpMessage::Datagram { .. } => TYPE_DATAGRAM,
            UdpMessage::Error { .. } => TYPE_ERROR,
        }
    }

    // Datagram
    // +-----+------+-----+----------+------+-----+------+----------+------+
    // | VER | TYPE | LEN | ASSOC ID | ATYP | PAD | PORT | DST.ADDR | DATA |
    // +-----+------+-----+----------+------+-----+------+----------+------+
    // |  1  |  1   |  2  |    8     |  1   |  1  |  2   | Variable | Var. |
    // +-----+------+-----+----------+------+-----+------+----------+------+
    //
    // Error
    // +----------------+------+-----+------+----------+-------+------+---------+----------+
    // | header (as ^)  | ATYP | PAD | PORT | DST.ADDR | EATYP | CODE | PAD (2) | REPORTER |
    // +----------------+------+-----+------+----------+-------+------+---------+----------+

    /// marshal produces the framed message
    ///
    /// # Panics
    ///
    /// Panics when the message does not fit the 16-bit length field.
    pub fn marshal(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            UdpMessage::AssocInit { .. } | UdpMessage::AssocAck { .. } => {}
            UdpMessage::Datagram { endpoint, data, .. } => {
                write_endpoint(&mut body, endpoint);
                body.put_slice(data);
            }
            UdpMessage::Error {
                endpoint,
                code,
                reporter,
                ..
            } => {
                write_endpoint(&mut body, endpoint);
                body.put_u8(reporter.address_type() as u8);
                body.put_u8(*code as u8);
                body.put_bytes(RSV, 2);
                reporter.write_address(&mut body);
            }
        }
        let total = UDP_HEADER_LEN + body.len();
        assert!(total <= u16::MAX as usize, "udp message too long: {total}");
        let mut buf = Vec::with_capacity(total);
        buf.put_u8(VERSION);
        buf.put_u8(self.message_type());
        buf.put_u16(total as u16);
        buf.put_u64(self.assoc_id());
        buf.put_slice(&body);
        buf
    }

    /// parse decodes a message occupying the whole of `packet`
    pub fn parse(packet: &[u8]) -> Result<Self> {
        let mut buf = packet;
        let version = buf.try_get_u8()?;
        if version != VERSION {
            return Err(Error::VersionMismatch {
                version,
                consumed: vec![version],
            });
        }
        let message_type = buf.try_get_u8()?;
        let total = buf.try_get_u16()? as usize;
        if total < UDP_HEADER_LEN || total > packet.len() {
            return Err(Error::short(total.max(UDP_HEADER_LEN), packet.len()));
        }
        // ignore anything past the declared length
        let mut buf = &packet[4..total];
        let assoc_id = buf.try_get_u64()?;
        match message_type {
            TYPE_ASSOC_INIT => Ok(UdpMessage::AssocInit { assoc_id }),
            TYPE_ASSOC_ACK => Ok(UdpMessage::AssocAck { assoc_id }),
            TYPE_DATAGRAM => {
                let endpoint = parse_endpoint(&mut buf)?;
                Ok(UdpMessage::Datagram {
                    assoc_id,
                    endpoint,
                    data: buf.to_vec(),
                })
            }
            TYPE_ERROR => {
                let endpoint = parse_endpoint(&mut buf)?;
                let reporter_type = buf.try_get_u8()?;
                let raw_code = buf.try_get_u8()?;
                let code = UdpErrorCode::from_byte(raw_code).ok_or(Error::EnumOutOfRange {
                    field: "udp error code",
                    value: raw_code as u32,
                })?;
                let _reserved = buf.try_get_u16()?;
                let reporter = Host::parse_address_from(&mut buf, reporter_type)?;
                Ok(UdpMessage::Error {
                    assoc_id,
                    endpoint,
                    code,
                    reporter,
                })
            }
            other => Err(Error::EnumOutOfRange {
                field: "udp message type",
                value: other as u32,
            }),
        }
    }

    /// read_from reads one message from a stream (UDP-over-TCP)
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut head = [0u8; 4];
        reader.read_exact(&mut head[..1]).await?;
        if head[0] != VERSION {
            return Err(Error::VersionMismatch {
                version: head[0],
                consumed: vec![head[0]],
            });
        }
        reader.read_exact(&mut head[1..]).await?;
        let total = u16::from_be_bytes([head[2], head[3]]) as usize;
        if total < UDP_HEADER_LEN {
            return Err(Error::short(UDP_HEADER_LEN, total));
        }
        let mut packet = vec![0u8; total];
        packet[..4].copy_from_slice(&head);
        reader.read_exact(&mut packet[4..]).await?;
        Self::parse(&packet)
    }
}

fn write_endpoint(buf: &mut Vec<u8>, endpoint: &Addr) {
    buf.put_u8(endpoint.address_type() as u8);
    buf.put_u8(RSV);
    buf.put_u16(endpoint.port);
    endpoint.host.write_address(buf);
}

fn parse_endpoint(buf: &mut &[u8]) -> Result<Addr> {
    let atype = buf.try_get_u8()?;
    let _padding = buf.try_get_u8()?;
    let port = buf.try_get_u16()?;
    let host = Host::parse_address_from(buf, atype)?;
    Ok(Addr { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn assoc_init_layout() {
        let wire = UdpMessage::AssocInit { assoc_id: 0x0102 }.marshal();
        assert_eq!(wire, vec![6, 1, 0, 12, 0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(
            UdpMessage::parse(&wire).unwrap(),
            UdpMessage::AssocInit { assoc_id: 0x0102 }
        );
    }

    #[test]
    fn datagram_round_trip() {
        let msg = UdpMessage::Datagram {
            assoc_id: u64::MAX,
            endpoint: Addr::new("example.net:53").unwrap(),
            data: b"query".to_vec(),
        };
        let wire = msg.marshal();
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]) as usize, wire.len());
        assert_eq!(UdpMessage::parse(&wire).unwrap(), msg);
    }

    #[test]
    fn error_round_trip() {
        let msg = UdpMessage::Error {
            assoc_id: 7,
            endpoint: Addr::new("192.0.2.1:9").unwrap(),
            code: UdpErrorCode::TtlExpired,
            reporter: Host::IPv4(Ipv4Addr::new(10, 0, 0, 254)),
        };
        assert_eq!(UdpMessage::parse(&msg.marshal()).unwrap(), msg);
    }

    #[test]
    fn truncated_and_unknown_messages_fail() {
        let mut wire = UdpMessage::AssocAck { assoc_id: 1 }.marshal();
        assert!(UdpMessage::parse(&wire[..10]).is_err());
        wire[1] = 9;
        assert!(UdpMessage::parse(&wire).is_err());
    }

    #[tokio::test]
    async fn reads_consecutive_frames_from_a_stream() {
        let a = UdpMessage::Datagram {
            assoc_id: 3,
            endpoint: Addr::new("127.0.0.1:7").unwrap(),
            data: vec![1],
        };
        let b = UdpMessage::AssocAck { assoc_id: 3 };
        let mut wire = a.marshal();
        wire.extend(b.marshal());
        let mut reader = wire.as_slice();
        assert_eq!(UdpMessage::read_from(&mut reader).await.unwrap(), a);
        assert_eq!(UdpMessage::read_from(&mut reader).await.unwrap(), b);
    }

    #[test]
    fn icmp_codes_map_partially() {
        assert_eq!(
            UdpErrorCode::from_icmpv4(3, 1),
            Some(UdpErrorCode::HostUnreachable)
        );
        assert_eq!(UdpErrorCode::from_icmpv4(3, 3), None);
        assert_eq!(
            UdpErrorCode::from_icmpv6(2, 0),
            Some(UdpErrorCode::DatagramTooBig)
        );
        assert_eq!(UdpErrorCode::from_icmpv6(1, 4), None);
    }
}
