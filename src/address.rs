use crate::error::{Error, Result, take_bytes};
use crate::protocol::AddressType;
use bytes::{Buf, BufMut};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Host is the address part of a SOCKS6 endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    IPv4(Ipv4Addr),
    IPv6(Ipv6Addr),
    /// IDNA-encoded ASCII, 1 to 255 bytes, never NUL-terminated
    Domain(String),
}

impl Host {
    pub fn address_type(&self) -> AddressType {
        match self {
            Host::IPv4(_) => AddressType::IPv4,
            Host::IPv6(_) => AddressType::IPv6,
            Host::Domain(_) => AddressType::DomainName,
        }
    }

    /// marshal_address produces the on-wire form of the address, without
    /// the type byte and port
    pub fn marshal_address(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.marshalled_len());
        self.write_address(&mut buf);
        buf
    }

    /// marshalled_len is the number of bytes marshal_address produces
    pub fn marshalled_len(&self) -> usize {
        match self {
            Host::IPv4(_) => 4,
            Host::IPv6(_) => 16,
            Host::Domain(d) => padded_domain_len(d.len()),
        }
    }

    /// write_address appends the on-wire address to `buf`
    pub fn write_address(&self, buf: &mut impl BufMut) {
        match self {
            Host::IPv4(ip) => buf.put_slice(&ip.octets()),
            Host::IPv6(ip) => buf.put_slice(&ip.octets()),
            Host::Domain(d) => {
                // Domain: [L][bytes][NUL padding], L counts the padding too
                let total = padded_domain_len(d.len());
                buf.put_u8((total - 1) as u8);
                buf.put_slice(d.as_bytes());
                buf.put_bytes(0, total - 1 - d.len());
            }
        }
    }

    /// parse_address_from consumes exactly one address of type `atype`
    /// from the front of `buf`
    pub fn parse_address_from(buf: &mut &[u8], atype: u8) -> Result<Self> {
        match AddressType::from_byte(atype) {
            Some(AddressType::IPv4) => {
                Ok(Host::IPv4(Ipv4Addr::from(buf.try_get_u32()?)))
            }
            Some(AddressType::IPv6) => {
                Ok(Host::IPv6(Ipv6Addr::from(buf.try_get_u128()?)))
            }
            Some(AddressType::DomainName) => {
                let len = buf.try_get_u8()? as usize;
                let raw = take_bytes(buf, len)?;
                domain_from_wire(&raw)
            }
            None => Err(Error::AddressTypeNotSupport(atype)),
        }
    }

    /// read_address_from is parse_address_from for async streams
    pub async fn read_address_from<R>(reader: &mut R, atype: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match AddressType::from_byte(atype) {
            Some(AddressType::IPv4) => {
                let mut raw = [0u8; 4];
                reader.read_exact(&mut raw).await?;
                Ok(Host::IPv4(Ipv4Addr::from(raw)))
            }
            Some(AddressType::IPv6) => {
                let mut raw = [0u8; 16];
                reader.read_exact(&mut raw).await?;
                Ok(Host::IPv6(Ipv6Addr::from(raw)))
            }
            Some(AddressType::DomainName) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let len = reader.read_u8().await? as usize;
                let mut raw = vec![0u8; len];
                reader.read_exact(&mut raw).await?;
                domain_from_wire(&raw)
            }
            None => Err(Error::AddressTypeNotSupport(atype)),
        }
    }

    /// parse_host turns a textual host into a Host: IP literals stay IPs,
    /// everything else is IDNA-encoded
    pub fn parse_host(host: &str) -> Result<Self> {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if trimmed.is_empty() {
            return Ok(Host::IPv4(Ipv4Addr::UNSPECIFIED));
        }
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Host::from(ip));
        }
        let ascii = idna::domain_to_ascii(trimmed)
            .map_err(|e| Error::InvalidAddress(host.to_string(), e.to_string()))?;
        if ascii.is_empty() {
            return Err(Error::InvalidAddress(host.to_string(), "empty domain".into()));
        }
        if ascii.len() > 255 {
            return Err(Error::DomainTooLong(ascii.len()));
        }
        Ok(Host::Domain(ascii))
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Host::IPv4(v4),
            IpAddr::V6(v6) => Host::IPv6(v6),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::IPv4(ip) => write!(f, "{ip}"),
            Host::IPv6(ip) => write!(f, "[{ip}]"),
            Host::Domain(d) => f.write_str(d),
        }
    }
}

/// padded_domain_len is the encoded size of a domain of `len` bytes:
/// length byte plus name, rounded up to a multiple of 4
fn padded_domain_len(len: usize) -> usize {
    (1 + len).div_ceil(4) * 4
}

/// domain_from_wire strips NUL padding and validates the name
fn domain_from_wire(raw: &[u8]) -> Result<Host> {
    let Some(end) = raw.iter().rposition(|&b| b != 0).map(|i| i + 1) else {
        return Err(Error::InvalidAddress(format!("{raw:?}"), "empty domain name".into()));
    };
    let name = String::from_utf8(raw[..end].to_vec())
        .map_err(|e| Error::InvalidAddress(format!("{:?}", &raw[..end]), e.to_string()))?;
    Ok(Host::Domain(name))
}

/// Addr is a SOCKS6 endpoint: a host and a port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    pub host: Host,
    pub port: u16,
}

impl Addr {
    /// new parses `host:port`. An empty host becomes 0.0.0.0.
    pub fn new(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string(), "missing port".into()))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::InvalidAddress(s.to_string(), e.to_string()))?;
        Ok(Self {
            host: Host::parse_host(host)?,
            port,
        })
    }

    /// unspecified is 0.0.0.0:0
    pub fn unspecified() -> Self {
        Self {
            host: Host::IPv4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn address_type(&self) -> AddressType {
        self.host.address_type()
    }

    /// socket_addr returns the endpoint as a SocketAddr when it is an IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::IPv4(ip) => Some(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            Host::IPv6(ip) => Some(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            Host::Domain(_) => None,
        }
    }

    /// resolve returns the first socket address the endpoint resolves to
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        if let Some(addr) = self.socket_addr() {
            return Ok(addr);
        }
        let target = format!("{}:{}", self.host, self.port);
        tokio::net::lookup_host(&target)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::HostUnreachable,
                    format!("no address found for {target}"),
                )
            })
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: Host::from(addr.ip()),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(host: &Host) -> Host {
        let wire = host.marshal_address();
        let mut buf = wire.as_slice();
        let parsed = Host::parse_address_from(&mut buf, host.address_type() as u8).unwrap();
        assert!(buf.is_empty(), "parser must consume the whole address");
        parsed
    }

    #[test]
    fn ip_addresses_round_trip() {
        let v4 = Host::IPv4(Ipv4Addr::new(192, 0, 2, 7));
        assert_eq!(v4.marshal_address(), vec![192, 0, 2, 7]);
        assert_eq!(round_trip(&v4), v4);

        let v6 = Host::IPv6("2001:db8::1".parse().unwrap());
        assert_eq!(v6.marshal_address().len(), 16);
        assert_eq!(round_trip(&v6), v6);
    }

    #[test]
    fn domains_are_padded_to_four_bytes() {
        for name in ["a", "ab", "abc", "example.com", "abcdefg"] {
            let host = Host::Domain(name.to_string());
            let wire = host.marshal_address();
            assert_eq!(wire.len() % 4, 0, "{name}");
            assert_eq!(wire[0] as usize, wire.len() - 1);
            assert_eq!(round_trip(&host), host);
        }
    }

    #[test]
    fn trailing_nuls_are_stripped() {
        let wire = [6u8, b'h', b'o', b's', b't', 0, 0];
        let mut buf = &wire[..];
        let host = Host::parse_address_from(&mut buf, AddressType::DomainName as u8).unwrap();
        assert_eq!(host, Host::Domain("host".into()));
    }

    #[test]
    fn empty_domains_are_rejected() {
        for wire in [&[0u8][..], &[3, 0, 0, 0][..]] {
            let mut buf = wire;
            assert!(matches!(
                Host::parse_address_from(&mut buf, AddressType::DomainName as u8),
                Err(Error::InvalidAddress(..))
            ));
        }
    }

    #[tokio::test]
    async fn empty_domains_are_rejected_on_streams() {
        let mut stream = &[3u8, 0, 0, 0][..];
        assert!(matches!(
            Host::read_address_from(&mut stream, AddressType::DomainName as u8).await,
            Err(Error::InvalidAddress(..))
        ));
    }

    #[test]
    fn unknown_address_type_is_rejected() {
        let mut buf = &[0u8; 8][..];
        assert!(matches!(
            Host::parse_address_from(&mut buf, 0x02),
            Err(Error::AddressTypeNotSupport(0x02))
        ));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut buf = &[1u8, 2, 3][..];
        assert!(matches!(
            Host::parse_address_from(&mut buf, AddressType::IPv4 as u8),
            Err(Error::ShortBuffer { need: 4, have: 3 })
        ));
    }

    #[test]
    fn new_parses_host_and_port() {
        let a = Addr::new("127.0.0.1:1080").unwrap();
        assert_eq!(a.socket_addr(), Some("127.0.0.1:1080".parse().unwrap()));

        let b = Addr::new(":53").unwrap();
        assert_eq!(b.host, Host::IPv4(Ipv4Addr::UNSPECIFIED));

        let c = Addr::new("[::1]:443").unwrap();
        assert_eq!(c.host, Host::IPv6(Ipv6Addr::LOCALHOST));

        let d = Addr::new("Bücher.example:80").unwrap();
        assert_eq!(d.host, Host::Domain("xn--bcher-kva.example".into()));

        assert!(Addr::new("no-port").is_err());
        let long = format!("{}:1", "a.".repeat(200));
        assert!(Addr::new(&long).is_err());
    }

    #[tokio::test]
    async fn reads_addresses_from_streams() {
        let wire = Host::Domain("example.org".into()).marshal_address();
        let mut reader = wire.as_slice();
        let host = Host::read_address_from(&mut reader, AddressType::DomainName as u8)
            .await
            .unwrap();
        assert_eq!(host, Host::Domain("example.org".into()));
    }
}
