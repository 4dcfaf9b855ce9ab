use std::fmt;
use std::io;

/// VERSION is the first byte of every SOCKS6 message
pub const VERSION: u8 = 0x06;

/// CLEARTEXT_PORT is the fixed port for plain TCP/UDP
pub const CLEARTEXT_PORT: u16 = 1080;

/// ENCRYPTED_PORT is the default TLS/DTLS port (pending IANA)
pub const ENCRYPTED_PORT: u16 = 8389;

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// MAX_DGRAM is the largest UDP payload we will buffer
pub const MAX_DGRAM: usize = 65_535;

/// AddressType represents the SOCKS6 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// Command represents SOCKS6 request commands. Unknown command bytes are
/// kept so the server can answer them with CommandNotSupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Noop,
    Connect,
    Bind,
    UdpAssociate,
    Unknown(u8),
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS6 protocol command
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Command::Noop,
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::UdpAssociate,
            other => Command::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Command::Noop => 0x00,
            Command::Connect => 0x01,
            Command::Bind => 0x02,
            Command::UdpAssociate => 0x03,
            Command::Unknown(b) => b,
        }
    }
}

/// ReplyCode is the operation reply code
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    Success = 0x00,
    ServerFailure = 0x01,
    NotAllowedByRule = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressNotSupported = 0x08,
    Timeout = 0x09,
}

impl ReplyCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ReplyCode::Success),
            0x01 => Some(ReplyCode::ServerFailure),
            0x02 => Some(ReplyCode::NotAllowedByRule),
            0x03 => Some(ReplyCode::NetworkUnreachable),
            0x04 => Some(ReplyCode::HostUnreachable),
            0x05 => Some(ReplyCode::ConnectionRefused),
            0x06 => Some(ReplyCode::TtlExpired),
            0x07 => Some(ReplyCode::CommandNotSupported),
            0x08 => Some(ReplyCode::AddressNotSupported),
            0x09 => Some(ReplyCode::Timeout),
            _ => None,
        }
    }

    /// from_io_error maps a system error onto the closest reply code
    pub fn from_io_error(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => return ReplyCode::ConnectionRefused,
            io::ErrorKind::HostUnreachable => return ReplyCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => return ReplyCode::NetworkUnreachable,
            io::ErrorKind::TimedOut => return ReplyCode::Timeout,
            io::ErrorKind::PermissionDenied => return ReplyCode::NotAllowedByRule,
            io::ErrorKind::Unsupported => return ReplyCode::CommandNotSupported,
            _ => {}
        }
        match e.raw_os_error() {
            Some(errno::EOPNOTSUPP) => ReplyCode::CommandNotSupported,
            Some(errno::EAFNOSUPPORT) => ReplyCode::AddressNotSupported,
            _ => ReplyCode::ServerFailure,
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplyCode::Success => "succeeded",
            ReplyCode::ServerFailure => "general server failure",
            ReplyCode::NotAllowedByRule => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddressNotSupported => "address type not supported",
            ReplyCode::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod errno {
    pub const EOPNOTSUPP: i32 = 95;
    pub const EAFNOSUPPORT: i32 = 97;
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod errno {
    pub const EOPNOTSUPP: i32 = 102;
    pub const EAFNOSUPPORT: i32 = 47;
}

/// AuthReplyType is the first field of an authentication reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReplyType {
    Success = 0x00,
    Failure = 0x01,
}

impl AuthReplyType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(AuthReplyType::Success),
            0x01 => Some(AuthReplyType::Failure),
            _ => None,
        }
    }
}

/// AuthMethod represents well-known SOCKS6 authentication method ids
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    Gssapi = 0x01,
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}
