use crate::options::SocksOption;
use crate::protocol::ReplyCode;
use bytes::{Buf, Bytes, TryGetError};
use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error is the codec and client error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("buffer too short: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },

    /// The first byte was not the SOCKS6 version. `consumed` holds every
    /// byte read so far so the caller can answer an older protocol.
    #[error("protocol version mismatch: got {version:#04x}")]
    VersionMismatch { version: u8, consumed: Vec<u8> },

    #[error("address type {0:#04x} not supported")]
    AddressTypeNotSupport(u8),

    #[error("{field} value {value:#x} out of range")]
    EnumOutOfRange { field: &'static str, value: u32 },

    #[error("option too long: {0} bytes")]
    OptionTooLong(usize),

    #[error("non-zero padding")]
    NonZeroPadding,

    /// Well-formed but non-conformant option body. `partial` keeps the
    /// option when the parser could still make sense of it.
    #[error("option kind {kind} violates protocol: {source}")]
    ProtocolPolice {
        kind: u16,
        partial: Option<Box<SocksOption>>,
        #[source]
        source: Box<Error>,
    },

    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    #[error("invalid address {0:?}: {1}")]
    InvalidAddress(String, String),

    #[error("authentication failed (method {0:#04x})")]
    AuthenticationFailed(u8),

    #[error("session rejected by server")]
    SessionInvalid,

    #[error("idempotence token rejected by server")]
    IdempotenceRejected,

    #[error("operation failed: {0}")]
    OperationFailed(ReplyCode),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

impl Error {
    /// is_protocol_police reports whether the error is a protocol violation
    /// that callers may choose to downgrade to a warning
    pub fn is_protocol_police(&self) -> bool {
        matches!(self, Error::ProtocolPolice { .. })
    }

    pub(crate) fn short(need: usize, have: usize) -> Self {
        Error::ShortBuffer { need, have }
    }
}

impl From<TryGetError> for Error {
    fn from(e: TryGetError) -> Self {
        Error::short(e.requested, e.available)
    }
}

/// take_bytes splits `n` bytes off the front of `buf`
pub(crate) fn take_bytes(buf: &mut impl Buf, n: usize) -> Result<Bytes> {
    if buf.remaining() < n {
        return Err(Error::short(n, buf.remaining()));
    }
    Ok(buf.copy_to_bytes(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reads_report_what_was_missing() {
        let mut buf: &[u8] = &[1, 2, 3];
        let err = Error::from(buf.try_get_u32().unwrap_err());
        assert!(matches!(err, Error::ShortBuffer { need: 4, have: 3 }));
        // a failed read leaves the cursor where it was
        assert_eq!(buf.len(), 3);

        assert_eq!(&take_bytes(&mut buf, 2).unwrap()[..], &[1, 2]);
        assert_eq!(buf, &[3][..]);
        assert!(matches!(
            take_bytes(&mut buf, 2),
            Err(Error::ShortBuffer { need: 2, have: 1 })
        ));
    }
}
