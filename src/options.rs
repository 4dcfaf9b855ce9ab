//! Single-option codec
//!
//! Every option is framed as `kind(u16) length(u16) data`, where `length`
//! counts the 4-byte header. Payloads of known kinds are decoded by a
//! process-wide parser table; unknown kinds pass through as raw bytes.

use crate::error::{Error, Result, take_bytes};
use crate::stack_options::StackOption;
use bytes::{Buf, BufMut};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Option kinds
pub mod kind {
    pub const STACK: u16 = 1;
    pub const AUTH_METHOD_ADVERTISEMENT: u16 = 2;
    pub const AUTH_METHOD_SELECTION: u16 = 3;
    pub const AUTH_DATA: u16 = 4;
    pub const SESSION_REQUEST: u16 = 5;
    pub const SESSION_ID: u16 = 6;
    pub const SESSION_OK: u16 = 8;
    pub const SESSION_INVALID: u16 = 9;
    pub const SESSION_TEARDOWN: u16 = 10;
    pub const TOKEN_REQUEST: u16 = 11;
    pub const IDEMPOTENCE_WINDOW: u16 = 12;
    pub const IDEMPOTENCE_EXPENDITURE: u16 = 13;
    pub const IDEMPOTENCE_ACCEPTED: u16 = 14;
    pub const IDEMPOTENCE_REJECTED: u16 = 15;
}

/// OPTION_HEADER_LEN is the size of `kind` plus `length`
pub const OPTION_HEADER_LEN: usize = 4;

/// OptionPayload lets a registered parser return a type this crate does
/// not know about
pub trait OptionPayload: fmt::Debug + Send + Sync {
    fn marshal(&self) -> Vec<u8>;
    fn as_any(&self) -> &dyn Any;
}

/// OptionData is the decoded payload of an option
#[derive(Debug, Clone)]
pub enum OptionData {
    Stack(StackOption),
    AuthMethodAdvertisement {
        initial_data_len: u16,
        methods: Vec<u8>,
    },
    AuthMethodSelection(u8),
    AuthData {
        method: u8,
        data: Vec<u8>,
    },
    SessionRequest,
    SessionId(Vec<u8>),
    SessionOk,
    SessionInvalid,
    SessionTeardown,
    TokenRequest(u32),
    IdempotenceWindow {
        base: u32,
        size: u32,
    },
    IdempotenceExpenditure(u32),
    IdempotenceAccepted,
    IdempotenceRejected,
    Raw(Vec<u8>),
    Custom(Arc<dyn OptionPayload>),
}

impl PartialEq for OptionData {
    fn eq(&self, other: &Self) -> bool {
        use OptionData::*;
        match (self, other) {
            (Stack(a), Stack(b)) => a == b,
            (
                AuthMethodAdvertisement {
                    initial_data_len: a,
                    methods: am,
                },
                AuthMethodAdvertisement {
                    initial_data_len: b,
                    methods: bm,
                },
            ) => a == b && am == bm,
            (AuthMethodSelection(a), AuthMethodSelection(b)) => a == b,
            (AuthData { method: a, data: ad }, AuthData { method: b, data: bd }) => {
                a == b && ad == bd
            }
            (SessionId(a), SessionId(b)) => a == b,
            (TokenRequest(a), TokenRequest(b)) => a == b,
            (
                IdempotenceWindow { base: a, size: asz },
                IdempotenceWindow { base: b, size: bsz },
            ) => a == b && asz == bsz,
            (IdempotenceExpenditure(a), IdempotenceExpenditure(b)) => a == b,
            (Raw(a), Raw(b)) => a == b,
            (Custom(a), Custom(b)) => a.marshal() == b.marshal(),
            (SessionRequest, SessionRequest)
            | (SessionOk, SessionOk)
            | (SessionInvalid, SessionInvalid)
            | (SessionTeardown, SessionTeardown)
            | (IdempotenceAccepted, IdempotenceAccepted)
            | (IdempotenceRejected, IdempotenceRejected) => true,
            _ => false,
        }
    }
}

impl OptionData {
    /// kind returns the option kind implied by the payload. Raw and custom
    /// payloads carry no kind of their own.
    pub fn kind(&self) -> Option<u16> {
        let k = match self {
            OptionData::Stack(_) => kind::STACK,
            OptionData::AuthMethodAdvertisement { .. } => kind::AUTH_METHOD_ADVERTISEMENT,
            OptionData::AuthMethodSelection(_) => kind::AUTH_METHOD_SELECTION,
            OptionData::AuthData { .. } => kind::AUTH_DATA,
            OptionData::SessionRequest => kind::SESSION_REQUEST,
            OptionData::SessionId(_) => kind::SESSION_ID,
            OptionData::SessionOk => kind::SESSION_OK,
            OptionData::SessionInvalid => kind::SESSION_INVALID,
            OptionData::SessionTeardown => kind::SESSION_TEARDOWN,
            OptionData::TokenRequest(_) => kind::TOKEN_REQUEST,
            OptionData::IdempotenceWindow { .. } => kind::IDEMPOTENCE_WINDOW,
            OptionData::IdempotenceExpenditure(_) => kind::IDEMPOTENCE_EXPENDITURE,
            OptionData::IdempotenceAccepted => kind::IDEMPOTENCE_ACCEPTED,
            OptionData::IdempotenceRejected => kind::IDEMPOTENCE_REJECTED,
            OptionData::Raw(_) | OptionData::Custom(_) => return None,
        };
        Some(k)
    }

    /// marshal produces the payload, padded so the whole option stays
    /// 4-byte aligned. Raw and custom payloads are written as-is.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            OptionData::Stack(s) => s.write_payload(&mut buf),
            OptionData::AuthMethodAdvertisement {
                initial_data_len,
                methods,
            } => {
                buf.put_u16(*initial_data_len);
                let mut sorted: Vec<u8> = methods.iter().copied().filter(|&m| m != 0).collect();
                sorted.sort_unstable();
                sorted.dedup();
                buf.put_slice(&sorted);
                pad4(&mut buf);
            }
            OptionData::AuthMethodSelection(method) => {
                buf.put_u8(*method);
                buf.put_bytes(0, 3);
            }
            OptionData::AuthData { method, data } => {
                buf.put_u8(*method);
                buf.put_slice(data);
                pad4(&mut buf);
            }
            OptionData::SessionId(id) => {
                buf.put_slice(id);
                pad4(&mut buf);
            }
            OptionData::TokenRequest(size) => buf.put_u32(*size),
            OptionData::IdempotenceWindow { base, size } => {
                buf.put_u32(*base);
                buf.put_u32(*size);
            }
            OptionData::IdempotenceExpenditure(token) => buf.put_u32(*token),
            OptionData::SessionRequest
            | OptionData::SessionOk
            | OptionData::SessionInvalid
            | OptionData::SessionTeardown
            | OptionData::IdempotenceAccepted
            | OptionData::IdempotenceRejected => {}
            OptionData::Raw(raw) => buf.put_slice(raw),
            OptionData::Custom(c) => buf.put_slice(&c.marshal()),
        }
        buf
    }
}

/// pad4 zero-pads a payload so that payload plus option header is a
/// multiple of 4
pub(crate) fn pad4(buf: &mut Vec<u8>) {
    let rem = buf.len() % 4;
    if rem != 0 {
        buf.put_bytes(0, 4 - rem);
    }
}

/// SocksOption is one `{kind, length, data}` option
#[derive(Debug, Clone, PartialEq)]
pub struct SocksOption {
    pub kind: u16,
    pub data: OptionData,
}

impl SocksOption {
    /// new builds an option whose kind follows from the payload
    ///
    /// # Panics
    ///
    /// Panics for raw and custom payloads; use `with_kind` for those.
    pub fn new(data: OptionData) -> Self {
        let kind = data
            .kind()
            .expect("raw and custom option data need an explicit kind");
        Self { kind, data }
    }

    pub fn with_kind(kind: u16, data: OptionData) -> Self {
        Self { kind, data }
    }

    /// marshal produces the framed option
    ///
    /// # Panics
    ///
    /// Panics when the payload does not fit the 16-bit length field.
    pub fn marshal(&self) -> Vec<u8> {
        let payload = self.data.marshal();
        let length = OPTION_HEADER_LEN + payload.len();
        assert!(length <= u16::MAX as usize, "option payload too long: {length}");
        let mut buf = Vec::with_capacity(length);
        buf.put_u16(self.kind);
        buf.put_u16(length as u16);
        buf.put_slice(&payload);
        buf
    }
}

/// OptionParser decodes the payload of one option kind
pub type OptionParser = fn(&[u8]) -> Result<OptionData>;

static OPTION_PARSERS: LazyLock<RwLock<HashMap<u16, OptionParser>>> =
    LazyLock::new(|| RwLock::new(default_option_parsers()));

fn default_option_parsers() -> HashMap<u16, OptionParser> {
    let mut m: HashMap<u16, OptionParser> = HashMap::new();
    m.insert(kind::STACK, parse_stack);
    m.insert(kind::AUTH_METHOD_ADVERTISEMENT, parse_advertisement);
    m.insert(kind::AUTH_METHOD_SELECTION, parse_selection);
    m.insert(kind::AUTH_DATA, parse_auth_data);
    m.insert(kind::SESSION_REQUEST, |_| Ok(OptionData::SessionRequest));
    m.insert(kind::SESSION_ID, |d| Ok(OptionData::SessionId(d.to_vec())));
    m.insert(kind::SESSION_OK, |_| Ok(OptionData::SessionOk));
    m.insert(kind::SESSION_INVALID, |_| Ok(OptionData::SessionInvalid));
    m.insert(kind::SESSION_TEARDOWN, |_| Ok(OptionData::SessionTeardown));
    m.insert(kind::TOKEN_REQUEST, |mut d| {
        Ok(OptionData::TokenRequest(d.try_get_u32()?))
    });
    m.insert(kind::IDEMPOTENCE_WINDOW, |mut d| {
        let base = d.try_get_u32()?;
        let size = d.try_get_u32()?;
        Ok(OptionData::IdempotenceWindow { base, size })
    });
    m.insert(kind::IDEMPOTENCE_EXPENDITURE, |mut d| {
        Ok(OptionData::IdempotenceExpenditure(d.try_get_u32()?))
    });
    m.insert(kind::IDEMPOTENCE_ACCEPTED, |_| Ok(OptionData::IdempotenceAccepted));
    m.insert(kind::IDEMPOTENCE_REJECTED, |_| Ok(OptionData::IdempotenceRejected));
    m
}

/// set_option_parser registers a parser for `kind`, or removes it when
/// `parser` is None so the kind falls back to raw bytes. Call it during
/// process init, before any server starts.
pub fn set_option_parser(kind: u16, parser: Option<OptionParser>) {
    let mut table = OPTION_PARSERS.write();
    match parser {
        Some(p) => {
            table.insert(kind, p);
        }
        None => {
            table.remove(&kind);
        }
    }
}

fn parse_stack(data: &[u8]) -> Result<OptionData> {
    StackOption::parse_payload(data).map(OptionData::Stack)
}

fn parse_advertisement(mut data: &[u8]) -> Result<OptionData> {
    let initial_data_len = data.try_get_u16()?;
    let methods: Vec<u8> = data.iter().copied().filter(|&m| m != 0).collect();
    let ascending = methods.windows(2).all(|w| w[0] < w[1]);
    let parsed = OptionData::AuthMethodAdvertisement {
        initial_data_len,
        methods,
    };
    if !ascending {
        return Err(Error::ProtocolPolice {
            kind: kind::AUTH_METHOD_ADVERTISEMENT,
            partial: Some(Box::new(SocksOption::new(parsed))),
            source: Box::new(Error::EnumOutOfRange {
                field: "method order",
                value: 0,
            }),
        });
    }
    Ok(parsed)
}

fn parse_selection(mut data: &[u8]) -> Result<OptionData> {
    Ok(OptionData::AuthMethodSelection(data.try_get_u8()?))
}

fn parse_auth_data(mut data: &[u8]) -> Result<OptionData> {
    let method = data.try_get_u8()?;
    Ok(OptionData::AuthData {
        method,
        data: data.to_vec(),
    })
}

/// parse_option_from consumes one option from the front of `buf`
pub fn parse_option_from(buf: &mut &[u8]) -> Result<SocksOption> {
    let kind = buf.try_get_u16()?;
    let length = buf.try_get_u16()? as usize;
    if length < OPTION_HEADER_LEN {
        return Err(Error::EnumOutOfRange {
            field: "option length",
            value: length as u32,
        });
    }
    let payload = take_bytes(buf, length - OPTION_HEADER_LEN)?;

    // copy the fn pointer out so no lock is held while parsing
    let parser = OPTION_PARSERS.read().get(&kind).copied();
    let data = match parser {
        Some(parse) => parse(&payload).map_err(|e| police(kind, e))?,
        None => OptionData::Raw(payload.to_vec()),
    };
    let option = SocksOption { kind, data };

    if length % 4 != 0 {
        return Err(Error::ProtocolPolice {
            kind,
            partial: Some(Box::new(option)),
            source: Box::new(Error::EnumOutOfRange {
                field: "option alignment",
                value: length as u32,
            }),
        });
    }
    Ok(option)
}

/// police tags value-level violations raised by payload parsers
fn police(kind: u16, e: Error) -> Error {
    match e {
        Error::EnumOutOfRange { .. } | Error::NonZeroPadding => Error::ProtocolPolice {
            kind,
            partial: None,
            source: Box::new(e),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack_options::{StackOptionData, LEVEL_IP};

    fn round_trip(data: OptionData) {
        let option = SocksOption::new(data);
        let wire = option.marshal();
        assert_eq!(wire.len() % 4, 0, "{option:?} is not aligned");
        let mut buf = wire.as_slice();
        let parsed = parse_option_from(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(parsed.kind, option.kind);
        assert_eq!(parsed.data, option.data);
    }

    #[test]
    fn known_kinds_round_trip() {
        round_trip(OptionData::AuthMethodAdvertisement {
            initial_data_len: 12,
            methods: vec![2, 5],
        });
        round_trip(OptionData::AuthMethodSelection(2));
        round_trip(OptionData::SessionRequest);
        round_trip(OptionData::SessionId(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        round_trip(OptionData::TokenRequest(64));
        round_trip(OptionData::IdempotenceWindow { base: 7, size: 64 });
        round_trip(OptionData::IdempotenceExpenditure(9));
        round_trip(OptionData::IdempotenceRejected);
        round_trip(OptionData::Stack(StackOption::new(
            true,
            false,
            StackOptionData::Ttl(64),
        )));
    }

    #[test]
    fn advertisement_layout() {
        let option = SocksOption::new(OptionData::AuthMethodAdvertisement {
            initial_data_len: 0,
            methods: vec![2],
        });
        assert_eq!(option.marshal(), vec![0, 2, 0, 8, 0, 0, 2, 0]);
    }

    #[test]
    fn parsed_option_owns_its_bytes() {
        let mut wire = SocksOption::new(OptionData::SessionId(vec![9, 9, 9, 9])).marshal();
        let parsed = parse_option_from(&mut wire.as_slice()).unwrap();
        for b in wire.iter_mut() {
            *b = 0xee;
        }
        assert_eq!(parsed.data, OptionData::SessionId(vec![9, 9, 9, 9]));
    }

    #[test]
    fn unknown_kinds_are_raw() {
        let wire = [0x12, 0x34, 0, 8, 1, 2, 3, 4];
        let parsed = parse_option_from(&mut &wire[..]).unwrap();
        assert_eq!(parsed.kind, 0x1234);
        assert_eq!(parsed.data, OptionData::Raw(vec![1, 2, 3, 4]));
        assert_eq!(parsed.marshal(), wire);
    }

    #[test]
    fn bad_lengths_are_rejected() {
        let too_small = [0, 5, 0, 3];
        assert!(parse_option_from(&mut &too_small[..]).is_err());

        let truncated = [0, 11, 0, 8, 0, 0];
        assert!(matches!(
            parse_option_from(&mut &truncated[..]),
            Err(Error::ShortBuffer { .. })
        ));

        let misaligned = [0, 5, 0, 5, 0];
        match parse_option_from(&mut &misaligned[..]) {
            Err(Error::ProtocolPolice { partial, .. }) => {
                assert_eq!(partial.unwrap().data, OptionData::SessionRequest)
            }
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn bad_booleans_are_protocol_violations() {
        // stack option, client leg, IP level, HappyEyeball, value 3
        let wire = [0, 1, 0, 8, 0x40 | LEVEL_IP, 2, 3, 0];
        let err = parse_option_from(&mut &wire[..]).unwrap_err();
        assert!(err.is_protocol_police(), "{err:?}");
    }

    #[test]
    fn parsers_can_be_replaced_and_removed() {
        const KIND: u16 = 0x7e57;
        fn reject(_: &[u8]) -> Result<OptionData> {
            Err(Error::NonZeroPadding)
        }

        let wire = [0x7e, 0x57, 0, 4];
        set_option_parser(KIND, Some(reject));
        assert!(parse_option_from(&mut &wire[..]).is_err());

        set_option_parser(KIND, None);
        let parsed = parse_option_from(&mut &wire[..]).unwrap();
        assert_eq!(parsed.data, OptionData::Raw(vec![]));
    }
}
