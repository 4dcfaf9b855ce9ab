//! Stack options (option kind 1)
//!
//! Payload layout: `{remote-leg:1, client-leg:1, level:6}`, `code`, then a
//! small typed value. Booleans travel as 0x01 (false) / 0x02 (true).

use crate::error::{Error, Result};
use crate::option_set::OptionSet;
use crate::options::{OptionData, SocksOption, kind, pad4};
use bytes::{Buf, BufMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::LazyLock;

pub const LEVEL_IP: u8 = 1;
pub const LEVEL_IPV4: u8 = 2;
pub const LEVEL_IPV6: u8 = 3;
pub const LEVEL_TCP: u8 = 4;
pub const LEVEL_UDP: u8 = 5;

pub const CODE_TOS: u8 = 1;
pub const CODE_HAPPY_EYEBALL: u8 = 2;
pub const CODE_TTL: u8 = 3;
pub const CODE_NO_FRAGMENT: u8 = 4;

pub const CODE_TFO: u8 = 1;
pub const CODE_MULTIPATH: u8 = 2;
pub const CODE_BACKLOG: u8 = 3;

pub const CODE_UDP_ERROR: u8 = 1;
pub const CODE_PORT_PARITY: u8 = 2;

const LEG_REMOTE: u8 = 0x80;
const LEG_CLIENT: u8 = 0x40;
const LEVEL_MASK: u8 = 0x3f;

/// stack_id is the stable `level*256+code` identifier
pub const fn stack_id(level: u8, code: u8) -> u16 {
    (level as u16) << 8 | code as u16
}

pub const ID_TOS: u16 = stack_id(LEVEL_IP, CODE_TOS);
pub const ID_HAPPY_EYEBALL: u16 = stack_id(LEVEL_IP, CODE_HAPPY_EYEBALL);
pub const ID_TTL: u16 = stack_id(LEVEL_IP, CODE_TTL);
pub const ID_NO_FRAGMENT: u16 = stack_id(LEVEL_IP, CODE_NO_FRAGMENT);
pub const ID_TFO: u16 = stack_id(LEVEL_TCP, CODE_TFO);
pub const ID_MULTIPATH: u16 = stack_id(LEVEL_TCP, CODE_MULTIPATH);
pub const ID_BACKLOG: u16 = stack_id(LEVEL_TCP, CODE_BACKLOG);
pub const ID_UDP_ERROR: u16 = stack_id(LEVEL_UDP, CODE_UDP_ERROR);
pub const ID_PORT_PARITY: u16 = stack_id(LEVEL_UDP, CODE_PORT_PARITY);

/// Parity is the requested UDP port parity
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    NoPreference = 0,
    Even = 1,
    Odd = 2,
}

impl Parity {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Parity::NoPreference),
            1 => Some(Parity::Even),
            2 => Some(Parity::Odd),
            _ => None,
        }
    }

    /// of returns the parity of a port number
    pub fn of(port: u16) -> Self {
        if port % 2 == 0 { Parity::Even } else { Parity::Odd }
    }
}

/// PortParity asks for a port of a given parity and optionally for its
/// neighbour to be held in reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortParity {
    pub parity: Parity,
    pub reserve: bool,
}

/// StackOptionData is the typed value of a stack option
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StackOptionData {
    Tos(u8),
    HappyEyeball(bool),
    Ttl(u8),
    NoFragment(bool),
    Tfo(u16),
    Multipath(bool),
    Backlog(u16),
    UdpError(bool),
    PortParity(PortParity),
    Raw { level: u8, code: u8, data: Vec<u8> },
}

impl StackOptionData {
    pub fn level(&self) -> u8 {
        match self {
            StackOptionData::Tos(_)
            | StackOptionData::HappyEyeball(_)
            | StackOptionData::Ttl(_)
            | StackOptionData::NoFragment(_) => LEVEL_IP,
            StackOptionData::Tfo(_) | StackOptionData::Multipath(_) | StackOptionData::Backlog(_) => {
                LEVEL_TCP
            }
            StackOptionData::UdpError(_) | StackOptionData::PortParity(_) => LEVEL_UDP,
            StackOptionData::Raw { level, .. } => *level,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            StackOptionData::Tos(_) => CODE_TOS,
            StackOptionData::HappyEyeball(_) => CODE_HAPPY_EYEBALL,
            StackOptionData::Ttl(_) => CODE_TTL,
            StackOptionData::NoFragment(_) => CODE_NO_FRAGMENT,
            StackOptionData::Tfo(_) => CODE_TFO,
            StackOptionData::Multipath(_) => CODE_MULTIPATH,
            StackOptionData::Backlog(_) => CODE_BACKLOG,
            StackOptionData::UdpError(_) => CODE_UDP_ERROR,
            StackOptionData::PortParity(_) => CODE_PORT_PARITY,
            StackOptionData::Raw { code, .. } => *code,
        }
    }

    pub fn id(&self) -> u16 {
        stack_id(self.level(), self.code())
    }

    fn write_value(&self, buf: &mut Vec<u8>) {
        match self {
            StackOptionData::Tos(v) | StackOptionData::Ttl(v) => buf.put_u8(*v),
            StackOptionData::HappyEyeball(b)
            | StackOptionData::NoFragment(b)
            | StackOptionData::Multipath(b)
            | StackOptionData::UdpError(b) => buf.put_u8(encode_bool(*b)),
            StackOptionData::Tfo(v) | StackOptionData::Backlog(v) => buf.put_u16(*v),
            StackOptionData::PortParity(p) => {
                buf.put_u8(p.parity as u8);
                buf.put_u8(encode_bool(p.reserve));
            }
            StackOptionData::Raw { data, .. } => buf.put_slice(data),
        }
    }
}

fn encode_bool(b: bool) -> u8 {
    if b { 0x02 } else { 0x01 }
}

fn decode_bool(byte: u8) -> Result<bool> {
    match byte {
        0x01 => Ok(false),
        0x02 => Ok(true),
        other => Err(Error::EnumOutOfRange {
            field: "boolean",
            value: other as u32,
        }),
    }
}

/// StackOption is the payload of a kind-1 option
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackOption {
    pub remote_leg: bool,
    pub client_leg: bool,
    data: StackOptionData,
}

impl StackOption {
    pub fn new(remote_leg: bool, client_leg: bool, data: StackOptionData) -> Self {
        Self {
            remote_leg,
            client_leg,
            data,
        }
    }

    pub fn level(&self) -> u8 {
        self.data.level()
    }

    pub fn code(&self) -> u8 {
        self.data.code()
    }

    pub fn id(&self) -> u16 {
        self.data.id()
    }

    pub fn get_data(&self) -> &StackOptionData {
        &self.data
    }

    /// set_data replaces the value; level and code follow the new value
    pub fn set_data(&mut self, data: StackOptionData) {
        self.data = data;
    }

    pub fn into_option(self) -> SocksOption {
        SocksOption::new(OptionData::Stack(self))
    }

    pub(crate) fn write_payload(&self, buf: &mut Vec<u8>) {
        let mut head = self.level() & LEVEL_MASK;
        if self.remote_leg {
            head |= LEG_REMOTE;
        }
        if self.client_leg {
            head |= LEG_CLIENT;
        }
        buf.put_u8(head);
        buf.put_u8(self.code());
        self.data.write_value(buf);
        pad4(buf);
    }

    /// parse_payload decodes the body of a kind-1 option
    pub fn parse_payload(mut data: &[u8]) -> Result<Self> {
        let head = data.try_get_u8()?;
        let code = data.try_get_u8()?;
        let level = head & LEVEL_MASK;
        let id = stack_id(level, code);

        let parser = STACK_PARSERS.read().get(&id).copied();
        let value = match parser {
            Some(parse) => parse(data)?,
            None => StackOptionData::Raw {
                level,
                code,
                data: data.to_vec(),
            },
        };
        let option = StackOption {
            remote_leg: head & LEG_REMOTE != 0,
            client_leg: head & LEG_CLIENT != 0,
            data: value,
        };
        if !option.remote_leg && !option.client_leg {
            return Err(Error::ProtocolPolice {
                kind: kind::STACK,
                partial: Some(Box::new(option.into_option())),
                source: Box::new(Error::EnumOutOfRange {
                    field: "stack option leg",
                    value: 0,
                }),
            });
        }
        Ok(option)
    }
}

/// StackOptionParser decodes the value of one (level, code) pair
pub type StackOptionParser = fn(&[u8]) -> Result<StackOptionData>;

static STACK_PARSERS: LazyLock<RwLock<HashMap<u16, StackOptionParser>>> =
    LazyLock::new(|| RwLock::new(default_stack_parsers()));

fn default_stack_parsers() -> HashMap<u16, StackOptionParser> {
    let mut m: HashMap<u16, StackOptionParser> = HashMap::new();
    m.insert(ID_TOS, |mut d| Ok(StackOptionData::Tos(d.try_get_u8()?)));
    m.insert(ID_HAPPY_EYEBALL, |mut d| {
        Ok(StackOptionData::HappyEyeball(decode_bool(d.try_get_u8()?)?))
    });
    m.insert(ID_TTL, |mut d| Ok(StackOptionData::Ttl(d.try_get_u8()?)));
    m.insert(ID_NO_FRAGMENT, |mut d| {
        Ok(StackOptionData::NoFragment(decode_bool(d.try_get_u8()?)?))
    });
    m.insert(ID_TFO, |mut d| Ok(StackOptionData::Tfo(d.try_get_u16()?)));
    m.insert(ID_MULTIPATH, |mut d| {
        Ok(StackOptionData::Multipath(decode_bool(d.try_get_u8()?)?))
    });
    m.insert(ID_BACKLOG, |mut d| {
        Ok(StackOptionData::Backlog(d.try_get_u16()?))
    });
    m.insert(ID_UDP_ERROR, |mut d| {
        Ok(StackOptionData::UdpError(decode_bool(d.try_get_u8()?)?))
    });
    m.insert(ID_PORT_PARITY, |mut d| {
        let raw = d.try_get_u8()?;
        let parity = Parity::from_byte(raw).ok_or(Error::EnumOutOfRange {
            field: "port parity",
            value: raw as u32,
        })?;
        let reserve = decode_bool(d.try_get_u8()?)?;
        Ok(StackOptionData::PortParity(PortParity { parity, reserve }))
    });
    m
}

/// set_stack_option_parser registers or removes (None) the parser for a
/// (level, code) pair. Call it during process init only.
pub fn set_stack_option_parser(level: u8, code: u8, parser: Option<StackOptionParser>) {
    let mut table = STACK_PARSERS.write();
    let id = stack_id(level, code);
    match parser {
        Some(p) => {
            table.insert(id, p);
        }
        None => {
            table.remove(&id);
        }
    }
}

/// StackOptionInfo is a leg-agnostic map of stack option values keyed by
/// `level*256+code`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackOptionInfo {
    values: HashMap<u16, StackOptionData>,
}

impl StackOptionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: StackOptionData) {
        self.values.insert(data.id(), data);
    }

    pub fn get(&self, id: u16) -> Option<&StackOptionData> {
        self.values.get(&id)
    }

    pub fn remove(&mut self, id: u16) -> Option<StackOptionData> {
        self.values.remove(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StackOptionData> {
        self.values.values()
    }

    pub fn ttl(&self) -> Option<u8> {
        match self.get(ID_TTL) {
            Some(StackOptionData::Ttl(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn tos(&self) -> Option<u8> {
        match self.get(ID_TOS) {
            Some(StackOptionData::Tos(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn no_fragment(&self) -> Option<bool> {
        match self.get(ID_NO_FRAGMENT) {
            Some(StackOptionData::NoFragment(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn backlog(&self) -> Option<u16> {
        match self.get(ID_BACKLOG) {
            Some(StackOptionData::Backlog(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn udp_error(&self) -> Option<bool> {
        match self.get(ID_UDP_ERROR) {
            Some(StackOptionData::UdpError(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn port_parity(&self) -> Option<PortParity> {
        match self.get(ID_PORT_PARITY) {
            Some(StackOptionData::PortParity(p)) => Some(*p),
            _ => None,
        }
    }

    /// from_options splits the stack options of a set into
    /// (client leg, remote leg) maps. Later options win.
    pub fn from_options(options: &OptionSet) -> (Self, Self) {
        let mut client = Self::new();
        let mut remote = Self::new();
        for option in options.get_kind(kind::STACK) {
            if let OptionData::Stack(s) = &option.data {
                if s.client_leg {
                    client.insert(s.get_data().clone());
                }
                if s.remote_leg {
                    remote.insert(s.get_data().clone());
                }
            }
        }
        (client, remote)
    }

    /// combine turns per-leg maps back into wire options, merging a value
    /// into one option with both leg bits when the legs agree
    pub fn combine(client: &Self, remote: &Self) -> Vec<SocksOption> {
        let mut out = Vec::new();
        for (id, value) in &client.values {
            match remote.values.get(id) {
                Some(r) if r == value => {
                    out.push(StackOption::new(true, true, value.clone()).into_option());
                }
                _ => out.push(StackOption::new(false, true, value.clone()).into_option()),
            }
        }
        for (id, value) in &remote.values {
            if client.values.get(id) != Some(value) {
                out.push(StackOption::new(true, false, value.clone()).into_option());
            }
        }
        out
    }
}
