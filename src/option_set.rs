use crate::error::{Error, Result};
use crate::options::{OptionData, SocksOption, kind, parse_option_from};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

/// MAX_OPTIONS_LEN is the largest option block a message can carry
pub const MAX_OPTIONS_LEN: usize = u16::MAX as usize;

/// OptionSet is an ordered multiset of options with a by-kind index and a
/// memoised wire form
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    list: Vec<SocksOption>,
    per_kind: HashMap<u16, Vec<usize>>,
    cache: OnceLock<Vec<u8>>,
}

impl PartialEq for OptionSet {
    fn eq(&self, other: &Self) -> bool {
        self.list == other.list
    }
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, option: SocksOption) {
        self.per_kind
            .entry(option.kind)
            .or_default()
            .push(self.list.len());
        self.list.push(option);
        self.cache = OnceLock::new();
    }

    /// add_data adds an option whose kind follows from its payload
    pub fn add_data(&mut self, data: OptionData) {
        self.add(SocksOption::new(data));
    }

    pub fn add_many(&mut self, options: impl IntoIterator<Item = SocksOption>) {
        for option in options {
            self.add(option);
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocksOption> {
        self.list.iter()
    }

    /// marshal returns the concatenated options in insertion order
    ///
    /// # Panics
    ///
    /// Panics when the block exceeds the 16-bit length of the enclosing
    /// message.
    pub fn marshal(&self) -> &[u8] {
        self.cache.get_or_init(|| {
            let mut buf = Vec::new();
            for option in &self.list {
                buf.extend_from_slice(&option.marshal());
            }
            assert!(
                buf.len() <= MAX_OPTIONS_LEN,
                "option block too long: {}",
                buf.len()
            );
            buf
        })
    }

    /// get_kind returns every option of `kind`, in insertion order
    pub fn get_kind(&self, kind: u16) -> impl Iterator<Item = &SocksOption> {
        self.per_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .map(move |&i| &self.list[i])
    }

    /// get_kind_f is get_kind filtered by a predicate on the payload
    pub fn get_kind_f<'a, F>(&'a self, kind: u16, f: F) -> impl Iterator<Item = &'a SocksOption>
    where
        F: Fn(&OptionData) -> bool + 'a,
    {
        self.get_kind(kind).filter(move |o| f(&o.data))
    }

    /// get_data returns the payload of the first option of `kind`
    pub fn get_data(&self, kind: u16) -> Option<&OptionData> {
        self.get_kind(kind).next().map(|o| &o.data)
    }

    /// get_data_f returns the first payload of `kind` that matches `f`
    pub fn get_data_f<F>(&self, kind: u16, f: F) -> Option<&OptionData>
    where
        F: Fn(&OptionData) -> bool,
    {
        self.get_kind(kind).map(|o| &o.data).find(|&d| f(d))
    }

    pub fn has(&self, kind: u16) -> bool {
        self.per_kind.contains_key(&kind)
    }

    /// parse decodes an option block of exactly `limit` bytes from the
    /// front of `buf`. Protocol violations fail the whole block.
    pub fn parse(buf: &mut &[u8], limit: usize) -> Result<Self> {
        Self::parse_with(buf, limit, false)
    }

    /// parse_lenient is parse, except protocol violations with a usable
    /// partial option are logged and kept
    pub fn parse_lenient(buf: &mut &[u8], limit: usize) -> Result<Self> {
        Self::parse_with(buf, limit, true)
    }

    fn parse_with(buf: &mut &[u8], limit: usize, lenient: bool) -> Result<Self> {
        if limit > MAX_OPTIONS_LEN {
            return Err(Error::OptionTooLong(limit));
        }
        if buf.len() < limit {
            return Err(Error::short(limit, buf.len()));
        }
        let (mut block, rest) = buf.split_at(limit);
        *buf = rest;

        let mut set = OptionSet::new();
        while !block.is_empty() {
            match parse_option_from(&mut block) {
                Ok(option) => set.add(option),
                Err(Error::ProtocolPolice {
                    kind,
                    partial: Some(option),
                    source,
                }) if lenient => {
                    warn!("keeping non-conformant option kind {kind}: {source}");
                    set.add(*option);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(set)
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        match self.get_data(kind::SESSION_ID) {
            Some(OptionData::SessionId(id)) => Some(id),
            _ => None,
        }
    }

    /// advertisement returns the advertised method ids and the
    /// initial data length
    pub fn advertisement(&self) -> Option<(&[u8], u16)> {
        match self.get_data(kind::AUTH_METHOD_ADVERTISEMENT) {
            Some(OptionData::AuthMethodAdvertisement {
                initial_data_len,
                methods,
            }) => Some((methods, *initial_data_len)),
            _ => None,
        }
    }

    pub fn method_selection(&self) -> Option<u8> {
        match self.get_data(kind::AUTH_METHOD_SELECTION) {
            Some(OptionData::AuthMethodSelection(m)) => Some(*m),
            _ => None,
        }
    }

    /// auth_data returns the authentication data addressed to `method`
    pub fn auth_data(&self, method: u8) -> Option<&[u8]> {
        match self.get_data_f(kind::AUTH_DATA, |d| {
            matches!(d, OptionData::AuthData { method: m, .. } if *m == method)
        }) {
            Some(OptionData::AuthData { data, .. }) => Some(data),
            _ => None,
        }
    }

    pub fn token_request(&self) -> Option<u32> {
        match self.get_data(kind::TOKEN_REQUEST) {
            Some(OptionData::TokenRequest(size)) => Some(*size),
            _ => None,
        }
    }

    pub fn idempotence_window(&self) -> Option<(u32, u32)> {
        match self.get_data(kind::IDEMPOTENCE_WINDOW) {
            Some(OptionData::IdempotenceWindow { base, size }) => Some((*base, *size)),
            _ => None,
        }
    }

    pub fn idempotence_expenditure(&self) -> Option<u32> {
        match self.get_data(kind::IDEMPOTENCE_EXPENDITURE) {
            Some(OptionData::IdempotenceExpenditure(token)) => Some(*token),
            _ => None,
        }
    }
}

impl FromIterator<SocksOption> for OptionSet {
    fn from_iter<I: IntoIterator<Item = SocksOption>>(iter: I) -> Self {
        let mut set = OptionSet::new();
        set.add_many(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack_options::{StackOption, StackOptionData};

    fn sample() -> OptionSet {
        let mut set = OptionSet::new();
        set.add_data(OptionData::SessionRequest);
        set.add_data(OptionData::AuthData {
            method: 2,
            data: vec![1, 1, b'u', 1, b'p'],
        });
        set.add_data(OptionData::AuthData {
            method: 7,
            data: vec![7],
        });
        set.add_data(OptionData::TokenRequest(32));
        set
    }

    #[test]
    fn marshal_tracks_mutations() {
        let mut set = sample();
        let first = set.marshal().to_vec();
        let expected: Vec<u8> = set.iter().flat_map(|o| o.marshal()).collect();
        assert_eq!(first, expected);

        set.add(StackOption::new(true, false, StackOptionData::Ttl(9)).into_option());
        let second = set.marshal().to_vec();
        let expected: Vec<u8> = set.iter().flat_map(|o| o.marshal()).collect();
        assert_eq!(second, expected);
        assert!(second.len() > first.len());
    }

    #[test]
    fn lookups_by_kind() {
        let set = sample();
        assert_eq!(set.get_kind(kind::AUTH_DATA).count(), 2);
        assert_eq!(set.auth_data(7), Some(&[7u8][..]));
        assert!(set.auth_data(3).is_none());
        assert_eq!(set.token_request(), Some(32));
        assert!(set.has(kind::SESSION_REQUEST));
        assert!(set.session_id().is_none());
    }

    #[test]
    fn parse_consumes_exactly_the_block() {
        let set = sample();
        let mut wire = set.marshal().to_vec();
        wire.extend_from_slice(&[0xaa, 0xbb]);
        let mut buf = wire.as_slice();
        let parsed = OptionSet::parse(&mut buf, set.marshal().len()).unwrap();
        assert_eq!(buf, &[0xaa, 0xbb]);
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed.marshal(), set.marshal());
    }

    #[test]
    fn parse_rejects_oversized_limits() {
        let mut buf = &[][..];
        assert!(matches!(
            OptionSet::parse(&mut buf, 70_000),
            Err(Error::OptionTooLong(70_000))
        ));
    }

    #[test]
    fn lenient_parse_keeps_partial_options() {
        // stack option with no leg bits set
        let wire = [0, 1, 0, 8, 1, 3, 64, 0];
        assert!(OptionSet::parse(&mut &wire[..], wire.len()).is_err());
        let set = OptionSet::parse_lenient(&mut &wire[..], wire.len()).unwrap();
        assert_eq!(set.len(), 1);
    }
}
