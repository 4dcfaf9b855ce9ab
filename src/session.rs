//! Server-side sessions and idempotence token windows

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// MAX_WINDOW_SIZE caps how many tokens one window may track
pub const MAX_WINDOW_SIZE: u32 = 1 << 20;

/// WindowAllocation is the answer to a token request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAllocation {
    pub accepted: bool,
    pub base: u32,
    pub size: u32,
}

/// TokenWindow is a sliding bitmap of spent tokens. Token arithmetic is
/// modulo 2^32, so the token space is circular.
#[derive(Debug, Default)]
pub struct TokenWindow {
    base: u32,
    len: u32,
    bits: Vec<u8>,
    popcount: u32,
    allocated: bool,
}

impl TokenWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn popcount(&self) -> u32 {
        self.popcount
    }

    fn bit(&self, i: u32) -> bool {
        self.bits[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    fn set_bit(&mut self, i: u32) {
        self.bits[(i / 8) as usize] |= 1 << (i % 8);
    }

    /// allocate_window hands out the first window at a random base, then
    /// slides it forward by whole bytes in proportion to the spent tokens.
    /// A window whose first token is still unspent is not rotated.
    pub fn allocate_window(&mut self, size: u32) -> WindowAllocation {
        let size = size.min(MAX_WINDOW_SIZE);
        if !self.allocated {
            // an empty first window would refuse every later rotation
            if size == 0 {
                return WindowAllocation {
                    accepted: false,
                    base: self.base,
                    size: 0,
                };
            }
            self.allocated = true;
            self.base = rand::random::<u32>();
            self.len = size;
            self.bits = vec![0u8; size.div_ceil(8) as usize];
            self.popcount = 0;
            return WindowAllocation {
                accepted: true,
                base: self.base,
                size: self.len,
            };
        }

        if self.len == 0 || !self.bit(0) {
            return WindowAllocation {
                accepted: false,
                base: self.base,
                size: self.len,
            };
        }

        let shift_bytes = self.popcount.div_ceil(8).min(self.len / 8);
        self.bits.drain(..shift_bytes as usize);
        self.base = self.base.wrapping_add(shift_bytes * 8);
        self.len = self.len.max(size);
        self.bits.resize(self.len.div_ceil(8) as usize, 0);
        self.popcount = self.bits.iter().map(|b| b.count_ones()).sum();

        WindowAllocation {
            accepted: true,
            base: self.base,
            size: self.len,
        }
    }

    /// check_token spends `token`. Tokens outside the window and tokens
    /// already spent are rejected.
    pub fn check_token(&mut self, token: u32) -> bool {
        if !self.allocated {
            return false;
        }
        let offset = token.wrapping_sub(self.base);
        if offset >= self.len || self.bit(offset) {
            return false;
        }
        self.set_bit(offset);
        self.popcount += 1;
        true
    }
}

/// Session is the post-authentication state shared by every stream that
/// presents the same session id
#[derive(Debug)]
pub struct Session {
    id: Vec<u8>,
    window: Mutex<TokenWindow>,
    conn_count: AtomicU32,
    last_active: Mutex<Instant>,
}

impl Session {
    fn new(id: Vec<u8>) -> Self {
        Self {
            id,
            window: Mutex::new(TokenWindow::new()),
            conn_count: AtomicU32::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn allocate_window(&self, size: u32) -> WindowAllocation {
        self.window.lock().allocate_window(size)
    }

    pub fn check_token(&self, token: u32) -> bool {
        self.window.lock().check_token(token)
    }

    pub fn conn_count(&self) -> u32 {
        self.conn_count.load(Ordering::Acquire)
    }

    /// attach counts a stream as using the session until the guard drops
    pub fn attach(self: &Arc<Self>) -> SessionGuard {
        self.conn_count.fetch_add(1, Ordering::AcqRel);
        self.touch();
        SessionGuard(Arc::clone(self))
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

/// SessionGuard keeps a session's connection count up while alive
#[derive(Debug)]
pub struct SessionGuard(Arc<Session>);

impl SessionGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.0
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.conn_count.fetch_sub(1, Ordering::AcqRel);
        self.0.touch();
    }
}

/// SessionStore owns every live session, keyed by id
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<Vec<u8>, Arc<Session>>,
    id_len: usize,
}

impl SessionStore {
    /// new creates a store handing out ids of `id_len` bytes, rounded up
    /// to a multiple of 4 so ids never need padding on the wire
    pub fn new(id_len: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            id_len: id_len.max(4).div_ceil(4) * 4,
        }
    }

    pub fn create(&self) -> Arc<Session> {
        loop {
            let mut id = vec![0u8; self.id_len];
            rand::rng().fill_bytes(&mut id);
            if let Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                let session = Arc::new(Session::new(id));
                slot.insert(Arc::clone(&session));
                debug!("session created, {} live", self.sessions.len());
                return session;
            }
        }
    }

    pub fn get(&self, id: &[u8]) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, id: &[u8]) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// cleanup drops sessions with no attached stream that have been idle
    /// longer than `idle`, returning how many were removed
    pub fn cleanup(&self, idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.conn_count() > 0 || s.idle_for() < idle);
        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_window_accepts_each_token_once() {
        let mut w = TokenWindow::new();
        let alloc = w.allocate_window(64);
        assert!(alloc.accepted);
        assert_eq!(alloc.size, 64);
        let base = alloc.base;

        for i in 0..64u32 {
            assert!(w.check_token(base.wrapping_add(i)), "token {i}");
        }
        for i in 0..64u32 {
            assert!(!w.check_token(base.wrapping_add(i)), "replayed token {i}");
        }
        assert!(!w.check_token(base.wrapping_add(64)));
        assert!(!w.check_token(base.wrapping_sub(1)));
    }

    #[test]
    fn tokens_are_rejected_before_allocation() {
        let mut w = TokenWindow::new();
        assert!(!w.check_token(0));
    }

    #[test]
    fn empty_first_request_leaves_window_unallocated() {
        let mut w = TokenWindow::new();
        assert!(!w.allocate_window(0).accepted);
        assert!(!w.check_token(0));

        let alloc = w.allocate_window(16);
        assert!(alloc.accepted);
        assert_eq!(alloc.size, 16);
        assert!(w.check_token(alloc.base));
    }

    #[test]
    fn rotation_requires_first_token_spent() {
        let mut w = TokenWindow::new();
        let first = w.allocate_window(32);
        assert!(w.check_token(first.base.wrapping_add(5)));

        let again = w.allocate_window(32);
        assert!(!again.accepted);
        assert_eq!(again.base, first.base);
    }

    #[test]
    fn full_window_rotates_by_whole_bytes() {
        for size in [8u32, 20, 64, 100] {
            let mut w = TokenWindow::new();
            let first = w.allocate_window(size);
            for i in 0..size {
                assert!(w.check_token(first.base.wrapping_add(i)));
            }
            let next = w.allocate_window(size);
            assert!(next.accepted);
            let moved = next.base.wrapping_sub(first.base);
            assert_eq!(moved % 8, 0, "size {size}");
            assert!(moved <= size, "size {size}");
            assert!(moved > 0);

            // tokens below the new base are gone, the new ones are fresh
            assert!(!w.check_token(first.base));
            assert!(w.check_token(next.base.wrapping_add(next.size - 1)));
        }
    }

    #[test]
    fn partial_rotation_keeps_spent_suffix() {
        let mut w = TokenWindow::new();
        let first = w.allocate_window(32);
        for i in 0..8 {
            assert!(w.check_token(first.base.wrapping_add(i)));
        }
        assert!(w.check_token(first.base.wrapping_add(20)));

        let next = w.allocate_window(64);
        assert!(next.accepted);
        assert_eq!(next.base, first.base.wrapping_add(16));
        assert_eq!(next.size, 64);
        // token 20 is still spent after the slide
        assert!(!w.check_token(first.base.wrapping_add(20)));
        assert!(w.check_token(next.base.wrapping_add(63)));
    }

    #[test]
    fn window_wraps_around_u32() {
        let mut w = TokenWindow {
            base: u32::MAX - 3,
            len: 16,
            bits: vec![0; 2],
            popcount: 0,
            allocated: true,
        };
        assert!(w.check_token(u32::MAX));
        assert!(w.check_token(5));
        assert!(!w.check_token(12));
    }

    #[test]
    fn store_creates_and_cleans_sessions() {
        let store = SessionStore::new(6);
        let session = store.create();
        assert_eq!(session.id().len(), 8);
        assert!(store.get(session.id()).is_some());

        let guard = session.attach();
        assert_eq!(session.conn_count(), 1);
        assert_eq!(store.cleanup(Duration::ZERO), 0);
        drop(guard);
        assert_eq!(session.conn_count(), 0);
        assert_eq!(store.cleanup(Duration::ZERO), 1);
        assert!(store.is_empty());
    }
}
