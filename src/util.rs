/// Defer runs a cleanup closure when dropped, unless disarmed first
#[must_use = "the cleanup runs as soon as the guard is dropped"]
pub struct Defer<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> Defer<F> {
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// disarm cancels the cleanup
    pub fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}
