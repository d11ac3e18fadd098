//! Drop guards.

/// Guard returned by [`defer`]. Runs its closure exactly once, when dropped.
#[must_use = "`Defer` runs its closure when dropped; bind it to a named variable"]
pub(crate) struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}

/// Returns a guard that runs `cb` when it goes out of scope, including during unwinding.
///
/// Used to restore thread-local state and to log thread exit.
pub(crate) fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer(Some(cb))
}
