//! Cooperative interruption of a running script.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Handle used to stop one execution context's in-progress run.
///
/// Cloneable and safe to use from any thread. The first [`Interrupter::interrupt`]
/// call wins: its reason becomes the execution's terminating error. Calls
/// after the execution has finished are ignored.
#[derive(Clone, Debug, Default)]
pub struct Interrupter {
    inner: Arc<InterruptState>,
}

#[derive(Debug, Default)]
struct InterruptState {
    reason: OnceLock<String>,
    finished: AtomicBool,
    token: CancellationToken,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the execution stop at its next safe point.
    ///
    /// Returns `true` if this call delivered the interrupt, `false` if the
    /// execution had already finished or another interrupt got there first.
    pub fn interrupt(&self, reason: impl Into<String>) -> bool {
        if self.inner.finished.load(Ordering::Acquire) {
            return false;
        }
        let delivered = self.inner.reason.set(reason.into()).is_ok();
        self.inner.token.cancel();
        delivered
    }

    pub fn reason(&self) -> Option<&str> {
        self.inner.reason.get().map(String::as_str)
    }

    /// Cancelled once an interrupt is delivered; blocking natives wait on it.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Safe-point check for native calls: raise the interrupt reason if one
    /// was delivered.
    pub fn check(&self) -> mlua::Result<()> {
        match self.reason() {
            Some(reason) => Err(mlua::Error::runtime(reason)),
            None => Ok(()),
        }
    }

    pub(crate) fn finish(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_interrupt_wins() {
        let interrupter = Interrupter::new();
        assert!(interrupter.check().is_ok());

        assert!(interrupter.interrupt("timed out after 1s"));
        assert!(!interrupter.interrupt("run cancelled"));
        assert_eq!(interrupter.reason(), Some("timed out after 1s"));
        assert!(interrupter.token().is_cancelled());
        assert!(interrupter.check().is_err());
    }

    #[test]
    fn test_interrupt_after_finish_is_ignored() {
        let interrupter = Interrupter::new();
        interrupter.finish();
        assert!(!interrupter.interrupt("late"));
        assert_eq!(interrupter.reason(), None);
        assert!(!interrupter.token().is_cancelled());
    }
}
