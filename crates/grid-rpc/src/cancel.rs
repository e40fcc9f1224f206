//! Cancellation signals.
//!
//! A [`CancelSource`] fires at most once with a `String` reason; every
//! [`CancelSignal`] cloned from it observes the reason. Multiple signals
//! compose by deriving a new one that fires when any source fires.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct CancelInner {
    reason: Mutex<Option<String>>,
    notify: Notify,
}

/// The firing side of a cancellation signal.
pub struct CancelSource {
    inner: Arc<CancelInner>,
}

impl CancelSource {
    /// Creates a new, unfired source.
    #[must_use]
    pub fn new() -> Self {
        CancelSource {
            inner: Arc::new(CancelInner::default()),
        }
    }

    /// Returns an observing signal for this source.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fires the signal with the given reason. Only the first fire takes
    /// effect; returns whether this call was the one that fired.
    pub fn fire(&self, reason: impl Into<String>) -> bool {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.into());
        }
        self.inner.notify.notify_waiters();
        true
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// The observing side of a cancellation signal.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    /// Returns a signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        CancelSignal {
            inner: Arc::new(CancelInner::default()),
        }
    }

    /// Returns a signal that fires with `reason` after `delay`.
    ///
    /// Spawns a timer task on the ambient runtime.
    #[must_use]
    pub fn after(delay: Duration, reason: impl Into<String>) -> Self {
        let source = CancelSource::new();
        let signal = source.signal();
        let reason = reason.into();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            source.fire(reason);
        });
        signal
    }

    /// Returns a signal that fires as soon as either input fires,
    /// carrying the first reason observed.
    #[must_use]
    pub fn merged(a: &CancelSignal, b: &CancelSignal) -> Self {
        let source = CancelSource::new();
        let signal = source.signal();
        let (a, b) = (a.clone(), b.clone());
        tokio::spawn(async move {
            let reason = tokio::select! {
                reason = a.cancelled() => reason,
                reason = b.cancelled() => reason,
            };
            source.fire(reason);
        });
        signal
    }

    /// Returns true if the signal has fired.
    #[must_use]
    pub fn fired(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    /// Returns the reason, if fired.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Resolves with the reason once the signal fires.
    pub async fn cancelled(&self) -> String {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("fired", &self.fired())
            .finish()
    }
}
