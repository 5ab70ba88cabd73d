use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct SignalState {
    fired: AtomicBool,
    notify: Notify,
}

/// Fires a cooperative abort signal.
///
/// Clone-cheap (wraps `Arc`). Signal once, observe many. Safe to call
/// [`AbortHandle::abort`] before any observer exists; the fired flag is
/// checked on every wait.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    state: Arc<SignalState>,
}

impl AbortHandle {
    /// Create a new abort handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn abort(&self) {
        self.state.fired.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    /// Has the signal fired?
    pub fn is_aborted(&self) -> bool {
        self.state.fired.load(Ordering::Acquire)
    }

    /// The observer side of this handle.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            state: Arc::clone(&self.state),
        }
    }
}

/// The observer side of an [`AbortHandle`].
#[derive(Clone, Debug)]
pub struct AbortSignal {
    state: Arc<SignalState>,
}

impl AbortSignal {
    /// Has the signal fired?
    pub fn is_aborted(&self) -> bool {
        self.state.fired.load(Ordering::Acquire)
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn aborted(&self) {
        // Register for notification before checking the flag, so a
        // concurrent abort() between the check and the await is not lost.
        loop {
            let notified = self.state.notify.notified();
            if self.state.fired.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Reads a caller's abort signal out of the call arguments and writes the
/// composed group signal back into them before the underlying operation runs.
pub struct SignalAccessors<A> {
    pub(crate) get: Box<dyn Fn(&A) -> Option<AbortSignal> + Send + Sync>,
    pub(crate) set: Box<dyn Fn(AbortSignal, A) -> A + Send + Sync>,
}

impl<A> SignalAccessors<A> {
    /// Create an accessor pair. `get` extracts the caller's own signal, if
    /// any; `set` stores the composed signal in the arguments handed to the
    /// underlying operation.
    pub fn new<G, S>(get: G, set: S) -> Self
    where
        G: Fn(&A) -> Option<AbortSignal> + Send + Sync + 'static,
        S: Fn(AbortSignal, A) -> A + Send + Sync + 'static,
    {
        Self {
            get: Box::new(get),
            set: Box::new(set),
        }
    }
}

/// AND-composition of the abort signals of every caller joined to one
/// in-flight call.
///
/// Tracks a count of joined members whose signals have not yet fired. The
/// composed signal fires when that count returns to zero: one caller giving
/// up never cancels work another caller still waits on. Members may join at
/// any point before the call settles; a member whose signal has already
/// fired joins and is discounted immediately.
#[derive(Debug, Default)]
pub(crate) struct SignalGroup {
    outstanding: Arc<AtomicUsize>,
    composed: AbortHandle,
    retired: AbortHandle,
}

impl SignalGroup {
    /// The signal handed to the underlying operation.
    pub(crate) fn signal(&self) -> AbortSignal {
        self.composed.signal()
    }

    /// Join a caller's signal as a member of the group.
    pub(crate) fn join(&self, member: AbortSignal) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = Arc::clone(&self.outstanding);
        let composed = self.composed.clone();
        let retired = self.retired.signal();
        tokio::spawn(async move {
            tokio::select! {
                () = member.aborted() => {
                    if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                        debug!("every joined caller aborted, firing composed signal");
                        composed.abort();
                    }
                }
                () = retired.aborted() => {}
            }
        });
    }

    /// Stop all member watchers. Called when the call the group belongs to
    /// settles.
    pub(crate) fn retire(self) {
        self.retired.abort();
    }
}
