use core::sync::atomic::{AtomicU8, Ordering};
use std::fmt;
use std::sync::Arc;

use super::SubjectId;

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// Resolution of a single watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WatchStatus {
    Pending,
    Cancelled,
    Fired,
}

/// The state cell shared between a record in the table and its handle.
///
/// Both transitions start from `Pending` and are a single compare-and-swap, so
/// a racing `forget()` and dispatch agree on exactly one winner.
pub(crate) struct WatchState {
    status: AtomicU8,
}

impl WatchState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU8::new(PENDING),
        })
    }

    pub(crate) fn cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    /// Claims the record for dispatch. Returns false if it was cancelled first.
    pub(crate) fn claim(&self) -> bool {
        self.transition(FIRED)
    }

    fn transition(&self, to: u8) -> bool {
        self.status
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn status(&self) -> WatchStatus {
        match self.status.load(Ordering::Acquire) {
            PENDING => WatchStatus::Pending,
            CANCELLED => WatchStatus::Cancelled,
            _ => WatchStatus::Fired,
        }
    }
}

/// Boxed callback accepted by [`Subject::attach`](crate::Subject::attach).
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// One registration, owned by the per-subject list in the registry.
pub(crate) struct WatchRecord {
    pub(crate) callback: Callback,
    pub(crate) state: Arc<WatchState>,
}

impl WatchRecord {
    pub(crate) fn new(callback: Callback) -> Self {
        Self {
            callback,
            state: WatchState::new(),
        }
    }
}

/// A registered watch, returned by [`watch`](crate::watch).
///
/// The handle only carries the ability to cancel. It does not keep the
/// subject alive, does not own the callback, and dropping it leaves the watch
/// in place.
#[derive(Clone)]
pub struct WatchHandle {
    subject: SubjectId,
    state: Arc<WatchState>,
}

impl WatchHandle {
    pub(crate) fn new(subject: SubjectId, state: Arc<WatchState>) -> Self {
        Self { subject, state }
    }

    /// Detaches the callback from its subject.
    ///
    /// Calling this more than once, or after the subject has already been
    /// reclaimed, does nothing.
    pub fn forget(&self) {
        if self.state.cancel() {
            tracing::trace!(subject = %self.subject, "watch cancelled");
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("subject", &self.subject)
            .field("status", &self.state.status())
            .finish()
    }
}
