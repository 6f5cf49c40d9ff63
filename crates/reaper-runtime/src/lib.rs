//! Weak watch registry: run a callback once an object is reclaimed, without
//! the registration keeping that object alive.
//!
//! A watch is attached with [`watch`] and cancelled with
//! [`WatchHandle::forget`]. Reclamation is observed through one of three
//! kinds of subject:
//!
//! - [`Tracked<T>`]: dropping it dispatches its watches synchronously.
//! - `Arc<T>` via [`watch_shared`]: the registry keeps a `Weak<T>` and
//!   dispatches during [`Registry::collect`] once the last strong reference
//!   is gone.
//! - [`SubjectId::host`]: an embedding host calls [`Registry::reclaim`].
//!
//! Callbacks on one subject run in registration order, each at most once. A
//! panicking callback never stops its siblings; what happens afterwards is
//! decided by the registry's [`FailurePolicy`].

pub(crate) const CALLBACK_FAILURE_ENV: &str = "REAPER_CALLBACK_FAILURE";

pub(crate) mod config;
pub(crate) mod dispatch;
pub(crate) mod handles;
pub(crate) mod registry;
pub(crate) mod subjects;

pub use self::config::*;
pub use self::dispatch::{CallbackFailure, CollectStats, DispatchError};
pub use self::handles::{Callback, WatchHandle};
pub use self::registry::Registry;
pub use self::subjects::*;

use std::sync::Arc;

/// Attaches `callback` to `subject`. It runs once, when the subject is
/// reclaimed, unless the returned handle is forgotten first.
pub fn watch<S>(subject: &S, callback: impl FnOnce() + Send + 'static) -> WatchHandle
where
    S: Subject + ?Sized,
{
    subject.attach(Box::new(callback))
}

/// Attaches `callback` to a plain `Arc` on the global registry. It runs during
/// the first [`Registry::collect`] after the last strong reference is dropped.
///
/// An `Arc<Tracked<T>>` does not need this: [`watch`] on it dispatches as soon
/// as the last clone goes.
pub fn watch_shared<T>(subject: &Arc<T>, callback: impl FnOnce() + Send + 'static) -> WatchHandle
where
    T: ?Sized + Send + Sync + 'static,
{
    Registry::global().watch_shared(subject, callback)
}
