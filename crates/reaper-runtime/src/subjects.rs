use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU64, Ordering};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::Arc;

use super::handles::{Callback, WatchHandle};
use super::registry::Registry;

static NEXT_SUBJECT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum SubjectKey {
    Tracked(NonZeroU64),
    Shared(usize),
    Host(u64),
}

/// Identity of a watched object, stable for as long as the object lives.
///
/// Only unique among objects that are alive at the same time. Once a subject
/// has been reclaimed its id may come back for an unrelated object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectId(SubjectKey);

impl SubjectId {
    /// An identity chosen by an embedding host that tracks object lifetimes
    /// itself and calls [`Registry::reclaim`] when the object goes away.
    pub fn host(raw: u64) -> Self {
        Self(SubjectKey::Host(raw))
    }

    pub(crate) fn next_tracked() -> Self {
        let raw = NEXT_SUBJECT_ID.fetch_add(1, Ordering::Relaxed);
        let id = NonZeroU64::new(raw)
            .expect("subject id invariant violated: generated id must be non-zero");
        Self(SubjectKey::Tracked(id))
    }

    pub(crate) fn shared<T: ?Sized>(subject: &Arc<T>) -> Self {
        Self(SubjectKey::Shared(Arc::as_ptr(subject) as *const () as usize))
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            SubjectKey::Tracked(id) => write!(f, "tracked#{id}"),
            SubjectKey::Shared(addr) => write!(f, "shared@{addr:#x}"),
            SubjectKey::Host(raw) => write!(f, "host#{raw}"),
        }
    }
}

/// Something a callback can be attached to with [`watch`](crate::watch).
pub trait Subject {
    fn attach(&self, callback: Callback) -> WatchHandle;
}

/// Host identities attach to the global registry; the host reclaims them
/// with `Registry::global().reclaim(id)`.
impl Subject for SubjectId {
    fn attach(&self, callback: Callback) -> WatchHandle {
        Registry::global().register_boxed(*self, callback)
    }
}

/// Watching through a smart pointer watches the pointee, so an
/// `Arc<Tracked<T>>` dispatches on its own registry when the last clone drops.
/// Plain `Arc` values are watched with [`watch_shared`](crate::watch_shared).
impl<S: Subject + ?Sized> Subject for Arc<S> {
    fn attach(&self, callback: Callback) -> WatchHandle {
        (**self).attach(callback)
    }
}

impl<S: Subject + ?Sized> Subject for Rc<S> {
    fn attach(&self, callback: Callback) -> WatchHandle {
        (**self).attach(callback)
    }
}

impl<S: Subject + ?Sized> Subject for &S {
    fn attach(&self, callback: Callback) -> WatchHandle {
        (**self).attach(callback)
    }
}

/// An owned value whose destruction dispatches its watches.
///
/// Dropping a `Tracked` runs every pending callback attached to it, in
/// registration order, before the inner value's own destructor. Wrap it in an
/// `Arc` or `Rc` to share it; the callbacks then run when the last strong
/// reference goes.
pub struct Tracked<T> {
    id: SubjectId,
    registry: Registry,
    value: T,
}

impl<T> Tracked<T> {
    pub fn new(value: T) -> Self {
        Self::new_in(value, Registry::global())
    }

    pub fn new_in(value: T, registry: &Registry) -> Self {
        Self {
            id: SubjectId::next_tracked(),
            registry: registry.clone(),
            value,
        }
    }

    pub fn id(&self) -> SubjectId {
        self.id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl<T> Subject for Tracked<T> {
    fn attach(&self, callback: Callback) -> WatchHandle {
        self.registry.register_boxed(self.id, callback)
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.registry.reclaim(self.id);
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for Tracked<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T: Default> Default for Tracked<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}
