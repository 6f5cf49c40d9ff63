use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use super::handles::{Callback, WatchHandle, WatchRecord};
use super::{RegistryConfig, SubjectId};

/// Reports whether a weakly held subject still has strong owners.
pub(crate) trait Liveness: Send {
    fn is_alive(&self) -> bool;
}

impl<T: ?Sized + Send + Sync> Liveness for Weak<T> {
    fn is_alive(&self) -> bool {
        self.strong_count() > 0
    }
}

#[derive(Default)]
pub(crate) struct Entry {
    /// Only set for shared subjects, which are reclaimed by a collector pass.
    pub(crate) probe: Option<Box<dyn Liveness>>,
    pub(crate) records: Vec<WatchRecord>,
}

impl Entry {
    pub(crate) fn is_dead(&self) -> bool {
        self.probe.as_ref().is_some_and(|probe| !probe.is_alive())
    }
}

#[derive(Default)]
pub(crate) struct WatchTable {
    pub(crate) entries: BTreeMap<SubjectId, Entry>,
}

impl WatchTable {
    fn push(&mut self, id: SubjectId, record: WatchRecord) -> &mut Entry {
        let entry = self.entries.entry(id).or_default();
        entry.records.push(record);
        entry
    }
}

pub(crate) struct RegistryInner {
    pub(crate) config: RegistryConfig,
    pub(crate) table: Mutex<WatchTable>,
}

/// Table of pending watches, keyed by subject identity.
///
/// Entries hold callbacks strongly and subjects never: a tracked or host
/// subject is known only by its id, a shared subject only through a `Weak`.
/// Cloning a `Registry` yields another handle to the same table.
#[derive(Clone)]
pub struct Registry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                table: Mutex::new(WatchTable::default()),
            }),
        }
    }

    /// The process-wide registry used by [`watch`](crate::watch) and
    /// [`Tracked::new`](crate::Tracked::new). Configured from the environment
    /// on first use and never torn down.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(|| Registry::with_config(RegistryConfig::from_env()))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Appends a watch to the list for `id`. The host is expected to call
    /// [`Registry::reclaim`] with the same id once the object is gone.
    pub fn register(&self, id: SubjectId, callback: impl FnOnce() + Send + 'static) -> WatchHandle {
        self.register_boxed(id, Box::new(callback))
    }

    /// Watches an `Arc` without keeping its value alive. The callback runs
    /// during the first [`Registry::collect`] after the last strong reference
    /// is dropped.
    pub fn watch_shared<T>(
        &self,
        subject: &Arc<T>,
        callback: impl FnOnce() + Send + 'static,
    ) -> WatchHandle
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register_shared(subject, Box::new(callback))
    }

    pub(crate) fn register_boxed(&self, id: SubjectId, callback: Callback) -> WatchHandle {
        let record = WatchRecord::new(callback);
        let handle = WatchHandle::new(id, Arc::clone(&record.state));
        let position = {
            let mut table = self.inner.table.lock();
            table.push(id, record).records.len() - 1
        };
        tracing::trace!(subject = %id, position, "watch registered");
        handle
    }

    pub(crate) fn register_shared<T>(&self, subject: &Arc<T>, callback: Callback) -> WatchHandle
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let id = SubjectId::shared(subject);
        let record = WatchRecord::new(callback);
        let handle = WatchHandle::new(id, Arc::clone(&record.state));
        let position = {
            let mut table = self.inner.table.lock();
            let entry = table.push(id, record);
            // The Weak pins the allocation, so the address cannot be handed to
            // another Arc while this entry exists.
            if entry.probe.is_none() {
                entry.probe = Some(Box::new(Arc::downgrade(subject)));
            }
            entry.records.len() - 1
        };
        tracing::trace!(subject = %id, position, "shared watch registered");
        handle
    }

    /// Removes the whole list for `id`. The only way records leave the table.
    pub(crate) fn take(&self, id: SubjectId) -> Vec<WatchRecord> {
        let entry = self.inner.table.lock().entries.remove(&id);
        entry.map(|entry| entry.records).unwrap_or_default()
    }

    /// Number of subjects with at least one undispatched watch.
    pub fn subject_count(&self) -> usize {
        self.inner.table.lock().entries.len()
    }

    /// Number of undispatched watches, cancelled ones included.
    pub fn watch_count(&self) -> usize {
        self.inner
            .table
            .lock()
            .entries
            .values()
            .map(|entry| entry.records.len())
            .sum()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.table.lock();
        f.debug_struct("Registry")
            .field("config", &self.inner.config)
            .field("subjects", &table.entries.len())
            .finish()
    }
}
