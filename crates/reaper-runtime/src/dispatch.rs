use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use super::handles::WatchRecord;
use super::registry::Registry;
use super::{FailurePolicy, SubjectId};

/// A callback that panicked while its subject was being reclaimed.
pub struct CallbackFailure {
    subject: SubjectId,
    position: usize,
    payload: Box<dyn Any + Send>,
}

impl CallbackFailure {
    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    /// Index of the callback in registration order for its subject.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn message(&self) -> &str {
        if let Some(message) = self.payload.downcast_ref::<&'static str>() {
            *message
        } else if let Some(message) = self.payload.downcast_ref::<String>() {
            message.as_str()
        } else {
            "<non-string panic payload>"
        }
    }

    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackFailure")
            .field("subject", &self.subject)
            .field("position", &self.position)
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "callback #{} for {} panicked: {}",
            self.position,
            self.subject,
            self.message()
        )
    }
}

impl std::error::Error for CallbackFailure {}

/// Returned by [`Registry::on_reclaimed`] when at least one callback panicked,
/// or a cancelled callback panicked while being dropped. Every sibling callback
/// has still been invoked.
#[derive(Debug)]
pub struct DispatchError {
    subject: SubjectId,
    invoked: usize,
    failures: Vec<CallbackFailure>,
}

impl DispatchError {
    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    /// Callbacks that were invoked, the failed ones included.
    pub fn invoked(&self) -> usize {
        self.invoked
    }

    pub fn failures(&self) -> &[CallbackFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<CallbackFailure> {
        self.failures
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatch for {} caught {} panic(s) over {} invoked callbacks",
            self.subject,
            self.failures.len(),
            self.invoked
        )?;
        if let Some(first) = self.failures.first() {
            write!(f, " (first: {})", first.message())?;
        }
        Ok(())
    }
}

impl std::error::Error for DispatchError {}

/// Outcome of one [`Registry::collect`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub reclaimed: usize,
    pub invoked: usize,
    pub failed: usize,
}

impl Registry {
    /// Dispatches every watch on `id` and leaves failure handling to the
    /// caller. Returns how many callbacks were invoked.
    pub fn on_reclaimed(&self, id: SubjectId) -> Result<usize, DispatchError> {
        let records = self.take(id);
        dispatch(id, records)
    }

    /// Reclamation hook: dispatches `id` and applies the registry's
    /// [`FailurePolicy`] to any panicking callback.
    pub fn reclaim(&self, id: SubjectId) {
        if let Err(err) = self.on_reclaimed(id) {
            self.handle_failures(vec![err]);
        }
    }

    /// Dispatches every shared subject whose last strong reference is gone.
    ///
    /// Subjects are dispatched in ascending id order. Tracked and host
    /// subjects are left alone; their reclamation is signalled by the owner.
    pub fn collect(&self) -> CollectStats {
        let reclaimed: Vec<(SubjectId, Vec<WatchRecord>)> = {
            let mut table = self.inner.table.lock();
            let dead: Vec<SubjectId> = table
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_dead())
                .map(|(id, _)| *id)
                .collect();
            dead.into_iter()
                .filter_map(|id| table.entries.remove(&id).map(|entry| (id, entry.records)))
                .collect()
        };

        let mut stats = CollectStats {
            reclaimed: reclaimed.len(),
            ..CollectStats::default()
        };
        let mut errors = Vec::new();
        for (id, records) in reclaimed {
            match dispatch(id, records) {
                Ok(invoked) => stats.invoked += invoked,
                Err(err) => {
                    stats.invoked += err.invoked;
                    stats.failed += err.failures.len();
                    errors.push(err);
                }
            }
        }

        if stats.reclaimed > 0 {
            tracing::debug!(
                reclaimed = stats.reclaimed,
                invoked = stats.invoked,
                failed = stats.failed,
                "collect pass completed"
            );
        }
        if !errors.is_empty() {
            self.handle_failures(errors);
        }
        stats
    }

    fn handle_failures(&self, errors: Vec<DispatchError>) {
        for failure in errors.iter().flat_map(|err| err.failures.iter()) {
            tracing::error!(
                subject = %failure.subject,
                position = failure.position,
                panic = failure.message(),
                "watch callback panicked"
            );
        }

        if self.config().failure_policy != FailurePolicy::Propagate {
            return;
        }
        // Unwinding out of a destructor that already runs during a panic
        // aborts the process.
        if std::thread::panicking() {
            return;
        }
        let first = errors
            .into_iter()
            .flat_map(DispatchError::into_failures)
            .next();
        if let Some(failure) = first {
            panic::resume_unwind(failure.into_payload());
        }
    }
}

/// Runs the callbacks taken for one subject.
///
/// Every pending record is claimed before the first callback runs, so a
/// `forget()` issued from inside a sibling callback no longer has an effect.
/// Cancelled callbacks are dropped only after the claimed ones ran, since
/// their captures may panic on drop. No registry lock is held here.
fn dispatch(id: SubjectId, records: Vec<WatchRecord>) -> Result<usize, DispatchError> {
    if records.is_empty() {
        return Ok(0);
    }
    let listed = records.len();
    let mut claimed = Vec::with_capacity(listed);
    let mut cancelled = Vec::new();
    for (position, record) in records.into_iter().enumerate() {
        if record.state.claim() {
            claimed.push((position, record.callback));
        } else {
            cancelled.push((position, record.callback));
        }
    }

    let invoked = claimed.len();
    tracing::debug!(subject = %id, listed, invoked, "dispatching watches");

    let mut failures = Vec::new();
    for (position, callback) in claimed {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            failures.push(CallbackFailure {
                subject: id,
                position,
                payload,
            });
        }
    }
    for (position, callback) in cancelled {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(callback))) {
            failures.push(CallbackFailure {
                subject: id,
                position,
                payload,
            });
        }
    }

    if failures.is_empty() {
        Ok(invoked)
    } else {
        Err(DispatchError {
            subject: id,
            invoked,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegistryConfig;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder() -> (Log, impl Fn(&'static str) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |word: &'static str| {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().push(word)) as Box<dyn FnOnce() + Send>
        };
        (log, make)
    }

    #[test]
    fn on_reclaimed_fires_in_registration_order() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let id = SubjectId::host(1);
        registry.register(id, make("a"));
        registry.register(id, make("b"));
        registry.register(id, make("c"));

        assert_eq!(registry.on_reclaimed(id).unwrap(), 3);
        assert_eq!(*log.lock(), ["a", "b", "c"]);
        assert_eq!(registry.subject_count(), 0);
    }

    #[test]
    fn second_reclaim_finds_nothing() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let id = SubjectId::host(2);
        registry.register(id, make("once"));

        assert_eq!(registry.on_reclaimed(id).unwrap(), 1);
        assert_eq!(registry.on_reclaimed(id).unwrap(), 0);
        assert_eq!(*log.lock(), ["once"]);
    }

    #[test]
    fn cancelled_records_are_skipped() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let id = SubjectId::host(3);
        registry.register(id, make("kept"));
        registry.register(id, make("dropped")).forget();

        assert_eq!(registry.on_reclaimed(id).unwrap(), 1);
        assert_eq!(*log.lock(), ["kept"]);
    }

    #[test]
    fn panicking_callback_does_not_suppress_siblings() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let id = SubjectId::host(4);
        registry.register(id, make("before"));
        registry.register(id, || panic!("boom"));
        registry.register(id, make("after"));

        let err = registry.on_reclaimed(id).unwrap_err();
        assert_eq!(*log.lock(), ["before", "after"]);
        assert_eq!(err.invoked(), 3);
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].position(), 1);
        assert_eq!(err.failures()[0].message(), "boom");
        assert_eq!(
            err.to_string(),
            "dispatch for host#4 caught 1 panic(s) over 3 invoked callbacks (first: boom)"
        );
    }

    struct PanicOnDrop;

    impl Drop for PanicOnDrop {
        fn drop(&mut self) {
            panic!("capture dropped");
        }
    }

    #[test]
    fn cancelled_capture_panicking_on_drop_does_not_suppress_siblings() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let id = SubjectId::host(10);
        registry.register(id, make("first"));
        let capture = PanicOnDrop;
        registry
            .register(id, move || {
                let _capture = capture;
            })
            .forget();
        registry.register(id, make("last"));

        let err = registry.on_reclaimed(id).unwrap_err();
        assert_eq!(*log.lock(), ["first", "last"]);
        assert_eq!(err.invoked(), 2);
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].position(), 1);
        assert_eq!(err.failures()[0].message(), "capture dropped");
    }

    #[test]
    fn cancelled_capture_panicking_first_leaves_later_watches_running() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let id = SubjectId::host(11);
        let capture = PanicOnDrop;
        registry
            .register(id, move || {
                let _capture = capture;
            })
            .forget();
        registry.register(id, make("sibling"));

        registry.reclaim(id);
        assert_eq!(*log.lock(), ["sibling"]);
        assert_eq!(registry.subject_count(), 0);
    }

    #[test]
    fn reclaim_reports_failures_by_default() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let id = SubjectId::host(5);
        registry.register(id, || panic!("reported"));
        registry.register(id, make("sibling"));

        registry.reclaim(id);
        assert_eq!(*log.lock(), ["sibling"]);
    }

    #[test]
    fn reclaim_propagates_after_siblings_ran() {
        let registry = Registry::with_config(
            RegistryConfig::default().with_failure_policy(FailurePolicy::Propagate),
        );
        let (log, make) = recorder();
        let id = SubjectId::host(6);
        registry.register(id, || panic::panic_any(String::from("first")));
        registry.register(id, || panic!("second"));
        registry.register(id, make("sibling"));

        let payload = panic::catch_unwind(AssertUnwindSafe(|| registry.reclaim(id))).unwrap_err();
        assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("first"));
        assert_eq!(*log.lock(), ["sibling"]);
    }

    #[test]
    fn forget_inside_a_callback_does_not_stop_claimed_siblings() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let id = SubjectId::host(7);
        let later: Arc<Mutex<Option<crate::WatchHandle>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&later);
        registry.register(id, move || {
            if let Some(handle) = slot.lock().take() {
                handle.forget();
            }
        });
        *later.lock() = Some(registry.register(id, make("still runs")));

        assert_eq!(registry.on_reclaimed(id).unwrap(), 2);
        assert_eq!(*log.lock(), ["still runs"]);
    }

    #[test]
    fn callback_may_register_on_the_same_id() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let id = SubjectId::host(8);
        let inner = registry.clone();
        let late = make("late");
        registry.register(id, move || {
            inner.register(id, late);
        });

        assert_eq!(registry.on_reclaimed(id).unwrap(), 1);
        assert_eq!(registry.subject_count(), 1);
        assert!(log.lock().is_empty());

        assert_eq!(registry.on_reclaimed(id).unwrap(), 1);
        assert_eq!(*log.lock(), ["late"]);
    }

    #[test]
    fn collect_only_takes_dead_shared_subjects() {
        let registry = Registry::new();
        let (log, make) = recorder();
        let alive = Arc::new(1u8);
        let doomed = Arc::new(2u8);
        registry.watch_shared(&alive, make("alive"));
        registry.watch_shared(&doomed, make("doomed"));
        registry.register(SubjectId::host(9), make("host"));

        assert_eq!(registry.collect(), CollectStats::default());

        drop(doomed);
        let stats = registry.collect();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.invoked, 1);
        assert_eq!(*log.lock(), ["doomed"]);
        assert_eq!(registry.subject_count(), 2);
    }

    #[test]
    fn collect_counts_failures() {
        let registry = Registry::new();
        let subject = Arc::new(());
        registry.watch_shared(&subject, || panic!("collected"));
        registry.watch_shared(&subject, || {});
        drop(subject);

        let stats = registry.collect();
        assert_eq!(
            stats,
            CollectStats {
                reclaimed: 1,
                invoked: 2,
                failed: 1,
            }
        );
    }
}
