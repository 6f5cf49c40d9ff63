//! Tokio-driven collector for shared subjects.
//!
//! `Arc` subjects are only noticed as gone when [`Registry::collect`] runs.
//! [`spawn_collector`] runs it on a fixed interval, on the current tokio
//! runtime if there is one, or on a dedicated thread otherwise.

#[cfg(target_arch = "wasm32")]
compile_error!("`reaper-tokio` is native-only");

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use reaper_runtime::Registry;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub(crate) const COLLECT_INTERVAL_ENV: &str = "REAPER_COLLECT_INTERVAL_MS";
pub(crate) const DEFAULT_COLLECT_INTERVAL_MS: u64 = 100;

/// Keeps a collector loop alive. Dropping it is the same as
/// [`CollectorHandle::shutdown`].
pub struct CollectorHandle {
    stop: watch::Sender<bool>,
}

impl CollectorHandle {
    /// Signals the loop to stop and returns immediately. The loop then runs
    /// one last collect pass on its own task or thread, so callbacks may still
    /// fire after this returns.
    pub fn shutdown(self) {
        drop(self);
    }

    /// False once the loop has exited, or if it never started.
    pub fn is_running(&self) -> bool {
        !self.stop.is_closed()
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Starts collecting `registry` every `interval`. A zero interval falls back to
/// the default of 100ms.
pub fn spawn_collector(registry: Registry, interval: Duration) -> CollectorHandle {
    let interval = effective_interval(interval);
    let (stop, stopped) = watch::channel(false);

    if tokio::runtime::Handle::try_current().is_ok() {
        tokio::spawn(run_collector(registry, interval, stopped));
        return CollectorHandle { stop };
    }

    let spawned = std::thread::Builder::new()
        .name("reaper-collector".into())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt.block_on(run_collector(registry, interval, stopped)),
                Err(err) => tracing::error!(%err, "failed to build collector runtime"),
            }
        });
    if let Err(err) = spawned {
        tracing::error!(%err, "failed to spawn collector thread");
    }
    CollectorHandle { stop }
}

/// Like [`spawn_collector`], with the interval taken from
/// `REAPER_COLLECT_INTERVAL_MS`.
pub fn spawn_collector_from_env(registry: Registry) -> CollectorHandle {
    spawn_collector(registry, collect_interval_from_env())
}

pub fn collect_interval_from_env() -> Duration {
    let raw = std::env::var(COLLECT_INTERVAL_ENV).ok();
    parse_interval(raw.as_deref())
}

fn parse_interval(raw: Option<&str>) -> Duration {
    let default = Duration::from_millis(DEFAULT_COLLECT_INTERVAL_MS);
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return default;
    };
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => Duration::from_millis(ms),
        _ => {
            tracing::warn!(
                var = COLLECT_INTERVAL_ENV,
                value = raw,
                "ignoring invalid collect interval"
            );
            default
        }
    }
}

fn effective_interval(interval: Duration) -> Duration {
    if !interval.is_zero() {
        return interval;
    }
    tracing::warn!(
        default_ms = DEFAULT_COLLECT_INTERVAL_MS,
        "zero collect interval, using the default"
    );
    Duration::from_millis(DEFAULT_COLLECT_INTERVAL_MS)
}

async fn run_collector(
    registry: Registry,
    interval: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    tracing::debug!(interval_ms = interval.as_millis() as u64, "collector started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => collect_once(&registry),
            changed = stopped.changed() => {
                if changed.is_err() || *stopped.borrow() {
                    break;
                }
            }
        }
    }

    collect_once(&registry);
    tracing::debug!("collector stopped");
}

/// A propagating failure policy must not take the loop down with it.
fn collect_once(registry: &Registry) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| registry.collect())) {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            *message
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str()
        } else {
            "<non-string panic payload>"
        };
        tracing::error!(panic = message, "collect pass panicked");
    }
}
