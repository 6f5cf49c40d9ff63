//! Run a callback when an object is reclaimed, without keeping it alive.
//!
//! ```rust
//! use reaper::{Tracked, watch};
//!
//! let connection = Tracked::new(String::from("db"));
//! watch(&connection, || println!("connection closed"));
//!
//! println!("Hello");
//! drop(connection); // prints "connection closed"
//! println!("The end");
//! ```
//!
//! Several watches on one subject run in the order they were registered. A
//! watch can be cancelled until its subject is reclaimed:
//!
//! ```rust
//! use reaper::{Tracked, watch};
//!
//! let subject = Tracked::new(());
//! let handle = watch(&subject, || unreachable!());
//! handle.forget();
//! drop(subject); // prints nothing
//! ```
//!
//! # Subjects
//!
//! | Subject | Reclaimed when |
//! |---------|----------------|
//! | [`Tracked<T>`] | it is dropped; callbacks run right there |
//! | `Arc<T>` via [`watch_shared`] | the next [`Registry::collect`] after the last strong reference drops |
//! | [`SubjectId::host`] | the host calls [`Registry::reclaim`] |
//!
//! # Configuration
//!
//! The global registry reads `REAPER_CALLBACK_FAILURE` (`report` or
//! `propagate`) on first use. With the `tokio` feature,
//! `REAPER_COLLECT_INTERVAL_MS` sets the interval of
//! [`spawn_collector_from_env`].
//!
//! # Cargo features
//!
//! | Feature | Effect |
//! |---------|--------|
//! | *(default, none)* | Registry, handles and subjects only. |
//! | `tokio` | Adds the background collector for `Arc` subjects. |

pub use reaper_runtime::*;

#[cfg(feature = "tokio")]
pub use reaper_tokio::{
    CollectorHandle, collect_interval_from_env, spawn_collector, spawn_collector_from_env,
};
