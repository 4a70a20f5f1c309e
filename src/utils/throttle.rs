//! Log throttling
//!
//! Negotiation retries can fail in a tight loop (the session negotiator
//! retries forever). The throttler lets the first failure for a key through,
//! then at most one per interval, and reports how many were swallowed.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Rate limiter for repeated log lines, keyed by message kind
///
/// ```rust
/// use std::time::Duration;
/// use calls_client::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert_eq!(throttler.check("session"), Some(0));
/// assert_eq!(throttler.check("session"), None);
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Whether a line for `key` may be logged now
    ///
    /// Returns the number of lines suppressed since the last one that got
    /// through, or `None` if this one must be suppressed as well.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                entry.last_logged = now;
                Some(std::mem::take(&mut entry.suppressed))
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget `key` once its condition recovers, so the next failure logs at once
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`, noting how many lines were swallowed
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        match $throttler.check($key) {
            Some(0) => tracing::warn!($($arg)*),
            Some(suppressed) => {
                tracing::warn!(suppressed, $($arg)*)
            }
            None => {}
        }
    };
}
