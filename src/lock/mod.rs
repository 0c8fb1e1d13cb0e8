//! Mutual-exclusion contract used to make provisioning safe across
//! processes, plus an in-memory implementation for single-process use and
//! tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::LockingError;
use crate::provision::ServiceFuture;


/// Lifetime granted to a lock when none is specified.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Interval between acquisition attempts when no release is observed.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Interval at which held locks are extended.
pub const DEFAULT_EXTENSION_INTERVAL: Duration = Duration::from_secs(1);

/// Lease expiry used when adding a ttl would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Identifies a lock and the party asking for it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockInput {
    /// Name of the resource being locked.
    pub id: String,
    /// Owner of the lock once granted.
    pub holder: String,
    /// How long the lock stays valid without being released.
    pub ttl: Duration,
}

impl LockInput {
    /// Creates a lock request under a fresh random holder.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            holder: Uuid::new_v4().to_string(),
            ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Overrides the holder.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Overrides the lifetime.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

type Releaser = Box<dyn FnOnce() + Send>;

/// Proof that a lock is held. The lock is released when the guard drops.
pub struct LockGuard {
    input: LockInput,
    release: Option<Releaser>,
}

impl LockGuard {
    /// Creates a guard that runs `release` exactly once on drop.
    #[must_use]
    pub fn new(input: LockInput, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            input,
            release: Some(Box::new(release)),
        }
    }

    /// Returns the lock this guard holds.
    #[must_use]
    pub const fn input(&self) -> &LockInput {
        &self.input
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Grants exclusive, time-bounded locks.
pub trait LockingService: Send + Sync {
    /// Waits until the lock named by `input` is held by `input.holder`.
    fn acquire<'a>(&'a self, input: &'a LockInput) -> ServiceFuture<'a, LockGuard, LockingError>;
}

impl<T: LockingService + ?Sized> LockingService for Arc<T> {
    fn acquire<'a>(&'a self, input: &'a LockInput) -> ServiceFuture<'a, LockGuard, LockingError> {
        (**self).acquire(input)
    }
}

#[derive(Clone, Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Default)]
struct LockTable {
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
}

impl LockTable {
    fn leases(&self) -> MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: &str, holder: &str) {
        let removed = {
            let mut leases = self.leases();
            let owned = leases.get(id).is_some_and(|lease| lease.holder == holder);
            owned && leases.remove(id).is_some()
        };
        if removed {
            debug!(lock_id = id, holder, "released lock");
            self.released.notify_waiters();
        }
    }

    /// Pushes out the expiry of a lease `holder` still owns.
    fn extend(&self, id: &str, holder: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut leases = self.leases();
        match leases.get_mut(id) {
            Some(lease) if lease.holder == holder && lease.expires_at > now => {
                lease.expires_at = expiry_after(now, ttl);
                true
            }
            _ => false,
        }
    }
}

/// Extends a held lock every `every` until `stop` fires or the lease is lost.
async fn keep_alive(
    table: Arc<LockTable>,
    input: LockInput,
    every: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return,
            () = sleep(every) => {}
        }
        if !table.extend(&input.id, &input.holder, input.ttl) {
            warn!(lock_id = %input.id, holder = %input.holder, "lock lost before release");
            return;
        }
        trace!(lock_id = %input.id, holder = %input.holder, "extended lock");
    }
}

/// In-memory locking for a single process.
///
/// A lock held by another holder conflicts until it expires; an expired lock
/// is taken over, and the current holder may acquire again to extend it.
///
/// While a [`LockGuard`] is alive and a Tokio runtime is available, a
/// background task extends its lease every
/// [`DEFAULT_EXTENSION_INTERVAL`], so a lock held longer than its ttl is not
/// taken over. Only a holder that stops running loses its lock to expiry.
#[derive(Clone)]
pub struct LocalLockingService {
    table: Arc<LockTable>,
    retry_interval: Duration,
    extension_interval: Option<Duration>,
}

impl Default for LocalLockingService {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLockingService {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(LockTable::default()),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            extension_interval: Some(DEFAULT_EXTENSION_INTERVAL),
        }
    }

    /// Overrides how often [`LockingService::acquire`] retries when no
    /// release is observed.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Overrides how often held locks are extended. A zero interval turns
    /// extension off.
    #[must_use]
    pub const fn with_extension_interval(mut self, interval: Duration) -> Self {
        self.extension_interval = if interval.is_zero() {
            None
        } else {
            Some(interval)
        };
        self
    }

    /// Leaves held locks to expire after their ttl.
    #[must_use]
    pub const fn without_extension(mut self) -> Self {
        self.extension_interval = None;
        self
    }

    /// Attempts to take the lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LockingError::Conflict`] when another holder owns an
    /// unexpired lease.
    pub fn try_lock(&self, input: &LockInput) -> Result<LockGuard, LockingError> {
        let now = Instant::now();
        {
            let mut leases = self.table.leases();
            if let Some(current) = leases.get(&input.id)
                && current.holder != input.holder
                && current.expires_at > now
            {
                return Err(LockingError::Conflict {
                    id: input.id.clone(),
                    holder: current.holder.clone(),
                });
            }
            leases.insert(
                input.id.clone(),
                Lease {
                    holder: input.holder.clone(),
                    expires_at: expiry_after(now, input.ttl),
                },
            );
        }
        debug!(lock_id = %input.id, holder = %input.holder, "acquired lock");
        let stop = self.spawn_extension(input);
        let table = Arc::clone(&self.table);
        let id = input.id.clone();
        let holder = input.holder.clone();
        Ok(LockGuard::new(input.clone(), move || {
            if let Some(token) = stop {
                token.cancel();
            }
            table.release(&id, &holder);
        }))
    }

    fn spawn_extension(&self, input: &LockInput) -> Option<CancellationToken> {
        let every = self.extension_interval?;
        let Ok(runtime) = Handle::try_current() else {
            debug!(lock_id = %input.id, "no runtime; lock will not be extended");
            return None;
        };
        let stop = CancellationToken::new();
        runtime.spawn(keep_alive(
            Arc::clone(&self.table),
            input.clone(),
            every,
            stop.clone(),
        ));
        Some(stop)
    }

    /// Returns the current holder of `id`, ignoring expired leases.
    #[must_use]
    pub fn holder(&self, id: &str) -> Option<String> {
        let now = Instant::now();
        self.table
            .leases()
            .get(id)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone())
    }
}

impl LockingService for LocalLockingService {
    fn acquire<'a>(&'a self, input: &'a LockInput) -> ServiceFuture<'a, LockGuard, LockingError> {
        Box::pin(async move {
            loop {
                let released = self.table.released.notified();
                tokio::pin!(released);
                released.as_mut().enable();
                match self.try_lock(input) {
                    Ok(guard) => return Ok(guard),
                    Err(LockingError::Conflict { .. }) => {}
                    Err(other) => return Err(other),
                }
                tokio::select! {
                    () = &mut released => {}
                    () = sleep(self.retry_interval) => {}
                }
            }
        })
    }
}
