//! Provisioning decorator that serialises submissions through an external
//! lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use super::{ProvisionService, ServiceFuture};
use crate::error::{LockingError, ProvisioningError};
use crate::lock::{DEFAULT_LOCK_TTL, LockInput, LockingService};
use crate::model::{ProvisionInput, ProvisionOutput};

type LockKey = Arc<dyn Fn(&ProvisionInput) -> String + Send + Sync>;

/// Wraps a provisioning service so `provision` runs only while an external
/// lock is held.
///
/// The lock is keyed by the request id unless a key function is supplied,
/// and it is held only for the inner `provision` call. `describe` and
/// `release` pass straight through.
pub struct LockingProvisionService<S, L> {
    inner: S,
    locking: L,
    key: LockKey,
    lock_timeout: Option<Duration>,
    lock_ttl: Duration,
}

impl<S, L> LockingProvisionService<S, L>
where
    S: ProvisionService,
    L: LockingService,
{
    /// Wraps `inner`, locking on the request id.
    #[must_use]
    pub fn new(inner: S, locking: L) -> Self {
        Self {
            inner,
            locking,
            key: Arc::new(|input: &ProvisionInput| input.id().to_owned()),
            lock_timeout: None,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Derives the lock name from each request with `key`.
    #[must_use]
    pub fn with_key(mut self, key: impl Fn(&ProvisionInput) -> String + Send + Sync + 'static) -> Self {
        self.key = Arc::new(key);
        self
    }

    /// Gives up on the lock after `limit`.
    #[must_use]
    pub const fn with_lock_timeout(mut self, limit: Duration) -> Self {
        self.lock_timeout = Some(limit);
        self
    }

    /// Sets the lifetime requested for each lock.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Returns the wrapped service.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    async fn locked_provision(
        &self,
        input: &ProvisionInput,
    ) -> Result<ProvisionOutput, ProvisioningError> {
        let lock = LockInput::new((self.key)(input)).with_ttl(self.lock_ttl);
        let acquired = match self.lock_timeout {
            Some(limit) => timeout(limit, self.locking.acquire(&lock))
                .await
                .unwrap_or_else(|_| {
                    Err(LockingError::Timeout {
                        id: lock.id.clone(),
                        timeout: limit,
                    })
                }),
            None => self.locking.acquire(&lock).await,
        };
        let guard = acquired.map_err(|source| ProvisioningError::Locking {
            id: input.id().to_owned(),
            source,
        })?;
        debug!(provision_id = input.id(), lock_id = %lock.id, "provisioning under lock");
        let output = self.inner.provision(input).await;
        drop(guard);
        output
    }
}

impl<S, L> ProvisionService for LockingProvisionService<S, L>
where
    S: ProvisionService,
    L: LockingService,
{
    fn provision<'a>(
        &'a self,
        input: &'a ProvisionInput,
    ) -> ServiceFuture<'a, ProvisionOutput, ProvisioningError> {
        Box::pin(self.locked_provision(input))
    }

    fn describe<'a>(
        &'a self,
        id: &'a str,
    ) -> ServiceFuture<'a, ProvisionOutput, ProvisioningError> {
        self.inner.describe(id)
    }

    fn release<'a>(&'a self, id: &'a str) -> ServiceFuture<'a, (), ProvisioningError> {
        self.inner.release(id)
    }

    fn close(&self) -> ServiceFuture<'_, (), ProvisioningError> {
        self.inner.close()
    }
}
