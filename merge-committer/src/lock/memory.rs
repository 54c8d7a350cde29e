use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::lock::{expiry_after, Lease, LockError, LockService};
use crate::schema::TableId;

struct Held {
    holder: String,
    expires: Instant,
    lease: Lease,
}

/// Process-local lock service.
///
/// Expiry is tracked on the tokio clock so tests can drive it with paused time.
/// Failures can be injected to exercise retry and lease-loss handling.
#[derive(Clone, Default)]
pub struct MemoryLockService {
    leases: Arc<Mutex<HashMap<TableId, Held>>>,
    unavailable: Arc<AtomicBool>,
    hanging_renewals: Arc<AtomicBool>,
    failing_renewals: Arc<AtomicU32>,
    failing_releases: Arc<AtomicU32>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `ServiceUnavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make renewals never answer, as with a stuck connection.
    pub fn set_renewals_hang(&self, hang: bool) {
        self.hanging_renewals.store(hang, Ordering::SeqCst);
    }

    /// Fail the next `count` renewals with `ServiceUnavailable`.
    pub fn fail_next_renewals(&self, count: u32) {
        self.failing_renewals.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` releases with `ServiceUnavailable`.
    pub fn fail_next_releases(&self, count: u32) {
        self.failing_releases.store(count, Ordering::SeqCst);
    }

    /// Current unexpired holder of `resource`, if any.
    pub fn holder(&self, resource: &TableId) -> Option<String> {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .get(resource)
            .filter(|h| h.expires > Instant::now())
            .map(|h| h.holder.clone())
    }

    /// Hand the lease to someone else, as if it expired and was taken over.
    pub fn steal(&self, resource: &TableId, holder: &str, ttl: Duration) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.insert(resource.clone(), held(resource, holder, ttl));
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::ServiceUnavailable(
                "memory lock service switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn held(resource: &TableId, holder: &str, ttl: Duration) -> Held {
    let lease = Lease {
        resource: resource.clone(),
        holder: holder.to_owned(),
        lease_expiry: expiry_after(ttl),
    };
    Held {
        holder: holder.to_owned(),
        expires: Instant::now() + ttl,
        lease,
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(
        &self,
        resource: &TableId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, LockError> {
        self.check_available()?;

        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = leases.get(resource) {
            if current.holder != holder && current.expires > Instant::now() {
                return Err(LockError::Contention {
                    resource: resource.clone(),
                    holder: current.holder.clone(),
                    lease_expiry: current.lease.lease_expiry,
                });
            }
        }

        let granted = held(resource, holder, ttl);
        let lease = granted.lease.clone();
        leases.insert(resource.clone(), granted);
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LockError> {
        if self.hanging_renewals.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check_available()?;
        if Self::take_injected(&self.failing_renewals) {
            return Err(LockError::ServiceUnavailable(
                "injected renewal failure".to_string(),
            ));
        }

        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let still_held = leases.get(&lease.resource).is_some_and(|current| {
            current.holder == lease.holder && current.expires > Instant::now()
        });
        if !still_held {
            return Err(LockError::LeaseLost(lease.resource.clone()));
        }

        let renewed = held(&lease.resource, &lease.holder, ttl);
        let granted = renewed.lease.clone();
        leases.insert(lease.resource.clone(), renewed);
        Ok(granted)
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        self.check_available()?;
        if Self::take_injected(&self.failing_releases) {
            return Err(LockError::ServiceUnavailable(
                "injected release failure".to_string(),
            ));
        }

        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases
            .get(&lease.resource)
            .is_some_and(|current| current.holder == lease.holder)
        {
            leases.remove(&lease.resource);
        }
        Ok(())
    }
}
