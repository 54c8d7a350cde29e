//! Lock Coordinator - acquires, renews and releases the commit lock for one table
//!
//! `IDLE -> ACQUIRING -> HELD -> RELEASING -> IDLE`, with `FAILED` reachable from
//! `ACQUIRING` when an attempt gives up. While the lock is held a background task
//! renews the lease every third of its ttl; if renewal cannot keep the lease alive
//! the guard's `lost` token fires and the in-flight commit must be abandoned.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lock::{Lease, LockError, LockService};
use crate::metrics_consts::{LOCK_ACQUIRE_ATTEMPTS, LOCK_HELD, LOCK_RELEASES, LOCK_RENEWALS};
use crate::retry::RetryPolicy;
use crate::schema::TableId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Releasing,
    Failed,
}

#[derive(Clone)]
pub struct LockCoordinator {
    service: Arc<dyn LockService>,
    resource: TableId,
    holder: String,
    ttl: Duration,
    retry_policy: RetryPolicy,
    state: Arc<Mutex<LockState>>,
}

impl LockCoordinator {
    pub fn new(
        service: Arc<dyn LockService>,
        resource: TableId,
        holder: &str,
        ttl: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            resource,
            holder: holder.to_owned(),
            ttl,
            retry_policy,
            state: Arc::new(Mutex::new(LockState::Idle)),
        }
    }

    pub fn state(&self) -> LockState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn resource(&self) -> &TableId {
        &self.resource
    }

    fn set_state(&self, state: LockState) {
        set_state(&self.state, state);
    }

    fn renew_interval(&self) -> Duration {
        self.ttl / 3
    }

    /// Acquire the lock, backing off on contention or transport errors until the
    /// retry policy's attempt limit, then fail with `AcquireTimeout`.
    /// Cancelling aborts before any lease is held.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<LockGuard, LockError> {
        self.set_state(LockState::Acquiring);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let attempt_call = tokio::time::timeout(
                self.ttl,
                self.service.try_acquire(&self.resource, &self.holder, self.ttl),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.set_state(LockState::Idle);
                    return Err(LockError::Cancelled);
                }
                result = attempt_call => result.unwrap_or_else(|_| {
                    Err(LockError::ServiceUnavailable(
                        "acquire did not answer within the lease ttl".to_string(),
                    ))
                }),
            };

            match result {
                Ok(lease) => {
                    metrics::counter!(LOCK_ACQUIRE_ATTEMPTS, "outcome" => "acquired").increment(1);
                    if cancel.is_cancelled() {
                        // acquired just as we were told to stop: hand it straight back
                        drop(self.service.release(&lease).await);
                        self.set_state(LockState::Idle);
                        return Err(LockError::Cancelled);
                    }
                    info!(
                        table = %self.resource,
                        holder = %self.holder,
                        attempt,
                        lease_expiry = %lease.lease_expiry,
                        "acquired commit lock"
                    );
                    self.set_state(LockState::Held);
                    metrics::gauge!(LOCK_HELD).set(1.0);
                    return Ok(self.spawn_guard(lease));
                }
                Err(e) if e.is_retryable() => {
                    let outcome = match e {
                        LockError::Contention { .. } => "contention",
                        _ => "unavailable",
                    };
                    metrics::counter!(LOCK_ACQUIRE_ATTEMPTS, "outcome" => outcome).increment(1);

                    if !self.retry_policy.should_retry(attempt) {
                        warn!(table = %self.resource, attempt, error = %e, "giving up on commit lock");
                        self.set_state(LockState::Failed);
                        return Err(LockError::AcquireTimeout {
                            resource: self.resource.clone(),
                            attempts: attempt,
                        });
                    }

                    let backoff = self.retry_policy.retry_interval(attempt);
                    debug!(
                        table = %self.resource,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "commit lock not acquired, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            self.set_state(LockState::Idle);
                            return Err(LockError::Cancelled);
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    metrics::counter!(LOCK_ACQUIRE_ATTEMPTS, "outcome" => "error").increment(1);
                    error!(table = %self.resource, error = %e, "commit lock acquisition failed");
                    self.set_state(LockState::Failed);
                    return Err(e);
                }
            }
        }
    }

    fn spawn_guard(&self, lease: Lease) -> LockGuard {
        let lease = Arc::new(Mutex::new(lease));
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();

        let renewal = tokio::spawn(run_lease_renewal(
            self.service.clone(),
            lease.clone(),
            self.ttl,
            self.renew_interval(),
            stop.clone(),
            lost.clone(),
        ));

        LockGuard {
            service: self.service.clone(),
            ttl: self.ttl,
            lease,
            lost,
            stop,
            renewal: Some(renewal),
            state: self.state.clone(),
        }
    }
}

fn set_state(state: &Mutex<LockState>, next: LockState) {
    let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
    *current = next;
}

/// Proof that the commit lock is held. Must be released with `release`; dropping
/// it stops renewal and leaves the lease to expire.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    ttl: Duration,
    lease: Arc<Mutex<Lease>>,
    lost: CancellationToken,
    stop: CancellationToken,
    renewal: Option<JoinHandle<()>>,
    state: Arc<Mutex<LockState>>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("ttl", &self.ttl)
            .field("lease", &self.lease)
            .field("lost", &self.lost)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Cancelled once the lease can no longer be kept alive.
    pub fn lost(&self) -> &CancellationToken {
        &self.lost
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    pub fn lease(&self) -> Lease {
        self.lease.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stop renewing and give the lease back. Best effort: if the service cannot
    /// be reached the lease simply expires.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.stop.cancel();
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
            drop(renewal.await);
        }

        set_state(&self.state, LockState::Releasing);
        let lease = self.lease();
        let result = tokio::time::timeout(self.ttl, self.service.release(&lease))
            .await
            .unwrap_or_else(|_| {
                Err(LockError::ServiceUnavailable(
                    "release did not answer within the lease ttl".to_string(),
                ))
            });
        match &result {
            Ok(()) => {
                metrics::counter!(LOCK_RELEASES, "outcome" => "released").increment(1);
                debug!(table = %lease.resource, "released commit lock");
            }
            Err(e) => {
                metrics::counter!(LOCK_RELEASES, "outcome" => "expire").increment(1);
                warn!(
                    table = %lease.resource,
                    lease_expiry = %lease.lease_expiry,
                    error = %e,
                    "failed to release commit lock, leaving it to expire"
                );
            }
        }
        metrics::gauge!(LOCK_HELD).set(0.0);
        set_state(&self.state, LockState::Idle);
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            self.stop.cancel();
            renewal.abort();
            set_state(&self.state, LockState::Idle);
        }
    }
}

/// Renew `lease` every `interval` until stopped. `lost` fires once the lease
/// cannot be confirmed half an interval before its estimated expiry, including
/// when the service never answers.
async fn run_lease_renewal(
    service: Arc<dyn LockService>,
    lease: Arc<Mutex<Lease>>,
    ttl: Duration,
    interval: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    // local estimate of when the service will consider the lease expired
    let mut expires = Instant::now() + ttl;
    let margin = interval / 2;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let current = lease.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let attempted = Instant::now();
        let deadline = expires.checked_sub(margin).unwrap_or(attempted);

        let renewed = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            renewed = tokio::time::timeout_at(deadline, service.renew(&current, ttl)) => renewed,
        };

        match renewed {
            Ok(Ok(renewed)) => {
                metrics::counter!(LOCK_RENEWALS, "outcome" => "renewed").increment(1);
                expires = attempted + ttl;
                *lease.lock().unwrap_or_else(|e| e.into_inner()) = renewed;
            }
            Ok(Err(e)) if e.is_retryable() && Instant::now() + interval < deadline => {
                metrics::counter!(LOCK_RENEWALS, "outcome" => "retry").increment(1);
                warn!(table = %current.resource, error = %e, "lease renewal failed, will retry");
            }
            Ok(Err(e)) => {
                metrics::counter!(LOCK_RENEWALS, "outcome" => "lost").increment(1);
                error!(table = %current.resource, error = %e, "lease lost, abandoning commit");
                lost.cancel();
                return;
            }
            Err(_) => {
                metrics::counter!(LOCK_RENEWALS, "outcome" => "timeout").increment(1);
                error!(
                    table = %current.resource,
                    lease_expiry = %current.lease_expiry,
                    "lease renewal did not answer in time, abandoning commit"
                );
                lost.cancel();
                return;
            }
        }
    }
}
