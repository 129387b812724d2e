//! Credential pool with rotation and cooldown
//!
//! Owns the API keys for the inference service, their health state, and
//! the rotation/backoff policy. One internal lock, short critical
//! sections; the network call is never made while holding it.

use crate::config::PipelineConfig;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Failure kinds reported back by the invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate-limit / quota rejection; the credential cools down.
    RateLimit,
    /// Authentication rejected outright; the credential is retired.
    Auth,
    /// Any other failure; counted, but the credential stays in rotation.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CredentialState {
    Healthy,
    Cooldown { until: Instant },
    Exhausted,
}

#[derive(Debug)]
struct CredentialSlot {
    key: String,
    state: CredentialState,
    consecutive_failures: u32,
    leased: bool,
}

/// Handle to a credential claimed from the pool. Must be returned via
/// [`CredentialPool::release`] once the attempt resolves.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    pub id: usize,
    pub key: String,
}

/// Outcome of an acquisition attempt. The pool never blocks; `Wait`
/// reports when a slot is expected to open so the caller can decide
/// whether its deadline allows sleeping that long.
#[derive(Debug)]
pub enum Acquire {
    Ready(CredentialLease),
    Wait(Duration),
    Exhausted,
}

struct PoolInner {
    slots: Vec<CredentialSlot>,
    cursor: usize,
}

pub struct CredentialPool {
    inner: Mutex<PoolInner>,
    config: PipelineConfig,
}

/// Poll interval used when every healthy credential is currently leased.
const ALL_LEASED_WAIT: Duration = Duration::from_millis(50);

impl CredentialPool {
    pub fn new(keys: Vec<String>, config: &PipelineConfig) -> Self {
        let slots = keys
            .into_iter()
            .map(|key| CredentialSlot {
                key,
                state: CredentialState::Healthy,
                consecutive_failures: 0,
                leased: false,
            })
            .collect();

        Self {
            inner: Mutex::new(PoolInner { slots, cursor: 0 }),
            config: config.clone(),
        }
    }

    /// Claim the next healthy credential, round-robin. A credential in
    /// cooldown is never handed out while a healthy one exists; expired
    /// cooldowns are promoted back to healthy first.
    pub fn acquire(&self) -> Acquire {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("credential pool lock poisoned");

        for slot in inner.slots.iter_mut() {
            if let CredentialState::Cooldown { until } = slot.state {
                if until <= now {
                    slot.state = CredentialState::Healthy;
                }
            }
        }

        let len = inner.slots.len();
        if len == 0 {
            return Acquire::Exhausted;
        }

        let start = inner.cursor;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let slot = &mut inner.slots[idx];
            if slot.state == CredentialState::Healthy && !slot.leased {
                slot.leased = true;
                let lease = CredentialLease {
                    id: idx,
                    key: slot.key.clone(),
                };
                inner.cursor = (idx + 1) % len;
                debug!(credential = idx, "Credential acquired");
                return Acquire::Ready(lease);
            }
        }

        // No healthy unleased slot. Report the earliest time one could
        // reappear: a cooldown expiry, or a lease return.
        let any_leased_healthy = inner
            .slots
            .iter()
            .any(|s| s.state == CredentialState::Healthy && s.leased);

        let earliest_cooldown = inner
            .slots
            .iter()
            .filter_map(|s| match s.state {
                CredentialState::Cooldown { until } => Some(until.saturating_duration_since(now)),
                _ => None,
            })
            .min();

        match (any_leased_healthy, earliest_cooldown) {
            (true, Some(cd)) => Acquire::Wait(cd.min(ALL_LEASED_WAIT)),
            (true, None) => Acquire::Wait(ALL_LEASED_WAIT),
            (false, Some(cd)) => Acquire::Wait(cd),
            (false, None) => Acquire::Exhausted,
        }
    }

    /// Return a credential after a successful attempt.
    pub fn release(&self, lease: &CredentialLease) {
        let mut inner = self.inner.lock().expect("credential pool lock poisoned");
        if let Some(slot) = inner.slots.get_mut(lease.id) {
            slot.leased = false;
        }
    }

    /// Reset the consecutive-failure counter after a successful call.
    pub fn mark_success(&self, lease: &CredentialLease) {
        let mut inner = self.inner.lock().expect("credential pool lock poisoned");
        if let Some(slot) = inner.slots.get_mut(lease.id) {
            slot.consecutive_failures = 0;
        }
    }

    /// Record a failure against a credential and transition its state.
    /// Also releases the lease.
    pub fn mark_failure(&self, lease: &CredentialLease, kind: FailureKind) {
        let mut inner = self.inner.lock().expect("credential pool lock poisoned");
        let max_failures = self.config.max_consecutive_failures;
        let Some(slot) = inner.slots.get_mut(lease.id) else {
            return;
        };

        slot.leased = false;
        slot.consecutive_failures += 1;

        if kind == FailureKind::Auth || slot.consecutive_failures >= max_failures {
            warn!(
                credential = lease.id,
                failures = slot.consecutive_failures,
                ?kind,
                "Credential retired"
            );
            slot.state = CredentialState::Exhausted;
            return;
        }

        if kind == FailureKind::RateLimit {
            // The cooldown curve is owned by the config; no second copy here.
            let cooldown = self.config.cooldown(slot.consecutive_failures);
            debug!(
                credential = lease.id,
                cooldown_ms = cooldown.as_millis() as u64,
                "Credential cooling down after rate limit"
            );
            slot.state = CredentialState::Cooldown {
                until: Instant::now() + cooldown,
            };
        }
    }

    /// True when every credential is exhausted (terminal for this pool).
    pub fn is_exhausted(&self) -> bool {
        let inner = self.inner.lock().expect("credential pool lock poisoned");
        inner
            .slots
            .iter()
            .all(|s| s.state == CredentialState::Exhausted)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(n: usize) -> CredentialPool {
        let keys = (0..n).map(|i| format!("key-{}", i)).collect();
        CredentialPool::new(keys, &PipelineConfig::default())
    }

    fn must_acquire(pool: &CredentialPool) -> CredentialLease {
        match pool.acquire() {
            Acquire::Ready(lease) => lease,
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn test_round_robin_rotation() {
        let pool = pool_with(3);

        let a = must_acquire(&pool);
        pool.release(&a);
        let b = must_acquire(&pool);
        pool.release(&b);
        let c = must_acquire(&pool);
        pool.release(&c);
        let d = must_acquire(&pool);

        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert_eq!(c.id, 2);
        assert_eq!(d.id, 0);
    }

    #[test]
    fn test_cooldown_credential_skipped_while_healthy_exists() {
        let pool = pool_with(2);

        let first = must_acquire(&pool);
        pool.mark_failure(&first, FailureKind::RateLimit);

        // Only credential 1 is healthy now; repeated acquires must keep
        // returning it, never the cooling one.
        for _ in 0..5 {
            let lease = must_acquire(&pool);
            assert_eq!(lease.id, 1);
            pool.release(&lease);
        }
    }

    #[test]
    fn test_auth_failure_retires_immediately() {
        let pool = pool_with(1);
        let lease = must_acquire(&pool);
        pool.mark_failure(&lease, FailureKind::Auth);

        assert!(pool.is_exhausted());
        assert!(matches!(pool.acquire(), Acquire::Exhausted));
    }

    #[test]
    fn test_consecutive_rate_limits_exhaust() {
        let config = PipelineConfig {
            max_consecutive_failures: 3,
            cooldown_base_ms: 0,
            ..Default::default()
        };
        let pool = CredentialPool::new(vec!["k".to_string()], &config);

        for _ in 0..3 {
            match pool.acquire() {
                Acquire::Ready(lease) => pool.mark_failure(&lease, FailureKind::RateLimit),
                Acquire::Wait(d) => {
                    std::thread::sleep(d);
                }
                Acquire::Exhausted => break,
            }
        }
        assert!(pool.is_exhausted());
    }

    #[test]
    fn test_cooldown_wait_follows_configured_curve() {
        let config = PipelineConfig {
            cooldown_base_ms: 50,
            cooldown_cap_ms: 10_000,
            max_consecutive_failures: 10,
            ..Default::default()
        };
        let pool = CredentialPool::new(vec!["k".to_string()], &config);

        let lease = must_acquire(&pool);
        pool.mark_failure(&lease, FailureKind::RateLimit);
        match pool.acquire() {
            Acquire::Wait(d) => assert!(d <= config.cooldown(1)),
            other => panic!("expected Wait, got {:?}", other),
        }

        // Second consecutive rate limit doubles the cooldown.
        std::thread::sleep(config.cooldown(1));
        let lease = must_acquire(&pool);
        pool.mark_failure(&lease, FailureKind::RateLimit);
        match pool.acquire() {
            Acquire::Wait(d) => {
                assert!(d <= config.cooldown(2));
                assert!(d > config.cooldown(1), "cooldown did not grow: {:?}", d);
            }
            other => panic!("expected Wait, got {:?}", other),
        }
    }

    #[test]
    fn test_all_cooling_reports_wait_not_exhausted() {
        let pool = pool_with(1);
        let lease = must_acquire(&pool);
        pool.mark_failure(&lease, FailureKind::RateLimit);

        match pool.acquire() {
            Acquire::Wait(d) => assert!(d <= Duration::from_millis(2_000)),
            other => panic!("expected Wait, got {:?}", other),
        }
    }

    #[test]
    fn test_leased_credential_not_double_counted() {
        let pool = pool_with(1);
        let _held = must_acquire(&pool);

        // Same credential must not be handed out twice concurrently.
        assert!(matches!(pool.acquire(), Acquire::Wait(_)));
    }

    #[test]
    fn test_concurrent_interleavings_never_yield_cooling_credential() {
        use std::sync::Arc;

        let config = PipelineConfig {
            cooldown_base_ms: 60_000, // long enough to stay cooling for the whole test
            max_consecutive_failures: 1_000,
            ..Default::default()
        };
        let keys = (0..4).map(|i| format!("key-{}", i)).collect();
        let pool = Arc::new(CredentialPool::new(keys, &config));

        // Put credential 0 into cooldown up front.
        let first = must_acquire(&pool);
        assert_eq!(first.id, 0);
        pool.mark_failure(&first, FailureKind::RateLimit);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    match pool.acquire() {
                        Acquire::Ready(lease) => {
                            assert_ne!(lease.id, 0, "cooling credential was handed out");
                            pool.release(&lease);
                        }
                        Acquire::Wait(_) => std::thread::yield_now(),
                        Acquire::Exhausted => panic!("pool wrongly exhausted"),
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
