//! Quota ledger.
//!
//! Admission and commit for one identity form a single critical section: the
//! ledger hands out a per-identity permit on `admit` that is held until the
//! resulting [`Admission`] is committed or dropped. Two concurrent requests
//! for the same identity at `used == limit - 1` can therefore never both be
//! admitted, while different identities proceed in parallel.
//!
//! The ledger never fails. Store read errors are treated as "no usage yet"
//! and store write errors are logged; both are operator problems, not caller
//! problems.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use rapport_core::identity::{Identity, IdentityKey};
use rapport_core::tier::QuotaLimit;
use rapport_core::usage::{AnonymousUsageRecord, QuotaStatus, UsageRecord, ANONYMOUS_LIMIT};
use rapport_store::UsageStore;

type LockMap = DashMap<IdentityKey, Arc<Mutex<()>>>;

pub struct QuotaLedger {
    store: Arc<dyn UsageStore>,
    locks: Arc<LockMap>,
}

/// Outcome of [`QuotaLedger::admit`]. Only an allowed admission can be committed.
pub enum AdmitDecision {
    Allowed(Admission),
    Denied(QuotaStatus),
}

impl AdmitDecision {
    pub fn status(&self) -> QuotaStatus {
        match self {
            Self::Allowed(admission) => admission.status(),
            Self::Denied(status) => *status,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// An allowed admission. Holds the identity's permit until committed or dropped.
pub struct Admission {
    store: Arc<dyn UsageStore>,
    identity: Identity,
    limit: QuotaLimit,
    status: QuotaStatus,
    _permit: IdentityPermit,
}

impl Admission {
    /// Quota status at admission time, before this use is counted.
    pub fn status(&self) -> QuotaStatus {
        self.status
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Count this use. Call only after the analysis succeeded.
    pub fn commit(self) -> QuotaStatus {
        self.commit_at(Utc::now())
    }

    #[instrument(skip_all, fields(identity = %self.identity.key()))]
    pub fn commit_at(self, now: DateTime<Utc>) -> QuotaStatus {
        let stored = match &self.identity {
            Identity::RegisteredUser { id, .. } => {
                self.store.increment_user(id, now).map(|r| r.used)
            }
            Identity::AnonymousDevice { device_id } => {
                self.store.increment_device(device_id, now).map(|r| r.count)
            }
        };

        let used = match stored {
            Ok(used) => used,
            Err(e) => {
                warn!(error = %e, "usage increment failed, reporting locally computed status");
                self.status.used.saturating_add(1)
            }
        };

        debug!(used, limit = %self.limit, "usage committed");
        QuotaStatus::evaluate(used, self.limit)
    }
}

/// Per-identity lock guard. Prunes the identity's lock entry when the last
/// holder releases it.
struct IdentityPermit {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
    key: IdentityKey,
}

impl Drop for IdentityPermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left means nobody holds or awaits it.
        let _ = self
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// The limit that governs an identity, from its entitled tier.
fn limit_for(identity: &Identity) -> QuotaLimit {
    match identity {
        Identity::RegisteredUser { tier, .. } => tier.policy().monthly_limit,
        Identity::AnonymousDevice { .. } => QuotaLimit::Limited(ANONYMOUS_LIMIT),
    }
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Decide whether the identity may run one more analysis.
    ///
    /// When allowed, the returned admission keeps other requests for the same
    /// identity waiting here until it is committed or dropped.
    pub async fn admit(&self, identity: &Identity) -> AdmitDecision {
        self.admit_at(identity, Utc::now()).await
    }

    #[instrument(skip_all, fields(identity = %identity.key()))]
    pub async fn admit_at(&self, identity: &Identity, now: DateTime<Utc>) -> AdmitDecision {
        let permit = self.acquire(identity.key()).await;
        let limit = limit_for(identity);
        let used = self.current_usage(identity, now);
        let status = QuotaStatus::evaluate(used, limit);

        if status.allowed {
            debug!(used, limit = %limit, "admitted");
            AdmitDecision::Allowed(Admission {
                store: Arc::clone(&self.store),
                identity: identity.clone(),
                limit,
                status,
                _permit: permit,
            })
        } else {
            debug!(used, limit = %limit, "denied");
            AdmitDecision::Denied(status)
        }
    }

    /// Read-only quota view. Applies the monthly reset to the returned value
    /// without writing it back.
    pub fn status(&self, identity: &Identity) -> QuotaStatus {
        self.status_at(identity, Utc::now())
    }

    #[instrument(skip_all, fields(identity = %identity.key()))]
    pub fn status_at(&self, identity: &Identity, now: DateTime<Utc>) -> QuotaStatus {
        let used = match identity {
            Identity::RegisteredUser { id, .. } => match self.store.peek_user_usage(id) {
                Ok(record) => record.map_or(0, |r| r.current(now).used),
                Err(e) => {
                    warn!(error = %e, "usage lookup failed, assuming no usage");
                    0
                }
            },
            Identity::AnonymousDevice { device_id } => {
                match self.store.peek_device_usage(device_id) {
                    Ok(record) => record.map_or(0, |r| r.count),
                    Err(e) => {
                        warn!(error = %e, "usage lookup failed, assuming no usage");
                        0
                    }
                }
            }
        };
        QuotaStatus::evaluate(used, limit_for(identity))
    }

    /// Number of identities with a live permit or waiter.
    pub fn active_identities(&self) -> usize {
        self.locks.len()
    }

    async fn acquire(&self, key: IdentityKey) -> IdentityPermit {
        let lock = Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = lock.lock_owned().await;
        IdentityPermit {
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
            key,
        }
    }

    /// Load (or lazily create) the identity's counter, rolling the monthly
    /// period over first when needed.
    fn current_usage(&self, identity: &Identity, now: DateTime<Utc>) -> u32 {
        match identity {
            Identity::RegisteredUser { id, .. } => {
                let record = self.store.user_usage(id, now).unwrap_or_else(|e| {
                    warn!(error = %e, "usage lookup failed, treating as fresh record");
                    UsageRecord::fresh(now)
                });
                if !record.is_from_prior_month(now) {
                    return record.used;
                }
                debug!(period_start = %record.period_start, "new calendar month, resetting usage");
                match self.store.reset_user_period(id, now) {
                    Ok(fresh) => fresh.used,
                    Err(e) => {
                        warn!(error = %e, "usage reset failed, using fresh period locally");
                        0
                    }
                }
            }
            Identity::AnonymousDevice { device_id } => {
                self.store
                    .device_usage(device_id, now)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "usage lookup failed, treating as fresh record");
                        AnonymousUsageRecord::fresh(now)
                    })
                    .count
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::TimeZone;
    use rapport_core::ids::{DeviceId, UserId};
    use rapport_core::tier::Tier;
    use rapport_store::{InMemoryUsageStore, StoreError};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn ledger_with(store: InMemoryUsageStore) -> (QuotaLedger, Arc<InMemoryUsageStore>) {
        let store = Arc::new(store);
        (QuotaLedger::new(store.clone()), store)
    }

    fn seeded_user(id: &str, used: u32, period_start: DateTime<Utc>) -> InMemoryUsageStore {
        InMemoryUsageStore::new().with_user(UserId::from_raw(id), UsageRecord { used, period_start })
    }

    #[tokio::test]
    async fn free_tier_last_use_then_denied() {
        let now = at(2026, 3, 10);
        let (ledger, _) = ledger_with(seeded_user("u1", 1, at(2026, 3, 1)));
        let user = Identity::user("u1", Tier::Free);

        let AdmitDecision::Allowed(admission) = ledger.admit_at(&user, now).await else {
            panic!("expected allowed");
        };
        assert_eq!(admission.status().remaining, Some(1));
        let after = admission.commit_at(now);
        assert_eq!(after.used, 2);
        assert!(!after.allowed);

        let decision = ledger.admit_at(&user, now).await;
        assert!(!decision.is_allowed());
        assert_eq!(decision.status().remaining, Some(0));
    }

    #[tokio::test]
    async fn denied_admission_does_not_touch_usage() {
        let now = at(2026, 3, 10);
        let (ledger, store) = ledger_with(seeded_user("u1", 2, at(2026, 3, 1)));
        let user = Identity::user("u1", Tier::Free);

        for _ in 0..3 {
            assert!(!ledger.admit_at(&user, now).await.is_allowed());
        }
        let record = store.peek_user_usage(&UserId::from_raw("u1")).unwrap().unwrap();
        assert_eq!(record.used, 2);
    }

    #[tokio::test]
    async fn dropped_admission_is_not_counted() {
        let now = at(2026, 3, 10);
        let (ledger, store) = ledger_with(InMemoryUsageStore::new());
        let user = Identity::user("u1", Tier::Personal);

        let decision = ledger.admit_at(&user, now).await;
        assert!(decision.is_allowed());
        drop(decision);

        let record = store.peek_user_usage(&UserId::from_raw("u1")).unwrap().unwrap();
        assert_eq!(record.used, 0);
    }

    #[tokio::test]
    async fn anonymous_device_at_limit_is_denied() {
        let now = at(2026, 3, 10);
        let store = InMemoryUsageStore::new().with_device(
            DeviceId::from_raw("d1"),
            AnonymousUsageRecord { count: 2, last_used_at: at(2025, 1, 1) },
        );
        let (ledger, _) = ledger_with(store);

        let decision = ledger.admit_at(&Identity::device("d1"), now).await;
        assert!(!decision.is_allowed());
        let status = decision.status();
        assert_eq!(status.used, 2);
        assert_eq!(status.limit, QuotaLimit::Limited(ANONYMOUS_LIMIT));
    }

    #[tokio::test]
    async fn anonymous_usage_never_resets() {
        let (ledger, _) = ledger_with(InMemoryUsageStore::new());
        let device = Identity::device("d1");

        for month in 1..=2 {
            let AdmitDecision::Allowed(a) = ledger.admit_at(&device, at(2026, month, 5)).await else {
                panic!("expected allowed in month {month}");
            };
            let _ = a.commit_at(at(2026, month, 5));
        }
        assert!(!ledger.admit_at(&device, at(2027, 6, 1)).await.is_allowed());
    }

    #[tokio::test]
    async fn monthly_reset_regardless_of_months_elapsed() {
        for period_start in [at(2026, 2, 28), at(2025, 11, 1), at(2019, 6, 15)] {
            let (ledger, store) = ledger_with(seeded_user("u1", 2, period_start));
            let user = Identity::user("u1", Tier::Free);
            let now = at(2026, 3, 1);

            let decision = ledger.admit_at(&user, now).await;
            assert!(decision.is_allowed(), "period_start {period_start}");
            assert_eq!(decision.status().used, 0);

            let stored = store.peek_user_usage(&UserId::from_raw("u1")).unwrap().unwrap();
            assert_eq!(stored, UsageRecord::fresh(now));
        }
    }

    #[tokio::test]
    async fn unlimited_tier_reports_no_remaining() {
        let (ledger, _) = ledger_with(seeded_user("u1", 10_000, at(2026, 3, 1)));
        let decision = ledger.admit_at(&Identity::user("u1", Tier::Beta), at(2026, 3, 2)).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().limit, QuotaLimit::Unlimited);
        assert_eq!(decision.status().remaining, None);
    }

    #[tokio::test]
    async fn upgrade_keeps_count() {
        let now = at(2026, 3, 10);
        let (ledger, _) = ledger_with(seeded_user("u1", 2, at(2026, 3, 1)));

        assert!(!ledger.admit_at(&Identity::user("u1", Tier::Free), now).await.is_allowed());
        let decision = ledger.admit_at(&Identity::user("u1", Tier::Personal), now).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.status().remaining, Some(8));
    }

    #[test]
    fn status_is_read_only() {
        let (ledger, store) = ledger_with(seeded_user("u1", 1, at(2026, 1, 20)));
        let user = Identity::user("u1", Tier::Free);

        // Month rolled over: the view is reset, the stored record is not.
        let status = ledger.status_at(&user, at(2026, 2, 1));
        assert_eq!(status.used, 0);
        assert_eq!(status.remaining, Some(2));
        assert_eq!(
            store.peek_user_usage(&UserId::from_raw("u1")).unwrap().unwrap().used,
            1
        );

        // Unknown identities are not created.
        let status = ledger.status_at(&Identity::device("new"), at(2026, 2, 1));
        assert_eq!(status.used, 0);
        assert!(store.peek_device_usage(&DeviceId::from_raw("new")).unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_admissions_at_last_slot_admit_exactly_one() {
        let (ledger, store) = ledger_with(seeded_user("u1", 1, Utc::now()));
        let ledger = Arc::new(ledger);
        let user = Identity::user("u1", Tier::Free);

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let user = user.clone();
                tokio::spawn(async move {
                    match ledger.admit(&user).await {
                        AdmitDecision::Allowed(admission) => {
                            // Simulate the analysis running while the permit is held.
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            let _ = admission.commit();
                            true
                        }
                        AdmitDecision::Denied(_) => false,
                    }
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(store.peek_user_usage(&UserId::from_raw("u1")).unwrap().unwrap().used, 2);
    }

    #[tokio::test]
    async fn different_identities_do_not_block_each_other() {
        let (ledger, _) = ledger_with(InMemoryUsageStore::new());
        let held = ledger.admit(&Identity::user("a", Tier::Pro)).await;
        assert!(held.is_allowed());

        let other = tokio::time::timeout(
            Duration::from_millis(100),
            ledger.admit(&Identity::user("b", Tier::Pro)),
        )
        .await;
        assert!(other.is_ok(), "second identity should not wait on the first");
        drop(held);
    }

    #[tokio::test]
    async fn idle_locks_are_pruned() {
        let (ledger, _) = ledger_with(InMemoryUsageStore::new());
        let decision = ledger.admit(&Identity::device("d1")).await;
        assert_eq!(ledger.active_identities(), 1);
        drop(decision);
        assert_eq!(ledger.active_identities(), 0);

        let denied = InMemoryUsageStore::new().with_device(
            DeviceId::from_raw("d2"),
            AnonymousUsageRecord { count: 5, last_used_at: Utc::now() },
        );
        let (ledger, _) = ledger_with(denied);
        assert!(!ledger.admit(&Identity::device("d2")).await.is_allowed());
        assert_eq!(ledger.active_identities(), 0);
    }

    /// Store whose every call fails.
    struct BrokenStore;

    impl UsageStore for BrokenStore {
        fn user_usage(&self, _: &UserId, _: DateTime<Utc>) -> Result<UsageRecord, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
        fn peek_user_usage(&self, _: &UserId) -> Result<Option<UsageRecord>, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
        fn reset_user_period(&self, _: &UserId, _: DateTime<Utc>) -> Result<UsageRecord, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
        fn increment_user(&self, _: &UserId, _: DateTime<Utc>) -> Result<UsageRecord, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
        fn device_usage(
            &self,
            _: &DeviceId,
            _: DateTime<Utc>,
        ) -> Result<AnonymousUsageRecord, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
        fn peek_device_usage(
            &self,
            _: &DeviceId,
        ) -> Result<Option<AnonymousUsageRecord>, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
        fn increment_device(
            &self,
            _: &DeviceId,
            _: DateTime<Utc>,
        ) -> Result<AnonymousUsageRecord, StoreError> {
            Err(StoreError::Database("disk I/O error".into()))
        }
    }

    #[tokio::test]
    async fn store_failures_never_fail_the_ledger() {
        let ledger = QuotaLedger::new(Arc::new(BrokenStore));
        let user = Identity::user("u1", Tier::Free);

        let AdmitDecision::Allowed(admission) = ledger.admit(&user).await else {
            panic!("lookup failure must read as a fresh record");
        };
        let after = admission.commit();
        assert_eq!(after.used, 1);
        assert_eq!(after.remaining, Some(1));

        assert_eq!(ledger.status(&Identity::device("d1")).used, 0);
    }
}
