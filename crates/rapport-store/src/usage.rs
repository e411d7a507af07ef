use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::instrument;

use rapport_core::ids::{DeviceId, UserId};
use rapport_core::usage::{AnonymousUsageRecord, UsageRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_timestamp, get, get_timestamp};

/// Persistence seam for quota counters.
///
/// Implementations must make each method atomic on its own; the quota
/// ledger serializes admit/commit per identity on top of that.
pub trait UsageStore: Send + Sync {
    /// Load the user's record, creating `{used: 0, periodStart: now}` if absent.
    fn user_usage(&self, user: &UserId, now: DateTime<Utc>) -> Result<UsageRecord, StoreError>;

    /// Load the user's record without creating one.
    fn peek_user_usage(&self, user: &UserId) -> Result<Option<UsageRecord>, StoreError>;

    /// Zero the counter and start a new period at `period_start`.
    fn reset_user_period(
        &self,
        user: &UserId,
        period_start: DateTime<Utc>,
    ) -> Result<UsageRecord, StoreError>;

    /// Atomically add one use and return the updated record.
    fn increment_user(&self, user: &UserId, now: DateTime<Utc>) -> Result<UsageRecord, StoreError>;

    /// Load the device's record, creating `{count: 0, lastUsedAt: now}` if absent.
    fn device_usage(
        &self,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<AnonymousUsageRecord, StoreError>;

    fn peek_device_usage(&self, device: &DeviceId)
        -> Result<Option<AnonymousUsageRecord>, StoreError>;

    /// Atomically add one use, stamp `lastUsedAt`, and return the updated record.
    fn increment_device(
        &self,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<AnonymousUsageRecord, StoreError>;
}

/// SQLite-backed usage store.
pub struct SqliteUsageStore {
    db: Database,
}

impl SqliteUsageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn user_row(row: &rusqlite::Row<'_>) -> Result<UsageRecord, StoreError> {
    Ok(UsageRecord {
        used: get(row, 0, "user_usage", "used")?,
        period_start: get_timestamp(row, 1, "user_usage", "period_start")?,
    })
}

fn device_row(row: &rusqlite::Row<'_>) -> Result<AnonymousUsageRecord, StoreError> {
    Ok(AnonymousUsageRecord {
        count: get(row, 0, "device_usage", "count")?,
        last_used_at: get_timestamp(row, 1, "device_usage", "last_used_at")?,
    })
}

/// Run a single-row query and map it with a fallible row converter.
fn query_one<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&rusqlite::Row<'_>) -> Result<T, StoreError>,
) -> Result<Option<T>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let record = match rows.next()? {
        Some(row) => Some(map(row)?),
        None => None,
    };
    Ok(record)
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, StoreError> {
    value.ok_or_else(|| StoreError::Database(format!("{what}: no row returned")))
}

fn ensure_user(conn: &Connection, user: &UserId, now: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO user_usage (user_id, used, period_start, updated_at)
         VALUES (?1, 0, ?2, ?2)",
        rusqlite::params![user.as_str(), now],
    )?;
    Ok(())
}

fn ensure_device(conn: &Connection, device: &DeviceId, now: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO device_usage (device_id, count, first_used_at, last_used_at)
         VALUES (?1, 0, ?2, ?2)",
        rusqlite::params![device.as_str(), now],
    )?;
    Ok(())
}

impl UsageStore for SqliteUsageStore {
    #[instrument(skip(self, user))]
    fn user_usage(&self, user: &UserId, now: DateTime<Utc>) -> Result<UsageRecord, StoreError> {
        let now = format_timestamp(now);
        self.db.with_conn(|conn| {
            ensure_user(conn, user, &now)?;
            let record = query_one(
                conn,
                "SELECT used, period_start FROM user_usage WHERE user_id = ?1",
                [user.as_str()],
                user_row,
            )?;
            required(record, "user_usage")
        })
    }

    fn peek_user_usage(&self, user: &UserId) -> Result<Option<UsageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            query_one(
                conn,
                "SELECT used, period_start FROM user_usage WHERE user_id = ?1",
                [user.as_str()],
                user_row,
            )
        })
    }

    #[instrument(skip(self, user))]
    fn reset_user_period(
        &self,
        user: &UserId,
        period_start: DateTime<Utc>,
    ) -> Result<UsageRecord, StoreError> {
        let start = format_timestamp(period_start);
        self.db.with_conn(|conn| {
            ensure_user(conn, user, &start)?;
            let record = query_one(
                conn,
                "UPDATE user_usage SET used = 0, period_start = ?2, updated_at = ?2
                 WHERE user_id = ?1
                 RETURNING used, period_start",
                rusqlite::params![user.as_str(), start],
                user_row,
            )?;
            required(record, "reset user_usage")
        })
    }

    #[instrument(skip(self, user))]
    fn increment_user(&self, user: &UserId, now: DateTime<Utc>) -> Result<UsageRecord, StoreError> {
        let now = format_timestamp(now);
        self.db.with_conn(|conn| {
            ensure_user(conn, user, &now)?;
            let record = query_one(
                conn,
                "UPDATE user_usage SET used = used + 1, updated_at = ?2
                 WHERE user_id = ?1
                 RETURNING used, period_start",
                rusqlite::params![user.as_str(), now],
                user_row,
            )?;
            required(record, "increment user_usage")
        })
    }

    #[instrument(skip(self, device))]
    fn device_usage(
        &self,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<AnonymousUsageRecord, StoreError> {
        let now = format_timestamp(now);
        self.db.with_conn(|conn| {
            ensure_device(conn, device, &now)?;
            let record = query_one(
                conn,
                "SELECT count, last_used_at FROM device_usage WHERE device_id = ?1",
                [device.as_str()],
                device_row,
            )?;
            required(record, "device_usage")
        })
    }

    fn peek_device_usage(
        &self,
        device: &DeviceId,
    ) -> Result<Option<AnonymousUsageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            query_one(
                conn,
                "SELECT count, last_used_at FROM device_usage WHERE device_id = ?1",
                [device.as_str()],
                device_row,
            )
        })
    }

    #[instrument(skip(self, device))]
    fn increment_device(
        &self,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<AnonymousUsageRecord, StoreError> {
        let now = format_timestamp(now);
        self.db.with_conn(|conn| {
            ensure_device(conn, device, &now)?;
            let record = query_one(
                conn,
                "UPDATE device_usage SET count = count + 1, last_used_at = ?2
                 WHERE device_id = ?1
                 RETURNING count, last_used_at",
                rusqlite::params![device.as_str(), now],
                device_row,
            )?;
            required(record, "increment device_usage")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryUsageStore;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).unwrap()
    }

    fn sqlite() -> SqliteUsageStore {
        SqliteUsageStore::new(Database::in_memory().unwrap())
    }

    /// Behaviour every UsageStore implementation must share.
    fn contract(store: &dyn UsageStore) {
        let user = UserId::from_raw("usr_contract");
        let t0 = at(2026, 3, 10);

        // Peek does not create.
        assert_eq!(store.peek_user_usage(&user).unwrap(), None);

        // Get-or-create is idempotent and keeps the first period start.
        let rec = store.user_usage(&user, t0).unwrap();
        assert_eq!(rec, UsageRecord::fresh(t0));
        let again = store.user_usage(&user, at(2026, 3, 20)).unwrap();
        assert_eq!(again.period_start, t0);

        // Increments are exactly +1 and keep the period.
        assert_eq!(store.increment_user(&user, at(2026, 3, 11)).unwrap().used, 1);
        let rec = store.increment_user(&user, at(2026, 3, 12)).unwrap();
        assert_eq!(rec.used, 2);
        assert_eq!(rec.period_start, t0);
        assert_eq!(store.peek_user_usage(&user).unwrap(), Some(rec));

        // Reset zeroes and moves the period.
        let t1 = at(2026, 4, 2);
        let rec = store.reset_user_period(&user, t1).unwrap();
        assert_eq!(rec, UsageRecord::fresh(t1));
        assert_eq!(store.increment_user(&user, t1).unwrap().used, 1);

        // Increment on an unknown user creates it with one use.
        let other = UserId::from_raw("usr_other");
        let rec = store.increment_user(&other, t0).unwrap();
        assert_eq!(rec.used, 1);
        assert_eq!(rec.period_start, t0);

        // Devices.
        let device = DeviceId::from_raw("dev_contract");
        assert_eq!(store.peek_device_usage(&device).unwrap(), None);
        let rec = store.device_usage(&device, t0).unwrap();
        assert_eq!(rec, AnonymousUsageRecord::fresh(t0));

        let later = at(2027, 1, 1);
        let rec = store.increment_device(&device, later).unwrap();
        assert_eq!(rec.count, 1);
        assert_eq!(rec.last_used_at, later);
        let rec = store.increment_device(&device, later).unwrap();
        assert_eq!(rec.count, 2);
        assert_eq!(store.peek_device_usage(&device).unwrap(), Some(rec));

        // Users and devices never share counters even with equal raw ids.
        let same_raw_user = UserId::from_raw("dev_contract");
        assert_eq!(store.user_usage(&same_raw_user, t0).unwrap().used, 0);
    }

    #[test]
    fn sqlite_store_contract() {
        contract(&sqlite());
    }

    #[test]
    fn in_memory_store_contract() {
        contract(&InMemoryUsageStore::new());
    }

    #[test]
    fn sqlite_usage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.db");
        let user = UserId::from_raw("usr_persist");

        {
            let store = SqliteUsageStore::new(Database::open(&path).unwrap());
            store.increment_user(&user, at(2026, 5, 1)).unwrap();
            store.increment_user(&user, at(2026, 5, 2)).unwrap();
        }

        let store = SqliteUsageStore::new(Database::open(&path).unwrap());
        assert_eq!(store.peek_user_usage(&user).unwrap().unwrap().used, 2);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let store = std::sync::Arc::new(sqlite());
        let device = DeviceId::from_raw("dev_busy");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let device = device.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store.increment_device(&device, Utc::now()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.peek_device_usage(&device).unwrap().unwrap().count, 200);
    }

    #[test]
    fn corrupt_timestamp_surfaces_as_error() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_usage (user_id, used, period_start, updated_at)
                 VALUES ('usr_bad', 1, 'not-a-date', 'not-a-date')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let store = SqliteUsageStore::new(db);
        let err = store.peek_user_usage(&UserId::from_raw("usr_bad")).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "period_start", .. }));
    }
}
