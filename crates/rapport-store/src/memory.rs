use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use rapport_core::ids::{DeviceId, UserId};
use rapport_core::usage::{AnonymousUsageRecord, UsageRecord};

use crate::error::StoreError;
use crate::usage::UsageStore;

/// Process-local usage store, for tests and embedders that keep quota
/// state elsewhere.
#[derive(Default)]
pub struct InMemoryUsageStore {
    users: Mutex<HashMap<UserId, UsageRecord>>,
    devices: Mutex<HashMap<DeviceId, AnonymousUsageRecord>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user's record directly.
    pub fn with_user(self, user: UserId, record: UsageRecord) -> Self {
        let _ = self.users.lock().insert(user, record);
        self
    }

    /// Seed a device's record directly.
    pub fn with_device(self, device: DeviceId, record: AnonymousUsageRecord) -> Self {
        let _ = self.devices.lock().insert(device, record);
        self
    }
}

impl UsageStore for InMemoryUsageStore {
    fn user_usage(&self, user: &UserId, now: DateTime<Utc>) -> Result<UsageRecord, StoreError> {
        Ok(self
            .users
            .lock()
            .entry(user.clone())
            .or_insert_with(|| UsageRecord::fresh(now))
            .clone())
    }

    fn peek_user_usage(&self, user: &UserId) -> Result<Option<UsageRecord>, StoreError> {
        Ok(self.users.lock().get(user).cloned())
    }

    fn reset_user_period(
        &self,
        user: &UserId,
        period_start: DateTime<Utc>,
    ) -> Result<UsageRecord, StoreError> {
        let record = UsageRecord::fresh(period_start);
        let _ = self.users.lock().insert(user.clone(), record.clone());
        Ok(record)
    }

    fn increment_user(&self, user: &UserId, now: DateTime<Utc>) -> Result<UsageRecord, StoreError> {
        let mut users = self.users.lock();
        let record = users
            .entry(user.clone())
            .or_insert_with(|| UsageRecord::fresh(now));
        record.used = record.used.saturating_add(1);
        Ok(record.clone())
    }

    fn device_usage(
        &self,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<AnonymousUsageRecord, StoreError> {
        Ok(self
            .devices
            .lock()
            .entry(device.clone())
            .or_insert_with(|| AnonymousUsageRecord::fresh(now))
            .clone())
    }

    fn peek_device_usage(
        &self,
        device: &DeviceId,
    ) -> Result<Option<AnonymousUsageRecord>, StoreError> {
        Ok(self.devices.lock().get(device).cloned())
    }

    fn increment_device(
        &self,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<AnonymousUsageRecord, StoreError> {
        let mut devices = self.devices.lock();
        let record = devices
            .entry(device.clone())
            .or_insert_with(|| AnonymousUsageRecord::fresh(now));
        record.count = record.count.saturating_add(1);
        record.last_used_at = now;
        Ok(record.clone())
    }
}
