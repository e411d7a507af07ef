use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::tier::QuotaLimit;

/// Lifetime allowance for an anonymous device, independent of any tier policy.
pub const ANONYMOUS_LIMIT: u32 = 2;

/// Monthly usage of a registered user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub used: u32,
    pub period_start: DateTime<Utc>,
}

impl UsageRecord {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            used: 0,
            period_start: now,
        }
    }

    /// True when `period_start` lies in an earlier calendar month than `now`.
    pub fn is_from_prior_month(&self, now: DateTime<Utc>) -> bool {
        month_index(self.period_start) < month_index(now)
    }

    /// The record as it should look at `now`: reset when the month rolled over.
    pub fn current(&self, now: DateTime<Utc>) -> Self {
        if self.is_from_prior_month(now) {
            Self::fresh(now)
        } else {
            self.clone()
        }
    }
}

fn month_index(at: DateTime<Utc>) -> i64 {
    i64::from(at.year()) * 12 + i64::from(at.month0())
}

/// Lifetime usage of an anonymous device. Never resets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousUsageRecord {
    pub count: u32,
    pub last_used_at: DateTime<Utc>,
}

impl AnonymousUsageRecord {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            last_used_at: now,
        }
    }
}

/// Quota decision and counters, returned alongside every analysis so the
/// presentation layer can render "N of M analyses remaining".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub allowed: bool,
    pub used: u32,
    pub limit: QuotaLimit,
    /// Omitted when the limit is unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
}

impl QuotaStatus {
    pub fn evaluate(used: u32, limit: QuotaLimit) -> Self {
        Self {
            allowed: limit.admits(used),
            used,
            limit,
            remaining: limit.remaining(used),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn same_month_is_not_stale() {
        let rec = UsageRecord {
            used: 3,
            period_start: at(2026, 3, 1),
        };
        assert!(!rec.is_from_prior_month(at(2026, 3, 31)));
        assert_eq!(rec.current(at(2026, 3, 31)).used, 3);
    }

    #[test]
    fn calendar_boundary_not_rolling_window() {
        // One day apart but across a month boundary.
        let rec = UsageRecord {
            used: 2,
            period_start: at(2026, 3, 31),
        };
        assert!(rec.is_from_prior_month(at(2026, 4, 1)));
        // Thirty days apart inside the same month.
        let rec = UsageRecord {
            used: 2,
            period_start: at(2026, 5, 1),
        };
        assert!(!rec.is_from_prior_month(at(2026, 5, 31)));
    }

    #[test]
    fn year_boundary_and_many_months() {
        let rec = UsageRecord {
            used: 9,
            period_start: at(2024, 12, 15),
        };
        assert!(rec.is_from_prior_month(at(2025, 1, 2)));
        let now = at(2026, 10, 19);
        let current = rec.current(now);
        assert_eq!(current.used, 0);
        assert_eq!(current.period_start, now);
    }

    #[test]
    fn future_period_start_is_left_alone() {
        let rec = UsageRecord {
            used: 1,
            period_start: at(2026, 6, 1),
        };
        assert!(!rec.is_from_prior_month(at(2026, 5, 30)));
    }

    #[test]
    fn status_evaluation() {
        let s = QuotaStatus::evaluate(1, QuotaLimit::Limited(2));
        assert!(s.allowed);
        assert_eq!(s.remaining, Some(1));

        let s = QuotaStatus::evaluate(2, QuotaLimit::Limited(2));
        assert!(!s.allowed);
        assert_eq!(s.remaining, Some(0));

        let s = QuotaStatus::evaluate(500, QuotaLimit::Unlimited);
        assert!(s.allowed);
        assert_eq!(s.remaining, None);
    }

    #[test]
    fn status_wire_format() {
        let json = serde_json::to_value(QuotaStatus::evaluate(1, QuotaLimit::Limited(2))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"allowed": true, "used": 1, "limit": 2, "remaining": 1})
        );

        let json = serde_json::to_value(QuotaStatus::evaluate(4, QuotaLimit::Unlimited)).unwrap();
        assert_eq!(json["limit"], "unlimited");
        assert!(json.get("remaining").is_none());
    }
}
