//! Per-identity spend tracking against daily and monthly caps.
//!
//! Spend accumulates per identity in two calendar ledgers. The daily ledger
//! resets at midnight UTC, the monthly ledger on the first of each month;
//! resets happen lazily on access by comparing the ledger's period start to
//! the current instant. Admission requires accumulated spend *strictly
//! below* both limits; a call that lands exactly on a limit is rejected.

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::BudgetConfig;

/// The budget period that rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// The daily ledger (resets at midnight UTC).
    Daily,
    /// The monthly ledger (resets on the first of the month, UTC).
    Monthly,
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => f.write_str("daily"),
            Self::Monthly => f.write_str("monthly"),
        }
    }
}

/// Verdict of a budget check.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetVerdict {
    /// Spend in both periods is strictly below the limit.
    Allowed,
    /// A period's accumulated spend has reached its limit.
    Exceeded {
        /// The first period found at or over its limit (daily first).
        period: BudgetPeriod,
        /// Accumulated spend in that period, USD.
        spent: f64,
        /// Configured limit for that period, USD.
        limit: f64,
    },
}

/// Start of the UTC day containing `now`.
fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Start of the UTC month containing `now`.
fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now.date_naive().with_day(1).unwrap_or(now.date_naive());
    first.and_time(NaiveTime::MIN).and_utc()
}

/// One identity's pair of calendar ledgers.
#[derive(Debug, Clone)]
struct Ledgers {
    daily_spent: f64,
    daily_start: DateTime<Utc>,
    monthly_spent: f64,
    monthly_start: DateTime<Utc>,
}

impl Ledgers {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_spent: 0.0,
            daily_start: day_start(now),
            monthly_spent: 0.0,
            monthly_start: month_start(now),
        }
    }

    /// Zero any ledger whose period has rolled over since its start.
    fn roll_over(&mut self, now: DateTime<Utc>) {
        let today = day_start(now);
        if today > self.daily_start {
            self.daily_spent = 0.0;
            self.daily_start = today;
        }
        let this_month = month_start(now);
        if this_month > self.monthly_start {
            self.monthly_spent = 0.0;
            self.monthly_start = this_month;
        }
    }
}

/// Spend position of one period.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodStatus {
    /// Accumulated spend this period, USD.
    pub spent: f64,
    /// Configured limit, USD.
    pub limit: f64,
    /// Remaining headroom, USD (zero when at or over the limit).
    pub remaining: f64,
}

/// Spend position of one identity across both periods.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    /// Daily period position.
    pub daily: PeriodStatus,
    /// Monthly period position.
    pub monthly: PeriodStatus,
}

/// Per-identity budget enforcement.
///
/// Check and record are separate steps on purpose: actual cost is only
/// known after a provider call completes, so admission uses spend to date
/// and the completed call's cost is recorded afterwards. Failed calls must
/// not be recorded.
pub struct BudgetTracker {
    ledgers: DashMap<String, Ledgers>,
    daily_limit: f64,
    monthly_limit: f64,
}

impl BudgetTracker {
    /// Create a tracker with the configured period limits.
    pub fn new(config: &BudgetConfig) -> Self {
        Self {
            ledgers: DashMap::new(),
            daily_limit: config.daily_limit_usd,
            monthly_limit: config.monthly_limit_usd,
        }
    }

    /// Check whether `identity` may spend: both periods must be strictly
    /// below their limit. Consumes nothing.
    pub fn check(&self, identity: &str) -> BudgetVerdict {
        self.check_at(identity, Utc::now())
    }

    pub(crate) fn check_at(&self, identity: &str, now: DateTime<Utc>) -> BudgetVerdict {
        let mut entry = self
            .ledgers
            .entry(identity.to_string())
            .or_insert_with(|| Ledgers::new(now));
        entry.roll_over(now);

        if entry.daily_spent >= self.daily_limit {
            warn!(
                identity,
                spent = entry.daily_spent,
                limit = self.daily_limit,
                "daily budget exhausted"
            );
            return BudgetVerdict::Exceeded {
                period: BudgetPeriod::Daily,
                spent: entry.daily_spent,
                limit: self.daily_limit,
            };
        }
        if entry.monthly_spent >= self.monthly_limit {
            warn!(
                identity,
                spent = entry.monthly_spent,
                limit = self.monthly_limit,
                "monthly budget exhausted"
            );
            return BudgetVerdict::Exceeded {
                period: BudgetPeriod::Monthly,
                spent: entry.monthly_spent,
                limit: self.monthly_limit,
            };
        }
        BudgetVerdict::Allowed
    }

    /// Record the actual cost of a completed call against both ledgers.
    pub fn record(&self, identity: &str, cost_usd: f64) {
        self.record_at(identity, cost_usd, Utc::now());
    }

    pub(crate) fn record_at(&self, identity: &str, cost_usd: f64, now: DateTime<Utc>) {
        let mut entry = self
            .ledgers
            .entry(identity.to_string())
            .or_insert_with(|| Ledgers::new(now));
        entry.roll_over(now);
        entry.daily_spent += cost_usd;
        entry.monthly_spent += cost_usd;
        debug!(
            identity,
            cost_usd,
            daily_spent = entry.daily_spent,
            monthly_spent = entry.monthly_spent,
            "spend recorded"
        );
    }

    /// Current spend position for an identity.
    pub fn status(&self, identity: &str) -> BudgetStatus {
        self.status_at(identity, Utc::now())
    }

    pub(crate) fn status_at(&self, identity: &str, now: DateTime<Utc>) -> BudgetStatus {
        let (daily_spent, monthly_spent) = match self.ledgers.get_mut(identity) {
            Some(mut entry) => {
                entry.roll_over(now);
                (entry.daily_spent, entry.monthly_spent)
            }
            None => (0.0, 0.0),
        };
        BudgetStatus {
            daily: PeriodStatus {
                spent: daily_spent,
                limit: self.daily_limit,
                remaining: (self.daily_limit - daily_spent).max(0.0),
            },
            monthly: PeriodStatus {
                spent: monthly_spent,
                limit: self.monthly_limit,
                remaining: (self.monthly_limit - monthly_spent).max(0.0),
            },
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracker(daily: f64, monthly: f64) -> BudgetTracker {
        BudgetTracker::new(&BudgetConfig {
            daily_limit_usd: daily,
            monthly_limit_usd: monthly,
        })
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    // -- enforcement -----------------------------------------------------

    #[test]
    fn test_fresh_identity_is_allowed() {
        let bt = tracker(100.0, 1000.0);
        assert_eq!(bt.check("alice"), BudgetVerdict::Allowed);
    }

    #[test]
    fn test_spend_at_daily_limit_is_rejected() {
        let bt = tracker(10.0, 1000.0);
        let now = at(2026, 3, 15, 12);
        bt.record_at("alice", 10.0, now);
        match bt.check_at("alice", now) {
            BudgetVerdict::Exceeded { period, spent, limit } => {
                assert_eq!(period, BudgetPeriod::Daily);
                assert_eq!(spent, 10.0);
                assert_eq!(limit, 10.0);
            }
            BudgetVerdict::Allowed => panic!("spend equal to limit must reject"),
        }
    }

    #[test]
    fn test_spend_just_below_limit_is_allowed() {
        let bt = tracker(10.0, 1000.0);
        let now = at(2026, 3, 15, 12);
        bt.record_at("alice", 9.99, now);
        assert_eq!(bt.check_at("alice", now), BudgetVerdict::Allowed);
    }

    #[test]
    fn test_monthly_limit_binds_across_days() {
        let bt = tracker(100.0, 150.0);
        bt.record_at("bob", 90.0, at(2026, 3, 1, 12));
        bt.record_at("bob", 60.0, at(2026, 3, 2, 12));
        // Daily ledger reset overnight, monthly did not: 150 >= 150.
        match bt.check_at("bob", at(2026, 3, 2, 13)) {
            BudgetVerdict::Exceeded { period, .. } => assert_eq!(period, BudgetPeriod::Monthly),
            BudgetVerdict::Allowed => panic!("monthly cap should bind"),
        }
    }

    #[test]
    fn test_check_consumes_nothing() {
        let bt = tracker(10.0, 1000.0);
        let now = at(2026, 3, 15, 12);
        for _ in 0..100 {
            assert_eq!(bt.check_at("carol", now), BudgetVerdict::Allowed);
        }
        assert_eq!(bt.status_at("carol", now).daily.spent, 0.0);
    }

    // -- calendar resets -------------------------------------------------

    #[test]
    fn test_daily_resets_at_midnight_utc() {
        let bt = tracker(10.0, 1000.0);
        bt.record_at("dave", 10.0, at(2026, 3, 15, 23));
        assert!(matches!(
            bt.check_at("dave", at(2026, 3, 15, 23)),
            BudgetVerdict::Exceeded { .. }
        ));
        // One hour later is the next UTC day.
        assert_eq!(bt.check_at("dave", at(2026, 3, 16, 0)), BudgetVerdict::Allowed);
        assert_eq!(bt.status_at("dave", at(2026, 3, 16, 0)).daily.spent, 0.0);
    }

    #[test]
    fn test_monthly_survives_daily_reset() {
        let bt = tracker(10.0, 1000.0);
        bt.record_at("erin", 10.0, at(2026, 3, 15, 12));
        let status = bt.status_at("erin", at(2026, 3, 16, 12));
        assert_eq!(status.daily.spent, 0.0);
        assert_eq!(status.monthly.spent, 10.0);
    }

    #[test]
    fn test_monthly_resets_on_first_of_month() {
        let bt = tracker(1000.0, 100.0);
        bt.record_at("frank", 100.0, at(2026, 3, 31, 12));
        assert!(matches!(
            bt.check_at("frank", at(2026, 3, 31, 13)),
            BudgetVerdict::Exceeded { .. }
        ));
        assert_eq!(bt.check_at("frank", at(2026, 4, 1, 0)), BudgetVerdict::Allowed);
        assert_eq!(bt.status_at("frank", at(2026, 4, 1, 0)).monthly.spent, 0.0);
    }

    // -- isolation and status --------------------------------------------

    #[test]
    fn test_identities_tracked_separately() {
        let bt = tracker(10.0, 1000.0);
        let now = at(2026, 3, 15, 12);
        bt.record_at("tenant-a", 10.0, now);
        assert!(matches!(
            bt.check_at("tenant-a", now),
            BudgetVerdict::Exceeded { .. }
        ));
        assert_eq!(bt.check_at("tenant-b", now), BudgetVerdict::Allowed);
    }

    #[test]
    fn test_status_reports_remaining_headroom() {
        let bt = tracker(100.0, 1000.0);
        let now = at(2026, 3, 15, 12);
        bt.record_at("gina", 30.0, now);
        let status = bt.status_at("gina", now);
        assert_eq!(status.daily.spent, 30.0);
        assert_eq!(status.daily.remaining, 70.0);
        assert_eq!(status.monthly.remaining, 970.0);
    }

    #[test]
    fn test_status_for_unseen_identity_is_zero_spend() {
        let bt = tracker(100.0, 1000.0);
        let status = bt.status("never-seen");
        assert_eq!(status.daily.spent, 0.0);
        assert_eq!(status.daily.remaining, 100.0);
    }

    #[test]
    fn test_remaining_clamped_at_zero_when_over() {
        let bt = tracker(10.0, 1000.0);
        let now = at(2026, 3, 15, 12);
        bt.record_at("henry", 15.0, now);
        assert_eq!(bt.status_at("henry", now).daily.remaining, 0.0);
    }

    #[test]
    fn test_period_display() {
        assert_eq!(BudgetPeriod::Daily.to_string(), "daily");
        assert_eq!(BudgetPeriod::Monthly.to_string(), "monthly");
    }
}
