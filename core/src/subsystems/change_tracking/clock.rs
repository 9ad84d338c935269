use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

/// # NDOC
/// component: `subsystems::change_tracking::clock`
/// purpose: The fixed set of post-detection horizons the checkpoint engine evaluates.
pub const HORIZONS_DAYS: [u32; 5] = [7, 14, 30, 60, 90];

/// # NDOC
/// component: `subsystems::change_tracking::clock`
/// purpose: Baseline screenshots older than this are considered stale (spec.md §4.3).
pub const BASELINE_STALENESS_DAYS: i64 = 14;

/// # NDOC
/// component: `subsystems::change_tracking::clock`
/// purpose: Compute the set of horizons newly due for a change, given its detection time,
///   the current instant, and the horizons already computed.
/// invariants:
///   - `H = {h in HORIZONS_DAYS : now >= first_detected_at + h days AND h not in existing}`.
///   - A change with an empty `H` is skipped by the eligibility scan (spec.md §4.5), which is
///     exactly what lets an older, partially-processed change catch up later.
pub fn due_horizons(
    first_detected_at: DateTime<Utc>,
    now: DateTime<Utc>,
    existing: &BTreeSet<u32>,
) -> Vec<u32> {
    HORIZONS_DAYS
        .iter()
        .copied()
        .filter(|h| !existing.contains(h))
        .filter(|h| now >= first_detected_at + Duration::days(*h as i64))
        .collect()
}

/// # NDOC
/// component: `subsystems::change_tracking::clock`
/// purpose: The `[changeDate - h, changeDate)` / `(changeDate, changeDate + h]` window pair
///   used to pull before/after metrics for one horizon.
pub fn horizon_windows(
    change_date: DateTime<Utc>,
    horizon_days: u32,
) -> ((DateTime<Utc>, DateTime<Utc>), (DateTime<Utc>, DateTime<Utc>)) {
    let span = Duration::days(horizon_days as i64);
    let before = (change_date - span, change_date);
    let after = (change_date, change_date + span);
    (before, after)
}

/// # NDOC
/// component: `subsystems::change_tracking::clock`
/// purpose: Whether a page's baseline analysis is stale (absent, or older than 14 days).
pub fn baseline_is_stale(baseline_created_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match baseline_created_at {
        None => true,
        Some(created_at) => now - created_at > Duration::days(BASELINE_STALENESS_DAYS),
    }
}

/// # NDOC
/// component: `subsystems::change_tracking::clock`
/// purpose: UTC midnight for the calendar day containing `now`, used by scheduled-scan
///   idempotency checks (spec.md §4.8) and digest windows.
pub fn day_start_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc()
}
