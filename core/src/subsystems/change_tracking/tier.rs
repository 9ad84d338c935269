use super::{SubscriptionTier, UserAccount};
use chrono::{DateTime, Utc};

/// # NDOC
/// component: `subsystems::change_tracking::tier`
/// purpose: `check-tier`, spec.md §4.1 step 2 — a pure read, no writes, deciding mobile capture
///   eligibility and (via `deploy::run_deploy_scan`) deploy-scan eligibility from the owning
///   user's billing state. Grounded on `baseline::resolve_baseline`'s shape: one pure function
///   over already-fetched rows plus `now`, no I/O of its own.
/// invariants:
///   - A user inside their trial window is treated as `Pro` regardless of their nominal `tier`
///     (spec.md §4.1 "considering trial window"), so a trialing free-plan signup still gets
///     mobile capture and deploy scans until the trial lapses.
pub fn effective_tier(account: &UserAccount, now: DateTime<Utc>) -> SubscriptionTier {
    if let Some(trial_ends_at) = account.trial_ends_at {
        if now < trial_ends_at && matches!(account.tier, SubscriptionTier::Free) {
            return SubscriptionTier::Pro;
        }
    }
    account.tier
}

/// Mobile capture is gated to paying (or trialing) accounts, spec.md §4.1 step 2/3.
pub fn allows_mobile_capture(account: &UserAccount, now: DateTime<Utc>) -> bool {
    !matches!(effective_tier(account, now), SubscriptionTier::Free)
}

/// Deploy-triggered scans are free-tier-ineligible, spec.md §4.3: "Free tier is ineligible for
/// deploy scans; the deploy is marked complete without scanning."
pub fn allows_deploy_scan(account: &UserAccount, now: DateTime<Utc>) -> bool {
    !matches!(effective_tier(account, now), SubscriptionTier::Free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn account(tier: SubscriptionTier, trial_ends_at: Option<DateTime<Utc>>) -> UserAccount {
        UserAccount {
            user_id: "user_1".to_string(),
            tier,
            trial_ends_at,
        }
    }

    #[test]
    fn free_tier_with_no_trial_stays_free() {
        let a = account(SubscriptionTier::Free, None);
        assert_eq!(effective_tier(&a, Utc::now()), SubscriptionTier::Free);
        assert!(!allows_mobile_capture(&a, Utc::now()));
        assert!(!allows_deploy_scan(&a, Utc::now()));
    }

    #[test]
    fn free_tier_inside_trial_window_behaves_as_pro() {
        let now = Utc::now();
        let a = account(SubscriptionTier::Free, Some(now + Duration::days(3)));
        assert_eq!(effective_tier(&a, now), SubscriptionTier::Pro);
        assert!(allows_mobile_capture(&a, now));
        assert!(allows_deploy_scan(&a, now));
    }

    #[test]
    fn free_tier_past_trial_window_falls_back_to_free() {
        let now = Utc::now();
        let a = account(SubscriptionTier::Free, Some(now - Duration::days(1)));
        assert_eq!(effective_tier(&a, now), SubscriptionTier::Free);
        assert!(!allows_mobile_capture(&a, now));
    }

    #[test]
    fn pro_and_enterprise_always_allow_mobile_and_deploy() {
        let pro = account(SubscriptionTier::Pro, None);
        let enterprise = account(SubscriptionTier::Enterprise, None);
        assert!(allows_mobile_capture(&pro, Utc::now()));
        assert!(allows_deploy_scan(&enterprise, Utc::now()));
    }
}
