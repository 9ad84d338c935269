use super::clock::baseline_is_stale;
use super::{Analysis, AnalysisStatus, Page};
use chrono::{DateTime, Utc};

/// # NDOC
/// component: `subsystems::change_tracking::baseline`
/// purpose: Resolution outcome for a page's "stable" prior screenshot (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaselineDecision {
    /// No usable baseline, or one older than 14 days: dispatch a full analysis.
    Stale,
    /// A `complete` baseline younger than 14 days exists; quick-diff against it.
    Fresh { baseline_analysis_id: String },
}

/// # NDOC
/// component: `subsystems::change_tracking::baseline`
/// purpose: Decide whether a page's baseline is usable for quick-diff, per spec.md §4.3.
/// invariants:
///   - A baseline is stale when `page.stable_baseline_id` is unset, the referenced analysis is
///     missing or not `complete`, or it is older than `clock::BASELINE_STALENESS_DAYS`.
///   - The Page/Analysis ownership invariant (baseline Analysis owned by the same user/url and
///     `complete`) is the caller's responsibility to have fetched correctly; this function only
///     judges staleness once handed the right row.
pub fn resolve_baseline(page: &Page, baseline_analysis: Option<&Analysis>, now: DateTime<Utc>) -> BaselineDecision {
    let Some(baseline_id) = page.stable_baseline_id.as_ref() else {
        return BaselineDecision::Stale;
    };
    let Some(analysis) = baseline_analysis else {
        return BaselineDecision::Stale;
    };
    if analysis.id != *baseline_id || analysis.status != AnalysisStatus::Complete {
        return BaselineDecision::Stale;
    }
    if baseline_is_stale(Some(analysis.created_at), now) {
        return BaselineDecision::Stale;
    }
    BaselineDecision::Fresh {
        baseline_analysis_id: analysis.id.clone(),
    }
}

/// # NDOC
/// component: `subsystems::change_tracking::baseline`
/// purpose: Whether a newly completed analysis should become the page's baseline.
/// invariants:
///   - Scheduled (daily/weekly) scans always update the baseline on completion (spec.md §4.3).
///   - A deploy-triggered full analysis (dispatched because the prior baseline was stale)
///     establishes a new baseline only when none existed, breaking the fallback loop.
pub fn should_adopt_as_baseline(page: &Page, trigger: super::TriggerType) -> bool {
    match trigger {
        super::TriggerType::Daily | super::TriggerType::Weekly => true,
        super::TriggerType::Deploy => page.stable_baseline_id.is_none(),
        super::TriggerType::Manual => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn page(baseline_id: Option<&str>) -> Page {
        Page {
            id: "page_1".to_string(),
            user_id: "user_1".to_string(),
            url: "https://example.test/pricing".to_string(),
            scan_frequency: super::super::ScanFrequency::Daily,
            stable_baseline_id: baseline_id.map(|s| s.to_string()),
            last_scan_id: None,
            metric_focus: None,
        }
    }

    fn analysis(id: &str, status: AnalysisStatus, created_at: DateTime<Utc>) -> Analysis {
        Analysis {
            id: id.to_string(),
            page_id: "page_1".to_string(),
            user_id: "user_1".to_string(),
            url: "https://example.test/pricing".to_string(),
            status,
            trigger_type: super::super::TriggerType::Daily,
            parent_analysis_id: None,
            deploy_id: None,
            desktop_screenshot_url: None,
            mobile_screenshot_url: None,
            structured_output: None,
            freeform_output: None,
            changes_summary: None,
            failure_reason: None,
            created_at,
        }
    }

    #[test]
    fn no_baseline_id_is_stale() {
        let p = page(None);
        assert_eq!(resolve_baseline(&p, None, Utc::now()), BaselineDecision::Stale);
    }

    #[test]
    fn fresh_complete_baseline_is_usable() {
        let p = page(Some("an_1"));
        let a = analysis("an_1", AnalysisStatus::Complete, Utc::now() - Duration::days(1));
        assert_eq!(
            resolve_baseline(&p, Some(&a), Utc::now()),
            BaselineDecision::Fresh {
                baseline_analysis_id: "an_1".to_string()
            }
        );
    }

    #[test]
    fn baseline_older_than_14_days_is_stale() {
        let p = page(Some("an_1"));
        let a = analysis("an_1", AnalysisStatus::Complete, Utc::now() - Duration::days(20));
        assert_eq!(resolve_baseline(&p, Some(&a), Utc::now()), BaselineDecision::Stale);
    }

    #[test]
    fn incomplete_baseline_analysis_is_stale() {
        let p = page(Some("an_1"));
        let a = analysis("an_1", AnalysisStatus::Processing, Utc::now());
        assert_eq!(resolve_baseline(&p, Some(&a), Utc::now()), BaselineDecision::Stale);
    }

    #[test]
    fn deploy_adopts_baseline_only_when_absent() {
        let with_baseline = page(Some("an_1"));
        let without_baseline = page(None);
        assert!(!should_adopt_as_baseline(&with_baseline, super::super::TriggerType::Deploy));
        assert!(should_adopt_as_baseline(&without_baseline, super::super::TriggerType::Deploy));
    }

    #[test]
    fn scheduled_scans_always_adopt_baseline() {
        let p = page(Some("an_1"));
        assert!(should_adopt_as_baseline(&p, super::super::TriggerType::Daily));
        assert!(should_adopt_as_baseline(&p, super::super::TriggerType::Weekly));
    }
}
