use super::fingerprint::validate_matched_change;
use super::llm::schema::{ProposedChangeV1, QuickDiffCandidate, QuickDiffRequest};
use super::llm::{self, LlmBackend};
use super::store::{ChangeStore, LifecycleEventStore};
use super::{ActorType, ChangeStatus, DetectedChange, LifecycleEvent, Page, new_id};
use crate::contracts::ToolResult;
use chrono::{DateTime, Utc};

/// # NDOC
/// component: `subsystems::change_tracking::deploy_path`
/// purpose: The cheap deploy-triggered scan, spec.md §4.3: quick-diff the current capture against
///   a fresh baseline instead of re-running a full vision audit, inserting a new `watching` change
///   only for visual deltas that do not already match an in-flight candidate.
#[derive(Debug, Clone)]
pub struct QuickDiffSummary {
    pub inserted: Vec<DetectedChange>,
    pub already_watching: Vec<String>,
    pub rejected_matches: Vec<String>,
}

pub async fn run_quick_diff(
    changes: &dyn ChangeStore,
    lifecycle_events: &dyn LifecycleEventStore,
    llm_backend: &dyn LlmBackend,
    page: &Page,
    analysis_id: &str,
    baseline_desktop: Vec<u8>,
    current_desktop: Vec<u8>,
    baseline_mobile: Option<Vec<u8>>,
    current_mobile: Option<Vec<u8>>,
    match_confidence_threshold: f64,
    now: DateTime<Utc>,
) -> ToolResult<QuickDiffSummary> {
    let candidates = changes.list_by_status(&page.id, ChangeStatus::Watching)?;
    let quick_diff_candidates: Vec<QuickDiffCandidate> = candidates
        .iter()
        .map(|change| QuickDiffCandidate {
            change_id: change.id.clone(),
            element: change.element.clone(),
            scope: change.scope,
        })
        .collect();

    let response = llm::quick_diff(
        llm_backend,
        &QuickDiffRequest {
            baseline_desktop,
            current_desktop,
            baseline_mobile,
            current_mobile,
            candidates: quick_diff_candidates,
        },
    )
    .await;

    let mut summary = QuickDiffSummary {
        inserted: Vec::new(),
        already_watching: Vec::new(),
        rejected_matches: Vec::new(),
    };

    if !response.has_changes {
        return Ok(summary);
    }

    for proposed in response.changes {
        if let Some(matched_id) = proposed.matched_change_id.as_deref() {
            if let Some(candidate) = validate_matched_change(&candidates, matched_id, proposed.scope) {
                let confident = proposed
                    .match_confidence
                    .map(|c| c >= match_confidence_threshold)
                    .unwrap_or(false);
                if confident {
                    summary.already_watching.push(candidate.id.clone());
                    continue;
                }
            }
            summary.rejected_matches.push(matched_id.to_string());
        }

        let change = create_watching_change(&proposed, page, analysis_id, now);
        let inserted = changes.create(change)?;
        lifecycle_events.append(LifecycleEvent {
            id: new_id("evt"),
            change_id: inserted.id.clone(),
            from_status: None,
            to_status: ChangeStatus::Watching,
            reason: "detected via deploy quick-diff".to_string(),
            actor_type: ActorType::System,
            checkpoint_id: None,
            created_at: now,
        })?;
        summary.inserted.push(inserted);
    }

    Ok(summary)
}

fn create_watching_change(
    proposed: &ProposedChangeV1,
    page: &Page,
    analysis_id: &str,
    now: DateTime<Utc>,
) -> DetectedChange {
    DetectedChange {
        id: new_id("chg"),
        page_id: page.id.clone(),
        user_id: page.user_id.clone(),
        element: proposed.element.clone(),
        scope: proposed.scope,
        before_value: proposed.before.clone(),
        after_value: proposed.after.clone(),
        description: proposed.description.clone(),
        status: ChangeStatus::Watching,
        first_detected_at: now,
        first_detected_analysis_id: analysis_id.to_string(),
        hypothesis: None,
        correlation_metrics: None,
        correlation_unlocked_at: None,
        observation_text: None,
        match_confidence: proposed.match_confidence,
        match_rationale: proposed.match_rationale.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::change_tracking::store::InMemoryStores;
    use crate::subsystems::change_tracking::{ChangeScope, ScanFrequency};
    use async_trait::async_trait;
    use crate::contracts::ToolResult as Result;

    struct StaticBackend(String);

    #[async_trait]
    impl LlmBackend for StaticBackend {
        async fn complete(&self, _s: &str, _u: &str, _images: &[Vec<u8>]) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn page() -> Page {
        Page {
            id: "page_1".to_string(),
            user_id: "user_1".to_string(),
            url: "https://example.test/pricing".to_string(),
            scan_frequency: ScanFrequency::Daily,
            stable_baseline_id: None,
            last_scan_id: None,
            metric_focus: None,
        }
    }

    #[tokio::test]
    async fn unmatched_proposal_becomes_a_new_watching_change() {
        let store = InMemoryStores::new();
        let backend = StaticBackend(
            r#"{"has_changes": true, "changes": [{"element": "hero-cta", "scope": "element", "before": "Sign up", "after": "Start trial", "description": null, "matched_change_id": null, "match_confidence": null, "match_rationale": null}]}"#.to_string(),
        );

        let summary = run_quick_diff(
            &store,
            &store,
            &backend,
            &page(),
            "an_1",
            vec![1],
            vec![2],
            None,
            None,
            0.6,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(summary.inserted.len(), 1);
        assert_eq!(summary.inserted[0].status, ChangeStatus::Watching);
        assert!(summary.already_watching.is_empty());
    }

    #[tokio::test]
    async fn matched_id_outside_candidate_set_is_rejected_and_reinserted() {
        let store = InMemoryStores::new();
        let backend = StaticBackend(
            r#"{"has_changes": true, "changes": [{"element": "hero-cta", "scope": "element", "before": "Sign up", "after": "Start trial", "description": null, "matched_change_id": "chg_not_offered", "match_confidence": 0.9, "match_rationale": "looks similar"}]}"#.to_string(),
        );

        let summary = run_quick_diff(
            &store,
            &store,
            &backend,
            &page(),
            "an_1",
            vec![1],
            vec![2],
            None,
            None,
            0.6,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(summary.rejected_matches, vec!["chg_not_offered".to_string()]);
        assert_eq!(summary.inserted.len(), 1);
    }

    #[tokio::test]
    async fn valid_match_against_an_offered_candidate_does_not_duplicate() {
        let store = InMemoryStores::new();
        let existing = DetectedChange {
            id: "chg_existing".to_string(),
            page_id: "page_1".to_string(),
            user_id: "user_1".to_string(),
            element: "hero-cta".to_string(),
            scope: ChangeScope::Element,
            before_value: "Sign up".to_string(),
            after_value: "Join now".to_string(),
            description: None,
            status: ChangeStatus::Watching,
            first_detected_at: Utc::now(),
            first_detected_analysis_id: "an_0".to_string(),
            hypothesis: None,
            correlation_metrics: None,
            correlation_unlocked_at: None,
            observation_text: None,
            match_confidence: None,
            match_rationale: None,
        };
        store.create(existing).unwrap();

        let backend = StaticBackend(
            r#"{"has_changes": true, "changes": [{"element": "hero-cta", "scope": "element", "before": "Sign up", "after": "Join now", "description": null, "matched_change_id": "chg_existing", "match_confidence": 0.95, "match_rationale": "same element"}]}"#.to_string(),
        );

        let summary = run_quick_diff(
            &store,
            &store,
            &backend,
            &page(),
            "an_1",
            vec![1],
            vec![2],
            None,
            None,
            0.6,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(summary.already_watching, vec!["chg_existing".to_string()]);
        assert!(summary.inserted.is_empty());
    }

    #[tokio::test]
    async fn match_below_confidence_threshold_is_rejected_despite_valid_candidate() {
        let store = InMemoryStores::new();
        let existing = DetectedChange {
            id: "chg_existing".to_string(),
            page_id: "page_1".to_string(),
            user_id: "user_1".to_string(),
            element: "hero-cta".to_string(),
            scope: ChangeScope::Element,
            before_value: "Sign up".to_string(),
            after_value: "Join now".to_string(),
            description: None,
            status: ChangeStatus::Watching,
            first_detected_at: Utc::now(),
            first_detected_analysis_id: "an_0".to_string(),
            hypothesis: None,
            correlation_metrics: None,
            correlation_unlocked_at: None,
            observation_text: None,
            match_confidence: None,
            match_rationale: None,
        };
        store.create(existing).unwrap();

        let backend = StaticBackend(
            r#"{"has_changes": true, "changes": [{"element": "hero-cta", "scope": "element", "before": "Sign up", "after": "Join now", "description": null, "matched_change_id": "chg_existing", "match_confidence": 0.2, "match_rationale": "maybe the same element"}]}"#.to_string(),
        );

        let summary = run_quick_diff(
            &store,
            &store,
            &backend,
            &page(),
            "an_1",
            vec![1],
            vec![2],
            None,
            None,
            0.6,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(summary.rejected_matches, vec!["chg_existing".to_string()]);
        assert_eq!(summary.inserted.len(), 1);
        assert!(summary.already_watching.is_empty());
    }
}
