use super::clock::{due_horizons, horizon_windows};
use super::llm::{self, schema::CheckpointAssessmentRequest, schema::CheckpointSummary, LlmBackend};
use super::notifications::{NotificationBatch, TerminalStatusEntry};
use super::providers::AnalyticsProvider;
use super::store::{ChangeStore, CheckpointStore, FeedbackStore, InsertOutcome, LifecycleEventStore};
use super::{ActorType, Assessment, ChangeStatus, CheckpointRow, DetectedChange, Page, new_id};
use crate::contracts::ToolResult;
use crate::utils::logger::log_agent_event;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

const DEFAULT_METRIC: &str = "conversion_rate";
const AGENT_NAME: &str = "checkpoint_engine";

/// # NDOC
/// component: `subsystems::change_tracking::checkpoint_engine`
/// purpose: Which lifecycle rule applies at a given horizon (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizonGate {
    /// D+7/D+14: record a data point only, never mutate `detected_changes.status`.
    Informational,
    /// D+30: the canonical resolution. Moves a `watching` change to its first terminal status.
    CanonicalResolution,
    /// D+60/D+90: confirm the D+30 resolution, or reverse it if the metrics now disagree.
    ConfirmOrReverse,
}

pub fn horizon_gate(horizon_days: u32) -> HorizonGate {
    match horizon_days {
        7 | 14 => HorizonGate::Informational,
        30 => HorizonGate::CanonicalResolution,
        _ => HorizonGate::ConfirmOrReverse,
    }
}

/// Maps a metric assessment onto the lifecycle status it resolves to. `Assessment::Inconclusive`
/// and `Assessment::Neutral` both resolve to `ChangeStatus::Inconclusive`: the distinction between
/// "no data" and "data said nothing moved" matters for the checkpoint row's own `assessment`
/// field, but not for the change's terminal status.
pub fn status_for_assessment(assessment: Assessment) -> ChangeStatus {
    match assessment {
        Assessment::Improved => ChangeStatus::Validated,
        Assessment::Regressed => ChangeStatus::Regressed,
        Assessment::Neutral | Assessment::Inconclusive => ChangeStatus::Inconclusive,
    }
}

/// # NDOC
/// component: `subsystems::change_tracking::checkpoint_engine`
/// purpose: Store handles the checkpoint engine needs for one batch pass. Borrowed rather than
///   owned so callers can share one `InMemoryStores` across the whole scheduler run.
pub struct CheckpointEngineDeps<'a> {
    pub changes: &'a dyn ChangeStore,
    pub checkpoints: &'a dyn CheckpointStore,
    pub lifecycle_events: &'a dyn LifecycleEventStore,
    pub feedback: &'a dyn FeedbackStore,
}

/// Processes every due horizon for every non-reverted change on one page, inserting checkpoint
/// rows and applying horizon-gated status transitions, per spec.md §4.5. Terminal transitions are
/// folded into `notifications` rather than sent immediately, so a page with several changes
/// resolving on the same run produces one email per user (spec.md §4.5/§6).
pub async fn run_batch_for_page(
    deps: &CheckpointEngineDeps<'_>,
    provider: &dyn AnalyticsProvider,
    llm_backend: &dyn LlmBackend,
    page: &Page,
    now: DateTime<Utc>,
    notifications: &mut NotificationBatch,
) -> ToolResult<Vec<CheckpointRow>> {
    let mut inserted_rows = Vec::new();
    let changes = deps.changes.list_for_page(&page.id)?;

    for change in changes {
        if change.status == ChangeStatus::Reverted {
            continue;
        }

        let existing_rows = deps.checkpoints.list_for_change(&change.id)?;
        let existing_horizons: BTreeSet<u32> =
            existing_rows.iter().map(|row| row.horizon_days).collect();
        let due = due_horizons(change.first_detected_at, now, &existing_horizons);

        for horizon_days in due {
            if let Some(row) = process_due_horizon(
                deps,
                provider,
                llm_backend,
                page,
                &change,
                horizon_days,
                now,
                notifications,
            )
            .await?
            {
                inserted_rows.push(row);
            }
        }
    }

    Ok(inserted_rows)
}

async fn process_due_horizon(
    deps: &CheckpointEngineDeps<'_>,
    provider: &dyn AnalyticsProvider,
    llm_backend: &dyn LlmBackend,
    page: &Page,
    change: &DetectedChange,
    horizon_days: u32,
    now: DateTime<Utc>,
    notifications: &mut NotificationBatch,
) -> ToolResult<Option<CheckpointRow>> {
    // Step 7 (spec.md §4.5): re-read the current status before deciding anything. An earlier
    // horizon processed in this same batch pass may already have moved this change off
    // `watching`, and the transition rules below must reason about that current state, not the
    // snapshot `run_batch_for_page` listed it with at the start of the run.
    let change = &deps.changes.get(&change.id)?;
    if change.status == ChangeStatus::Reverted {
        return Ok(None);
    }

    let (before_window, after_window) = horizon_windows(change.first_detected_at, horizon_days);
    let metric = page.metric_focus.as_deref().unwrap_or(DEFAULT_METRIC);

    let metrics = provider
        .metrics_for_window(&page.url, metric, before_window, after_window)
        .await
        .unwrap_or_default();

    // spec.md §4.5 step 4: when neither source yielded data, the envelope is tagged rather than
    // left as a bare empty array, so a reader can tell "no signal found" apart from "not queried".
    let metrics_json = if metrics.is_empty() {
        serde_json::json!({ "metrics": [], "reason": "analytics_disconnected" })
    } else {
        serde_json::to_value(&metrics).unwrap_or_default()
    };

    let prior_checkpoints: Vec<CheckpointSummary> = deps
        .checkpoints
        .list_for_change(&change.id)?
        .into_iter()
        .map(|row| CheckpointSummary {
            horizon_days: row.horizon_days,
            assessment: row.assessment,
            reasoning: row.reasoning,
        })
        .collect();

    let prior_feedback: Vec<String> = deps
        .feedback
        .list_for_change(&change.id)?
        .into_iter()
        .map(|f| match f.text {
            Some(text) => format!("{:?}: {text}", f.feedback_type),
            None => format!("{:?}", f.feedback_type),
        })
        .collect();

    let assessment_response = llm::checkpoint_assessment(
        llm_backend,
        &CheckpointAssessmentRequest {
            change_element: change.element.clone(),
            horizon_days,
            metrics: metrics.clone(),
            prior_checkpoints,
            hypothesis: change.hypothesis.clone(),
            page_focus: page.metric_focus.clone(),
            prior_feedback,
        },
    )
    .await;

    let row = CheckpointRow {
        id: new_id("chk"),
        change_id: change.id.clone(),
        horizon_days,
        before_window,
        after_window,
        metrics_json,
        assessment: assessment_response.assessment,
        confidence: assessment_response.confidence,
        reasoning: assessment_response.reasoning.clone(),
        data_sources: vec![provider.label().to_string()],
        provider: provider.label().to_string(),
        computed_at: now,
    };

    let outcome = deps.checkpoints.insert_if_absent(row.clone())?;
    if outcome == InsertOutcome::AlreadyPresent {
        return Ok(None);
    }

    log_agent_event(
        AGENT_NAME,
        "checkpoint_recorded",
        &serde_json::json!({
            "change_id": change.id,
            "horizon_days": horizon_days,
            "assessment": format!("{:?}", row.assessment),
            "provider": row.provider,
        }),
    );

    let transitioned = match horizon_gate(horizon_days) {
        HorizonGate::Informational => None,
        HorizonGate::CanonicalResolution => {
            apply_canonical_resolution(deps, change, &row, notifications, page)?
        }
        HorizonGate::ConfirmOrReverse => {
            apply_confirm_or_reverse(deps, change, &row, notifications, page)?
        }
    };

    let effective = transitioned.as_ref().unwrap_or(change);
    synthesize_observation_text(deps, effective, &row)?;

    Ok(Some(row))
}

fn apply_canonical_resolution(
    deps: &CheckpointEngineDeps<'_>,
    change: &DetectedChange,
    row: &CheckpointRow,
    notifications: &mut NotificationBatch,
    page: &Page,
) -> ToolResult<Option<DetectedChange>> {
    let new_status = status_for_assessment(row.assessment);
    let row_clone = row.clone();
    let updated = deps.changes.cas_update_status(
        &change.id,
        ChangeStatus::Watching,
        Box::new(move |c| {
            c.status = new_status;
            c.correlation_unlocked_at = Some(row_clone.computed_at);
        }),
    );

    let Ok(updated) = updated else {
        return Ok(None);
    };

    deps.lifecycle_events.append(super::LifecycleEvent {
        id: new_id("evt"),
        change_id: change.id.clone(),
        from_status: Some(ChangeStatus::Watching),
        to_status: new_status,
        reason: format!("D+{} checkpoint: {}", row.horizon_days, row.reasoning),
        actor_type: ActorType::System,
        checkpoint_id: Some(row.id.clone()),
        created_at: row.computed_at,
    })?;

    log_agent_event(
        AGENT_NAME,
        "change_resolved",
        &serde_json::json!({ "change_id": updated.id, "status": format!("{:?}", updated.status) }),
    );

    queue_or_cancel_notification(notifications, &updated, row, page);
    Ok(Some(updated))
}

fn apply_confirm_or_reverse(
    deps: &CheckpointEngineDeps<'_>,
    change: &DetectedChange,
    row: &CheckpointRow,
    notifications: &mut NotificationBatch,
    page: &Page,
) -> ToolResult<Option<DetectedChange>> {
    let implied_status = status_for_assessment(row.assessment);
    if implied_status == change.status {
        return Ok(None);
    }

    let prior_status = change.status;
    let row_clone = row.clone();
    let updated = deps.changes.cas_update_status(
        &change.id,
        prior_status,
        Box::new(move |c| {
            c.status = implied_status;
            c.correlation_unlocked_at = Some(row_clone.computed_at);
        }),
    );

    let Ok(updated) = updated else {
        return Ok(None);
    };

    deps.lifecycle_events.append(super::LifecycleEvent {
        id: new_id("evt"),
        change_id: change.id.clone(),
        from_status: Some(prior_status),
        to_status: implied_status,
        reason: format!(
            "D+{} checkpoint reversed the prior resolution: {}",
            row.horizon_days, row.reasoning
        ),
        actor_type: ActorType::System,
        checkpoint_id: Some(row.id.clone()),
        created_at: row.computed_at,
    })?;

    log_agent_event(
        AGENT_NAME,
        "change_resolution_reversed",
        &serde_json::json!({
            "change_id": updated.id,
            "from_status": format!("{:?}", prior_status),
            "to_status": format!("{:?}", updated.status),
        }),
    );

    queue_or_cancel_notification(notifications, &updated, row, page);
    Ok(Some(updated))
}

/// Queues a `validated` transition for the run's coalesced email, or cancels a pending one queued
/// earlier in the same run for this change if a later horizon flipped it away from `validated`
/// (spec.md §4.5 "Terminal-status notification coalescing").
fn queue_or_cancel_notification(
    notifications: &mut NotificationBatch,
    change: &DetectedChange,
    row: &CheckpointRow,
    page: &Page,
) {
    if change.status == ChangeStatus::Validated {
        notifications.push(
            &change.user_id,
            TerminalStatusEntry {
                change_id: change.id.clone(),
                page_url: page.url.clone(),
                element: change.element.clone(),
                status: change.status,
                assessment: Some(row.assessment),
                horizon_days: row.horizon_days,
                reasoning: row.reasoning.clone(),
            },
        );
    } else {
        notifications.cancel(&change.user_id, &change.id);
    }
}

/// Step 9 of spec.md §4.5: a change with no `observation_text` yet gets one synthesized from its
/// element, first-detection date, the horizon just computed, its top metric, and the assessment.
/// Never overwrites an existing observation — this only fills the gap the first time a change
/// resolves a checkpoint.
fn synthesize_observation_text(
    deps: &CheckpointEngineDeps<'_>,
    change: &DetectedChange,
    row: &CheckpointRow,
) -> ToolResult<()> {
    if change.observation_text.is_some() {
        return Ok(());
    }
    let top_metric = top_metric_line(&row.metrics_json);
    let text = format!(
        "{} (first seen {}) — D+{} checkpoint: {:?}{}",
        change.element,
        change.first_detected_at.format("%Y-%m-%d"),
        row.horizon_days,
        row.assessment,
        top_metric
            .map(|m| format!(", {m}"))
            .unwrap_or_default(),
    );
    let change_id = change.id.clone();
    let result = deps.changes.cas_update_status(
        &change_id,
        change.status,
        Box::new(move |c| c.observation_text = Some(text)),
    );
    // A CAS conflict here just means a later horizon in this same batch already mutated the row;
    // that horizon's own synthesis call will have seen (and filled) the same gap.
    let _ = result;
    Ok(())
}

fn top_metric_line(metrics_json: &serde_json::Value) -> Option<String> {
    let metrics = metrics_json.as_array()?;
    let top = metrics.iter().max_by(|a, b| {
        let a = a.get("change_percent").and_then(|v| v.as_f64()).unwrap_or(0.0).abs();
        let b = b.get("change_percent").and_then(|v| v.as_f64()).unwrap_or(0.0).abs();
        a.total_cmp(&b)
    })?;
    let name = top.get("name").and_then(|v| v.as_str()).unwrap_or("metric");
    let change_percent = top.get("change_percent").and_then(|v| v.as_f64()).unwrap_or(0.0);
    Some(format!(
        "{} {change_percent:+.1}%",
        super::providers::friendly_metric_name(name)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn informational_horizons_never_mutate_status() {
        assert_eq!(horizon_gate(7), HorizonGate::Informational);
        assert_eq!(horizon_gate(14), HorizonGate::Informational);
    }

    #[test]
    fn day_thirty_is_canonical() {
        assert_eq!(horizon_gate(30), HorizonGate::CanonicalResolution);
    }

    #[test]
    fn day_sixty_and_ninety_confirm_or_reverse() {
        assert_eq!(horizon_gate(60), HorizonGate::ConfirmOrReverse);
        assert_eq!(horizon_gate(90), HorizonGate::ConfirmOrReverse);
    }

    #[test]
    fn status_mapping_is_total() {
        assert_eq!(status_for_assessment(Assessment::Improved), ChangeStatus::Validated);
        assert_eq!(status_for_assessment(Assessment::Regressed), ChangeStatus::Regressed);
        assert_eq!(status_for_assessment(Assessment::Neutral), ChangeStatus::Inconclusive);
        assert_eq!(status_for_assessment(Assessment::Inconclusive), ChangeStatus::Inconclusive);
    }

    #[test]
    fn top_metric_line_picks_the_largest_absolute_change() {
        let metrics = serde_json::json!([
            { "name": "conversion_rate", "before": 1.0, "after": 1.05, "change_percent": 5.0 },
            { "name": "bounce_rate", "before": 1.0, "after": 0.6, "change_percent": -40.0 },
        ]);
        let line = top_metric_line(&metrics).unwrap();
        assert!(line.contains("-40.0%"));
    }

    #[test]
    fn top_metric_line_is_none_for_empty_metrics() {
        assert!(top_metric_line(&serde_json::json!([])).is_none());
    }

    mod batch_integration {
        use super::super::*;
        use crate::subsystems::change_tracking::llm::LlmBackend;
        use crate::subsystems::change_tracking::providers::none::NoneProvider;
        use crate::subsystems::change_tracking::store::{ChangeStore, InMemoryStores};
        use crate::subsystems::change_tracking::{ChangeScope, ScanFrequency};
        use async_trait::async_trait;
        use chrono::Duration;

        /// Returns `Improved` at D+30 and `Regressed` at every later horizon, so one batch run
        /// can exercise a canonical resolution followed by its own reversal.
        struct FlippingBackend;

        #[async_trait]
        impl LlmBackend for FlippingBackend {
            async fn complete(
                &self,
                _system: &str,
                user: &str,
                _images: &[Vec<u8>],
            ) -> ToolResult<String> {
                let assessment = if user.contains("\"horizon_days\":30") {
                    "improved"
                } else {
                    "regressed"
                };
                Ok(format!(
                    r#"{{"assessment": "{assessment}", "confidence": 0.8, "reasoning": "test"}}"#
                ))
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

        fn watching_change(first_detected_at: DateTime<Utc>) -> DetectedChange {
            DetectedChange {
                id: "chg_1".to_string(),
                page_id: "page_1".to_string(),
                user_id: "user_1".to_string(),
                element: "hero-cta".to_string(),
                scope: ChangeScope::Element,
                before_value: "Sign up".to_string(),
                after_value: "Start trial".to_string(),
                description: None,
                status: ChangeStatus::Watching,
                first_detected_at,
                first_detected_analysis_id: "an_0".to_string(),
                hypothesis: None,
                correlation_metrics: None,
                correlation_unlocked_at: None,
                observation_text: None,
                match_confidence: None,
                match_rationale: None,
            }
        }

        #[tokio::test]
        async fn batch_run_synthesizes_observation_text_on_canonical_resolution() {
            let store = InMemoryStores::new();
            let now = Utc::now();
            let change = store
                .create(watching_change(now - Duration::days(31)))
                .unwrap();
            let deps = CheckpointEngineDeps {
                changes: &store,
                checkpoints: &store,
                lifecycle_events: &store,
                feedback: &store,
            };
            let mut notifications = NotificationBatch::new();
            run_batch_for_page(&deps, &NoneProvider, &FlippingBackend, &page(), now, &mut notifications)
                .await
                .unwrap();

            let updated = store.get(&change.id).unwrap();
            assert_eq!(updated.status, ChangeStatus::Validated);
            assert!(updated.observation_text.unwrap().contains("hero-cta"));
            assert!(!notifications.is_empty());

            // The `NoneProvider` yields no metrics at all, so every row from this run should carry
            // the disconnected-analytics tag rather than a bare empty array (spec.md §4.5 step 4).
            let rows = store.list_for_change(&change.id).unwrap();
            assert!(!rows.is_empty());
            for row in rows {
                assert_eq!(
                    row.metrics_json.get("reason").and_then(|v| v.as_str()),
                    Some("analytics_disconnected")
                );
            }
        }

        #[tokio::test]
        async fn same_run_reversal_at_a_later_horizon_cancels_the_pending_email() {
            let store = InMemoryStores::new();
            let now = Utc::now();
            // All five horizons are due in the same pass: D+30 validates, then D+60/D+90 flip it
            // to regressed before any email would ever be sent.
            let change = store
                .create(watching_change(now - Duration::days(91)))
                .unwrap();
            let deps = CheckpointEngineDeps {
                changes: &store,
                checkpoints: &store,
                lifecycle_events: &store,
                feedback: &store,
            };
            let mut notifications = NotificationBatch::new();
            run_batch_for_page(&deps, &NoneProvider, &FlippingBackend, &page(), now, &mut notifications)
                .await
                .unwrap();

            let updated = store.get(&change.id).unwrap();
            assert_eq!(updated.status, ChangeStatus::Regressed);
            assert!(notifications.is_empty());
        }
    }
}
