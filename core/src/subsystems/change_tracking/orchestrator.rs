use super::baseline::{resolve_baseline, should_adopt_as_baseline, BaselineDecision};
use super::deploy_path::run_quick_diff;
use super::fingerprint::{validate_matched_change, validate_revert_candidate};
use super::llm::schema::{PageAuditRequest, PostAnalysisRequest, QuickDiffCandidate};
use super::llm::{self, LlmBackend};
use super::progress::{self, ProgressSnapshot};
use super::store::{
    AccountStore, AnalysisStore, ChangeStore, LifecycleEventStore, PageStore, ScreenshotStore,
    SuggestionStore,
};
use super::tier;
use super::{
    ActorType, Analysis, AnalysisStatus, ChangeStatus, LifecycleEvent, Page, SubscriptionTier,
    SuggestionImpact, SuggestionStatus, TrackedSuggestion, TriggerType, UserAccount, new_id,
};
use crate::contracts::ToolResult;
use crate::tools::screenshot_tool::PlaywrightRunner;
use crate::utils::logger::log_agent_event;
use chrono::{DateTime, Utc};

const AGENT_NAME: &str = "orchestrator";

/// # NDOC
/// component: `subsystems::change_tracking::orchestrator`
/// purpose: The end-to-end per-page analysis run, spec.md §4.1. Seven steps: capture, open the
///   analysis row, resolve the baseline, audit-or-quick-diff, correlate against what came before,
///   persist suggestions, and close out the analysis while rolling the baseline forward.
pub struct OrchestratorDeps<'a> {
    pub pages: &'a dyn PageStore,
    pub analyses: &'a dyn AnalysisStore,
    pub changes: &'a dyn ChangeStore,
    pub lifecycle_events: &'a dyn LifecycleEventStore,
    pub suggestions: &'a dyn SuggestionStore,
    pub accounts: &'a dyn AccountStore,
    pub screenshots: &'a dyn PlaywrightRunner,
    pub screenshot_store: &'a dyn ScreenshotStore,
    pub llm_backend: &'a dyn LlmBackend,
    /// Acceptance floor for a proposed `matched_change_id`, from `EngineConfig`. Below this, a
    /// proposed match is rejected back to a new `watching` change rather than trusted outright
    /// (spec.md §9).
    pub match_confidence_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub analysis: Analysis,
    pub new_changes: usize,
    pub reverted_changes: usize,
    pub suggestions: usize,
}

pub async fn run_analysis(
    deps: &OrchestratorDeps<'_>,
    page_id: &str,
    trigger_type: TriggerType,
    parent_analysis_id: Option<String>,
    deploy_id: Option<String>,
    now: DateTime<Utc>,
) -> ToolResult<AnalysisOutcome> {
    // Step 1: capture.
    let page = deps.pages.get(page_id)?;

    // Step 2: check-tier. Pure read; a missing account record fails closed to `free` rather
    // than granting mobile capture by default.
    let account = deps.accounts.get(&page.user_id).unwrap_or(UserAccount {
        user_id: page.user_id.clone(),
        tier: SubscriptionTier::Free,
        trial_ends_at: None,
    });
    let mobile_allowed = tier::allows_mobile_capture(&account, now);

    // Step 3: capture-screenshot. Desktop failure aborts the step; mobile failure is tolerated
    // and logged (spec.md §4.1 step 3).
    let desktop_bytes = deps
        .screenshots
        .take_screenshot_from_url(&page.url)
        .await
        .map_err(|err| crate::contracts::ToolError::provider(err.to_string(), true))?;
    let mobile_bytes = if mobile_allowed {
        match deps.screenshots.take_mobile_screenshot_from_url(&page.url).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                log_agent_event(
                    AGENT_NAME,
                    "mobile_capture_failed",
                    &serde_json::json!({ "page_id": page.id, "error": err.to_string() }),
                );
                None
            }
        }
    } else {
        None
    };

    // Open the analysis row.
    let analysis_id = new_id("an");
    let mut analysis = Analysis {
        id: analysis_id.clone(),
        page_id: page.id.clone(),
        user_id: page.user_id.clone(),
        url: page.url.clone(),
        status: AnalysisStatus::Processing,
        trigger_type,
        parent_analysis_id,
        deploy_id,
        desktop_screenshot_url: None,
        mobile_screenshot_url: None,
        structured_output: None,
        freeform_output: None,
        changes_summary: None,
        failure_reason: None,
        created_at: now,
    };
    deps.analyses.create(analysis.clone())?;

    // Everything from here on runs against a row that already exists in `processing`. Per
    // spec.md §4.1 ("on any uncaught exception the analysis row is transitioned to `failed` with
    // the stringified error") and §7, any error propagated out of this body must still leave the
    // row in a terminal state rather than stuck in `processing`.
    match run_analysis_body(
        deps,
        &page,
        trigger_type,
        &analysis_id,
        analysis,
        &desktop_bytes,
        mobile_bytes,
        now,
    )
    .await
    {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            let failed = Analysis {
                id: analysis_id.clone(),
                page_id: page.id.clone(),
                user_id: page.user_id.clone(),
                url: page.url.clone(),
                status: AnalysisStatus::Failed,
                trigger_type,
                parent_analysis_id: None,
                deploy_id: None,
                desktop_screenshot_url: None,
                mobile_screenshot_url: None,
                structured_output: None,
                freeform_output: None,
                changes_summary: None,
                failure_reason: Some(err.to_string()),
                created_at: now,
            };
            deps.analyses.update(failed)?;
            log_agent_event(
                AGENT_NAME,
                "analysis_failed",
                &serde_json::json!({
                    "analysis_id": analysis_id,
                    "page_id": page.id,
                    "error": err.to_string(),
                }),
            );
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_analysis_body(
    deps: &OrchestratorDeps<'_>,
    page: &Page,
    trigger_type: TriggerType,
    analysis_id: &str,
    mut analysis: Analysis,
    desktop_bytes: &[u8],
    mobile_bytes: Option<Vec<u8>>,
    now: DateTime<Utc>,
) -> ToolResult<AnalysisOutcome> {
    let desktop_bytes = desktop_bytes.to_vec();

    // Resolve the baseline.
    let baseline_analysis = match page.stable_baseline_id.as_deref() {
        Some(id) => deps.analyses.get(id).ok(),
        None => None,
    };
    let decision = resolve_baseline(page, baseline_analysis.as_ref(), now);

    let mut new_changes_count = 0usize;
    let mut reverted_count = 0usize;

    match decision {
        BaselineDecision::Stale => {
            // Step 4a: no usable baseline, run the full vision audit.
            let audit = llm::page_audit(
                deps.llm_backend,
                &PageAuditRequest {
                    url: page.url.clone(),
                    desktop_image_bytes: desktop_bytes.clone(),
                    mobile_image_bytes: mobile_bytes.clone(),
                    metadata: serde_json::json!({ "trigger": format!("{trigger_type:?}") }),
                },
            )
            .await;

            analysis.freeform_output = Some(audit.freeform_output.clone());
            analysis.structured_output = Some(serde_json::to_value(&audit.structured)?);

            let pending_watching = deps
                .changes
                .list_by_status(&page.id, ChangeStatus::Watching)?;

            // Step 5: post-analysis only runs when some correlating context exists (spec.md §4.2):
            // a parent analysis, a deploy context, or pending watching changes to reconcile against.
            // A bare first-ever scan has none of these and leaves `changes_summary` absent
            // (spec.md §10 scenario 1).
            let should_correlate = baseline_analysis.is_some()
                || analysis.parent_analysis_id.is_some()
                || analysis.deploy_id.is_some()
                || !pending_watching.is_empty();

            if should_correlate {
                let previous_structured = baseline_analysis
                    .as_ref()
                    .and_then(|a| a.structured_output.clone())
                    .and_then(|v| serde_json::from_value(v).ok());

                let pending_candidates: Vec<QuickDiffCandidate> = pending_watching
                    .iter()
                    .map(|c| QuickDiffCandidate {
                        change_id: c.id.clone(),
                        element: c.element.clone(),
                        scope: c.scope,
                    })
                    .collect();

                let post_analysis = llm::post_analysis(
                    deps.llm_backend,
                    &PostAnalysisRequest {
                        current_findings: audit.structured.clone(),
                        previous_findings: previous_structured,
                        deploy_context: None,
                        user_feedback: Vec::new(),
                        pending_watching_changes: pending_candidates,
                        checkpoint_timelines: Vec::new(),
                        page_focus: page.metric_focus.clone(),
                        hypotheses: Vec::new(),
                    },
                )
                .await;

                new_changes_count += insert_proposed_changes(
                    deps,
                    page,
                    analysis_id,
                    &post_analysis.changes,
                    &pending_watching,
                    now,
                )?;

                reverted_count += apply_reverts(
                    deps,
                    &pending_watching,
                    &post_analysis.reverted_change_ids,
                    &page.user_id,
                    now,
                )?;

                for suggestion in &post_analysis.suggestions {
                    deps.suggestions.upsert_or_bump(TrackedSuggestion {
                        id: new_id("sug"),
                        page_id: page.id.clone(),
                        user_id: page.user_id.clone(),
                        title: suggestion.title.clone(),
                        element: suggestion.element.clone(),
                        suggested_fix: suggestion.suggested_fix.clone(),
                        impact: match suggestion.impact {
                            super::llm::schema::ImpactLevel::High => SuggestionImpact::High,
                            super::llm::schema::ImpactLevel::Medium => SuggestionImpact::Medium,
                            super::llm::schema::ImpactLevel::Low => SuggestionImpact::Low,
                        },
                        status: SuggestionStatus::Open,
                        times_suggested: 1,
                        first_suggested_at: now,
                    })?;
                }

                // Canonical overwrite (spec.md §4.2): the composer, not the LLM, owns `progress`.
                let progress = progress::compose_or_fallback(
                    deps.changes,
                    deps.suggestions,
                    &page.id,
                    previous_progress_snapshot(baseline_analysis.as_ref()).as_ref(),
                );
                analysis.changes_summary = Some(serde_json::json!({
                    "verdict": post_analysis.verdict,
                    "verdict_context": post_analysis.verdict_context,
                    "changes": post_analysis.changes,
                    "suggestions": post_analysis.suggestions,
                    "reverted_change_ids": post_analysis.reverted_change_ids,
                    "observations": post_analysis.observations,
                    "running_summary": post_analysis.running_summary,
                    "progress": progress,
                }));
            }
        }
        BaselineDecision::Fresh { baseline_analysis_id } => {
            // Step 4b: a fresh baseline exists, quick-diff instead of re-auditing.
            let baseline = deps.analyses.get(&baseline_analysis_id)?;
            let baseline_bytes = match baseline.desktop_screenshot_url.as_deref() {
                Some(url) => deps.screenshot_store.get(url)?,
                None => Vec::new(),
            };
            let baseline_mobile_bytes = match baseline.mobile_screenshot_url.as_deref() {
                Some(url) => deps.screenshot_store.get(url).ok(),
                None => None,
            };

            let summary = run_quick_diff(
                deps.changes,
                deps.lifecycle_events,
                deps.llm_backend,
                page,
                analysis_id,
                baseline_bytes,
                desktop_bytes.clone(),
                baseline_mobile_bytes,
                mobile_bytes.clone(),
                deps.match_confidence_threshold,
                now,
            )
            .await?;
            new_changes_count += summary.inserted.len();

            // Canonical overwrite (spec.md §4.2/§4.7), same as the full-audit path.
            let progress = progress::compose_or_fallback(
                deps.changes,
                deps.suggestions,
                &page.id,
                previous_progress_snapshot(Some(&baseline)).as_ref(),
            );
            analysis.changes_summary = Some(serde_json::json!({
                "quick_diff_inserted": summary.inserted.len(),
                "quick_diff_already_watching": summary.already_watching,
                "quick_diff_rejected_matches": summary.rejected_matches,
                "progress": progress,
            }));
        }
    }

    // Step 5: save-results.
    analysis.status = AnalysisStatus::Complete;
    analysis.desktop_screenshot_url = Some(
        deps.screenshot_store
            .put(&format!("{analysis_id}/desktop"), desktop_bytes.clone())?,
    );
    analysis.mobile_screenshot_url = match mobile_bytes {
        Some(bytes) => Some(
            deps.screenshot_store
                .put(&format!("{analysis_id}/mobile"), bytes)?,
        ),
        None => None,
    };
    deps.analyses.update(analysis.clone())?;
    deps.pages.set_last_scan(&page.id, analysis_id)?;
    if should_adopt_as_baseline(page, trigger_type) {
        deps.pages.set_stable_baseline(&page.id, analysis_id)?;
    }

    // Step 6: track-completion. A logging sink failure must never abort a completed analysis,
    // so this is fire-and-forget rather than propagated with `?` (spec.md §4.1 step 6).
    log_agent_event(
        AGENT_NAME,
        "analysis_track_completion",
        &serde_json::json!({
            "analysis_id": analysis_id,
            "page_id": page.id,
            "user_id": page.user_id,
        }),
    );

    log_agent_event(
        AGENT_NAME,
        "analysis_completed",
        &serde_json::json!({
            "analysis_id": analysis_id,
            "page_id": page.id,
            "trigger_type": format!("{trigger_type:?}"),
            "new_changes": new_changes_count,
            "reverted_changes": reverted_count,
        }),
    );

    Ok(AnalysisOutcome {
        analysis,
        new_changes: new_changes_count,
        reverted_changes: reverted_count,
        suggestions: 0,
    })
}

/// Pulls the composer's last-known snapshot out of a prior analysis's `changes_summary.progress`,
/// for `progress::compose_or_fallback`'s double-failure guard (spec.md §4.7).
fn previous_progress_snapshot(prior: Option<&Analysis>) -> Option<ProgressSnapshot> {
    prior
        .and_then(|a| a.changes_summary.as_ref())
        .and_then(|summary| summary.get("progress"))
        .and_then(|progress| serde_json::from_value(progress.clone()).ok())
}

fn insert_proposed_changes(
    deps: &OrchestratorDeps<'_>,
    page: &Page,
    analysis_id: &str,
    proposed_changes: &[super::llm::schema::ProposedChangeV1],
    pending_watching: &[super::DetectedChange],
    now: DateTime<Utc>,
) -> ToolResult<usize> {
    let mut inserted = 0usize;
    for proposed in proposed_changes {
        if let Some(matched_id) = proposed.matched_change_id.as_deref() {
            let confident_match = validate_matched_change(pending_watching, matched_id, proposed.scope)
                .is_some()
                && proposed
                    .match_confidence
                    .map(|c| c >= deps.match_confidence_threshold)
                    .unwrap_or(false);
            if confident_match {
                // Already tracked; post_analysis only annotates the existing row via
                // checkpoints, it does not get to create a duplicate.
                continue;
            }
            // Either the id wasn't among the candidates we offered, or confidence fell below
            // the acceptance floor: treat it as a newly detected change instead of trusting the
            // model's claim outright.
        }
        let change = super::DetectedChange {
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
        };
        let created = deps.changes.create(change)?;
        deps.lifecycle_events.append(LifecycleEvent {
            id: new_id("evt"),
            change_id: created.id,
            from_status: None,
            to_status: ChangeStatus::Watching,
            reason: "detected via full page audit".to_string(),
            actor_type: ActorType::System,
            checkpoint_id: None,
            created_at: now,
        })?;
        inserted += 1;
    }
    Ok(inserted)
}

fn apply_reverts(
    deps: &OrchestratorDeps<'_>,
    candidates: &[super::DetectedChange],
    proposed_reverted_ids: &[String],
    requesting_user_id: &str,
    now: DateTime<Utc>,
) -> ToolResult<usize> {
    let mut reverted = 0usize;
    for proposed_id in proposed_reverted_ids {
        let Some(candidate) = validate_revert_candidate(candidates, proposed_id, requesting_user_id)
        else {
            continue;
        };
        let result = deps.changes.cas_update_status(
            &candidate.id,
            ChangeStatus::Watching,
            Box::new(|c| c.status = ChangeStatus::Reverted),
        );
        if let Ok(updated) = result {
            deps.lifecycle_events.append(LifecycleEvent {
                id: new_id("evt"),
                change_id: updated.id,
                from_status: Some(ChangeStatus::Watching),
                to_status: ChangeStatus::Reverted,
                reason: "model detected this change was reverted".to_string(),
                actor_type: ActorType::System,
                checkpoint_id: None,
                created_at: now,
            })?;
            reverted += 1;
        }
    }
    Ok(reverted)
}
