use super::clock::day_start_utc;
use super::events::{AnalysisCreatedEvent, EventPublisher, IngressEvent};
use super::notifications::NotificationDispatcher;
use super::orchestrator::{run_analysis, OrchestratorDeps};
use super::{Analysis, AnalysisStatus, ScanFrequency, TriggerType};
use crate::contracts::ToolResult;
use crate::utils::logger::log_agent_event;
use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use std::collections::BTreeMap;

/// # NDOC
/// component: `subsystems::change_tracking::scheduler`
/// purpose: Pure, `now`-parameterized fan-out functions behind the cron schedule in spec.md §6.
///   These are the bodies the `cli` binary's `run-daily-scan`/`run-weekly-scan`/`run-digest`
///   subcommands invoke; the cron daemon itself is an out-of-scope collaborator (spec.md §1),
///   same as the queue that carries `events::IngressEvent` onward.
const AGENT_NAME: &str = "scheduler";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub pages_considered: usize,
    pub analyses_triggered: usize,
    pub skipped_already_run_today: usize,
    pub failed: usize,
}

/// Runs the daily scan: every `scan_frequency = daily` page not already scanned today gets one
/// `run_analysis` call, with the resulting analysis republished as `analysis/created` (spec.md
/// §4.8) for whatever durable queue sits downstream of this process.
pub async fn run_daily_scan(
    deps: &OrchestratorDeps<'_>,
    publisher: &dyn EventPublisher,
    now: DateTime<Utc>,
) -> ToolResult<ScanReport> {
    run_scheduled_scan(deps, publisher, ScanFrequency::Daily, TriggerType::Daily, now).await
}

/// Runs the weekly scan. A no-op report on any day but Monday; spec.md §4.8 ties weekly scans to
/// the same `0 9 * * 1` cron expression rather than a rolling seven-day window.
pub async fn run_weekly_scan(
    deps: &OrchestratorDeps<'_>,
    publisher: &dyn EventPublisher,
    now: DateTime<Utc>,
) -> ToolResult<ScanReport> {
    if now.weekday() != Weekday::Mon {
        return Ok(ScanReport::default());
    }
    run_scheduled_scan(deps, publisher, ScanFrequency::Weekly, TriggerType::Weekly, now).await
}

async fn run_scheduled_scan(
    deps: &OrchestratorDeps<'_>,
    publisher: &dyn EventPublisher,
    frequency: ScanFrequency,
    trigger_type: TriggerType,
    now: DateTime<Utc>,
) -> ToolResult<ScanReport> {
    let day_start = day_start_utc(now);
    let due_pages: Vec<_> = deps
        .pages
        .list_all()?
        .into_iter()
        .filter(|page| page.scan_frequency == frequency)
        .collect();

    let mut report = ScanReport {
        pages_considered: due_pages.len(),
        ..ScanReport::default()
    };

    for page in due_pages {
        let recent = deps.analyses.list_recent_for_page(&page.id, 5)?;
        if already_ran_today(&recent, trigger_type, day_start) {
            report.skipped_already_run_today += 1;
            continue;
        }

        match run_analysis(deps, &page.id, trigger_type, None, None, now).await {
            Ok(outcome) => {
                publisher.publish(IngressEvent::AnalysisCreated(AnalysisCreatedEvent {
                    analysis_id: outcome.analysis.id.clone(),
                    url: outcome.analysis.url.clone(),
                    parent_analysis_id: None,
                }));
                log_agent_event(
                    AGENT_NAME,
                    "analysis_scheduled",
                    &serde_json::json!({
                        "page_id": page.id,
                        "trigger_type": format!("{trigger_type:?}"),
                        "analysis_id": outcome.analysis.id,
                        "new_changes": outcome.new_changes,
                    }),
                );
                report.analyses_triggered += 1;
            }
            Err(err) => {
                log_agent_event(
                    AGENT_NAME,
                    "analysis_scheduling_failed",
                    &serde_json::json!({ "page_id": page.id, "error": err.message }),
                );
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

fn already_ran_today(
    existing: &[Analysis],
    trigger_type: TriggerType,
    day_start: DateTime<Utc>,
) -> bool {
    existing
        .iter()
        .any(|analysis| analysis.trigger_type == trigger_type && analysis.created_at >= day_start)
}

/// Lookback window for `run_digest`, per spec.md §4.8: "aggregates completed daily/weekly
/// analyses from the last three hours per user".
const DIGEST_WINDOW_HOURS: i64 = 3;

#[derive(Debug, Clone, PartialEq)]
struct DigestLine {
    url: String,
    new_changes: usize,
}

/// Runs the daily digest job, two hours after the `0 9 * * *` daily scan per spec.md §6's
/// `0 11 * * *` cron expression. Aggregates every page whose completed daily/weekly analysis in
/// the trailing three hours produced at least one new `DetectedChange`, and sends one
/// consolidated email per affected user; a user with no page changes in the window gets no email
/// at all (spec.md §4.8/§6).
pub async fn run_digest(
    deps: &OrchestratorDeps<'_>,
    dispatcher: &dyn NotificationDispatcher,
    recipient_for_user: impl Fn(&str) -> Option<String>,
    now: DateTime<Utc>,
) -> ToolResult<usize> {
    let window_start = now - Duration::hours(DIGEST_WINDOW_HOURS);
    let mut lines_by_user: BTreeMap<String, Vec<DigestLine>> = BTreeMap::new();

    for page in deps.pages.list_all()? {
        let recent = deps.analyses.list_recent_for_page(&page.id, 20)?;
        let relevant = recent.into_iter().filter(|analysis| {
            analysis.status == AnalysisStatus::Complete
                && matches!(analysis.trigger_type, TriggerType::Daily | TriggerType::Weekly)
                && analysis.created_at >= window_start
                && analysis.created_at <= now
        });

        let page_changes = deps.changes.list_for_page(&page.id)?;
        for analysis in relevant {
            let new_changes = page_changes
                .iter()
                .filter(|change| change.first_detected_analysis_id == analysis.id)
                .count();
            if new_changes == 0 {
                continue;
            }
            lines_by_user
                .entry(page.user_id.clone())
                .or_default()
                .push(DigestLine {
                    url: page.url.clone(),
                    new_changes,
                });
        }
    }

    let mut sent = 0;
    for (user_id, lines) in lines_by_user {
        let Some(to) = recipient_for_user(&user_id) else {
            continue;
        };
        let subject = format!(
            "Daily digest: {} page{} changed",
            lines.len(),
            if lines.len() == 1 { "" } else { "s" }
        );
        let body = lines
            .iter()
            .map(|line| {
                format!(
                    "- {}: {} new change{}",
                    line.url,
                    line.new_changes,
                    if line.new_changes == 1 { "" } else { "s" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        dispatcher.send(&to, &subject, &body)?;
        sent += 1;
    }

    log_agent_event(
        AGENT_NAME,
        "digest_sent",
        &serde_json::json!({ "emails_sent": sent }),
    );
    Ok(sent)
}
