use super::notifications::NotificationDispatcher;
use super::orchestrator::{run_analysis, OrchestratorDeps};
use super::store::DeployStore;
use super::tier;
use super::{Deploy, DeployStatus, SubscriptionTier, TriggerType, UserAccount};
use crate::contracts::ToolResult;
use crate::utils::logger::log_agent_event;
use chrono::{DateTime, Utc};
use std::time::Duration as StdDuration;

const AGENT_NAME: &str = "deploy";

/// # NDOC
/// component: `subsystems::change_tracking::deploy`
/// purpose: The `deploy/detected` ingress handler, spec.md §4.3. Reuses `orchestrator::run_analysis`
///   for the per-page stale/fresh branching rather than re-implementing baseline resolution here:
///   a deploy-triggered analysis is ordinary `run_analysis` with `trigger_type = deploy`, the only
///   deploy-specific concerns are tier gating, the build-settle delay, which pages are in scope,
///   and the deploy-specific email.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployScanReport {
    pub pages_scanned: usize,
    pub new_changes: usize,
    pub emailed: bool,
}

/// Allows the build to land before screenshots are captured (spec.md §5 "deploy path sleeps 45s").
pub const DEPLOY_SETTLE_SECS: u64 = 45;

/// Runs the deploy-triggered scan for one webhook-ingested `Deploy` row. `page_matches_deploy` is
/// the URL↔changed-file heuristic spec.md §4.3 calls out as an external helper; callers supply it
/// rather than this module guessing at repo layout. `settle_secs` is `DEPLOY_SETTLE_SECS` in
/// production and `0` in tests, so the 45s wait is not itself part of this function's contract.
pub async fn run_deploy_scan(
    deps: &OrchestratorDeps<'_>,
    deploys: &dyn DeployStore,
    dispatcher: &dyn NotificationDispatcher,
    recipient_for_user: impl Fn(&str) -> Option<String>,
    deploy: Deploy,
    page_matches_deploy: impl Fn(&str, &[String]) -> bool,
    settle_secs: u64,
    now: DateTime<Utc>,
) -> ToolResult<DeployScanReport> {
    let account = deps.accounts.get(&deploy.user_id).unwrap_or(UserAccount {
        user_id: deploy.user_id.clone(),
        tier: SubscriptionTier::Free,
        trial_ends_at: None,
    });

    if !tier::allows_deploy_scan(&account, now) {
        let mut completed = deploy;
        completed.status = DeployStatus::Complete;
        deploys.update(completed.clone())?;
        log_agent_event(
            AGENT_NAME,
            "deploy_scan_skipped_free_tier",
            &serde_json::json!({ "deploy_id": completed.id, "user_id": completed.user_id }),
        );
        return Ok(DeployScanReport::default());
    }

    let mut scanning = deploy;
    scanning.status = DeployStatus::Scanning;
    deploys.update(scanning.clone())?;
    let deploy = scanning;

    tokio::time::sleep(StdDuration::from_secs(settle_secs)).await;

    let matching_pages: Vec<_> = deps
        .pages
        .list_by_user(&deploy.user_id)?
        .into_iter()
        .filter(|page| page_matches_deploy(&page.url, &deploy.changed_files))
        .collect();

    let mut report = DeployScanReport {
        pages_scanned: matching_pages.len(),
        ..DeployScanReport::default()
    };
    let mut first_change_line: Option<String> = None;

    for page in &matching_pages {
        let outcome = run_analysis(
            deps,
            &page.id,
            TriggerType::Deploy,
            None,
            Some(deploy.id.clone()),
            now,
        )
        .await?;
        report.new_changes += outcome.new_changes;

        if first_change_line.is_none() && outcome.new_changes > 0 {
            if let Some(change) = deps
                .changes
                .list_for_page(&page.id)?
                .into_iter()
                .find(|change| change.first_detected_analysis_id == outcome.analysis.id)
            {
                first_change_line = Some(format!(
                    "{} on {}: \"{}\" -> \"{}\"",
                    change.element, page.url, change.before_value, change.after_value
                ));
            }
        }
    }

    let mut completed = deploy;
    completed.status = DeployStatus::Complete;
    deploys.update(completed.clone())?;

    if report.new_changes > 0 {
        // spec.md §6: "deploy-detected changes produce a watching mail".
        if let Some(to) = recipient_for_user(&completed.user_id) {
            let body = first_change_line.unwrap_or_else(|| {
                format!("{} new change(s) detected after deploy", report.new_changes)
            });
            dispatcher.send(&to, "New change detected after deploy", &body)?;
            report.emailed = true;
        }
    }
    // spec.md §6: "stable-page deploys send no mail" — no email when nothing new was recorded.

    log_agent_event(
        AGENT_NAME,
        "deploy_scan_completed",
        &serde_json::json!({
            "deploy_id": completed.id,
            "pages_scanned": report.pages_scanned,
            "new_changes": report.new_changes,
            "emailed": report.emailed,
        }),
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::change_tracking::llm::LlmBackend;
    use crate::subsystems::change_tracking::store::InMemoryStores;
    use crate::subsystems::change_tracking::{new_id, Page, ScanFrequency};
    use crate::tools::screenshot_tool::PlaywrightRunner;
    use async_trait::async_trait;
    use std::error::Error as StdError;
    use std::sync::Mutex;

    struct StaticBackend(String);

    #[async_trait]
    impl LlmBackend for StaticBackend {
        async fn complete(&self, _s: &str, _u: &str, _images: &[Vec<u8>]) -> ToolResult<String> {
            Ok(self.0.clone())
        }
    }

    struct FixedScreenshotRunner;

    #[async_trait]
    impl PlaywrightRunner for FixedScreenshotRunner {
        async fn take_screenshot_from_url(
            &self,
            _url: &str,
        ) -> Result<Vec<u8>, Box<dyn StdError + Send + Sync>> {
            Ok(vec![9, 9, 9])
        }
    }

    struct RecordingDispatcher {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    impl RecordingDispatcher {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl NotificationDispatcher for RecordingDispatcher {
        fn send(&self, to: &str, subject: &str, body: &str) -> ToolResult<()> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn page(user_id: &str, url: &str) -> Page {
        Page {
            id: new_id("page"),
            user_id: user_id.to_string(),
            url: url.to_string(),
            scan_frequency: ScanFrequency::Manual,
            stable_baseline_id: None,
            last_scan_id: None,
            metric_focus: None,
        }
    }

    fn deploy(user_id: &str, changed_files: Vec<String>) -> Deploy {
        Deploy {
            id: new_id("dep"),
            repo_id: "repo_1".to_string(),
            user_id: user_id.to_string(),
            commit_sha: "abc123".to_string(),
            full_name: "acme/marketing-site".to_string(),
            status: DeployStatus::Pending,
            changed_files,
            created_at: Utc::now(),
        }
    }

    fn deps<'a>(stores: &'a InMemoryStores, backend: &'a dyn LlmBackend) -> OrchestratorDeps<'a> {
        static RUNNER: FixedScreenshotRunner = FixedScreenshotRunner;
        OrchestratorDeps {
            pages: stores,
            analyses: stores,
            changes: stores,
            lifecycle_events: stores,
            suggestions: stores,
            accounts: stores,
            screenshots: &RUNNER,
            screenshot_store: stores,
            llm_backend: backend,
            match_confidence_threshold: 0.6,
        }
    }

    #[tokio::test]
    async fn free_tier_deploy_marks_complete_without_scanning() {
        let stores = InMemoryStores::new();
        stores
            .upsert(UserAccount {
                user_id: "user_1".to_string(),
                tier: SubscriptionTier::Free,
                trial_ends_at: None,
            })
            .unwrap();
        let p = page("user_1", "https://example.test/pricing");
        stores.upsert(p.clone()).unwrap();

        let backend = StaticBackend(r#"{"findings_count": 0, "verdict": "n/a", "verdict_context": "n/a", "projected_impact_range": "0-0%", "summary": "n/a", "findings": [], "headline_rewrite": null}"#.to_string());
        let d = deps(&stores, &backend);
        let dispatcher = RecordingDispatcher::new();

        let dep = deploy("user_1", vec!["pricing.html".to_string()]);
        let dep_id = dep.id.clone();
        stores.create(dep.clone()).unwrap();

        let report = run_deploy_scan(
            &d,
            &stores,
            &dispatcher,
            |_| None,
            dep,
            |url, files| files.iter().any(|f| url.contains(&f.replace(".html", ""))),
            0,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(report, DeployScanReport::default());
        let stored = stores.get(&dep_id).unwrap();
        assert_eq!(stored.status, DeployStatus::Complete);
    }

    #[tokio::test]
    async fn pro_tier_deploy_scans_matching_pages_and_completes() {
        let stores = InMemoryStores::new();
        stores
            .upsert(UserAccount {
                user_id: "user_1".to_string(),
                tier: SubscriptionTier::Pro,
                trial_ends_at: None,
            })
            .unwrap();
        let matching_page = page("user_1", "https://example.test/pricing");
        let other_page = page("user_1", "https://example.test/about");
        stores.upsert(matching_page.clone()).unwrap();
        stores.upsert(other_page).unwrap();

        let backend = StaticBackend(r#"{"findings_count": 0, "verdict": "n/a", "verdict_context": "n/a", "projected_impact_range": "0-0%", "summary": "n/a", "findings": [], "headline_rewrite": null}"#.to_string());
        let d = deps(&stores, &backend);
        let dispatcher = RecordingDispatcher::new();

        let dep = deploy("user_1", vec!["pricing.html".to_string()]);
        let dep_id = dep.id.clone();
        stores.create(dep.clone()).unwrap();

        let report = run_deploy_scan(
            &d,
            &stores,
            &dispatcher,
            |_| Some("user@example.test".to_string()),
            dep,
            |url, files| files.iter().any(|f| url.contains(&f.replace(".html", ""))),
            0,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(report.pages_scanned, 1);
        let stored = stores.get(&dep_id).unwrap();
        assert_eq!(stored.status, DeployStatus::Complete);
        // No changes were proposed by the stub audit, so no email is sent.
        assert!(!report.emailed);
        assert!(dispatcher.sent.lock().unwrap().is_empty());
    }
}
