use super::{
    AccountStore, AnalysisStore, ChangeStore, CheckpointStore, DeployStore, FeedbackStore,
    InsertOutcome, LifecycleEventStore, PageStore, ScreenshotStore, SuggestionStore,
};
use crate::contracts::{ToolError, ToolResult};
use crate::subsystems::change_tracking::{
    Analysis, CheckpointRow, ChangeStatus, Deploy, DetectedChange, LifecycleEvent,
    OutcomeFeedback, Page, TrackedSuggestion, UserAccount,
};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// # NDOC
/// component: `subsystems::change_tracking::store::in_memory`
/// purpose: The only concrete store implementation shipped by this engine. A
///   `Mutex`-guarded `BTreeMap` per aggregate, deliberately thin: the production storage layer
///   this contract describes is out of scope (spec.md Non-goals), and this exists to make the
///   repository traits concrete enough to exercise in tests and in single-process deployments.
#[derive(Default)]
pub struct InMemoryStores {
    pages: Mutex<BTreeMap<String, Page>>,
    analyses: Mutex<BTreeMap<String, Analysis>>,
    deploys: Mutex<BTreeMap<String, Deploy>>,
    changes: Mutex<BTreeMap<String, DetectedChange>>,
    checkpoints: Mutex<BTreeMap<(String, u32), CheckpointRow>>,
    lifecycle_events: Mutex<Vec<LifecycleEvent>>,
    suggestions: Mutex<BTreeMap<String, TrackedSuggestion>>,
    feedback: Mutex<Vec<OutcomeFeedback>>,
    screenshots: Mutex<BTreeMap<String, Vec<u8>>>,
    accounts: Mutex<BTreeMap<String, UserAccount>>,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_poisoned(what: &str) -> ToolError {
    ToolError::internal(format!("{what} store lock poisoned"))
}

/// Normalized `(page_id, element, title)` dedup key for `SuggestionStore::upsert_or_bump`
/// (spec.md §4.2: "deduplicated within the scan by normalized `(element, title)` key").
fn normalized_suggestion_key(page_id: &str, element: &str, title: &str) -> String {
    format!(
        "{page_id}::{}::{}",
        element.trim().to_lowercase(),
        title.trim().to_lowercase()
    )
}

impl PageStore for InMemoryStores {
    fn upsert(&self, page: Page) -> ToolResult<Page> {
        let mut pages = self.pages.lock().map_err(|_| lock_poisoned("page"))?;
        pages.insert(page.id.clone(), page.clone());
        Ok(page)
    }

    fn get(&self, page_id: &str) -> ToolResult<Page> {
        let pages = self.pages.lock().map_err(|_| lock_poisoned("page"))?;
        pages
            .get(page_id)
            .cloned()
            .ok_or_else(|| ToolError::not_found(format!("page {page_id} not found")))
    }

    fn list_by_user(&self, user_id: &str) -> ToolResult<Vec<Page>> {
        let pages = self.pages.lock().map_err(|_| lock_poisoned("page"))?;
        Ok(pages
            .values()
            .filter(|page| page.user_id == user_id)
            .cloned()
            .collect())
    }

    fn list_all(&self) -> ToolResult<Vec<Page>> {
        let pages = self.pages.lock().map_err(|_| lock_poisoned("page"))?;
        Ok(pages.values().cloned().collect())
    }

    fn set_stable_baseline(&self, page_id: &str, analysis_id: &str) -> ToolResult<Page> {
        let mut pages = self.pages.lock().map_err(|_| lock_poisoned("page"))?;
        let page = pages
            .get_mut(page_id)
            .ok_or_else(|| ToolError::not_found(format!("page {page_id} not found")))?;
        page.stable_baseline_id = Some(analysis_id.to_string());
        Ok(page.clone())
    }

    fn set_last_scan(&self, page_id: &str, analysis_id: &str) -> ToolResult<Page> {
        let mut pages = self.pages.lock().map_err(|_| lock_poisoned("page"))?;
        let page = pages
            .get_mut(page_id)
            .ok_or_else(|| ToolError::not_found(format!("page {page_id} not found")))?;
        page.last_scan_id = Some(analysis_id.to_string());
        Ok(page.clone())
    }
}

impl AnalysisStore for InMemoryStores {
    fn create(&self, analysis: Analysis) -> ToolResult<Analysis> {
        let mut analyses = self.analyses.lock().map_err(|_| lock_poisoned("analysis"))?;
        if analyses.contains_key(&analysis.id) {
            return Err(ToolError::conflict(format!(
                "analysis {} already exists",
                analysis.id
            )));
        }
        analyses.insert(analysis.id.clone(), analysis.clone());
        Ok(analysis)
    }

    fn get(&self, analysis_id: &str) -> ToolResult<Analysis> {
        let analyses = self.analyses.lock().map_err(|_| lock_poisoned("analysis"))?;
        analyses
            .get(analysis_id)
            .cloned()
            .ok_or_else(|| ToolError::not_found(format!("analysis {analysis_id} not found")))
    }

    fn update(&self, analysis: Analysis) -> ToolResult<Analysis> {
        let mut analyses = self.analyses.lock().map_err(|_| lock_poisoned("analysis"))?;
        if !analyses.contains_key(&analysis.id) {
            return Err(ToolError::not_found(format!(
                "analysis {} not found",
                analysis.id
            )));
        }
        analyses.insert(analysis.id.clone(), analysis.clone());
        Ok(analysis)
    }

    fn list_recent_for_page(&self, page_id: &str, limit: usize) -> ToolResult<Vec<Analysis>> {
        let analyses = self.analyses.lock().map_err(|_| lock_poisoned("analysis"))?;
        let mut matching: Vec<Analysis> = analyses
            .values()
            .filter(|analysis| analysis.page_id == page_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    fn latest_complete_for_page(&self, page_id: &str) -> ToolResult<Option<Analysis>> {
        let analyses = self.analyses.lock().map_err(|_| lock_poisoned("analysis"))?;
        let mut matching: Vec<Analysis> = analyses
            .values()
            .filter(|analysis| {
                analysis.page_id == page_id
                    && analysis.status == crate::subsystems::change_tracking::AnalysisStatus::Complete
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching.into_iter().next())
    }
}

impl DeployStore for InMemoryStores {
    fn create(&self, deploy: Deploy) -> ToolResult<Deploy> {
        let mut deploys = self.deploys.lock().map_err(|_| lock_poisoned("deploy"))?;
        deploys.insert(deploy.id.clone(), deploy.clone());
        Ok(deploy)
    }

    fn get(&self, deploy_id: &str) -> ToolResult<Deploy> {
        let deploys = self.deploys.lock().map_err(|_| lock_poisoned("deploy"))?;
        deploys
            .get(deploy_id)
            .cloned()
            .ok_or_else(|| ToolError::not_found(format!("deploy {deploy_id} not found")))
    }

    fn update(&self, deploy: Deploy) -> ToolResult<Deploy> {
        let mut deploys = self.deploys.lock().map_err(|_| lock_poisoned("deploy"))?;
        if !deploys.contains_key(&deploy.id) {
            return Err(ToolError::not_found(format!("deploy {} not found", deploy.id)));
        }
        deploys.insert(deploy.id.clone(), deploy.clone());
        Ok(deploy)
    }
}

impl ChangeStore for InMemoryStores {
    fn create(&self, change: DetectedChange) -> ToolResult<DetectedChange> {
        let mut changes = self.changes.lock().map_err(|_| lock_poisoned("change"))?;
        if changes.contains_key(&change.id) {
            return Err(ToolError::conflict(format!(
                "change {} already exists",
                change.id
            )));
        }
        changes.insert(change.id.clone(), change.clone());
        Ok(change)
    }

    fn get(&self, change_id: &str) -> ToolResult<DetectedChange> {
        let changes = self.changes.lock().map_err(|_| lock_poisoned("change"))?;
        changes
            .get(change_id)
            .cloned()
            .ok_or_else(|| ToolError::not_found(format!("change {change_id} not found")))
    }

    fn list_for_page(&self, page_id: &str) -> ToolResult<Vec<DetectedChange>> {
        let changes = self.changes.lock().map_err(|_| lock_poisoned("change"))?;
        Ok(changes
            .values()
            .filter(|change| change.page_id == page_id)
            .cloned()
            .collect())
    }

    fn list_by_status(&self, page_id: &str, status: ChangeStatus) -> ToolResult<Vec<DetectedChange>> {
        let changes = self.changes.lock().map_err(|_| lock_poisoned("change"))?;
        Ok(changes
            .values()
            .filter(|change| change.page_id == page_id && change.status == status)
            .cloned()
            .collect())
    }

    fn cas_update_status(
        &self,
        change_id: &str,
        expected_prior_status: ChangeStatus,
        mutate: Box<dyn FnOnce(&mut DetectedChange) + Send>,
    ) -> ToolResult<DetectedChange> {
        let mut changes = self.changes.lock().map_err(|_| lock_poisoned("change"))?;
        let change = changes
            .get_mut(change_id)
            .ok_or_else(|| ToolError::not_found(format!("change {change_id} not found")))?;
        if change.status != expected_prior_status {
            return Err(ToolError::conflict(format!(
                "change {change_id} expected prior status {:?} but found {:?}",
                expected_prior_status, change.status
            )));
        }
        mutate(change);
        Ok(change.clone())
    }
}

impl CheckpointStore for InMemoryStores {
    fn insert_if_absent(&self, row: CheckpointRow) -> ToolResult<InsertOutcome> {
        let mut checkpoints = self.checkpoints.lock().map_err(|_| lock_poisoned("checkpoint"))?;
        let key = (row.change_id.clone(), row.horizon_days);
        if checkpoints.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        checkpoints.insert(key, row);
        Ok(InsertOutcome::Inserted)
    }

    fn list_for_change(&self, change_id: &str) -> ToolResult<Vec<CheckpointRow>> {
        let checkpoints = self.checkpoints.lock().map_err(|_| lock_poisoned("checkpoint"))?;
        let mut matching: Vec<CheckpointRow> = checkpoints
            .values()
            .filter(|row| row.change_id == change_id)
            .cloned()
            .collect();
        matching.sort_by_key(|row| row.horizon_days);
        Ok(matching)
    }

    fn get_for_horizon(&self, change_id: &str, horizon_days: u32) -> ToolResult<Option<CheckpointRow>> {
        let checkpoints = self.checkpoints.lock().map_err(|_| lock_poisoned("checkpoint"))?;
        Ok(checkpoints.get(&(change_id.to_string(), horizon_days)).cloned())
    }
}

impl LifecycleEventStore for InMemoryStores {
    fn append(&self, event: LifecycleEvent) -> ToolResult<LifecycleEvent> {
        let mut events = self
            .lifecycle_events
            .lock()
            .map_err(|_| lock_poisoned("lifecycle_event"))?;
        events.push(event.clone());
        Ok(event)
    }

    fn list_for_change(&self, change_id: &str) -> ToolResult<Vec<LifecycleEvent>> {
        let events = self
            .lifecycle_events
            .lock()
            .map_err(|_| lock_poisoned("lifecycle_event"))?;
        Ok(events
            .iter()
            .filter(|event| event.change_id == change_id)
            .cloned()
            .collect())
    }
}

impl SuggestionStore for InMemoryStores {
    fn upsert_or_bump(&self, suggestion: TrackedSuggestion) -> ToolResult<TrackedSuggestion> {
        let mut suggestions = self
            .suggestions
            .lock()
            .map_err(|_| lock_poisoned("suggestion"))?;
        let key = normalized_suggestion_key(&suggestion.page_id, &suggestion.element, &suggestion.title);
        match suggestions.get_mut(&key) {
            Some(existing) => {
                existing.times_suggested += 1;
                existing.suggested_fix = suggestion.suggested_fix;
                existing.impact = suggestion.impact;
                existing.status = crate::subsystems::change_tracking::SuggestionStatus::Open;
                Ok(existing.clone())
            }
            None => {
                suggestions.insert(key, suggestion.clone());
                Ok(suggestion)
            }
        }
    }

    fn list_open_for_page(&self, page_id: &str) -> ToolResult<Vec<TrackedSuggestion>> {
        let suggestions = self
            .suggestions
            .lock()
            .map_err(|_| lock_poisoned("suggestion"))?;
        Ok(suggestions
            .values()
            .filter(|suggestion| {
                suggestion.page_id == page_id
                    && suggestion.status == crate::subsystems::change_tracking::SuggestionStatus::Open
            })
            .cloned()
            .collect())
    }
}

impl FeedbackStore for InMemoryStores {
    fn create(&self, feedback: OutcomeFeedback) -> ToolResult<OutcomeFeedback> {
        let mut all_feedback = self.feedback.lock().map_err(|_| lock_poisoned("feedback"))?;
        all_feedback.push(feedback.clone());
        Ok(feedback)
    }

    fn list_for_change(&self, change_id: &str) -> ToolResult<Vec<OutcomeFeedback>> {
        let all_feedback = self.feedback.lock().map_err(|_| lock_poisoned("feedback"))?;
        Ok(all_feedback
            .iter()
            .filter(|feedback| feedback.change_id == change_id)
            .cloned()
            .collect())
    }
}

impl AccountStore for InMemoryStores {
    fn get(&self, user_id: &str) -> ToolResult<UserAccount> {
        let accounts = self.accounts.lock().map_err(|_| lock_poisoned("account"))?;
        accounts
            .get(user_id)
            .cloned()
            .ok_or_else(|| ToolError::not_found(format!("account {user_id} not found")))
    }

    fn upsert(&self, account: UserAccount) -> ToolResult<UserAccount> {
        let mut accounts = self.accounts.lock().map_err(|_| lock_poisoned("account"))?;
        accounts.insert(account.user_id.clone(), account.clone());
        Ok(account)
    }
}

const SCREENSHOT_URL_PREFIX: &str = "mem://screenshots/";

impl ScreenshotStore for InMemoryStores {
    fn put(&self, key: &str, bytes: Vec<u8>) -> ToolResult<String> {
        let mut screenshots = self.screenshots.lock().map_err(|_| lock_poisoned("screenshot"))?;
        screenshots.insert(key.to_string(), bytes);
        Ok(format!("{SCREENSHOT_URL_PREFIX}{key}"))
    }

    fn get(&self, url: &str) -> ToolResult<Vec<u8>> {
        let key = url.strip_prefix(SCREENSHOT_URL_PREFIX).unwrap_or(url);
        let screenshots = self.screenshots.lock().map_err(|_| lock_poisoned("screenshot"))?;
        screenshots
            .get(key)
            .cloned()
            .ok_or_else(|| ToolError::not_found(format!("screenshot {url} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::change_tracking::{ChangeScope, new_id};
    use chrono::Utc;

    fn sample_change(page_id: &str, status: ChangeStatus) -> DetectedChange {
        DetectedChange {
            id: new_id("chg"),
            page_id: page_id.to_string(),
            user_id: "user_1".to_string(),
            element: "hero-cta".to_string(),
            scope: ChangeScope::Element,
            before_value: "Sign up".to_string(),
            after_value: "Start free trial".to_string(),
            description: None,
            status,
            first_detected_at: Utc::now(),
            first_detected_analysis_id: new_id("an"),
            hypothesis: None,
            correlation_metrics: None,
            correlation_unlocked_at: None,
            observation_text: None,
            match_confidence: None,
            match_rationale: None,
        }
    }

    #[test]
    fn cas_update_rejects_stale_expected_status() {
        let store = InMemoryStores::new();
        let change = sample_change("page_1", ChangeStatus::Watching);
        let change_id = change.id.clone();
        store.create(change).unwrap();

        let result = store.cas_update_status(
            &change_id,
            ChangeStatus::Validated,
            Box::new(|_| {}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn cas_update_applies_mutation_on_matching_status() {
        let store = InMemoryStores::new();
        let change = sample_change("page_1", ChangeStatus::Watching);
        let change_id = change.id.clone();
        store.create(change).unwrap();

        let updated = store
            .cas_update_status(&change_id, ChangeStatus::Watching, Box::new(|c| {
                c.status = ChangeStatus::Validated;
            }))
            .unwrap();
        assert_eq!(updated.status, ChangeStatus::Validated);
    }

    #[test]
    fn checkpoint_insert_is_idempotent_per_horizon() {
        let store = InMemoryStores::new();
        let now = Utc::now();
        let row = CheckpointRow {
            id: new_id("chk"),
            change_id: "chg_1".to_string(),
            horizon_days: 7,
            before_window: (now, now),
            after_window: (now, now),
            metrics_json: serde_json::json!([]),
            assessment: crate::subsystems::change_tracking::Assessment::Neutral,
            confidence: Some(0.3),
            reasoning: "test".to_string(),
            data_sources: vec!["none".to_string()],
            provider: "none".to_string(),
            computed_at: now,
        };
        let first = store.insert_if_absent(row.clone()).unwrap();
        let second = store.insert_if_absent(row).unwrap();
        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::AlreadyPresent);
    }

    #[test]
    fn page_not_found_is_not_found_error() {
        let store = InMemoryStores::new();
        let err = store.get("missing").unwrap_err();
        assert_eq!(err.kind, crate::contracts::ToolErrorKind::NotFoundError);
    }

    #[test]
    fn screenshot_round_trips_through_returned_url() {
        let store = InMemoryStores::new();
        let url = store.put("an_1/desktop", vec![1, 2, 3]).unwrap();
        let bytes = store.get(&url).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    fn sample_suggestion(id: &str) -> TrackedSuggestion {
        TrackedSuggestion {
            id: id.to_string(),
            page_id: "page_1".to_string(),
            user_id: "user_1".to_string(),
            title: "Shorten the hero headline".to_string(),
            element: "Hero headline".to_string(),
            suggested_fix: "Cut to one clause".to_string(),
            impact: crate::subsystems::change_tracking::SuggestionImpact::Medium,
            status: crate::subsystems::change_tracking::SuggestionStatus::Open,
            times_suggested: 1,
            first_suggested_at: Utc::now(),
        }
    }

    #[test]
    fn repeat_suggestion_bumps_count_and_overwrites_fix_and_impact() {
        let store = InMemoryStores::new();
        store.upsert_or_bump(sample_suggestion("sug_1")).unwrap();

        let mut repeat = sample_suggestion("sug_2");
        repeat.suggested_fix = "Lead with the number".to_string();
        repeat.impact = crate::subsystems::change_tracking::SuggestionImpact::High;
        repeat.status = crate::subsystems::change_tracking::SuggestionStatus::Addressed;
        let bumped = store.upsert_or_bump(repeat).unwrap();

        assert_eq!(bumped.times_suggested, 2);
        assert_eq!(bumped.suggested_fix, "Lead with the number");
        assert_eq!(bumped.impact, crate::subsystems::change_tracking::SuggestionImpact::High);
        assert_eq!(bumped.status, crate::subsystems::change_tracking::SuggestionStatus::Open);
    }

    #[test]
    fn account_round_trips_through_upsert_and_get() {
        use crate::subsystems::change_tracking::{SubscriptionTier, UserAccount};
        let store = InMemoryStores::new();
        let account = UserAccount {
            user_id: "user_1".to_string(),
            tier: SubscriptionTier::Pro,
            trial_ends_at: None,
        };
        store.upsert(account).unwrap();

        let fetched = store.get("user_1").unwrap();
        assert_eq!(fetched.tier, SubscriptionTier::Pro);
    }

    #[test]
    fn account_not_found_for_unknown_user() {
        let store = InMemoryStores::new();
        let err = store.get("nobody").unwrap_err();
        assert_eq!(err.kind, crate::contracts::ToolErrorKind::NotFoundError);
    }

    #[test]
    fn suggestion_key_is_case_and_whitespace_insensitive() {
        let store = InMemoryStores::new();
        store.upsert_or_bump(sample_suggestion("sug_1")).unwrap();

        let mut repeat = sample_suggestion("sug_2");
        repeat.element = "  hero headline  ".to_string();
        repeat.title = "SHORTEN THE HERO HEADLINE".to_string();
        let bumped = store.upsert_or_bump(repeat).unwrap();
        assert_eq!(bumped.times_suggested, 2);

        let open = store.list_open_for_page("page_1").unwrap();
        assert_eq!(open.len(), 1);
    }
}
