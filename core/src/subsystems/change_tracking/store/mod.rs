pub mod in_memory;

use super::{
    Analysis, ChangeStatus, CheckpointRow, Deploy, DetectedChange, LifecycleEvent,
    OutcomeFeedback, Page, TrackedSuggestion, UserAccount,
};
use crate::contracts::ToolResult;

pub use in_memory::InMemoryStores;

/// # NDOC
/// component: `subsystems::change_tracking::store`
/// purpose: Narrow repository traits over each entity in spec.md §3, one per aggregate, following
///   the source repo's `AnalyticsRunStore` shape (`subsystems::marketing_data_analysis::persistence`):
///   a small struct wrapping the backing storage with typed, single-purpose methods rather than a
///   generic CRUD interface. The engine does not ship a real database; `InMemoryStores` is the
///   only implementation and exists to make the contract concrete and testable, not to serve
///   production traffic.
pub trait PageStore: Send + Sync {
    fn upsert(&self, page: Page) -> ToolResult<Page>;
    fn get(&self, page_id: &str) -> ToolResult<Page>;
    fn list_by_user(&self, user_id: &str) -> ToolResult<Vec<Page>>;
    /// Every page across every user, for the scheduler's cron-driven fan-out (spec.md §4.8),
    /// which runs ahead of any particular request and so has no single `user_id` to scope by.
    fn list_all(&self) -> ToolResult<Vec<Page>>;
    fn set_stable_baseline(&self, page_id: &str, analysis_id: &str) -> ToolResult<Page>;
    fn set_last_scan(&self, page_id: &str, analysis_id: &str) -> ToolResult<Page>;
}

pub trait AnalysisStore: Send + Sync {
    fn create(&self, analysis: Analysis) -> ToolResult<Analysis>;
    fn get(&self, analysis_id: &str) -> ToolResult<Analysis>;
    fn update(&self, analysis: Analysis) -> ToolResult<Analysis>;
    fn list_recent_for_page(&self, page_id: &str, limit: usize) -> ToolResult<Vec<Analysis>>;
    fn latest_complete_for_page(&self, page_id: &str) -> ToolResult<Option<Analysis>>;
}

pub trait DeployStore: Send + Sync {
    fn create(&self, deploy: Deploy) -> ToolResult<Deploy>;
    fn get(&self, deploy_id: &str) -> ToolResult<Deploy>;
    fn update(&self, deploy: Deploy) -> ToolResult<Deploy>;
}

/// # NDOC
/// component: `subsystems::change_tracking::store::AccountStore`
/// purpose: Billing state lookup for `tier::effective_tier` (spec.md §4.1 step 2). The real
///   account/billing table lives outside this engine (spec.md §1); this is the narrow read this
///   engine needs from it.
pub trait AccountStore: Send + Sync {
    fn get(&self, user_id: &str) -> ToolResult<UserAccount>;
    fn upsert(&self, account: UserAccount) -> ToolResult<UserAccount>;
}

/// # NDOC
/// component: `subsystems::change_tracking::store::ChangeStore`
/// invariants:
///   - `cas_update_status` enforces spec invariant: a status transition is rejected, not silently
///     applied, when the caller's `expected_prior_status` no longer matches the stored row.
pub trait ChangeStore: Send + Sync {
    fn create(&self, change: DetectedChange) -> ToolResult<DetectedChange>;
    fn get(&self, change_id: &str) -> ToolResult<DetectedChange>;
    fn list_for_page(&self, page_id: &str) -> ToolResult<Vec<DetectedChange>>;
    fn list_by_status(&self, page_id: &str, status: ChangeStatus) -> ToolResult<Vec<DetectedChange>>;
    fn cas_update_status(
        &self,
        change_id: &str,
        expected_prior_status: ChangeStatus,
        mutate: Box<dyn FnOnce(&mut DetectedChange) + Send>,
    ) -> ToolResult<DetectedChange>;
}

/// # NDOC
/// component: `subsystems::change_tracking::store::CheckpointStore`
/// invariants:
///   - `insert_if_absent` is a no-op, never an overwrite, on a duplicate `(change_id, horizon_days)`
///     key (spec.md §9 unique-constraint note).
pub trait CheckpointStore: Send + Sync {
    fn insert_if_absent(&self, row: CheckpointRow) -> ToolResult<InsertOutcome>;
    fn list_for_change(&self, change_id: &str) -> ToolResult<Vec<CheckpointRow>>;
    fn get_for_horizon(&self, change_id: &str, horizon_days: u32) -> ToolResult<Option<CheckpointRow>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

pub trait LifecycleEventStore: Send + Sync {
    fn append(&self, event: LifecycleEvent) -> ToolResult<LifecycleEvent>;
    fn list_for_change(&self, change_id: &str) -> ToolResult<Vec<LifecycleEvent>>;
}

pub trait SuggestionStore: Send + Sync {
    fn upsert_or_bump(&self, suggestion: TrackedSuggestion) -> ToolResult<TrackedSuggestion>;
    fn list_open_for_page(&self, page_id: &str) -> ToolResult<Vec<TrackedSuggestion>>;
}

pub trait FeedbackStore: Send + Sync {
    fn create(&self, feedback: OutcomeFeedback) -> ToolResult<OutcomeFeedback>;
    fn list_for_change(&self, change_id: &str) -> ToolResult<Vec<OutcomeFeedback>>;
}

/// # NDOC
/// component: `subsystems::change_tracking::store::ScreenshotStore`
/// purpose: Stand-in for the object store spec.md's capture pipeline writes screenshots to. Keys
///   are opaque identifiers the caller mints (typically `{analysis_id}/{desktop|mobile}`); `put`
///   returns a retrievable URL and `get` reverses it. The real object store is out of scope
///   (spec.md Non-goals); this exists so the orchestrator never has to smuggle raw image bytes
///   through a `String` field on `Analysis`.
pub trait ScreenshotStore: Send + Sync {
    fn put(&self, key: &str, bytes: Vec<u8>) -> ToolResult<String>;
    fn get(&self, url: &str) -> ToolResult<Vec<u8>>;
}
