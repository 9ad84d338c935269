use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod baseline;
pub mod checkpoint_engine;
pub mod clock;
pub mod config;
pub mod deploy;
pub mod deploy_path;
pub mod events;
pub mod fingerprint;
pub mod llm;
pub mod notifications;
pub mod orchestrator;
pub mod progress;
pub mod providers;
pub mod scheduler;
pub mod store;
pub mod tier;

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: Domain model for the page-change observation engine.
/// invariants:
///   - Every status-carrying entity enumerates its legal states as an enum, never a free string.
///   - All entities are owned by a `user_id`; cross-user access is rejected at the store boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanFrequency {
    Daily,
    Weekly,
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Daily,
    Weekly,
    Deploy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Pending,
    Scanning,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeScope {
    Element,
    Section,
    Page,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Watching,
    Validated,
    Regressed,
    Inconclusive,
    Reverted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Improved,
    Regressed,
    Neutral,
    Inconclusive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    System,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionImpact {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Open,
    Addressed,
    Dismissed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Accurate,
    Inaccurate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Enterprise,
}

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: The billing state `check-tier` (spec.md §4.1 step 2) reads to decide mobile capture
///   eligibility and deploy-scan eligibility (spec.md §4.3). A user inside `trial_ends_at` is
///   treated as `Pro` regardless of `tier` (spec.md §4.1 "considering trial window").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: String,
    pub tier: SubscriptionTier,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: A watched URL owned by a user.
/// invariants:
///   - `stable_baseline_id`, if set, references a `complete` Analysis for this page/user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub scan_frequency: ScanFrequency,
    pub stable_baseline_id: Option<String>,
    pub last_scan_id: Option<String>,
    pub metric_focus: Option<String>,
}

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: One capture-plus-audit attempt against a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub page_id: String,
    pub user_id: String,
    pub url: String,
    pub status: AnalysisStatus,
    pub trigger_type: TriggerType,
    pub parent_analysis_id: Option<String>,
    pub deploy_id: Option<String>,
    pub desktop_screenshot_url: Option<String>,
    pub mobile_screenshot_url: Option<String>,
    pub structured_output: Option<serde_json::Value>,
    pub freeform_output: Option<String>,
    pub changes_summary: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: One webhook-ingested commit batch driving the cheap deploy-scan path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deploy {
    pub id: String,
    pub repo_id: String,
    pub user_id: String,
    pub commit_sha: String,
    pub full_name: String,
    pub status: DeployStatus,
    pub changed_files: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: The central lifecycle entity: one semantically named delta between two page states.
/// invariants:
///   - Every status mutation pairs with exactly one `LifecycleEvent` row (spec invariant 1).
///   - `correlation_unlocked_at` is non-null iff status has ever left `watching`.
///   - Once `status = reverted`, no later checkpoint mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedChange {
    pub id: String,
    pub page_id: String,
    pub user_id: String,
    pub element: String,
    pub scope: ChangeScope,
    pub before_value: String,
    pub after_value: String,
    pub description: Option<String>,
    pub status: ChangeStatus,
    pub first_detected_at: DateTime<Utc>,
    pub first_detected_analysis_id: String,
    pub hypothesis: Option<String>,
    pub correlation_metrics: Option<serde_json::Value>,
    pub correlation_unlocked_at: Option<DateTime<Utc>>,
    pub observation_text: Option<String>,
    pub match_confidence: Option<f64>,
    pub match_rationale: Option<String>,
}

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: One immutable metric-window evaluation at a fixed post-change horizon.
/// invariants:
///   - Unique per `(change_id, horizon_days)`; conflicting inserts are a no-op, not an overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub id: String,
    pub change_id: String,
    pub horizon_days: u32,
    pub before_window: (DateTime<Utc>, DateTime<Utc>),
    pub after_window: (DateTime<Utc>, DateTime<Utc>),
    pub metrics_json: serde_json::Value,
    pub assessment: Assessment,
    pub confidence: Option<f64>,
    pub reasoning: String,
    pub data_sources: Vec<String>,
    pub provider: String,
    pub computed_at: DateTime<Utc>,
}

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: Audit row pairing every `detected_changes.status` mutation with its cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: String,
    pub change_id: String,
    pub from_status: Option<ChangeStatus>,
    pub to_status: ChangeStatus,
    pub reason: String,
    pub actor_type: ActorType,
    pub checkpoint_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: A persistent open-action surfaced by post-analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedSuggestion {
    pub id: String,
    pub page_id: String,
    pub user_id: String,
    pub title: String,
    pub element: String,
    pub suggested_fix: String,
    pub impact: SuggestionImpact,
    pub status: SuggestionStatus,
    pub times_suggested: u32,
    pub first_suggested_at: DateTime<Utc>,
}

/// # NDOC
/// component: `subsystems::change_tracking`
/// purpose: User judgment on a prior checkpoint, fed back into future assessor prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeFeedback {
    pub id: String,
    pub change_id: String,
    pub checkpoint_id: String,
    pub feedback_type: FeedbackType,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4())
}
