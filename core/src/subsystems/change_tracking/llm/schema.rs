use super::super::{Assessment, ChangeScope};
use serde::{Deserialize, Serialize};

/// # NDOC
/// component: `subsystems::change_tracking::llm::schema`
/// purpose: Typed request/response payloads for the five LLM call sites in spec.md §4.6/§6.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionV1 {
    pub range: String,
    pub friendly_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingV1 {
    pub id: String,
    pub title: String,
    pub element_type: String,
    pub impact: ImpactLevel,
    pub current_value: String,
    pub suggestion: String,
    pub prediction: PredictionV1,
    pub assumption: String,
    pub methodology: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadlineRewriteV1 {
    pub current: String,
    pub suggested: String,
    pub reasoning: String,
    pub current_annotation: Option<String>,
    pub suggested_annotation: Option<String>,
}

/// Structured audit payload, spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredAuditOutputV1 {
    pub findings_count: u32,
    pub verdict: String,
    pub verdict_context: String,
    pub projected_impact_range: String,
    pub summary: String,
    pub findings: Vec<FindingV1>,
    pub headline_rewrite: Option<HeadlineRewriteV1>,
}

#[derive(Debug, Clone)]
pub struct PageAuditRequest {
    pub url: String,
    pub desktop_image_bytes: Vec<u8>,
    pub mobile_image_bytes: Option<Vec<u8>>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageAuditResponse {
    pub freeform_output: String,
    pub structured: StructuredAuditOutputV1,
}

#[derive(Debug, Clone)]
pub struct QuickDiffCandidate {
    pub change_id: String,
    pub element: String,
    pub scope: ChangeScope,
}

#[derive(Debug, Clone)]
pub struct QuickDiffRequest {
    pub baseline_desktop: Vec<u8>,
    pub current_desktop: Vec<u8>,
    pub baseline_mobile: Option<Vec<u8>>,
    pub current_mobile: Option<Vec<u8>>,
    pub candidates: Vec<QuickDiffCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedChangeV1 {
    pub element: String,
    pub scope: ChangeScope,
    pub before: String,
    pub after: String,
    pub description: Option<String>,
    pub matched_change_id: Option<String>,
    pub match_confidence: Option<f64>,
    pub match_rationale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickDiffResponse {
    pub has_changes: bool,
    pub changes: Vec<ProposedChangeV1>,
}

#[derive(Debug, Clone)]
pub struct PostAnalysisRequest {
    pub current_findings: StructuredAuditOutputV1,
    pub previous_findings: Option<StructuredAuditOutputV1>,
    pub deploy_context: Option<serde_json::Value>,
    pub user_feedback: Vec<String>,
    pub pending_watching_changes: Vec<QuickDiffCandidate>,
    pub checkpoint_timelines: Vec<String>,
    pub page_focus: Option<String>,
    pub hypotheses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionProposalV1 {
    pub title: String,
    pub element: String,
    pub suggested_fix: String,
    pub impact: ImpactLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeObservationV1 {
    pub change_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostAnalysisResponse {
    pub verdict: String,
    pub verdict_context: Option<String>,
    pub changes: Vec<ProposedChangeV1>,
    pub suggestions: Vec<SuggestionProposalV1>,
    pub reverted_change_ids: Vec<String>,
    pub observations: Vec<ChangeObservationV1>,
    pub running_summary: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub horizon_days: u32,
    pub assessment: Assessment,
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointAssessmentRequest {
    pub change_element: String,
    pub horizon_days: u32,
    pub metrics: Vec<super::super::providers::MetricWindowRow>,
    pub prior_checkpoints: Vec<CheckpointSummary>,
    pub hypothesis: Option<String>,
    pub page_focus: Option<String>,
    pub prior_feedback: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointAssessmentResponse {
    pub assessment: Assessment,
    pub confidence: Option<f64>,
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct StrategyNarrativeRequest {
    pub url: String,
    pub focus: Option<String>,
    pub timeline: Vec<String>,
    pub running_summary: Option<String>,
    pub hypotheses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyNarrativeResponse {
    pub strategy_narrative: Option<String>,
    pub running_summary: Option<String>,
    pub observations: Vec<ChangeObservationV1>,
}
