pub mod fallback;
pub mod schema;

use crate::contracts::{ToolError, ToolResult};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use schema::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// # NDOC
/// component: `subsystems::change_tracking::llm`
/// purpose: Generalizes the source repo's single `send_text_prompt` Gemini caller
///   (`llm_client.rs`) into five typed call sites (spec.md §4.6): `page_audit`, `quick_diff`,
///   `post_analysis`, `checkpoint_assessment`, `strategy_narrative`. Every call site shares the
///   same retry-then-fallback envelope so a model outage degrades the pipeline instead of
///   stalling it.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Sends a system/user prompt pair, with optional inline images, and returns the model's raw
    /// text response. Callers are responsible for parsing that text as JSON; this trait only
    /// speaks transport.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        images: &[Vec<u8>],
    ) -> ToolResult<String>;
}

const MAX_CALLS_PER_MINUTE: usize = 10;

/// Reqwest-backed Gemini client, generalized from the source repo's `llm_client::send_text_prompt`
/// rate limiter (a global atomic counter plus a minute-window reset) into an instance so tests can
/// construct a fake `LlmBackend` instead of touching process-wide statics.
pub struct GeminiBackend {
    api_key: String,
    model: String,
    call_count: AtomicUsize,
    last_reset: Mutex<Instant>,
}

impl GeminiBackend {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            call_count: AtomicUsize::new(0),
            last_reset: Mutex::new(Instant::now()),
        }
    }

    async fn throttle(&self) {
        loop {
            let mut last_reset = self.last_reset.lock().expect("llm rate limiter mutex poisoned");
            let elapsed = last_reset.elapsed();

            if elapsed >= Duration::from_secs(60) {
                self.call_count.store(0, Ordering::SeqCst);
                *last_reset = Instant::now();
            }

            let current_calls = self.call_count.fetch_add(1, Ordering::SeqCst);
            if current_calls >= MAX_CALLS_PER_MINUTE {
                let wait = Duration::from_secs(60).saturating_sub(elapsed);
                drop(last_reset);
                sleep(wait).await;
                let mut last_reset = self.last_reset.lock().expect("llm rate limiter mutex poisoned");
                self.call_count.store(0, Ordering::SeqCst);
                *last_reset = Instant::now();
                continue;
            }
            break;
        }
    }
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        images: &[Vec<u8>],
    ) -> ToolResult<String> {
        self.throttle().await;

        let api_url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let mut parts: Vec<Value> = vec![json!({ "text": format!("{system_prompt}\n\n{user_prompt}") })];
        for image in images {
            parts.push(json!({
                "inlineData": {
                    "mimeType": "image/png",
                    "data": general_purpose::STANDARD.encode(image),
                }
            }));
        }

        let body = json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "temperature": 0.4,
                "topP": 1.0,
                "topK": 40,
                "candidateCount": 1,
                "maxOutputTokens": 2048,
            }
        });

        let client = reqwest::Client::new();
        let response = client
            .post(&api_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ToolError::provider(format!("gemini request failed: {err}"), true))?;

        if !response.status().is_success() {
            let retryable = response.status().is_server_error() || response.status().as_u16() == 429;
            return Err(ToolError::provider(
                format!("gemini responded with status {}", response.status()),
                retryable,
            ));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|err| ToolError::provider(format!("gemini response malformed: {err}"), false))?;

        parsed["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ToolError::provider("gemini response had no text candidate", false))
    }
}

const MAX_ATTEMPTS: u32 = 3;

async fn call_with_retry<T>(
    backend: &dyn LlmBackend,
    system_prompt: &str,
    user_prompt: &str,
    images: &[Vec<u8>],
) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    for attempt in 0..MAX_ATTEMPTS {
        match backend.complete(system_prompt, user_prompt, images).await {
            Ok(raw) => match extract_json(&raw).and_then(|text| serde_json::from_str::<T>(&text).ok()) {
                Some(parsed) => return Some(parsed),
                None => {}
            },
            Err(err) if !err.retryable => return None,
            Err(_) => {}
        }

        if attempt + 1 < MAX_ATTEMPTS {
            sleep(jittered_backoff(attempt)).await;
        }
    }
    None
}

/// Models routinely wrap JSON in prose or fenced code blocks; pull out the first top-level
/// object or array before attempting to parse.
fn extract_json(raw: &str) -> Option<String> {
    let start = raw.find(|c| c == '{' || c == '[')?;
    let end = raw.rfind(|c| c == '}' || c == ']')?;
    if end < start {
        return None;
    }
    Some(raw[start..=end].to_string())
}

fn jittered_backoff(attempt: u32) -> Duration {
    let base_ms = 300u64 * 2u64.pow(attempt);
    let jitter_ms = rand::thread_rng().gen_range(0..=150u64);
    Duration::from_millis(base_ms + jitter_ms)
}

pub async fn page_audit(
    backend: &dyn LlmBackend,
    request: &PageAuditRequest,
) -> PageAuditResponse {
    let system_prompt = "You audit a single web page screenshot for conversion-relevant visual \
        issues and return strict JSON matching the StructuredAuditOutput schema.";
    let user_prompt = format!(
        "url: {}\nmetadata: {}\nRespond with JSON only.",
        request.url, request.metadata
    );
    let mut images = vec![request.desktop_image_bytes.clone()];
    if let Some(mobile) = &request.mobile_image_bytes {
        images.push(mobile.clone());
    }

    match call_with_retry::<PageAuditResponse>(backend, system_prompt, &user_prompt, &images).await
    {
        Some(response) => response,
        None => fallback::page_audit(&request.url),
    }
}

pub async fn quick_diff(backend: &dyn LlmBackend, request: &QuickDiffRequest) -> QuickDiffResponse {
    let system_prompt = "You compare a baseline and a current screenshot pair and decide whether \
        any of the candidate in-flight changes are visually present. Return strict JSON matching \
        the QuickDiffResponse schema, proposing matched_change_id only from the literal candidate \
        ids supplied.";
    let candidate_ids: Vec<&str> = request
        .candidates
        .iter()
        .map(|candidate| candidate.change_id.as_str())
        .collect();
    let user_prompt = format!("candidate_change_ids: {candidate_ids:?}\nRespond with JSON only.");
    let mut images = vec![
        request.baseline_desktop.clone(),
        request.current_desktop.clone(),
    ];
    if let Some(baseline_mobile) = &request.baseline_mobile {
        images.push(baseline_mobile.clone());
    }
    if let Some(current_mobile) = &request.current_mobile {
        images.push(current_mobile.clone());
    }

    match call_with_retry::<QuickDiffResponse>(backend, system_prompt, &user_prompt, &images).await
    {
        Some(response) => response,
        None => fallback::quick_diff(),
    }
}

pub async fn post_analysis(
    backend: &dyn LlmBackend,
    request: &PostAnalysisRequest,
) -> PostAnalysisResponse {
    let system_prompt = "You correlate a fresh page audit against the previous audit, any recent \
        deploy, and in-flight watched changes, proposing matches only against the literal \
        candidate ids supplied and returning strict JSON matching the PostAnalysisResponse schema.";
    let user_prompt = serde_json::to_string(&json!({
        "current_findings": request.current_findings,
        "previous_findings": request.previous_findings,
        "deploy_context": request.deploy_context,
        "user_feedback": request.user_feedback,
        "pending_watching_change_ids": request
            .pending_watching_changes
            .iter()
            .map(|candidate| candidate.change_id.clone())
            .collect::<Vec<_>>(),
        "checkpoint_timelines": request.checkpoint_timelines,
        "page_focus": request.page_focus,
        "hypotheses": request.hypotheses,
    }))
    .unwrap_or_default();

    match call_with_retry::<PostAnalysisResponse>(backend, system_prompt, &user_prompt, &[]).await
    {
        Some(response) => response,
        None => fallback::post_analysis(&request.current_findings),
    }
}

pub async fn checkpoint_assessment(
    backend: &dyn LlmBackend,
    request: &CheckpointAssessmentRequest,
) -> CheckpointAssessmentResponse {
    let system_prompt = "You assess whether a tracked page change should be judged improved, \
        regressed, neutral, or inconclusive at a fixed day horizon, given the metric deltas and \
        prior checkpoints. Return strict JSON matching the CheckpointAssessmentResponse schema.";
    let user_prompt = serde_json::to_string(&json!({
        "change_element": request.change_element,
        "horizon_days": request.horizon_days,
        "metrics": request.metrics,
        "prior_checkpoints": request
            .prior_checkpoints
            .iter()
            .map(|c| json!({
                "horizon_days": c.horizon_days,
                "assessment": c.assessment,
                "reasoning": c.reasoning,
            }))
            .collect::<Vec<_>>(),
        "hypothesis": request.hypothesis,
        "page_focus": request.page_focus,
        "prior_feedback": request.prior_feedback,
    }))
    .unwrap_or_default();

    match call_with_retry::<CheckpointAssessmentResponse>(backend, system_prompt, &user_prompt, &[])
        .await
    {
        Some(response) => response,
        None => fallback::checkpoint_assessment(&request.metrics),
    }
}

pub async fn strategy_narrative(
    backend: &dyn LlmBackend,
    request: &StrategyNarrativeRequest,
) -> StrategyNarrativeResponse {
    let system_prompt = "You write a short running narrative describing the cumulative effect of \
        a page's tracked changes over time. Return strict JSON matching the \
        StrategyNarrativeResponse schema.";
    let user_prompt = serde_json::to_string(&json!({
        "url": request.url,
        "focus": request.focus,
        "timeline": request.timeline,
        "running_summary": request.running_summary,
        "hypotheses": request.hypotheses,
    }))
    .unwrap_or_default();

    match call_with_retry::<StrategyNarrativeResponse>(backend, system_prompt, &user_prompt, &[])
        .await
    {
        Some(response) => response,
        None => fallback::strategy_narrative(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBackend {
        responses: Vec<ToolResult<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmBackend for FakeBackend {
        async fn complete(&self, _system: &str, _user: &str, _images: &[Vec<u8>]) -> ToolResult<String> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(index)
                .cloned()
                .unwrap_or_else(|| Err(ToolError::provider("exhausted fake responses", false)))
        }
    }

    #[test]
    fn extract_json_strips_fenced_prose() {
        let raw = "Sure, here you go:\n```json\n{\"a\":1}\n```\nThanks!";
        assert_eq!(extract_json(raw).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn extract_json_returns_none_without_braces() {
        assert!(extract_json("no json here").is_none());
    }

    #[tokio::test]
    async fn page_audit_falls_back_after_exhausting_retries() {
        let backend = FakeBackend {
            responses: vec![
                Err(ToolError::provider("down", true)),
                Err(ToolError::provider("down", true)),
                Err(ToolError::provider("down", true)),
            ],
            calls: AtomicUsize::new(0),
        };
        let request = PageAuditRequest {
            url: "https://example.test/pricing".to_string(),
            desktop_image_bytes: vec![1, 2, 3],
            mobile_image_bytes: None,
            metadata: json!({}),
        };
        let response = page_audit(&backend, &request).await;
        assert_eq!(response.structured.verdict, "needs_review");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn page_audit_stops_retrying_on_non_retryable_error() {
        let backend = FakeBackend {
            responses: vec![Err(ToolError::validation("malformed request"))],
            calls: AtomicUsize::new(0),
        };
        let request = PageAuditRequest {
            url: "https://example.test/pricing".to_string(),
            desktop_image_bytes: vec![1],
            mobile_image_bytes: None,
            metadata: json!({}),
        };
        let _ = page_audit(&backend, &request).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn quick_diff_parses_successful_response_without_retry() {
        let backend = FakeBackend {
            responses: vec![Ok(
                "{\"has_changes\": true, \"changes\": []}".to_string()
            )],
            calls: AtomicUsize::new(0),
        };
        let request = QuickDiffRequest {
            baseline_desktop: vec![1],
            current_desktop: vec![2],
            baseline_mobile: None,
            current_mobile: None,
            candidates: Vec::new(),
        };
        let response = quick_diff(&backend, &request).await;
        assert!(response.has_changes);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
