use super::{http_client, AnalyticsProvider, MetricWindowRow};
use crate::contracts::{ToolError, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

const REQUEST_TIMEOUT_SECS: u64 = 15;

/// # NDOC
/// component: `subsystems::change_tracking::providers::posthog`
/// purpose: Adapter over the PostHog trends/insights API, grounded in the source repo's
///   `reqwest`-based JSON API clients (`llm_client.rs`, `tools::google_ads_adapter`).
pub struct PostHogProvider {
    api_key: String,
    project_id: String,
    host: String,
}

impl PostHogProvider {
    pub fn new(api_key: String, project_id: String, host: String) -> Self {
        Self {
            api_key,
            project_id,
            host,
        }
    }

    fn trend_url(&self) -> String {
        format!("{}/api/projects/{}/insights/trend", self.host, self.project_id)
    }

    async fn total_for_window(
        &self,
        client: &reqwest::Client,
        url: &str,
        metric: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> ToolResult<f64> {
        let body = json!({
            "events": [{ "id": metric, "type": "events" }],
            "properties": [{ "key": "$current_url", "value": url }],
            "date_from": window.0.to_rfc3339(),
            "date_to": window.1.to_rfc3339(),
        });

        let response = client
            .post(self.trend_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ToolError::provider(format!("posthog request failed: {err}"), true))?;

        if !response.status().is_success() {
            let retryable = response.status().is_server_error();
            return Err(ToolError::provider(
                format!("posthog responded with status {}", response.status()),
                retryable,
            ));
        }

        let parsed: PostHogTrendResponse = response
            .json()
            .await
            .map_err(|err| ToolError::provider(format!("posthog response malformed: {err}"), false))?;

        Ok(parsed.result.into_iter().flat_map(|point| point.data).sum())
    }
}

#[derive(Debug, Deserialize)]
struct PostHogTrendPoint {
    #[allow(dead_code)]
    label: Option<String>,
    data: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct PostHogTrendResponse {
    result: Vec<PostHogTrendPoint>,
}

#[async_trait]
impl AnalyticsProvider for PostHogProvider {
    fn label(&self) -> &'static str {
        "posthog"
    }

    async fn metrics_for_window(
        &self,
        url: &str,
        metric: &str,
        before_window: (DateTime<Utc>, DateTime<Utc>),
        after_window: (DateTime<Utc>, DateTime<Utc>),
    ) -> ToolResult<Vec<MetricWindowRow>> {
        let client = http_client(REQUEST_TIMEOUT_SECS)?;
        let before = self
            .total_for_window(&client, url, metric, before_window)
            .await?;
        let after = self
            .total_for_window(&client, url, metric, after_window)
            .await?;

        let change_percent = if before.abs() < f64::EPSILON {
            if after.abs() < f64::EPSILON {
                0.0
            } else {
                100.0
            }
        } else {
            ((after - before) / before) * 100.0
        };

        Ok(vec![MetricWindowRow {
            name: super::friendly_metric_name(metric),
            before,
            after,
            change_percent,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_url_is_scoped_to_project() {
        let provider = PostHogProvider::new(
            "key".to_string(),
            "proj_1".to_string(),
            "https://posthog.example.test".to_string(),
        );
        assert_eq!(
            provider.trend_url(),
            "https://posthog.example.test/api/projects/proj_1/insights/trend"
        );
    }
}
