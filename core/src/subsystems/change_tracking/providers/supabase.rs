use super::{http_client, AnalyticsProvider, MetricWindowRow};
use crate::contracts::{ToolError, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

const REQUEST_TIMEOUT_SECS: u64 = 15;

/// # NDOC
/// component: `subsystems::change_tracking::providers::supabase`
/// purpose: Optional owned-database metrics adapter (spec.md §4.5 step 3), for users who run
///   their own event table rather than a third-party analytics vendor. Queries a PostgREST-style
///   endpoint derived from the connection string.
pub struct SupabaseProvider {
    connection_string: String,
}

impl SupabaseProvider {
    pub fn new(connection_string: String) -> Self {
        Self { connection_string }
    }

    fn rest_endpoint(&self) -> String {
        format!("{}/rest/v1/page_metrics", self.connection_string.trim_end_matches('/'))
    }

    async fn total_for_window(
        &self,
        client: &reqwest::Client,
        url: &str,
        metric: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> ToolResult<f64> {
        let response = client
            .get(self.rest_endpoint())
            .query(&[
                ("url", url),
                ("metric", metric),
                ("gte.occurred_at", &window.0.to_rfc3339()),
                ("lt.occurred_at", &window.1.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(|err| ToolError::provider(format!("supabase request failed: {err}"), true))?;

        if !response.status().is_success() {
            let retryable = response.status().is_server_error();
            return Err(ToolError::provider(
                format!("supabase responded with status {}", response.status()),
                retryable,
            ));
        }

        let rows: Vec<SupabaseMetricRow> = response
            .json()
            .await
            .map_err(|err| ToolError::provider(format!("supabase response malformed: {err}"), false))?;

        Ok(rows.into_iter().map(|row| row.value).sum())
    }
}

#[derive(Debug, Deserialize)]
struct SupabaseMetricRow {
    value: f64,
}

#[async_trait]
impl AnalyticsProvider for SupabaseProvider {
    fn label(&self) -> &'static str {
        "supabase"
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
    fn rest_endpoint_strips_trailing_slash() {
        let provider = SupabaseProvider::new("https://proj.supabase.co/".to_string());
        assert_eq!(
            provider.rest_endpoint(),
            "https://proj.supabase.co/rest/v1/page_metrics"
        );
    }
}
