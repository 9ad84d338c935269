use super::{AnalyticsProvider, MetricWindowRow};
use crate::contracts::ToolResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// # NDOC
/// component: `subsystems::change_tracking::providers::none`
/// purpose: Fallback adapter used after provider-init failure (bad decrypt, expired token).
/// invariants:
///   - Never errors; always returns an empty metric set so the checkpoint engine degrades to
///     an `inconclusive` assessment instead of aborting the batch (spec.md §4.5, §7).
pub struct NoneProvider;

#[async_trait]
impl AnalyticsProvider for NoneProvider {
    fn label(&self) -> &'static str {
        "none"
    }

    async fn metrics_for_window(
        &self,
        _url: &str,
        _metric: &str,
        _before_window: (DateTime<Utc>, DateTime<Utc>),
        _after_window: (DateTime<Utc>, DateTime<Utc>),
    ) -> ToolResult<Vec<MetricWindowRow>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn none_provider_returns_empty_metrics() {
        let provider = NoneProvider;
        let now = Utc::now();
        let rows = provider
            .metrics_for_window("https://example.test", "conversion_rate", (now, now), (now, now))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
