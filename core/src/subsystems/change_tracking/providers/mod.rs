use crate::contracts::{ToolError, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod ga4;
pub mod none;
pub mod posthog;
pub mod supabase;

/// # NDOC
/// component: `subsystems::change_tracking::providers`
/// purpose: One metric row returned by an analytics adapter for a before/after window pair,
///   per spec.md §6 "Analytics provider contract".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricWindowRow {
    pub name: String,
    pub before: f64,
    pub after: f64,
    pub change_percent: f64,
}

/// # NDOC
/// component: `subsystems::change_tracking::providers`
/// purpose: Uniform adapter surface over PostHog / GA4 / the owned-database connector
///   (spec.md §2, §9 "Dynamic credential shapes across providers").
/// invariants:
///   - `label()` is recorded on every checkpoint row that used this provider; a failed init is
///     never recorded as a successful provider (spec.md §4.6).
#[async_trait]
pub trait AnalyticsProvider: Send + Sync {
    fn label(&self) -> &'static str;

    /// `before_window`/`after_window` are the `[changeDate-h, changeDate)` /
    /// `(changeDate, changeDate+h]` pair computed by `clock::horizon_windows`; the adapter is
    /// responsible for returning one row per metric with both period totals and the derived
    /// `change_percent`, so the checkpoint engine never has to reconcile two separate calls.
    async fn metrics_for_window(
        &self,
        url: &str,
        metric: &str,
        before_window: (DateTime<Utc>, DateTime<Utc>),
        after_window: (DateTime<Utc>, DateTime<Utc>),
    ) -> ToolResult<Vec<MetricWindowRow>>;
}

/// # NDOC
/// component: `subsystems::change_tracking::providers`
/// purpose: Discriminated union over the credential shapes each provider variant requires
///   (spec.md §9). This is the decrypted form; the caller is responsible for decryption and
///   for catching decrypt/expiry failures before constructing one of these.
#[derive(Debug, Clone)]
pub enum ProviderCredentials {
    PostHog {
        api_key: String,
        project_id: String,
        host: String,
    },
    Ga4 {
        property_id: String,
        access_token: String,
    },
    Supabase {
        connection_string: String,
    },
    None,
}

/// # NDOC
/// component: `subsystems::change_tracking::providers`
/// purpose: Construct the adapter matching a credential variant. Never fails: a malformed or
///   absent credential set downgrades to the `none` provider rather than erroring the caller,
///   matching the "provider init failure" policy in spec.md §4.5/§7.
pub fn init_provider(credentials: &ProviderCredentials) -> Box<dyn AnalyticsProvider> {
    match credentials {
        ProviderCredentials::PostHog {
            api_key,
            project_id,
            host,
        } => Box::new(posthog::PostHogProvider::new(
            api_key.clone(),
            project_id.clone(),
            host.clone(),
        )),
        ProviderCredentials::Ga4 {
            property_id,
            access_token,
        } => Box::new(ga4::Ga4Provider::new(property_id.clone(), access_token.clone())),
        ProviderCredentials::Supabase { connection_string } => {
            Box::new(supabase::SupabaseProvider::new(connection_string.clone()))
        }
        ProviderCredentials::None => Box::new(none::NoneProvider),
    }
}

/// # NDOC
/// component: `subsystems::change_tracking::providers`
/// purpose: Shared friendly-name mapping for recognized metric names (spec.md §6); unknown
///   names pass through untransformed.
pub fn friendly_metric_name(raw_name: &str) -> String {
    metric_label_table()
        .get(raw_name)
        .cloned()
        .unwrap_or_else(|| raw_name.to_string())
}

fn metric_label_table() -> HashMap<&'static str, String> {
    [
        ("conversion_rate", "Conversion rate"),
        ("signup_rate", "Signup rate"),
        ("bounce_rate", "Bounce rate"),
        ("avg_session_duration", "Average session duration"),
        ("revenue_per_visitor", "Revenue per visitor"),
        ("checkout_completion_rate", "Checkout completion rate"),
        ("click_through_rate", "Click-through rate"),
        ("scroll_depth", "Scroll depth"),
        ("page_views", "Page views"),
        ("unique_visitors", "Unique visitors"),
    ]
    .into_iter()
    .map(|(k, v)| (k, v.to_string()))
    .collect()
}

pub fn http_client(timeout_secs: u64) -> ToolResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|err| ToolError::internal(format!("failed to build http client: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_provider_none_yields_none_label() {
        let provider = init_provider(&ProviderCredentials::None);
        assert_eq!(provider.label(), "none");
    }

    #[test]
    fn friendly_name_maps_known_metric() {
        assert_eq!(friendly_metric_name("conversion_rate"), "Conversion rate");
    }

    #[test]
    fn friendly_name_passes_through_unknown_metric() {
        assert_eq!(friendly_metric_name("widget_clicks_v2"), "widget_clicks_v2");
    }
}
