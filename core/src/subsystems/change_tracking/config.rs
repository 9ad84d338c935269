use crate::contracts::{ToolError, ToolResult};
use std::env;

/// # NDOC
/// component: `subsystems::change_tracking::config`
/// purpose: Single source of truth for the engine's runtime knobs, generalized from the source
///   repo's `.env`-driven settings (`llm_client`/`email_sender_tool` used to read `env::var`
///   directly; every env read is centralized here instead, loaded once at startup). Missing
///   required settings surface as `ToolErrorKind::ConfigurationError` at load time, never as a
///   panic mid-run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_max_attempts: u32,
    pub llm_backoff_base_ms: u64,
    /// Acceptance floor for `DetectedChange::match_confidence` below which an LLM-proposed match
    /// to an existing change is treated as a new change instead (spec.md §9 Open Question: "what
    /// `match_confidence` should gate acceptance of a proposed match"). Exposed as a config knob,
    /// not baked into `fingerprint`, so an operator can tighten or loosen it without a code change.
    pub match_confidence_threshold: f64,
    pub daily_scan_cron: String,
    pub weekly_scan_cron: String,
    pub digest_cron: String,
    pub checkpoint_cron: String,
    pub health_probe_cron: String,
}

const DEFAULT_LLM_MODEL: &str = "gpt-4o";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
const DEFAULT_MATCH_CONFIDENCE_THRESHOLD: f64 = 0.6;

const DEFAULT_DAILY_SCAN_CRON: &str = "0 9 * * *";
const DEFAULT_WEEKLY_SCAN_CRON: &str = "0 9 * * 1";
const DEFAULT_DIGEST_CRON: &str = "0 11 * * *";
const DEFAULT_CHECKPOINT_CRON: &str = "30 10 * * *";
const DEFAULT_HEALTH_PROBE_CRON: &str = "*/30 * * * *";

impl EngineConfig {
    /// Loads `.env` (if present, via `dotenv`, matching the source repo's startup sequence) then
    /// reads every setting from the process environment. Required settings with no default raise
    /// a `ConfigurationError` naming the missing variable; everything else falls back to the
    /// documented default above.
    pub fn from_env() -> ToolResult<Self> {
        let _ = dotenv::dotenv();

        Ok(Self {
            smtp_host: require_env("CHANGE_ENGINE_SMTP_HOST")?,
            smtp_port: optional_env("CHANGE_ENGINE_SMTP_PORT")
                .map(|raw| parse_u16(&raw))
                .transpose()?
                .unwrap_or(587),
            smtp_username: require_env("CHANGE_ENGINE_SMTP_USERNAME")?,
            smtp_password: require_env("CHANGE_ENGINE_SMTP_PASSWORD")?,
            llm_api_key: require_env("CHANGE_ENGINE_LLM_API_KEY")?,
            llm_model: optional_env("CHANGE_ENGINE_LLM_MODEL")
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            llm_max_attempts: optional_env("CHANGE_ENGINE_LLM_MAX_ATTEMPTS")
                .map(|raw| parse_u32(&raw))
                .transpose()?
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            llm_backoff_base_ms: optional_env("CHANGE_ENGINE_LLM_BACKOFF_BASE_MS")
                .map(|raw| parse_u64(&raw))
                .transpose()?
                .unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            match_confidence_threshold: optional_env("CHANGE_ENGINE_MATCH_CONFIDENCE_THRESHOLD")
                .map(|raw| parse_f64(&raw))
                .transpose()?
                .unwrap_or(DEFAULT_MATCH_CONFIDENCE_THRESHOLD),
            daily_scan_cron: optional_env("CHANGE_ENGINE_DAILY_SCAN_CRON")
                .unwrap_or_else(|| DEFAULT_DAILY_SCAN_CRON.to_string()),
            weekly_scan_cron: optional_env("CHANGE_ENGINE_WEEKLY_SCAN_CRON")
                .unwrap_or_else(|| DEFAULT_WEEKLY_SCAN_CRON.to_string()),
            digest_cron: optional_env("CHANGE_ENGINE_DIGEST_CRON")
                .unwrap_or_else(|| DEFAULT_DIGEST_CRON.to_string()),
            checkpoint_cron: optional_env("CHANGE_ENGINE_CHECKPOINT_CRON")
                .unwrap_or_else(|| DEFAULT_CHECKPOINT_CRON.to_string()),
            health_probe_cron: optional_env("CHANGE_ENGINE_HEALTH_PROBE_CRON")
                .unwrap_or_else(|| DEFAULT_HEALTH_PROBE_CRON.to_string()),
        })
    }

    /// A config with fixed test credentials and the documented defaults, for CLI dry-runs and
    /// unit tests that need an `EngineConfig` but never actually dial SMTP or an LLM provider.
    pub fn for_testing() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: 1025,
            smtp_username: "test@example.test".to_string(),
            smtp_password: "test".to_string(),
            llm_api_key: "test-key".to_string(),
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            llm_max_attempts: DEFAULT_MAX_ATTEMPTS,
            llm_backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            match_confidence_threshold: DEFAULT_MATCH_CONFIDENCE_THRESHOLD,
            daily_scan_cron: DEFAULT_DAILY_SCAN_CRON.to_string(),
            weekly_scan_cron: DEFAULT_WEEKLY_SCAN_CRON.to_string(),
            digest_cron: DEFAULT_DIGEST_CRON.to_string(),
            checkpoint_cron: DEFAULT_CHECKPOINT_CRON.to_string(),
            health_probe_cron: DEFAULT_HEALTH_PROBE_CRON.to_string(),
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn require_env(key: &str) -> ToolResult<String> {
    optional_env(key)
        .ok_or_else(|| ToolError::configuration(format!("missing required env var {key}")))
}

fn parse_u16(raw: &str) -> ToolResult<u16> {
    raw.parse()
        .map_err(|_| ToolError::configuration(format!("expected a u16, got {raw:?}")))
}

fn parse_u32(raw: &str) -> ToolResult<u32> {
    raw.parse()
        .map_err(|_| ToolError::configuration(format!("expected a u32, got {raw:?}")))
}

fn parse_u64(raw: &str) -> ToolResult<u64> {
    raw.parse()
        .map_err(|_| ToolError::configuration(format!("expected a u64, got {raw:?}")))
}

fn parse_f64(raw: &str) -> ToolResult<f64> {
    raw.parse()
        .map_err(|_| ToolError::configuration(format!("expected a f64, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_testing_config_carries_documented_defaults() {
        let config = EngineConfig::for_testing();
        assert_eq!(config.llm_max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(
            config.match_confidence_threshold,
            DEFAULT_MATCH_CONFIDENCE_THRESHOLD
        );
        assert_eq!(config.daily_scan_cron, "0 9 * * *");
        assert_eq!(config.weekly_scan_cron, "0 9 * * 1");
        assert_eq!(config.digest_cron, "0 11 * * *");
        assert_eq!(config.checkpoint_cron, "30 10 * * *");
    }

    #[test]
    fn parse_helpers_reject_garbage() {
        assert!(parse_u16("not-a-number").is_err());
        assert!(parse_f64("not-a-number").is_err());
        assert!(parse_u16("587").is_ok());
    }
}
