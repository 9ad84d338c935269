use change_watch_core::contracts::{ToolError, ToolResult};
use change_watch_core::subsystems::change_tracking::checkpoint_engine::{
    run_batch_for_page, CheckpointEngineDeps,
};
use change_watch_core::subsystems::change_tracking::config::EngineConfig;
use change_watch_core::subsystems::change_tracking::deploy::{run_deploy_scan, DEPLOY_SETTLE_SECS};
use change_watch_core::subsystems::change_tracking::events::InMemoryEventPublisher;
use change_watch_core::subsystems::change_tracking::llm::LlmBackend;
use change_watch_core::subsystems::change_tracking::notifications::{
    NotificationBatch, NotificationDispatcher, SmtpNotificationDispatcher,
};
use change_watch_core::subsystems::change_tracking::orchestrator::OrchestratorDeps;
use change_watch_core::subsystems::change_tracking::providers::{init_provider, ProviderCredentials};
use change_watch_core::subsystems::change_tracking::scheduler::{run_daily_scan, run_digest, run_weekly_scan};
use change_watch_core::subsystems::change_tracking::store::*;
use change_watch_core::subsystems::change_tracking::{
    new_id, ActorType, ChangeScope, ChangeStatus, Deploy, DeployStatus, DetectedChange,
    LifecycleEvent, Page, ScanFrequency, SubscriptionTier, UserAccount,
};
use change_watch_core::tools::screenshot_tool::PlaywrightRunner;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};

/// # NDOC
/// component: `cli`
/// purpose: Operational entry point for the page-change observation engine, generalized from the
///   source repo's `rbn_cli` persona command dispatch into the cron-facing job runner named by
///   spec.md §1/§6: `run-daily-scan`, `run-weekly-scan`, `run-digest`, `run-checkpoints`. Each
///   invocation is a standalone process against a fresh `InMemoryStores`, seeded with one demo
///   page (and, for `run-checkpoints`, one aged demo change) so the wiring is exercisable without
///   a real queue or relational store in front of it — both out of scope per spec.md §1.
#[derive(Parser)]
#[command(name = "change-watch", about = "Run one scheduled job of the page-change observation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan every daily-frequency page, per the `0 9 * * *` cron expression (spec.md §6).
    RunDailyScan(ScanArgs),
    /// Scan every weekly-frequency page; a no-op off Monday (spec.md §4.8).
    RunWeeklyScan(ScanArgs),
    /// Send the consolidated per-user digest for the last three hours (spec.md §4.8).
    RunDigest(ScanArgs),
    /// Evaluate every due correlation checkpoint horizon (spec.md §4.5).
    RunCheckpoints(ScanArgs),
    /// Run the cheap deploy-triggered scan for a synthetic `deploy/detected` event (spec.md §4.3).
    RunDeployScan(ScanArgs),
}

#[derive(Args)]
struct ScanArgs {
    #[arg(long, default_value = "https://example.test/pricing")]
    url: String,
    #[arg(long, default_value = "demo_user")]
    user_id: String,
}

/// Demo-only `LlmBackend`: always a non-retryable provider failure, so every call site exercises
/// the documented deterministic-fallback path (spec.md §4.6) instead of dialing out with a
/// placeholder API key. A real deployment supplies a `GeminiBackend` built from `EngineConfig`.
struct NoOpLlmBackend;

#[async_trait]
impl LlmBackend for NoOpLlmBackend {
    async fn complete(&self, _system_prompt: &str, _user_prompt: &str, _images: &[Vec<u8>]) -> ToolResult<String> {
        Err(ToolError::provider("cli runs without a configured LLM backend", false))
    }
}

/// Demo-only `PlaywrightRunner`: returns a fixed 1x1 PNG instead of driving a real browser. Real
/// screenshot capture is an out-of-scope collaborator (spec.md §1 Non-goals); this stands in for
/// it the same way `screenshot_tool::MockPlaywrightRunner` does in tests, just usable outside
/// `#[cfg(test)]` so the job subcommands have something to run against.
struct NoOpScreenshotRunner;

const DEMO_PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

#[async_trait]
impl PlaywrightRunner for NoOpScreenshotRunner {
    async fn take_screenshot_from_url(
        &self,
        _url: &str,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(DEMO_PNG_BYTES.to_vec())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli.command).await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> ToolResult<()> {
    let config = EngineConfig::for_testing();
    let llm_backend = NoOpLlmBackend;

    match command {
        Command::RunDailyScan(args) => {
            let stores = InMemoryStores::new();
            let page = seed_demo_page(&stores, &args, ScanFrequency::Daily)?;
            seed_demo_account(&stores, &args)?;
            let deps = build_orchestrator_deps(&stores, &llm_backend, &config);
            let publisher = InMemoryEventPublisher::new();
            let report = run_daily_scan(&deps, &publisher, Utc::now()).await?;
            print_report("run-daily-scan", &page, &report, publisher.drain().len());
        }
        Command::RunWeeklyScan(args) => {
            let stores = InMemoryStores::new();
            let page = seed_demo_page(&stores, &args, ScanFrequency::Weekly)?;
            seed_demo_account(&stores, &args)?;
            let deps = build_orchestrator_deps(&stores, &llm_backend, &config);
            let publisher = InMemoryEventPublisher::new();
            let report = run_weekly_scan(&deps, &publisher, Utc::now()).await?;
            print_report("run-weekly-scan", &page, &report, publisher.drain().len());
        }
        Command::RunDigest(args) => {
            let stores = InMemoryStores::new();
            seed_demo_page(&stores, &args, ScanFrequency::Daily)?;
            seed_demo_account(&stores, &args)?;
            let deps = build_orchestrator_deps(&stores, &llm_backend, &config);
            let dispatcher = build_dispatcher(&config);
            let sent = run_digest(&deps, &dispatcher, |_user_id| None, Utc::now()).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "job": "run-digest",
                    "emails_sent": sent,
                }))?
            );
        }
        Command::RunCheckpoints(args) => {
            let stores = InMemoryStores::new();
            let page = seed_demo_page(&stores, &args, ScanFrequency::Daily)?;
            seed_aged_demo_change(&stores, &page)?;

            let checkpoint_deps = CheckpointEngineDeps {
                changes: &stores,
                checkpoints: &stores,
                lifecycle_events: &stores,
                feedback: &stores,
            };
            let provider = init_provider(&ProviderCredentials::None);
            let mut notifications = NotificationBatch::new();
            let rows = run_batch_for_page(
                &checkpoint_deps,
                provider.as_ref(),
                &llm_backend,
                &page,
                Utc::now(),
                &mut notifications,
            )
            .await?;

            let dispatcher = build_dispatcher(&config);
            let sent = notifications.dispatch(&dispatcher, |_user_id| None)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "job": "run-checkpoints",
                    "page_id": page.id,
                    "checkpoint_rows_inserted": rows.len(),
                    "notifications_sent": sent,
                }))?
            );
        }
        Command::RunDeployScan(args) => {
            let stores = InMemoryStores::new();
            let page = seed_demo_page(&stores, &args, ScanFrequency::Manual)?;
            seed_demo_account(&stores, &args)?;
            let deps = build_orchestrator_deps(&stores, &llm_backend, &config);
            let dispatcher = build_dispatcher(&config);

            let changed_file = format!(
                "{}.html",
                page.url.rsplit('/').next().unwrap_or("index")
            );
            let deploy = stores.create(Deploy {
                id: new_id("dep"),
                repo_id: "demo_repo".to_string(),
                user_id: args.user_id.clone(),
                commit_sha: "deadbeef".to_string(),
                full_name: "demo/marketing-site".to_string(),
                status: DeployStatus::Pending,
                changed_files: vec![changed_file],
                created_at: Utc::now(),
            })?;
            let deploy_id = deploy.id.clone();

            let report = run_deploy_scan(
                &deps,
                &stores,
                &dispatcher,
                |_user_id| None,
                deploy,
                |url, changed_files| {
                    changed_files
                        .iter()
                        .any(|f| url.contains(f.trim_end_matches(".html")))
                },
                DEPLOY_SETTLE_SECS,
                Utc::now(),
            )
            .await?;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "job": "run-deploy-scan",
                    "deploy_id": deploy_id,
                    "pages_scanned": report.pages_scanned,
                    "new_changes": report.new_changes,
                    "emailed": report.emailed,
                }))?
            );
        }
    }

    Ok(())
}

fn print_report(
    job: &str,
    page: &Page,
    report: &change_watch_core::subsystems::change_tracking::scheduler::ScanReport,
    published_events: usize,
) {
    println!(
        "{}",
        serde_json::json!({
            "job": job,
            "page_id": page.id,
            "pages_considered": report.pages_considered,
            "analyses_triggered": report.analyses_triggered,
            "skipped_already_run_today": report.skipped_already_run_today,
            "failed": report.failed,
            "published_events": published_events,
        })
    );
}

fn seed_demo_page(stores: &InMemoryStores, args: &ScanArgs, scan_frequency: ScanFrequency) -> ToolResult<Page> {
    stores.upsert(Page {
        id: new_id("page"),
        user_id: args.user_id.clone(),
        url: args.url.clone(),
        scan_frequency,
        stable_baseline_id: None,
        last_scan_id: None,
        metric_focus: None,
    })
}

/// Seeds a `pro` demo account owning the seeded page, so `check-tier` allows mobile capture
/// without requiring real billing state in front of this standalone process.
fn seed_demo_account(stores: &InMemoryStores, args: &ScanArgs) -> ToolResult<()> {
    stores.upsert(UserAccount {
        user_id: args.user_id.clone(),
        tier: SubscriptionTier::Pro,
        trial_ends_at: None,
    })?;
    Ok(())
}

/// Seeds one `watching` change detected 95 days ago, so every horizon in `clock::HORIZONS_DAYS`
/// is immediately due and `run-checkpoints` has something to evaluate.
fn seed_aged_demo_change(stores: &InMemoryStores, page: &Page) -> ToolResult<()> {
    let now = Utc::now();
    let detected_at = now - Duration::days(95);
    let change = stores.create(DetectedChange {
        id: new_id("chg"),
        page_id: page.id.clone(),
        user_id: page.user_id.clone(),
        element: "hero-cta".to_string(),
        scope: ChangeScope::Element,
        before_value: "Sign up".to_string(),
        after_value: "Start free trial".to_string(),
        description: Some("CTA copy changed".to_string()),
        status: ChangeStatus::Watching,
        first_detected_at: detected_at,
        first_detected_analysis_id: new_id("an"),
        hypothesis: None,
        correlation_metrics: None,
        correlation_unlocked_at: None,
        observation_text: None,
        match_confidence: None,
        match_rationale: None,
    })?;
    stores.append(LifecycleEvent {
        id: new_id("evt"),
        change_id: change.id,
        from_status: None,
        to_status: ChangeStatus::Watching,
        reason: "seeded for run-checkpoints demo".to_string(),
        actor_type: ActorType::System,
        checkpoint_id: None,
        created_at: detected_at,
    })?;
    Ok(())
}

fn build_orchestrator_deps<'a>(
    stores: &'a InMemoryStores,
    llm_backend: &'a dyn LlmBackend,
    config: &EngineConfig,
) -> OrchestratorDeps<'a> {
    static RUNNER: NoOpScreenshotRunner = NoOpScreenshotRunner;
    OrchestratorDeps {
        pages: stores,
        analyses: stores,
        changes: stores,
        lifecycle_events: stores,
        suggestions: stores,
        accounts: stores,
        screenshots: &RUNNER as &dyn PlaywrightRunner,
        screenshot_store: stores,
        llm_backend,
        match_confidence_threshold: config.match_confidence_threshold,
    }
}

fn build_dispatcher(config: &EngineConfig) -> impl NotificationDispatcher {
    SmtpNotificationDispatcher::new(
        config.smtp_host.clone(),
        config.smtp_port,
        config.smtp_username.clone(),
        config.smtp_password.clone(),
    )
}
