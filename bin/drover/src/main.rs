use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use common::{Config, TelegramConnector};
use pacing::PacingConfig;
use sessions::{LiveConnector, SessionManager};
use store::Store;
use vendors::{
    LlmService, Notifier, NullNotifier, OnlineSmsClient, OpenAiCompatClient, TelegramNotifier,
};
use workers::{
    run_loop, AudienceWorker, AuthWorker, CampaignWorker, ContentWorker, DailyResetWorker,
    FactoryWorker, HerderWorker, ReplyWorker, SchedulerWorker, WarmupChannels, WarmupWorker,
    Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(dry_run = cfg.dry_run, "Drover starting");

    // ── Database ──────────────────────────────────────────────────────────────
    let store = Store::connect(&cfg.database_url)
        .await
        .unwrap_or_else(|e| panic!("Failed to open database: {e}"));
    info!("Database ready");

    // ── Telegram connector (loopback in dry-run mode) ─────────────────────────
    let connector: Arc<dyn TelegramConnector> = if cfg.dry_run {
        info!("Dry-run mode — using loopback connector, nothing reaches Telegram");
        Arc::new(sim::SimConnector::new())
    } else {
        Arc::new(LiveConnector::new(
            cfg.telegram_api_id,
            cfg.telegram_api_hash.clone(),
            cfg.sessions_dir.clone(),
        ))
    };
    let sessions = Arc::new(SessionManager::new(connector, store.clone()));

    // ── External services ─────────────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = match &cfg.notifier_token {
        Some(token) => Arc::new(TelegramNotifier::new(token.clone())),
        None => Arc::new(NullNotifier),
    };
    let llm: Arc<dyn LlmService> = Arc::new(OpenAiCompatClient::new());

    // ── Workers ───────────────────────────────────────────────────────────────
    let interval = Duration::from_secs(cfg.tick_interval_secs);
    let pacing = PacingConfig::default();
    let warmup_channels = WarmupChannels::load(&cfg.warmup_channels_path);

    let mut fleet: Vec<Arc<dyn Worker>> = vec![
        Arc::new(CampaignWorker::new(
            store.clone(),
            sessions.clone(),
            notifier.clone(),
            llm.clone(),
            pacing.clone(),
        )),
        Arc::new(HerderWorker::new(
            store.clone(),
            sessions.clone(),
            notifier.clone(),
            llm.clone(),
        )),
        Arc::new(WarmupWorker::new(
            store.clone(),
            sessions.clone(),
            notifier.clone(),
            warmup_channels,
        )),
        Arc::new(AuthWorker::new(store.clone(), sessions.clone(), notifier.clone())),
        Arc::new(AudienceWorker::new(
            store.clone(),
            sessions.clone(),
            notifier.clone(),
        )),
        Arc::new(SchedulerWorker::new(store.clone(), notifier.clone())),
        Arc::new(ContentWorker::new(
            store.clone(),
            sessions.clone(),
            notifier.clone(),
            llm.clone(),
        )),
        Arc::new(ReplyWorker::new(store.clone(), notifier.clone())),
        Arc::new(DailyResetWorker::new(store.clone())),
    ];

    // The factory only runs with a configured SMS vendor.
    if let (Some(base_url), Some(api_key)) = (&cfg.sms_base_url, &cfg.sms_api_key) {
        let sms = Arc::new(OnlineSmsClient::new(base_url.clone(), api_key.clone()));
        fleet.push(Arc::new(FactoryWorker::new(
            store.clone(),
            sessions.clone(),
            notifier.clone(),
            sms,
        )));
    } else {
        info!("SMS vendor not configured — factory worker disabled");
    }

    // ── Spawn all loops ───────────────────────────────────────────────────────
    for worker in fleet {
        tokio::spawn(run_loop(worker, interval));
    }

    info!("All workers started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Closing sessions.");
    sessions.close_all().await;
    Ok(())
}
