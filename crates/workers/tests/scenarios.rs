//! End-to-end worker scenarios against the loopback connector and an
//! in-memory store.

use std::sync::Arc;

use chrono::Utc;

use common::{
    AccountRole, AccountStatus, AuthorizedUser, CampaignStatus, TenantSettings, TgError,
};
use pacing::PacingConfig;
use sessions::SessionManager;
use sim::{CallKind, SimConnector};
use store::Store;
use vendors::{NoLlm, RecordingNotifier};
use workers::{CampaignWorker, Worker};

const TENANT: i64 = 1;
const NOTIFY_CHAT: i64 = 10;

struct Harness {
    store: Store,
    sim: SimConnector,
    sessions: Arc<SessionManager>,
    notifier: Arc<RecordingNotifier>,
}

async fn harness() -> Harness {
    let store = Store::connect_in_memory().await.unwrap();
    store.ensure_tenant(TENANT).await.unwrap();
    let settings = TenantSettings {
        timezone: "UTC".to_string(),
        // Equal bounds disable quiet hours so tests run at any hour.
        quiet_hours_start: "00:00".to_string(),
        quiet_hours_end: "00:00".to_string(),
        notify_chat_id: Some(NOTIFY_CHAT),
        ..TenantSettings::default()
    };
    store.set_tenant_settings(TENANT, &settings).await.unwrap();

    let sim = SimConnector::new();
    let sessions = Arc::new(SessionManager::new(Arc::new(sim.clone()), store.clone()));
    Harness {
        store,
        sim,
        sessions,
        notifier: Arc::new(RecordingNotifier::new()),
    }
}

fn quiet_pacing() -> PacingConfig {
    PacingConfig {
        typing_min: 0,
        typing_max: 0,
        ..PacingConfig::default()
    }
}

impl Harness {
    fn campaign_worker(&self) -> CampaignWorker {
        CampaignWorker::new(
            self.store.clone(),
            self.sessions.clone(),
            self.notifier.clone(),
            Arc::new(NoLlm),
            quiet_pacing(),
        )
    }

    async fn account(&self, phone: &str, daily_limit: i64) -> i64 {
        self.store
            .insert_account(TENANT, phone, AccountStatus::Active, AccountRole::Observer, daily_limit)
            .await
            .unwrap()
    }

    /// Audience of `n` recipients with telegram ids 101..=100+n, plus a
    /// pending campaign over the given pool.
    async fn seeded_campaign(&self, recipients: i64, pool: &[i64]) -> (i64, i64) {
        let source = self
            .store
            .insert_audience_source(TENANT, "leads", recipients)
            .await
            .unwrap();
        for i in 0..recipients {
            self.store
                .insert_audience_member(source, 101 + i, None, Some("User"))
                .await
                .unwrap();
        }
        let template = self
            .store
            .insert_template(TENANT, "intro", "hello {name}", None)
            .await
            .unwrap();
        let campaign = self
            .store
            .insert_campaign(
                TENANT,
                source,
                template,
                pool,
                None,
                CampaignStatus::Pending,
                0,
                0,
                false,
            )
            .await
            .unwrap();
        (campaign, source)
    }
}

// ── Scenario 1: happy path ───────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_sends_all_recipients_in_order() {
    let h = harness().await;
    let a = h.account("+79000000001", 100).await;
    let (campaign, _) = h.seeded_campaign(3, &[a]).await;

    h.campaign_worker().tick().await.unwrap();

    let sends = h.sim.calls_of(CallKind::Send);
    let targets: Vec<&str> = sends.iter().map(|c| c.target.as_str()).collect();
    assert_eq!(targets, vec!["101", "102", "103"]);

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Completed);
    assert_eq!(c.sent_count, 3);
    assert_eq!(c.failed_count, 0);

    let acc = h.store.account(a).await.unwrap().unwrap();
    assert_eq!(acc.daily_sent, 3);

    assert_eq!(h.notifier.containing("started"), 1);
    assert_eq!(h.notifier.containing("completed"), 1);
}

// ── Scenario 2: flood wait mid-batch ─────────────────────────────────────────

#[tokio::test]
async fn flood_wait_rotates_to_another_account_and_retries_recipient() {
    let h = harness().await;
    let a = h.account("+79000000001", 100).await;
    let b = h.account("+79000000002", 100).await;
    let (campaign, _) = h.seeded_campaign(2, &[a, b]).await;

    h.sim.script_send_error(a, TgError::FloodWait { seconds: 60 });
    let before = Utc::now();

    h.campaign_worker().tick().await.unwrap();

    let acc_a = h.store.account(a).await.unwrap().unwrap();
    assert_eq!(acc_a.status, AccountStatus::FloodWait);
    let until = acc_a.flood_wait_until.unwrap();
    assert!((until - before).num_seconds() >= 59 && (until - before).num_seconds() <= 70);

    // Both recipients went through B.
    let sends = h.sim.calls_of(CallKind::Send);
    assert_eq!(sends.len(), 2);
    assert!(sends.iter().all(|c| c.account_id == b));
    assert_eq!(h.sim.sends_to("101"), 1);
    assert_eq!(h.sim.sends_to("102"), 1);

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Completed);
    assert_eq!(c.sent_count, 2);
    // Flood wait bumps the adaptive multiplier by 0.5.
    assert!((c.adaptive_multiplier - 1.4).abs() < 0.2);

    assert_eq!(h.notifier.containing("flood wait"), 1);
}

// ── Scenario 3: peer flood ───────────────────────────────────────────────────

#[tokio::test]
async fn peer_flood_pauses_campaign_and_leaves_recipient_unsent() {
    let h = harness().await;
    let a = h.account("+79000000001", 100).await;
    let (campaign, source) = h.seeded_campaign(3, &[a]).await;

    h.sim.script_send_error(a, TgError::PeerFlood);

    h.campaign_worker().tick().await.unwrap();

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Paused);
    assert!(c.pause_reason.as_deref().unwrap().contains("peer flood"));
    assert_eq!(c.sent_count, 0);
    // The offending recipient is deliberately left unsent for retry
    // after resume; failed_count stays untouched.
    assert_eq!(c.failed_count, 0);
    assert_eq!(h.store.unsent_remaining(source).await.unwrap(), 3);
    assert_eq!(h.sim.calls_of(CallKind::Send).len(), 0);
}

// ── Scenario 4: privacy restriction ──────────────────────────────────────────

#[tokio::test]
async fn privacy_restricted_recipient_is_terminal_without_sender_penalty() {
    let h = harness().await;
    let a = h.account("+79000000001", 100).await;
    let (campaign, source) = h.seeded_campaign(2, &[a]).await;

    h.sim.script_send_error(a, TgError::PrivacyRestricted);

    h.campaign_worker().tick().await.unwrap();

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Completed);
    assert_eq!(c.sent_count, 1);
    assert_eq!(c.failed_count, 1);
    assert_eq!(h.store.unsent_remaining(source).await.unwrap(), 0);

    // Only the second recipient actually received a message.
    assert_eq!(h.sim.sends_to("101"), 0);
    assert_eq!(h.sim.sends_to("102"), 1);

    let acc = h.store.account(a).await.unwrap().unwrap();
    assert!((acc.reliability_score - 100.0).abs() < 1e-9);
    assert_eq!(acc.consecutive_errors, 0);
}

// ── Scenario 5: panic stop ───────────────────────────────────────────────────

#[tokio::test]
async fn panic_flag_makes_running_campaigns_inert_until_cleared() {
    let h = harness().await;
    let a = h.account("+79000000001", 100).await;
    let (c1, _) = h.seeded_campaign(2, &[a]).await;
    let (c2, _) = h.seeded_campaign(2, &[a]).await;
    h.store.start_campaign(c1, 2).await.unwrap();
    h.store.start_campaign(c2, 2).await.unwrap();

    h.store.set_panic(TENANT, "manual stop", None).await.unwrap();
    h.campaign_worker().tick().await.unwrap();

    assert_eq!(h.sim.total_calls(), 0);
    for id in [c1, c2] {
        let c = h.store.campaign(id).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Running, "inert but still running");
        assert_eq!(c.sent_count, 0);
    }

    h.store.clear_panic(TENANT).await.unwrap();
    h.campaign_worker().tick().await.unwrap();
    assert_eq!(h.sim.calls_of(CallKind::Send).len(), 4);
}

// ── Idempotence ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn rerunning_a_completed_campaign_sends_nothing_more() {
    let h = harness().await;
    let a = h.account("+79000000001", 100).await;
    let (campaign, _) = h.seeded_campaign(3, &[a]).await;

    let worker = h.campaign_worker();
    worker.tick().await.unwrap();
    assert_eq!(h.sim.calls_of(CallKind::Send).len(), 3);

    worker.tick().await.unwrap();
    worker.tick().await.unwrap();
    assert_eq!(h.sim.calls_of(CallKind::Send).len(), 3);

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.sent_count, 3);
}

// ── Rate cap ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn daily_limit_is_never_exceeded_and_campaign_pauses_when_pool_dries() {
    let h = harness().await;
    let a = h.account("+79000000001", 2).await;
    let (campaign, source) = h.seeded_campaign(5, &[a]).await;

    h.campaign_worker().tick().await.unwrap();

    let acc = h.store.account(a).await.unwrap().unwrap();
    assert_eq!(acc.daily_sent, 2);

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Paused);
    assert_eq!(c.pause_reason.as_deref(), Some("no available accounts"));
    assert_eq!(c.sent_count, 2);
    assert_eq!(h.store.unsent_remaining(source).await.unwrap(), 3);
}

// ── Blacklisted recipients ───────────────────────────────────────────────────

#[tokio::test]
async fn user_blocked_auto_blacklists_recipient() {
    let h = harness().await;
    let a = h.account("+79000000001", 100).await;
    let (campaign, _) = h.seeded_campaign(1, &[a]).await;

    h.sim.script_send_error(a, TgError::UserBlocked);
    h.campaign_worker().tick().await.unwrap();

    assert!(h.store.is_blacklisted(TENANT, 101).await.unwrap());
    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.failed_count, 1);
    assert_eq!(c.status, CampaignStatus::Completed);
}

// ── Quiet hours ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn quiet_hours_defer_the_batch_but_keep_the_campaign_running() {
    let h = harness().await;
    // Cover the whole day except one minute: always quiet right now.
    let settings = TenantSettings {
        timezone: "UTC".to_string(),
        quiet_hours_start: "00:00".to_string(),
        quiet_hours_end: "23:59".to_string(),
        notify_chat_id: Some(NOTIFY_CHAT),
        ..TenantSettings::default()
    };
    h.store.set_tenant_settings(TENANT, &settings).await.unwrap();

    let a = h.account("+79000000001", 100).await;
    let (campaign, _) = h.seeded_campaign(2, &[a]).await;

    h.campaign_worker().tick().await.unwrap();

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    if settings.quiet_hours_active(Utc::now()) {
        assert_eq!(c.status, CampaignStatus::Running);
        assert_eq!(c.sent_count, 0);
        assert_eq!(h.sim.calls_of(CallKind::Send).len(), 0);
    }
}

// ── Auto-recovery ────────────────────────────────────────────────────────────

#[tokio::test]
async fn campaign_paused_for_accounts_resumes_when_pool_recovers() {
    let h = harness().await;
    let a = h.account("+79000000001", 2).await;
    let (campaign, _) = h.seeded_campaign(4, &[a]).await;

    let worker = h.campaign_worker();
    worker.tick().await.unwrap();
    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Paused);

    // Midnight reset restores the account's quota; the next tick brings
    // the campaign back and drains the rest of the audience.
    h.store.reset_daily_counters(TENANT).await.unwrap();
    worker.tick().await.unwrap();

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Completed);
    assert_eq!(c.sent_count, 4);
}

// ── Warmup gating ────────────────────────────────────────────────────────────

#[tokio::test]
async fn warming_accounts_are_excluded_when_tenant_requires_warmup_first() {
    let h = harness().await;
    let settings = TenantSettings {
        timezone: "UTC".to_string(),
        quiet_hours_start: "00:00".to_string(),
        quiet_hours_end: "00:00".to_string(),
        warmup_before_mailing: true,
        ..TenantSettings::default()
    };
    h.store.set_tenant_settings(TENANT, &settings).await.unwrap();

    let a = h.account("+79000000001", 100).await;
    h.store
        .set_account_warmup_status(a, common::WarmupStatus::InProgress)
        .await
        .unwrap();
    let (campaign, _) = h.seeded_campaign(1, &[a]).await;

    h.campaign_worker().tick().await.unwrap();

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Paused);
    assert_eq!(h.sim.calls_of(CallKind::Send).len(), 0);
}

// ── Transient error streak ───────────────────────────────────────────────────

#[tokio::test]
async fn consecutive_errors_on_one_account_pause_the_campaign() {
    let h = harness().await;
    let a = h.account("+79000000001", 100).await;
    let (campaign, _) = h.seeded_campaign(8, &[a]).await;

    for _ in 0..5 {
        h.sim.script_send_error(a, TgError::Network("timeout".into()));
    }
    h.campaign_worker().tick().await.unwrap();

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Paused);
    assert!(c.pause_reason.as_deref().unwrap().contains("consecutive errors"));
    let acc = h.store.account(a).await.unwrap().unwrap();
    assert_eq!(acc.consecutive_errors, 5);
}

// ── Configuration errors ─────────────────────────────────────────────────────

#[tokio::test]
async fn missing_template_fails_the_campaign_without_retry() {
    let h = harness().await;
    let a = h.account("+79000000001", 100).await;
    let source = h.store.insert_audience_source(TENANT, "leads", 1).await.unwrap();
    h.store.insert_audience_member(source, 101, None, None).await.unwrap();
    let campaign = h
        .store
        .insert_campaign(TENANT, source, 9999, &[a], None, CampaignStatus::Pending, 0, 0, false)
        .await
        .unwrap();

    h.campaign_worker().tick().await.unwrap();

    let c = h.store.campaign(campaign).await.unwrap().unwrap();
    assert_eq!(c.status, CampaignStatus::Error);
    assert_eq!(c.pause_reason.as_deref(), Some("template not found"));
    assert_eq!(h.sim.total_calls(), 0);
}

// ── Auth flow with 2FA scripted through the connector ────────────────────────

#[tokio::test]
async fn manager_auth_round_trip() {
    let h = harness().await;
    h.sim.script_login(
        "+79000000009",
        "54321",
        None,
        AuthorizedUser {
            telegram_id: 999,
            username: Some("fresh".into()),
            first_name: Some("Fresh".into()),
            last_name: None,
        },
    );

    let ticket = h.sessions.start_auth(77, "+79000000009", None).await.unwrap();
    let user = h.sessions.complete_auth(ticket, "54321", None).await.unwrap();
    assert_eq!(user.telegram_id, 999);

    // A second confirmation with the same ticket is rejected.
    let err = h.sessions.complete_auth(ticket, "54321", None).await.unwrap_err();
    assert_eq!(err, TgError::CodeExpired);
}
