use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::thread_rng;
use tracing::{debug, error, info, warn};

use common::{
    mask_phone, Account, AudienceMember, Campaign, CampaignStatus, PeerRef, Result,
    TenantSettings, TgError,
};
use pacing::{
    bump_on_flood, bump_on_peer_flood, decay_on_success, is_eligible, next_delay, typing_delay,
    PacingConfig,
};
use sessions::SessionManager;
use store::{SendFailureKind, Store};
use vendors::{LlmService, Notifier};

use crate::base::{notify_tenant, Worker};
use crate::render::render_placeholders;

/// A campaign auto-pauses once one account fails this many times in a row.
const CONSECUTIVE_ERROR_PAUSE: i64 = 5;

/// Drives every active campaign one batch per tick: fetch recipients,
/// rotate sender accounts, render, send, record, pace.
pub struct CampaignWorker {
    store: Store,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn Notifier>,
    llm: Arc<dyn LlmService>,
    pacing: PacingConfig,
    batch_size: i64,
}

impl CampaignWorker {
    pub fn new(
        store: Store,
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn Notifier>,
        llm: Arc<dyn LlmService>,
        pacing: PacingConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            notifier,
            llm,
            pacing,
            batch_size: 10,
        }
    }

    async fn process_campaign(&self, campaign: &Campaign, settings: &TenantSettings) -> Result<()> {
        let now = Utc::now();

        let Some(template) = self.store.template(campaign.template_id).await? else {
            self.store.fail_campaign(campaign.id, "template not found").await?;
            self.store
                .log_error(campaign.tenant, "campaign", Some(campaign.id), "config", "template not found", now)
                .await?;
            return Ok(());
        };
        let Some(source) = self.store.audience_source(campaign.source_id).await? else {
            self.store.fail_campaign(campaign.id, "audience not found").await?;
            self.store
                .log_error(campaign.tenant, "campaign", Some(campaign.id), "config", "audience not found", now)
                .await?;
            return Ok(());
        };

        if campaign.status == CampaignStatus::Pending
            && self.store.start_campaign(campaign.id, source.total_count).await?
        {
            info!(campaign = campaign.id, total = source.total_count, "campaign started");
            notify_tenant(
                self.notifier.as_ref(),
                settings,
                &format!(
                    "Campaign #{} started: {} recipients",
                    campaign.id, source.total_count
                ),
            )
            .await;
        }

        let batch = self
            .store
            .unsent_batch(
                campaign.tenant,
                campaign.source_id,
                settings.mailing_cache_ttl_days,
                self.batch_size,
                now,
            )
            .await?;

        if batch.is_empty() {
            if self.store.unsent_remaining(campaign.source_id).await? == 0 {
                self.finish(campaign, settings).await?;
            }
            // Unsent recipients all suppressed by blacklist or cache:
            // stay running and retry once the cache window moves.
            return Ok(());
        }

        let mut pool = self.resolve_pool(campaign, settings).await?;
        pool.retain(|a| is_eligible(a, now));
        if pool.is_empty() {
            warn!(campaign = campaign.id, "no available accounts");
            self.store.pause_campaign(campaign.id, "no available accounts").await?;
            notify_tenant(
                self.notifier.as_ref(),
                settings,
                &format!("Campaign #{} paused: no available accounts", campaign.id),
            )
            .await;
            return Ok(());
        }

        self.run_batch(campaign, settings, &template.text, template.media_path.as_deref(), batch, pool)
            .await?;

        if self.store.unsent_remaining(campaign.source_id).await? == 0 {
            self.finish(campaign, settings).await?;
        }
        Ok(())
    }

    /// Send one batch. Returns early on pause/stop/panic/quiet-hours;
    /// the campaign row keeps enough state to resume exactly where it
    /// stopped.
    async fn run_batch(
        &self,
        campaign: &Campaign,
        settings: &TenantSettings,
        template_text: &str,
        media: Option<&str>,
        batch: Vec<AudienceMember>,
        mut pool: Vec<Account>,
    ) -> Result<()> {
        let mut index = campaign.next_account_index.max(0) as usize;
        let mut multiplier = campaign.adaptive_multiplier;
        let mut sent_total = campaign.sent_count;
        let mut current_account = campaign.current_account;

        'recipients: for member in batch {
            let now = Utc::now();

            // Status and gates are re-read per recipient so pause, stop
            // and panic take effect mid-batch.
            match self.store.campaign_status(campaign.id).await? {
                Some(CampaignStatus::Running) => {}
                _ => break 'recipients,
            }
            if self.store.is_tenant_paused(campaign.tenant, now).await? {
                break 'recipients;
            }
            if settings.quiet_hours_active(now) {
                debug!(campaign = campaign.id, "quiet hours — deferring remaining batch");
                break 'recipients;
            }

            let text = self.personalize(campaign, settings, template_text, &member).await;
            let peer = PeerRef {
                telegram_id: member.telegram_id,
                access_hash: member.access_hash,
                username: member.username.clone(),
            };

            // Attempt loop: a flood-waited sender is dropped from the
            // pool and the same recipient retried with the next one.
            loop {
                pool.retain(|a| is_eligible(a, Utc::now()));
                if pool.is_empty() {
                    self.store.pause_campaign(campaign.id, "no available accounts").await?;
                    notify_tenant(
                        self.notifier.as_ref(),
                        settings,
                        &format!("Campaign #{} paused: no available accounts", campaign.id),
                    )
                    .await;
                    break 'recipients;
                }
                let slot = index % pool.len();
                let account = pool[slot].clone();
                current_account = Some(account.id);

                let typing = if campaign.typing_sim {
                    let mut rng = thread_rng();
                    Some(typing_delay(&self.pacing, &mut rng))
                } else {
                    None
                };

                let lease = match self.sessions.acquire(&account).await {
                    Ok(lease) => lease,
                    Err(e) => {
                        warn!(account = account.id, error = %e, "could not open session");
                        self.sessions.note_failure(&account, &e, settings, Utc::now()).await?;
                        pool.remove(slot);
                        continue;
                    }
                };
                let outcome = lease.send_message(&peer, &text, media, typing).await;
                drop(lease);

                let now = Utc::now();
                match outcome {
                    Ok(_) => {
                        self.sessions.note_success(&account, settings, now).await?;
                        self.store
                            .record_send_success(campaign.id, member.id, campaign.tenant, member.telegram_id, now)
                            .await?;
                        pool[slot].daily_sent += 1;
                        multiplier = decay_on_success(multiplier);
                        sent_total += 1;
                        debug!(
                            campaign = campaign.id,
                            recipient = member.telegram_id,
                            via = %mask_phone(&account.phone),
                            "sent"
                        );
                        if sent_total % settings.report_every.max(1) == 0 {
                            let fresh = self.store.campaign(campaign.id).await?;
                            let failed = fresh.map(|c| c.failed_count).unwrap_or(0);
                            notify_tenant(
                                self.notifier.as_ref(),
                                settings,
                                &format!(
                                    "Campaign #{}: {} sent, {} failed of {}",
                                    campaign.id, sent_total, failed, campaign.total_count
                                ),
                            )
                            .await;
                        }
                        index += 1;
                        break;
                    }
                    Err(e @ TgError::FloodWait { seconds }) => {
                        self.sessions.note_failure(&account, &e, settings, now).await?;
                        multiplier = bump_on_flood(multiplier);
                        self.store.set_adaptive_multiplier(campaign.id, multiplier).await?;
                        notify_tenant(
                            self.notifier.as_ref(),
                            settings,
                            &format!(
                                "Account {} entered flood wait for {}s",
                                mask_phone(&account.phone),
                                seconds
                            ),
                        )
                        .await;
                        // Recipient stays unsent; retry with another account.
                        pool.remove(slot);
                        continue;
                    }
                    Err(e @ TgError::PeerFlood) => {
                        self.sessions.note_failure(&account, &e, settings, now).await?;
                        multiplier = bump_on_peer_flood(multiplier);
                        self.store.set_adaptive_multiplier(campaign.id, multiplier).await?;
                        // Campaign-fatal: the recipient is left unsent
                        // and retried after a manual resume.
                        let reason = format!("peer flood on account {}", mask_phone(&account.phone));
                        self.store.pause_campaign(campaign.id, &reason).await?;
                        self.store
                            .log_error(campaign.tenant, "campaign", Some(campaign.id), "peer_flood", &reason, now)
                            .await?;
                        notify_tenant(
                            self.notifier.as_ref(),
                            settings,
                            &format!("Campaign #{} paused: {}", campaign.id, reason),
                        )
                        .await;
                        break 'recipients;
                    }
                    Err(e) if e.is_recipient_terminal() => {
                        self.sessions.note_failure(&account, &e, settings, now).await?;
                        self.store
                            .record_send_failure(campaign.id, member.id, SendFailureKind::Terminal)
                            .await?;
                        if e == TgError::UserBlocked && settings.auto_blacklist_enabled {
                            self.store
                                .add_blacklist_entry(
                                    campaign.tenant,
                                    Some(member.telegram_id),
                                    member.username.as_deref(),
                                    common::BlacklistSource::AutoBlock,
                                )
                                .await?;
                        }
                        self.store
                            .log_error(
                                campaign.tenant,
                                "campaign",
                                Some(campaign.id),
                                "recipient",
                                &format!("{} for {}", e, member.telegram_id),
                                now,
                            )
                            .await?;
                        index += 1;
                        break;
                    }
                    Err(e) => {
                        let streak = self.sessions.note_failure(&account, &e, settings, now).await?;
                        self.store
                            .record_send_failure(campaign.id, member.id, SendFailureKind::Terminal)
                            .await?;
                        self.store
                            .log_error(
                                campaign.tenant,
                                "campaign",
                                Some(campaign.id),
                                "send",
                                &e.to_string(),
                                now,
                            )
                            .await?;
                        if streak >= CONSECUTIVE_ERROR_PAUSE {
                            let reason = format!(
                                "{} consecutive errors on account {}",
                                streak,
                                mask_phone(&account.phone)
                            );
                            self.store.pause_campaign(campaign.id, &reason).await?;
                            notify_tenant(
                                self.notifier.as_ref(),
                                settings,
                                &format!("Campaign #{} paused: {}", campaign.id, reason),
                            )
                            .await;
                            break 'recipients;
                        }
                        index += 1;
                        break;
                    }
                }
            }

            // Lease is already released; sleep the inter-send delay.
            let delay = {
                let mut rng = thread_rng();
                let hour = self.hour_stat(campaign.tenant, settings).await?;
                let mut c = campaign.clone();
                c.sent_count = sent_total;
                c.adaptive_multiplier = multiplier;
                next_delay(&c, hour.as_ref(), &self.pacing, &mut rng)
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let pool_len = pool.len().max(1);
        self.store
            .set_campaign_rotation(campaign.id, current_account, (index % pool_len) as i64)
            .await?;
        self.store.set_adaptive_multiplier(campaign.id, multiplier).await?;
        Ok(())
    }

    /// Auto-recovery: a campaign paused only for lack of accounts comes
    /// back by itself once its pool has an eligible sender again.
    async fn recover_paused_campaigns(&self, now: chrono::DateTime<Utc>) -> Result<()> {
        for campaign in self.store.paused_campaigns().await? {
            if campaign.pause_reason.as_deref() != Some("no available accounts") {
                continue;
            }
            if self.store.is_tenant_paused(campaign.tenant, now).await? {
                continue;
            }
            let settings = self.store.tenant_settings(campaign.tenant).await?;
            if !settings.auto_recovery_mode {
                continue;
            }
            let mut pool = self.resolve_pool(&campaign, &settings).await?;
            pool.retain(|a| is_eligible(a, now));
            if !pool.is_empty() {
                info!(campaign = campaign.id, "accounts available again — resuming");
                self.store.resume_campaign(campaign.id).await?;
            }
        }
        Ok(())
    }

    async fn finish(&self, campaign: &Campaign, settings: &TenantSettings) -> Result<()> {
        self.store.complete_campaign(campaign.id).await?;
        if let Some(fresh) = self.store.campaign(campaign.id).await? {
            if fresh.status == CampaignStatus::Completed {
                info!(campaign = campaign.id, sent = fresh.sent_count, failed = fresh.failed_count, "campaign completed");
                notify_tenant(
                    self.notifier.as_ref(),
                    settings,
                    &format!(
                        "Campaign #{} completed: {} sent, {} failed",
                        campaign.id, fresh.sent_count, fresh.failed_count
                    ),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn resolve_pool(&self, campaign: &Campaign, settings: &TenantSettings) -> Result<Vec<Account>> {
        let mut pool = if !campaign.account_ids.is_empty() {
            self.store.accounts_by_ids(&campaign.account_ids).await?
        } else if let Some(folder) = &campaign.folder {
            self.store.accounts_in_folder(campaign.tenant, folder).await?
        } else {
            self.store.active_accounts(campaign.tenant).await?
        };
        // Accounts still warming up are kept out of mailings when the
        // tenant requires warmup first.
        if settings.warmup_before_mailing {
            pool.retain(|a| a.warmup_status != common::WarmupStatus::InProgress);
        }
        Ok(pool)
    }

    async fn hour_stat(
        &self,
        tenant: i64,
        settings: &TenantSettings,
    ) -> Result<Option<common::HourlyStat>> {
        use chrono::{Datelike, Timelike};
        let local = settings.local(Utc::now());
        self.store
            .hourly_stat(
                tenant,
                local.weekday().num_days_from_monday() as i64,
                local.hour() as i64,
            )
            .await
    }

    /// Placeholder substitution is the floor; the LLM can rewrite on
    /// top of it but a failed call never blocks the send.
    async fn personalize(
        &self,
        campaign: &Campaign,
        settings: &TenantSettings,
        template_text: &str,
        member: &AudienceMember,
    ) -> String {
        let rendered = render_placeholders(template_text, member);
        if !campaign.smart_personalization {
            return rendered;
        }
        let Some(creds) = &settings.llm else { return rendered };
        let prompt = format!(
            "Rewrite this outreach message so it reads personally addressed to {}. \
             Keep the meaning, length and language.\n\n{}",
            member.first_name.as_deref().or(member.username.as_deref()).unwrap_or("the recipient"),
            rendered
        );
        match self.llm.generate(creds, &prompt, 300, 0.8).await {
            Ok(text) => text,
            Err(e) => {
                debug!(error = %e, "personalization unavailable, using rendered text");
                rendered
            }
        }
    }
}

#[async_trait]
impl Worker for CampaignWorker {
    fn name(&self) -> &'static str {
        "campaign_worker"
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        self.store.reactivate_expired_flood_waits(now).await?;
        self.recover_paused_campaigns(now).await?;

        for campaign in self.store.actionable_campaigns().await? {
            if self.store.is_tenant_paused(campaign.tenant, now).await? {
                // Inert, but deliberately left `running`: clearing the
                // panic flag resumes from persisted state.
                continue;
            }
            let settings = self.store.tenant_settings(campaign.tenant).await?;
            if let Err(e) = self.process_campaign(&campaign, &settings).await {
                error!(campaign = campaign.id, error = %e, "campaign processing failed");
                self.store
                    .log_error(campaign.tenant, "campaign", Some(campaign.id), "tick", &e.to_string(), Utc::now())
                    .await?;
                self.store
                    .pause_campaign(campaign.id, &format!("worker error: {e}"))
                    .await?;
            }
        }
        Ok(())
    }
}
