use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info};

use common::{Result, ScheduledContent, TemplateSchedule, TenantSettings};
use pacing::select_account;
use sessions::SessionManager;
use store::Store;
use vendors::{LlmService, Notifier};

use crate::base::{local_date, notify_tenant, Worker};
use crate::scheduler::template_schedule_fires;

/// Publishes queued one-shot posts and recurring template posts to the
/// tenant's channels through one of its active accounts.
pub struct ContentWorker {
    store: Store,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn Notifier>,
    llm: Arc<dyn LlmService>,
}

impl ContentWorker {
    pub fn new(
        store: Store,
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn Notifier>,
        llm: Arc<dyn LlmService>,
    ) -> Self {
        Self {
            store,
            sessions,
            notifier,
            llm,
        }
    }

    async fn publish_item(&self, item: &ScheduledContent, settings: &TenantSettings) -> Result<()> {
        let Some(channel) = self.store.tenant_channel(item.channel_id).await? else {
            self.store.fail_content(item.id, "channel not found").await?;
            return Ok(());
        };

        let text = self.maybe_rewrite(settings, &item.text, item.use_ai_rewrite).await;

        match self
            .publish_to_channel(item.tenant, &channel.username, &text, item.media_path.as_deref(), settings)
            .await?
        {
            Ok(message_id) => {
                self.store
                    .mark_content_published(item.id, message_id as i64, Utc::now())
                    .await?;
                info!(content = item.id, channel = %channel.username, "content published");
                notify_tenant(
                    self.notifier.as_ref(),
                    settings,
                    &format!("Post #{} published to @{}", item.id, channel.username),
                )
                .await;
            }
            Err(reason) => {
                self.store.fail_content(item.id, &reason).await?;
                self.store
                    .log_error(item.tenant, "content", Some(item.id), "publish", &reason, Utc::now())
                    .await?;
            }
        }
        Ok(())
    }

    async fn publish_template(
        &self,
        schedule: &TemplateSchedule,
        settings: &TenantSettings,
    ) -> Result<()> {
        let Some(template) = self.store.template(schedule.template_id).await? else {
            self.store
                .set_template_schedule_error(schedule.id, "template not found")
                .await?;
            return Ok(());
        };
        let Some(channel) = self.store.tenant_channel(schedule.channel_id).await? else {
            self.store
                .set_template_schedule_error(schedule.id, "channel not found")
                .await?;
            return Ok(());
        };

        let text = self
            .maybe_rewrite(settings, &template.text, schedule.use_ai_rewrite)
            .await;

        match self
            .publish_to_channel(
                schedule.tenant,
                &channel.username,
                &text,
                template.media_path.as_deref(),
                settings,
            )
            .await?
        {
            Ok(_) => {
                self.store.mark_template_published(schedule.id, Utc::now()).await?;
                info!(schedule = schedule.id, channel = %channel.username, "template published");
                notify_tenant(
                    self.notifier.as_ref(),
                    settings,
                    &format!(
                        "Recurring post \"{}\" published to @{}",
                        template.name, channel.username
                    ),
                )
                .await;
            }
            Err(reason) => {
                self.store.set_template_schedule_error(schedule.id, &reason).await?;
                self.store
                    .log_error(schedule.tenant, "content", Some(schedule.id), "template", &reason, Utc::now())
                    .await?;
            }
        }
        Ok(())
    }

    /// Publish through the tenant's best active account. The inner
    /// result carries the publish failure without aborting the tick.
    async fn publish_to_channel(
        &self,
        tenant: i64,
        channel: &str,
        text: &str,
        media: Option<&str>,
        settings: &TenantSettings,
    ) -> Result<std::result::Result<i32, String>> {
        let accounts = self.store.active_accounts(tenant).await?;
        let Some(account) = select_account(&accounts, Utc::now()).cloned() else {
            return Ok(Err("no active accounts available".to_string()));
        };

        let lease = match self.sessions.acquire(&account).await {
            Ok(lease) => lease,
            Err(e) => return Ok(Err(format!("session unavailable: {e}"))),
        };
        let outcome = lease.publish(channel, text, media).await;
        drop(lease);

        match outcome {
            Ok(message_id) => {
                self.sessions.note_success(&account, settings, Utc::now()).await?;
                Ok(Ok(message_id))
            }
            Err(e) => {
                self.sessions.note_failure(&account, &e, settings, Utc::now()).await?;
                Ok(Err(e.to_string()))
            }
        }
    }

    async fn maybe_rewrite(&self, settings: &TenantSettings, text: &str, enabled: bool) -> String {
        if !enabled {
            return text.to_string();
        }
        let Some(creds) = &settings.llm else {
            return text.to_string();
        };
        match self.llm.rewrite(creds, text).await {
            Ok(rewritten) => rewritten,
            Err(e) => {
                debug!(error = %e, "rewrite unavailable, publishing original");
                text.to_string()
            }
        }
    }
}

#[async_trait]
impl Worker for ContentWorker {
    fn name(&self) -> &'static str {
        "content_worker"
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();

        for item in self.store.queued_content().await? {
            if self.store.is_tenant_paused(item.tenant, now).await? {
                continue;
            }
            let settings = self.store.tenant_settings(item.tenant).await?;
            if let Err(e) = self.publish_item(&item, &settings).await {
                error!(content = item.id, error = %e, "content publish failed");
                self.store.fail_content(item.id, &e.to_string()).await?;
            }
        }

        for schedule in self.store.template_schedules().await? {
            if self.store.is_tenant_paused(schedule.tenant, now).await? {
                continue;
            }
            let settings = self.store.tenant_settings(schedule.tenant).await?;
            if !template_schedule_fires(&schedule.publish_time, &schedule.repeat_days, &settings, now) {
                continue;
            }
            // One firing per local day, even if several ticks land in
            // the same minute.
            if let Some(last) = schedule.last_published_at {
                if local_date(&settings, last) == local_date(&settings, now) {
                    continue;
                }
            }
            if let Err(e) = self.publish_template(&schedule, &settings).await {
                error!(schedule = schedule.id, error = %e, "template publish failed");
                self.store
                    .set_template_schedule_error(schedule.id, &e.to_string())
                    .await?;
            }
        }
        Ok(())
    }
}
