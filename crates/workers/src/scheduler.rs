use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use tracing::{error, info, warn};

use common::{CampaignStatus, Result, ScheduledMailing, ScheduledTask, TenantSettings, WarmupKind};
use store::Store;
use vendors::Notifier;

use crate::base::{notify_tenant, Worker};

/// Converts due scheduled rows into live work: mailings become pending
/// campaigns, recurring tasks fire and re-arm, due content is queued
/// for the content worker.
pub struct SchedulerWorker {
    store: Store,
    notifier: Arc<dyn Notifier>,
}

impl SchedulerWorker {
    pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    async fn launch_mailing(
        &self,
        mailing: &ScheduledMailing,
        settings: &TenantSettings,
    ) -> Result<()> {
        let accounts = match &mailing.folder {
            Some(folder) => self.store.accounts_in_folder(mailing.tenant, folder).await?,
            None => self.store.active_accounts(mailing.tenant).await?,
        };
        let account_ids: Vec<i64> = accounts
            .iter()
            .filter(|a| a.status == common::AccountStatus::Active)
            .map(|a| a.id)
            .collect();

        if account_ids.is_empty() {
            self.store
                .fail_scheduled_mailing(mailing.id, "no active accounts")
                .await?;
            return Ok(());
        }

        let campaign = self
            .store
            .insert_campaign(
                mailing.tenant,
                mailing.source_id,
                mailing.template_id,
                &account_ids,
                mailing.folder.as_deref(),
                CampaignStatus::Pending,
                settings.delay_min,
                settings.delay_max,
                mailing.warm_start,
            )
            .await?;

        info!(mailing = mailing.id, campaign, "scheduled mailing launched");
        notify_tenant(
            self.notifier.as_ref(),
            settings,
            &format!(
                "Scheduled mailing #{} launched as campaign #{} with {} accounts",
                mailing.id,
                campaign,
                account_ids.len()
            ),
        )
        .await;
        Ok(())
    }

    async fn run_task(&self, task: &ScheduledTask) -> Result<()> {
        match task.kind.as_str() {
            "warmup" => {
                // Arm a warmup for each listed account that has none yet.
                let ids: Vec<i64> = serde_json::from_value(
                    task.payload.get("account_ids").cloned().unwrap_or_default(),
                )
                .unwrap_or_default();
                let days = task
                    .payload
                    .get("days")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(5);
                for id in ids {
                    if self.store.warmup_progress(id).await?.is_none() {
                        self.store.insert_warmup(id, WarmupKind::Standard, days, None).await?;
                        self.store
                            .set_account_warmup_status(id, common::WarmupStatus::InProgress)
                            .await?;
                    }
                }
                Ok(())
            }
            other => {
                warn!(task = task.id, kind = other, "unknown scheduled task kind");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Worker for SchedulerWorker {
    fn name(&self) -> &'static str {
        "scheduler_worker"
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();

        self.store.promote_scheduled_campaigns(now).await?;

        for mailing in self.store.due_scheduled_mailings(now).await? {
            if self.store.is_tenant_paused(mailing.tenant, now).await? {
                continue; // stays pending; fires after the flag clears
            }
            let settings = self.store.tenant_settings(mailing.tenant).await?;
            match self.launch_mailing(&mailing, &settings).await {
                Ok(()) => {
                    self.store
                        .settle_scheduled_mailing(mailing.id, mailing.repeat_mode, now)
                        .await?;
                }
                Err(e) => {
                    error!(mailing = mailing.id, error = %e, "scheduled mailing failed");
                    self.store.fail_scheduled_mailing(mailing.id, &e.to_string()).await?;
                    self.store
                        .log_error(mailing.tenant, "scheduler", Some(mailing.id), "mailing", &e.to_string(), now)
                        .await?;
                }
            }
        }

        for task in self.store.due_scheduled_tasks(now).await? {
            if self.store.is_tenant_paused(task.tenant, now).await? {
                continue;
            }
            match self.run_task(&task).await {
                Ok(()) => {
                    self.store
                        .settle_scheduled_task(task.id, task.repeat_mode, now)
                        .await?;
                }
                Err(e) => {
                    error!(task = task.id, error = %e, "scheduled task failed");
                    self.store.fail_scheduled_task(task.id, &e.to_string()).await?;
                    self.store
                        .log_error(task.tenant, "scheduler", Some(task.id), "task", &e.to_string(), now)
                        .await?;
                }
            }
        }

        self.store.queue_due_content(now).await?;
        Ok(())
    }
}

/// Parse an operator-entered schedule time in tenant-local time.
/// Accepted: `HH:MM` (next occurrence today or tomorrow), `DD.MM HH:MM`
/// (current year), `DD.MM.YYYY HH:MM`, `YYYY-MM-DD HH:MM`. Returns UTC.
pub fn parse_schedule_time(
    text: &str,
    settings: &TenantSettings,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let tz = settings.tz();
    let local_now = settings.local(now);

    let local_naive = if let Ok(time) = NaiveTime::parse_from_str(text, "%H:%M") {
        let mut candidate = local_now.date_naive().and_time(time);
        if candidate <= local_now.naive_local() {
            candidate += chrono::Duration::days(1);
        }
        candidate
    } else if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%d.%m.%Y %H:%M") {
        dt
    } else if let Ok(dt) = NaiveDateTime::parse_from_str(
        &format!("{text}.{}", local_now.year()),
        "%d.%m %H:%M.%Y",
    ) {
        dt
    } else if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M") {
        dt
    } else {
        return None;
    };

    tz.from_local_datetime(&local_naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// True when the schedule's `HH:MM` equals the current tenant-local
/// minute and the weekday (Monday = 0) is allowed. An empty day list
/// allows every day.
pub(crate) fn template_schedule_fires(
    publish_time: &str,
    repeat_days: &[u8],
    settings: &TenantSettings,
    now: DateTime<Utc>,
) -> bool {
    let Some(publish) = common::settings::parse_hhmm(publish_time) else {
        return false;
    };
    let local = settings.local(now);
    if local.time().hour() != publish.hour() || local.time().minute() != publish.minute() {
        return false;
    }
    if repeat_days.is_empty() {
        return true;
    }
    let today = local.weekday().num_days_from_monday() as u8;
    repeat_days.contains(&today)
}
