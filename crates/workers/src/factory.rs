use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::{thread_rng, Rng};
use tracing::{error, info, warn};

use common::{
    mask_phone, AccountProfile, AccountRole, AccountStatus, FactoryTask, Result, TaskStatus,
    TenantSettings, WarmupKind, WarmupStatus,
};
use sessions::SessionManager;
use store::Store;
use vendors::{Notifier, SmsVendor};

use crate::base::{notify_tenant, Worker};

/// Below this vendor balance the task pauses instead of burning rent
/// attempts that cannot complete.
const MIN_VENDOR_BALANCE: f64 = 15.0;
const SMS_CODE_TIMEOUT: Duration = Duration::from_secs(300);

/// Provisions one account per open factory task per tick: rent a
/// number, drive the login, confirm or release the rental.
pub struct FactoryWorker {
    store: Store,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn Notifier>,
    sms: Arc<dyn SmsVendor>,
}

impl FactoryWorker {
    pub fn new(
        store: Store,
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn Notifier>,
        sms: Arc<dyn SmsVendor>,
    ) -> Self {
        Self {
            store,
            sessions,
            notifier,
            sms,
        }
    }

    async fn process_task(&self, task: &FactoryTask, settings: &TenantSettings) -> Result<()> {
        if task.created_count + task.failed_count >= task.count {
            self.store.set_factory_task_status(task.id, TaskStatus::Completed).await?;
            return Ok(());
        }
        if task.status == TaskStatus::Pending {
            self.store.set_factory_task_status(task.id, TaskStatus::InProgress).await?;
        }

        let balance = self.sms.balance().await?;
        if balance < MIN_VENDOR_BALANCE {
            warn!(task = task.id, balance, "vendor balance too low, pausing task");
            self.store.set_factory_task_status(task.id, TaskStatus::Paused).await?;
            self.store
                .record_factory_failure(task.id, &format!("balance too low: {balance:.2}"))
                .await?;
            notify_tenant(
                self.notifier.as_ref(),
                settings,
                &format!("Factory task #{} paused: vendor balance {balance:.2}", task.id),
            )
            .await;
            return Ok(());
        }

        info!(
            task = task.id,
            progress = format!("{}/{}", task.created_count + 1, task.count),
            "creating account"
        );

        match self.create_account(task, settings).await {
            Ok(phone) => {
                self.store.record_factory_created(task.id).await?;
                notify_tenant(
                    self.notifier.as_ref(),
                    settings,
                    &format!(
                        "Account {} created ({}/{})",
                        mask_phone(&phone),
                        task.created_count + 1,
                        task.count
                    ),
                )
                .await;
            }
            Err(e) => {
                warn!(task = task.id, error = %e, "account creation failed");
                self.store.record_factory_failure(task.id, &e.to_string()).await?;
                self.store
                    .log_error(task.tenant, "factory", Some(task.id), "create", &e.to_string(), Utc::now())
                    .await?;
            }
        }

        // Settle the task when this attempt was the last one.
        if let Some(fresh) = self.store.factory_task(task.id).await? {
            if fresh.created_count + fresh.failed_count >= fresh.count
                && fresh.status == TaskStatus::InProgress
            {
                self.store.set_factory_task_status(task.id, TaskStatus::Completed).await?;
                notify_tenant(
                    self.notifier.as_ref(),
                    settings,
                    &format!(
                        "Factory task #{} finished: {} created, {} failed",
                        task.id, fresh.created_count, fresh.failed_count
                    ),
                )
                .await;
            }
        }
        Ok(())
    }

    /// The full provisioning flow for one account. The rented number is
    /// released on any failure before the code is consumed.
    async fn create_account(&self, task: &FactoryTask, settings: &TenantSettings) -> Result<String> {
        let rented = self.sms.rent_number("telegram", &task.country).await?;
        info!(tzid = rented.tzid, phone = %mask_phone(&rented.number), "rented number");

        let role = draw_role(&task.role_distribution);
        let account_id = self
            .store
            .insert_account(
                task.tenant,
                &rented.number,
                AccountStatus::Pending,
                role,
                settings.daily_limit,
            )
            .await?;

        let ticket = match self.sessions.start_auth(account_id, &rented.number, None).await {
            Ok(ticket) => ticket,
            Err(e) => {
                self.store.set_account_status(account_id, AccountStatus::Error).await?;
                let _ = self.sms.cancel(rented.tzid).await;
                return Err(common::Error::Other(format!("auth request failed: {e}")));
            }
        };

        let code = match self.sms.poll_code(rented.tzid, SMS_CODE_TIMEOUT).await? {
            Some(code) => code,
            None => {
                self.store.set_account_status(account_id, AccountStatus::Error).await?;
                let _ = self.sms.cancel(rented.tzid).await;
                return Err(common::Error::Vendor("SMS code timeout".into()));
            }
        };

        let user = match self.sessions.complete_auth(ticket, &code, None).await {
            Ok(user) => user,
            Err(e) => {
                self.store.set_account_status(account_id, AccountStatus::Error).await?;
                return Err(common::Error::Other(format!("sign in failed: {e}")));
            }
        };

        self.sms.confirm(rented.tzid).await?;
        self.store.set_account_authorized(account_id, &user).await?;
        self.store
            .insert_account_profile(&AccountProfile {
                account_id,
                persona: "Telegram user".to_string(),
                interests: vec!["news".to_string(), "chat".to_string()],
                speech_style: "informal".to_string(),
                preferred_reactions: vec!["👍".to_string(), "❤️".to_string(), "🔥".to_string()],
            })
            .await?;

        if task.auto_warmup {
            self.store
                .insert_warmup(account_id, WarmupKind::Standard, task.warmup_days, None)
                .await?;
            self.store
                .set_account_warmup_status(account_id, WarmupStatus::InProgress)
                .await?;
        }

        info!(account = account_id, phone = %mask_phone(&rented.number), "account created");
        Ok(rented.number)
    }
}

/// Cumulative-probability draw over the ordered role names. Weights sum
/// to ≤ 1.0; an unmatched draw falls through to observer.
fn draw_role(distribution: &BTreeMap<String, f64>) -> AccountRole {
    let u: f64 = {
        let mut rng = thread_rng();
        rng.gen_range(0.0..1.0)
    };
    draw_role_with(distribution, u)
}

fn draw_role_with(distribution: &BTreeMap<String, f64>, u: f64) -> AccountRole {
    let mut cumulative = 0.0;
    for (role, weight) in distribution {
        cumulative += weight;
        if cumulative >= u {
            return parse_role(role);
        }
    }
    AccountRole::Observer
}

fn parse_role(name: &str) -> AccountRole {
    match name {
        "expert" => AccountRole::Expert,
        "support" => AccountRole::Support,
        "trendsetter" => AccountRole::Trendsetter,
        "community" => AccountRole::Community,
        _ => AccountRole::Observer,
    }
}

#[async_trait]
impl Worker for FactoryWorker {
    fn name(&self) -> &'static str {
        "factory_worker"
    }

    async fn tick(&self) -> Result<()> {
        let tasks = self.store.open_factory_tasks().await?;
        if tasks.is_empty() {
            return Ok(());
        }
        // Vendor outage: skip the whole tick rather than failing tasks.
        if self.sms.balance().await.is_err() {
            warn!("SMS vendor unavailable, skipping factory tick");
            return Ok(());
        }
        for task in tasks {
            if self.store.is_tenant_paused(task.tenant, Utc::now()).await? {
                continue;
            }
            let settings = self.store.tenant_settings(task.tenant).await?;
            if let Err(e) = self.process_task(&task, &settings).await {
                error!(task = task.id, error = %e, "factory task failed");
                self.store
                    .record_factory_failure(task.id, &e.to_string())
                    .await?;
                self.store
                    .log_error(task.tenant, "factory", Some(task.id), "tick", &e.to_string(), Utc::now())
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn role_draw_walks_cumulative_weights() {
        let d = dist(&[("expert", 0.3), ("observer", 0.4), ("support", 0.2)]);
        // BTreeMap iterates keys in order: expert, observer, support.
        assert_eq!(draw_role_with(&d, 0.1), AccountRole::Expert);
        assert_eq!(draw_role_with(&d, 0.3), AccountRole::Expert);
        assert_eq!(draw_role_with(&d, 0.5), AccountRole::Observer);
        assert_eq!(draw_role_with(&d, 0.8), AccountRole::Support);
        // Weights sum to 0.9: the tail falls through to observer.
        assert_eq!(draw_role_with(&d, 0.95), AccountRole::Observer);
    }

    #[test]
    fn empty_distribution_defaults_to_observer() {
        assert_eq!(draw_role_with(&BTreeMap::new(), 0.5), AccountRole::Observer);
    }
}
