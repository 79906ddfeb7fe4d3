use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::{mask_phone, AuthTask, AuthTaskStatus, Result, TenantSettings, TgError};
use sessions::SessionManager;
use store::Store;
use vendors::Notifier;

use crate::base::{notify_tenant, Worker};

/// Progresses interactive authorization of manually added accounts:
/// `pending` rows get a login code, `code_received` rows get signed in.
pub struct AuthWorker {
    store: Store,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn Notifier>,
}

impl AuthWorker {
    pub fn new(store: Store, sessions: Arc<SessionManager>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            sessions,
            notifier,
        }
    }

    async fn send_code(&self, task: &AuthTask) -> Result<()> {
        info!(task = task.id, phone = %mask_phone(&task.phone), "sending login code");
        let client_key = task.account_id.unwrap_or(-task.id);
        match self
            .sessions
            .start_auth(client_key, &task.phone, task.proxy.as_deref())
            .await
        {
            Ok(ticket) => {
                self.store
                    .set_auth_task_code_sent(task.id, &ticket.to_string())
                    .await?;
            }
            Err(e) => {
                warn!(task = task.id, error = %e, "code request failed");
                self.store
                    .set_auth_task_status(task.id, AuthTaskStatus::Error, Some(&e.to_string()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn complete(&self, task: &AuthTask, settings: &TenantSettings) -> Result<()> {
        let Some(code) = task.code.as_deref() else {
            return Ok(());
        };
        let Some(ticket) = task.ticket.as_deref().and_then(|t| Uuid::parse_str(t).ok()) else {
            self.store
                .set_auth_task_status(task.id, AuthTaskStatus::Error, Some("missing ticket"))
                .await?;
            return Ok(());
        };

        info!(task = task.id, phone = %mask_phone(&task.phone), "completing authorization");
        match self
            .sessions
            .complete_auth(ticket, code, task.password.as_deref())
            .await
        {
            Ok(user) => {
                let account_id = match task.account_id {
                    Some(id) => id,
                    None => {
                        self.store
                            .insert_account(
                                task.tenant,
                                &task.phone,
                                common::AccountStatus::Pending,
                                common::AccountRole::Observer,
                                settings.daily_limit,
                            )
                            .await?
                    }
                };
                self.store.set_account_authorized(account_id, &user).await?;
                self.store
                    .set_auth_task_status(task.id, AuthTaskStatus::Completed, None)
                    .await?;
                info!(task = task.id, account = account_id, "authorized");
                notify_tenant(
                    self.notifier.as_ref(),
                    settings,
                    &format!("Account {} authorized", mask_phone(&task.phone)),
                )
                .await;
            }
            Err(TgError::PasswordNeeded) => {
                self.store
                    .set_auth_task_status(task.id, AuthTaskStatus::TwoFaRequired, None)
                    .await?;
            }
            Err(e) => {
                warn!(task = task.id, error = %e, "authorization failed");
                self.store
                    .set_auth_task_status(task.id, AuthTaskStatus::Error, Some(&e.to_string()))
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for AuthWorker {
    fn name(&self) -> &'static str {
        "auth_worker"
    }

    async fn tick(&self) -> Result<()> {
        for task in self.store.open_auth_tasks().await? {
            if self.store.is_tenant_paused(task.tenant, Utc::now()).await? {
                continue;
            }
            let settings = self.store.tenant_settings(task.tenant).await?;
            let result = match task.status {
                AuthTaskStatus::Pending => self.send_code(&task).await,
                AuthTaskStatus::CodeReceived => self.complete(&task, &settings).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                error!(task = task.id, error = %e, "auth task failed");
                self.store
                    .set_auth_task_status(task.id, AuthTaskStatus::Error, Some(&e.to_string()))
                    .await?;
                self.store
                    .log_error(task.tenant, "auth", Some(task.id), "tick", &e.to_string(), Utc::now())
                    .await?;
            }
        }
        Ok(())
    }
}
