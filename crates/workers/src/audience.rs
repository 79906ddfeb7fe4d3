use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use common::{Account, ParsingTask, Result, TaskStatus, TenantSettings, TgError};
use sessions::SessionManager;
use store::Store;
use vendors::Notifier;

use crate::base::{notify_tenant, Worker};

const PARSE_BATCH: usize = 100;

/// Collects audiences from channels and chats: one participant batch
/// per loop iteration, deduplicated into the task's audience source.
pub struct AudienceWorker {
    store: Store,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn Notifier>,
}

impl AudienceWorker {
    pub fn new(store: Store, sessions: Arc<SessionManager>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            sessions,
            notifier,
        }
    }

    async fn process_task(&self, task: &ParsingTask, settings: &TenantSettings) -> Result<()> {
        let Some(channel) = extract_username(&task.source_link) else {
            self.store
                .set_parsing_task_status(task.id, TaskStatus::Error, Some("invalid source link"))
                .await?;
            return Ok(());
        };

        let Some(account) = self.parser_account(task).await? else {
            self.store
                .set_parsing_task_status(task.id, TaskStatus::Error, Some("no active accounts"))
                .await?;
            return Ok(());
        };

        if task.status == TaskStatus::Pending {
            info!(task = task.id, channel = %channel, "parsing started");
            self.store
                .set_parsing_task_status(task.id, TaskStatus::InProgress, None)
                .await?;
        }

        // Resume from the already-parsed offset; duplicates are dropped
        // by the audience unique key anyway.
        let mut parsed = task.parsed_count;
        let mut offset = task.parsed_count.max(0) as usize;

        loop {
            let lease = match self.sessions.acquire(&account).await {
                Ok(lease) => lease,
                Err(e) => {
                    self.sessions.note_failure(&account, &e, settings, Utc::now()).await?;
                    return Ok(()); // retry next tick
                }
            };
            let result = lease.channel_participants(&channel, PARSE_BATCH, offset).await;
            drop(lease);

            let batch = match result {
                Ok(batch) => batch,
                Err(e @ TgError::FloodWait { .. }) => {
                    // Cool the account down and pick the task up again
                    // next tick from the same offset.
                    self.sessions.note_failure(&account, &e, settings, Utc::now()).await?;
                    warn!(task = task.id, "flood wait during parsing — deferring");
                    return Ok(());
                }
                Err(e) => {
                    self.store
                        .set_parsing_task_status(task.id, TaskStatus::Error, Some(&e.to_string()))
                        .await?;
                    self.store
                        .log_error(task.tenant, "parsing", Some(task.id), "fetch", &e.to_string(), Utc::now())
                        .await?;
                    return Ok(());
                }
            };

            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();

            if let Some(source_id) = task.source_id {
                parsed += self.store.add_participants(source_id, &batch).await?;
            } else {
                parsed += fetched as i64;
            }
            self.store.update_parsing_progress(task.id, parsed, parsed.max(task.total_count)).await?;

            if fetched < PARSE_BATCH {
                break;
            }
            offset += fetched;
        }

        self.store
            .set_parsing_task_status(task.id, TaskStatus::Completed, None)
            .await?;
        self.store.update_parsing_progress(task.id, parsed, parsed).await?;
        if let Some(source_id) = task.source_id {
            self.store.set_source_total(source_id, parsed).await?;
        }
        info!(task = task.id, parsed, channel = %channel, "parsing completed");
        notify_tenant(
            self.notifier.as_ref(),
            settings,
            &format!("Parsed {parsed} users from @{channel}"),
        )
        .await;
        Ok(())
    }

    async fn parser_account(&self, task: &ParsingTask) -> Result<Option<Account>> {
        if let Some(id) = task.account_id {
            return self.store.account(id).await;
        }
        Ok(self
            .store
            .active_accounts(task.tenant)
            .await?
            .into_iter()
            .next())
    }
}

/// Pull a bare username out of a link or @-mention.
fn extract_username(link: &str) -> Option<String> {
    let trimmed = link.trim();
    let tail = trimmed
        .strip_prefix("https://t.me/")
        .or_else(|| trimmed.strip_prefix("http://t.me/"))
        .or_else(|| trimmed.strip_prefix("t.me/"))
        .unwrap_or(trimmed);
    let name = tail.trim_start_matches('@').trim_matches('/');
    if name.is_empty() || name.contains('/') || name.contains('+') {
        return None;
    }
    Some(name.to_string())
}

#[async_trait]
impl Worker for AudienceWorker {
    fn name(&self) -> &'static str {
        "audience_worker"
    }

    async fn tick(&self) -> Result<()> {
        for task in self.store.open_parsing_tasks().await? {
            if self.store.is_tenant_paused(task.tenant, Utc::now()).await? {
                continue;
            }
            let settings = self.store.tenant_settings(task.tenant).await?;
            if let Err(e) = self.process_task(&task, &settings).await {
                error!(task = task.id, error = %e, "parsing task failed");
                self.store
                    .set_parsing_task_status(task.id, TaskStatus::Error, Some(&e.to_string()))
                    .await?;
                self.store
                    .log_error(task.tenant, "parsing", Some(task.id), "tick", &e.to_string(), Utc::now())
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_extracted_from_links() {
        assert_eq!(extract_username("@cryptonews").as_deref(), Some("cryptonews"));
        assert_eq!(extract_username("https://t.me/cryptonews").as_deref(), Some("cryptonews"));
        assert_eq!(extract_username("t.me/cryptonews/").as_deref(), Some("cryptonews"));
        assert_eq!(extract_username("cryptonews").as_deref(), Some("cryptonews"));
        assert_eq!(extract_username("https://t.me/+AbC123"), None);
        assert_eq!(extract_username(""), None);
    }
}
