use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};

use common::{BlacklistSource, InboundReply, Result, TenantSettings};
use store::Store;
use vendors::Notifier;

use crate::base::{notify_tenant, Worker};

const REPLY_BATCH: i64 = 100;

/// Scans replies captured by the inbound side of the store against the
/// tenant's stop triggers and auto-blacklists matching senders.
pub struct ReplyWorker {
    store: Store,
    notifier: Arc<dyn Notifier>,
}

impl ReplyWorker {
    pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    async fn process_reply(&self, reply: &InboundReply, settings: &TenantSettings) -> Result<()> {
        let lowered = reply.text.to_lowercase();
        for trigger in self.store.active_stop_triggers(reply.tenant).await? {
            if !lowered.contains(&trigger.phrase.to_lowercase()) {
                continue;
            }
            self.store.record_stop_trigger_hit(trigger.id).await?;
            if settings.auto_blacklist_enabled {
                self.store
                    .add_blacklist_entry(
                        reply.tenant,
                        Some(reply.from_telegram_id),
                        reply.from_username.as_deref(),
                        BlacklistSource::AutoResponse,
                    )
                    .await?;
                info!(
                    tenant = reply.tenant,
                    from = reply.from_telegram_id,
                    phrase = %trigger.phrase,
                    "stop trigger matched — sender blacklisted"
                );
                notify_tenant(
                    self.notifier.as_ref(),
                    settings,
                    &format!(
                        "Stop phrase \"{}\" received from {} — added to blacklist",
                        trigger.phrase, reply.from_telegram_id
                    ),
                )
                .await;
            }
            break;
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for ReplyWorker {
    fn name(&self) -> &'static str {
        "reply_worker"
    }

    async fn tick(&self) -> Result<()> {
        for reply in self.store.unprocessed_replies(REPLY_BATCH).await? {
            let settings = self.store.tenant_settings(reply.tenant).await?;
            if let Err(e) = self.process_reply(&reply, &settings).await {
                error!(reply = reply.id, error = %e, "reply processing failed");
                self.store
                    .log_error(reply.tenant, "replies", Some(reply.id), "scan", &e.to_string(), Utc::now())
                    .await?;
            }
            self.store.mark_reply_processed(reply.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vendors::RecordingNotifier;

    #[tokio::test]
    async fn matching_reply_blacklists_sender_and_counts_hit() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let trigger = store.insert_stop_trigger(1, "unsubscribe").await.unwrap();
        store
            .insert_inbound_reply(1, 900, Some("angry_user"), "Please UNSUBSCRIBE me now")
            .await
            .unwrap();
        store.insert_inbound_reply(1, 901, None, "thanks, interesting!").await.unwrap();

        let worker = ReplyWorker::new(store.clone(), Arc::new(RecordingNotifier::new()));
        worker.tick().await.unwrap();

        assert!(store.is_blacklisted(1, 900).await.unwrap());
        assert!(!store.is_blacklisted(1, 901).await.unwrap());
        let triggers = store.active_stop_triggers(1).await.unwrap();
        assert_eq!(triggers.iter().find(|t| t.id == trigger).unwrap().hits_count, 1);
        assert!(store.unprocessed_replies(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_blacklist_can_be_disabled() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let mut settings = TenantSettings::default();
        settings.auto_blacklist_enabled = false;
        store.set_tenant_settings(1, &settings).await.unwrap();
        store.insert_stop_trigger(1, "stop").await.unwrap();
        store.insert_inbound_reply(1, 900, None, "stop writing me").await.unwrap();

        let worker = ReplyWorker::new(store.clone(), Arc::new(RecordingNotifier::new()));
        worker.tick().await.unwrap();

        // Hit recorded, but no blacklist entry.
        assert!(!store.is_blacklisted(1, 900).await.unwrap());
        assert_eq!(store.active_stop_triggers(1).await.unwrap()[0].hits_count, 1);
    }
}
