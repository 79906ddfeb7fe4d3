use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use common::{
    mask_phone, Account, CompletedAction, Result, TaskStatus, TenantSettings, WarmupKind,
    WarmupProgress, WarmupStatus,
};
use sessions::SessionManager;
use store::Store;
use vendors::Notifier;

use crate::base::{local_date, notify_tenant, Worker};

const REACT_PROBABILITY_EARLY: f64 = 0.3;
const REACT_PROBABILITY_LATE: f64 = 0.5;
const WARMUP_EMOJI: &[&str] = &["👍", "❤️", "🔥"];

/// Safe public channels used for warmup browsing, loaded from a config
/// file with a built-in fallback list.
#[derive(Debug, Clone, Deserialize)]
pub struct WarmupChannels {
    pub channels: Vec<String>,
    /// Uniform sleep range between warmup actions, seconds.
    #[serde(default = "default_action_delay")]
    pub action_delay: (u64, u64),
}

fn default_action_delay() -> (u64, u64) {
    (30, 120)
}

impl Default for WarmupChannels {
    fn default() -> Self {
        Self {
            channels: ["telegram", "durov", "telegram_rus", "tginfo"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            action_delay: default_action_delay(),
        }
    }
}

impl WarmupChannels {
    /// Load from a TOML file; missing or unreadable files fall back to
    /// the built-in list.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
                warn!(path, error = %e, "bad warmup channel file, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

/// Advances each in-progress warmup by one day per tenant-local day,
/// with activity growing by day stage.
pub struct WarmupWorker {
    store: Store,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn Notifier>,
    channels: WarmupChannels,
}

impl WarmupWorker {
    pub fn new(
        store: Store,
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn Notifier>,
        channels: WarmupChannels,
    ) -> Self {
        Self {
            store,
            sessions,
            notifier,
            channels,
        }
    }

    async fn process_account(
        &self,
        progress: &WarmupProgress,
        account: &Account,
        settings: &TenantSettings,
    ) -> Result<()> {
        let now = Utc::now();

        // At most one advance per tenant-local calendar day.
        if let Some(last) = progress.last_action_at {
            if local_date(settings, last) == local_date(settings, now) {
                return Ok(());
            }
        }

        info!(
            account = account.id,
            phone = %mask_phone(&account.phone),
            day = progress.current_day,
            total = progress.total_days,
            "warmup day"
        );

        match progress.kind {
            WarmupKind::Standard => {
                self.standard_day(account, settings, progress.current_day).await?
            }
            WarmupKind::WarmAccount => {
                self.warm_account_day(account, settings, progress.current_day).await?
            }
        }

        let mut completed = progress.completed_actions.clone();
        completed.push(CompletedAction {
            day: progress.current_day,
            action: format!("warmup_day_{}", progress.current_day),
            at: now,
        });

        if progress.current_day >= progress.total_days {
            self.store
                .finish_warmup(account.id, TaskStatus::Completed, &completed, now)
                .await?;
            self.store
                .set_account_warmup_status(account.id, WarmupStatus::Completed)
                .await?;
            if let Some(folder) = &progress.target_folder {
                self.store.set_account_folder(account.id, Some(folder)).await?;
            }
            info!(account = account.id, "warmup completed");
            notify_tenant(
                self.notifier.as_ref(),
                settings,
                &format!(
                    "Account {} finished its {}-day warmup",
                    mask_phone(&account.phone),
                    progress.total_days
                ),
            )
            .await;
        } else {
            self.store.advance_warmup(account.id, &completed, now).await?;
        }
        Ok(())
    }

    /// Standard program: days 1–2 join channels, days 3–5 browse with
    /// rare reactions, day 6+ browse more with frequent reactions.
    async fn standard_day(
        &self,
        account: &Account,
        settings: &TenantSettings,
        day: i64,
    ) -> Result<()> {
        if day <= 2 {
            let channels = self.sample_channels(3);
            for channel in channels {
                self.join(account, settings, &channel).await;
                self.pause().await;
            }
        } else if day <= 5 {
            self.browse_and_react(account, settings, 5, 2, REACT_PROBABILITY_EARLY).await;
        } else {
            self.browse_and_react(account, settings, 10, 4, REACT_PROBABILITY_LATE).await;
        }
        Ok(())
    }

    /// Compressed two-day variant for accounts destined for the warm
    /// folder: day 1 joins several channels and reacts a little, day 2
    /// reacts across sampled channels.
    async fn warm_account_day(
        &self,
        account: &Account,
        settings: &TenantSettings,
        day: i64,
    ) -> Result<()> {
        if day <= 1 {
            for channel in self.sample_channels(4) {
                self.join(account, settings, &channel).await;
                self.pause().await;
            }
            self.browse_and_react(account, settings, 5, 2, REACT_PROBABILITY_LATE).await;
        } else {
            for _ in 0..2 {
                self.browse_and_react(account, settings, 8, 3, 0.7).await;
                self.pause().await;
            }
        }
        Ok(())
    }

    async fn join(&self, account: &Account, settings: &TenantSettings, channel: &str) {
        let lease = match self.sessions.acquire(account).await {
            Ok(lease) => lease,
            Err(e) => {
                debug!(account = account.id, error = %e, "warmup join skipped");
                return;
            }
        };
        let outcome = lease.join_channel(channel).await;
        drop(lease);
        match outcome {
            Ok(()) => {
                debug!(account = account.id, channel, "joined");
                let _ = self.sessions.note_success(account, settings, Utc::now()).await;
            }
            Err(e) => {
                debug!(account = account.id, channel, error = %e, "join failed");
                let _ = self.sessions.note_failure(account, &e, settings, Utc::now()).await;
            }
        }
    }

    async fn browse_and_react(
        &self,
        account: &Account,
        settings: &TenantSettings,
        post_limit: usize,
        sample: usize,
        probability: f64,
    ) {
        let channel = match self.sample_channels(1).into_iter().next() {
            Some(c) => c,
            None => return,
        };
        let posts = {
            let lease = match self.sessions.acquire(account).await {
                Ok(lease) => lease,
                Err(e) => {
                    debug!(account = account.id, error = %e, "warmup browse skipped");
                    return;
                }
            };
            let result = lease.channel_posts(&channel, post_limit).await;
            drop(lease);
            match result {
                Ok(posts) => posts,
                Err(e) => {
                    let _ = self.sessions.note_failure(account, &e, settings, Utc::now()).await;
                    return;
                }
            }
        };

        let picked: Vec<_> = {
            let mut rng = thread_rng();
            posts
                .choose_multiple(&mut rng, sample.min(posts.len()))
                .cloned()
                .collect()
        };
        for post in picked {
            let reacts = {
                let mut rng = thread_rng();
                rng.gen_bool(probability)
            };
            if reacts {
                let emoji = {
                    let mut rng = thread_rng();
                    WARMUP_EMOJI.choose(&mut rng).unwrap_or(&"👍").to_string()
                };
                let lease = match self.sessions.acquire(account).await {
                    Ok(lease) => lease,
                    Err(_) => return,
                };
                let outcome = lease.send_reaction(&channel, post.id, &emoji).await;
                drop(lease);
                match outcome {
                    Ok(()) => {
                        let _ = self.sessions.note_success(account, settings, Utc::now()).await;
                    }
                    Err(e) => {
                        let _ = self.sessions.note_failure(account, &e, settings, Utc::now()).await;
                        if matches!(e, common::TgError::FloodWait { .. }) {
                            return;
                        }
                    }
                }
            }
            self.pause().await;
        }
    }

    fn sample_channels(&self, n: usize) -> Vec<String> {
        let mut rng = thread_rng();
        self.channels
            .channels
            .choose_multiple(&mut rng, n.min(self.channels.channels.len()))
            .cloned()
            .collect()
    }

    async fn pause(&self) {
        let (lo, hi) = self.channels.action_delay;
        let secs = {
            let mut rng = thread_rng();
            rng.gen_range(lo.min(hi)..=lo.max(hi))
        };
        if secs > 0 {
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
        }
    }
}

#[async_trait]
impl Worker for WarmupWorker {
    fn name(&self) -> &'static str {
        "warmup_worker"
    }

    async fn tick(&self) -> Result<()> {
        for progress in self.store.warmups_in_progress().await? {
            let Some(account) = self.store.account(progress.account_id).await? else {
                continue;
            };
            if self.store.is_tenant_paused(account.tenant, Utc::now()).await? {
                continue;
            }
            let settings = self.store.tenant_settings(account.tenant).await?;
            if let Err(e) = self.process_account(&progress, &account, &settings).await {
                error!(account = account.id, error = %e, "warmup failed");
                self.store
                    .log_error(account.tenant, "warmup", Some(account.id), "tick", &e.to_string(), Utc::now())
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
    fn channel_file_falls_back_to_defaults() {
        let channels = WarmupChannels::load("/nonexistent/warmup.toml");
        assert!(!channels.channels.is_empty());
        assert_eq!(channels.action_delay, (30, 120));
    }

    #[test]
    fn channel_file_parses_toml() {
        let dir = std::env::temp_dir().join("drover_warmup_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("channels.toml");
        std::fs::write(&path, "channels = [\"alpha\", \"beta\"]\naction_delay = [0, 0]\n").unwrap();
        let channels = WarmupChannels::load(path.to_str().unwrap());
        assert_eq!(channels.channels, vec!["alpha", "beta"]);
        assert_eq!(channels.action_delay, (0, 0));
    }
}
