use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use tracing::{debug, error, warn};

use common::{
    Account, ActionKind, ActionStep, HerderAssignment, HerderStrategy, Result, TenantSettings,
    TgError,
};
use pacing::{is_eligible, select_account};
use sessions::SessionManager;
use store::Store;
use vendors::{LlmService, Notifier};

use crate::base::{local_midnight_utc, Worker};

const DEFAULT_REACTIONS: &[&str] = &["👍", "❤️", "🔥", "👏", "🎉"];

/// Static fallback comments per strategy, used when no LLM is
/// configured or the call fails.
fn phrase_bank(strategy: HerderStrategy) -> &'static [&'static str] {
    match strategy {
        HerderStrategy::Expert => &[
            "Interesting take, thanks for laying it out",
            "Good material, saved it for later",
            "Agree with the author, this matters",
            "Solid write-up, was looking for exactly this",
        ],
        HerderStrategy::Support => &["👍👍👍", "Great!", "+1", "Agreed!", "Well said", "🔥🔥🔥"],
        HerderStrategy::Trendsetter => &["First! 🎉", "Fresh post, nice", "Been waiting for this", "🚀"],
        HerderStrategy::Observer | HerderStrategy::Community => {
            &["👍", "Interesting", "Thanks", "🙏"]
        }
    }
}

/// Performs at most one post-engagement per assignment per tick through
/// one eligible account, following the assignment's action chain.
pub struct HerderWorker {
    store: Store,
    sessions: Arc<SessionManager>,
    #[allow(dead_code)]
    notifier: Arc<dyn Notifier>,
    llm: Arc<dyn LlmService>,
    /// Posts considered for selection per tick.
    posts_window: usize,
}

impl HerderWorker {
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
            posts_window: 5,
        }
    }

    async fn process_assignment(
        &self,
        assignment: &HerderAssignment,
        settings: &TenantSettings,
    ) -> Result<()> {
        let now = Utc::now();
        let Some(channel) = self.store.monitored_channel(assignment.channel_id).await? else {
            warn!(assignment = assignment.id, "monitored channel missing");
            return Ok(());
        };

        let midnight = local_midnight_utc(settings, now);
        let comment_cap = assignment.max_comments_per_day * assignment.account_ids.len() as i64;

        let Some(account) = self.pick_account(assignment, settings, midnight).await? else {
            debug!(assignment = assignment.id, "no account under quota today");
            return Ok(());
        };

        let posts = {
            let lease = self.sessions.acquire(&account).await.map_err(common::Error::from)?;
            let result = lease.channel_posts(&channel.username, self.posts_window).await;
            drop(lease);
            match result {
                Ok(posts) => posts,
                Err(e) => {
                    self.sessions.note_failure(&account, &e, settings, now).await?;
                    return Ok(());
                }
            }
        };
        if posts.is_empty() {
            return Ok(());
        }

        let post = {
            let mut rng = thread_rng();
            select_post(&posts, assignment.strategy, &mut rng).clone()
        };

        for step in &assignment.action_chain {
            let now = Utc::now();
            if self.store.is_tenant_paused(assignment.tenant, now).await? {
                break;
            }
            // Steps can demand a minimum audience before acting.
            if let Some(min) = step.min_engagement {
                if post.views < min {
                    continue;
                }
            }
            let fires = {
                let mut rng = thread_rng();
                rng.gen_bool(step.probability.clamp(0.0, 1.0))
            };
            if !fires {
                continue;
            }

            let allow_comment =
                self.store.assignment_comments_since(assignment.id, midnight).await? < comment_cap;
            let keep_going = self
                .execute_step(assignment, &account, settings, &channel.username, &post, step, allow_comment)
                .await?;
            if !keep_going {
                break;
            }

            let (lo, hi) = step.delay_after;
            let pause = {
                let mut rng = thread_rng();
                rng.gen_range(lo.min(hi)..=lo.max(hi))
            };
            if pause > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(pause)).await;
            }
        }
        Ok(())
    }

    /// Pick the best eligible account under the per-account daily cap.
    async fn pick_account(
        &self,
        assignment: &HerderAssignment,
        settings: &TenantSettings,
        midnight: chrono::DateTime<Utc>,
    ) -> Result<Option<Account>> {
        let now = Utc::now();
        let cap = settings.herder.max_actions_per_account;
        let mut under_quota = Vec::new();
        for account in self.store.accounts_by_ids(&assignment.account_ids).await? {
            if !is_eligible(&account, now) {
                continue;
            }
            if self.store.account_actions_since(account.id, midnight).await? < cap {
                under_quota.push(account);
            }
        }
        Ok(select_account(&under_quota, now).cloned())
    }

    /// Run one step of the chain. Returns false when the rest of the
    /// chain must be abandoned.
    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        assignment: &HerderAssignment,
        account: &Account,
        settings: &TenantSettings,
        channel: &str,
        post: &common::ChannelPost,
        step: &ActionStep,
        allow_comment: bool,
    ) -> Result<bool> {
        let now = Utc::now();
        match step.kind {
            ActionKind::Read | ActionKind::Save => {
                // No API surface for these; the log is the observable effect.
                self.store
                    .log_herder_action(
                        assignment.id,
                        account.id,
                        kind_name(step.kind),
                        "success",
                        serde_json::json!({ "post_id": post.id }),
                        now,
                    )
                    .await?;
                self.store.bump_assignment_actions(assignment.id, 0).await?;
                Ok(true)
            }
            ActionKind::React => {
                let emoji = {
                    let mut rng = thread_rng();
                    step.emoji
                        .choose(&mut rng)
                        .cloned()
                        .unwrap_or_else(|| {
                            DEFAULT_REACTIONS.choose(&mut rng).unwrap_or(&"👍").to_string()
                        })
                };
                let lease = self.sessions.acquire(account).await.map_err(common::Error::from)?;
                let outcome = lease.send_reaction(channel, post.id, &emoji).await;
                drop(lease);
                self.settle_action(assignment, account, settings, "react", post.id, outcome.map(|_| 0), &emoji)
                    .await
            }
            ActionKind::Comment => {
                if !allow_comment {
                    debug!(assignment = assignment.id, "daily comment cap reached");
                    return Ok(true);
                }
                let Some(text) = self.generate_comment(assignment, account, settings, post).await? else {
                    return Ok(true);
                };
                let lease = self.sessions.acquire(account).await.map_err(common::Error::from)?;
                let outcome = lease.send_comment(channel, post.id, &text).await;
                drop(lease);
                let commented = outcome.is_ok();
                let keep_going = self
                    .settle_action(assignment, account, settings, "comment", post.id, outcome.map(|_| 1), &text)
                    .await?;
                if commented && assignment.coordinate_discussions {
                    self.coordinate_follow_up(assignment, account, settings, channel, post)
                        .await?;
                }
                Ok(keep_going)
            }
        }
    }

    /// Shared outcome handling for API-backed steps.
    async fn settle_action(
        &self,
        assignment: &HerderAssignment,
        account: &Account,
        settings: &TenantSettings,
        kind: &str,
        post_id: i32,
        outcome: std::result::Result<i64, TgError>,
        detail: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        match outcome {
            Ok(comments) => {
                self.sessions.note_success(account, settings, now).await?;
                self.store
                    .log_herder_action(
                        assignment.id,
                        account.id,
                        kind,
                        "success",
                        serde_json::json!({ "post_id": post_id, "detail": detail }),
                        now,
                    )
                    .await?;
                self.store.bump_assignment_actions(assignment.id, comments).await?;
                Ok(true)
            }
            Err(TgError::InvalidReaction) => {
                // Post simply does not allow this emoji; keep the chain.
                self.store
                    .log_herder_action(
                        assignment.id,
                        account.id,
                        kind,
                        "failed",
                        serde_json::json!({ "post_id": post_id, "error": "invalid_reaction" }),
                        now,
                    )
                    .await?;
                Ok(true)
            }
            Err(e @ TgError::FloodWait { .. }) => {
                self.sessions.note_failure(account, &e, settings, now).await?;
                self.store
                    .log_herder_action(
                        assignment.id,
                        account.id,
                        kind,
                        "failed",
                        serde_json::json!({ "post_id": post_id, "error": e.to_string() }),
                        now,
                    )
                    .await?;
                Ok(false)
            }
            Err(e) => {
                self.sessions.note_failure(account, &e, settings, now).await?;
                self.store
                    .log_herder_action(
                        assignment.id,
                        account.id,
                        kind,
                        "failed",
                        serde_json::json!({ "post_id": post_id, "error": e.to_string() }),
                        now,
                    )
                    .await?;
                self.store
                    .log_error(
                        assignment.tenant,
                        "herder",
                        Some(assignment.id),
                        kind,
                        &e.to_string(),
                        now,
                    )
                    .await?;
                Ok(false)
            }
        }
    }

    /// Coordinated discussions: after a successful comment, a second
    /// account from the same assignment chimes in under the same post.
    async fn coordinate_follow_up(
        &self,
        assignment: &HerderAssignment,
        first: &Account,
        settings: &TenantSettings,
        channel: &str,
        post: &common::ChannelPost,
    ) -> Result<()> {
        let now = Utc::now();
        let second = self
            .store
            .accounts_by_ids(&assignment.account_ids)
            .await?
            .into_iter()
            .find(|a| a.id != first.id && is_eligible(a, now));
        let Some(second) = second else { return Ok(()) };

        let Some(text) = self.generate_comment(assignment, &second, settings, post).await? else {
            return Ok(());
        };
        let lease = self.sessions.acquire(&second).await.map_err(common::Error::from)?;
        let outcome = lease.send_comment(channel, post.id, &text).await;
        drop(lease);
        self.settle_action(assignment, &second, settings, "comment", post.id, outcome.map(|_| 1), &text)
            .await?;
        Ok(())
    }

    /// LLM-generated comment with a static fallback, filtered against
    /// the tenant's bad-phrase list. None means the step was skipped.
    async fn generate_comment(
        &self,
        assignment: &HerderAssignment,
        account: &Account,
        settings: &TenantSettings,
        post: &common::ChannelPost,
    ) -> Result<Option<String>> {
        let text = match &settings.llm {
            Some(creds) => {
                let persona = self
                    .store
                    .account_profile(account.id)
                    .await?
                    .map(|p| p.persona)
                    .unwrap_or_else(|| "a regular subscriber".to_string());
                let prompt = format!(
                    "You are {} reading a Telegram channel. Write one short, natural comment \
                     (max {} characters) in the voice of a {:?}-style participant, reacting to \
                     this post:\n\n{}",
                    persona,
                    creds.max_response_length,
                    assignment.strategy,
                    post.text.chars().take(200).collect::<String>()
                );
                match self.llm.generate(creds, &prompt, 120, 0.9).await {
                    Ok(mut text) => {
                        text.truncate(creds.max_response_length);
                        text
                    }
                    Err(e) => {
                        debug!(error = %e, "comment generation unavailable, using phrase bank");
                        self.fallback_comment(assignment.strategy)
                    }
                }
            }
            None => self.fallback_comment(assignment.strategy),
        };

        let lowered = text.to_lowercase();
        for phrase in self.store.bad_phrases(assignment.tenant).await? {
            if lowered.contains(&phrase.to_lowercase()) {
                self.store
                    .log_herder_action(
                        assignment.id,
                        account.id,
                        "comment",
                        "filtered",
                        serde_json::json!({ "post_id": post.id, "phrase": phrase }),
                        Utc::now(),
                    )
                    .await?;
                return Ok(None);
            }
        }
        Ok(Some(text))
    }

    fn fallback_comment(&self, strategy: HerderStrategy) -> String {
        let mut rng = thread_rng();
        phrase_bank(strategy)
            .choose(&mut rng)
            .unwrap_or(&"👍")
            .to_string()
    }
}

/// Post selection by strategy over the latest window.
fn select_post<'a>(
    posts: &'a [common::ChannelPost],
    strategy: HerderStrategy,
    rng: &mut impl Rng,
) -> &'a common::ChannelPost {
    match strategy {
        HerderStrategy::Trendsetter => &posts[0],
        HerderStrategy::Expert => posts
            .iter()
            .min_by_key(|p| p.replies)
            .expect("posts checked non-empty"),
        HerderStrategy::Support => posts
            .iter()
            .max_by_key(|p| p.views)
            .expect("posts checked non-empty"),
        HerderStrategy::Observer | HerderStrategy::Community => {
            posts.choose(rng).expect("posts checked non-empty")
        }
    }
}

#[async_trait]
impl Worker for HerderWorker {
    fn name(&self) -> &'static str {
        "herder_worker"
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        for assignment in self.store.active_assignments(now).await? {
            if self.store.is_tenant_paused(assignment.tenant, now).await? {
                continue;
            }
            let settings = self.store.tenant_settings(assignment.tenant).await?;
            if let Err(e) = self.process_assignment(&assignment, &settings).await {
                error!(assignment = assignment.id, error = %e, "herder assignment failed");
                self.store
                    .log_error(
                        assignment.tenant,
                        "herder",
                        Some(assignment.id),
                        "tick",
                        &e.to_string(),
                        Utc::now(),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn kind_name(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Read => "read",
        ActionKind::React => "react",
        ActionKind::Comment => "comment",
        ActionKind::Save => "save",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posts() -> Vec<common::ChannelPost> {
        vec![
            sim_post(1, 100, 5),
            sim_post(2, 500, 0),
            sim_post(3, 50, 12),
        ]
    }

    fn sim_post(id: i32, views: i64, replies: i64) -> common::ChannelPost {
        common::ChannelPost {
            id,
            text: format!("post {id}"),
            date: Utc::now(),
            views,
            replies,
            has_media: false,
        }
    }

    #[test]
    fn strategies_pick_the_documented_post() {
        let posts = posts();
        let mut rng = thread_rng();
        assert_eq!(select_post(&posts, HerderStrategy::Trendsetter, &mut rng).id, 1);
        assert_eq!(select_post(&posts, HerderStrategy::Expert, &mut rng).id, 2);
        assert_eq!(select_post(&posts, HerderStrategy::Support, &mut rng).id, 2);
        let picked = select_post(&posts, HerderStrategy::Observer, &mut rng).id;
        assert!((1..=3).contains(&picked));
    }
}
