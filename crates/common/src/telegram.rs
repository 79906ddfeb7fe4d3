use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TgError;

/// Address of a message target. Prefer `username` when present; the raw
/// id + access hash pair is enough for peers seen during parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub telegram_id: i64,
    pub access_hash: Option<i64>,
    pub username: Option<String>,
}

impl PeerRef {
    pub fn from_username(username: impl Into<String>) -> Self {
        Self {
            telegram_id: 0,
            access_hash: None,
            username: Some(username.into()),
        }
    }
}

/// A recent channel post, as much as the herder needs for selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPost {
    pub id: i32,
    pub text: String,
    pub date: DateTime<Utc>,
    pub views: i64,
    pub replies: i64,
    pub has_media: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub telegram_id: i64,
    pub access_hash: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_bot: bool,
    pub is_premium: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// One connected account session. Every call returns the uniform
/// [`TgError`] taxonomy; callers never see vendor error types.
///
/// Only the session manager hands these out, and only inside a lease —
/// workers must not hold a session across ticks.
#[async_trait]
pub trait TelegramSession: Send + Sync {
    /// Send a direct message. `typing` simulates composing for the given
    /// duration before the send; it does not count toward pacing delays.
    async fn send_message(
        &self,
        peer: &PeerRef,
        text: &str,
        media: Option<&str>,
        typing: Option<Duration>,
    ) -> Result<i32, TgError>;

    /// Join a public channel by username or a private one by invite link.
    async fn join_channel(&self, channel: &str) -> Result<(), TgError>;

    async fn channel_posts(&self, channel: &str, limit: usize) -> Result<Vec<ChannelPost>, TgError>;

    async fn channel_participants(
        &self,
        channel: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ParticipantInfo>, TgError>;

    async fn send_reaction(&self, channel: &str, message_id: i32, emoji: &str)
        -> Result<(), TgError>;

    /// Comment under a channel post via its discussion group.
    async fn send_comment(&self, channel: &str, message_id: i32, text: &str)
        -> Result<i32, TgError>;

    /// Post into a channel the account can write to.
    async fn publish(&self, channel: &str, text: &str, media: Option<&str>)
        -> Result<i32, TgError>;
}

/// Opens and authorizes account sessions. The live implementation talks
/// MTProto and persists one session blob per account; the sim
/// implementation scripts outcomes for tests.
#[async_trait]
pub trait TelegramConnector: Send + Sync {
    /// Get a connected, authorized session for the account, reusing a
    /// cached client when it is still healthy.
    async fn open(
        &self,
        account_id: i64,
        phone: &str,
        proxy: Option<&str>,
    ) -> Result<Arc<dyn TelegramSession>, TgError>;

    /// Begin interactive login: request a code, return an opaque ticket
    /// for [`confirm_code`]. Tickets are process-local.
    async fn request_code(
        &self,
        account_id: i64,
        phone: &str,
        proxy: Option<&str>,
    ) -> Result<Uuid, TgError>;

    /// Finish login with the received code, falling back to the 2FA
    /// password when the account has one set.
    async fn confirm_code(
        &self,
        ticket: Uuid,
        code: &str,
        password: Option<&str>,
    ) -> Result<AuthorizedUser, TgError>;

    /// Drop the cached client for one account.
    async fn close(&self, account_id: i64);

    /// Best-effort shutdown of every cached client.
    async fn close_all(&self);
}
