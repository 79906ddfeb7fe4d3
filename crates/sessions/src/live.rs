//! MTProto connector backed by grammers. One session blob per account
//! under the sessions directory; `flood_sleep_threshold` is zero so
//! FLOOD_WAIT surfaces as an error and drives our own cooldown logic
//! instead of sleeping inside the client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use grammers_client::types::LoginToken;
use grammers_client::{Client, Config, InitParams, InputMessage, InvocationError, SignInError};
use grammers_session::{PackedChat, PackedType, Session};
use grammers_tl_types as tl;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::{
    mask_phone, AuthorizedUser, ChannelPost, ParticipantInfo, PeerRef, TelegramConnector,
    TelegramSession, TgError,
};

pub struct LiveConnector {
    api_id: i32,
    api_hash: String,
    sessions_dir: PathBuf,
    clients: Mutex<HashMap<i64, Client>>,
    pending: Mutex<HashMap<Uuid, PendingLogin>>,
}

struct PendingLogin {
    client: Client,
    token: LoginToken,
    session_path: PathBuf,
}

impl LiveConnector {
    pub fn new(api_id: i32, api_hash: impl Into<String>, sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_id,
            api_hash: api_hash.into(),
            sessions_dir: sessions_dir.into(),
            clients: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn session_path(&self, account_id: i64) -> PathBuf {
        self.sessions_dir.join(format!("account_{account_id}.session"))
    }

    async fn connect_client(&self, path: &Path, proxy: Option<&str>) -> Result<Client, TgError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| TgError::Unreachable(e.to_string()))?;
        }
        let session =
            Session::load_file_or_create(path).map_err(|e| TgError::Unreachable(e.to_string()))?;
        let params = InitParams {
            device_model: "Desktop".to_string(),
            system_version: "Windows 10".to_string(),
            app_version: "4.0.0".to_string(),
            // FLOOD_WAIT must reach us as an error, never an in-client sleep.
            flood_sleep_threshold: 0,
            proxy_url: proxy.map(str::to_string),
            ..Default::default()
        };
        Client::connect(Config {
            session,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            params,
        })
        .await
        .map_err(|e| TgError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl TelegramConnector for LiveConnector {
    async fn open(
        &self,
        account_id: i64,
        phone: &str,
        proxy: Option<&str>,
    ) -> Result<Arc<dyn TelegramSession>, TgError> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(&account_id) {
            match client.is_authorized().await {
                Ok(true) => {
                    return Ok(Arc::new(LiveSession::new(client.clone(), self.session_path(account_id))));
                }
                Ok(false) => {
                    clients.remove(&account_id);
                    return Err(TgError::NotAuthorized);
                }
                Err(e) => {
                    debug!(account = account_id, error = %e, "cached client unhealthy, reconnecting");
                    clients.remove(&account_id);
                }
            }
        }

        let path = self.session_path(account_id);
        let client = self.connect_client(&path, proxy).await?;
        let authorized = client
            .is_authorized()
            .await
            .map_err(|e| TgError::Network(e.to_string()))?;
        if !authorized {
            return Err(TgError::NotAuthorized);
        }
        if let Err(e) = client.session().save_to_file(&path) {
            warn!(account = account_id, error = %e, "failed to persist session blob");
        }
        info!(account = account_id, phone = %mask_phone(phone), "client ready");
        clients.insert(account_id, client.clone());
        Ok(Arc::new(LiveSession::new(client, path)))
    }

    async fn request_code(
        &self,
        account_id: i64,
        phone: &str,
        proxy: Option<&str>,
    ) -> Result<Uuid, TgError> {
        let path = self.session_path(account_id);
        let client = self.connect_client(&path, proxy).await?;
        let token = match client.request_login_code(phone).await {
            Ok(token) => token,
            Err(e) => return Err(classify(e)),
        };
        let ticket = Uuid::new_v4();
        self.pending.lock().await.insert(
            ticket,
            PendingLogin {
                client,
                token,
                session_path: path,
            },
        );
        info!(phone = %mask_phone(phone), "login code requested");
        Ok(ticket)
    }

    async fn confirm_code(
        &self,
        ticket: Uuid,
        code: &str,
        password: Option<&str>,
    ) -> Result<AuthorizedUser, TgError> {
        let pending = self
            .pending
            .lock()
            .await
            .remove(&ticket)
            .ok_or(TgError::CodeExpired)?;

        let user = match pending.client.sign_in(&pending.token, code).await {
            Ok(user) => user,
            Err(SignInError::PasswordRequired(password_token)) => {
                let Some(password) = password else {
                    return Err(TgError::PasswordNeeded);
                };
                match pending.client.check_password(password_token, password).await {
                    Ok(user) => user,
                    Err(SignInError::InvalidPassword) => return Err(TgError::InvalidPassword),
                    Err(e) => return Err(TgError::Other(e.to_string())),
                }
            }
            Err(SignInError::InvalidCode) => return Err(TgError::InvalidCode),
            Err(SignInError::SignUpRequired { .. }) => {
                return Err(TgError::Other("phone has no Telegram account".into()))
            }
            Err(SignInError::InvalidPassword) => return Err(TgError::InvalidPassword),
            Err(SignInError::Other(e)) => return Err(classify(e)),
        };

        if let Err(e) = pending.client.session().save_to_file(&pending.session_path) {
            warn!(error = %e, "failed to persist session blob after sign-in");
        }

        Ok(AuthorizedUser {
            telegram_id: user.id(),
            username: user.username().map(str::to_string),
            first_name: user.first_name().map(str::to_string),
            last_name: user.last_name().map(str::to_string),
        })
    }

    async fn close(&self, account_id: i64) {
        self.clients.lock().await.remove(&account_id);
    }

    async fn close_all(&self) {
        self.clients.lock().await.clear();
    }
}

struct LiveSession {
    client: Client,
    session_path: PathBuf,
    /// Username → packed peer, to avoid re-resolving per call.
    resolve_cache: Mutex<HashMap<String, PackedChat>>,
}

impl LiveSession {
    fn new(client: Client, session_path: PathBuf) -> Self {
        Self {
            client,
            session_path,
            resolve_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(&self, username: &str) -> Result<PackedChat, TgError> {
        let username = username.trim_start_matches('@');
        if let Some(packed) = self.resolve_cache.lock().await.get(username) {
            return Ok(*packed);
        }
        let chat = self
            .client
            .resolve_username(username)
            .await
            .map_err(classify)?
            .ok_or(TgError::UserNotFound)?;
        let packed = chat.pack();
        self.resolve_cache
            .lock()
            .await
            .insert(username.to_string(), packed);
        Ok(packed)
    }

    async fn packed_peer(&self, peer: &PeerRef) -> Result<PackedChat, TgError> {
        if let Some(username) = &peer.username {
            return self.resolve(username).await;
        }
        if peer.telegram_id == 0 {
            return Err(TgError::InvalidPeer);
        }
        Ok(PackedChat {
            ty: PackedType::User,
            id: peer.telegram_id,
            access_hash: peer.access_hash,
        })
    }

    fn save_session(&self) {
        if let Err(e) = self.client.session().save_to_file(&self.session_path) {
            warn!(error = %e, "failed to persist session blob");
        }
    }
}

#[async_trait]
impl TelegramSession for LiveSession {
    async fn send_message(
        &self,
        peer: &PeerRef,
        text: &str,
        media: Option<&str>,
        typing: Option<Duration>,
    ) -> Result<i32, TgError> {
        let packed = self.packed_peer(peer).await?;

        if let Some(duration) = typing {
            tokio::time::sleep(duration).await;
        }

        let message = match media {
            Some(path) if Path::new(path).exists() => {
                let uploaded = self
                    .client
                    .upload_file(path)
                    .await
                    .map_err(|e| TgError::Network(e.to_string()))?;
                InputMessage::text(text).document(uploaded)
            }
            _ => InputMessage::text(text),
        };

        let sent = self
            .client
            .send_message(packed, message)
            .await
            .map_err(classify)?;
        self.save_session();
        Ok(sent.id())
    }

    async fn join_channel(&self, channel: &str) -> Result<(), TgError> {
        if let Some(hash) = invite_hash(channel) {
            match self
                .client
                .invoke(&tl::functions::messages::ImportChatInvite { hash })
                .await
            {
                Ok(_) => return Ok(()),
                Err(InvocationError::Rpc(rpc))
                    if rpc.name == "USER_ALREADY_PARTICIPANT" || rpc.name == "ALREADY_PARTICIPANT" =>
                {
                    return Ok(())
                }
                Err(e) => return Err(classify(e)),
            }
        }
        let packed = self.resolve(channel).await?;
        match self.client.join_chat(packed).await {
            Ok(_) => Ok(()),
            Err(InvocationError::Rpc(rpc)) if rpc.name == "USER_ALREADY_PARTICIPANT" => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn channel_posts(&self, channel: &str, limit: usize) -> Result<Vec<ChannelPost>, TgError> {
        let packed = self.resolve(channel).await?;
        let result = self
            .client
            .invoke(&tl::functions::messages::GetHistory {
                peer: packed.to_input_peer(),
                offset_id: 0,
                offset_date: 0,
                add_offset: 0,
                limit: limit as i32,
                max_id: 0,
                min_id: 0,
                hash: 0,
            })
            .await
            .map_err(classify)?;

        let raw_messages = match result {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            tl::enums::messages::Messages::NotModified(_) => Vec::new(),
        };

        let posts = raw_messages
            .into_iter()
            .filter_map(|m| match m {
                tl::enums::Message::Message(m) => Some(ChannelPost {
                    id: m.id,
                    text: m.message.clone(),
                    date: Utc.timestamp_opt(m.date as i64, 0).single().unwrap_or_else(Utc::now),
                    views: m.views.unwrap_or(0) as i64,
                    replies: m
                        .replies
                        .as_ref()
                        .map(|r| {
                            let tl::enums::MessageReplies::Replies(r) = r;
                            r.replies as i64
                        })
                        .unwrap_or(0),
                    has_media: m.media.is_some(),
                }),
                _ => None,
            })
            .collect();
        Ok(posts)
    }

    async fn channel_participants(
        &self,
        channel: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ParticipantInfo>, TgError> {
        let packed = self.resolve(channel).await?;
        let mut iter = self.client.iter_participants(packed).limit(offset + limit);
        let mut out = Vec::new();
        let mut skipped = 0usize;
        while let Some(participant) = iter.next().await.map_err(classify)? {
            if skipped < offset {
                skipped += 1;
                continue;
            }
            let user = participant.user;
            let packed_user = user.pack();
            out.push(ParticipantInfo {
                telegram_id: user.id(),
                access_hash: packed_user.access_hash,
                username: user.username().map(str::to_string),
                first_name: user.first_name().map(str::to_string),
                last_name: user.last_name().map(str::to_string),
                is_bot: user.is_bot(),
                is_premium: false,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn send_reaction(
        &self,
        channel: &str,
        message_id: i32,
        emoji: &str,
    ) -> Result<(), TgError> {
        let packed = self.resolve(channel).await?;
        self.client
            .invoke(&tl::functions::messages::SendReaction {
                peer: packed.to_input_peer(),
                msg_id: message_id,
                big: false,
                add_to_recent: false,
                reaction: Some(vec![tl::enums::Reaction::Emoji(tl::types::ReactionEmoji {
                    emoticon: emoji.to_string(),
                })]),
            })
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn send_comment(
        &self,
        channel: &str,
        message_id: i32,
        text: &str,
    ) -> Result<i32, TgError> {
        let packed = self.resolve(channel).await?;
        let discussion = self
            .client
            .invoke(&tl::functions::messages::GetDiscussionMessage {
                peer: packed.to_input_peer(),
                msg_id: message_id,
            })
            .await
            .map_err(classify)?;

        let tl::enums::messages::DiscussionMessage::DiscussionMessage(discussion) = discussion;

        let reply_to = discussion
            .messages
            .first()
            .and_then(|m| match m {
                tl::enums::Message::Message(m) => Some(m.id),
                _ => None,
            })
            .ok_or(TgError::WriteForbidden)?;

        let group = discussion
            .chats
            .iter()
            .find_map(|c| match c {
                tl::enums::Chat::Channel(ch) => Some(PackedChat {
                    ty: if ch.megagroup {
                        PackedType::Megagroup
                    } else {
                        PackedType::Broadcast
                    },
                    id: ch.id,
                    access_hash: ch.access_hash,
                }),
                _ => None,
            })
            .ok_or(TgError::WriteForbidden)?;

        let sent = self
            .client
            .send_message(group, InputMessage::text(text).reply_to(Some(reply_to)))
            .await
            .map_err(classify)?;
        Ok(sent.id())
    }

    async fn publish(&self, channel: &str, text: &str, media: Option<&str>) -> Result<i32, TgError> {
        let packed = self.resolve(channel).await?;
        let message = match media {
            Some(path) if Path::new(path).exists() => {
                let uploaded = self
                    .client
                    .upload_file(path)
                    .await
                    .map_err(|e| TgError::Network(e.to_string()))?;
                InputMessage::text(text).document(uploaded)
            }
            _ => InputMessage::text(text),
        };
        let sent = self
            .client
            .send_message(packed, message)
            .await
            .map_err(classify)?;
        Ok(sent.id())
    }
}

/// Extract the hash from a private invite link, if the string is one.
fn invite_hash(channel: &str) -> Option<String> {
    if let Some(rest) = channel.rsplit_once("joinchat/").map(|(_, h)| h) {
        return Some(rest.trim_matches('/').to_string());
    }
    if let Some(rest) = channel.rsplit_once('+').map(|(_, h)| h) {
        if channel.contains("t.me/") || channel.starts_with('+') {
            return Some(rest.trim_matches('/').to_string());
        }
    }
    None
}

/// Map a raw invocation error onto the uniform taxonomy.
fn classify(error: InvocationError) -> TgError {
    match error {
        InvocationError::Rpc(rpc) => match rpc.name.as_str() {
            "FLOOD_WAIT" | "FLOOD_PREMIUM_WAIT" => TgError::FloodWait {
                seconds: rpc.value.unwrap_or(300),
            },
            "USER_PRIVACY_RESTRICTED" => TgError::PrivacyRestricted,
            "USER_IS_BLOCKED" | "YOU_BLOCKED_USER" => TgError::UserBlocked,
            "PEER_FLOOD" => TgError::PeerFlood,
            "CHAT_WRITE_FORBIDDEN" | "CHAT_GUEST_SEND_FORBIDDEN" => TgError::WriteForbidden,
            "PEER_ID_INVALID" | "CHANNEL_INVALID" | "CHANNEL_PRIVATE" => TgError::InvalidPeer,
            "USERNAME_NOT_OCCUPIED" | "USERNAME_INVALID" | "USER_ID_INVALID" => {
                TgError::UserNotFound
            }
            "PHONE_CODE_INVALID" => TgError::InvalidCode,
            "PHONE_CODE_EXPIRED" => TgError::CodeExpired,
            "SESSION_PASSWORD_NEEDED" => TgError::PasswordNeeded,
            "PASSWORD_HASH_INVALID" => TgError::InvalidPassword,
            "AUTH_KEY_UNREGISTERED" | "SESSION_REVOKED" | "USER_DEACTIVATED" => {
                TgError::NotAuthorized
            }
            "REACTION_INVALID" => TgError::InvalidReaction,
            "MSG_ID_INVALID" => TgError::InvalidPeer,
            _ => TgError::Other(format!("{} (code {})", rpc.name, rpc.code)),
        },
        other => TgError::Network(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_links_are_detected() {
        assert_eq!(
            invite_hash("https://t.me/joinchat/AbCdEf123").as_deref(),
            Some("AbCdEf123")
        );
        assert_eq!(invite_hash("https://t.me/+AbCdEf123").as_deref(), Some("AbCdEf123"));
        assert_eq!(invite_hash("somechannel"), None);
        assert_eq!(invite_hash("@somechannel"), None);
    }
}
