//! Scripted loopback Telegram connector.
//!
//! Plays the role the live MTProto connector plays in production, with
//! every outcome controllable from tests: queue an error for the next
//! call of a given kind on a given account, seed channel posts, script
//! login flows. Calls are recorded for assertions. With nothing
//! scripted every call succeeds, so the worker loops can run end-to-end
//! against an in-memory store without touching the network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use common::{
    AuthorizedUser, ChannelPost, ParticipantInfo, PeerRef, TelegramConnector, TelegramSession,
    TgError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Send,
    Join,
    Posts,
    Participants,
    React,
    Comment,
    Publish,
}

/// One recorded call against the sim.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub account_id: i64,
    pub kind: CallKind,
    /// Username or telegram id of the target peer/channel.
    pub target: String,
    pub text: String,
}

struct LoginScript {
    code: String,
    password: Option<String>,
    user: AuthorizedUser,
}

struct PendingLogin {
    phone: String,
}

#[derive(Default)]
struct State {
    outcomes: HashMap<(i64, CallKind), VecDeque<Result<i32, TgError>>>,
    calls: Vec<RecordedCall>,
    posts: HashMap<String, Vec<ChannelPost>>,
    participants: HashMap<String, Vec<ParticipantInfo>>,
    open_failures: HashMap<i64, TgError>,
    logins: HashMap<String, LoginScript>,
    pending: HashMap<Uuid, PendingLogin>,
    open_count: HashMap<i64, usize>,
}

/// Shared handle; clone freely between the connector, sessions, and the
/// test body.
#[derive(Clone, Default)]
pub struct SimConnector {
    state: Arc<Mutex<State>>,
    next_msg_id: Arc<AtomicI32>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next call of `kind` on `account_id`.
    /// Unscripted calls succeed.
    pub fn script(&self, account_id: i64, kind: CallKind, outcome: Result<i32, TgError>) {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .entry((account_id, kind))
            .or_default()
            .push_back(outcome);
    }

    pub fn script_send_error(&self, account_id: i64, error: TgError) {
        self.script(account_id, CallKind::Send, Err(error));
    }

    /// Make `open` fail for the account (e.g. a dead session blob).
    pub fn fail_open(&self, account_id: i64, error: TgError) {
        self.state.lock().unwrap().open_failures.insert(account_id, error);
    }

    pub fn seed_posts(&self, channel: &str, posts: Vec<ChannelPost>) {
        self.state.lock().unwrap().posts.insert(channel.to_string(), posts);
    }

    pub fn seed_participants(&self, channel: &str, participants: Vec<ParticipantInfo>) {
        self.state
            .lock()
            .unwrap()
            .participants
            .insert(channel.to_string(), participants);
    }

    /// Script an interactive login: the code the "SMS" will carry and
    /// the optional 2FA password.
    pub fn script_login(&self, phone: &str, code: &str, password: Option<&str>, user: AuthorizedUser) {
        self.state.lock().unwrap().logins.insert(
            phone.to_string(),
            LoginScript {
                code: code.to_string(),
                password: password.map(str::to_string),
                user,
            },
        );
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    pub fn sends_to(&self, target: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.kind == CallKind::Send && c.target == target)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    fn record(&self, account_id: i64, kind: CallKind, target: &str, text: &str) {
        self.state.lock().unwrap().calls.push(RecordedCall {
            account_id,
            kind,
            target: target.to_string(),
            text: text.to_string(),
        });
    }

    fn take_outcome(&self, account_id: i64, kind: CallKind) -> Result<i32, TgError> {
        let scripted = self
            .state
            .lock()
            .unwrap()
            .outcomes
            .get_mut(&(account_id, kind))
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| Ok(self.next_msg_id.fetch_add(1, Ordering::SeqCst)))
    }
}

#[async_trait]
impl TelegramConnector for SimConnector {
    async fn open(
        &self,
        account_id: i64,
        _phone: &str,
        _proxy: Option<&str>,
    ) -> Result<Arc<dyn TelegramSession>, TgError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.open_failures.get(&account_id) {
                return Err(err.clone());
            }
            *state.open_count.entry(account_id).or_default() += 1;
        }
        Ok(Arc::new(SimSession {
            connector: self.clone(),
            account_id,
        }))
    }

    async fn request_code(
        &self,
        _account_id: i64,
        phone: &str,
        _proxy: Option<&str>,
    ) -> Result<Uuid, TgError> {
        let mut state = self.state.lock().unwrap();
        if !state.logins.contains_key(phone) {
            return Err(TgError::Unreachable("no login scripted".into()));
        }
        let ticket = Uuid::new_v4();
        state.pending.insert(
            ticket,
            PendingLogin {
                phone: phone.to_string(),
            },
        );
        Ok(ticket)
    }

    async fn confirm_code(
        &self,
        ticket: Uuid,
        code: &str,
        password: Option<&str>,
    ) -> Result<AuthorizedUser, TgError> {
        let mut state = self.state.lock().unwrap();
        let pending = state.pending.remove(&ticket).ok_or(TgError::CodeExpired)?;
        let script = state
            .logins
            .get(&pending.phone)
            .ok_or(TgError::CodeExpired)?;
        if script.code != code {
            return Err(TgError::InvalidCode);
        }
        match (&script.password, password) {
            (Some(_), None) => Err(TgError::PasswordNeeded),
            (Some(expected), Some(given)) if expected != given => Err(TgError::InvalidPassword),
            _ => Ok(script.user.clone()),
        }
    }

    async fn close(&self, account_id: i64) {
        self.state.lock().unwrap().open_count.remove(&account_id);
    }

    async fn close_all(&self) {
        self.state.lock().unwrap().open_count.clear();
    }
}

struct SimSession {
    connector: SimConnector,
    account_id: i64,
}

fn peer_key(peer: &PeerRef) -> String {
    peer.username
        .clone()
        .unwrap_or_else(|| peer.telegram_id.to_string())
}

#[async_trait]
impl TelegramSession for SimSession {
    async fn send_message(
        &self,
        peer: &PeerRef,
        text: &str,
        _media: Option<&str>,
        typing: Option<Duration>,
    ) -> Result<i32, TgError> {
        if let Some(d) = typing {
            tokio::time::sleep(d).await;
        }
        let outcome = self.connector.take_outcome(self.account_id, CallKind::Send);
        if outcome.is_ok() {
            self.connector
                .record(self.account_id, CallKind::Send, &peer_key(peer), text);
        }
        outcome
    }

    async fn join_channel(&self, channel: &str) -> Result<(), TgError> {
        let outcome = self.connector.take_outcome(self.account_id, CallKind::Join);
        if outcome.is_ok() {
            self.connector.record(self.account_id, CallKind::Join, channel, "");
        }
        outcome.map(|_| ())
    }

    async fn channel_posts(&self, channel: &str, limit: usize) -> Result<Vec<ChannelPost>, TgError> {
        self.connector
            .take_outcome(self.account_id, CallKind::Posts)?;
        self.connector.record(self.account_id, CallKind::Posts, channel, "");
        let posts = self
            .connector
            .state
            .lock()
            .unwrap()
            .posts
            .get(channel)
            .cloned()
            .unwrap_or_default();
        Ok(posts.into_iter().take(limit).collect())
    }

    async fn channel_participants(
        &self,
        channel: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ParticipantInfo>, TgError> {
        self.connector
            .take_outcome(self.account_id, CallKind::Participants)?;
        self.connector
            .record(self.account_id, CallKind::Participants, channel, "");
        let all = self
            .connector
            .state
            .lock()
            .unwrap()
            .participants
            .get(channel)
            .cloned()
            .unwrap_or_default();
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn send_reaction(
        &self,
        channel: &str,
        message_id: i32,
        emoji: &str,
    ) -> Result<(), TgError> {
        let outcome = self.connector.take_outcome(self.account_id, CallKind::React);
        if outcome.is_ok() {
            self.connector.record(
                self.account_id,
                CallKind::React,
                &format!("{channel}/{message_id}"),
                emoji,
            );
        }
        outcome.map(|_| ())
    }

    async fn send_comment(
        &self,
        channel: &str,
        message_id: i32,
        text: &str,
    ) -> Result<i32, TgError> {
        let outcome = self.connector.take_outcome(self.account_id, CallKind::Comment);
        if outcome.is_ok() {
            self.connector.record(
                self.account_id,
                CallKind::Comment,
                &format!("{channel}/{message_id}"),
                text,
            );
        }
        outcome
    }

    async fn publish(&self, channel: &str, text: &str, _media: Option<&str>) -> Result<i32, TgError> {
        let outcome = self.connector.take_outcome(self.account_id, CallKind::Publish);
        if outcome.is_ok() {
            self.connector
                .record(self.account_id, CallKind::Publish, channel, text);
        }
        outcome
    }
}

/// Build a post for seeding.
pub fn post(id: i32, text: &str, views: i64, replies: i64) -> ChannelPost {
    ChannelPost {
        id,
        text: text.to_string(),
        date: chrono::Utc::now(),
        views,
        replies,
        has_media: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: i64) -> PeerRef {
        PeerRef {
            telegram_id: id,
            access_hash: None,
            username: None,
        }
    }

    #[tokio::test]
    async fn unscripted_calls_succeed_and_are_recorded() {
        let sim = SimConnector::new();
        let session = sim.open(1, "+7900", None).await.unwrap();
        let id1 = session.send_message(&peer(10), "hi", None, None).await.unwrap();
        let id2 = session.send_message(&peer(11), "hi", None, None).await.unwrap();
        assert_ne!(id1, id2);
        assert_eq!(sim.sends_to("10"), 1);
        assert_eq!(sim.total_calls(), 2);
    }

    #[tokio::test]
    async fn scripted_errors_fire_in_order_then_default() {
        let sim = SimConnector::new();
        sim.script_send_error(1, TgError::FloodWait { seconds: 60 });
        let session = sim.open(1, "+7900", None).await.unwrap();

        let err = session.send_message(&peer(10), "hi", None, None).await.unwrap_err();
        assert_eq!(err, TgError::FloodWait { seconds: 60 });
        // Failed call is not recorded as a delivery.
        assert_eq!(sim.sends_to("10"), 0);

        assert!(session.send_message(&peer(10), "hi", None, None).await.is_ok());
    }

    #[tokio::test]
    async fn login_flow_with_2fa() {
        let sim = SimConnector::new();
        let user = AuthorizedUser {
            telegram_id: 777,
            username: Some("newbie".into()),
            first_name: None,
            last_name: None,
        };
        sim.script_login("+7900", "12345", Some("hunter2"), user);

        let ticket = sim.request_code(1, "+7900", None).await.unwrap();
        let err = sim.confirm_code(ticket, "12345", None).await.unwrap_err();
        assert_eq!(err, TgError::PasswordNeeded);

        let ticket = sim.request_code(1, "+7900", None).await.unwrap();
        let user = sim.confirm_code(ticket, "12345", Some("hunter2")).await.unwrap();
        assert_eq!(user.telegram_id, 777);
    }
}
