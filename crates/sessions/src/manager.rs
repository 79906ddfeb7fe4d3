use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use common::{
    mask_phone, Account, AuthorizedUser, Result, TelegramConnector, TelegramSession,
    TenantSettings, TgError,
};
use store::Store;

/// Cooldown applied on peer_flood, well beyond an ordinary flood wait.
const PEER_FLOOD_COOLDOWN_HOURS: i64 = 6;

/// Exclusive use of one account's client for the duration of a borrow.
/// Dropping the lease releases the per-account lock; the underlying
/// client stays connected for reuse.
pub struct SessionLease {
    account_id: i64,
    session: Arc<dyn TelegramSession>,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn account_id(&self) -> i64 {
        self.account_id
    }
}

impl std::ops::Deref for SessionLease {
    type Target = dyn TelegramSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

/// Owns the per-account client cache (via the connector) and the
/// per-account mutual exclusion. The only legitimate process-wide
/// mutable state; workers reach clients exclusively through
/// [`SessionManager::acquire`].
pub struct SessionManager {
    connector: Arc<dyn TelegramConnector>,
    store: Store,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn TelegramConnector>, store: Store) -> Self {
        Self {
            connector,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire an exclusive lease on the account's client. Blocks while
    /// another worker holds the lease rather than refusing.
    pub async fn acquire(&self, account: &Account) -> Result<SessionLease, TgError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(account.id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let guard = lock.lock_owned().await;
        let session = self
            .connector
            .open(account.id, &account.phone, account.proxy.as_deref())
            .await?;
        Ok(SessionLease {
            account_id: account.id,
            session,
            _guard: guard,
        })
    }

    /// Begin interactive login for a phone; returns the ticket to pass
    /// to [`complete_auth`]. Tickets do not survive a restart.
    pub async fn start_auth(
        &self,
        account_id: i64,
        phone: &str,
        proxy: Option<&str>,
    ) -> Result<Uuid, TgError> {
        info!(account = account_id, phone = %mask_phone(phone), "requesting login code");
        self.connector.request_code(account_id, phone, proxy).await
    }

    pub async fn complete_auth(
        &self,
        ticket: Uuid,
        code: &str,
        password: Option<&str>,
    ) -> Result<AuthorizedUser, TgError> {
        self.connector.confirm_code(ticket, code, password).await
    }

    pub async fn close_all(&self) {
        self.connector.close_all().await;
    }

    // ── Feedback rules ────────────────────────────────────────────────────
    //
    // Applied after every send/react/comment outcome. These are the only
    // code paths that mutate daily counters and reliability scores.

    /// Success: daily_sent += 1, streak cleared, reliability nudged up,
    /// hourly bucket credited.
    pub async fn note_success(
        &self,
        account: &Account,
        settings: &TenantSettings,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.apply_send_success(account.id).await?;
        let (dow, hour) = local_bucket(settings, now);
        self.store.record_send_stat(account.tenant, dow, hour, true).await?;
        Ok(())
    }

    /// Failure: mutate the account row according to the error class and
    /// return the new consecutive-error streak (0 when the class does
    /// not extend it).
    pub async fn note_failure(
        &self,
        account: &Account,
        error: &TgError,
        settings: &TenantSettings,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let (dow, hour) = local_bucket(settings, now);
        match error {
            TgError::FloodWait { seconds } => {
                let until = now + Duration::seconds(*seconds as i64);
                warn!(
                    account = account.id,
                    phone = %mask_phone(&account.phone),
                    seconds,
                    "flood wait — cooling account down"
                );
                self.store.apply_flood_wait(account.id, until).await?;
                self.store.record_flood_wait_stat(account.tenant, dow, hour).await?;
                Ok(0)
            }
            TgError::PeerFlood => {
                let until = now + Duration::hours(PEER_FLOOD_COOLDOWN_HOURS);
                warn!(
                    account = account.id,
                    phone = %mask_phone(&account.phone),
                    "peer flood — extended cooldown"
                );
                self.store.apply_peer_flood(account.id, until).await?;
                self.store.record_send_stat(account.tenant, dow, hour, false).await?;
                Ok(0)
            }
            TgError::PrivacyRestricted | TgError::UserBlocked => {
                // Recipient-side outcome; the sender keeps its score.
                self.store.record_send_stat(account.tenant, dow, hour, false).await?;
                Ok(0)
            }
            _ => {
                let streak = self.store.apply_transient_failure(account.id).await?;
                self.store.record_send_stat(account.tenant, dow, hour, false).await?;
                Ok(streak)
            }
        }
    }
}

/// (weekday, hour) of `now` in the tenant's timezone, Monday = 0.
fn local_bucket(settings: &TenantSettings, now: DateTime<Utc>) -> (i64, i64) {
    let local = settings.local(now);
    (
        local.weekday().num_days_from_monday() as i64,
        local.hour() as i64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AccountRole, AccountStatus};
    use sim::SimConnector;
    use std::time::Duration as StdDuration;

    async fn setup() -> (SessionManager, SimConnector, Store, Account) {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let id = store
            .insert_account(1, "+79011234455", AccountStatus::Active, AccountRole::Observer, 30)
            .await
            .unwrap();
        let account = store.account(id).await.unwrap().unwrap();
        let connector = SimConnector::new();
        let manager = SessionManager::new(Arc::new(connector.clone()), store.clone());
        (manager, connector, store, account)
    }

    #[tokio::test]
    async fn leases_serialize_access_per_account() {
        let (manager, _, _, account) = setup().await;
        let manager = Arc::new(manager);

        let first = manager.acquire(&account).await.unwrap();

        let m2 = manager.clone();
        let acc2 = account.clone();
        let contender = tokio::spawn(async move {
            let _lease = m2.acquire(&acc2).await.unwrap();
        });

        // The second acquire must block while the first lease is held.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(StdDuration::from_secs(1), contender)
            .await
            .expect("second acquire should proceed after release")
            .unwrap();
    }

    #[tokio::test]
    async fn flood_wait_feedback_sets_cooldown() {
        let (manager, _, store, account) = setup().await;
        let now = Utc::now();
        let settings = TenantSettings::default();

        manager
            .note_failure(&account, &TgError::FloodWait { seconds: 120 }, &settings, now)
            .await
            .unwrap();

        let acc = store.account(account.id).await.unwrap().unwrap();
        assert_eq!(acc.status, AccountStatus::FloodWait);
        let until = acc.flood_wait_until.unwrap();
        assert!((until - now).num_seconds() >= 119);
        assert!((acc.reliability_score - 95.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn privacy_failure_leaves_sender_score_alone() {
        let (manager, _, store, account) = setup().await;
        let settings = TenantSettings::default();

        manager
            .note_failure(&account, &TgError::PrivacyRestricted, &settings, Utc::now())
            .await
            .unwrap();

        let acc = store.account(account.id).await.unwrap().unwrap();
        assert!((acc.reliability_score - 100.0).abs() < 1e-9);
        assert_eq!(acc.consecutive_errors, 0);
        assert_eq!(acc.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn transient_failures_extend_streak_until_success() {
        let (manager, _, store, account) = setup().await;
        let settings = TenantSettings::default();
        let now = Utc::now();

        let e = TgError::Network("connection reset".into());
        assert_eq!(manager.note_failure(&account, &e, &settings, now).await.unwrap(), 1);
        assert_eq!(manager.note_failure(&account, &e, &settings, now).await.unwrap(), 2);

        manager.note_success(&account, &settings, now).await.unwrap();
        let acc = store.account(account.id).await.unwrap().unwrap();
        assert_eq!(acc.consecutive_errors, 0);
        assert_eq!(acc.daily_sent, 1);
    }
}
