use chrono::{DateTime, Utc};

use common::{Account, AccountProfile, AccountStatus, AuthorizedUser, Result, WarmupStatus};

use crate::Store;

impl Store {
    pub async fn account(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn accounts_by_ids(&self, ids: &[i64]) -> Result<Vec<Account>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        // SQLite has no array binds; build the placeholder list.
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM accounts WHERE id IN ({placeholders}) ORDER BY created_at, id");
        let mut query = sqlx::query_as::<_, Account>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(self.pool()).await?)
    }

    pub async fn accounts_in_folder(&self, tenant: i64, folder: &str) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE tenant = ? AND folder = ? ORDER BY created_at, id",
        )
        .bind(tenant)
        .bind(folder)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn active_accounts(&self, tenant: i64) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE tenant = ? AND status = 'active' ORDER BY created_at, id",
        )
        .bind(tenant)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn insert_account(
        &self,
        tenant: i64,
        phone: &str,
        status: AccountStatus,
        role: common::AccountRole,
        daily_limit: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO accounts (tenant, phone, status, role, daily_limit, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(phone)
        .bind(status)
        .bind(role)
        .bind(daily_limit)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn set_account_status(&self, id: i64, status: AccountStatus) -> Result<()> {
        sqlx::query("UPDATE accounts SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_account_folder(&self, id: i64, folder: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE accounts SET folder = ? WHERE id = ?")
            .bind(folder)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_account_warmup_status(&self, id: i64, status: WarmupStatus) -> Result<()> {
        sqlx::query("UPDATE accounts SET warmup_status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Persist the identity returned by a completed authorization and
    /// flip the account to active.
    pub async fn set_account_authorized(&self, id: i64, user: &AuthorizedUser) -> Result<()> {
        sqlx::query(
            "UPDATE accounts
             SET status = 'active', telegram_id = ?, username = ?, first_name = ?
             WHERE id = ?",
        )
        .bind(user.telegram_id)
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Reactivate every account whose flood-wait deadline has passed.
    /// Single statement, so the check-and-flip is atomic.
    pub async fn reactivate_expired_flood_waits(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE accounts
             SET status = 'active', flood_wait_until = NULL, consecutive_errors = 0
             WHERE status = 'flood_wait' AND flood_wait_until IS NOT NULL AND flood_wait_until <= ?",
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    // ── Session-manager feedback writers (§ feedback rules) ───────────────

    /// Success: bump the daily counter, clear the error streak, nudge
    /// reliability up.
    pub async fn apply_send_success(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE accounts
             SET daily_sent = daily_sent + 1,
                 consecutive_errors = 0,
                 reliability_score = MIN(100.0, reliability_score + 0.1)
             WHERE id = ?",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Transient failure: extend the streak, take a reliability hit.
    /// Returns the new streak length so callers can apply their own
    /// thresholds.
    pub async fn apply_transient_failure(&self, id: i64) -> Result<i64> {
        sqlx::query(
            "UPDATE accounts
             SET consecutive_errors = consecutive_errors + 1,
                 daily_errors = daily_errors + 1,
                 reliability_score = MAX(0.0, reliability_score - 2.0)
             WHERE id = ?",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        let streak: i64 =
            sqlx::query_scalar("SELECT consecutive_errors FROM accounts WHERE id = ?")
                .bind(id)
                .fetch_one(self.pool())
                .await?;
        Ok(streak)
    }

    pub async fn apply_flood_wait(&self, id: i64, until: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE accounts
             SET status = 'flood_wait',
                 flood_wait_until = ?,
                 daily_errors = daily_errors + 1,
                 reliability_score = MAX(0.0, reliability_score - 5.0)
             WHERE id = ?",
        )
        .bind(until)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Peer flood marks the account for an extended cooldown and a
    /// heavier reliability penalty than a plain flood wait.
    pub async fn apply_peer_flood(&self, id: i64, until: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE accounts
             SET status = 'flood_wait',
                 flood_wait_until = ?,
                 daily_errors = daily_errors + 1,
                 reliability_score = MAX(0.0, reliability_score - 10.0)
             WHERE id = ?",
        )
        .bind(until)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Daily reset at tenant-local midnight.
    pub async fn reset_daily_counters(&self, tenant: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE accounts SET daily_sent = 0, daily_errors = 0 WHERE tenant = ?",
        )
        .bind(tenant)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    // ── Profiles ──────────────────────────────────────────────────────────

    pub async fn insert_account_profile(&self, profile: &AccountProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO account_profiles (account_id, persona, interests, speech_style, preferred_reactions)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(account_id) DO NOTHING",
        )
        .bind(profile.account_id)
        .bind(&profile.persona)
        .bind(serde_json::to_string(&profile.interests)?)
        .bind(&profile.speech_style)
        .bind(serde_json::to_string(&profile.preferred_reactions)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn account_profile(&self, account_id: i64) -> Result<Option<AccountProfile>> {
        let row =
            sqlx::query_as::<_, AccountProfile>("SELECT * FROM account_profiles WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AccountRole;

    async fn store_with_tenant() -> Store {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        store
    }

    #[tokio::test]
    async fn feedback_rules_adjust_counters_and_bounds() {
        let store = store_with_tenant().await;
        let id = store
            .insert_account(1, "+79011234455", AccountStatus::Active, AccountRole::Observer, 30)
            .await
            .unwrap();

        store.apply_send_success(id).await.unwrap();
        let acc = store.account(id).await.unwrap().unwrap();
        assert_eq!(acc.daily_sent, 1);
        assert_eq!(acc.consecutive_errors, 0);
        // reliability is clamped at 100
        assert!((acc.reliability_score - 100.0).abs() < 1e-9);

        let streak = store.apply_transient_failure(id).await.unwrap();
        assert_eq!(streak, 1);
        let acc = store.account(id).await.unwrap().unwrap();
        assert!((acc.reliability_score - 98.0).abs() < 1e-9);

        store.apply_send_success(id).await.unwrap();
        let acc = store.account(id).await.unwrap().unwrap();
        assert_eq!(acc.consecutive_errors, 0);
        assert!((acc.reliability_score - 98.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn flood_wait_reactivation_is_atomic_and_lazy() {
        let store = store_with_tenant().await;
        let id = store
            .insert_account(1, "+79011234455", AccountStatus::Active, AccountRole::Observer, 30)
            .await
            .unwrap();

        let past = Utc::now() - chrono::Duration::seconds(5);
        store.apply_flood_wait(id, past).await.unwrap();
        let acc = store.account(id).await.unwrap().unwrap();
        assert_eq!(acc.status, AccountStatus::FloodWait);

        let n = store.reactivate_expired_flood_waits(Utc::now()).await.unwrap();
        assert_eq!(n, 1);
        let acc = store.account(id).await.unwrap().unwrap();
        assert_eq!(acc.status, AccountStatus::Active);
        assert!(acc.flood_wait_until.is_none());
        assert_eq!(acc.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn future_flood_wait_is_not_reactivated() {
        let store = store_with_tenant().await;
        let id = store
            .insert_account(1, "+79011234455", AccountStatus::Active, AccountRole::Observer, 30)
            .await
            .unwrap();
        store
            .apply_flood_wait(id, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        let n = store.reactivate_expired_flood_waits(Utc::now()).await.unwrap();
        assert_eq!(n, 0);
        let acc = store.account(id).await.unwrap().unwrap();
        assert_eq!(acc.status, AccountStatus::FloodWait);
    }

    #[tokio::test]
    async fn daily_reset_clears_counters() {
        let store = store_with_tenant().await;
        let id = store
            .insert_account(1, "+79011234455", AccountStatus::Active, AccountRole::Observer, 30)
            .await
            .unwrap();
        store.apply_send_success(id).await.unwrap();
        store.apply_transient_failure(id).await.unwrap();

        store.reset_daily_counters(1).await.unwrap();
        let acc = store.account(id).await.unwrap().unwrap();
        assert_eq!(acc.daily_sent, 0);
        assert_eq!(acc.daily_errors, 0);
    }
}
