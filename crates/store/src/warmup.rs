use chrono::{DateTime, Utc};

use common::{CompletedAction, Result, TaskStatus, WarmupKind, WarmupProgress};

use crate::Store;

impl Store {
    pub async fn warmup_progress(&self, account_id: i64) -> Result<Option<WarmupProgress>> {
        let row =
            sqlx::query_as::<_, WarmupProgress>("SELECT * FROM warmup_progress WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row)
    }

    /// Warmups the worker may advance: in progress, on an account that
    /// is active or freshly pending.
    pub async fn warmups_in_progress(&self) -> Result<Vec<WarmupProgress>> {
        let rows = sqlx::query_as::<_, WarmupProgress>(
            "SELECT w.* FROM warmup_progress w
             JOIN accounts a ON a.id = w.account_id
             WHERE w.status = 'in_progress' AND a.status = 'active'
             ORDER BY w.id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn insert_warmup(
        &self,
        account_id: i64,
        kind: WarmupKind,
        total_days: i64,
        target_folder: Option<&str>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO warmup_progress (account_id, kind, total_days, status, target_folder)
             VALUES (?, ?, ?, 'in_progress', ?)
             ON CONFLICT(account_id) DO NOTHING",
        )
        .bind(account_id)
        .bind(kind)
        .bind(total_days)
        .bind(target_folder)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    /// Move a warmup to the next day, appending the day's record.
    pub async fn advance_warmup(
        &self,
        account_id: i64,
        completed: &[CompletedAction],
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE warmup_progress
             SET current_day = current_day + 1, completed_actions = ?, last_action_at = ?
             WHERE account_id = ?",
        )
        .bind(serde_json::to_string(completed)?)
        .bind(at)
        .bind(account_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn finish_warmup(
        &self,
        account_id: i64,
        status: TaskStatus,
        completed: &[CompletedAction],
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE warmup_progress
             SET status = ?, completed_actions = ?, last_action_at = ?
             WHERE account_id = ?",
        )
        .bind(status)
        .bind(serde_json::to_string(completed)?)
        .bind(at)
        .bind(account_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AccountRole, AccountStatus};

    #[tokio::test]
    async fn warmup_advance_and_finish() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let account = store
            .insert_account(1, "+79011234455", AccountStatus::Active, AccountRole::Observer, 30)
            .await
            .unwrap();
        store.insert_warmup(account, WarmupKind::Standard, 5, None).await.unwrap();

        let list = store.warmups_in_progress().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].current_day, 1);

        let now = Utc::now();
        let actions = vec![CompletedAction {
            day: 1,
            action: "warmup_day_1".into(),
            at: now,
        }];
        store.advance_warmup(account, &actions, now).await.unwrap();

        let p = store.warmup_progress(account).await.unwrap().unwrap();
        assert_eq!(p.current_day, 2);
        assert_eq!(p.completed_actions.len(), 1);
        assert!(p.last_action_at.is_some());

        store
            .finish_warmup(account, TaskStatus::Completed, &actions, now)
            .await
            .unwrap();
        assert!(store.warmups_in_progress().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inactive_accounts_are_not_advanced() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let account = store
            .insert_account(1, "+79011234455", AccountStatus::Pending, AccountRole::Observer, 30)
            .await
            .unwrap();
        store.insert_warmup(account, WarmupKind::Standard, 5, None).await.unwrap();
        assert!(store.warmups_in_progress().await.unwrap().is_empty());
    }
}
