use chrono::{DateTime, Utc};

use common::{AssignmentStatus, HerderAssignment, MonitoredChannel, Result, TenantChannel};

use crate::Store;

impl Store {
    pub async fn active_assignments(&self, now: DateTime<Utc>) -> Result<Vec<HerderAssignment>> {
        // A paused assignment with an elapsed auto-resume deadline comes
        // back on the next tick.
        sqlx::query(
            "UPDATE herder_assignments SET status = 'active', paused_until = NULL
             WHERE status = 'paused' AND paused_until IS NOT NULL AND paused_until <= ?",
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        let rows = sqlx::query_as::<_, HerderAssignment>(
            "SELECT * FROM herder_assignments WHERE status = 'active' ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn assignment(&self, id: i64) -> Result<Option<HerderAssignment>> {
        let row =
            sqlx::query_as::<_, HerderAssignment>("SELECT * FROM herder_assignments WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row)
    }

    pub async fn set_assignment_status(
        &self,
        id: i64,
        status: AssignmentStatus,
        paused_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE herder_assignments SET status = ?, paused_until = ? WHERE id = ?")
            .bind(status)
            .bind(paused_until)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn bump_assignment_actions(&self, id: i64, comments: i64) -> Result<()> {
        sqlx::query(
            "UPDATE herder_assignments
             SET total_actions = total_actions + 1, total_comments = total_comments + ?
             WHERE id = ?",
        )
        .bind(comments)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn log_herder_action(
        &self,
        assignment_id: i64,
        account_id: i64,
        kind: &str,
        status: &str,
        detail: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO herder_action_log (assignment_id, account_id, kind, status, detail, at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(assignment_id)
        .bind(account_id)
        .bind(kind)
        .bind(status)
        .bind(detail.to_string())
        .bind(at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Successful actions by one account since `since` (tenant-local
    /// midnight expressed in UTC). Backs the per-account daily cap.
    pub async fn account_actions_since(
        &self,
        account_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM herder_action_log
             WHERE account_id = ? AND status = 'success' AND at >= ?",
        )
        .bind(account_id)
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(n)
    }

    /// Successful comments across one assignment since `since`. Backs
    /// max_comments_per_day × |accounts|.
    pub async fn assignment_comments_since(
        &self,
        assignment_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM herder_action_log
             WHERE assignment_id = ? AND kind = 'comment' AND status = 'success' AND at >= ?",
        )
        .bind(assignment_id)
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(n)
    }

    // ── Channels ──────────────────────────────────────────────────────────

    pub async fn monitored_channel(&self, id: i64) -> Result<Option<MonitoredChannel>> {
        let row =
            sqlx::query_as::<_, MonitoredChannel>("SELECT * FROM monitored_channels WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row)
    }

    pub async fn insert_monitored_channel(&self, tenant: i64, username: &str) -> Result<i64> {
        let row =
            sqlx::query("INSERT INTO monitored_channels (tenant, username) VALUES (?, ?)")
                .bind(tenant)
                .bind(username)
                .execute(self.pool())
                .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn tenant_channel(&self, id: i64) -> Result<Option<TenantChannel>> {
        let row = sqlx::query_as::<_, TenantChannel>("SELECT * FROM tenant_channels WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn insert_tenant_channel(&self, tenant: i64, username: &str) -> Result<i64> {
        let row = sqlx::query("INSERT INTO tenant_channels (tenant, username) VALUES (?, ?)")
            .bind(tenant)
            .bind(username)
            .execute(self.pool())
            .await?;
        Ok(row.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_assignment(
        &self,
        tenant: i64,
        channel_id: i64,
        account_ids: &[i64],
        strategy: common::HerderStrategy,
        action_chain: &[common::ActionStep],
        max_comments_per_day: i64,
        coordinate_discussions: bool,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO herder_assignments
               (tenant, channel_id, account_ids, strategy, action_chain, max_comments_per_day,
                coordinate_discussions)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(channel_id)
        .bind(serde_json::to_string(account_ids)?)
        .bind(strategy)
        .bind(serde_json::to_string(action_chain)?)
        .bind(max_comments_per_day)
        .bind(coordinate_discussions)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ActionKind, ActionStep, HerderStrategy};

    #[tokio::test]
    async fn action_chain_round_trips_through_json_column() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let channel = store.insert_monitored_channel(1, "somechannel").await.unwrap();
        let chain = vec![
            ActionStep {
                kind: ActionKind::Read,
                probability: 1.0,
                delay_after: (0, 0),
                emoji: vec![],
                min_engagement: None,
            },
            ActionStep {
                kind: ActionKind::React,
                probability: 0.5,
                delay_after: (10, 60),
                emoji: vec!["👍".into(), "🔥".into()],
                min_engagement: None,
            },
        ];
        let id = store
            .insert_assignment(1, channel, &[5, 6], HerderStrategy::Expert, &chain, 2, false)
            .await
            .unwrap();

        let read = store.assignment(id).await.unwrap().unwrap();
        assert_eq!(read.strategy, HerderStrategy::Expert);
        assert_eq!(read.account_ids, vec![5, 6]);
        assert_eq!(read.action_chain.len(), 2);
        assert_eq!(read.action_chain[1].emoji.len(), 2);
    }

    #[tokio::test]
    async fn paused_assignment_auto_resumes() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let channel = store.insert_monitored_channel(1, "c").await.unwrap();
        let id = store
            .insert_assignment(1, channel, &[1], HerderStrategy::Observer, &[], 2, false)
            .await
            .unwrap();
        let now = Utc::now();
        store
            .set_assignment_status(id, AssignmentStatus::Paused, Some(now - chrono::Duration::minutes(1)))
            .await
            .unwrap();

        let active = store.active_assignments(now).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, AssignmentStatus::Active);
    }

    #[tokio::test]
    async fn daily_counters_come_from_the_log() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let channel = store.insert_monitored_channel(1, "c").await.unwrap();
        let id = store
            .insert_assignment(1, channel, &[9], HerderStrategy::Support, &[], 2, false)
            .await
            .unwrap();
        let now = Utc::now();
        let midnight = now - chrono::Duration::hours(3);

        store
            .log_herder_action(id, 9, "react", "success", serde_json::json!({}), now)
            .await
            .unwrap();
        store
            .log_herder_action(id, 9, "comment", "success", serde_json::json!({}), now)
            .await
            .unwrap();
        store
            .log_herder_action(id, 9, "comment", "failed", serde_json::json!({}), now)
            .await
            .unwrap();
        // Yesterday's action is outside the window.
        store
            .log_herder_action(id, 9, "react", "success", serde_json::json!({}), midnight - chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(store.account_actions_since(9, midnight).await.unwrap(), 2);
        assert_eq!(store.assignment_comments_since(id, midnight).await.unwrap(), 1);
    }
}
