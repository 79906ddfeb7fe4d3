use chrono::{DateTime, Utc};

use common::{
    RepeatMode, Result, ScheduleStatus, ScheduledContent, ScheduledMailing, ScheduledTask,
    TemplateSchedule,
};

use crate::Store;

impl Store {
    pub async fn due_scheduled_mailings(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMailing>> {
        let rows = sqlx::query_as::<_, ScheduledMailing>(
            "SELECT * FROM scheduled_mailings
             WHERE status = 'pending' AND scheduled_at <= ? ORDER BY scheduled_at",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn due_scheduled_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query_as::<_, ScheduledTask>(
            "SELECT * FROM scheduled_tasks
             WHERE status = 'pending' AND scheduled_at <= ? ORDER BY scheduled_at",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// One-shot content whose time has come; flipped to `queued` so the
    /// content worker picks it up exactly once.
    pub async fn queue_due_content(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE scheduled_content SET status = 'queued'
             WHERE status = 'pending' AND scheduled_at <= ?",
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn queued_content(&self) -> Result<Vec<ScheduledContent>> {
        let rows = sqlx::query_as::<_, ScheduledContent>(
            "SELECT * FROM scheduled_content WHERE status = 'queued' ORDER BY scheduled_at",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Settle a scheduled row after a run: `once` completes, recurring
    /// rows re-arm.
    pub async fn settle_scheduled_mailing(
        &self,
        id: i64,
        repeat: RepeatMode,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match next_run(repeat, now) {
            None => {
                sqlx::query(
                    "UPDATE scheduled_mailings SET status = 'completed', last_run_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(id)
                .execute(self.pool())
                .await?;
            }
            Some(next) => {
                sqlx::query(
                    "UPDATE scheduled_mailings SET scheduled_at = ?, last_run_at = ? WHERE id = ?",
                )
                .bind(next)
                .bind(now)
                .bind(id)
                .execute(self.pool())
                .await?;
            }
        }
        Ok(())
    }

    pub async fn settle_scheduled_task(
        &self,
        id: i64,
        repeat: RepeatMode,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match next_run(repeat, now) {
            None => {
                sqlx::query(
                    "UPDATE scheduled_tasks SET status = 'completed', last_run_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(id)
                .execute(self.pool())
                .await?;
            }
            Some(next) => {
                sqlx::query(
                    "UPDATE scheduled_tasks SET scheduled_at = ?, last_run_at = ? WHERE id = ?",
                )
                .bind(next)
                .bind(now)
                .bind(id)
                .execute(self.pool())
                .await?;
            }
        }
        Ok(())
    }

    pub async fn fail_scheduled_mailing(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE scheduled_mailings SET status = 'error', error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn fail_scheduled_task(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE scheduled_tasks SET status = 'error', error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_content_published(
        &self,
        id: i64,
        message_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scheduled_content
             SET status = 'completed', published_at = ?, message_id = ? WHERE id = ?",
        )
        .bind(at)
        .bind(message_id)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn fail_content(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE scheduled_content SET status = 'error', error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ── Template schedules ────────────────────────────────────────────────

    pub async fn template_schedules(&self) -> Result<Vec<TemplateSchedule>> {
        let rows = sqlx::query_as::<_, TemplateSchedule>(
            "SELECT * FROM template_schedules ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn mark_template_published(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE template_schedules SET last_published_at = ?, error = NULL WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_template_schedule_error(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE template_schedules SET error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ── Inserts (UI façade / tests) ───────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_scheduled_mailing(
        &self,
        tenant: i64,
        source_id: i64,
        template_id: i64,
        folder: Option<&str>,
        warm_start: bool,
        scheduled_at: DateTime<Utc>,
        repeat_mode: RepeatMode,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO scheduled_mailings
               (tenant, source_id, template_id, folder, warm_start, scheduled_at, repeat_mode)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(source_id)
        .bind(template_id)
        .bind(folder)
        .bind(warm_start)
        .bind(scheduled_at)
        .bind(repeat_mode)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn insert_scheduled_task(
        &self,
        tenant: i64,
        kind: &str,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
        repeat_mode: RepeatMode,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO scheduled_tasks (tenant, kind, payload, scheduled_at, repeat_mode)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(kind)
        .bind(payload.to_string())
        .bind(scheduled_at)
        .bind(repeat_mode)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn insert_scheduled_content(
        &self,
        tenant: i64,
        channel_id: i64,
        text: &str,
        use_ai_rewrite: bool,
        scheduled_at: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO scheduled_content (tenant, channel_id, text, use_ai_rewrite, scheduled_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(channel_id)
        .bind(text)
        .bind(use_ai_rewrite)
        .bind(scheduled_at)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_template_schedule(
        &self,
        tenant: i64,
        template_id: i64,
        channel_id: i64,
        repeat_days: &[u8],
        publish_time: &str,
        use_ai_rewrite: bool,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO template_schedules
               (tenant, template_id, channel_id, repeat_days, publish_time, use_ai_rewrite)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(template_id)
        .bind(channel_id)
        .bind(serde_json::to_string(repeat_days)?)
        .bind(publish_time)
        .bind(use_ai_rewrite)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }
}

/// Next firing for a recurring row; `once` rows have none.
fn next_run(repeat: RepeatMode, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match repeat {
        RepeatMode::Once => None,
        RepeatMode::Daily => Some(now + chrono::Duration::days(1)),
        RepeatMode::Weekly => Some(now + chrono::Duration::days(7)),
    }
}
