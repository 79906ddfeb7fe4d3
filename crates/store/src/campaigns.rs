use chrono::Utc;

use common::{Campaign, CampaignStatus, MessageTemplate, Result};

use crate::Store;

impl Store {
    pub async fn campaign(&self, id: i64) -> Result<Option<Campaign>> {
        let row = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Campaigns the mailing worker picks up each tick.
    pub async fn actionable_campaigns(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status IN ('pending', 'running') ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// `scheduled → pending` for campaigns whose start time has come.
    pub async fn promote_scheduled_campaigns(&self, now: chrono::DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = 'pending'
             WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?",
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Campaigns sitting in `paused`, for the auto-recovery sweep.
    pub async fn paused_campaigns(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status = 'paused' ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Current status only; read at the top of each per-recipient
    /// iteration so pause/stop take effect mid-batch.
    pub async fn campaign_status(&self, id: i64) -> Result<Option<CampaignStatus>> {
        let status = sqlx::query_scalar::<_, CampaignStatus>(
            "SELECT status FROM campaigns WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(status)
    }

    /// `pending → running`, guarded so concurrent ticks flip it once.
    /// Returns true when this call performed the transition.
    pub async fn start_campaign(&self, id: i64, total_count: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = 'running', total_count = ?, pause_reason = NULL
             WHERE id = ? AND status = 'pending'",
        )
        .bind(total_count)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn pause_campaign(&self, id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET status = 'paused', pause_reason = ?
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(reason)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn resume_campaign(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET status = 'running', pause_reason = NULL
             WHERE id = ? AND status = 'paused'",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn complete_campaign(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET status = 'completed' WHERE id = ? AND status = 'running'",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Task-configuration failures: terminal, no automatic retry.
    pub async fn fail_campaign(&self, id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET status = 'error', pause_reason = ?
             WHERE id = ? AND status NOT IN ('stopped', 'completed')",
        )
        .bind(reason)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_campaign_rotation(
        &self,
        id: i64,
        current_account: Option<i64>,
        next_account_index: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET current_account = ?, next_account_index = ? WHERE id = ?",
        )
        .bind(current_account)
        .bind(next_account_index)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_adaptive_multiplier(&self, id: i64, multiplier: f64) -> Result<()> {
        sqlx::query("UPDATE campaigns SET adaptive_multiplier = ? WHERE id = ?")
            .bind(multiplier)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_campaign(
        &self,
        tenant: i64,
        source_id: i64,
        template_id: i64,
        account_ids: &[i64],
        folder: Option<&str>,
        status: CampaignStatus,
        delay_min: i64,
        delay_max: i64,
        warm_start: bool,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO campaigns
               (tenant, source_id, template_id, account_ids, folder, status,
                delay_min, delay_max, warm_start, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(source_id)
        .bind(template_id)
        .bind(serde_json::to_string(account_ids)?)
        .bind(folder)
        .bind(status)
        .bind(delay_min)
        .bind(delay_max)
        .bind(warm_start)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    // ── Templates ─────────────────────────────────────────────────────────

    pub async fn template(&self, id: i64) -> Result<Option<MessageTemplate>> {
        let row =
            sqlx::query_as::<_, MessageTemplate>("SELECT * FROM message_templates WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row)
    }

    pub async fn insert_template(
        &self,
        tenant: i64,
        name: &str,
        text: &str,
        media_path: Option<&str>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO message_templates (tenant, name, text, media_path) VALUES (?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(name)
        .bind(text)
        .bind(media_path)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (Store, i64) {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let source = store.insert_audience_source(1, "leads", 3).await.unwrap();
        let template = store.insert_template(1, "intro", "hi {name}", None).await.unwrap();
        let id = store
            .insert_campaign(1, source, template, &[], None, CampaignStatus::Pending, 0, 0, false)
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn start_transition_is_guarded() {
        let (store, id) = seeded().await;
        assert!(store.start_campaign(id, 3).await.unwrap());
        // Second attempt is a no-op: the row is already running.
        assert!(!store.start_campaign(id, 3).await.unwrap());
        let c = store.campaign(id).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Running);
        assert_eq!(c.total_count, 3);
    }

    #[tokio::test]
    async fn pause_preserves_progress_fields() {
        let (store, id) = seeded().await;
        store.start_campaign(id, 3).await.unwrap();
        store.set_campaign_rotation(id, Some(42), 2).await.unwrap();
        store.set_adaptive_multiplier(id, 1.5).await.unwrap();
        store.pause_campaign(id, "no accounts").await.unwrap();

        let c = store.campaign(id).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Paused);
        assert_eq!(c.pause_reason.as_deref(), Some("no accounts"));
        assert_eq!(c.next_account_index, 2);
        assert!((c.adaptive_multiplier - 1.5).abs() < 1e-9);

        store.resume_campaign(id).await.unwrap();
        let c = store.campaign(id).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Running);
        assert_eq!(c.next_account_index, 2);
    }

    #[tokio::test]
    async fn scheduled_campaigns_promote_when_due() {
        let (store, id) = seeded().await;
        let past = Utc::now() - chrono::Duration::minutes(5);
        sqlx::query("UPDATE campaigns SET status = 'scheduled', scheduled_at = ? WHERE id = ?")
            .bind(past)
            .bind(id)
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(store.promote_scheduled_campaigns(Utc::now()).await.unwrap(), 1);
        let c = store.campaign(id).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Pending);
        // Already promoted: nothing left to flip.
        assert_eq!(store.promote_scheduled_campaigns(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn terminal_states_reject_error_transition() {
        let (store, id) = seeded().await;
        store.start_campaign(id, 3).await.unwrap();
        store.complete_campaign(id).await.unwrap();
        store.fail_campaign(id, "late failure").await.unwrap();
        let c = store.campaign(id).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Completed);
    }
}
