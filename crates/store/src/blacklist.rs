use common::{BlacklistSource, InboundReply, Result, StopTrigger};

use crate::Store;

impl Store {
    pub async fn add_blacklist_entry(
        &self,
        tenant: i64,
        telegram_id: Option<i64>,
        username: Option<&str>,
        source: BlacklistSource,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO blacklist (tenant, telegram_id, username, source, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(telegram_id)
        .bind(username)
        .bind(source)
        .bind(chrono::Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn is_blacklisted(&self, tenant: i64, telegram_id: i64) -> Result<bool> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM blacklist WHERE tenant = ? AND telegram_id = ?",
        )
        .bind(tenant)
        .bind(telegram_id)
        .fetch_one(self.pool())
        .await?;
        Ok(n > 0)
    }

    pub async fn active_stop_triggers(&self, tenant: i64) -> Result<Vec<StopTrigger>> {
        let rows = sqlx::query_as::<_, StopTrigger>(
            "SELECT * FROM stop_triggers WHERE tenant = ? AND is_active = 1",
        )
        .bind(tenant)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn insert_stop_trigger(&self, tenant: i64, phrase: &str) -> Result<i64> {
        let row = sqlx::query("INSERT INTO stop_triggers (tenant, phrase) VALUES (?, ?)")
            .bind(tenant)
            .bind(phrase)
            .execute(self.pool())
            .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn record_stop_trigger_hit(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE stop_triggers SET hits_count = hits_count + 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ── Inbound replies (stop-trigger scanning queue) ─────────────────────

    pub async fn unprocessed_replies(&self, limit: i64) -> Result<Vec<InboundReply>> {
        let rows = sqlx::query_as::<_, InboundReply>(
            "SELECT * FROM inbound_replies WHERE processed = 0 ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn mark_reply_processed(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE inbound_replies SET processed = 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn insert_inbound_reply(
        &self,
        tenant: i64,
        from_telegram_id: i64,
        from_username: Option<&str>,
        text: &str,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO inbound_replies (tenant, from_telegram_id, from_username, text, received_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(from_telegram_id)
        .bind(from_username)
        .bind(text)
        .bind(chrono::Utc::now())
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    // ── Herder bad phrases ────────────────────────────────────────────────

    pub async fn bad_phrases(&self, tenant: i64) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT phrase FROM herder_bad_phrases WHERE tenant = ?")
                .bind(tenant)
                .fetch_all(self.pool())
                .await?;
        Ok(rows)
    }

    pub async fn insert_bad_phrase(&self, tenant: i64, phrase: &str) -> Result<()> {
        sqlx::query("INSERT INTO herder_bad_phrases (tenant, phrase) VALUES (?, ?)")
            .bind(tenant)
            .bind(phrase)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blacklist_lookup() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        store
            .add_blacklist_entry(1, Some(42), None, BlacklistSource::AutoResponse)
            .await
            .unwrap();
        assert!(store.is_blacklisted(1, 42).await.unwrap());
        assert!(!store.is_blacklisted(1, 43).await.unwrap());
        assert!(!store.is_blacklisted(2, 42).await.unwrap());
    }

    #[tokio::test]
    async fn stop_trigger_hits_accumulate() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let id = store.insert_stop_trigger(1, "unsubscribe").await.unwrap();
        store.record_stop_trigger_hit(id).await.unwrap();
        store.record_stop_trigger_hit(id).await.unwrap();
        let triggers = store.active_stop_triggers(1).await.unwrap();
        assert_eq!(triggers[0].hits_count, 2);
    }
}
