use chrono::{DateTime, Duration, Utc};

use common::{AudienceMember, AudienceSource, Result};

use crate::Store;

/// How a failed send settles the recipient. Flood waits and peer floods
/// never reach this call: the recipient stays unsent for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailureKind {
    /// privacy_restricted, user_blocked, invalid peer, generic error:
    /// the recipient is settled and never retried.
    Terminal,
}

impl Store {
    pub async fn audience_source(&self, id: i64) -> Result<Option<AudienceSource>> {
        let row = sqlx::query_as::<_, AudienceSource>("SELECT * FROM audience_sources WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn insert_audience_source(
        &self,
        tenant: i64,
        title: &str,
        total_count: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO audience_sources (tenant, title, total_count, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(title)
        .bind(total_count)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn insert_audience_member(
        &self,
        source_id: i64,
        telegram_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO audience_members (source_id, telegram_id, username, first_name)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(source_id, telegram_id) DO NOTHING",
        )
        .bind(source_id)
        .bind(telegram_id)
        .bind(username)
        .bind(first_name)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    /// Next batch of recipients for a campaign: unsent members minus the
    /// tenant blacklist minus mailing-cache hits inside the ttl window.
    /// Fetch order is stable (by rowid) within a batch.
    pub async fn unsent_batch(
        &self,
        tenant: i64,
        source_id: i64,
        cache_ttl_days: i64,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<AudienceMember>> {
        let cache_cutoff = now - Duration::days(cache_ttl_days);
        let rows = sqlx::query_as::<_, AudienceMember>(
            "SELECT m.* FROM audience_members m
             WHERE m.source_id = ? AND m.sent = 0
               AND NOT EXISTS (
                   SELECT 1 FROM blacklist b
                   WHERE b.tenant = ?
                     AND (b.telegram_id = m.telegram_id
                          OR (b.username IS NOT NULL AND b.username = m.username))
               )
               AND NOT EXISTS (
                   SELECT 1 FROM mailing_cache c
                   WHERE c.tenant = ?
                     AND c.target_telegram_id = m.telegram_id
                     AND c.last_sent_at > ?
               )
             ORDER BY m.id
             LIMIT ?",
        )
        .bind(source_id)
        .bind(tenant)
        .bind(tenant)
        .bind(cache_cutoff)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn unsent_remaining(&self, source_id: i64) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audience_members WHERE source_id = ? AND sent = 0",
        )
        .bind(source_id)
        .fetch_one(self.pool())
        .await?;
        Ok(n)
    }

    /// Record a successful send atomically: flip the idempotency mark,
    /// bump the campaign counter, stamp the mailing cache. Either all
    /// three persist or none. Returns false when the mark was already
    /// set — the caller double-sent and must not count it again.
    pub async fn record_send_success(
        &self,
        campaign_id: i64,
        member_id: i64,
        tenant: i64,
        target_telegram_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let marked = sqlx::query("UPDATE audience_members SET sent = 1 WHERE id = ? AND sent = 0")
            .bind(member_id)
            .execute(&mut *tx)
            .await?;
        if marked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE campaigns SET sent_count = sent_count + 1 WHERE id = ?")
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO mailing_cache (tenant, target_telegram_id, last_sent_at)
             VALUES (?, ?, ?)
             ON CONFLICT(tenant, target_telegram_id) DO UPDATE SET last_sent_at = excluded.last_sent_at",
        )
        .bind(tenant)
        .bind(target_telegram_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Record a recipient-terminal failure atomically: the mark is set so
    /// the recipient is never retried, and failed_count goes up once.
    pub async fn record_send_failure(
        &self,
        campaign_id: i64,
        member_id: i64,
        _kind: SendFailureKind,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let marked = sqlx::query("UPDATE audience_members SET sent = 1 WHERE id = ? AND sent = 0")
            .bind(member_id)
            .execute(&mut *tx)
            .await?;
        if marked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE campaigns SET failed_count = failed_count + 1 WHERE id = ?")
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn audience_member(&self, id: i64) -> Result<Option<AudienceMember>> {
        let row = sqlx::query_as::<_, AudienceMember>("SELECT * FROM audience_members WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Bulk-insert parsed participants, skipping bots and duplicates.
    /// Returns how many rows were actually added.
    pub async fn add_participants(
        &self,
        source_id: i64,
        participants: &[common::ParticipantInfo],
    ) -> Result<i64> {
        let mut added = 0;
        for p in participants {
            if p.is_bot {
                continue;
            }
            let result = sqlx::query(
                "INSERT INTO audience_members
                   (source_id, telegram_id, access_hash, username, first_name, last_name)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(source_id, telegram_id) DO NOTHING",
            )
            .bind(source_id)
            .bind(p.telegram_id)
            .bind(p.access_hash)
            .bind(&p.username)
            .bind(&p.first_name)
            .bind(&p.last_name)
            .execute(self.pool())
            .await?;
            added += result.rows_affected() as i64;
        }
        Ok(added)
    }

    pub async fn set_source_total(&self, source_id: i64, total_count: i64) -> Result<()> {
        sqlx::query("UPDATE audience_sources SET total_count = ? WHERE id = ?")
            .bind(total_count)
            .bind(source_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ── Parsing tasks ─────────────────────────────────────────────────────

    pub async fn open_parsing_tasks(&self) -> Result<Vec<common::ParsingTask>> {
        let rows = sqlx::query_as::<_, common::ParsingTask>(
            "SELECT * FROM parsing_tasks WHERE status IN ('pending', 'in_progress') ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn insert_parsing_task(
        &self,
        tenant: i64,
        source_link: &str,
        source_id: Option<i64>,
        account_id: Option<i64>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO parsing_tasks (tenant, source_link, source_id, account_id)
             VALUES (?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(source_link)
        .bind(source_id)
        .bind(account_id)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn parsing_task(&self, id: i64) -> Result<Option<common::ParsingTask>> {
        let row = sqlx::query_as::<_, common::ParsingTask>("SELECT * FROM parsing_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn set_parsing_task_status(
        &self,
        id: i64,
        status: common::TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE parsing_tasks SET status = ?, error = ? WHERE id = ?")
            .bind(status)
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn update_parsing_progress(
        &self,
        id: i64,
        parsed_count: i64,
        total_count: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE parsing_tasks SET parsed_count = ?, total_count = ? WHERE id = ?")
            .bind(parsed_count)
            .bind(total_count)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BlacklistSource, CampaignStatus};

    async fn seeded() -> (Store, i64, i64) {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let source = store.insert_audience_source(1, "leads", 3).await.unwrap();
        let template = store.insert_template(1, "intro", "hi", None).await.unwrap();
        let campaign = store
            .insert_campaign(1, source, template, &[], None, CampaignStatus::Running, 0, 0, false)
            .await
            .unwrap();
        (store, source, campaign)
    }

    #[tokio::test]
    async fn unsent_batch_excludes_blacklist_and_cache() {
        let (store, source, _) = seeded().await;
        let now = Utc::now();
        store.insert_audience_member(source, 100, Some("alice"), None).await.unwrap();
        store.insert_audience_member(source, 200, Some("bob"), None).await.unwrap();
        store.insert_audience_member(source, 300, None, None).await.unwrap();

        store
            .add_blacklist_entry(1, Some(200), None, BlacklistSource::Manual)
            .await
            .unwrap();
        // User 300 was mailed recently by another campaign.
        sqlx::query("INSERT INTO mailing_cache (tenant, target_telegram_id, last_sent_at) VALUES (1, 300, ?)")
            .bind(now)
            .execute(store.pool())
            .await
            .unwrap();

        let batch = store.unsent_batch(1, source, 30, 10, now).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|m| m.telegram_id).collect();
        assert_eq!(ids, vec![100]);
    }

    #[tokio::test]
    async fn expired_cache_entries_no_longer_suppress() {
        let (store, source, _) = seeded().await;
        let now = Utc::now();
        store.insert_audience_member(source, 300, None, None).await.unwrap();
        sqlx::query("INSERT INTO mailing_cache (tenant, target_telegram_id, last_sent_at) VALUES (1, 300, ?)")
            .bind(now - Duration::days(40))
            .execute(store.pool())
            .await
            .unwrap();

        let batch = store.unsent_batch(1, source, 30, 10, now).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn success_record_is_exactly_once() {
        let (store, source, campaign) = seeded().await;
        let now = Utc::now();
        let member = store.insert_audience_member(source, 100, None, None).await.unwrap();

        assert!(store.record_send_success(campaign, member, 1, 100, now).await.unwrap());
        // A replay of the same outcome must not count twice.
        assert!(!store.record_send_success(campaign, member, 1, 100, now).await.unwrap());

        let c = store.campaign(campaign).await.unwrap().unwrap();
        assert_eq!(c.sent_count, 1);
        assert_eq!(store.unsent_remaining(source).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn terminal_failure_marks_and_counts_once() {
        let (store, source, campaign) = seeded().await;
        let member = store.insert_audience_member(source, 100, None, None).await.unwrap();

        assert!(store
            .record_send_failure(campaign, member, SendFailureKind::Terminal)
            .await
            .unwrap());
        assert!(!store
            .record_send_failure(campaign, member, SendFailureKind::Terminal)
            .await
            .unwrap());

        let c = store.campaign(campaign).await.unwrap().unwrap();
        assert_eq!(c.sent_count, 0);
        assert_eq!(c.failed_count, 1);
        let m = store.audience_member(member).await.unwrap().unwrap();
        assert!(m.sent);
    }
}
