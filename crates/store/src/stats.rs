use chrono::{DateTime, Utc};

use common::{HourlyStat, Result};

use crate::Store;

impl Store {
    /// Bump the (weekday, hour) bucket after a send attempt. Buckets are
    /// increment-only within a tick; the pacing engine tolerates stale
    /// reads.
    pub async fn record_send_stat(
        &self,
        tenant: i64,
        day_of_week: i64,
        hour: i64,
        success: bool,
    ) -> Result<()> {
        let (s, f) = if success { (1, 0) } else { (0, 1) };
        sqlx::query(
            "INSERT INTO hourly_stats (tenant, day_of_week, hour, sent, success, failed, flood_waits)
             VALUES (?, ?, ?, 1, ?, ?, 0)
             ON CONFLICT(tenant, day_of_week, hour) DO UPDATE
             SET sent = sent + 1, success = success + ?, failed = failed + ?",
        )
        .bind(tenant)
        .bind(day_of_week)
        .bind(hour)
        .bind(s)
        .bind(f)
        .bind(s)
        .bind(f)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn record_flood_wait_stat(
        &self,
        tenant: i64,
        day_of_week: i64,
        hour: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO hourly_stats (tenant, day_of_week, hour, sent, success, failed, flood_waits)
             VALUES (?, ?, ?, 0, 0, 0, 1)
             ON CONFLICT(tenant, day_of_week, hour) DO UPDATE
             SET flood_waits = flood_waits + 1",
        )
        .bind(tenant)
        .bind(day_of_week)
        .bind(hour)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn hourly_stat(
        &self,
        tenant: i64,
        day_of_week: i64,
        hour: i64,
    ) -> Result<Option<HourlyStat>> {
        let row = sqlx::query_as::<_, HourlyStat>(
            "SELECT * FROM hourly_stats WHERE tenant = ? AND day_of_week = ? AND hour = ?",
        )
        .bind(tenant)
        .bind(day_of_week)
        .bind(hour)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// One row per non-trivial error (§ error handling).
    pub async fn log_error(
        &self,
        tenant: i64,
        scope: &str,
        subject_id: Option<i64>,
        kind: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO error_log (tenant, scope, subject_id, kind, message, at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(scope)
        .bind(subject_id)
        .bind(kind)
        .bind(message)
        .bind(at)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hourly_buckets_accumulate() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();

        store.record_send_stat(1, 2, 14, true).await.unwrap();
        store.record_send_stat(1, 2, 14, true).await.unwrap();
        store.record_send_stat(1, 2, 14, false).await.unwrap();
        store.record_flood_wait_stat(1, 2, 14).await.unwrap();

        let stat = store.hourly_stat(1, 2, 14).await.unwrap().unwrap();
        assert_eq!(stat.sent, 3);
        assert_eq!(stat.success, 2);
        assert_eq!(stat.failed, 1);
        assert_eq!(stat.flood_waits, 1);

        assert!(store.hourly_stat(1, 2, 15).await.unwrap().is_none());
    }
}
