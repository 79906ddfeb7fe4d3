use chrono::{DateTime, Utc};

use common::{PanicFlag, Result};

use crate::Store;

impl Store {
    /// Whether the tenant's kill switch is engaged at `now`. An
    /// `auto_resume_at` at or before `now` clears the flag on this first
    /// check and reports not-paused.
    pub async fn is_tenant_paused(&self, tenant: i64, now: DateTime<Utc>) -> Result<bool> {
        let flag = sqlx::query_as::<_, PanicFlag>("SELECT * FROM panic_flags WHERE tenant = ?")
            .bind(tenant)
            .fetch_optional(self.pool())
            .await?;
        let Some(flag) = flag else { return Ok(false) };
        if !flag.is_paused {
            return Ok(false);
        }
        if let Some(resume_at) = flag.auto_resume_at {
            if resume_at <= now {
                self.clear_panic(tenant).await?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn set_panic(
        &self,
        tenant: i64,
        reason: &str,
        auto_resume_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO panic_flags (tenant, is_paused, reason, auto_resume_at)
             VALUES (?, 1, ?, ?)
             ON CONFLICT(tenant) DO UPDATE
             SET is_paused = 1, reason = excluded.reason, auto_resume_at = excluded.auto_resume_at",
        )
        .bind(tenant)
        .bind(reason)
        .bind(auto_resume_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn clear_panic(&self, tenant: i64) -> Result<()> {
        sqlx::query(
            "UPDATE panic_flags SET is_paused = 0, reason = NULL, auto_resume_at = NULL
             WHERE tenant = ?",
        )
        .bind(tenant)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panic_flag_lifecycle() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let now = Utc::now();

        assert!(!store.is_tenant_paused(1, now).await.unwrap());

        store.set_panic(1, "manual stop", None).await.unwrap();
        assert!(store.is_tenant_paused(1, now).await.unwrap());

        store.clear_panic(1).await.unwrap();
        assert!(!store.is_tenant_paused(1, now).await.unwrap());
    }

    #[tokio::test]
    async fn auto_resume_clears_on_first_check() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let now = Utc::now();

        store
            .set_panic(1, "cooling off", Some(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        // Deadline already passed: first check clears and resumes.
        assert!(!store.is_tenant_paused(1, now).await.unwrap());
        assert!(!store.is_tenant_paused(1, now).await.unwrap());
    }

    #[tokio::test]
    async fn auto_resume_in_future_stays_paused() {
        let store = Store::connect_in_memory().await.unwrap();
        store.ensure_tenant(1).await.unwrap();
        let now = Utc::now();

        store
            .set_panic(1, "cooling off", Some(now + chrono::Duration::minutes(10)))
            .await
            .unwrap();
        assert!(store.is_tenant_paused(1, now).await.unwrap());
    }
}
