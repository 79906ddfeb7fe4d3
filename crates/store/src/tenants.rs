use common::{Result, TenantSettings};

use crate::Store;

impl Store {
    /// Every tenant id known to the store.
    pub async fn tenant_ids(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM tenants ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(ids)
    }

    pub async fn ensure_tenant(&self, tenant: i64) -> Result<()> {
        sqlx::query("INSERT INTO tenants (id) VALUES (?) ON CONFLICT(id) DO NOTHING")
            .bind(tenant)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Tenant settings blob; unknown or missing fields fall back to
    /// defaults so schema evolution never breaks reads.
    pub async fn tenant_settings(&self, tenant: i64) -> Result<TenantSettings> {
        let raw: Option<String> = sqlx::query_scalar("SELECT settings FROM tenants WHERE id = ?")
            .bind(tenant)
            .fetch_optional(self.pool())
            .await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(TenantSettings::default()),
        }
    }

    pub async fn set_tenant_settings(&self, tenant: i64, settings: &TenantSettings) -> Result<()> {
        self.ensure_tenant(tenant).await?;
        sqlx::query("UPDATE tenants SET settings = ? WHERE id = ?")
            .bind(serde_json::to_string(settings)?)
            .bind(tenant)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Tenant-local date (ISO `YYYY-MM-DD`) of the last daily counter
    /// reset, used to run the reset exactly once per local day.
    pub async fn last_daily_reset(&self, tenant: i64) -> Result<Option<String>> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT last_daily_reset FROM tenants WHERE id = ?")
                .bind(tenant)
                .fetch_optional(self.pool())
                .await?;
        Ok(raw.flatten())
    }

    pub async fn set_last_daily_reset(&self, tenant: i64, local_date: &str) -> Result<()> {
        sqlx::query("UPDATE tenants SET last_daily_reset = ? WHERE id = ?")
            .bind(local_date)
            .bind(tenant)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
