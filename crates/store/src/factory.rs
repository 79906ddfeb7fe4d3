use common::{AuthTask, AuthTaskStatus, FactoryTask, Result, TaskStatus};

use crate::Store;

impl Store {
    /// Factory tasks still producing accounts.
    pub async fn open_factory_tasks(&self) -> Result<Vec<FactoryTask>> {
        let rows = sqlx::query_as::<_, FactoryTask>(
            "SELECT * FROM factory_tasks WHERE status IN ('pending', 'in_progress') ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn factory_task(&self, id: i64) -> Result<Option<FactoryTask>> {
        let row = sqlx::query_as::<_, FactoryTask>("SELECT * FROM factory_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn insert_factory_task(
        &self,
        tenant: i64,
        count: i64,
        country: &str,
        auto_warmup: bool,
        warmup_days: i64,
        role_distribution: &std::collections::BTreeMap<String, f64>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO factory_tasks (tenant, count, country, auto_warmup, warmup_days, role_distribution)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(count)
        .bind(country)
        .bind(auto_warmup)
        .bind(warmup_days)
        .bind(serde_json::to_string(role_distribution)?)
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn set_factory_task_status(&self, id: i64, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE factory_tasks SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn record_factory_created(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE factory_tasks SET created_count = created_count + 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record a failed attempt, keeping only the most recent errors.
    pub async fn record_factory_failure(&self, id: i64, error: &str) -> Result<()> {
        let Some(task) = self.factory_task(id).await? else { return Ok(()) };
        let mut errors = task.errors;
        errors.push(error.to_string());
        let keep = errors.len().saturating_sub(10);
        let errors = &errors[keep..];
        sqlx::query(
            "UPDATE factory_tasks SET failed_count = failed_count + 1, errors = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(errors)?)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ── Auth tasks ────────────────────────────────────────────────────────

    /// Tasks the auth worker can progress this tick.
    pub async fn open_auth_tasks(&self) -> Result<Vec<AuthTask>> {
        let rows = sqlx::query_as::<_, AuthTask>(
            "SELECT * FROM auth_tasks WHERE status IN ('pending', 'code_received') ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn auth_task(&self, id: i64) -> Result<Option<AuthTask>> {
        let row = sqlx::query_as::<_, AuthTask>("SELECT * FROM auth_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn insert_auth_task(
        &self,
        tenant: i64,
        phone: &str,
        account_id: Option<i64>,
        proxy: Option<&str>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO auth_tasks (tenant, phone, account_id, proxy, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(tenant)
        .bind(phone)
        .bind(account_id)
        .bind(proxy)
        .bind(chrono::Utc::now())
        .execute(self.pool())
        .await?;
        Ok(row.last_insert_rowid())
    }

    pub async fn set_auth_task_code_sent(&self, id: i64, ticket: &str) -> Result<()> {
        sqlx::query("UPDATE auth_tasks SET status = 'code_sent', ticket = ? WHERE id = ?")
            .bind(ticket)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Called by the UI side when the operator submits the code.
    pub async fn set_auth_task_code(&self, id: i64, code: &str) -> Result<()> {
        sqlx::query("UPDATE auth_tasks SET status = 'code_received', code = ? WHERE id = ?")
            .bind(code)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_auth_task_status(
        &self,
        id: i64,
        status: AuthTaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE auth_tasks SET status = ?, error = ? WHERE id = ?")
            .bind(status)
            .bind(error)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
