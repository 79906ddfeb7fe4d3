use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use common::Result;
use store::Store;

use crate::base::{local_date, Worker};

/// Clears per-account daily counters once per tenant-local day. Runs on
/// the normal tick cadence; the stored last-reset date makes the clear
/// happen exactly once after each tenant midnight, before any send of
/// the new day is attempted.
pub struct DailyResetWorker {
    store: Store,
}

impl DailyResetWorker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Worker for DailyResetWorker {
    fn name(&self) -> &'static str {
        "daily_reset_worker"
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        for tenant in self.store.tenant_ids().await? {
            let settings = self.store.tenant_settings(tenant).await?;
            let today = local_date(&settings, now);
            if self.store.last_daily_reset(tenant).await?.as_deref() == Some(today.as_str()) {
                continue;
            }
            let cleared = self.store.reset_daily_counters(tenant).await?;
            self.store.set_last_daily_reset(tenant, &today).await?;
            if cleared > 0 {
                info!(tenant, cleared, date = %today, "daily counters reset");
            }
        }
        Ok(())
    }
}
