use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use tracing::{error, info};

use common::{Result, TenantSettings};
use vendors::Notifier;

/// One background loop. `tick` processes one batch of due work and
/// returns; the loop owns the cadence and the catch-all.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn tick(&self) -> Result<()>;
}

/// Drive a worker forever. The tick boundary is the only place a
/// catch-all lives: an error is logged and the loop keeps going.
/// Call from `tokio::spawn`.
pub async fn run_loop(worker: Arc<dyn Worker>, interval: Duration) {
    info!(worker = worker.name(), "worker loop starting");
    loop {
        if let Err(e) = worker.tick().await {
            error!(worker = worker.name(), error = %e, "tick failed");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Deliver a tenant notification if the tenant has a chat configured.
pub(crate) async fn notify_tenant(notifier: &dyn Notifier, settings: &TenantSettings, message: &str) {
    if let Some(chat_id) = settings.notify_chat_id {
        notifier.notify(chat_id, message).await;
    }
}

/// Tenant-local calendar date of `now`, as `YYYY-MM-DD`.
pub(crate) fn local_date(settings: &TenantSettings, now: DateTime<Utc>) -> String {
    settings.local(now).date_naive().to_string()
}

/// The instant of the tenant-local midnight preceding `now`, in UTC.
/// Daily quotas count events at or after this instant.
pub(crate) fn local_midnight_utc(settings: &TenantSettings, now: DateTime<Utc>) -> DateTime<Utc> {
    let tz = settings.tz();
    let local_day = settings.local(now).date_naive();
    let midnight = local_day.and_time(NaiveTime::MIN);
    match midnight.and_local_timezone(tz) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        // DST gap or fold at midnight: fall back to now minus the local
        // time-of-day, close enough for a daily counter.
        _ => now - (settings.local(now).time() - NaiveTime::MIN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn local_midnight_respects_timezone() {
        let mut settings = TenantSettings::default();
        settings.timezone = "Europe/Moscow".to_string();
        // 01:30 UTC = 04:30 MSK, so local midnight is 21:00 UTC yesterday.
        let now = Utc.with_ymd_and_hms(2024, 6, 4, 1, 30, 0).unwrap();
        let midnight = local_midnight_utc(&settings, now);
        assert_eq!(midnight, Utc.with_ymd_and_hms(2024, 6, 3, 21, 0, 0).unwrap());
    }

    #[test]
    fn local_date_rolls_at_tenant_midnight() {
        let mut settings = TenantSettings::default();
        settings.timezone = "Europe/Moscow".to_string();
        let before = Utc.with_ymd_and_hms(2024, 6, 3, 20, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 3, 21, 1, 0).unwrap();
        assert_eq!(local_date(&settings, before), "2024-06-03");
        assert_eq!(local_date(&settings, after), "2024-06-04");
    }
}
