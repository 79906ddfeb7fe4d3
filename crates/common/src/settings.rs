use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::types::HerderStrategy;

/// How aggressively the tenant is willing to push its accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HerderSettings {
    pub default_strategy: HerderStrategy,
    /// Hard per-account daily action cap across all assignments.
    pub max_actions_per_account: i64,
    pub coordinate_discussions: bool,
    pub seasonal_behavior: bool,
    pub quiet_mode_threshold: i64,
}

impl Default for HerderSettings {
    fn default() -> Self {
        Self {
            default_strategy: HerderStrategy::Observer,
            max_actions_per_account: 50,
            coordinate_discussions: false,
            seasonal_behavior: false,
            quiet_mode_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorySettings {
    pub default_warmup_days: i64,
    pub auto_proxy_assignment: bool,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            default_warmup_days: 5,
            auto_proxy_assignment: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCredentials {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_max_response_length")]
    pub max_response_length: usize,
}

fn default_max_response_length() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsCredentials {
    pub base_url: String,
    pub api_key: String,
}

/// Tenant-scoped settings consulted by every worker per tick. Stored as
/// one JSON blob on the tenant row; unknown fields fall back to defaults
/// so old rows keep deserializing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    /// Quiet-hours window in tenant-local time, `HH:MM`. A start after
    /// the end means the window wraps midnight.
    pub quiet_hours_start: String,
    pub quiet_hours_end: String,
    /// IANA timezone name.
    pub timezone: String,
    pub daily_limit: i64,
    pub delay_min: i64,
    pub delay_max: i64,
    pub mailing_cache_ttl_days: i64,
    pub auto_blacklist_enabled: bool,
    pub warmup_before_mailing: bool,
    pub warmup_duration_minutes: i64,
    pub risk_tolerance: RiskTolerance,
    pub learning_mode: bool,
    pub auto_recovery_mode: bool,
    pub report_every: i64,
    pub notify_chat_id: Option<i64>,
    pub herder: HerderSettings,
    pub factory: FactorySettings,
    pub llm: Option<LlmCredentials>,
    pub sms: Option<SmsCredentials>,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            quiet_hours_start: "23:00".to_string(),
            quiet_hours_end: "08:00".to_string(),
            timezone: "Europe/Moscow".to_string(),
            daily_limit: 30,
            delay_min: 30,
            delay_max: 90,
            mailing_cache_ttl_days: 30,
            auto_blacklist_enabled: true,
            warmup_before_mailing: false,
            warmup_duration_minutes: 15,
            risk_tolerance: RiskTolerance::Medium,
            learning_mode: false,
            auto_recovery_mode: true,
            report_every: 50,
            notify_chat_id: None,
            herder: HerderSettings::default(),
            factory: FactorySettings::default(),
            llm: None,
            sms: None,
        }
    }
}

impl TenantSettings {
    /// Tenant timezone, falling back to Europe/Moscow on a bad name.
    pub fn tz(&self) -> Tz {
        self.timezone
            .parse()
            .unwrap_or(chrono_tz::Europe::Moscow)
    }

    /// The given instant in tenant-local time.
    pub fn local(&self, at: DateTime<Utc>) -> DateTime<Tz> {
        at.with_timezone(&self.tz())
    }

    /// Whether `at` falls inside the tenant's quiet hours.
    /// `[23:00, 08:00)` wraps midnight: 00:30 and 07:59 are quiet,
    /// 08:00 and 22:59 are not.
    pub fn quiet_hours_active(&self, at: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (
            parse_hhmm(&self.quiet_hours_start),
            parse_hhmm(&self.quiet_hours_end),
        ) else {
            return false;
        };
        if start == end {
            return false;
        }
        let now = self.local(at).time();
        if start > end {
            now >= start || now < end
        } else {
            now >= start && now < end
        }
    }
}

/// Parse an `HH:MM` clock string.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> TenantSettings {
        TenantSettings {
            timezone: "UTC".to_string(),
            quiet_hours_start: "23:00".to_string(),
            quiet_hours_end: "08:00".to_string(),
            ..TenantSettings::default()
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
    }

    #[test]
    fn quiet_hours_wrap_midnight() {
        let s = settings();
        assert!(s.quiet_hours_active(at(0, 30)));
        assert!(s.quiet_hours_active(at(7, 59)));
        assert!(s.quiet_hours_active(at(23, 0)));
        assert!(!s.quiet_hours_active(at(8, 0)));
        assert!(!s.quiet_hours_active(at(22, 59)));
    }

    #[test]
    fn quiet_hours_non_wrapping_window() {
        let s = TenantSettings {
            quiet_hours_start: "01:00".to_string(),
            quiet_hours_end: "05:00".to_string(),
            ..settings()
        };
        assert!(s.quiet_hours_active(at(3, 0)));
        assert!(!s.quiet_hours_active(at(0, 59)));
        assert!(!s.quiet_hours_active(at(5, 0)));
    }

    #[test]
    fn equal_bounds_disable_quiet_hours() {
        let s = TenantSettings {
            quiet_hours_start: "08:00".to_string(),
            quiet_hours_end: "08:00".to_string(),
            ..settings()
        };
        assert!(!s.quiet_hours_active(at(8, 0)));
        assert!(!s.quiet_hours_active(at(12, 0)));
    }

    #[test]
    fn settings_deserialize_from_empty_object() {
        let s: TenantSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.timezone, "Europe/Moscow");
        assert_eq!(s.daily_limit, 30);
        assert!(s.llm.is_none());
    }
}
