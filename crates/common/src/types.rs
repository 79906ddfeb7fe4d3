use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a fleet account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Active,
    FloodWait,
    Blocked,
    Error,
    PausedRisk,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountStatus::Pending => write!(f, "pending"),
            AccountStatus::Active => write!(f, "active"),
            AccountStatus::FloodWait => write!(f, "flood_wait"),
            AccountStatus::Blocked => write!(f, "blocked"),
            AccountStatus::Error => write!(f, "error"),
            AccountStatus::PausedRisk => write!(f, "paused_risk"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum WarmupStatus {
    None,
    InProgress,
    Completed,
    Paused,
}

/// Behavioral role assigned at creation; drives herder strategy defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum AccountRole {
    Observer,
    Expert,
    Support,
    Trendsetter,
    Community,
}

impl std::fmt::Display for AccountRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountRole::Observer => write!(f, "observer"),
            AccountRole::Expert => write!(f, "expert"),
            AccountRole::Support => write!(f, "support"),
            AccountRole::Trendsetter => write!(f, "trendsetter"),
            AccountRole::Community => write!(f, "community"),
        }
    }
}

/// One Telegram user identity owned by a tenant and driven by the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub tenant: i64,
    pub phone: String,
    pub status: AccountStatus,
    pub daily_sent: i64,
    pub daily_limit: i64,
    pub daily_errors: i64,
    /// 0–100; adjusted only through session-manager feedback.
    pub reliability_score: f64,
    pub consecutive_errors: i64,
    pub flood_wait_until: Option<DateTime<Utc>>,
    pub warmup_status: WarmupStatus,
    pub role: AccountRole,
    pub folder: Option<String>,
    pub proxy: Option<String>,
    pub telegram_id: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn daily_remaining(&self) -> i64 {
        (self.daily_limit - self.daily_sent).max(0)
    }
}

/// State machine of a mass-send campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
    Scheduled,
    Error,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Stopped | CampaignStatus::Completed | CampaignStatus::Error
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Pending => write!(f, "pending"),
            CampaignStatus::Running => write!(f, "running"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Stopped => write!(f, "stopped"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Scheduled => write!(f, "scheduled"),
            CampaignStatus::Error => write!(f, "error"),
        }
    }
}

/// A mass-send job consuming one audience through a pool of accounts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: i64,
    pub tenant: i64,
    pub source_id: i64,
    pub template_id: i64,
    /// Explicit sender pool. Empty means "every account in `folder`".
    #[sqlx(json)]
    pub account_ids: Vec<i64>,
    pub folder: Option<String>,
    pub status: CampaignStatus,
    pub sent_count: i64,
    pub failed_count: i64,
    pub total_count: i64,
    pub current_account: Option<i64>,
    /// Rotation cursor into the eligible pool; persisted so pause/resume
    /// keeps its position.
    pub next_account_index: i64,
    pub warm_start: bool,
    pub typing_sim: bool,
    pub adaptive_delays: bool,
    pub smart_personalization: bool,
    pub delay_min: i64,
    pub delay_max: i64,
    /// ≥ 1.0; scaled up on adverse signals, down on calm ones.
    pub adaptive_multiplier: f64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A parsed set of target users.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AudienceSource {
    pub id: i64,
    pub tenant: i64,
    pub title: String,
    pub total_count: i64,
    pub created_at: DateTime<Utc>,
}

/// One member of an audience. `sent` is the at-most-once idempotency
/// mark per (campaign source, user).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AudienceMember {
    pub id: i64,
    pub source_id: i64,
    pub telegram_id: i64,
    pub access_hash: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub sent: bool,
}

/// The five herder behaviors form a closed set; each maps to a post
/// selector and comment style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum HerderStrategy {
    Observer,
    Expert,
    Support,
    Trendsetter,
    Community,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Read,
    React,
    Comment,
    Save,
}

/// One step of a herder action chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub kind: ActionKind,
    /// Bernoulli activation probability in [0, 1].
    pub probability: f64,
    /// Uniform sleep range (seconds) after the step.
    pub delay_after: (u64, u64),
    #[serde(default)]
    pub emoji: Vec<String>,
    #[serde(default)]
    pub min_engagement: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Paused,
    Stopped,
}

/// A standing instruction to engage with one monitored channel.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HerderAssignment {
    pub id: i64,
    pub tenant: i64,
    pub channel_id: i64,
    #[sqlx(json)]
    pub account_ids: Vec<i64>,
    pub strategy: HerderStrategy,
    #[sqlx(json)]
    pub action_chain: Vec<ActionStep>,
    pub max_comments_per_day: i64,
    pub delay_after_post_min: i64,
    pub delay_after_post_max: i64,
    pub coordinate_discussions: bool,
    pub seasonal_behavior: bool,
    pub status: AssignmentStatus,
    pub total_actions: i64,
    pub total_comments: i64,
    pub deleted_comments: i64,
    pub paused_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MonitoredChannel {
    pub id: i64,
    pub tenant: i64,
    pub username: String,
    pub title: Option<String>,
}

/// A channel the tenant owns; publish target for the content worker.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantChannel {
    pub id: i64,
    pub tenant: i64,
    pub username: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Error,
}

/// A batch order for new accounts from the SMS vendor.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FactoryTask {
    pub id: i64,
    pub tenant: i64,
    pub count: i64,
    pub country: String,
    pub auto_warmup: bool,
    pub warmup_days: i64,
    /// role name → weight; weights sum to ≤ 1.0, remainder falls through
    /// to `observer`.
    #[sqlx(json)]
    pub role_distribution: std::collections::BTreeMap<String, f64>,
    pub status: TaskStatus,
    pub created_count: i64,
    pub failed_count: i64,
    #[sqlx(json)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum WarmupKind {
    Standard,
    WarmAccount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedAction {
    pub day: i64,
    pub action: String,
    pub at: DateTime<Utc>,
}

/// Day-indexed warmup program; advanced at most once per tenant-local day.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WarmupProgress {
    pub id: i64,
    pub account_id: i64,
    pub kind: WarmupKind,
    pub total_days: i64,
    pub current_day: i64,
    pub status: TaskStatus,
    #[sqlx(json)]
    pub completed_actions: Vec<CompletedAction>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub target_folder: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum AuthTaskStatus {
    Pending,
    CodeSent,
    CodeReceived,
    TwoFaRequired,
    Completed,
    Error,
}

/// Interactive authorization of a manually added account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuthTask {
    pub id: i64,
    pub tenant: i64,
    pub phone: String,
    pub account_id: Option<i64>,
    pub proxy: Option<String>,
    pub status: AuthTaskStatus,
    pub code: Option<String>,
    pub password: Option<String>,
    /// Session-manager ticket mapping to the pending login token.
    pub ticket: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum RepeatMode {
    Once,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Queued,
    Completed,
    Error,
}

/// A mailing armed to start at a future time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledMailing {
    pub id: i64,
    pub tenant: i64,
    pub source_id: i64,
    pub template_id: i64,
    pub folder: Option<String>,
    pub warm_start: bool,
    pub scheduled_at: DateTime<Utc>,
    pub repeat_mode: RepeatMode,
    pub status: ScheduleStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A generic recurring job (warmup sweep, etc.) armed in the store.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledTask {
    pub id: i64,
    pub tenant: i64,
    pub kind: String,
    #[sqlx(json)]
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub repeat_mode: RepeatMode,
    pub status: ScheduleStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A one-shot channel post armed in the store.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledContent {
    pub id: i64,
    pub tenant: i64,
    pub channel_id: i64,
    pub text: String,
    pub media_path: Option<String>,
    pub use_ai_rewrite: bool,
    pub scheduled_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub message_id: Option<i64>,
    pub error: Option<String>,
}

/// Recurring template post: fires when the tenant-local minute equals
/// `publish_time` on an allowed weekday.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TemplateSchedule {
    pub id: i64,
    pub tenant: i64,
    pub template_id: i64,
    pub channel_id: i64,
    /// Allowed weekdays, Monday = 0.
    #[sqlx(json)]
    pub repeat_days: Vec<u8>,
    /// `HH:MM` in tenant-local time.
    pub publish_time: String,
    pub use_ai_rewrite: bool,
    pub last_published_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageTemplate {
    pub id: i64,
    pub tenant: i64,
    pub name: String,
    pub text: String,
    pub media_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum BlacklistSource {
    Manual,
    AutoResponse,
    AutoBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlacklistEntry {
    pub id: i64,
    pub tenant: i64,
    pub telegram_id: Option<i64>,
    pub username: Option<String>,
    pub source: BlacklistSource,
    pub created_at: DateTime<Utc>,
}

/// A phrase that, when found in a recipient's reply, blacklists the
/// sender of that reply.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StopTrigger {
    pub id: i64,
    pub tenant: i64,
    pub phrase: String,
    pub is_active: bool,
    pub hits_count: i64,
}

/// Per-(weekday, hour) send statistics; read by the pacing engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::FromRow)]
pub struct HourlyStat {
    pub tenant: i64,
    pub day_of_week: i64,
    pub hour: i64,
    pub sent: i64,
    pub success: i64,
    pub failed: i64,
    pub flood_waits: i64,
}

/// An order to collect an audience from a channel or chat.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ParsingTask {
    pub id: i64,
    pub tenant: i64,
    /// Channel username or t.me link.
    pub source_link: String,
    pub source_id: Option<i64>,
    /// Preferred parser account; any active account when absent.
    pub account_id: Option<i64>,
    pub status: TaskStatus,
    pub parsed_count: i64,
    pub total_count: i64,
    pub error: Option<String>,
}

/// Tenant-wide kill switch. When set, every worker treats the tenant's
/// rows as invisible.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PanicFlag {
    pub tenant: i64,
    pub is_paused: bool,
    pub reason: Option<String>,
    pub auto_resume_at: Option<DateTime<Utc>>,
}

/// Persona attributes created by the factory; feeds LLM comment prompts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountProfile {
    pub account_id: i64,
    pub persona: String,
    #[sqlx(json)]
    pub interests: Vec<String>,
    pub speech_style: String,
    #[sqlx(json)]
    pub preferred_reactions: Vec<String>,
}

/// An inbound reply captured by the gateway side of the store, waiting
/// for stop-trigger scanning.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboundReply {
    pub id: i64,
    pub tenant: i64,
    pub from_telegram_id: i64,
    pub from_username: Option<String>,
    pub text: String,
    pub processed: bool,
    pub received_at: DateTime<Utc>,
}
