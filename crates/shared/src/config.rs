//! Process configuration
//!
//! Everything is read from the environment exactly once at startup and handed
//! to the engine as immutable structs. Invalid schedule strings or missing
//! channel credentials abort startup with a [`ConfigError`]; automation never
//! starts with undefined behavior.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors, fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {var} ({hint})")]
    MissingVar { var: &'static str, hint: &'static str },

    #[error("Invalid schedule in {var}: {value:?} (expected 24-hour HH:MM)")]
    InvalidSchedule { var: &'static str, value: String },

    #[error("Invalid value in {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

/// Parse a boolean feature flag the way the deployment sets them
pub fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    v == "true" || v == "1"
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

// =============================================================================
// Feature Gate
// =============================================================================

/// Process-wide automation toggles, read once at startup
///
/// Constructed at process start and passed explicitly into the scheduler and
/// dispatcher constructors; business logic never reads the environment.
/// Changing a flag requires a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGate {
    /// Assign slots to paid orders automatically
    pub auto_assignment: bool,
    /// Attempt due renewals from the scheduled scan
    pub auto_renewals: bool,
    /// Send reminders / credential payloads through the messaging channel
    pub auto_notifications: bool,
    /// Also send an email copy of each notification
    pub email_copies: bool,
    /// Purge terminal subscriptions and stale events on the cleanup schedule
    pub auto_cleanup: bool,
    /// Promote the default log filter to debug
    pub debug_logs: bool,
}

impl FeatureGate {
    pub fn from_env() -> Self {
        Self {
            auto_assignment: env_flag("ENABLE_AUTO_ASSIGNMENT"),
            auto_renewals: env_flag("ENABLE_AUTO_RENEWALS"),
            auto_notifications: env_flag("ENABLE_AUTO_NOTIFICATIONS"),
            email_copies: env_flag("ENABLE_EMAIL_SERVICE"),
            auto_cleanup: env_flag("ENABLE_AUTO_CLEANUP"),
            debug_logs: env_flag("ENABLE_AUTOMATION_DEBUG_LOGS"),
        }
    }

    /// All automations on; test fixtures start here
    pub fn all_enabled() -> Self {
        Self {
            auto_assignment: true,
            auto_renewals: true,
            auto_notifications: true,
            email_copies: true,
            auto_cleanup: true,
            debug_logs: false,
        }
    }

    pub fn all_disabled() -> Self {
        Self {
            auto_assignment: false,
            auto_renewals: false,
            auto_notifications: false,
            email_copies: false,
            auto_cleanup: false,
            debug_logs: false,
        }
    }
}

impl Default for FeatureGate {
    fn default() -> Self {
        Self::all_disabled()
    }
}

// =============================================================================
// Schedules
// =============================================================================

/// A daily wall-clock trigger time, validated against 24-hour `HH:MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTime {
    pub hour: u8,
    pub minute: u8,
}

impl ScheduleTime {
    /// Six-field cron expression firing once per day at this time
    pub fn to_cron(&self) -> String {
        format!("0 {} {} * * *", self.minute, self.hour)
    }
}

impl std::fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl std::str::FromStr for ScheduleTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(h), Some(m), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("not HH:MM: {:?}", s));
        };
        // Minutes must be two digits so "9:5" is rejected but "9:05" is fine
        if m.len() != 2 {
            return Err(format!("minutes must be two digits: {:?}", s));
        }
        let hour: u8 = h.parse().map_err(|_| format!("bad hour: {:?}", s))?;
        let minute: u8 = m.parse().map_err(|_| format!("bad minute: {:?}", s))?;
        if hour > 23 || minute > 59 {
            return Err(format!("out of range: {:?}", s));
        }
        Ok(Self { hour, minute })
    }
}

/// Daily trigger times for the two scheduled jobs
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// When the renewal check runs (`DAILY_RENEWAL_CHECK_TIME`, default 09:00)
    pub renewal_check: ScheduleTime,
    /// When the cleanup job runs (`DAILY_LOG_CLEANUP_TIME`, default 02:00)
    pub log_cleanup: ScheduleTime,
}

impl ScheduleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let renewal_raw = env_or("DAILY_RENEWAL_CHECK_TIME", "09:00");
        let cleanup_raw = env_or("DAILY_LOG_CLEANUP_TIME", "02:00");

        let renewal_check = renewal_raw.parse().map_err(|_| ConfigError::InvalidSchedule {
            var: "DAILY_RENEWAL_CHECK_TIME",
            value: renewal_raw.clone(),
        })?;
        let log_cleanup = cleanup_raw.parse().map_err(|_| ConfigError::InvalidSchedule {
            var: "DAILY_LOG_CLEANUP_TIME",
            value: cleanup_raw.clone(),
        })?;

        Ok(Self { renewal_check, log_cleanup })
    }
}

// =============================================================================
// Automation Tuning
// =============================================================================

/// Tuning knobs for lifecycle, retry, and retention behavior
///
/// The grace window and reminder thresholds are configuration, not hard-coded
/// assumptions; defaults follow the storefront's urgency buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationSettings {
    /// Days a missed renewal keeps its slot before expiring (`GRACE_PERIOD_DAYS`)
    pub grace_days: u16,
    /// Days-remaining values that trigger a reminder (`RENEWAL_REMINDER_DAYS`)
    pub reminder_thresholds: Vec<i64>,
    /// Days to keep terminal subscriptions and old events (`CLEANUP_RETENTION_DAYS`)
    pub retention_days: u32,
    /// Delivery attempts per notification before terminal failure
    pub max_notification_attempts: u32,
    /// Per-attempt timeout for outbound channel calls, seconds
    pub notification_timeout_secs: u64,
    /// Timeout for the renewal charge delegation, seconds
    pub charge_timeout_secs: u64,
    /// Optional ops webhook for terminal delivery failures (`OPS_ALERT_WEBHOOK_URL`)
    pub ops_webhook_url: Option<String>,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            grace_days: 3,
            reminder_thresholds: vec![7, 3, 1, 0],
            retention_days: 90,
            max_notification_attempts: 3,
            notification_timeout_secs: 10,
            charge_timeout_secs: 30,
            ops_webhook_url: None,
        }
    }
}

impl AutomationSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(raw) = std::env::var("GRACE_PERIOD_DAYS") {
            settings.grace_days = raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "GRACE_PERIOD_DAYS",
                value: raw.clone(),
            })?;
        }
        if let Ok(raw) = std::env::var("RENEWAL_REMINDER_DAYS") {
            let mut thresholds = Vec::new();
            for part in raw.split(',') {
                let days = part.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    var: "RENEWAL_REMINDER_DAYS",
                    value: raw.clone(),
                })?;
                thresholds.push(days);
            }
            settings.reminder_thresholds = thresholds;
        }
        if let Ok(raw) = std::env::var("CLEANUP_RETENTION_DAYS") {
            settings.retention_days = raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "CLEANUP_RETENTION_DAYS",
                value: raw.clone(),
            })?;
        }
        if let Ok(raw) = std::env::var("NOTIFICATION_MAX_ATTEMPTS") {
            settings.max_notification_attempts =
                raw.parse().map_err(|_| ConfigError::InvalidValue {
                    var: "NOTIFICATION_MAX_ATTEMPTS",
                    value: raw.clone(),
                })?;
        }
        settings.ops_webhook_url = std::env::var("OPS_ALERT_WEBHOOK_URL").ok();

        Ok(settings)
    }
}

// =============================================================================
// Channel Credentials
// =============================================================================

/// Chatwoot (WhatsApp messaging) credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatwootConfig {
    /// Base URL of the Chatwoot installation
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_token: String,
    pub account_id: String,
    /// Inbox wired to the WhatsApp provider
    pub inbox_id: String,
}

impl ChatwootConfig {
    /// Read Chatwoot credentials; `None` when the channel is not configured
    /// at all, `Err` when it is partially configured.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let base_url = std::env::var("CHATWOOT_BASE_URL").ok();
        let api_token = std::env::var("CHATWOOT_API_TOKEN").ok();
        let account_id = std::env::var("CHATWOOT_ACCOUNT_ID").ok();
        let inbox_id = std::env::var("CHATWOOT_INBOX_ID").ok();

        if base_url.is_none() && api_token.is_none() && account_id.is_none() && inbox_id.is_none() {
            return Ok(None);
        }

        let require = |value: Option<String>, var: &'static str| {
            value.ok_or(ConfigError::MissingVar {
                var,
                hint: "all CHATWOOT_* variables must be set together",
            })
        };

        Ok(Some(Self {
            base_url: require(base_url, "CHATWOOT_BASE_URL")?,
            api_token: require(api_token, "CHATWOOT_API_TOKEN")?,
            account_id: require(account_id, "CHATWOOT_ACCOUNT_ID")?,
            inbox_id: require(inbox_id, "CHATWOOT_INBOX_ID")?,
        }))
    }
}

/// Email (Resend) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(skip_serializing)]
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    pub support_email: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: env_or("EMAIL_FROM", "Cuenty <noreply@cuenty.shop>"),
            app_name: env_or("APP_NAME", "Cuenty"),
            support_email: env_or("SUPPORT_EMAIL", "soporte@cuenty.shop"),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

// =============================================================================
// Top-Level Config
// =============================================================================

/// Everything a process needs, resolved once at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub features: FeatureGate,
    pub schedules: ScheduleConfig,
    pub automation: AutomationSettings,
    pub chatwoot: Option<ChatwootConfig>,
    pub email: EmailConfig,
}

impl AppConfig {
    /// Load and cross-validate the full configuration.
    ///
    /// Enabling an automation that needs a channel without configuring that
    /// channel is a startup error, not a runtime surprise.
    pub fn from_env() -> Result<Self, ConfigError> {
        let features = FeatureGate::from_env();
        let schedules = ScheduleConfig::from_env()?;
        let automation = AutomationSettings::from_env()?;
        let chatwoot = ChatwootConfig::from_env()?;
        let email = EmailConfig::from_env();

        if (features.auto_notifications || features.auto_assignment) && chatwoot.is_none() {
            return Err(ConfigError::MissingVar {
                var: "CHATWOOT_API_TOKEN",
                hint: "messaging automations are enabled but no Chatwoot channel is configured",
            });
        }
        if features.email_copies && !email.is_enabled() {
            return Err(ConfigError::MissingVar {
                var: "RESEND_API_KEY",
                hint: "ENABLE_EMAIL_SERVICE is on but no Resend API key is configured",
            });
        }

        Ok(Self {
            features,
            schedules,
            automation,
            chatwoot,
            email,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_time_valid() {
        let t: ScheduleTime = "09:00".parse().unwrap();
        assert_eq!((t.hour, t.minute), (9, 0));

        let t: ScheduleTime = "23:59".parse().unwrap();
        assert_eq!((t.hour, t.minute), (23, 59));

        let t: ScheduleTime = "0:05".parse().unwrap();
        assert_eq!((t.hour, t.minute), (0, 5));
    }

    #[test]
    fn test_schedule_time_invalid() {
        assert!("24:00".parse::<ScheduleTime>().is_err());
        assert!("12:60".parse::<ScheduleTime>().is_err());
        assert!("12".parse::<ScheduleTime>().is_err());
        assert!("12:5".parse::<ScheduleTime>().is_err());
        assert!("12:05:00".parse::<ScheduleTime>().is_err());
        assert!("noon".parse::<ScheduleTime>().is_err());
        assert!("".parse::<ScheduleTime>().is_err());
    }

    #[test]
    fn test_schedule_time_cron() {
        let t: ScheduleTime = "09:30".parse().unwrap();
        assert_eq!(t.to_cron(), "0 30 9 * * *");

        let t: ScheduleTime = "02:00".parse().unwrap();
        assert_eq!(t.to_cron(), "0 0 2 * * *");
    }

    #[test]
    fn test_schedule_time_display_round_trip() {
        let t: ScheduleTime = "7:05".parse().unwrap();
        assert_eq!(t.to_string(), "07:05");
        let again: ScheduleTime = t.to_string().parse().unwrap();
        assert_eq!(again, t);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("1"));
        assert!(parse_flag(" true "));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("yes"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_feature_gate_defaults_off() {
        let gate = FeatureGate::default();
        assert!(!gate.auto_renewals);
        assert!(!gate.auto_notifications);
        assert!(!gate.auto_assignment);
    }

    #[test]
    fn test_automation_settings_defaults() {
        let settings = AutomationSettings::default();
        assert_eq!(settings.grace_days, 3);
        assert_eq!(settings.reminder_thresholds, vec![7, 3, 1, 0]);
        assert_eq!(settings.retention_days, 90);
    }
}
