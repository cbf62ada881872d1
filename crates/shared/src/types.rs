//! Common types used across Cuenty

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_wrapper!(
    /// Shared third-party account ID wrapper
    AccountId
);
id_wrapper!(
    /// Subscription ID wrapper
    SubscriptionId
);
id_wrapper!(
    /// Service plan ID wrapper
    PlanId
);
id_wrapper!(
    /// Combo (plan bundle) ID wrapper
    ComboId
);
id_wrapper!(
    /// Customer ID wrapper
    CustomerId
);
id_wrapper!(
    /// Storefront order ID wrapper
    OrderId
);

// =============================================================================
// Enums
// =============================================================================

/// Subscription lifecycle state
///
/// `PendingRenewal` is a presentation state: stored rows hold `Active` while a
/// renewal attempt for the current cycle is in flight, and reporting surfaces
/// derive `PendingRenewal` from the attempt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Active,
    PendingRenewal,
    Grace,
    Expired,
    Cancelled,
    Paused,
}

impl SubscriptionState {
    /// Whether this state admits no further transitions (except cleanup)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled)
    }

    /// Whether the subscription is scanned by the renewal scheduler
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Grace)
    }

    /// Whether a subscription in this state holds a slot
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::PendingRenewal | Self::Grace | Self::Paused
        )
    }

    /// Whether a stored-state transition from `self` to `to` is legal
    ///
    /// Self-loops on Active (successful renewal) and Grace (failed manual
    /// renewal) are legal. `PendingRenewal` validates as Active since it is
    /// never stored.
    pub fn can_transition_to(&self, to: SubscriptionState) -> bool {
        use SubscriptionState::*;
        let from = match self {
            PendingRenewal => Active,
            other => *other,
        };
        let to = match to {
            PendingRenewal => Active,
            other => other,
        };
        match from {
            Pending => matches!(to, Active),
            Active => matches!(to, Active | Grace | Cancelled | Paused),
            Grace => matches!(to, Active | Grace | Expired | Cancelled),
            Paused => matches!(to, Active | Cancelled),
            Expired | Cancelled => false,
            PendingRenewal => false, // unreachable, mapped above
        }
    }

    /// The set of states reachable from `self` in one stored transition
    pub fn reachable(&self) -> Vec<SubscriptionState> {
        use SubscriptionState::*;
        [Pending, Active, Grace, Expired, Cancelled, Paused]
            .into_iter()
            .filter(|to| self.can_transition_to(*to))
            .collect()
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::PendingRenewal => "pending_renewal",
            Self::Grace => "grace",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SubscriptionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "pending_renewal" => Ok(Self::PendingRenewal),
            "grace" => Ok(Self::Grace),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid subscription state: {}", s)),
        }
    }
}

/// Outcome of a renewal attempt (idempotency record status)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalStatus {
    Scheduled,
    Succeeded,
    Failed,
    Skipped,
}

impl RenewalStatus {
    /// Whether the attempt reached a terminal outcome
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

impl std::fmt::Display for RenewalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RenewalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid renewal status: {}", s)),
        }
    }
}

/// Notification template kind, part of the event idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Renewal is coming up (7 / 3 days out)
    ReminderSoon,
    /// Renewal is due tomorrow or today
    ReminderUrgent,
    /// Account credentials for a newly assigned slot
    CredentialDelivery,
    /// The grace window elapsed and the subscription expired
    ExpiryNotice,
    /// A renewal charge went through
    RenewalReceipt,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ReminderSoon => "reminder_soon",
            Self::ReminderUrgent => "reminder_urgent",
            Self::CredentialDelivery => "credential_delivery",
            Self::ExpiryNotice => "expiry_notice",
            Self::RenewalReceipt => "renewal_receipt",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reminder_soon" => Ok(Self::ReminderSoon),
            "reminder_urgent" => Ok(Self::ReminderUrgent),
            "credential_delivery" => Ok(Self::CredentialDelivery),
            "expiry_notice" => Ok(Self::ExpiryNotice),
            "renewal_receipt" => Ok(Self::RenewalReceipt),
            _ => Err(format!("Invalid notification kind: {}", s)),
        }
    }
}

/// Delivery status of a notification event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid notification status: {}", s)),
        }
    }
}

/// Days-remaining bucket used to decide reminder cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyTier {
    /// Due today or overdue
    DueNow,
    /// Due tomorrow
    OneDay,
    /// Due in 2-3 days
    TwoToThreeDays,
    /// Due in 4-7 days
    FourToSevenDays,
    /// More than a week out
    Later,
}

impl UrgencyTier {
    pub fn from_days_remaining(days: i64) -> Self {
        match days {
            d if d <= 0 => Self::DueNow,
            1 => Self::OneDay,
            2..=3 => Self::TwoToThreeDays,
            4..=7 => Self::FourToSevenDays,
            _ => Self::Later,
        }
    }
}

impl std::fmt::Display for UrgencyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DueNow => "due_now",
            Self::OneDay => "one_day",
            Self::TwoToThreeDays => "two_to_three_days",
            Self::FourToSevenDays => "four_to_seven_days",
            Self::Later => "later",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Core Models
// =============================================================================

/// A shared third-party account with a fixed number of leasable slots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Service slug this account belongs to (e.g. "netflix")
    pub service: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Fixed number of usable slots (profiles) on this account
    pub capacity: u32,
    /// Deactivated accounts are never allocated; renewals reassign away from them
    pub active: bool,
    pub created_at: OffsetDateTime,
}

impl Account {
    pub fn new(service: impl Into<String>, email: impl Into<String>, password: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: AccountId::new(),
            service: service.into(),
            email: email.into(),
            password: password.into(),
            capacity,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Reference to one lease unit on an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    pub account_id: AccountId,
    pub slot_index: u32,
}

/// Full state of one slot, as held by the account store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub account_id: AccountId,
    pub slot_index: u32,
    /// The subscription currently leasing this slot, if any
    pub occupied_by: Option<SubscriptionId>,
    pub profile_label: Option<String>,
}

/// Point-in-time capacity snapshot for one account (advisory; `reserve_slot`
/// is the authority under concurrency)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCapacity {
    pub account_id: AccountId,
    pub service: String,
    pub capacity: u32,
    pub occupied: u32,
    pub active: bool,
}

/// A purchasable offering. Immutable once referenced by a live subscription;
/// the engine only reads plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub service: String,
    pub name: String,
    pub duration_days: u32,
    pub price_cents: i64,
    pub cost_cents: i64,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

/// One (plan, quantity) line of a combo
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComboLine {
    pub plan_id: PlanId,
    pub quantity: u32,
}

/// A bundle of plans sold as one purchasable unit with aggregated pricing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Combo {
    pub id: ComboId,
    pub name: String,
    pub description: Option<String>,
    pub lines: Vec<ComboLine>,
    /// When true, totals are derived from the constituent plans; otherwise the
    /// overrides below are authoritative
    pub auto_calculate: bool,
    pub price_override_cents: Option<i64>,
    pub cost_override_cents: Option<i64>,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

/// The lifecycle unit: one customer's time-boxed lease on one slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub customer_id: CustomerId,
    pub plan_id: PlanId,
    /// The storefront order that created this subscription, if known
    pub order_id: Option<OrderId>,
    /// Null until a slot is allocated
    pub slot: Option<SlotRef>,
    pub state: SubscriptionState,
    pub auto_renew: bool,
    pub start_date: Option<Date>,
    pub next_renewal_date: Date,
    pub renewals_completed: u32,
    /// WhatsApp handle for the messaging channel
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Whole days until the next renewal date; negative when overdue
    pub fn days_remaining(&self, today: Date) -> i64 {
        (self.next_renewal_date - today).whole_days()
    }

    pub fn urgency(&self, today: Date) -> UrgencyTier {
        UrgencyTier::from_days_remaining(self.days_remaining(today))
    }
}

/// Idempotency record preventing double-processing of a renewal cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalAttempt {
    pub subscription_id: SubscriptionId,
    pub cycle_date: Date,
    pub status: RenewalStatus,
    pub retry_count: u32,
    /// Charge reference returned by the payment collaborator
    pub reference: Option<String>,
    pub error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl RenewalAttempt {
    pub fn scheduled(subscription_id: SubscriptionId, cycle_date: Date) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            subscription_id,
            cycle_date,
            status: RenewalStatus::Scheduled,
            retry_count: 0,
            reference: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Idempotency record guaranteeing at most one successful delivery per
/// (subscription, kind, cycle day)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub subscription_id: SubscriptionId,
    pub kind: NotificationKind,
    pub cycle_date: Date,
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Provider message reference when delivery was confirmed
    pub message_ref: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl NotificationEvent {
    pub fn pending(subscription_id: SubscriptionId, kind: NotificationKind, cycle_date: Date) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            subscription_id,
            kind,
            cycle_date,
            status: NotificationStatus::Pending,
            retry_count: 0,
            last_error: None,
            message_ref: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_parse() {
        for state in [
            SubscriptionState::Pending,
            SubscriptionState::Active,
            SubscriptionState::PendingRenewal,
            SubscriptionState::Grace,
            SubscriptionState::Expired,
            SubscriptionState::Cancelled,
            SubscriptionState::Paused,
        ] {
            let parsed: SubscriptionState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("limbo".parse::<SubscriptionState>().is_err());
    }

    #[test]
    fn test_active_one_step_reachability() {
        let reachable = SubscriptionState::Active.reachable();
        assert_eq!(
            reachable,
            vec![
                SubscriptionState::Active,
                SubscriptionState::Grace,
                SubscriptionState::Cancelled,
                SubscriptionState::Paused,
            ]
        );
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_transitions() {
        assert!(SubscriptionState::Expired.reachable().is_empty());
        assert!(SubscriptionState::Cancelled.reachable().is_empty());
    }

    #[test]
    fn test_grace_transitions() {
        let g = SubscriptionState::Grace;
        assert!(g.can_transition_to(SubscriptionState::Active)); // manual renewal
        assert!(g.can_transition_to(SubscriptionState::Expired)); // window elapsed
        assert!(g.can_transition_to(SubscriptionState::Cancelled));
        assert!(!g.can_transition_to(SubscriptionState::Paused));
    }

    #[test]
    fn test_paused_transitions() {
        let p = SubscriptionState::Paused;
        assert!(p.can_transition_to(SubscriptionState::Active));
        assert!(p.can_transition_to(SubscriptionState::Cancelled));
        assert!(!p.can_transition_to(SubscriptionState::Grace));
    }

    #[test]
    fn test_pending_renewal_validates_as_active() {
        let pr = SubscriptionState::PendingRenewal;
        assert!(pr.can_transition_to(SubscriptionState::Grace));
        assert!(SubscriptionState::Active.can_transition_to(SubscriptionState::PendingRenewal));
    }

    #[test]
    fn test_holds_slot() {
        assert!(SubscriptionState::Active.holds_slot());
        assert!(SubscriptionState::Grace.holds_slot());
        assert!(SubscriptionState::Paused.holds_slot());
        assert!(!SubscriptionState::Pending.holds_slot());
        assert!(!SubscriptionState::Expired.holds_slot());
        assert!(!SubscriptionState::Cancelled.holds_slot());
    }

    #[test]
    fn test_urgency_tiers() {
        assert_eq!(UrgencyTier::from_days_remaining(-5), UrgencyTier::DueNow);
        assert_eq!(UrgencyTier::from_days_remaining(0), UrgencyTier::DueNow);
        assert_eq!(UrgencyTier::from_days_remaining(1), UrgencyTier::OneDay);
        assert_eq!(UrgencyTier::from_days_remaining(2), UrgencyTier::TwoToThreeDays);
        assert_eq!(UrgencyTier::from_days_remaining(3), UrgencyTier::TwoToThreeDays);
        assert_eq!(UrgencyTier::from_days_remaining(4), UrgencyTier::FourToSevenDays);
        assert_eq!(UrgencyTier::from_days_remaining(7), UrgencyTier::FourToSevenDays);
        assert_eq!(UrgencyTier::from_days_remaining(8), UrgencyTier::Later);
    }

    #[test]
    fn test_days_remaining() {
        use time::macros::date;
        let mut sub = sample_subscription();
        sub.next_renewal_date = date!(2025 - 03 - 10);
        assert_eq!(sub.days_remaining(date!(2025 - 03 - 07)), 3);
        assert_eq!(sub.days_remaining(date!(2025 - 03 - 10)), 0);
        assert_eq!(sub.days_remaining(date!(2025 - 03 - 12)), -2);
    }

    fn sample_subscription() -> Subscription {
        let now = OffsetDateTime::now_utc();
        Subscription {
            id: SubscriptionId::new(),
            customer_id: CustomerId::new(),
            plan_id: PlanId::new(),
            order_id: None,
            slot: None,
            state: SubscriptionState::Active,
            auto_renew: false,
            start_date: None,
            next_renewal_date: now.date(),
            renewals_completed: 0,
            contact_phone: None,
            contact_email: None,
            cancel_reason: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_renewal_status_terminal() {
        assert!(!RenewalStatus::Scheduled.is_terminal());
        assert!(RenewalStatus::Succeeded.is_terminal());
        assert!(RenewalStatus::Failed.is_terminal());
        assert!(RenewalStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_notification_kind_parse() {
        assert_eq!(
            "reminder_soon".parse::<NotificationKind>().unwrap(),
            NotificationKind::ReminderSoon
        );
        assert!("smoke_signal".parse::<NotificationKind>().is_err());
    }

    #[test]
    fn test_id_wrappers_unique() {
        assert_ne!(AccountId::new(), AccountId::new());
        let uuid = Uuid::new_v4();
        let id: SubscriptionId = uuid.into();
        assert_eq!(id.0, uuid);
    }
}
