//! Work records: one customer engagement with the business
//!
//! A `Work` is stored as a single document. Status, line items, one-off
//! payment history and the subscription term history all live on it, so every
//! transition is a read-modify-write of one record.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::interval::{self, SubscriptionInterval};

/// Authoritative lifecycle status of a work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkStatus {
    #[serde(rename = "Meeting")]
    Meeting,
    #[serde(rename = "Confirmation Required")]
    ConfirmationRequired,
    #[serde(rename = "User Accepted")]
    UserAccepted,
    #[serde(rename = "Subscribed")]
    Subscribed,
    #[serde(rename = "In Use")]
    InUse,
    #[serde(rename = "Needs Attention")]
    NeedsAttention,
    #[serde(rename = "Completed")]
    Completed,
    #[serde(rename = "Cancelled")]
    Cancelled,
    #[serde(rename = "Payments Failed")]
    PaymentsFailed,
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 10] = [
        WorkStatus::Meeting,
        WorkStatus::ConfirmationRequired,
        WorkStatus::UserAccepted,
        WorkStatus::Subscribed,
        WorkStatus::InUse,
        WorkStatus::NeedsAttention,
        WorkStatus::Completed,
        WorkStatus::Cancelled,
        WorkStatus::PaymentsFailed,
        WorkStatus::NotApplicable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Meeting => "Meeting",
            WorkStatus::ConfirmationRequired => "Confirmation Required",
            WorkStatus::UserAccepted => "User Accepted",
            WorkStatus::Subscribed => "Subscribed",
            WorkStatus::InUse => "In Use",
            WorkStatus::NeedsAttention => "Needs Attention",
            WorkStatus::Completed => "Completed",
            WorkStatus::Cancelled => "Cancelled",
            WorkStatus::PaymentsFailed => "Payments Failed",
            WorkStatus::NotApplicable => "N/A",
        }
    }

    /// Completed and Cancelled end the lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Cancelled)
    }

    /// Transition table for the work lifecycle.
    ///
    /// `NeedsAttention` is reachable from every non-terminal status and can
    /// hand the work back to any status. `PaymentsFailed` only returns to
    /// `Subscribed` (or is cancelled).
    pub fn can_transition_to(&self, next: WorkStatus) -> bool {
        use WorkStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == NeedsAttention {
            return *self != NeedsAttention;
        }

        match self {
            Meeting => matches!(next, ConfirmationRequired | Cancelled),
            ConfirmationRequired => matches!(next, UserAccepted | Subscribed | Cancelled),
            UserAccepted => matches!(next, InUse | Completed | Cancelled),
            Subscribed => matches!(next, InUse | PaymentsFailed | Completed | Cancelled),
            InUse => matches!(next, Completed | Cancelled),
            PaymentsFailed => matches!(next, Subscribed | Cancelled),
            NeedsAttention => next != NotApplicable,
            NotApplicable => matches!(next, Meeting | ConfirmationRequired | Cancelled),
            Completed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = crate::error::BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                crate::error::BillingError::Validation(format!("Unknown work status '{}'", s))
            })
    }
}

/// Status of a single work or payment line item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ItemStatus {
    #[default]
    #[serde(rename = "Unset")]
    Unset,
    #[serde(rename = "Incomplete")]
    Incomplete,
    #[serde(rename = "Some Completed")]
    SomeCompleted,
    #[serde(rename = "Completed")]
    Completed,
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl ItemStatus {
    pub fn is_completed(&self) -> bool {
        *self == ItemStatus::Completed
    }
}

/// Kind of class a work enrols the customer in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassType {
    #[serde(rename = "Single Session")]
    SingleSession,
    #[serde(rename = "Perpetual")]
    Perpetual,
    #[serde(rename = "Time Frame")]
    TimeFrame,
}

/// Business category; each one bills through its own gateway account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Software,
    Photography,
    Videography,
    Classes,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Software,
        Category::Photography,
        Category::Videography,
        Category::Classes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Software => "software",
            Category::Photography => "photography",
            Category::Videography => "videography",
            Category::Classes => "classes",
        }
    }

    /// Suffix used for per-category environment variables
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Category::Software => "SOFTWARE",
            Category::Photography => "PHOTOGRAPHY",
            Category::Videography => "VIDEOGRAPHY",
            Category::Classes => "CLASSES",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = crate::error::BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::error::BillingError::NotFound(format!("Unknown category '{}'", s)))
    }
}

/// A named, priced line on a work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub amount: f64,
    #[serde(default)]
    pub status: ItemStatus,
}

impl LineItem {
    pub fn new(name: &str, amount: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            amount,
            status: ItemStatus::Incomplete,
        }
    }
}

/// What a payment history entry paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaymentType {
    Confirmation,
    PaymentItem,
    Full,
    Cancellation,
    Subscription,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Confirmation => "confirmation",
            PaymentType::PaymentItem => "paymentItem",
            PaymentType::Full => "full",
            PaymentType::Cancellation => "cancellation",
            PaymentType::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[default]
    New,
    Completed,
    Failed,
}

/// One attempted payment. Append-only: once Completed or Failed it is never
/// rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentHistoryEntry {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub payment_type: PaymentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_item_id: Option<Uuid>,
    /// Items a Full payment was priced on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payment_item_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: PaymentStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub settled_at: Option<OffsetDateTime>,
}

impl PaymentHistoryEntry {
    pub fn draft(payment_type: PaymentType, amount: f64, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_type,
            payment_item_id: None,
            payment_item_ids: Vec::new(),
            session_id: None,
            payment_intent_id: None,
            amount,
            description: description.to_string(),
            status: PaymentStatus::New,
            created_at: OffsetDateTime::now_utc(),
            settled_at: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.status != PaymentStatus::New
    }

    /// Gateway reference used to verify the payment (intent wins over session)
    pub fn gateway_reference(&self) -> Option<&str> {
        self.payment_intent_id
            .as_deref()
            .or(self.session_id.as_deref())
    }
}

/// One recurring-payment plan in a work's subscription history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTerm {
    pub payment: f64,
    pub interval: SubscriptionInterval,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub date_activated: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub date_disabled: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_payment: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method_id: Option<String>,
    /// Set while the term is waiting for the work to be confirmed
    #[serde(default)]
    pub complete_subscription: bool,
    #[serde(default)]
    pub payment_history: Vec<PaymentHistoryEntry>,
}

impl SubscriptionTerm {
    /// A term awaiting activation on confirmation
    pub fn pending(payment: f64, interval: SubscriptionInterval) -> Self {
        Self {
            payment,
            interval,
            created_date: None,
            date_activated: None,
            date_disabled: None,
            next_payment: None,
            payment_method_id: None,
            complete_subscription: true,
            payment_history: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        interval::is_enabled(self)
    }

    /// Enabled and already activated, i.e. billable
    pub fn is_active(&self) -> bool {
        self.date_activated.is_some() && self.is_enabled()
    }
}

/// One customer engagement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Work {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category: Category,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_id: Option<String>,
    pub status: WorkStatus,
    #[serde(default)]
    pub work_items: Vec<LineItem>,
    #[serde(default)]
    pub payment_items: Vec<LineItem>,
    #[serde(default)]
    pub initial_payment: f64,
    #[serde(default)]
    pub initial_payment_status: ItemStatus,
    #[serde(default)]
    pub cancellation_payment: f64,
    #[serde(default)]
    pub cancellation_payment_status: ItemStatus,
    #[serde(default)]
    pub subscription: Vec<SubscriptionTerm>,
    #[serde(default)]
    pub payment_history: Vec<PaymentHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_type: Option<ClassType>,
    /// Optimistic-lock counter, bumped by the store on every save
    #[serde(default)]
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Work {
    pub fn new(user_id: Uuid, category: Category, service: &str, status: WorkStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            category,
            service: service.to_string(),
            meeting_id: None,
            status,
            work_items: Vec::new(),
            payment_items: Vec::new(),
            initial_payment: 0.0,
            initial_payment_status: ItemStatus::Unset,
            cancellation_payment: 0.0,
            cancellation_payment_status: ItemStatus::Unset,
            subscription: Vec::new(),
            payment_history: Vec::new(),
            class_type: None,
            version: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// The current subscription term (the last one)
    pub fn current_term(&self) -> Option<&SubscriptionTerm> {
        self.subscription.last()
    }

    pub fn current_term_mut(&mut self) -> Option<&mut SubscriptionTerm> {
        self.subscription.last_mut()
    }

    /// The current term if it is still waiting for activation
    pub fn pending_term(&self) -> Option<&SubscriptionTerm> {
        self.current_term()
            .filter(|t| t.complete_subscription && t.date_disabled.is_none())
    }

    pub fn initial_payment_settled(&self) -> bool {
        self.initial_payment <= 0.0 || self.initial_payment_status.is_completed()
    }

    pub fn cancellation_payment_settled(&self) -> bool {
        self.cancellation_payment <= 0.0 || self.cancellation_payment_status.is_completed()
    }

    pub fn payment_item(&self, item_id: Uuid) -> Option<&LineItem> {
        self.payment_items.iter().find(|i| i.id == item_id)
    }

    pub fn history_entry(&self, entry_id: Uuid) -> Option<&PaymentHistoryEntry> {
        self.payment_history.iter().find(|e| e.id == entry_id)
    }

    /// Due date of the current term, only while that term is active
    pub fn next_payment_due(&self) -> Option<OffsetDateTime> {
        self.current_term()
            .filter(|t| t.is_active())
            .and_then(|t| t.next_payment)
    }
}

/// Contact details of the customer owning a work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContact {
    pub id: Uuid,
    pub email: String,
    pub name: String,
}

/// Live class window for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSession {
    pub service: String,
    pub come_in: bool,
    pub join_url: String,
    #[serde(default)]
    pub password: String,
}
