//! Subscription interval arithmetic
//!
//! Calendar additions clamp to the last valid day of the target month, so a
//! term activated on Jan 31 renews on Feb 28/29 and a term activated on
//! Feb 29 renews yearly on Feb 28.

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::work::SubscriptionTerm;

/// Billing interval of a subscription term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionInterval {
    #[serde(rename = "N/A")]
    None,
    #[serde(rename = "7 Days")]
    Weekly,
    #[serde(rename = "1 Months")]
    Monthly,
    #[serde(rename = "1 Years")]
    Yearly,
}

impl SubscriptionInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionInterval::None => "N/A",
            SubscriptionInterval::Weekly => "7 Days",
            SubscriptionInterval::Monthly => "1 Months",
            SubscriptionInterval::Yearly => "1 Years",
        }
    }

    pub fn is_recurring(&self) -> bool {
        *self != SubscriptionInterval::None
    }
}

impl std::fmt::Display for SubscriptionInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionInterval {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "N/A" => Ok(SubscriptionInterval::None),
            "7 Days" => Ok(SubscriptionInterval::Weekly),
            "1 Months" => Ok(SubscriptionInterval::Monthly),
            "1 Years" => Ok(SubscriptionInterval::Yearly),
            other => Err(BillingError::InvalidInterval(other.to_string())),
        }
    }
}

/// Compute the next billing date after `date`.
///
/// `None` leaves the date unchanged (a term without recurrence).
pub fn add_interval(
    date: OffsetDateTime,
    interval: SubscriptionInterval,
) -> BillingResult<OffsetDateTime> {
    let next = match interval {
        SubscriptionInterval::None => Some(date),
        SubscriptionInterval::Weekly => date.checked_add(Duration::days(7)),
        SubscriptionInterval::Monthly => add_months(date, 1),
        SubscriptionInterval::Yearly => add_months(date, 12),
    };

    next.ok_or_else(|| {
        BillingError::Validation(format!("Date overflow adding {} to {}", interval, date))
    })
}

/// Same as [`add_interval`] for a raw interval string as stored by older
/// clients. Unknown strings are rejected.
pub fn add_interval_str(date: OffsetDateTime, interval: &str) -> BillingResult<OffsetDateTime> {
    add_interval(date, interval.parse()?)
}

fn add_months(date: OffsetDateTime, months: u32) -> Option<OffsetDateTime> {
    let month_index = date.month() as u32 - 1 + months;
    let year = date.year() + (month_index / 12) as i32;
    let month = Month::try_from((month_index % 12 + 1) as u8).ok()?;
    let day = date.day().min(month.length(year));
    let new_date = Date::from_calendar_date(year, month, day).ok()?;
    Some(date.replace_date(new_date))
}

/// True when the term has never been disabled or was re-activated after its
/// most recent disable.
pub fn is_enabled(term: &SubscriptionTerm) -> bool {
    match (term.date_disabled, term.date_activated) {
        (None, _) => true,
        (Some(disabled), Some(activated)) => activated > disabled,
        (Some(_), None) => false,
    }
}

/// Activate a pending term: stamp creation/activation at `now` and schedule
/// the first renewal.
pub fn complete_subscription(term: &mut SubscriptionTerm, now: OffsetDateTime) -> BillingResult<()> {
    let next_payment = add_interval(now, term.interval)?;
    term.created_date = Some(now);
    term.date_activated = Some(now);
    term.next_payment = if term.interval.is_recurring() {
        Some(next_payment)
    } else {
        None
    };
    term.complete_subscription = false;
    Ok(())
}
