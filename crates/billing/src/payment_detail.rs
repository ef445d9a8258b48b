//! Payment detail resolution
//!
//! Works out what a payment request is for and how much is owed, without
//! touching the store or the gateway.

use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::work::{PaymentHistoryEntry, PaymentType, Work};

/// A payment the customer asked to make against a work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentRequest {
    Confirmation,
    PaymentItem(Uuid),
    Full,
    Cancellation,
}

impl PaymentRequest {
    /// Parse a request type as sent by clients.
    ///
    /// Unknown types are reported the same way as an unknown route.
    pub fn parse(request_type: &str, item_id: Option<Uuid>) -> BillingResult<Self> {
        match request_type {
            "confirmation" => Ok(PaymentRequest::Confirmation),
            "paymentItem" => item_id.map(PaymentRequest::PaymentItem).ok_or_else(|| {
                BillingError::Validation("item_id is required for paymentItem".to_string())
            }),
            "full" => Ok(PaymentRequest::Full),
            "cancellation" => Ok(PaymentRequest::Cancellation),
            _ => Err(BillingError::NotFound("Endpoint not found".to_string())),
        }
    }

    pub fn payment_type(&self) -> PaymentType {
        match self {
            PaymentRequest::Confirmation => PaymentType::Confirmation,
            PaymentRequest::PaymentItem(_) => PaymentType::PaymentItem,
            PaymentRequest::Full => PaymentType::Full,
            PaymentRequest::Cancellation => PaymentType::Cancellation,
        }
    }
}

/// Amount and description owed for a request, plus the history entry that
/// will track the attempt
#[derive(Debug, Clone, Serialize)]
pub struct PaymentDetail {
    pub amount: f64,
    pub description: String,
    pub history_draft: PaymentHistoryEntry,
}

impl PaymentDetail {
    /// Amount in the gateway's minor units
    pub fn amount_minor(&self) -> i64 {
        to_minor_units(self.amount)
    }
}

/// Round to 2 decimals, then convert to integer minor units (cents)
pub fn to_minor_units(amount: f64) -> i64 {
    let rounded = (amount * 100.0).round() / 100.0;
    (rounded * 100.0).round() as i64
}

/// Resolve what `request` costs on `work`. Pure: calling it twice without a
/// state change in between yields the same amount and description.
pub fn resolve_payment(request: PaymentRequest, work: &Work) -> BillingResult<PaymentDetail> {
    let mut covered_items = Vec::new();
    let (amount, description, item_id) = match request {
        PaymentRequest::Confirmation => {
            if work.initial_payment_status.is_completed() {
                return Err(BillingError::AlreadyPaid);
            }
            (
                work.initial_payment,
                format!("Initial Payment for Work ID {}", work.id),
                None,
            )
        }
        PaymentRequest::PaymentItem(item_id) => {
            let item = work.payment_item(item_id).ok_or_else(|| {
                BillingError::NotFound(format!("Payment item {} not found", item_id))
            })?;
            if item.status.is_completed() {
                return Err(BillingError::AlreadyPaid);
            }
            (
                item.amount,
                format!("{} for Work ID {}", item.name, work.id),
                Some(item_id),
            )
        }
        PaymentRequest::Full => {
            let outstanding: Vec<_> = work
                .payment_items
                .iter()
                .filter(|i| !i.status.is_completed())
                .collect();
            if outstanding.is_empty() {
                return Err(BillingError::AlreadyPaid);
            }
            covered_items = outstanding.iter().map(|i| i.id).collect();
            (
                outstanding.iter().map(|i| i.amount).sum(),
                format!("Full Payment for Work ID {}", work.id),
                None,
            )
        }
        PaymentRequest::Cancellation => {
            if work.cancellation_payment_status.is_completed() {
                return Err(BillingError::AlreadyPaid);
            }
            (
                work.cancellation_payment,
                format!("Cancellation Payment for Work ID {}", work.id),
                None,
            )
        }
    };

    let mut history_draft =
        PaymentHistoryEntry::draft(request.payment_type(), amount, &description);
    history_draft.payment_item_id = item_id;
    history_draft.payment_item_ids = covered_items;

    Ok(PaymentDetail {
        amount,
        description,
        history_draft,
    })
}
