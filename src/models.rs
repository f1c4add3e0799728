//! Core data models for the escrow system
//!
//! This module contains the trip, transaction, wallet and ledger models,
//! the transaction status state machine, and the append-only status history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::EscrowResult;

/// Trip status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripStatus {
    /// Trip created but not yet visible to senders
    Draft,
    /// Trip open for bookings
    Published,
    /// All carrying capacity reserved
    Full,
    /// Trip cancelled by the traveler
    Cancelled,
    /// Journey completed
    Completed,
}

impl TripStatus {
    /// Check if the trip can accept new reservations
    pub fn accepts_reservations(&self) -> bool {
        matches!(self, Self::Published)
    }
}

/// Transaction state machine enum
///
/// The happy path runs PaymentPending -> PaymentEscrowed -> PackagePickedUp ->
/// PackageDelivered -> PaymentReleased. Cancelled is reachable from
/// PaymentPending only; Disputed and Refunded are administrative terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Booking created, capacity reserved, payment not yet authorized
    PaymentPending,
    /// Funds authorized and held by the payment processor
    PaymentEscrowed,
    /// Traveler confirmed pickup with the sender's code
    PackagePickedUp,
    /// Delivery code accepted and escrow captured, payout not yet complete
    PackageDelivered,
    /// Funds routed to the traveler
    PaymentReleased,
    /// Cancelled before escrow; capacity released
    Cancelled,
    /// Under administrative arbitration
    Disputed,
    /// Administratively refunded to the sender
    Refunded,
}

impl TransactionStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PaymentReleased | Self::Cancelled | Self::Disputed | Self::Refunded)
    }

    /// Check if this state allows standard cancellation
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::PaymentPending)
    }

    /// Check if this state allows escrow authorization
    pub fn can_escrow(&self) -> bool {
        matches!(self, Self::PaymentPending)
    }

    /// Check if this state allows pickup confirmation
    pub fn can_pick_up(&self) -> bool {
        matches!(self, Self::PaymentEscrowed)
    }

    /// Check if this state allows delivery confirmation
    pub fn can_deliver(&self) -> bool {
        matches!(self, Self::PackagePickedUp)
    }

    /// Check if this transaction still holds trip capacity
    ///
    /// Reservation is held from creation until explicit cancellation;
    /// completed deliveries keep their weight committed for the journey.
    pub fn holds_capacity(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// One entry in a transaction's append-only status history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub from_status: Option<TransactionStatus>,
    pub to_status: TransactionStatus,
    /// User who drove the transition, if any (None for webhook/system)
    pub actor: Option<Uuid>,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Trip model: a traveler's journey with fixed carrying capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: Uuid,
    pub traveler_id: Uuid,

    /// Total carrying capacity in kilograms, fixed at creation
    pub capacity_kg: f64,
    /// Weight committed by non-cancelled transactions
    pub reserved_weight: f64,

    pub status: TripStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    /// Create a new trip in draft status
    pub fn new(traveler_id: Uuid, capacity_kg: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            traveler_id,
            capacity_kg,
            reserved_weight: 0.0,
            status: TripStatus::Draft,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Remaining unreserved capacity in kilograms
    pub fn available_weight(&self) -> f64 {
        self.capacity_kg - self.reserved_weight
    }
}

/// Transaction model: one sender's booking on one trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub sender_id: Uuid,
    pub traveler_id: Uuid,

    // Money, in integer minor units. traveler_amount + service_fee == amount,
    // computed once at creation and frozen.
    pub amount: i64,
    pub service_fee: i64,
    pub traveler_amount: i64,

    // Package
    pub package_description: String,
    pub package_weight: f64,

    // Opaque confirmation codes, generated at creation, never regenerated
    pub pickup_code: String,
    pub delivery_code: String,

    // State machine
    pub status: TransactionStatus,
    pub status_history: Vec<StatusHistoryEntry>,

    // External references
    pub external_payment_ref: Option<String>,
    pub external_transfer_ref: Option<String>,

    /// Escrow captured but payout not yet completed; eligible for
    /// payout-only retry without re-capturing
    pub payout_pending: bool,
    /// Audit note set when a failed external transfer fell back to the wallet
    pub payout_fallback_note: Option<String>,

    pub cancelled_by: Option<Uuid>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub payment_released_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Create a new transaction in PaymentPending with an initial history entry
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trip_id: Uuid,
        sender_id: Uuid,
        traveler_id: Uuid,
        amount: i64,
        service_fee: i64,
        package_description: String,
        package_weight: f64,
        pickup_code: String,
        delivery_code: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trip_id,
            sender_id,
            traveler_id,
            amount,
            service_fee,
            traveler_amount: amount - service_fee,
            package_description,
            package_weight,
            pickup_code,
            delivery_code,
            status: TransactionStatus::PaymentPending,
            status_history: vec![StatusHistoryEntry {
                from_status: None,
                to_status: TransactionStatus::PaymentPending,
                actor: Some(sender_id),
                note: Some("booking created".to_string()),
                at: now,
            }],
            external_payment_ref: None,
            external_transfer_ref: None,
            payout_pending: false,
            payout_fallback_note: None,
            cancelled_by: None,
            created_at: now,
            updated_at: now,
            picked_up_at: None,
            delivered_at: None,
            payment_released_at: None,
        }
    }

    /// Validate a state transition against the closed transition table
    pub fn validate_transition(&self, to_status: TransactionStatus) -> EscrowResult<()> {
        use TransactionStatus::*;

        let valid = match (self.status, to_status) {
            (PaymentPending, PaymentEscrowed) => true,
            (PaymentPending, Cancelled) => true,
            (PaymentEscrowed, PackagePickedUp) => true,
            (PackagePickedUp, PackageDelivered) => true,
            (PackageDelivered, PaymentReleased) => true,
            // Administrative terminals reachable from any non-terminal state
            (from, Disputed) if !from.is_terminal() => true,
            (from, Refunded) if !from.is_terminal() => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(EscrowError::state_transition(
                format!("{:?}", self.status),
                format!("{:?}", to_status),
                "Invalid state transition".to_string(),
            ))
        }
    }

    /// Check whether a user is a party to this transaction
    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.sender_id == user_id || self.traveler_id == user_id
    }
}

/// Wallet ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntryType {
    Credit,
    Debit,
}

/// Wallet model: internal balance for the manual-withdrawal payout path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: Uuid,
    /// Non-negative balance in integer minor units
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Create an empty wallet for a user
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            balance: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// Append-only record of a single wallet balance mutation
///
/// The balance is always reconstructible by summing entries, credits
/// positive and debits negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    pub transaction_id: Option<Uuid>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// External payout destination for a traveler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub user_id: Uuid,
    /// Processor-side account reference used as transfer destination
    pub account_ref: String,
    /// ISO country code, checked against the supported-transfer region set
    pub country: String,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

/// Generate an opaque confirmation code of the given length
pub fn generate_code(length: usize) -> String {
    let mut code = String::with_capacity(length);
    while code.len() < length {
        code.push_str(&Uuid::new_v4().simple().to_string());
    }
    code.truncate(length);
    code.to_uppercase()
}

/// Compare two strings with cost independent of where they diverge
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_conservation_at_creation() {
        let txn = Transaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            10_000,
            1_000,
            "Box of books, 3kg, fragile".to_string(),
            3.0,
            generate_code(8),
            generate_code(8),
        );

        assert_eq!(txn.traveler_amount + txn.service_fee, txn.amount);
        assert_eq!(txn.status, TransactionStatus::PaymentPending);
        assert_eq!(txn.status_history.len(), 1);
    }

    #[test]
    fn test_transition_table() {
        use TransactionStatus::*;

        let mut txn = Transaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            5_000,
            500,
            "Envelope with documents".to_string(),
            0.5,
            generate_code(8),
            generate_code(8),
        );

        assert!(txn.validate_transition(PaymentEscrowed).is_ok());
        assert!(txn.validate_transition(Cancelled).is_ok());
        assert!(txn.validate_transition(PackagePickedUp).is_err());

        txn.status = PaymentEscrowed;
        assert!(txn.validate_transition(Cancelled).is_err());
        assert!(txn.validate_transition(PackagePickedUp).is_ok());
        assert!(txn.validate_transition(Disputed).is_ok());

        txn.status = PaymentReleased;
        assert!(txn.validate_transition(Disputed).is_err());
        assert!(txn.validate_transition(Refunded).is_err());
    }

    #[test]
    fn test_generated_codes_are_opaque() {
        let a = generate_code(8);
        let b = generate_code(8);
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("ABCD1234", "ABCD1234"));
        assert!(!constant_time_eq("ABCD1234", "ABCD1235"));
        assert!(!constant_time_eq("ABCD1234", "ABCD123"));
        assert!(!constant_time_eq("", "A"));
        assert!(constant_time_eq("", ""));
    }
}
