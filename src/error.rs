//! Error types for the escrow system
//!
//! Errors fall into the classes the callers care about: validation failures
//! rejected before any mutation, conflicts (capacity, state, codes) the user
//! can correct and retry, external gateway failures that are safe to retry
//! because gateway calls are idempotent, and the partial-failure case where
//! a capture landed but the payout has not.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Input validation errors (bad shape, out-of-range values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Package description shorter than the required minimum
    #[error("Invalid package description: {0}")]
    InvalidPackageDescription(String),

    /// Requested weight exceeds the trip's remaining capacity
    #[error("Capacity exceeded: requested {requested} kg, available {available} kg")]
    CapacityExceeded { requested: f64, available: f64 },

    /// Trip lookup failures
    #[error("Trip {0} not found")]
    TripNotFound(Uuid),

    /// Transaction lookup failures
    #[error("Transaction {0} not found")]
    TransactionNotFound(Uuid),

    /// State machine transition errors
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    StateTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Pickup code does not match the stored code
    #[error("Invalid pickup code")]
    InvalidPickupCode,

    /// Delivery code does not match the stored code
    #[error("Invalid delivery code")]
    InvalidDeliveryCode,

    /// Standard cancellation attempted after escrow
    #[error("Cannot cancel a paid transaction; administrative refund required")]
    CannotCancelPaidTransaction,

    /// Caller is not a party to the transaction or trip
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Gateway refused to authorize the payment
    #[error("Payment authorization failed: {0}")]
    PaymentAuthorization(String),

    /// Payment gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Timeout errors on external calls
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Wallet debit would drive the balance negative
    #[error("Insufficient wallet balance: have {balance}, need {requested}")]
    InsufficientBalance { balance: i64, requested: i64 },

    /// Webhook payload signature verification failures
    #[error("Webhook signature error: {0}")]
    WebhookSignature(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// UUID parsing errors
    #[error("UUID parsing error: {0}")]
    Uuid(#[from] uuid::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a payment authorization error
    pub fn payment_authorization<S: Into<String>>(msg: S) -> Self {
        Self::PaymentAuthorization(msg.into())
    }

    /// Create a gateway error
    pub fn gateway<S: Into<String>>(msg: S) -> Self {
        Self::Gateway(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a webhook signature error
    pub fn webhook_signature<S: Into<String>>(msg: S) -> Self {
        Self::WebhookSignature(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// True for gateway errors worth retrying (transient network failures)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Gateway(_))
    }
}
