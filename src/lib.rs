//! Escrow and capacity-reservation core for peer-to-peer package delivery
//!
//! This crate implements the transaction backbone of a delivery marketplace
//! where senders pay travelers to carry packages:
//! - Escrow transaction state machine (authorize, hold, capture, release)
//! - Capacity ledger preventing oversold carrying weight
//! - Payout routing to external transfers or an internal wallet ledger
//! - Webhook reconciliation against payment-processor truth

pub mod capacity_ledger;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod payout_router;
pub mod settings;
pub mod transaction_manager;
pub mod wallet_store;
pub mod webhook_reconciler;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
