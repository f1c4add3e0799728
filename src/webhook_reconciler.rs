//! Webhook Reconciler - Re-applies processor events to local state
//!
//! The payment processor delivers events at-least-once and out of order. Each
//! event is verified against its payload signature, deduplicated by event id,
//! and applied only if the local record is still in a state consistent with
//! the transition the event implies; anything else is a no-op, not an error.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::models::{constant_time_eq, Transaction, TransactionStatus};
use crate::payout_router::PayoutRouter;
use crate::transaction_manager::TransactionManager;
use crate::wallet_store::WalletStore;
use crate::EscrowResult;

/// Configuration for the webhook reconciler
#[derive(Debug, Clone)]
pub struct WebhookReconcilerConfig {
    /// Shared secret the processor signs payloads with
    pub signing_secret: String,
}

impl Default for WebhookReconcilerConfig {
    fn default() -> Self {
        Self {
            signing_secret: "whsec_dev_only".to_string(),
        }
    }
}

/// Processor event kinds the reconciler understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCancelled,
    TransferCreated,
    TransferReversed,
    ConnectedAccountUpdated,
}

/// Connected-account data carried by account events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub user_id: Uuid,
    pub account_ref: String,
    pub country: String,
    pub active: bool,
}

/// Deserialized processor event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: GatewayEventKind,
    pub transaction_id: Option<Uuid>,
    pub amount: Option<i64>,
    pub reference: Option<String>,
    pub account: Option<AccountUpdate>,
}

/// What the reconciler did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Local state changed
    Applied,
    /// Event was consistent but implied nothing new
    NoOp,
    /// Event id seen before
    Duplicate,
}

/// Main webhook reconciler, invoked once per inbound event
pub struct WebhookReconciler {
    config: WebhookReconcilerConfig,
    manager: Arc<TransactionManager>,
    wallets: Arc<WalletStore>,
    payout_router: Arc<PayoutRouter>,
    /// Event ids already applied (in production, this would be a database)
    processed: RwLock<HashSet<String>>,
}

/// Compute the hex signature the processor attaches to a payload
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b".");
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(b".");
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl WebhookReconciler {
    /// Create a new webhook reconciler
    pub fn new(
        config: WebhookReconcilerConfig,
        manager: Arc<TransactionManager>,
        wallets: Arc<WalletStore>,
        payout_router: Arc<PayoutRouter>,
    ) -> Self {
        Self {
            config,
            manager,
            wallets,
            payout_router,
            processed: RwLock::new(HashSet::new()),
        }
    }

    /// Verify, deduplicate and apply one inbound processor event
    ///
    /// Unverified payloads are rejected with no state change.
    pub async fn process(
        &self,
        body: &str,
        timestamp: i64,
        signature: &str,
    ) -> EscrowResult<ReconcileOutcome> {
        let expected = sign_payload(&self.config.signing_secret, timestamp, body);
        if !constant_time_eq(&expected, signature) {
            return Err(EscrowError::webhook_signature(
                "payload signature verification failed",
            ));
        }

        let event: GatewayEvent = serde_json::from_str(body)?;

        // Reserve the id before applying: a parallel delivery of the same
        // event must lose the insert and bail out as a duplicate, not slip
        // past a check while the first delivery is still mid-apply
        if !self.processed.write().await.insert(event.id.clone()) {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let outcome = match self.apply(&event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Release the id so the processor's redelivery can retry
                self.processed.write().await.remove(&event.id);
                return Err(err);
            }
        };

        info!("Webhook event {} ({:?}): {:?}", event.id, event.kind, outcome);

        Ok(outcome)
    }

    async fn apply(&self, event: &GatewayEvent) -> EscrowResult<ReconcileOutcome> {
        match event.kind {
            GatewayEventKind::PaymentSucceeded => {
                let Some(txn) = self.lookup(event.transaction_id).await? else {
                    return Ok(ReconcileOutcome::NoOp);
                };
                if txn.status != TransactionStatus::PaymentPending {
                    return Ok(ReconcileOutcome::NoOp);
                }
                let reference = event.reference.as_deref().unwrap_or_default();
                self.manager
                    .reconcile_payment_succeeded(txn.id, reference)
                    .await?;
                Ok(ReconcileOutcome::Applied)
            }
            GatewayEventKind::PaymentFailed | GatewayEventKind::PaymentCancelled => {
                let Some(txn) = self.lookup(event.transaction_id).await? else {
                    return Ok(ReconcileOutcome::NoOp);
                };
                if txn.status != TransactionStatus::PaymentPending {
                    return Ok(ReconcileOutcome::NoOp);
                }
                let note = match event.kind {
                    GatewayEventKind::PaymentCancelled => "processor reported payment cancelled",
                    _ => "processor reported payment failed",
                };
                self.manager.reconcile_payment_failed(txn.id, note).await?;
                Ok(ReconcileOutcome::Applied)
            }
            GatewayEventKind::TransferCreated => {
                let Some(reference) = event.reference.as_deref() else {
                    return Ok(ReconcileOutcome::NoOp);
                };
                let Some(txn) = self.lookup(event.transaction_id).await? else {
                    return Ok(ReconcileOutcome::NoOp);
                };
                if txn.status != TransactionStatus::PaymentReleased
                    || txn.external_transfer_ref.is_some()
                {
                    return Ok(ReconcileOutcome::NoOp);
                }
                self.manager
                    .reconcile_transfer_created(txn.id, reference)
                    .await?;
                Ok(ReconcileOutcome::Applied)
            }
            GatewayEventKind::TransferReversed => self.apply_transfer_reversed(event).await,
            GatewayEventKind::ConnectedAccountUpdated => {
                let Some(account) = &event.account else {
                    return Ok(ReconcileOutcome::NoOp);
                };
                if account.active {
                    self.payout_router
                        .register_connected_account(
                            account.user_id,
                            account.account_ref.clone(),
                            account.country.clone(),
                        )
                        .await;
                } else {
                    self.payout_router
                        .deactivate_connected_account(account.user_id)
                        .await;
                }
                Ok(ReconcileOutcome::Applied)
            }
        }
    }

    /// Look a transaction up, treating unknown ids as a warning not an error
    async fn lookup(&self, transaction_id: Option<Uuid>) -> EscrowResult<Option<Transaction>> {
        let Some(txn_id) = transaction_id else {
            return Ok(None);
        };
        match self.manager.get_transaction(txn_id).await {
            Ok(txn) => Ok(Some(txn)),
            Err(EscrowError::TransactionNotFound(_)) => {
                warn!("Webhook event for unknown transaction {}", txn_id);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// A reversed transfer means the funds are back in the platform's
    /// custody: claim the external reference, then re-credit the traveler's
    /// wallet; the transaction status itself stays released. The claim is
    /// atomic, so a reversal racing another reversal credits at most once.
    async fn apply_transfer_reversed(&self, event: &GatewayEvent) -> EscrowResult<ReconcileOutcome> {
        let Some(txn) = self.lookup(event.transaction_id).await? else {
            return Ok(ReconcileOutcome::NoOp);
        };

        let (txn, claimed) = self.manager.reconcile_transfer_reversed(txn.id).await?;
        let Some(reference) = claimed else {
            return Ok(ReconcileOutcome::NoOp);
        };

        let amount = event.amount.unwrap_or(txn.traveler_amount);
        if let Err(err) = self
            .wallets
            .credit(
                txn.traveler_id,
                amount,
                Some(txn.id),
                "external transfer reversed",
            )
            .await
        {
            // Put the claim back so a redelivered event retries the credit
            if let Err(restore_err) = self.manager.restore_transfer_ref(txn.id, &reference).await {
                warn!(
                    "Failed to restore transfer ref for transaction {}: {}",
                    txn.id, restore_err
                );
            }
            return Err(err);
        }

        Ok(ReconcileOutcome::Applied)
    }
}
