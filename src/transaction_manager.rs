//! Transaction Manager - Drives the escrow transaction state machine
//!
//! This module coordinates the full delivery lifecycle: booking against the
//! capacity ledger, escrow authorization at the gateway, pickup and delivery
//! confirmation with opaque codes, capture, and payout routing. Every
//! transition is applied as a single read-modify-write against the
//! transaction store with the expected prior state revalidated under the
//! write lock, so a transition attempted against an already-advanced
//! transaction is a no-op success or an explicit error, never an overwrite.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capacity_ledger::CapacityLedger;
use crate::error::EscrowError;
use crate::events::EventPublisher;
use crate::gateway::PaymentGateway;
use crate::models::{
    constant_time_eq, generate_code, StatusHistoryEntry, Transaction, TransactionStatus,
};
use crate::payout_router::PayoutRouter;
use crate::EscrowResult;

/// Configuration for the transaction manager
#[derive(Debug, Clone)]
pub struct TransactionManagerConfig {
    /// Platform cut as a percentage of the sender-facing price
    pub service_fee_percent: i64,
    /// Minimum package description length in characters
    pub min_description_chars: usize,
    /// Maximum package weight in kilograms
    pub max_package_weight_kg: f64,
    /// Length of generated pickup/delivery codes
    pub code_length: usize,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            service_fee_percent: 10,
            min_description_chars: 10,
            max_package_weight_kg: 30.0,
            code_length: 8,
        }
    }
}

/// Booking request from a sender
#[derive(Debug, Clone)]
pub struct CreateTransactionRequest {
    pub trip_id: Uuid,
    pub sender_id: Uuid,
    /// Sender-facing price in integer minor units
    pub amount: i64,
    pub package_description: String,
    pub package_weight: f64,
}

/// Escrow authorization request
#[derive(Debug, Clone)]
pub struct EscrowPaymentRequest {
    pub transaction_id: Uuid,
    pub sender_id: Uuid,
    /// Processor-side reference to the sender's payment method
    pub payer_ref: String,
}

/// Pickup confirmation request from the traveler
#[derive(Debug, Clone)]
pub struct ConfirmPickupRequest {
    pub transaction_id: Uuid,
    pub caller_id: Uuid,
    pub pickup_code: String,
}

/// Delivery confirmation request from either party
#[derive(Debug, Clone)]
pub struct ConfirmDeliveryRequest {
    pub transaction_id: Uuid,
    pub caller_id: Uuid,
    pub delivery_code: String,
}

/// Cancellation request from either party, pre-escrow only
#[derive(Debug, Clone)]
pub struct CancelTransactionRequest {
    pub transaction_id: Uuid,
    pub caller_id: Uuid,
}

/// Main transaction state machine orchestrator
pub struct TransactionManager {
    config: TransactionManagerConfig,
    /// In-memory transaction storage (in production, this would be a database)
    transactions: Arc<RwLock<HashMap<Uuid, Transaction>>>,
    capacity_ledger: Arc<CapacityLedger>,
    gateway: Arc<PaymentGateway>,
    payout_router: Arc<PayoutRouter>,
    publisher: EventPublisher,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(
        config: TransactionManagerConfig,
        capacity_ledger: Arc<CapacityLedger>,
        gateway: Arc<PaymentGateway>,
        payout_router: Arc<PayoutRouter>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            config,
            transactions: Arc::new(RwLock::new(HashMap::new())),
            capacity_ledger,
            gateway,
            payout_router,
            publisher,
        }
    }

    /// Create a booking: reserve capacity, freeze fees, generate codes
    pub async fn create_transaction(
        &self,
        request: CreateTransactionRequest,
    ) -> EscrowResult<Transaction> {
        self.validate_create_request(&request)?;

        let trip = self.capacity_ledger.get_trip(request.trip_id).await?;
        if trip.traveler_id == request.sender_id {
            return Err(EscrowError::unauthorized(
                "Travelers cannot book their own trip",
            ));
        }

        // Atomic check-then-reserve; two senders racing for the same last
        // kilogram are serialized inside the ledger
        self.capacity_ledger
            .reserve(request.trip_id, request.package_weight)
            .await?;

        let service_fee = request.amount * self.config.service_fee_percent / 100;
        let txn = Transaction::new(
            request.trip_id,
            request.sender_id,
            trip.traveler_id,
            request.amount,
            service_fee,
            request.package_description,
            request.package_weight,
            generate_code(self.config.code_length),
            generate_code(self.config.code_length),
        );

        self.transactions.write().await.insert(txn.id, txn.clone());

        info!(
            "Created transaction {} on trip {} ({} kg, amount {})",
            txn.id, txn.trip_id, txn.package_weight, txn.amount
        );

        self.publisher.reservation_created(&txn).await;

        Ok(txn)
    }

    /// Authorize the sender's payment into escrow
    ///
    /// Idempotent: an already-escrowed transaction is a no-op success, and an
    /// existing authorization reference is reused rather than re-created (the
    /// gateway keys authorizations by transaction id either way).
    pub async fn escrow_payment(&self, request: EscrowPaymentRequest) -> EscrowResult<Transaction> {
        let snapshot = self.get_transaction(request.transaction_id).await?;

        if snapshot.sender_id != request.sender_id {
            return Err(EscrowError::unauthorized(
                "Only the sender can escrow payment",
            ));
        }
        if snapshot.status == TransactionStatus::PaymentEscrowed {
            return Ok(snapshot);
        }
        if !snapshot.status.can_escrow() {
            return Err(self.wrong_state(&snapshot, TransactionStatus::PaymentEscrowed));
        }

        // Gateway call outside the store lock; may block for a network round
        // trip with the adapter's bounded timeout
        let auth_ref = match snapshot.external_payment_ref.clone() {
            Some(existing) => existing,
            None => self
                .gateway
                .authorize(snapshot.amount, &request.payer_ref, snapshot.id)
                .await
                .map_err(|err| match err {
                    EscrowError::PaymentAuthorization(_) => err,
                    other => EscrowError::payment_authorization(other.to_string()),
                })?,
        };

        let txn = self
            .apply_transition(
                request.transaction_id,
                TransactionStatus::PaymentPending,
                TransactionStatus::PaymentEscrowed,
                Some(request.sender_id),
                Some("payment authorized and held".to_string()),
                |txn| {
                    txn.external_payment_ref = Some(auth_ref.clone());
                },
            )
            .await?;

        self.publisher.payment_confirmed(&txn).await;
        self.publisher.pickup_ready(&txn).await;

        Ok(txn)
    }

    /// Confirm package pickup with the sender's pickup code
    pub async fn confirm_pickup(&self, request: ConfirmPickupRequest) -> EscrowResult<Transaction> {
        // No external calls here, so the whole check-then-transition runs
        // under one write lock
        let mut txns = self.transactions.write().await;
        let txn = txns
            .get_mut(&request.transaction_id)
            .ok_or(EscrowError::TransactionNotFound(request.transaction_id))?;

        if txn.traveler_id != request.caller_id {
            return Err(EscrowError::unauthorized(
                "Only the trip's traveler can confirm pickup",
            ));
        }
        if !txn.status.can_pick_up() {
            return Err(EscrowError::state_transition(
                format!("{:?}", txn.status),
                format!("{:?}", TransactionStatus::PackagePickedUp),
                "Pickup requires an escrowed payment".to_string(),
            ));
        }
        if !constant_time_eq(&request.pickup_code, &txn.pickup_code) {
            return Err(EscrowError::InvalidPickupCode);
        }

        let from = txn.status;
        txn.status = TransactionStatus::PackagePickedUp;
        txn.picked_up_at = Some(Utc::now());
        txn.updated_at = Utc::now();
        txn.status_history.push(StatusHistoryEntry {
            from_status: Some(from),
            to_status: txn.status,
            actor: Some(request.caller_id),
            note: Some("pickup code accepted".to_string()),
            at: Utc::now(),
        });

        info!("Transaction {} picked up", txn.id);

        Ok(txn.clone())
    }

    /// Confirm delivery: capture the escrow and release funds to the traveler
    ///
    /// PackageDelivered is a transient checkpoint between capture and payout.
    /// Calling this again on a released transaction is a no-op success with
    /// no second capture or payout. If capture lands but the payout fails,
    /// the transaction stays in PackageDelivered flagged `payout_pending` and
    /// is recoverable via [`TransactionManager::retry_payout`].
    pub async fn confirm_delivery(
        &self,
        request: ConfirmDeliveryRequest,
    ) -> EscrowResult<Transaction> {
        let snapshot = self.get_transaction(request.transaction_id).await?;

        if !snapshot.is_party(request.caller_id) {
            return Err(EscrowError::unauthorized(
                "Only the sender or traveler can confirm delivery",
            ));
        }
        if snapshot.status == TransactionStatus::PaymentReleased {
            return Ok(snapshot);
        }
        if !constant_time_eq(&request.delivery_code, &snapshot.delivery_code) {
            return Err(EscrowError::InvalidDeliveryCode);
        }

        match snapshot.status {
            TransactionStatus::PackagePickedUp => {}
            // Capture already happened, payout still owed
            TransactionStatus::PackageDelivered if snapshot.payout_pending => {
                return self.run_payout(request.transaction_id).await;
            }
            _ => {
                return Err(self.wrong_state(&snapshot, TransactionStatus::PackageDelivered));
            }
        }

        let auth_ref = snapshot
            .external_payment_ref
            .clone()
            .ok_or_else(|| EscrowError::internal("escrowed transaction missing auth reference"))?;

        // Idempotent capture: "already captured" comes back as success
        self.gateway.capture(&auth_ref).await?;

        let txn = self
            .apply_transition(
                request.transaction_id,
                TransactionStatus::PackagePickedUp,
                TransactionStatus::PackageDelivered,
                Some(request.caller_id),
                Some("delivery code accepted, escrow captured".to_string()),
                |txn| {
                    txn.delivered_at = Some(Utc::now());
                    txn.payout_pending = true;
                },
            )
            .await;

        let txn = match txn {
            Ok(txn) => txn,
            // A concurrent caller won the transition; already-released is a
            // no-op success
            Err(EscrowError::StateTransition { .. }) => {
                let current = self.get_transaction(request.transaction_id).await?;
                if current.status == TransactionStatus::PaymentReleased {
                    return Ok(current);
                }
                return Err(self.wrong_state(&current, TransactionStatus::PackageDelivered));
            }
            Err(err) => return Err(err),
        };

        self.publisher.delivery_confirmed(&txn).await;

        self.run_payout(request.transaction_id).await
    }

    /// Retry the payout of a captured-but-unreleased transaction
    ///
    /// Never re-captures; only the payout leg runs again.
    pub async fn retry_payout(&self, transaction_id: Uuid) -> EscrowResult<Transaction> {
        let snapshot = self.get_transaction(transaction_id).await?;

        if snapshot.status == TransactionStatus::PaymentReleased {
            return Ok(snapshot);
        }
        if snapshot.status != TransactionStatus::PackageDelivered || !snapshot.payout_pending {
            return Err(self.wrong_state(&snapshot, TransactionStatus::PaymentReleased));
        }

        self.run_payout(transaction_id).await
    }

    /// Route `traveler_amount` to the traveler and finish the release
    ///
    /// Claims the pending payout under the write lock so concurrent callers
    /// cannot pay out twice; the claim is returned on failure.
    async fn run_payout(&self, transaction_id: Uuid) -> EscrowResult<Transaction> {
        let claimed = {
            let mut txns = self.transactions.write().await;
            let txn = txns
                .get_mut(&transaction_id)
                .ok_or(EscrowError::TransactionNotFound(transaction_id))?;

            if txn.status == TransactionStatus::PaymentReleased {
                return Ok(txn.clone());
            }
            if txn.status != TransactionStatus::PackageDelivered || !txn.payout_pending {
                let snapshot = txn.clone();
                return Err(self.wrong_state(&snapshot, TransactionStatus::PaymentReleased));
            }

            txn.payout_pending = false;
            txn.clone()
        };

        let outcome = match self
            .payout_router
            .release_funds(claimed.traveler_id, claimed.traveler_amount, claimed.id)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    "Payout failed for transaction {}, leaving it recoverable: {}",
                    transaction_id, err
                );
                let mut txns = self.transactions.write().await;
                if let Some(txn) = txns.get_mut(&transaction_id) {
                    txn.payout_pending = true;
                    txn.updated_at = Utc::now();
                    txn.status_history.push(StatusHistoryEntry {
                        from_status: Some(txn.status),
                        to_status: txn.status,
                        actor: None,
                        note: Some(format!("payout attempt failed: {}", err)),
                        at: Utc::now(),
                    });
                }
                return Err(err);
            }
        };

        let route = match outcome.route {
            crate::payout_router::PayoutRoute::ExternalTransfer => "transfer",
            crate::payout_router::PayoutRoute::WalletCredit => "wallet",
        };
        let transfer_ref = outcome.transfer_ref.clone();
        let fallback = outcome.fallback;

        let txn = self
            .apply_transition(
                transaction_id,
                TransactionStatus::PackageDelivered,
                TransactionStatus::PaymentReleased,
                None,
                Some(format!("funds released via {}", route)),
                |txn| {
                    txn.payment_released_at = Some(Utc::now());
                    txn.external_transfer_ref = transfer_ref.clone();
                    if fallback {
                        txn.payout_fallback_note =
                            Some("external transfer failed; credited wallet".to_string());
                    }
                },
            )
            .await?;

        self.publisher.payment_received(&txn, route).await;

        Ok(txn)
    }

    /// Cancel a booking before escrow, releasing its capacity
    pub async fn cancel_transaction(
        &self,
        request: CancelTransactionRequest,
    ) -> EscrowResult<Transaction> {
        let (txn, released_weight) = {
            let mut txns = self.transactions.write().await;
            let txn = txns
                .get_mut(&request.transaction_id)
                .ok_or(EscrowError::TransactionNotFound(request.transaction_id))?;

            if !txn.is_party(request.caller_id) {
                return Err(EscrowError::unauthorized(
                    "Only the sender or traveler can cancel",
                ));
            }
            if txn.status == TransactionStatus::Cancelled {
                return Ok(txn.clone());
            }
            if !txn.status.can_cancel() {
                return Err(EscrowError::CannotCancelPaidTransaction);
            }

            let from = txn.status;
            txn.status = TransactionStatus::Cancelled;
            txn.cancelled_by = Some(request.caller_id);
            txn.updated_at = Utc::now();
            txn.status_history.push(StatusHistoryEntry {
                from_status: Some(from),
                to_status: txn.status,
                actor: Some(request.caller_id),
                note: Some("cancelled before escrow".to_string()),
                at: Utc::now(),
            });

            (txn.clone(), txn.package_weight)
        };

        // The guarded transition above runs exactly once, so the weight is
        // released exactly once
        self.capacity_ledger
            .release(txn.trip_id, released_weight)
            .await?;

        info!("Transaction {} cancelled by {}", txn.id, request.caller_id);

        self.publisher
            .transaction_cancelled(&txn, request.caller_id)
            .await;

        Ok(txn)
    }

    /// Administrative transition into arbitration
    pub async fn mark_disputed(
        &self,
        transaction_id: Uuid,
        admin_note: &str,
    ) -> EscrowResult<Transaction> {
        let snapshot = self.get_transaction(transaction_id).await?;
        let expected = snapshot.status;
        self.apply_transition(
            transaction_id,
            expected,
            TransactionStatus::Disputed,
            None,
            Some(format!("disputed: {}", admin_note)),
            |_| {},
        )
        .await
    }

    /// Administrative refund to the sender
    ///
    /// Cancels the hold if the payment was never captured, refunds the
    /// capture otherwise. Trip capacity stays committed.
    pub async fn admin_refund(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> EscrowResult<Transaction> {
        let snapshot = self.get_transaction(transaction_id).await?;
        snapshot.validate_transition(TransactionStatus::Refunded)?;

        if let Some(auth_ref) = snapshot.external_payment_ref.clone() {
            match snapshot.status {
                TransactionStatus::PaymentEscrowed | TransactionStatus::PackagePickedUp => {
                    self.gateway.cancel_authorization(&auth_ref).await?;
                }
                TransactionStatus::PackageDelivered => {
                    self.gateway
                        .refund(&auth_ref, snapshot.amount, reason)
                        .await?;
                }
                _ => {}
            }
        }

        let expected = snapshot.status;
        self.apply_transition(
            transaction_id,
            expected,
            TransactionStatus::Refunded,
            None,
            Some(format!("refunded: {}", reason)),
            |txn| {
                txn.payout_pending = false;
            },
        )
        .await
    }

    /// Get a transaction by ID
    pub async fn get_transaction(&self, transaction_id: Uuid) -> EscrowResult<Transaction> {
        self.transactions
            .read()
            .await
            .get(&transaction_id)
            .cloned()
            .ok_or(EscrowError::TransactionNotFound(transaction_id))
    }

    /// All transactions booked on a trip
    pub async fn transactions_for_trip(&self, trip_id: Uuid) -> Vec<Transaction> {
        self.transactions
            .read()
            .await
            .values()
            .filter(|txn| txn.trip_id == trip_id)
            .cloned()
            .collect()
    }

    /// All transactions where the user is sender or traveler
    pub async fn user_transactions(&self, user_id: Uuid) -> Vec<Transaction> {
        self.transactions
            .read()
            .await
            .values()
            .filter(|txn| txn.is_party(user_id))
            .cloned()
            .collect()
    }

    /// Apply a payment-succeeded processor event
    ///
    /// Applied only if the transaction is still awaiting escrow; an
    /// already-escrowed transaction makes this a no-op, not an error.
    pub async fn reconcile_payment_succeeded(
        &self,
        transaction_id: Uuid,
        payment_ref: &str,
    ) -> EscrowResult<Transaction> {
        let snapshot = self.get_transaction(transaction_id).await?;
        if snapshot.status != TransactionStatus::PaymentPending {
            return Ok(snapshot);
        }

        let payment_ref = payment_ref.to_string();
        let txn = self
            .apply_transition(
                transaction_id,
                TransactionStatus::PaymentPending,
                TransactionStatus::PaymentEscrowed,
                None,
                Some("processor reported payment succeeded".to_string()),
                |txn| {
                    if txn.external_payment_ref.is_none() {
                        txn.external_payment_ref = Some(payment_ref.clone());
                    }
                },
            )
            .await?;

        self.publisher.payment_confirmed(&txn).await;
        self.publisher.pickup_ready(&txn).await;

        Ok(txn)
    }

    /// Apply a payment-failed or payment-cancelled processor event
    ///
    /// Clears a stale authorization reference while the transaction is still
    /// pending; anything later means the event is outdated and ignored.
    pub async fn reconcile_payment_failed(
        &self,
        transaction_id: Uuid,
        note: &str,
    ) -> EscrowResult<Transaction> {
        let mut txns = self.transactions.write().await;
        let txn = txns
            .get_mut(&transaction_id)
            .ok_or(EscrowError::TransactionNotFound(transaction_id))?;

        if txn.status != TransactionStatus::PaymentPending {
            return Ok(txn.clone());
        }

        txn.external_payment_ref = None;
        txn.updated_at = Utc::now();
        txn.status_history.push(StatusHistoryEntry {
            from_status: Some(txn.status),
            to_status: txn.status,
            actor: None,
            note: Some(note.to_string()),
            at: Utc::now(),
        });

        Ok(txn.clone())
    }

    /// Record a processor-side transfer reference the core has not seen yet
    pub async fn reconcile_transfer_created(
        &self,
        transaction_id: Uuid,
        transfer_ref: &str,
    ) -> EscrowResult<Transaction> {
        let mut txns = self.transactions.write().await;
        let txn = txns
            .get_mut(&transaction_id)
            .ok_or(EscrowError::TransactionNotFound(transaction_id))?;

        if txn.status == TransactionStatus::PaymentReleased && txn.external_transfer_ref.is_none() {
            txn.external_transfer_ref = Some(transfer_ref.to_string());
            txn.updated_at = Utc::now();
        }

        Ok(txn.clone())
    }

    /// Apply a transfer-reversed processor event
    ///
    /// The funds are back in the platform's custody, so the external
    /// reference is claimed (taken and cleared) in a single read-modify-write
    /// under the store's write lock; the status stays PaymentReleased.
    /// Returns the claimed reference so the caller re-credits the traveler's
    /// wallet exactly once: a concurrent or repeated reversal finds the
    /// reference already gone and must not credit.
    pub async fn reconcile_transfer_reversed(
        &self,
        transaction_id: Uuid,
    ) -> EscrowResult<(Transaction, Option<String>)> {
        let mut txns = self.transactions.write().await;
        let txn = txns
            .get_mut(&transaction_id)
            .ok_or(EscrowError::TransactionNotFound(transaction_id))?;

        let Some(reference) = txn.external_transfer_ref.take() else {
            return Ok((txn.clone(), None));
        };

        txn.updated_at = Utc::now();
        txn.status_history.push(StatusHistoryEntry {
            from_status: Some(txn.status),
            to_status: txn.status,
            actor: None,
            note: Some("external transfer reversed; funds returned to platform".to_string()),
            at: Utc::now(),
        });

        Ok((txn.clone(), Some(reference)))
    }

    /// Put a claimed transfer reference back after a failed reversal credit
    ///
    /// Undoes [`TransactionManager::reconcile_transfer_reversed`] so a
    /// redelivered reversal event can claim and credit again.
    pub async fn restore_transfer_ref(
        &self,
        transaction_id: Uuid,
        transfer_ref: &str,
    ) -> EscrowResult<()> {
        let mut txns = self.transactions.write().await;
        let txn = txns
            .get_mut(&transaction_id)
            .ok_or(EscrowError::TransactionNotFound(transaction_id))?;

        txn.external_transfer_ref = Some(transfer_ref.to_string());
        txn.updated_at = Utc::now();

        Ok(())
    }

    /// Apply a guarded transition under the store's write lock
    ///
    /// The expected prior state is revalidated after any external call the
    /// caller made, so a race with another actor fails here instead of
    /// overwriting state.
    async fn apply_transition<F>(
        &self,
        transaction_id: Uuid,
        expected: TransactionStatus,
        to_status: TransactionStatus,
        actor: Option<Uuid>,
        note: Option<String>,
        mutate: F,
    ) -> EscrowResult<Transaction>
    where
        F: FnOnce(&mut Transaction),
    {
        let mut txns = self.transactions.write().await;
        let txn = txns
            .get_mut(&transaction_id)
            .ok_or(EscrowError::TransactionNotFound(transaction_id))?;

        if txn.status != expected {
            return Err(EscrowError::state_transition(
                format!("{:?}", txn.status),
                format!("{:?}", to_status),
                format!("expected {:?}", expected),
            ));
        }
        txn.validate_transition(to_status)?;

        let from = txn.status;
        txn.status = to_status;
        mutate(txn);
        txn.updated_at = Utc::now();
        txn.status_history.push(StatusHistoryEntry {
            from_status: Some(from),
            to_status,
            actor,
            note,
            at: Utc::now(),
        });

        info!(
            "Transaction {} transitioned {:?} -> {:?}",
            transaction_id, from, to_status
        );

        Ok(txn.clone())
    }

    fn wrong_state(&self, txn: &Transaction, to_status: TransactionStatus) -> EscrowError {
        EscrowError::state_transition(
            format!("{:?}", txn.status),
            format!("{:?}", to_status),
            "Transaction is not in the required state".to_string(),
        )
    }

    fn validate_create_request(&self, request: &CreateTransactionRequest) -> EscrowResult<()> {
        if request.package_description.trim().chars().count() < self.config.min_description_chars {
            return Err(EscrowError::InvalidPackageDescription(format!(
                "Description must be at least {} characters",
                self.config.min_description_chars
            )));
        }
        if request.package_weight <= 0.0 {
            return Err(EscrowError::validation("Package weight must be positive"));
        }
        if request.package_weight > self.config.max_package_weight_kg {
            return Err(EscrowError::validation(format!(
                "Package weight {} kg exceeds maximum {} kg",
                request.package_weight, self.config.max_package_weight_kg
            )));
        }
        if request.amount <= 0 {
            return Err(EscrowError::validation("Amount must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::{FailingSink, RecordingSink};
    use crate::events::DomainEventKind;
    use crate::gateway::{GatewayConfig, SimulatedGateway};
    use crate::models::Trip;
    use crate::payout_router::{PayoutRouter, PayoutRouterConfig};
    use crate::wallet_store::WalletStore;

    struct Harness {
        manager: TransactionManager,
        ledger: Arc<CapacityLedger>,
        client: Arc<SimulatedGateway>,
        wallets: Arc<WalletStore>,
        router: Arc<PayoutRouter>,
        sink: Arc<RecordingSink>,
    }

    fn harness() -> Harness {
        let client = Arc::new(SimulatedGateway::new());
        let gateway_config = GatewayConfig {
            max_retry_attempts: 1,
            retry_backoff_ms: 1,
            ..GatewayConfig::default()
        };
        let gateway = Arc::new(PaymentGateway::new(gateway_config, client.clone()));
        let wallets = Arc::new(WalletStore::new());
        let router = Arc::new(PayoutRouter::new(
            PayoutRouterConfig::default(),
            gateway.clone(),
            wallets.clone(),
        ));
        let ledger = Arc::new(CapacityLedger::new());
        let sink = Arc::new(RecordingSink::new());
        let manager = TransactionManager::new(
            TransactionManagerConfig::default(),
            ledger.clone(),
            gateway,
            router.clone(),
            EventPublisher::new(sink.clone()),
        );

        Harness {
            manager,
            ledger,
            client,
            wallets,
            router,
            sink,
        }
    }

    async fn published_trip(h: &Harness, capacity: f64) -> Trip {
        let trip = h
            .ledger
            .create_trip(Uuid::new_v4(), capacity)
            .await
            .unwrap();
        h.ledger.publish_trip(trip.id).await.unwrap()
    }

    async fn booked(h: &Harness, trip: &Trip, weight: f64, amount: i64) -> Transaction {
        h.manager
            .create_transaction(CreateTransactionRequest {
                trip_id: trip.id,
                sender_id: Uuid::new_v4(),
                amount,
                package_description: "Box of books, handle with care".to_string(),
                package_weight: weight,
            })
            .await
            .unwrap()
    }

    async fn escrowed(h: &Harness, trip: &Trip, weight: f64, amount: i64) -> Transaction {
        let txn = booked(h, trip, weight, amount).await;
        h.manager
            .escrow_payment(EscrowPaymentRequest {
                transaction_id: txn.id,
                sender_id: txn.sender_id,
                payer_ref: "pm_test".to_string(),
            })
            .await
            .unwrap()
    }

    async fn picked_up(h: &Harness, trip: &Trip, weight: f64, amount: i64) -> Transaction {
        let txn = escrowed(h, trip, weight, amount).await;
        h.manager
            .confirm_pickup(ConfirmPickupRequest {
                transaction_id: txn.id,
                caller_id: txn.traveler_id,
                pickup_code: txn.pickup_code.clone(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_capacity_scenario_with_cancellation() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;

        let a = booked(&h, &trip, 7.0, 10_000).await;
        assert_eq!(h.ledger.get_trip(trip.id).await.unwrap().available_weight(), 3.0);

        // Booking B for 5 kg no longer fits
        let err = h
            .manager
            .create_transaction(CreateTransactionRequest {
                trip_id: trip.id,
                sender_id: Uuid::new_v4(),
                amount: 8_000,
                package_description: "Framed painting, do not bend".to_string(),
                package_weight: 5.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::CapacityExceeded { .. }));

        // Cancelling A reopens the capacity and B succeeds
        h.manager
            .cancel_transaction(CancelTransactionRequest {
                transaction_id: a.id,
                caller_id: a.sender_id,
            })
            .await
            .unwrap();
        assert_eq!(
            h.ledger.get_trip(trip.id).await.unwrap().available_weight(),
            10.0
        );

        let b = booked(&h, &trip, 5.0, 8_000).await;
        assert_eq!(b.status, TransactionStatus::PaymentPending);
    }

    #[tokio::test]
    async fn test_capacity_invariant_matches_transactions() {
        let h = harness();
        let trip = published_trip(&h, 20.0).await;

        let a = booked(&h, &trip, 7.0, 10_000).await;
        let _b = booked(&h, &trip, 4.0, 6_000).await;
        let _c = booked(&h, &trip, 2.5, 3_000).await;

        h.manager
            .cancel_transaction(CancelTransactionRequest {
                transaction_id: a.id,
                caller_id: a.sender_id,
            })
            .await
            .unwrap();

        let reserved: f64 = h
            .manager
            .transactions_for_trip(trip.id)
            .await
            .iter()
            .filter(|txn| txn.status.holds_capacity())
            .map(|txn| txn.package_weight)
            .sum();
        let trip_after = h.ledger.get_trip(trip.id).await.unwrap();

        assert_eq!(trip_after.reserved_weight, reserved);
        assert!(trip_after.reserved_weight <= trip_after.capacity_kg);
    }

    #[tokio::test]
    async fn test_full_lifecycle_fee_split_and_events() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;
        let txn = escrowed(&h, &trip, 3.0, 10_000).await;

        assert_eq!(txn.service_fee, 1_000);
        assert_eq!(txn.traveler_amount, 9_000);
        assert_eq!(txn.status, TransactionStatus::PaymentEscrowed);

        // Wrong pickup code leaves the state unchanged
        let err = h
            .manager
            .confirm_pickup(ConfirmPickupRequest {
                transaction_id: txn.id,
                caller_id: txn.traveler_id,
                pickup_code: "WRONG123".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidPickupCode));
        assert_eq!(
            h.manager.get_transaction(txn.id).await.unwrap().status,
            TransactionStatus::PaymentEscrowed
        );

        let txn = h
            .manager
            .confirm_pickup(ConfirmPickupRequest {
                transaction_id: txn.id,
                caller_id: txn.traveler_id,
                pickup_code: txn.pickup_code.clone(),
            })
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::PackagePickedUp);

        let txn = h
            .manager
            .confirm_delivery(ConfirmDeliveryRequest {
                transaction_id: txn.id,
                caller_id: txn.sender_id,
                delivery_code: txn.delivery_code.clone(),
            })
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::PaymentReleased);
        assert!(txn.payment_released_at.is_some());

        // No connected account: traveler is paid into the wallet
        assert_eq!(h.wallets.get_wallet(txn.traveler_id).await.balance, 9_000);
        assert_eq!(h.client.capture_count(txn.id).await, 1);

        let kinds = h.sink.kinds().await;
        assert!(kinds.contains(&DomainEventKind::ReservationCreated));
        assert!(kinds.contains(&DomainEventKind::PaymentConfirmed));
        assert!(kinds.contains(&DomainEventKind::PickupReady));
        assert!(kinds.contains(&DomainEventKind::DeliveryConfirmed));
        assert!(kinds.contains(&DomainEventKind::PaymentReceived));

        // Complete forensic trail
        assert_eq!(txn.status_history.len(), 5);
    }

    #[tokio::test]
    async fn test_double_delivery_is_single_capture_and_payout() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;
        let txn = picked_up(&h, &trip, 3.0, 10_000).await;

        let request = ConfirmDeliveryRequest {
            transaction_id: txn.id,
            caller_id: txn.traveler_id,
            delivery_code: txn.delivery_code.clone(),
        };
        let first = h.manager.confirm_delivery(request.clone()).await.unwrap();
        let second = h.manager.confirm_delivery(request).await.unwrap();

        assert_eq!(first.status, TransactionStatus::PaymentReleased);
        assert_eq!(second.status, TransactionStatus::PaymentReleased);
        assert_eq!(h.client.capture_count(txn.id).await, 1);
        assert_eq!(h.wallets.get_wallet(txn.traveler_id).await.balance, 9_000);
        assert_eq!(
            h.wallets.reconstructed_balance(txn.traveler_id).await,
            9_000
        );
    }

    #[tokio::test]
    async fn test_cancellation_boundary_after_escrow() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;
        let txn = escrowed(&h, &trip, 3.0, 10_000).await;

        let err = h
            .manager
            .cancel_transaction(CancelTransactionRequest {
                transaction_id: txn.id,
                caller_id: txn.sender_id,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::CannotCancelPaidTransaction));

        // Capacity stays committed
        assert_eq!(
            h.ledger.get_trip(trip.id).await.unwrap().reserved_weight,
            3.0
        );
    }

    #[tokio::test]
    async fn test_escrow_is_idempotent() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;
        let txn = booked(&h, &trip, 3.0, 10_000).await;

        let request = EscrowPaymentRequest {
            transaction_id: txn.id,
            sender_id: txn.sender_id,
            payer_ref: "pm_test".to_string(),
        };
        let first = h.manager.escrow_payment(request.clone()).await.unwrap();
        let second = h.manager.escrow_payment(request).await.unwrap();

        assert_eq!(first.external_payment_ref, second.external_payment_ref);
        assert_eq!(second.status_history.len(), first.status_history.len());
    }

    #[tokio::test]
    async fn test_authorization_decline_leaves_pending() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;
        let txn = booked(&h, &trip, 3.0, 10_000).await;

        h.client.set_decline_authorizations(true);
        let err = h
            .manager
            .escrow_payment(EscrowPaymentRequest {
                transaction_id: txn.id,
                sender_id: txn.sender_id,
                payer_ref: "pm_test".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::PaymentAuthorization(_)));
        assert_eq!(
            h.manager.get_transaction(txn.id).await.unwrap().status,
            TransactionStatus::PaymentPending
        );
    }

    #[tokio::test]
    async fn test_payout_failure_leaves_recoverable_state() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;
        let txn = picked_up(&h, &trip, 3.0, 10_000).await;

        h.wallets.inject_credit_failures(1);
        let err = h
            .manager
            .confirm_delivery(ConfirmDeliveryRequest {
                transaction_id: txn.id,
                caller_id: txn.sender_id,
                delivery_code: txn.delivery_code.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Internal(_)));

        // Captured but not released, flagged for payout-only retry
        let stuck = h.manager.get_transaction(txn.id).await.unwrap();
        assert_eq!(stuck.status, TransactionStatus::PackageDelivered);
        assert!(stuck.payout_pending);
        assert_eq!(h.client.capture_count(txn.id).await, 1);

        // Retry completes the release without a second capture
        let released = h.manager.retry_payout(txn.id).await.unwrap();
        assert_eq!(released.status, TransactionStatus::PaymentReleased);
        assert!(!released.payout_pending);
        assert_eq!(h.client.capture_count(txn.id).await, 1);
        assert_eq!(h.wallets.get_wallet(txn.traveler_id).await.balance, 9_000);
    }

    #[tokio::test]
    async fn test_transfer_fallback_annotates_transaction() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;
        let txn = picked_up(&h, &trip, 3.0, 10_000).await;

        h.router
            .register_connected_account(txn.traveler_id, "acct_t".to_string(), "US".to_string())
            .await;
        h.client.inject_transfer_failures(1);

        let released = h
            .manager
            .confirm_delivery(ConfirmDeliveryRequest {
                transaction_id: txn.id,
                caller_id: txn.sender_id,
                delivery_code: txn.delivery_code.clone(),
            })
            .await
            .unwrap();

        assert_eq!(released.status, TransactionStatus::PaymentReleased);
        assert!(released.payout_fallback_note.is_some());
        assert!(released.external_transfer_ref.is_none());
        assert_eq!(h.wallets.get_wallet(txn.traveler_id).await.balance, 9_000);
    }

    #[tokio::test]
    async fn test_pickup_requires_traveler() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;
        let txn = escrowed(&h, &trip, 3.0, 10_000).await;

        let err = h
            .manager
            .confirm_pickup(ConfirmPickupRequest {
                transaction_id: txn.id,
                caller_id: txn.sender_id,
                pickup_code: txn.pickup_code.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_create_validations() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;

        let err = h
            .manager
            .create_transaction(CreateTransactionRequest {
                trip_id: trip.id,
                sender_id: Uuid::new_v4(),
                amount: 5_000,
                package_description: "short".to_string(),
                package_weight: 1.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidPackageDescription(_)));

        let err = h
            .manager
            .create_transaction(CreateTransactionRequest {
                trip_id: Uuid::new_v4(),
                sender_id: Uuid::new_v4(),
                amount: 5_000,
                package_description: "A reasonable description".to_string(),
                package_weight: 1.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::TripNotFound(_)));
    }

    #[tokio::test]
    async fn test_failing_sink_never_blocks_transitions() {
        let client = Arc::new(SimulatedGateway::new());
        let gateway = Arc::new(PaymentGateway::new(
            GatewayConfig::default(),
            client.clone(),
        ));
        let wallets = Arc::new(WalletStore::new());
        let router = Arc::new(PayoutRouter::new(
            PayoutRouterConfig::default(),
            gateway.clone(),
            wallets.clone(),
        ));
        let ledger = Arc::new(CapacityLedger::new());
        let manager = TransactionManager::new(
            TransactionManagerConfig::default(),
            ledger.clone(),
            gateway,
            router,
            EventPublisher::new(Arc::new(FailingSink)),
        );

        let trip = ledger.create_trip(Uuid::new_v4(), 10.0).await.unwrap();
        ledger.publish_trip(trip.id).await.unwrap();

        let txn = manager
            .create_transaction(CreateTransactionRequest {
                trip_id: trip.id,
                sender_id: Uuid::new_v4(),
                amount: 10_000,
                package_description: "Box of books, handle with care".to_string(),
                package_weight: 3.0,
            })
            .await
            .unwrap();
        let txn = manager
            .escrow_payment(EscrowPaymentRequest {
                transaction_id: txn.id,
                sender_id: txn.sender_id,
                payer_ref: "pm_test".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::PaymentEscrowed);
    }

    #[tokio::test]
    async fn test_admin_paths_are_representable() {
        let h = harness();
        let trip = published_trip(&h, 10.0).await;

        let disputed = escrowed(&h, &trip, 2.0, 5_000).await;
        let disputed = h
            .manager
            .mark_disputed(disputed.id, "sender reports damage")
            .await
            .unwrap();
        assert_eq!(disputed.status, TransactionStatus::Disputed);

        let refunded = escrowed(&h, &trip, 2.0, 5_000).await;
        let refunded = h
            .manager
            .admin_refund(refunded.id, "traveler no-show")
            .await
            .unwrap();
        assert_eq!(refunded.status, TransactionStatus::Refunded);
    }
}
