//! Escrow Payment Gateway Adapter - authorize/capture/cancel/refund/transfer
//!
//! Wraps the external payment processor behind a stable interface. Every call
//! is idempotently keyed by transaction id in its request metadata, which is
//! what makes the adapter's bounded-timeout retry loop safe: a retried call
//! after a timeout cannot double-charge or double-transfer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::EscrowResult;

/// Configuration for the payment gateway adapter
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-call timeout in seconds
    pub request_timeout_secs: u64,
    /// Maximum attempts per call (first try included)
    pub max_retry_attempts: u32,
    /// Base backoff between retries in milliseconds
    pub retry_backoff_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_retry_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

/// Raw processor calls, implemented per provider
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Place a hold on the payer's funds; returns an authorization reference
    async fn authorize(
        &self,
        amount: i64,
        payer_ref: &str,
        transaction_id: Uuid,
    ) -> EscrowResult<String>;

    /// Convert a held authorization into a captured payment
    ///
    /// Must tolerate being called twice: an already-captured authorization
    /// returns the captured amount, not an error.
    async fn capture(&self, auth_ref: &str) -> EscrowResult<i64>;

    /// Void an uncaptured authorization, returning the hold to the payer
    async fn cancel_authorization(&self, auth_ref: &str) -> EscrowResult<()>;

    /// Refund a captured payment
    async fn refund(&self, auth_ref: &str, amount: i64, reason: &str) -> EscrowResult<()>;

    /// Move captured funds to a connected account
    async fn create_transfer(
        &self,
        destination: &str,
        amount: i64,
        transaction_id: Uuid,
    ) -> EscrowResult<String>;
}

/// Gateway adapter adding bounded timeouts and retry over a raw client
pub struct PaymentGateway {
    config: GatewayConfig,
    client: Arc<dyn GatewayClient>,
}

impl PaymentGateway {
    /// Create a new gateway adapter over the given client
    pub fn new(config: GatewayConfig, client: Arc<dyn GatewayClient>) -> Self {
        Self { config, client }
    }

    /// Run an idempotent gateway call with timeout and bounded retry
    ///
    /// Only transient failures (timeouts, network-class gateway errors) are
    /// retried; an authorization decline is surfaced immediately.
    async fn with_retry<T, F, Fut>(&self, op_name: &str, mut call: F) -> EscrowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = EscrowResult<T>>,
    {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(EscrowError::timeout(format!(
                    "gateway {} call timed out",
                    op_name
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.max_retry_attempts => {
                    warn!(
                        "Gateway {} attempt {}/{} failed, retrying: {}",
                        op_name, attempt, self.config.max_retry_attempts, err
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.config.retry_backoff_ms * attempt as u64,
                    ))
                    .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Authorize a hold on the payer's funds
    pub async fn authorize(
        &self,
        amount: i64,
        payer_ref: &str,
        transaction_id: Uuid,
    ) -> EscrowResult<String> {
        let client = self.client.clone();
        let payer_ref = payer_ref.to_string();
        self.with_retry("authorize", || {
            let client = client.clone();
            let payer_ref = payer_ref.clone();
            async move { client.authorize(amount, &payer_ref, transaction_id).await }
        })
        .await
    }

    /// Capture a held authorization
    pub async fn capture(&self, auth_ref: &str) -> EscrowResult<i64> {
        let client = self.client.clone();
        let auth_ref = auth_ref.to_string();
        self.with_retry("capture", || {
            let client = client.clone();
            let auth_ref = auth_ref.clone();
            async move { client.capture(&auth_ref).await }
        })
        .await
    }

    /// Cancel an uncaptured authorization
    pub async fn cancel_authorization(&self, auth_ref: &str) -> EscrowResult<()> {
        let client = self.client.clone();
        let auth_ref = auth_ref.to_string();
        self.with_retry("cancel_authorization", || {
            let client = client.clone();
            let auth_ref = auth_ref.clone();
            async move { client.cancel_authorization(&auth_ref).await }
        })
        .await
    }

    /// Refund a captured payment
    pub async fn refund(&self, auth_ref: &str, amount: i64, reason: &str) -> EscrowResult<()> {
        let client = self.client.clone();
        let auth_ref = auth_ref.to_string();
        let reason = reason.to_string();
        self.with_retry("refund", || {
            let client = client.clone();
            let auth_ref = auth_ref.clone();
            let reason = reason.clone();
            async move { client.refund(&auth_ref, amount, &reason).await }
        })
        .await
    }

    /// Transfer captured funds to a connected account
    pub async fn create_transfer(
        &self,
        destination: &str,
        amount: i64,
        transaction_id: Uuid,
    ) -> EscrowResult<String> {
        let client = self.client.clone();
        let destination = destination.to_string();
        self.with_retry("create_transfer", || {
            let client = client.clone();
            let destination = destination.clone();
            async move {
                client
                    .create_transfer(&destination, amount, transaction_id)
                    .await
            }
        })
        .await
    }
}

/// Internal record of a simulated authorization
#[derive(Debug, Clone)]
struct AuthorizationRecord {
    auth_ref: String,
    transaction_id: Uuid,
    amount: i64,
    captured: bool,
    cancelled: bool,
    refunded_amount: i64,
}

/// In-memory processor simulation (replace with a real provider client in
/// production)
///
/// Behaves like the real thing where it matters for the core: authorize is
/// keyed by transaction id (the same transaction re-authorizes to the same
/// reference), capture tolerates repetition, transfers are idempotent per
/// transaction. Failure injection hooks drive the adapter and router tests.
pub struct SimulatedGateway {
    authorizations: Arc<RwLock<HashMap<String, AuthorizationRecord>>>,
    auth_by_transaction: Arc<RwLock<HashMap<Uuid, String>>>,
    transfers_by_transaction: Arc<RwLock<HashMap<Uuid, String>>>,
    transient_failures: AtomicU32,
    transfer_failures: AtomicU32,
    decline_authorizations: AtomicBool,
}

impl SimulatedGateway {
    /// Create an empty simulated gateway
    pub fn new() -> Self {
        Self {
            authorizations: Arc::new(RwLock::new(HashMap::new())),
            auth_by_transaction: Arc::new(RwLock::new(HashMap::new())),
            transfers_by_transaction: Arc::new(RwLock::new(HashMap::new())),
            transient_failures: AtomicU32::new(0),
            transfer_failures: AtomicU32::new(0),
            decline_authorizations: AtomicBool::new(false),
        }
    }

    /// Make the next `count` calls fail with a transient gateway error
    pub fn inject_transient_failures(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` transfer calls fail
    pub fn inject_transfer_failures(&self, count: u32) {
        self.transfer_failures.store(count, Ordering::SeqCst);
    }

    /// Decline all authorization attempts until reset
    pub fn set_decline_authorizations(&self, decline: bool) {
        self.decline_authorizations.store(decline, Ordering::SeqCst);
    }

    /// Number of captures recorded for a transaction's authorization
    pub async fn capture_count(&self, transaction_id: Uuid) -> usize {
        let by_txn = self.auth_by_transaction.read().await;
        let Some(auth_ref) = by_txn.get(&transaction_id) else {
            return 0;
        };
        let auths = self.authorizations.read().await;
        auths
            .get(auth_ref)
            .map(|record| usize::from(record.captured))
            .unwrap_or(0)
    }

    /// Number of transfers created across all transactions
    pub async fn transfer_count(&self) -> usize {
        self.transfers_by_transaction.read().await.len()
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayClient for SimulatedGateway {
    async fn authorize(
        &self,
        amount: i64,
        _payer_ref: &str,
        transaction_id: Uuid,
    ) -> EscrowResult<String> {
        if self.take_transient_failure() {
            return Err(EscrowError::gateway("simulated network failure"));
        }

        if self.decline_authorizations.load(Ordering::SeqCst) {
            return Err(EscrowError::payment_authorization(
                "card declined by processor",
            ));
        }

        // Idempotency: the same transaction always maps to the same hold
        let mut by_txn = self.auth_by_transaction.write().await;
        if let Some(existing) = by_txn.get(&transaction_id) {
            let auths = self.authorizations.read().await;
            if let Some(record) = auths.get(existing) {
                if !record.cancelled {
                    return Ok(record.auth_ref.clone());
                }
            }
        }

        let auth_ref = format!("auth_{}", Uuid::new_v4().simple());
        let record = AuthorizationRecord {
            auth_ref: auth_ref.clone(),
            transaction_id,
            amount,
            captured: false,
            cancelled: false,
            refunded_amount: 0,
        };
        self.authorizations
            .write()
            .await
            .insert(auth_ref.clone(), record);
        by_txn.insert(transaction_id, auth_ref.clone());

        info!("Authorized {} for transaction {}", amount, transaction_id);

        Ok(auth_ref)
    }

    async fn capture(&self, auth_ref: &str) -> EscrowResult<i64> {
        if self.take_transient_failure() {
            return Err(EscrowError::gateway("simulated network failure"));
        }

        let mut auths = self.authorizations.write().await;
        let record = auths
            .get_mut(auth_ref)
            .ok_or_else(|| EscrowError::gateway(format!("unknown authorization {}", auth_ref)))?;

        if record.cancelled {
            return Err(EscrowError::gateway(format!(
                "authorization {} was cancelled",
                auth_ref
            )));
        }

        // "Already captured" is success, not failure
        if record.captured {
            return Ok(record.amount);
        }

        record.captured = true;
        info!(
            "Captured {} for transaction {}",
            record.amount, record.transaction_id
        );

        Ok(record.amount)
    }

    async fn cancel_authorization(&self, auth_ref: &str) -> EscrowResult<()> {
        let mut auths = self.authorizations.write().await;
        let record = auths
            .get_mut(auth_ref)
            .ok_or_else(|| EscrowError::gateway(format!("unknown authorization {}", auth_ref)))?;

        if record.captured {
            return Err(EscrowError::gateway(
                "cannot cancel a captured authorization; refund instead",
            ));
        }

        record.cancelled = true;
        Ok(())
    }

    async fn refund(&self, auth_ref: &str, amount: i64, reason: &str) -> EscrowResult<()> {
        let mut auths = self.authorizations.write().await;
        let record = auths
            .get_mut(auth_ref)
            .ok_or_else(|| EscrowError::gateway(format!("unknown authorization {}", auth_ref)))?;

        if !record.captured {
            return Err(EscrowError::gateway(
                "cannot refund an uncaptured authorization",
            ));
        }
        if record.refunded_amount + amount > record.amount {
            return Err(EscrowError::gateway("refund exceeds captured amount"));
        }

        record.refunded_amount += amount;
        info!(
            "Refunded {} for transaction {} ({})",
            amount, record.transaction_id, reason
        );

        Ok(())
    }

    async fn create_transfer(
        &self,
        destination: &str,
        amount: i64,
        transaction_id: Uuid,
    ) -> EscrowResult<String> {
        if self
            .transfer_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EscrowError::gateway("simulated transfer failure"));
        }

        // Idempotency: one transfer per transaction
        let mut transfers = self.transfers_by_transaction.write().await;
        if let Some(existing) = transfers.get(&transaction_id) {
            return Ok(existing.clone());
        }

        let transfer_ref = format!("tr_{}", Uuid::new_v4().simple());
        transfers.insert(transaction_id, transfer_ref.clone());

        info!(
            "Transferred {} to {} for transaction {}",
            amount, destination, transaction_id
        );

        Ok(transfer_ref)
    }
}
