//! Payout Router - Routes released funds to a transfer or the internal wallet
//!
//! Not every jurisdiction supports direct-to-bank transfer through the
//! payment processor, so travelers without an active connected account in a
//! supported region are paid into the internal wallet instead. A failed
//! external transfer never drops funds: the equivalent amount is credited to
//! the wallet and the outcome is flagged so the transaction can be annotated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gateway::PaymentGateway;
use crate::models::ConnectedAccount;
use crate::wallet_store::WalletStore;
use crate::EscrowResult;

/// Configuration for the payout router
#[derive(Debug, Clone)]
pub struct PayoutRouterConfig {
    /// ISO country codes eligible for direct external transfer
    pub supported_transfer_countries: HashSet<String>,
}

impl Default for PayoutRouterConfig {
    fn default() -> Self {
        let supported = ["US", "GB", "DE", "FR", "ES", "IT", "NL", "CA", "AU"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        Self {
            supported_transfer_countries: supported,
        }
    }
}

/// Which path a payout took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutRoute {
    /// Processor transfer to the traveler's connected account
    ExternalTransfer,
    /// Credit to the internal wallet
    WalletCredit,
}

/// Result of a completed payout
#[derive(Debug, Clone)]
pub struct PayoutOutcome {
    pub route: PayoutRoute,
    /// Processor transfer reference when the external path was taken
    pub transfer_ref: Option<String>,
    /// True when an external transfer failed and the wallet took the funds
    pub fallback: bool,
}

/// Main payout router
pub struct PayoutRouter {
    config: PayoutRouterConfig,
    gateway: Arc<PaymentGateway>,
    wallets: Arc<WalletStore>,
    /// Connected-account registry (in production, this would be a database)
    accounts: Arc<RwLock<HashMap<Uuid, ConnectedAccount>>>,
}

impl PayoutRouter {
    /// Create a new payout router
    pub fn new(
        config: PayoutRouterConfig,
        gateway: Arc<PaymentGateway>,
        wallets: Arc<WalletStore>,
    ) -> Self {
        Self {
            config,
            gateway,
            wallets,
            accounts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register or replace a traveler's connected account
    pub async fn register_connected_account(
        &self,
        user_id: Uuid,
        account_ref: String,
        country: String,
    ) -> ConnectedAccount {
        let account = ConnectedAccount {
            user_id,
            account_ref,
            country,
            active: true,
            updated_at: Utc::now(),
        };
        self.accounts.write().await.insert(user_id, account.clone());
        info!("Registered connected account for user {}", user_id);
        account
    }

    /// Deactivate a traveler's connected account
    pub async fn deactivate_connected_account(&self, user_id: Uuid) {
        if let Some(account) = self.accounts.write().await.get_mut(&user_id) {
            account.active = false;
            account.updated_at = Utc::now();
        }
    }

    /// Get a traveler's connected account, if any
    pub async fn connected_account(&self, user_id: Uuid) -> Option<ConnectedAccount> {
        self.accounts.read().await.get(&user_id).cloned()
    }

    /// True when the traveler is eligible for the external transfer path
    async fn transfer_eligible(&self, user_id: Uuid) -> Option<ConnectedAccount> {
        let accounts = self.accounts.read().await;
        accounts
            .get(&user_id)
            .filter(|account| {
                account.active
                    && self
                        .config
                        .supported_transfer_countries
                        .contains(&account.country)
            })
            .cloned()
    }

    /// Release captured funds to a traveler
    ///
    /// External transfer when eligible, wallet credit otherwise. On transfer
    /// failure the wallet is credited instead; the caller annotates the
    /// transaction from the returned outcome.
    pub async fn release_funds(
        &self,
        traveler_id: Uuid,
        amount: i64,
        transaction_id: Uuid,
    ) -> EscrowResult<PayoutOutcome> {
        if let Some(account) = self.transfer_eligible(traveler_id).await {
            match self
                .gateway
                .create_transfer(&account.account_ref, amount, transaction_id)
                .await
            {
                Ok(transfer_ref) => {
                    info!(
                        "Paid out {} to connected account of user {} ({})",
                        amount, traveler_id, transfer_ref
                    );
                    return Ok(PayoutOutcome {
                        route: PayoutRoute::ExternalTransfer,
                        transfer_ref: Some(transfer_ref),
                        fallback: false,
                    });
                }
                Err(err) => {
                    warn!(
                        "Transfer failed for transaction {}, falling back to wallet: {}",
                        transaction_id, err
                    );
                    self.wallets
                        .credit(
                            traveler_id,
                            amount,
                            Some(transaction_id),
                            "delivery payout (transfer fallback)",
                        )
                        .await?;
                    return Ok(PayoutOutcome {
                        route: PayoutRoute::WalletCredit,
                        transfer_ref: None,
                        fallback: true,
                    });
                }
            }
        }

        self.wallets
            .credit(
                traveler_id,
                amount,
                Some(transaction_id),
                "delivery payout",
            )
            .await?;

        Ok(PayoutOutcome {
            route: PayoutRoute::WalletCredit,
            transfer_ref: None,
            fallback: false,
        })
    }
}
