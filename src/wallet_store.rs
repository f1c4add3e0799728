//! Wallet Store - Internal ledger-backed balances for travelers
//!
//! Every balance mutation appends a ledger entry, so a wallet's balance is
//! always reconstructible by summing its entries (credits positive, debits
//! negative). Balances never go negative.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::EscrowError;
use crate::models::{LedgerEntryType, Wallet, WalletLedgerEntry};
use crate::EscrowResult;

/// In-memory wallet and ledger storage (in production, this would be a
/// database)
pub struct WalletStore {
    wallets: Arc<RwLock<HashMap<Uuid, Wallet>>>,
    ledger: Arc<RwLock<Vec<WalletLedgerEntry>>>,
    #[cfg(test)]
    credit_failures: std::sync::atomic::AtomicU32,
}

impl WalletStore {
    /// Create an empty wallet store
    pub fn new() -> Self {
        Self {
            wallets: Arc::new(RwLock::new(HashMap::new())),
            ledger: Arc::new(RwLock::new(Vec::new())),
            #[cfg(test)]
            credit_failures: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Make the next `count` credits fail like a storage outage would
    #[cfg(test)]
    pub fn inject_credit_failures(&self, count: u32) {
        self.credit_failures
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    /// Get a user's wallet, creating an empty one on first touch
    pub async fn get_wallet(&self, user_id: Uuid) -> Wallet {
        let mut wallets = self.wallets.write().await;
        wallets
            .entry(user_id)
            .or_insert_with(|| Wallet::new(user_id))
            .clone()
    }

    /// Credit a wallet, appending a ledger entry
    pub async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        transaction_id: Option<Uuid>,
        description: &str,
    ) -> EscrowResult<Wallet> {
        if amount <= 0 {
            return Err(EscrowError::validation("Credit amount must be positive"));
        }

        #[cfg(test)]
        if self
            .credit_failures
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok()
        {
            return Err(EscrowError::internal("simulated wallet storage failure"));
        }

        let mut wallets = self.wallets.write().await;
        let wallet = wallets
            .entry(user_id)
            .or_insert_with(|| Wallet::new(user_id));

        wallet.balance += amount;
        wallet.updated_at = Utc::now();

        self.ledger.write().await.push(WalletLedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            entry_type: LedgerEntryType::Credit,
            amount,
            transaction_id,
            description: description.to_string(),
            created_at: Utc::now(),
        });

        info!(
            "Credited {} to wallet {} (balance {})",
            amount, user_id, wallet.balance
        );

        Ok(wallet.clone())
    }

    /// Debit a wallet, appending a ledger entry
    ///
    /// Rejected with `InsufficientBalance` rather than letting the balance
    /// go negative.
    pub async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        transaction_id: Option<Uuid>,
        description: &str,
    ) -> EscrowResult<Wallet> {
        if amount <= 0 {
            return Err(EscrowError::validation("Debit amount must be positive"));
        }

        let mut wallets = self.wallets.write().await;
        let wallet = wallets
            .entry(user_id)
            .or_insert_with(|| Wallet::new(user_id));

        if wallet.balance < amount {
            return Err(EscrowError::InsufficientBalance {
                balance: wallet.balance,
                requested: amount,
            });
        }

        wallet.balance -= amount;
        wallet.updated_at = Utc::now();

        self.ledger.write().await.push(WalletLedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            entry_type: LedgerEntryType::Debit,
            amount,
            transaction_id,
            description: description.to_string(),
            created_at: Utc::now(),
        });

        info!(
            "Debited {} from wallet {} (balance {})",
            amount, user_id, wallet.balance
        );

        Ok(wallet.clone())
    }

    /// All ledger entries for a user, in append order
    pub async fn entries_for_user(&self, user_id: Uuid) -> Vec<WalletLedgerEntry> {
        self.ledger
            .read()
            .await
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Recompute a balance from the ledger alone
    pub async fn reconstructed_balance(&self, user_id: Uuid) -> i64 {
        self.ledger
            .read()
            .await
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| match entry.entry_type {
                LedgerEntryType::Credit => entry.amount,
                LedgerEntryType::Debit => -entry.amount,
            })
            .sum()
    }
}

impl Default for WalletStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_balance_matches_ledger() {
        let store = WalletStore::new();
        let user = Uuid::new_v4();

        store.credit(user, 9_000, None, "payout").await.unwrap();
        store.credit(user, 4_500, None, "payout").await.unwrap();
        store.debit(user, 3_000, None, "withdrawal").await.unwrap();

        let wallet = store.get_wallet(user).await;
        assert_eq!(wallet.balance, 10_500);
        assert_eq!(store.reconstructed_balance(user).await, wallet.balance);
        assert_eq!(store.entries_for_user(user).await.len(), 3);
    }

    #[tokio::test]
    async fn test_debit_never_goes_negative() {
        let store = WalletStore::new();
        let user = Uuid::new_v4();

        store.credit(user, 1_000, None, "payout").await.unwrap();
        let err = store.debit(user, 2_000, None, "withdrawal").await.unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientBalance { .. }));

        // Failed debit leaves no ledger entry behind
        assert_eq!(store.entries_for_user(user).await.len(), 1);
        assert_eq!(store.get_wallet(user).await.balance, 1_000);
    }

    #[tokio::test]
    async fn test_zero_amounts_rejected() {
        let store = WalletStore::new();
        let user = Uuid::new_v4();

        assert!(store.credit(user, 0, None, "bad").await.is_err());
        assert!(store.debit(user, -5, None, "bad").await.is_err());
    }
}
