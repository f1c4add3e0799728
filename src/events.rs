//! Domain events and the notification publisher seam
//!
//! The state machine emits one event per externally meaningful transition.
//! Delivery is fire-and-forget: a sink failure is logged and never rolls back
//! the transition that produced the event. The sink is an injected trait
//! object so the core stays testable without a live transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::Transaction;
use crate::EscrowResult;

/// Kinds of events emitted to the external notification sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEventKind {
    ReservationCreated,
    PaymentConfirmed,
    PickupReady,
    DeliveryConfirmed,
    PaymentReceived,
    TransactionCancelled,
}

/// One event emitted by the state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: DomainEventKind,
    pub transaction_id: Uuid,
    pub recipient_user_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Destination for domain events (notification service, message bus, ...)
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> EscrowResult<()>;
}

/// Default sink that writes events to the log
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: DomainEvent) -> EscrowResult<()> {
        info!(
            "Domain event {:?} for transaction {} -> user {}",
            event.kind, event.transaction_id, event.recipient_user_id
        );
        Ok(())
    }
}

/// Publisher the state machine holds; builds payloads and swallows sink errors
pub struct EventPublisher {
    sink: std::sync::Arc<dyn EventSink>,
}

impl EventPublisher {
    /// Create a publisher over the given sink
    pub fn new(sink: std::sync::Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    async fn emit(&self, kind: DomainEventKind, txn: &Transaction, recipient: Uuid, payload: serde_json::Value) {
        let event = DomainEvent {
            kind,
            transaction_id: txn.id,
            recipient_user_id: recipient,
            payload,
            created_at: Utc::now(),
        };

        // Fire-and-forget: notification failure must never fail a transition
        if let Err(err) = self.sink.publish(event).await {
            warn!(
                "Failed to publish {:?} for transaction {}: {}",
                kind, txn.id, err
            );
        }
    }

    /// Booking created; tells the traveler a reservation landed on their trip
    pub async fn reservation_created(&self, txn: &Transaction) {
        self.emit(
            DomainEventKind::ReservationCreated,
            txn,
            txn.traveler_id,
            serde_json::json!({
                "trip_id": txn.trip_id,
                "package_weight": txn.package_weight,
                "amount": txn.amount,
            }),
        )
        .await;
    }

    /// Payment escrowed; confirms to the traveler that funds are held
    pub async fn payment_confirmed(&self, txn: &Transaction) {
        self.emit(
            DomainEventKind::PaymentConfirmed,
            txn,
            txn.traveler_id,
            serde_json::json!({ "amount": txn.amount }),
        )
        .await;
    }

    /// Pickup code delivered to the sender once funds are in escrow
    pub async fn pickup_ready(&self, txn: &Transaction) {
        self.emit(
            DomainEventKind::PickupReady,
            txn,
            txn.sender_id,
            serde_json::json!({ "pickup_code": txn.pickup_code }),
        )
        .await;
    }

    /// Delivery confirmed; tells the sender the package arrived
    pub async fn delivery_confirmed(&self, txn: &Transaction) {
        self.emit(
            DomainEventKind::DeliveryConfirmed,
            txn,
            txn.sender_id,
            serde_json::json!({ "delivered_at": txn.delivered_at }),
        )
        .await;
    }

    /// Funds released; tells the traveler where their money went
    pub async fn payment_received(&self, txn: &Transaction, route: &str) {
        self.emit(
            DomainEventKind::PaymentReceived,
            txn,
            txn.traveler_id,
            serde_json::json!({
                "amount": txn.traveler_amount,
                "route": route,
            }),
        )
        .await;
    }

    /// Booking cancelled pre-escrow; notifies the counterparty
    pub async fn transaction_cancelled(&self, txn: &Transaction, cancelled_by: Uuid) {
        let recipient = if cancelled_by == txn.sender_id {
            txn.traveler_id
        } else {
            txn.sender_id
        };
        self.emit(
            DomainEventKind::TransactionCancelled,
            txn,
            recipient,
            serde_json::json!({ "cancelled_by": cancelled_by }),
        )
        .await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Sink that records every published event, for assertions
    pub struct RecordingSink {
        pub events: Arc<Mutex<Vec<DomainEvent>>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub async fn kinds(&self) -> Vec<DomainEventKind> {
            self.events.lock().await.iter().map(|e| e.kind).collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, event: DomainEvent) -> EscrowResult<()> {
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    /// Sink that always fails, proving transitions survive sink failures
    pub struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn publish(&self, _event: DomainEvent) -> EscrowResult<()> {
            Err(crate::error::EscrowError::internal("sink down"))
        }
    }
}
