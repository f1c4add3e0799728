//! Capacity Ledger - Tracks reserved vs. available carrying weight per trip
//!
//! Reservation is pessimistic and long-lived: weight is committed the instant
//! a booking is created, not when payment clears, so two senders cannot race
//! for the same last kilogram during the payment-entry window. Release happens
//! only on explicit cancellation; normal completion never frees capacity.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::EscrowError;
use crate::models::{Trip, TripStatus};
use crate::EscrowResult;

/// Capacity ledger over the trip store
///
/// Every mutation is a single read-modify-write under one write lock, which
/// serializes concurrent reservation attempts on the same trip.
pub struct CapacityLedger {
    /// In-memory trip storage (in production, this would be a database)
    trips: Arc<RwLock<HashMap<Uuid, Trip>>>,
}

impl CapacityLedger {
    /// Create an empty capacity ledger
    pub fn new() -> Self {
        Self {
            trips: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a new draft trip for a traveler
    pub async fn create_trip(&self, traveler_id: Uuid, capacity_kg: f64) -> EscrowResult<Trip> {
        if capacity_kg <= 0.0 {
            return Err(EscrowError::validation("Trip capacity must be positive"));
        }

        let trip = Trip::new(traveler_id, capacity_kg);
        self.trips.write().await.insert(trip.id, trip.clone());

        info!("Created trip {} with {} kg capacity", trip.id, capacity_kg);

        Ok(trip)
    }

    /// Publish a draft trip, opening it for bookings
    pub async fn publish_trip(&self, trip_id: Uuid) -> EscrowResult<Trip> {
        let mut trips = self.trips.write().await;
        let trip = trips
            .get_mut(&trip_id)
            .ok_or(EscrowError::TripNotFound(trip_id))?;

        if trip.status != TripStatus::Draft {
            return Err(EscrowError::validation(format!(
                "Only draft trips can be published, trip is {:?}",
                trip.status
            )));
        }

        trip.status = TripStatus::Published;
        trip.updated_at = chrono::Utc::now();

        Ok(trip.clone())
    }

    /// Get a trip by ID
    pub async fn get_trip(&self, trip_id: Uuid) -> EscrowResult<Trip> {
        self.trips
            .read()
            .await
            .get(&trip_id)
            .cloned()
            .ok_or(EscrowError::TripNotFound(trip_id))
    }

    /// Check whether a trip has at least `weight` kg unreserved
    pub async fn check_availability(&self, trip_id: Uuid, weight: f64) -> EscrowResult<bool> {
        let trip = self.get_trip(trip_id).await?;
        Ok(trip.available_weight() >= weight)
    }

    /// Atomically reserve `weight` kg on a trip
    ///
    /// Check-then-reserve executes under the write lock; a losing concurrent
    /// booking observes the already-incremented reservation and fails with
    /// `CapacityExceeded`. Flips the trip to Full when capacity runs out.
    pub async fn reserve(&self, trip_id: Uuid, weight: f64) -> EscrowResult<Trip> {
        if weight <= 0.0 {
            return Err(EscrowError::validation("Package weight must be positive"));
        }

        let mut trips = self.trips.write().await;
        let trip = trips
            .get_mut(&trip_id)
            .ok_or(EscrowError::TripNotFound(trip_id))?;

        if !trip.status.accepts_reservations() {
            return Err(EscrowError::validation(format!(
                "Trip {} is not open for bookings ({:?})",
                trip_id, trip.status
            )));
        }

        let available = trip.available_weight();
        if available < weight {
            return Err(EscrowError::CapacityExceeded {
                requested: weight,
                available,
            });
        }

        trip.reserved_weight += weight;
        if trip.available_weight() <= 0.0 {
            trip.status = TripStatus::Full;
        }
        trip.updated_at = chrono::Utc::now();

        info!(
            "Reserved {} kg on trip {} ({} kg remaining)",
            weight,
            trip_id,
            trip.available_weight()
        );

        Ok(trip.clone())
    }

    /// Atomically release `weight` kg back to a trip
    ///
    /// Floored at zero; reopens a Full trip when capacity becomes available.
    pub async fn release(&self, trip_id: Uuid, weight: f64) -> EscrowResult<Trip> {
        let mut trips = self.trips.write().await;
        let trip = trips
            .get_mut(&trip_id)
            .ok_or(EscrowError::TripNotFound(trip_id))?;

        trip.reserved_weight = (trip.reserved_weight - weight).max(0.0);
        if trip.status == TripStatus::Full && trip.available_weight() > 0.0 {
            trip.status = TripStatus::Published;
        }
        trip.updated_at = chrono::Utc::now();

        info!(
            "Released {} kg on trip {} ({} kg remaining)",
            weight,
            trip_id,
            trip.available_weight()
        );

        Ok(trip.clone())
    }
}

impl Default for CapacityLedger {
    fn default() -> Self {
        Self::new()
    }
}
