//! Derived statistics for facilities and vehicles, maintained by a
//! background dispatcher consuming the notify firehose. Everything here is
//! secondary: a failed or lagged update is logged and dropped, and the
//! booking write that triggered it stands regardless.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::{now_ms, BookingEvent, Ms};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FacilityStats {
    pub capacity: u32,
    /// Confirmed/active bookings overlapping "now", recomputed after every
    /// status-changing event.
    pub occupied: u32,
    pub completed_total: u64,
    pub revenue_total: f64,
    pub minutes_total: i64,
    pub rating_sum: u64,
    pub rating_count: u64,
}

impl FacilityStats {
    pub fn rating_avg(&self) -> Option<f64> {
        if self.rating_count == 0 {
            return None;
        }
        Some(self.rating_sum as f64 / self.rating_count as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VehicleUsage {
    pub completed_bookings: u64,
    pub minutes_total: i64,
    pub last_used: Ms,
}

#[derive(Default)]
pub struct StatsRegistry {
    facilities: DashMap<Ulid, FacilityStats>,
    vehicles: DashMap<Ulid, VehicleUsage>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn facility(&self, id: &Ulid) -> Option<FacilityStats> {
        self.facilities.get(id).map(|e| *e.value())
    }

    pub fn vehicle(&self, id: &Ulid) -> Option<VehicleUsage> {
        self.vehicles.get(id).map(|e| *e.value())
    }
}

/// Consume the firehose and keep derived statistics current.
pub async fn run_dispatcher(
    engine: Arc<Engine>,
    registry: Arc<StatsRegistry>,
    mut rx: broadcast::Receiver<BookingEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => apply(&engine, &registry, &event).await,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("stats dispatcher lagged, {skipped} events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

pub async fn apply(engine: &Engine, registry: &StatsRegistry, event: &BookingEvent) {
    match event {
        BookingEvent::FacilityRegistered { id, capacity, .. } => {
            registry.facilities.entry(*id).or_default().capacity = *capacity;
        }
        BookingEvent::FacilityUpdated { id, capacity, .. } => {
            registry.facilities.entry(*id).or_default().capacity = *capacity;
        }
        BookingEvent::FacilityRemoved { id } => {
            registry.facilities.remove(id);
        }
        BookingEvent::BookingCreated { facility_id, .. }
        | BookingEvent::BookingConfirmed { facility_id, .. }
        | BookingEvent::BookingCheckedIn { facility_id, .. }
        | BookingEvent::BookingCancelled { facility_id, .. }
        | BookingEvent::BookingMarkedNoShow { facility_id, .. } => {
            refresh_occupancy(engine, registry, *facility_id).await;
        }
        BookingEvent::BookingCheckedOut {
            id, facility_id, ..
        } => {
            refresh_occupancy(engine, registry, *facility_id).await;
            record_completion(engine, registry, *id, *facility_id).await;
        }
        BookingEvent::RatingAdded {
            facility_id,
            rating,
            ..
        } => {
            let mut stats = registry.facilities.entry(*facility_id).or_default();
            stats.rating_sum += u64::from(rating.score);
            stats.rating_count += 1;
        }
        // Extensions change end times, not occupancy at this instant;
        // access/notes/notifications carry no statistics.
        _ => {}
    }
}

async fn refresh_occupancy(engine: &Engine, registry: &StatsRegistry, facility_id: Ulid) {
    match engine.occupancy(facility_id, now_ms()).await {
        Ok(occupied) => {
            registry.facilities.entry(facility_id).or_default().occupied = occupied;
        }
        Err(e) => {
            tracing::warn!("occupancy refresh for {facility_id} failed: {e}");
        }
    }
}

async fn record_completion(
    engine: &Engine,
    registry: &StatsRegistry,
    booking_id: Ulid,
    facility_id: Ulid,
) {
    let Some(booking) = engine.get_booking(booking_id).await else {
        tracing::warn!("completed booking {booking_id} vanished before stats update");
        return;
    };
    {
        let mut stats = registry.facilities.entry(facility_id).or_default();
        stats.completed_total += 1;
        stats.revenue_total += booking.payment.amount;
        stats.minutes_total += booking.duration_minutes;
    }
    let mut usage = registry.vehicles.entry(booking.vehicle).or_default();
    usage.completed_bookings += 1;
    usage.minutes_total += booking.duration_minutes;
    usage.last_used = booking.check_out.as_ref().map_or_else(now_ms, |c| c.time);
}
