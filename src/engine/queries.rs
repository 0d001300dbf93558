use ulid::Ulid;

use crate::model::*;

use super::availability::{overlapping_count, report};
use super::{Engine, EngineError};

impl Engine {
    pub fn list_facilities(&self) -> Vec<FacilityInfo> {
        self.state
            .iter()
            .map(|entry| {
                let fs = entry.value().clone();
                let guard = fs.try_read().expect("list_facilities: uncontended read");
                FacilityInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    capacity: guard.capacity,
                    hourly_rate: guard.hourly_rate,
                    currency: guard.currency.clone(),
                }
            })
            .collect()
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let facility_id = self.facility_for_booking(&id)?;
        let fs = self.get_facility(&facility_id)?;
        let guard = fs.read().await;
        guard.booking(id).cloned()
    }

    pub async fn find_by_number(&self, number: &str) -> Result<Booking, EngineError> {
        let id = self
            .numbers
            .get(number)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::UnknownNumber(number.to_string()))?;
        self.get_booking(id).await.ok_or(EngineError::NotFound(id))
    }

    /// All bookings at a facility. Missing facility yields an empty list.
    pub async fn bookings_for_facility(&self, facility_id: Ulid) -> Vec<Booking> {
        let Some(fs) = self.get_facility(&facility_id) else {
            return Vec::new();
        };
        let guard = fs.read().await;
        guard.bookings.clone()
    }

    /// Confirmed/active bookings for a user starting at or after `now`,
    /// soonest first.
    pub fn upcoming_for_user(&self, user: Ulid, now: Ms, limit: usize) -> Vec<Booking> {
        let mut upcoming: Vec<Booking> = self.scan_bookings(|b| {
            b.user == user && b.status.counts_against_capacity() && b.range.start >= now
        });
        upcoming.sort_by_key(|b| b.range.start);
        upcoming.truncate(limit);
        upcoming
    }

    /// The booking a user is currently parked on, if any.
    pub fn current_for_user(&self, user: Ulid, now: Ms) -> Option<Booking> {
        self.scan_bookings(|b| {
            b.user == user
                && b.status == BookingStatus::Active
                && b.range.start <= now
                && b.range.end >= now
        })
        .into_iter()
        .next()
    }

    /// Confirmed/active bookings for a vehicle that have not yet ended,
    /// soonest first.
    pub fn active_for_vehicle(&self, vehicle: Ulid, now: Ms) -> Vec<Booking> {
        let mut active: Vec<Booking> = self.scan_bookings(|b| {
            b.vehicle == vehicle && b.status.counts_against_capacity() && b.range.end >= now
        });
        active.sort_by_key(|b| b.range.start);
        active
    }

    /// Confirmed/active bookings occupying the facility right now.
    pub async fn occupancy(&self, facility_id: Ulid, now: Ms) -> Result<u32, EngineError> {
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.read().await;
        Ok(overlapping_count(
            &guard,
            &TimeRange::new(now, now + 1),
            None,
            None,
        ))
    }

    /// The Availability Checker contract: remaining capacity for a window,
    /// optionally scoped to one space, optionally ignoring one booking.
    pub async fn check_availability(
        &self,
        facility_id: Ulid,
        range: TimeRange,
        space_id: Option<&str>,
        exclude: Option<Ulid>,
    ) -> Result<AvailabilityReport, EngineError> {
        if range.end <= range.start {
            return Err(EngineError::Validation("end time must be after start time"));
        }
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.read().await;
        let overlapping = overlapping_count(&guard, &range, space_id, exclude);
        Ok(report(guard.capacity, overlapping))
    }

    fn scan_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut hits = Vec::new();
        for entry in self.state.iter() {
            let fs = entry.value().clone();
            if let Ok(guard) = fs.try_read() {
                hits.extend(guard.bookings.iter().filter(|b| keep(b)).cloned());
            }
        }
        hits
    }
}
