use ulid::Ulid;

use crate::model::{AvailabilityReport, FacilityState, TimeRange};

// ── Availability Checker ─────────────────────────────────────────

/// Count bookings conflicting with the candidate window.
///
/// Only confirmed/active bookings occupy capacity; terminal and pending
/// bookings never block. `space_id` narrows the scan to one space,
/// `exclude` skips a booking being re-checked (extension re-validation).
pub fn overlapping_count(
    facility: &FacilityState,
    candidate: &TimeRange,
    space_id: Option<&str>,
    exclude: Option<Ulid>,
) -> u32 {
    facility
        .overlapping(candidate)
        .filter(|b| b.status.counts_against_capacity())
        .filter(|b| exclude != Some(b.id))
        .filter(|b| match space_id {
            Some(space) => b.space_id() == Some(space),
            None => true,
        })
        .count() as u32
}

/// Remaining capacity after the conflicting bookings are subtracted.
pub fn report(capacity: u32, overlapping: u32) -> AvailabilityReport {
    AvailabilityReport {
        is_available: overlapping < capacity,
        available_spaces: capacity.saturating_sub(overlapping),
        total_spaces: capacity,
    }
}

/// A specific space admits at most one occupant at a time.
pub fn space_is_free(
    facility: &FacilityState,
    candidate: &TimeRange,
    space_id: &str,
    exclude: Option<Ulid>,
) -> bool {
    overlapping_count(facility, candidate, Some(space_id), exclude) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus, space: Option<&str>) -> Booking {
        let range = TimeRange::new(start, end);
        Booking {
            id: Ulid::new(),
            number: format!("BK{start}"),
            user: Ulid::new(),
            vehicle: Ulid::new(),
            facility: Ulid::new(),
            space: space.map(SpaceRef::new),
            range,
            duration_minutes: range.duration_minutes(),
            status,
            payment: Payment::new(8.0, "USD"),
            pricing: Pricing {
                rate_type: RateType::Hourly,
                rate: 4.0,
                total: 8.0,
                currency: "USD".into(),
            },
            check_in: None,
            check_out: None,
            extensions: Vec::new(),
            cancellation: None,
            recurrence: None,
            rating: None,
            notifications: Vec::new(),
            notes: Vec::new(),
            qr_code: None,
            access_code: None,
            source: BookingSource::App,
            special_requests: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn facility(capacity: u32, bookings: Vec<Booking>) -> FacilityState {
        let mut fs = FacilityState::new(Ulid::new(), "Lot".into(), capacity, 4.0, "USD".into());
        for b in bookings {
            fs.insert_booking(b);
        }
        fs
    }

    #[test]
    fn counts_only_confirmed_and_active() {
        let fs = facility(
            10,
            vec![
                booking(0, 100, BookingStatus::Confirmed, None),
                booking(0, 100, BookingStatus::Active, None),
                booking(0, 100, BookingStatus::Pending, None),
                booking(0, 100, BookingStatus::Cancelled, None),
                booking(0, 100, BookingStatus::Completed, None),
            ],
        );
        assert_eq!(overlapping_count(&fs, &TimeRange::new(50, 150), None, None), 2);
    }

    #[test]
    fn adjacent_ranges_do_not_conflict() {
        let fs = facility(1, vec![booking(0, 100, BookingStatus::Confirmed, None)]);
        assert_eq!(overlapping_count(&fs, &TimeRange::new(100, 200), None, None), 0);
    }

    #[test]
    fn exclusion_skips_the_named_booking() {
        let b = booking(0, 100, BookingStatus::Active, None);
        let id = b.id;
        let fs = facility(1, vec![b]);
        assert_eq!(overlapping_count(&fs, &TimeRange::new(50, 150), None, Some(id)), 0);
        assert_eq!(
            overlapping_count(&fs, &TimeRange::new(50, 150), None, Some(Ulid::new())),
            1
        );
    }

    #[test]
    fn space_filter_only_sees_that_space() {
        let fs = facility(
            10,
            vec![
                booking(0, 100, BookingStatus::Confirmed, Some("A-12")),
                booking(0, 100, BookingStatus::Confirmed, Some("A-13")),
                booking(0, 100, BookingStatus::Confirmed, None),
            ],
        );
        let window = TimeRange::new(0, 100);
        assert_eq!(overlapping_count(&fs, &window, Some("A-12"), None), 1);
        assert!(!space_is_free(&fs, &window, "A-12", None));
        assert!(space_is_free(&fs, &window, "B-01", None));
    }

    #[test]
    fn report_three_of_ten_occupied() {
        let r = report(10, 3);
        assert!(r.is_available);
        assert_eq!(r.available_spaces, 7);
        assert_eq!(r.total_spaces, 10);
    }

    #[test]
    fn report_saturated_facility() {
        let r = report(2, 2);
        assert!(!r.is_available);
        assert_eq!(r.available_spaces, 0);
    }

    #[test]
    fn report_never_goes_negative() {
        let r = report(2, 5);
        assert_eq!(r.available_spaces, 0);
        assert!(!r.is_available);
    }
}
