use super::*;
use crate::limits::*;

// ── Test infrastructure ──────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("spotsense_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(path: PathBuf) -> Engine {
    let notify = Arc::new(NotifyHub::new());
    Engine::new(path, notify, "https://spotsense.test".into()).unwrap()
}

async fn engine_with_facility(name: &str, capacity: u32, hourly_rate: f64) -> (Engine, Ulid) {
    let engine = new_engine(test_wal_path(name));
    let fid = Ulid::new();
    engine
        .register_facility(fid, "Central Garage".into(), capacity, hourly_rate)
        .await
        .unwrap();
    (engine, fid)
}

fn confirmed(facility: Ulid, range: TimeRange, amount: f64) -> NewBooking {
    NewBooking {
        status: BookingStatus::Confirmed,
        ..NewBooking::new(facility, Ulid::new(), Ulid::new(), range, amount)
    }
}

/// Drive a fresh booking through confirm + check-in + check-out.
async fn completed_booking(engine: &Engine, facility: Ulid) -> Booking {
    let now = now_ms();
    let booking = engine
        .create_booking(NewBooking::new(
            facility,
            Ulid::new(),
            Ulid::new(),
            TimeRange::new(now - HOUR_MS, now + HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();
    engine
        .confirm_booking(booking.id, PaymentMethod::CreditCard, Some("txn-1".into()))
        .await
        .unwrap();
    engine
        .check_in(booking.id, CheckMethod::QrCode, None, None)
        .await
        .unwrap();
    engine
        .check_out(booking.id, CheckMethod::QrCode, None, None, 0.0)
        .await
        .unwrap()
}

// ── Facilities ───────────────────────────────────────────

#[tokio::test]
async fn register_and_list_facilities() {
    let engine = new_engine(test_wal_path("register_list.wal"));
    let fid = Ulid::new();
    engine
        .register_facility(fid, "Harbor Deck".into(), 40, 3.5)
        .await
        .unwrap();

    let facilities = engine.list_facilities();
    assert_eq!(facilities.len(), 1);
    assert_eq!(facilities[0].id, fid);
    assert_eq!(facilities[0].capacity, 40);
    assert_eq!(facilities[0].hourly_rate, 3.5);
}

#[tokio::test]
async fn duplicate_facility_rejected() {
    let (engine, fid) = engine_with_facility("dup_facility.wal", 5, 2.0).await;
    let result = engine
        .register_facility(fid, "Again".into(), 5, 2.0)
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn facility_validation() {
    let engine = new_engine(test_wal_path("facility_validation.wal"));
    assert!(matches!(
        engine.register_facility(Ulid::new(), "".into(), 5, 2.0).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.register_facility(Ulid::new(), "Lot".into(), 0, 2.0).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine
            .register_facility(Ulid::new(), "Lot".into(), 5, -1.0)
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn update_facility_partial() {
    let (engine, fid) = engine_with_facility("update_facility.wal", 5, 2.0).await;
    engine
        .update_facility(fid, None, Some(9), None)
        .await
        .unwrap();

    let facilities = engine.list_facilities();
    assert_eq!(facilities[0].capacity, 9);
    assert_eq!(facilities[0].name, "Central Garage");
    assert_eq!(facilities[0].hourly_rate, 2.0);
}

#[tokio::test]
async fn remove_facility_with_live_bookings_fails() {
    let (engine, fid) = engine_with_facility("remove_live.wal", 5, 2.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + 25 * HOUR_MS, now + 27 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    assert!(matches!(
        engine.remove_facility(fid).await,
        Err(EngineError::Validation(_))
    ));

    engine
        .cancel_booking(booking.id, booking.user, "plans changed")
        .await
        .unwrap();
    engine.remove_facility(fid).await.unwrap();
    assert!(engine.list_facilities().is_empty());
    assert!(engine.get_booking(booking.id).await.is_none());
}

// ── Booking creation ─────────────────────────────────────

#[tokio::test]
async fn create_booking_fills_defaults() {
    let (engine, fid) = engine_with_facility("create_defaults.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(NewBooking::new(
            fid,
            Ulid::new(),
            Ulid::new(),
            TimeRange::new(now + HOUR_MS, now + 3 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.duration_minutes, 120);
    assert_eq!(booking.payment.status, PaymentStatus::Pending);
    assert_eq!(booking.payment.amount, 8.0);
    assert_eq!(booking.pricing.rate, 4.0);
    assert!(booking.number.starts_with("BK"));
    assert!(booking.extensions.is_empty());
    assert!(booking.check_in.is_none());
}

#[tokio::test]
async fn create_booking_unknown_facility() {
    let engine = new_engine(test_wal_path("create_unknown_facility.wal"));
    let result = engine
        .create_booking(NewBooking::new(
            Ulid::new(),
            Ulid::new(),
            Ulid::new(),
            TimeRange::new(HOUR_MS, 2 * HOUR_MS),
            8.0,
        ))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn create_booking_invalid_range() {
    let (engine, fid) = engine_with_facility("create_bad_range.wal", 5, 4.0).await;
    let result = engine
        .create_booking(NewBooking::new(
            fid,
            Ulid::new(),
            Ulid::new(),
            TimeRange {
                start: 2 * HOUR_MS,
                end: HOUR_MS,
            },
            8.0,
        ))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn create_booking_span_limit() {
    let (engine, fid) = engine_with_facility("create_span_limit.wal", 5, 4.0).await;
    let result = engine
        .create_booking(NewBooking::new(
            fid,
            Ulid::new(),
            Ulid::new(),
            TimeRange::new(HOUR_MS, HOUR_MS + MAX_RANGE_DURATION_MS + 1),
            8.0,
        ))
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn create_booking_capacity_conflict() {
    let (engine, fid) = engine_with_facility("create_capacity.wal", 1, 4.0).await;
    let now = now_ms();
    let window = TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS);

    engine.create_booking(confirmed(fid, window, 4.0)).await.unwrap();
    let result = engine.create_booking(confirmed(fid, window, 4.0)).await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));

    // Adjacent window is fine
    engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + 2 * HOUR_MS, now + 3 * HOUR_MS),
            4.0,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn pending_bookings_do_not_block() {
    let (engine, fid) = engine_with_facility("pending_no_block.wal", 1, 4.0).await;
    let now = now_ms();
    let window = TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS);

    // Pending never counts against capacity
    engine
        .create_booking(NewBooking::new(fid, Ulid::new(), Ulid::new(), window, 4.0))
        .await
        .unwrap();
    engine.create_booking(confirmed(fid, window, 4.0)).await.unwrap();
}

#[tokio::test]
async fn create_booking_space_conflict() {
    let (engine, fid) = engine_with_facility("create_space.wal", 10, 4.0).await;
    let now = now_ms();
    let window = TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS);

    let mut req = confirmed(fid, window, 4.0);
    req.space = Some(SpaceRef::new("A-12"));
    engine.create_booking(req).await.unwrap();

    // Same space, overlapping window — rejected despite capacity headroom
    let mut req = confirmed(fid, window, 4.0);
    req.space = Some(SpaceRef::new("A-12"));
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::Conflict(_))
    ));

    // Different space is free
    let mut req = confirmed(fid, window, 4.0);
    req.space = Some(SpaceRef::new("A-13"));
    engine.create_booking(req).await.unwrap();
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_pending_to_completed() {
    let (engine, fid) = engine_with_facility("full_lifecycle.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(NewBooking::new(
            fid,
            Ulid::new(),
            Ulid::new(),
            TimeRange::new(now - HOUR_MS, now + HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    let booking = engine
        .confirm_booking(booking.id, PaymentMethod::ApplePay, Some("txn-77".into()))
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.payment.status, PaymentStatus::Paid);
    assert_eq!(booking.payment.method, Some(PaymentMethod::ApplePay));
    assert_eq!(booking.payment.transaction_id.as_deref(), Some("txn-77"));

    let booking = engine
        .check_in(booking.id, CheckMethod::QrCode, None, Some("gate 2".into()))
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Active);
    let check_in = booking.check_in.as_ref().unwrap();
    assert_eq!(check_in.method, CheckMethod::QrCode);
    assert_eq!(check_in.notes.as_deref(), Some("gate 2"));

    let booking = engine
        .check_out(booking.id, CheckMethod::QrCode, None, None, 2.5)
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Completed);
    assert_eq!(booking.check_out.as_ref().unwrap().overstay_minutes, 0);
    assert_eq!(booking.payment.amount, 10.5); // 8.0 + 2.5 extra charges
}

#[tokio::test]
async fn confirm_requires_pending() {
    let (engine, fid) = engine_with_facility("confirm_twice.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    let err = engine
        .confirm_booking(booking.id, PaymentMethod::Cash, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: BookingStatus::Confirmed,
            ..
        }
    ));
}

#[tokio::test]
async fn check_in_requires_confirmed() {
    let (engine, fid) = engine_with_facility("check_in_pending.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(NewBooking::new(
            fid,
            Ulid::new(),
            Ulid::new(),
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    assert!(matches!(
        engine
            .check_in(booking.id, CheckMethod::Manual, None, None)
            .await,
        Err(EngineError::InvalidState {
            status: BookingStatus::Pending,
            ..
        })
    ));
}

#[tokio::test]
async fn check_out_records_overstay() {
    let (engine, fid) = engine_with_facility("check_out_overstay.wal", 5, 4.0).await;
    let now = now_ms();
    // Window closed 44.5 minutes ago — the check-out below lands in the
    // 45th overstayed minute.
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(
                now - 2 * HOUR_MS,
                now - 44 * MINUTE_MS - 30_000,
            ),
            8.0,
        ))
        .await
        .unwrap();
    engine
        .check_in(booking.id, CheckMethod::Automatic, None, None)
        .await
        .unwrap();
    let booking = engine
        .check_out(booking.id, CheckMethod::Automatic, None, None, 0.0)
        .await
        .unwrap();
    assert_eq!(booking.check_out.as_ref().unwrap().overstay_minutes, 45);
}

// ── Cancellation refunds ─────────────────────────────────

#[tokio::test]
async fn cancel_full_refund_lands_in_refunded() {
    let (engine, fid) = engine_with_facility("cancel_full.wal", 5, 4.0).await;
    let now = now_ms();
    let user = Ulid::new();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + 25 * HOUR_MS, now + 27 * HOUR_MS),
            40.0,
        ))
        .await
        .unwrap();

    let booking = engine
        .cancel_booking(booking.id, user, "change of plans")
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Refunded);
    assert_eq!(booking.payment.status, PaymentStatus::Refunded);
    assert_eq!(booking.payment.refund_amount, Some(40.0));
    let record = booking.cancellation.as_ref().unwrap();
    assert!(record.refund_eligible);
    assert_eq!(record.refund_amount, 40.0);
    assert_eq!(record.cancelled_by, user);
    assert_eq!(record.reason, "change of plans");
}

#[tokio::test]
async fn cancel_half_refund_window() {
    let (engine, fid) = engine_with_facility("cancel_half.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + 7 * HOUR_MS, now + 9 * HOUR_MS),
            40.0,
        ))
        .await
        .unwrap();

    let booking = engine
        .cancel_booking(booking.id, Ulid::new(), "sick")
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Refunded);
    assert_eq!(booking.payment.refund_amount, Some(20.0));
}

#[tokio::test]
async fn cancel_last_minute_keeps_payment() {
    let (engine, fid) = engine_with_facility("cancel_late.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            40.0,
        ))
        .await
        .unwrap();

    let booking = engine
        .cancel_booking(booking.id, Ulid::new(), "running late")
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(booking.payment.status, PaymentStatus::Pending);
    assert_eq!(booking.payment.refund_amount, None);
    assert!(!booking.cancellation.as_ref().unwrap().refund_eligible);
}

#[tokio::test]
async fn cancel_completed_booking_leaves_record_untouched() {
    let (engine, fid) = engine_with_facility("cancel_completed.wal", 5, 4.0).await;
    let before = completed_booking(&engine, fid).await;

    let err = engine
        .cancel_booking(before.id, Ulid::new(), "too late")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: BookingStatus::Completed,
            ..
        }
    ));

    let after = engine.get_booking(before.id).await.unwrap();
    assert_eq!(before, after);
}

// ── Extensions ───────────────────────────────────────────

#[tokio::test]
async fn extension_with_payment_auto_approves() {
    let (engine, fid) = engine_with_facility("ext_auto.wal", 5, 4.0).await;
    let now = now_ms();
    let end = now + 2 * HOUR_MS;
    let booking = engine
        .create_booking(confirmed(fid, TimeRange::new(now + HOUR_MS, end), 8.0))
        .await
        .unwrap();

    let booking = engine
        .request_extension(booking.id, 60, Some(PaymentMethod::Wallet), Some("txn-9".into()))
        .await
        .unwrap();
    assert_eq!(booking.range.end, end + 60 * MINUTE_MS);
    assert_eq!(booking.duration_minutes, 120);
    assert_eq!(booking.payment.amount, 12.0); // 8.0 + 4.0/h × 1h

    let ext = &booking.extensions[0];
    assert_eq!(ext.status, ExtensionStatus::Approved);
    assert_eq!(ext.payment_status, PaymentStatus::Paid);
    assert_eq!(ext.original_end, end);
    assert_eq!(ext.new_end, end + 60 * MINUTE_MS);
}

#[tokio::test]
async fn extension_without_payment_stays_pending() {
    let (engine, fid) = engine_with_facility("ext_pending.wal", 5, 4.0).await;
    let now = now_ms();
    let end = now + 2 * HOUR_MS;
    let booking = engine
        .create_booking(confirmed(fid, TimeRange::new(now + HOUR_MS, end), 8.0))
        .await
        .unwrap();

    let booking = engine
        .request_extension(booking.id, 30, None, None)
        .await
        .unwrap();
    // Nothing applied until approval
    assert_eq!(booking.range.end, end);
    assert_eq!(booking.payment.amount, 8.0);
    assert_eq!(booking.extensions[0].status, ExtensionStatus::Pending);

    let booking = engine
        .approve_extension(booking.id, 0, Some("txn-10".into()))
        .await
        .unwrap();
    assert_eq!(booking.range.end, end + 30 * MINUTE_MS);
    assert_eq!(booking.payment.amount, 10.0);
    assert_eq!(booking.extensions[0].status, ExtensionStatus::Approved);
    assert_eq!(booking.extensions[0].payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn extension_conflict_recorded_as_rejected() {
    let (engine, fid) = engine_with_facility("ext_conflict.wal", 1, 4.0).await;
    let now = now_ms();
    let first = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();
    // Back-to-back booking occupying the would-be extension window
    engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + 2 * HOUR_MS, now + 3 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    let err = engine
        .request_extension(first.id, 30, Some(PaymentMethod::Wallet), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    // Parent untouched, but the rejected request is on the audit trail
    let after = engine.get_booking(first.id).await.unwrap();
    assert_eq!(after.range.end, first.range.end);
    assert_eq!(after.duration_minutes, first.duration_minutes);
    assert_eq!(after.payment.amount, first.payment.amount);
    assert_eq!(after.extensions.len(), 1);
    assert_eq!(after.extensions[0].status, ExtensionStatus::Rejected);
}

#[tokio::test]
async fn extension_approval_errors() {
    let (engine, fid) = engine_with_facility("ext_approve_err.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    assert!(matches!(
        engine.approve_extension(booking.id, 0, None).await,
        Err(EngineError::ExtensionNotFound { index: 0, .. })
    ));

    engine
        .request_extension(booking.id, 30, Some(PaymentMethod::Wallet), None)
        .await
        .unwrap();
    // Index 0 auto-approved above — approving again is invalid
    assert!(matches!(
        engine.approve_extension(booking.id, 0, None).await,
        Err(EngineError::ExtensionNotPending {
            status: ExtensionStatus::Approved,
            ..
        })
    ));
}

// ── Ratings, notes, access ───────────────────────────────

#[tokio::test]
async fn rating_only_after_completion() {
    let (engine, fid) = engine_with_facility("rating.wal", 5, 4.0).await;
    let now = now_ms();
    let open = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();
    assert!(matches!(
        engine.add_rating(open.id, 5, None).await,
        Err(EngineError::InvalidState { .. })
    ));

    let done = completed_booking(&engine, fid).await;
    let rated = engine
        .add_rating(done.id, 4, Some("tight ramp".into()))
        .await
        .unwrap();
    let rating = rated.rating.as_ref().unwrap();
    assert_eq!(rating.score, 4);
    assert_eq!(rating.comment.as_deref(), Some("tight ramp"));
}

#[tokio::test]
async fn notes_append() {
    let (engine, fid) = engine_with_facility("notes.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    let author = Ulid::new();
    engine
        .add_note(booking.id, author, "left of pillar".into(), false)
        .await
        .unwrap();
    engine
        .add_note(booking.id, author, "watch mirror".into(), true)
        .await
        .unwrap();

    let after = engine.get_booking(booking.id).await.unwrap();
    assert_eq!(after.notes.len(), 2);
    assert_eq!(after.notes[0].text, "left of pillar");
    assert!(after.notes[1].private);
}

#[tokio::test]
async fn access_assignment_derives_qr_and_code() {
    let (engine, fid) = engine_with_facility("access.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    let assigned = engine.assign_access(booking.id).await.unwrap();
    let qr = assigned.qr_code.as_ref().unwrap();
    assert_eq!(
        qr,
        &format!("https://spotsense.test/bookings/{}/qr", assigned.number)
    );
    assert_eq!(assigned.access_code.as_ref().unwrap().len(), 6);

    // Reassignment overwrites, it does not error
    let reassigned = engine.assign_access(booking.id).await.unwrap();
    assert_eq!(reassigned.qr_code, assigned.qr_code);
    assert_eq!(reassigned.access_code.as_ref().unwrap().len(), 6);
}

#[tokio::test]
async fn access_assignment_rejected_on_terminal() {
    let (engine, fid) = engine_with_facility("access_terminal.wal", 5, 4.0).await;
    let done = completed_booking(&engine, fid).await;
    assert!(matches!(
        engine.assign_access(done.id).await,
        Err(EngineError::InvalidState { .. })
    ));
}

// ── Recurrence Expander ──────────────────────────────────

// 2024-01-07 was a Sunday.
const SUNDAY_9AM: Ms = 1_704_618_000_000;

#[tokio::test]
async fn recurrence_weekly_expands_two_per_week() {
    let (engine, fid) = engine_with_facility("rec_weekly.wal", 10, 4.0).await;
    let template = engine
        .create_booking(NewBooking {
            recurrence: Some(Recurrence {
                frequency: RecurrenceFrequency::Weekly,
                days_of_week: vec![1, 3], // Monday, Wednesday
                until: SUNDAY_9AM + 14 * DAY_MS,
                instances: Vec::new(),
            }),
            ..confirmed(
                fid,
                TimeRange::new(SUNDAY_9AM, SUNDAY_9AM + 2 * HOUR_MS),
                8.0,
            )
        })
        .await
        .unwrap();

    let instances = engine.expand_recurrence(template.id).await.unwrap();
    assert_eq!(instances.len(), 4); // 2 per week × 2 weeks

    for id in &instances {
        let instance = engine.get_booking(*id).await.unwrap();
        assert_eq!(instance.status, BookingStatus::Confirmed);
        assert_eq!(instance.payment.status, PaymentStatus::Pending);
        assert_eq!(instance.duration_minutes, 120);
        assert!(instance.recurrence.is_none());
    }

    let template = engine.get_booking(template.id).await.unwrap();
    assert_eq!(template.recurrence.as_ref().unwrap().instances, instances);
}

#[tokio::test]
async fn recurrence_requires_descriptor() {
    let (engine, fid) = engine_with_facility("rec_missing.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();
    assert!(matches!(
        engine.expand_recurrence(booking.id).await,
        Err(EngineError::NotRecurring(_))
    ));
}

#[tokio::test]
async fn recurrence_skips_conflicting_instances() {
    let (engine, fid) = engine_with_facility("rec_best_effort.wal", 1, 4.0).await;
    // Day 2 of the expansion window is already taken
    engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(SUNDAY_9AM + 2 * DAY_MS, SUNDAY_9AM + 2 * DAY_MS + HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    let template = engine
        .create_booking(NewBooking {
            recurrence: Some(Recurrence {
                frequency: RecurrenceFrequency::Daily,
                days_of_week: Vec::new(),
                until: SUNDAY_9AM + 3 * DAY_MS,
                instances: Vec::new(),
            }),
            ..confirmed(fid, TimeRange::new(SUNDAY_9AM, SUNDAY_9AM + HOUR_MS), 8.0)
        })
        .await
        .unwrap();

    // Days 1 and 3 land, day 2 is skipped — the expansion still succeeds
    let instances = engine.expand_recurrence(template.id).await.unwrap();
    assert_eq!(instances.len(), 2);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn find_by_number() {
    let (engine, fid) = engine_with_facility("find_number.wal", 5, 4.0).await;
    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    let found = engine.find_by_number(&booking.number).await.unwrap();
    assert_eq!(found.id, booking.id);

    assert!(matches!(
        engine.find_by_number("BK00000000000000").await,
        Err(EngineError::UnknownNumber(_))
    ));
}

#[tokio::test]
async fn upcoming_and_current_for_user() {
    let (engine, fid) = engine_with_facility("user_queries.wal", 5, 4.0).await;
    let now = now_ms();
    let user = Ulid::new();

    let later = engine
        .create_booking(NewBooking {
            user,
            ..confirmed(fid, TimeRange::new(now + 5 * HOUR_MS, now + 6 * HOUR_MS), 8.0)
        })
        .await
        .unwrap();
    let sooner = engine
        .create_booking(NewBooking {
            user,
            ..confirmed(fid, TimeRange::new(now + 2 * HOUR_MS, now + 3 * HOUR_MS), 8.0)
        })
        .await
        .unwrap();
    let ongoing = engine
        .create_booking(NewBooking {
            user,
            ..confirmed(fid, TimeRange::new(now - HOUR_MS, now + HOUR_MS), 8.0)
        })
        .await
        .unwrap();

    let upcoming = engine.upcoming_for_user(user, now, 10);
    assert_eq!(
        upcoming.iter().map(|b| b.id).collect::<Vec<_>>(),
        vec![sooner.id, later.id]
    );

    // Nothing active yet
    assert!(engine.current_for_user(user, now).is_none());
    engine
        .check_in(ongoing.id, CheckMethod::QrCode, None, None)
        .await
        .unwrap();
    assert_eq!(engine.current_for_user(user, now_ms()).unwrap().id, ongoing.id);
}

#[tokio::test]
async fn active_for_vehicle() {
    let (engine, fid) = engine_with_facility("vehicle_queries.wal", 5, 4.0).await;
    let now = now_ms();
    let vehicle = Ulid::new();

    let live = engine
        .create_booking(NewBooking {
            vehicle,
            ..confirmed(fid, TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS), 8.0)
        })
        .await
        .unwrap();
    // Cancelled bookings drop out of the listing
    let gone = engine
        .create_booking(NewBooking {
            vehicle,
            ..confirmed(fid, TimeRange::new(now + 3 * HOUR_MS, now + 4 * HOUR_MS), 8.0)
        })
        .await
        .unwrap();
    engine
        .cancel_booking(gone.id, Ulid::new(), "sold the car")
        .await
        .unwrap();

    let active = engine.active_for_vehicle(vehicle, now);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, live.id);
}

#[tokio::test]
async fn availability_counts_remaining_capacity() {
    let (engine, fid) = engine_with_facility("availability.wal", 10, 4.0).await;
    let now = now_ms();
    let window = TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS);
    for _ in 0..3 {
        engine.create_booking(confirmed(fid, window, 4.0)).await.unwrap();
    }

    let report = engine
        .check_availability(fid, window, None, None)
        .await
        .unwrap();
    assert!(report.is_available);
    assert_eq!(report.available_spaces, 7);
    assert_eq!(report.total_spaces, 10);

    assert!(matches!(
        engine
            .check_availability(Ulid::new(), window, None, None)
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn occupancy_reflects_checked_in_window() {
    let (engine, fid) = engine_with_facility("occupancy.wal", 5, 4.0).await;
    let now = now_ms();
    engine
        .create_booking(confirmed(fid, TimeRange::new(now - HOUR_MS, now + HOUR_MS), 8.0))
        .await
        .unwrap();
    engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + 5 * HOUR_MS, now + 6 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    assert_eq!(engine.occupancy(fid, now_ms()).await.unwrap(), 1);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn mutations_publish_events() {
    let (engine, fid) = engine_with_facility("notify_events.wal", 5, 4.0).await;
    let mut rx = engine.notify.subscribe(fid);

    let now = now_ms();
    let booking = engine
        .create_booking(confirmed(
            fid,
            TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
            8.0,
        ))
        .await
        .unwrap();

    match rx.try_recv().unwrap() {
        BookingEvent::BookingCreated { booking: b, .. } => assert_eq!(b.id, booking.id),
        other => panic!("expected BookingCreated, got {other:?}"),
    }
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restore.wal");
    let fid = Ulid::new();
    let now = now_ms();

    let (booking_id, number, end_after_extension) = {
        let engine = new_engine(path.clone());
        engine
            .register_facility(fid, "Underground".into(), 5, 4.0)
            .await
            .unwrap();
        let booking = engine
            .create_booking(confirmed(
                fid,
                TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
                8.0,
            ))
            .await
            .unwrap();
        let booking = engine
            .request_extension(booking.id, 60, Some(PaymentMethod::Wallet), None)
            .await
            .unwrap();
        (booking.id, booking.number.clone(), booking.range.end)
    };

    let engine = new_engine_no_truncate(&path);
    let booking = engine.get_booking(booking_id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.range.end, end_after_extension);
    assert_eq!(booking.payment.amount, 12.0);
    assert_eq!(booking.extensions.len(), 1);

    // Indexes rebuilt too
    assert_eq!(engine.find_by_number(&number).await.unwrap().id, booking_id);
    assert_eq!(engine.facility_for_booking(&booking_id), Some(fid));
}

/// Reopen an existing WAL without the fresh-file cleanup in test_wal_path.
fn new_engine_no_truncate(path: &PathBuf) -> Engine {
    let notify = Arc::new(NotifyHub::new());
    Engine::new(path.clone(), notify, "https://spotsense.test".into()).unwrap()
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_preserve.wal");
    let fid = Ulid::new();
    let now = now_ms();

    let cancelled_id;
    let live_id;
    {
        let engine = new_engine(path.clone());
        engine
            .register_facility(fid, "Rooftop".into(), 5, 4.0)
            .await
            .unwrap();
        let cancelled = engine
            .create_booking(confirmed(
                fid,
                TimeRange::new(now + 25 * HOUR_MS, now + 26 * HOUR_MS),
                8.0,
            ))
            .await
            .unwrap();
        cancelled_id = cancelled.id;
        engine
            .cancel_booking(cancelled_id, Ulid::new(), "moved")
            .await
            .unwrap();
        let live = engine
            .create_booking(confirmed(
                fid,
                TimeRange::new(now + HOUR_MS, now + 2 * HOUR_MS),
                8.0,
            ))
            .await
            .unwrap();
        live_id = live.id;

        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    let engine = new_engine_no_truncate(&path);
    assert_eq!(
        engine.get_booking(cancelled_id).await.unwrap().status,
        BookingStatus::Refunded
    );
    assert_eq!(
        engine.get_booking(live_id).await.unwrap().status,
        BookingStatus::Confirmed
    );
    assert_eq!(engine.list_facilities().len(), 1);
}
