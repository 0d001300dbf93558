//! Pure transition planning: each function inspects an immutable booking
//! plus command inputs and either produces the record the transition will
//! attach, or the error that forbids it. No clocks, no I/O — callers pass
//! `now` and persist the result themselves.

use ulid::Ulid;

use crate::limits::MAX_EXTENSION_MINUTES;
use crate::model::*;

use super::EngineError;

/// Refund tiers by lead time before the booking's start.
pub fn refund_for(amount: f64, hours_until_start: f64) -> (bool, f64) {
    if hours_until_start >= 24.0 {
        (true, amount)
    } else if hours_until_start >= 12.0 {
        (true, amount * 0.75)
    } else if hours_until_start >= 6.0 {
        (true, amount * 0.50)
    } else {
        (false, 0.0)
    }
}

pub fn plan_cancellation(
    booking: &Booking,
    cancelled_by: Ulid,
    reason: &str,
    now: Ms,
) -> Result<Cancellation, EngineError> {
    if booking.is_terminal() {
        return Err(EngineError::InvalidState {
            op: "cancel",
            status: booking.status,
        });
    }
    let hours_until_start = (booking.range.start - now) as f64 / HOUR_MS as f64;
    let (refund_eligible, refund_amount) = refund_for(booking.payment.amount, hours_until_start);
    Ok(Cancellation {
        time: now,
        reason: reason.to_string(),
        cancelled_by,
        refund_eligible,
        refund_amount,
        refund_processed: refund_eligible && refund_amount > 0.0,
        refund_transaction_id: None,
    })
}

pub fn plan_confirmation(booking: &Booking) -> Result<(), EngineError> {
    if booking.status != BookingStatus::Pending {
        return Err(EngineError::InvalidState {
            op: "confirm",
            status: booking.status,
        });
    }
    Ok(())
}

pub fn plan_check_in(
    booking: &Booking,
    method: CheckMethod,
    verified_by: Option<Ulid>,
    notes: Option<String>,
    now: Ms,
) -> Result<CheckRecord, EngineError> {
    if booking.status != BookingStatus::Confirmed {
        return Err(EngineError::InvalidState {
            op: "check in",
            status: booking.status,
        });
    }
    Ok(CheckRecord {
        time: now,
        method,
        verified_by,
        notes,
    })
}

pub fn plan_check_out(
    booking: &Booking,
    method: CheckMethod,
    verified_by: Option<Ulid>,
    notes: Option<String>,
    additional_charges: f64,
    now: Ms,
) -> Result<CheckOutRecord, EngineError> {
    if booking.status != BookingStatus::Active {
        return Err(EngineError::InvalidState {
            op: "check out",
            status: booking.status,
        });
    }
    if !additional_charges.is_finite() || additional_charges < 0.0 {
        return Err(EngineError::Validation(
            "additional charges must be a non-negative number",
        ));
    }
    let overstay_minutes = if now > booking.range.end {
        (now - booking.range.end + MINUTE_MS - 1) / MINUTE_MS
    } else {
        0
    };
    Ok(CheckOutRecord {
        time: now,
        method,
        verified_by,
        notes,
        overstay_minutes,
        additional_charges,
    })
}

/// Price and shape an extension request. The caller still runs the
/// availability check and decides approved/pending/rejected.
pub fn plan_extension(
    booking: &Booking,
    additional_minutes: i64,
    payment_method: Option<PaymentMethod>,
    transaction_id: Option<String>,
    now: Ms,
) -> Result<Extension, EngineError> {
    if !matches!(
        booking.status,
        BookingStatus::Confirmed | BookingStatus::Active
    ) {
        return Err(EngineError::InvalidState {
            op: "extend",
            status: booking.status,
        });
    }
    if additional_minutes <= 0 {
        return Err(EngineError::Validation("extension minutes must be positive"));
    }
    if additional_minutes > MAX_EXTENSION_MINUTES {
        return Err(EngineError::LimitExceeded("extension too long"));
    }
    let additional_amount = booking.pricing.rate * additional_minutes as f64 / 60.0;
    let original_end = booking.range.end;
    Ok(Extension {
        requested_at: now,
        additional_minutes,
        original_end,
        new_end: original_end + additional_minutes * MINUTE_MS,
        status: ExtensionStatus::Pending,
        additional_amount,
        payment_status: if payment_method.is_some() {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Pending
        },
        transaction_id,
    })
}

pub fn plan_rating(
    booking: &Booking,
    score: u8,
    comment: Option<String>,
    now: Ms,
) -> Result<Rating, EngineError> {
    if booking.status != BookingStatus::Completed {
        return Err(EngineError::InvalidState {
            op: "rate",
            status: booking.status,
        });
    }
    if !(1..=5).contains(&score) {
        return Err(EngineError::Validation("rating score must be 1..=5"));
    }
    Ok(Rating {
        score,
        comment,
        date: now,
    })
}

pub fn plan_no_show(booking: &Booking, now: Ms) -> Result<(), EngineError> {
    if booking.status != BookingStatus::Confirmed || booking.range.end > now {
        return Err(EngineError::InvalidState {
            op: "mark no-show for",
            status: booking.status,
        });
    }
    Ok(())
}
