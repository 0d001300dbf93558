use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{overlapping_count, space_is_free};
use super::{lifecycle, recurrence, Engine, EngineError, WalCommand};

fn validate_range(range: &TimeRange) -> Result<(), EngineError> {
    if range.end <= range.start {
        return Err(EngineError::Validation("end time must be after start time"));
    }
    if range.start < MIN_VALID_TIMESTAMP_MS || range.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if range.duration_ms() > MAX_RANGE_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking spans too long"));
    }
    Ok(())
}

impl Engine {
    // ── Facilities ───────────────────────────────────────

    pub async fn register_facility(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        hourly_rate: f64,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_FACILITIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("facility name empty or too long"));
        }
        if capacity == 0 {
            return Err(EngineError::Validation("facility capacity must be positive"));
        }
        if !hourly_rate.is_finite() || hourly_rate < 0.0 {
            return Err(EngineError::Validation(
                "hourly rate must be a non-negative number",
            ));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = BookingEvent::FacilityRegistered {
            id,
            name: name.clone(),
            capacity,
            hourly_rate,
            currency: "USD".into(),
        };
        self.wal_append(&event).await?;
        let fs = FacilityState::new(id, name, capacity, hourly_rate, "USD".into());
        self.state.insert(id, Arc::new(RwLock::new(fs)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_facility(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: Option<u32>,
        hourly_rate: Option<f64>,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && (n.is_empty() || n.len() > MAX_NAME_LEN) {
                return Err(EngineError::Validation("facility name empty or too long"));
            }
        if capacity == Some(0) {
            return Err(EngineError::Validation("facility capacity must be positive"));
        }
        let fs = self.get_facility(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = fs.write().await;

        let event = BookingEvent::FacilityUpdated {
            id,
            name: name.unwrap_or_else(|| guard.name.clone()),
            capacity: capacity.unwrap_or(guard.capacity),
            hourly_rate: hourly_rate.unwrap_or(guard.hourly_rate),
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// A facility with live (non-terminal) bookings cannot be removed.
    pub async fn remove_facility(&self, id: Ulid) -> Result<(), EngineError> {
        let fs = self.get_facility(&id).ok_or(EngineError::NotFound(id))?;
        let guard = fs.read().await;
        if guard.bookings.iter().any(|b| !b.is_terminal()) {
            return Err(EngineError::Validation("facility has live bookings"));
        }
        drop(guard);

        let event = BookingEvent::FacilityRemoved { id };
        self.wal_append(&event).await?;
        self.drop_facility_indexes(&id);
        self.state.remove(&id);
        self.notify.send(id, &event);
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────

    /// Create a booking. The facility write lock is held from the
    /// availability check through the WAL append, so two concurrent
    /// requests for the same window serialize.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        validate_range(&req.range)?;
        if !matches!(req.status, BookingStatus::Pending | BookingStatus::Confirmed) {
            return Err(EngineError::Validation(
                "bookings start as pending or confirmed",
            ));
        }
        if !req.amount.is_finite() || req.amount < 0.0 {
            return Err(EngineError::Validation(
                "payment amount must be a non-negative number",
            ));
        }
        if let Some(ref sr) = req.special_requests
            && sr.len() > MAX_TEXT_LEN {
                return Err(EngineError::Validation("special requests too long"));
            }
        if self.booking_to_facility.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let fs = self
            .get_facility(&req.facility)
            .ok_or(EngineError::NotFound(req.facility))?;
        let mut guard = fs.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many bookings on facility"));
        }

        match req.space.as_ref() {
            Some(space) => {
                if !space_is_free(&guard, &req.range, &space.space_id, None) {
                    return Err(EngineError::Conflict(req.id));
                }
            }
            None => {
                if overlapping_count(&guard, &req.range, None, None) >= guard.capacity {
                    return Err(EngineError::Conflict(req.id));
                }
            }
        }

        let now = now_ms();
        let mut number = self.number_gen.next(now / 1000);
        // The sequence makes collisions all but impossible; re-roll anyway
        // rather than hand out a duplicate.
        for _ in 0..3 {
            if !self.numbers.contains_key(&number) {
                break;
            }
            number = self.number_gen.next(now / 1000);
        }
        if self.numbers.contains_key(&number) {
            return Err(EngineError::LimitExceeded("booking number space exhausted"));
        }

        let pricing = req.pricing.unwrap_or(Pricing {
            rate_type: RateType::Hourly,
            rate: guard.hourly_rate,
            total: req.amount,
            currency: guard.currency.clone(),
        });
        let booking = Booking {
            id: req.id,
            number,
            user: req.user,
            vehicle: req.vehicle,
            facility: req.facility,
            space: req.space,
            range: req.range,
            duration_minutes: req.range.duration_minutes(),
            status: req.status,
            payment: Payment::new(req.amount, guard.currency.clone()),
            pricing,
            check_in: None,
            check_out: None,
            extensions: Vec::new(),
            cancellation: None,
            recurrence: req.recurrence,
            rating: None,
            notifications: Vec::new(),
            notes: Vec::new(),
            qr_code: None,
            access_code: None,
            source: req.source,
            special_requests: req.special_requests,
            created_at: now,
            updated_at: now,
        };

        let event = BookingEvent::BookingCreated {
            facility_id: req.facility,
            booking: booking.clone(),
        };
        self.persist_and_apply(req.facility, &mut guard, &event)
            .await?;
        Ok(booking)
    }

    /// External payment confirmation: pending → confirmed, payment → paid.
    pub async fn confirm_booking(
        &self,
        id: Ulid,
        method: PaymentMethod,
        transaction_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        lifecycle::plan_confirmation(booking)?;

        let event = BookingEvent::BookingConfirmed {
            id,
            facility_id,
            at: now_ms(),
            method,
            transaction_id,
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(guard.booking(id).cloned().expect("booking just updated"))
    }

    pub async fn check_in(
        &self,
        id: Ulid,
        method: CheckMethod,
        verified_by: Option<Ulid>,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let record = lifecycle::plan_check_in(booking, method, verified_by, notes, now_ms())?;

        let event = BookingEvent::BookingCheckedIn {
            id,
            facility_id,
            record,
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(guard.booking(id).cloned().expect("booking just updated"))
    }

    pub async fn check_out(
        &self,
        id: Ulid,
        method: CheckMethod,
        verified_by: Option<Ulid>,
        notes: Option<String>,
        additional_charges: f64,
    ) -> Result<Booking, EngineError> {
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let record = lifecycle::plan_check_out(
            booking,
            method,
            verified_by,
            notes,
            additional_charges,
            now_ms(),
        )?;

        let event = BookingEvent::BookingCheckedOut {
            id,
            facility_id,
            record,
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(guard.booking(id).cloned().expect("booking just updated"))
    }

    pub async fn cancel_booking(
        &self,
        id: Ulid,
        cancelled_by: Ulid,
        reason: &str,
    ) -> Result<Booking, EngineError> {
        if reason.len() > MAX_TEXT_LEN {
            return Err(EngineError::Validation("cancellation reason too long"));
        }
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let record = lifecycle::plan_cancellation(booking, cancelled_by, reason, now_ms())?;
        let refunded = record.refund_eligible && record.refund_amount > 0.0;

        let event = BookingEvent::BookingCancelled {
            id,
            facility_id,
            record,
            refunded,
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(guard.booking(id).cloned().expect("booking just updated"))
    }

    /// Request more time. A conflicting window records the extension as
    /// rejected (the audit trail survives) and the call fails with
    /// Conflict; a supplied payment method auto-approves.
    pub async fn request_extension(
        &self,
        id: Ulid,
        additional_minutes: i64,
        payment_method: Option<PaymentMethod>,
        transaction_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let mut extension = lifecycle::plan_extension(
            booking,
            additional_minutes,
            payment_method,
            transaction_id,
            now_ms(),
        )?;

        let extended_window = TimeRange::new(extension.original_end, extension.new_end);
        let free = match booking.space_id() {
            Some(space) => space_is_free(&guard, &extended_window, space, Some(id)),
            None => overlapping_count(&guard, &extended_window, None, Some(id)) < guard.capacity,
        };

        if !free {
            extension.status = ExtensionStatus::Rejected;
            let event = BookingEvent::ExtensionRequested {
                id,
                facility_id,
                extension,
                applied: false,
            };
            self.persist_and_apply(facility_id, &mut guard, &event)
                .await?;
            return Err(EngineError::Conflict(id));
        }

        let applied = payment_method.is_some();
        let event = BookingEvent::ExtensionRequested {
            id,
            facility_id,
            extension,
            applied,
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(guard.booking(id).cloned().expect("booking just updated"))
    }

    pub async fn approve_extension(
        &self,
        id: Ulid,
        index: usize,
        transaction_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let extension = booking
            .extensions
            .get(index)
            .ok_or(EngineError::ExtensionNotFound { booking: id, index })?;
        if extension.status != ExtensionStatus::Pending {
            return Err(EngineError::ExtensionNotPending {
                index,
                status: extension.status,
            });
        }

        let event = BookingEvent::ExtensionApproved {
            id,
            facility_id,
            index,
            transaction_id,
            at: now_ms(),
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(guard.booking(id).cloned().expect("booking just updated"))
    }

    pub async fn add_rating(
        &self,
        id: Ulid,
        score: u8,
        comment: Option<String>,
    ) -> Result<Booking, EngineError> {
        if let Some(ref c) = comment
            && c.len() > MAX_TEXT_LEN {
                return Err(EngineError::Validation("rating comment too long"));
            }
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let rating = lifecycle::plan_rating(booking, score, comment, now_ms())?;

        let event = BookingEvent::RatingAdded {
            id,
            facility_id,
            rating,
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(guard.booking(id).cloned().expect("booking just updated"))
    }

    pub async fn add_note(
        &self,
        id: Ulid,
        author: Ulid,
        text: String,
        private: bool,
    ) -> Result<(), EngineError> {
        if text.is_empty() || text.len() > MAX_TEXT_LEN {
            return Err(EngineError::Validation("note text empty or too long"));
        }
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        if guard.booking(id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let event = BookingEvent::NoteAdded {
            id,
            facility_id,
            note: Note {
                text,
                author,
                added_at: now_ms(),
                private,
            },
        };
        self.persist_and_apply(facility_id, &mut guard, &event).await
    }

    pub async fn record_notification(
        &self,
        id: Ulid,
        kind: NotificationKind,
        channel: NotificationChannel,
        content: Option<String>,
    ) -> Result<(), EngineError> {
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        if guard.booking(id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let event = BookingEvent::NotificationRecorded {
            id,
            facility_id,
            record: NotificationRecord {
                kind,
                channel,
                content,
                sent_at: now_ms(),
            },
        };
        self.persist_and_apply(facility_id, &mut guard, &event).await
    }

    /// Assign the QR reference and a fresh access code. Reassignment just
    /// overwrites — both artifacts are derived, not precious.
    pub async fn assign_access(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        if booking.is_terminal() {
            return Err(EngineError::InvalidState {
                op: "assign access to",
                status: booking.status,
            });
        }
        let qr_code = format!(
            "{}/bookings/{}/qr",
            self.qr_base_url.trim_end_matches('/'),
            booking.number
        );

        let event = BookingEvent::AccessAssigned {
            id,
            facility_id,
            qr_code,
            access_code: generate_access_code(),
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(guard.booking(id).cloned().expect("booking just updated"))
    }

    // ── Recurrence Expander ──────────────────────────────

    /// Expand a recurring template into concrete sibling bookings.
    /// Best-effort: an instance that fails (typically Conflict) is logged
    /// and skipped; the template records whatever succeeded.
    pub async fn expand_recurrence(&self, id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let facility_id = self
            .facility_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let template = {
            let guard = fs.read().await;
            guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?
        };
        let recurrence = template
            .recurrence
            .clone()
            .ok_or(EngineError::NotRecurring(id))?;

        let schedule = recurrence::expansion_schedule(&template.range, &recurrence)?;

        let mut instances = Vec::new();
        for range in schedule {
            let req = NewBooking {
                id: Ulid::new(),
                facility: template.facility,
                user: template.user,
                vehicle: template.vehicle,
                space: template.space.clone(),
                range,
                amount: template.payment.amount,
                // Each instance pays on its own; payment starts pending.
                status: BookingStatus::Confirmed,
                pricing: Some(template.pricing.clone()),
                source: template.source,
                special_requests: template.special_requests.clone(),
                recurrence: None,
            };
            match self.create_booking(req).await {
                Ok(instance) => instances.push(instance.id),
                Err(e) => {
                    tracing::warn!("skipping recurring instance of {id} at {}: {e}", range.start);
                }
            }
        }

        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let mut guard = fs.write().await;
        let event = BookingEvent::RecurrenceExpanded {
            id,
            facility_id,
            instances: instances.clone(),
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(instances)
    }

    // ── No-show sweep support ────────────────────────────

    /// Confirmed bookings whose window closed without a check-in.
    pub fn collect_no_shows(&self, now: Ms) -> Vec<Ulid> {
        let mut overdue = Vec::new();
        for entry in self.state.iter() {
            let fs = entry.value().clone();
            if let Ok(guard) = fs.try_read() {
                for b in &guard.bookings {
                    if b.status == BookingStatus::Confirmed && b.range.end <= now {
                        overdue.push(b.id);
                    }
                }
            }
        }
        overdue
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (facility_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let at = now_ms();
        lifecycle::plan_no_show(booking, at)?;

        let event = BookingEvent::BookingMarkedNoShow {
            id,
            facility_id,
            at,
        };
        self.persist_and_apply(facility_id, &mut guard, &event)
            .await?;
        Ok(guard.booking(id).cloned().expect("booking just updated"))
    }

    // ── WAL compaction ───────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the
    /// current state: one registration per facility, one creation per
    /// booking (the booking snapshot carries every later mutation).
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.state.iter() {
            let fs = entry.value().clone();
            let guard = fs.try_read().expect("compact: uncontended read");
            events.push(BookingEvent::FacilityRegistered {
                id: guard.id,
                name: guard.name.clone(),
                capacity: guard.capacity,
                hourly_rate: guard.hourly_rate,
                currency: guard.currency.clone(),
            });
            for b in &guard.bookings {
                events.push(BookingEvent::BookingCreated {
                    facility_id: guard.id,
                    booking: b.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
