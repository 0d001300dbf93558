mod availability;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod recurrence;
#[cfg(test)]
mod tests;

pub use availability::{overlapping_count, report, space_is_free};
pub use error::EngineError;
pub use lifecycle::refund_for;
pub use recurrence::expansion_schedule;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: BookingEvent,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<BookingEvent>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(
    wal: &mut Wal,
    batch: &mut Vec<(BookingEvent, oneshot::Sender<io::Result<()>>)>,
) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &[(BookingEvent, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedFacilityState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → facility id.
    pub(super) booking_to_facility: DashMap<Ulid, Ulid>,
    /// Booking-number uniqueness index: number → booking id.
    pub(super) numbers: DashMap<String, Ulid>,
    pub(super) number_gen: BookingNumbers,
    /// QR references are URLs under this base, keyed by booking number.
    pub(super) qr_base_url: String,
}

/// Apply an event directly to a FacilityState (no locking — caller holds
/// the lock). Index maintenance for created bookings happens here so that
/// live mutation and WAL replay share one code path.
fn apply_to_facility(
    fs: &mut FacilityState,
    event: &BookingEvent,
    booking_index: &DashMap<Ulid, Ulid>,
    number_index: &DashMap<String, Ulid>,
) {
    match event {
        BookingEvent::FacilityUpdated {
            name,
            capacity,
            hourly_rate,
            ..
        } => {
            fs.name = name.clone();
            fs.capacity = *capacity;
            fs.hourly_rate = *hourly_rate;
        }
        BookingEvent::BookingCreated {
            facility_id,
            booking,
        } => {
            booking_index.insert(booking.id, *facility_id);
            number_index.insert(booking.number.clone(), booking.id);
            fs.insert_booking(booking.clone());
        }
        BookingEvent::BookingConfirmed {
            id,
            at,
            method,
            transaction_id,
            ..
        } => {
            if let Some(b) = fs.booking_mut(*id) {
                b.status = BookingStatus::Confirmed;
                b.payment.status = PaymentStatus::Paid;
                b.payment.method = Some(*method);
                b.payment.transaction_id = transaction_id.clone();
                b.updated_at = *at;
            }
        }
        BookingEvent::BookingCheckedIn { id, record, .. } => {
            if let Some(b) = fs.booking_mut(*id) {
                b.status = BookingStatus::Active;
                b.updated_at = record.time;
                b.check_in = Some(record.clone());
            }
        }
        BookingEvent::BookingCheckedOut { id, record, .. } => {
            if let Some(b) = fs.booking_mut(*id) {
                b.status = BookingStatus::Completed;
                if record.additional_charges > 0.0 {
                    b.payment.amount += record.additional_charges;
                }
                b.updated_at = record.time;
                b.check_out = Some(record.clone());
            }
        }
        BookingEvent::BookingCancelled {
            id,
            record,
            refunded,
            ..
        } => {
            if let Some(b) = fs.booking_mut(*id) {
                b.status = if *refunded {
                    BookingStatus::Refunded
                } else {
                    BookingStatus::Cancelled
                };
                if *refunded {
                    b.payment.status = PaymentStatus::Refunded;
                    b.payment.refund_amount = Some(record.refund_amount);
                    b.payment.refund_reason = Some(record.reason.clone());
                    b.payment.refund_date = Some(record.time);
                }
                b.updated_at = record.time;
                b.cancellation = Some(record.clone());
            }
        }
        BookingEvent::BookingMarkedNoShow { id, at, .. } => {
            if let Some(b) = fs.booking_mut(*id) {
                b.status = BookingStatus::NoShow;
                b.updated_at = *at;
            }
        }
        BookingEvent::ExtensionRequested {
            id,
            extension,
            applied,
            ..
        } => {
            if let Some(b) = fs.booking_mut(*id) {
                let mut ext = extension.clone();
                if *applied {
                    ext.status = ExtensionStatus::Approved;
                    let start = b.range.start;
                    b.set_range(TimeRange::new(start, ext.new_end));
                    b.payment.amount += ext.additional_amount;
                }
                b.updated_at = ext.requested_at;
                b.extensions.push(ext);
            }
        }
        BookingEvent::ExtensionApproved {
            id,
            index,
            transaction_id,
            at,
            ..
        } => {
            if let Some(b) = fs.booking_mut(*id)
                && let Some(ext) = b.extensions.get_mut(*index) {
                    ext.status = ExtensionStatus::Approved;
                    if transaction_id.is_some() {
                        ext.payment_status = PaymentStatus::Paid;
                        ext.transaction_id = transaction_id.clone();
                    }
                    let new_end = ext.new_end;
                    let additional = ext.additional_amount;
                    let start = b.range.start;
                    b.set_range(TimeRange::new(start, new_end));
                    b.payment.amount += additional;
                    b.updated_at = *at;
                }
        }
        BookingEvent::RatingAdded { id, rating, .. } => {
            if let Some(b) = fs.booking_mut(*id) {
                b.updated_at = rating.date;
                b.rating = Some(rating.clone());
            }
        }
        BookingEvent::NoteAdded { id, note, .. } => {
            if let Some(b) = fs.booking_mut(*id) {
                b.updated_at = note.added_at;
                b.notes.push(note.clone());
            }
        }
        BookingEvent::NotificationRecorded { id, record, .. } => {
            if let Some(b) = fs.booking_mut(*id) {
                b.updated_at = record.sent_at;
                b.notifications.push(record.clone());
            }
        }
        BookingEvent::AccessAssigned {
            id,
            qr_code,
            access_code,
            ..
        } => {
            if let Some(b) = fs.booking_mut(*id) {
                b.qr_code = Some(qr_code.clone());
                b.access_code = Some(access_code.clone());
            }
        }
        BookingEvent::RecurrenceExpanded { id, instances, .. } => {
            if let Some(b) = fs.booking_mut(*id)
                && let Some(rec) = &mut b.recurrence {
                    rec.instances = instances.clone();
                }
        }
        // FacilityRegistered/Removed are handled at the DashMap level, not here
        BookingEvent::FacilityRegistered { .. } | BookingEvent::FacilityRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        qr_base_url: String,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_facility: DashMap::new(),
            numbers: DashMap::new(),
            number_gen: BookingNumbers::new(),
            qr_base_url,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy
        // tenant creation).
        for event in &events {
            match event {
                BookingEvent::FacilityRegistered {
                    id,
                    name,
                    capacity,
                    hourly_rate,
                    currency,
                } => {
                    let fs = FacilityState::new(
                        *id,
                        name.clone(),
                        *capacity,
                        *hourly_rate,
                        currency.clone(),
                    );
                    engine.state.insert(*id, Arc::new(RwLock::new(fs)));
                }
                BookingEvent::FacilityRemoved { id } => {
                    engine.drop_facility_indexes(id);
                    engine.state.remove(id);
                }
                other => {
                    let facility_id = other.facility_id();
                    if let Some(entry) = engine.state.get(&facility_id) {
                        let fs_arc = entry.clone();
                        let mut guard = fs_arc.try_write().expect("replay: uncontended write");
                        apply_to_facility(
                            &mut guard,
                            other,
                            &engine.booking_to_facility,
                            &engine.numbers,
                        );
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Remove every index entry pointing at a facility's bookings.
    pub(super) fn drop_facility_indexes(&self, facility_id: &Ulid) {
        if let Some(entry) = self.state.get(facility_id) {
            let fs = entry.value().clone();
            if let Ok(guard) = fs.try_read() {
                for b in &guard.bookings {
                    self.booking_to_facility.remove(&b.id);
                    self.numbers.remove(&b.number);
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &BookingEvent) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_facility(&self, id: &Ulid) -> Option<SharedFacilityState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn facility_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_facility.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        facility_id: Ulid,
        fs: &mut FacilityState,
        event: &BookingEvent,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_facility(fs, event, &self.booking_to_facility, &self.numbers);
        self.notify.send(facility_id, event);
        Ok(())
    }

    /// Lookup booking → facility, get facility, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<FacilityState>), EngineError> {
        let facility_id = self
            .facility_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.write_owned().await;
        Ok((facility_id, guard))
    }
}
