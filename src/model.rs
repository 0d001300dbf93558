use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as Ms
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Ms,
    pub end: Ms,
}

impl TimeRange {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Duration in whole minutes, rounded up.
    pub fn duration_minutes(&self) -> i64 {
        (self.duration_ms() + MINUTE_MS - 1) / MINUTE_MS
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Status vocabulary ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
    NoShow,
    Refunded,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Cancelled
                | BookingStatus::NoShow
                | BookingStatus::Refunded
        )
    }

    /// Only confirmed and active bookings occupy capacity.
    pub fn counts_against_capacity(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Active => "active",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "active" => Some(BookingStatus::Active),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            "no_show" => Some(BookingStatus::NoShow),
            "refunded" => Some(BookingStatus::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
    PartialRefund,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartialRefund => "partial_refund",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    Paypal,
    ApplePay,
    GooglePay,
    Cash,
    Wallet,
    Subscription,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::DebitCard => "debit_card",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::ApplePay => "apple_pay",
            PaymentMethod::GooglePay => "google_pay",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Wallet => "wallet",
            PaymentMethod::Subscription => "subscription",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit_card" => Some(PaymentMethod::CreditCard),
            "debit_card" => Some(PaymentMethod::DebitCard),
            "paypal" => Some(PaymentMethod::Paypal),
            "apple_pay" => Some(PaymentMethod::ApplePay),
            "google_pay" => Some(PaymentMethod::GooglePay),
            "cash" => Some(PaymentMethod::Cash),
            "wallet" => Some(PaymentMethod::Wallet),
            "subscription" => Some(PaymentMethod::Subscription),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckMethod {
    QrCode,
    LicensePlate,
    Manual,
    Automatic,
}

impl CheckMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckMethod::QrCode => "qr_code",
            CheckMethod::LicensePlate => "license_plate",
            CheckMethod::Manual => "manual",
            CheckMethod::Automatic => "automatic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qr_code" => Some(CheckMethod::QrCode),
            "license_plate" => Some(CheckMethod::LicensePlate),
            "manual" => Some(CheckMethod::Manual),
            "automatic" => Some(CheckMethod::Automatic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtensionStatus {
    Pending,
    Approved,
    Rejected,
}

impl ExtensionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtensionStatus::Pending => "pending",
            ExtensionStatus::Approved => "approved",
            ExtensionStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateType {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Special,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingSource {
    App,
    Web,
    Kiosk,
    Phone,
    WalkIn,
    ThirdParty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceFrequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Confirmation,
    Reminder,
    CheckIn,
    CheckOut,
    Extension,
    Cancellation,
    Payment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
    InApp,
}

// ── Sub-records ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub base_rate: f64,
    pub discounts: f64,
    pub taxes: f64,
    pub service_fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub status: PaymentStatus,
    pub method: Option<PaymentMethod>,
    pub transaction_id: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub breakdown: CostBreakdown,
    pub refund_amount: Option<f64>,
    pub refund_reason: Option<String>,
    pub refund_date: Option<Ms>,
    pub receipt: Option<String>,
}

impl Payment {
    pub fn new(amount: f64, currency: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Pending,
            method: None,
            transaction_id: None,
            amount,
            currency: currency.into(),
            breakdown: CostBreakdown::default(),
            refund_amount: None,
            refund_reason: None,
            refund_date: None,
            receipt: None,
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err("payment amount must be a non-negative number");
        }
        // A paid payment must name the method it was paid with.
        if self.status == PaymentStatus::Paid && self.method.is_none() {
            return Err("paid payment requires a method");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub rate_type: RateType,
    pub rate: f64,
    pub total: f64,
    pub currency: String,
}

/// Space descriptor denormalized into the booking at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRef {
    pub space_id: String,
    pub floor: Option<i32>,
    pub section: Option<String>,
    pub kind: Option<String>,
}

impl SpaceRef {
    pub fn new(space_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            floor: None,
            section: None,
            kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub time: Ms,
    pub method: CheckMethod,
    pub verified_by: Option<Ulid>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutRecord {
    pub time: Ms,
    pub method: CheckMethod,
    pub verified_by: Option<Ulid>,
    pub notes: Option<String>,
    /// Whole minutes past the booked end, rounded up. Zero when on time.
    pub overstay_minutes: i64,
    pub additional_charges: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub requested_at: Ms,
    pub additional_minutes: i64,
    pub original_end: Ms,
    pub new_end: Ms,
    pub status: ExtensionStatus,
    pub additional_amount: f64,
    /// Paid independently of the parent booking's payment.
    pub payment_status: PaymentStatus,
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub time: Ms,
    pub reason: String,
    pub cancelled_by: Ulid,
    pub refund_eligible: bool,
    pub refund_amount: f64,
    pub refund_processed: bool,
    pub refund_transaction_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: RecurrenceFrequency,
    /// 0 = Sunday … 6 = Saturday. Consulted for weekly templates only.
    pub days_of_week: Vec<u8>,
    pub until: Ms,
    pub instances: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rating {
    pub score: u8,
    pub comment: Option<String>,
    pub date: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub kind: NotificationKind,
    pub channel: NotificationChannel,
    pub content: Option<String>,
    pub sent_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
    pub author: Ulid,
    pub added_at: Ms,
    pub private: bool,
}

// ── Booking aggregate ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub number: String,
    pub user: Ulid,
    pub vehicle: Ulid,
    pub facility: Ulid,
    pub space: Option<SpaceRef>,
    pub range: TimeRange,
    /// Always recomputed from `range`, never authored independently.
    pub duration_minutes: i64,
    pub status: BookingStatus,
    pub payment: Payment,
    pub pricing: Pricing,
    pub check_in: Option<CheckRecord>,
    pub check_out: Option<CheckOutRecord>,
    pub extensions: Vec<Extension>,
    pub cancellation: Option<Cancellation>,
    pub recurrence: Option<Recurrence>,
    pub rating: Option<Rating>,
    pub notifications: Vec<NotificationRecord>,
    pub notes: Vec<Note>,
    pub qr_code: Option<String>,
    pub access_code: Option<String>,
    pub source: BookingSource,
    pub special_requests: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    /// Replace the time range and recompute the derived duration.
    pub fn set_range(&mut self, range: TimeRange) {
        self.range = range;
        self.duration_minutes = range.duration_minutes();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn space_id(&self) -> Option<&str> {
        self.space.as_ref().map(|s| s.space_id.as_str())
    }
}

/// Creation request — everything the caller supplies; the engine fills in
/// the number, payment/pricing defaults and timestamps.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Ulid,
    pub facility: Ulid,
    pub user: Ulid,
    pub vehicle: Ulid,
    pub space: Option<SpaceRef>,
    pub range: TimeRange,
    pub amount: f64,
    /// Only `Pending` and `Confirmed` are valid starting statuses.
    pub status: BookingStatus,
    /// When absent, pricing is derived from the facility's hourly rate.
    pub pricing: Option<Pricing>,
    pub source: BookingSource,
    pub special_requests: Option<String>,
    pub recurrence: Option<Recurrence>,
}

impl NewBooking {
    pub fn new(facility: Ulid, user: Ulid, vehicle: Ulid, range: TimeRange, amount: f64) -> Self {
        Self {
            id: Ulid::new(),
            facility,
            user,
            vehicle,
            space: None,
            range,
            amount,
            status: BookingStatus::Pending,
            pricing: None,
            source: BookingSource::App,
            special_requests: None,
            recurrence: None,
        }
    }
}

// ── Booking numbers and access artifacts ─────────────────────────

/// Booking-number generator: `BK` + Unix seconds + four-digit suffix.
///
/// The suffix walks a randomly-seeded sequence instead of drawing fresh
/// randomness each time, so any 10,000 consecutive numbers from one
/// generator are collision-free even within a single second.
pub struct BookingNumbers {
    seq: AtomicU32,
}

impl Default for BookingNumbers {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingNumbers {
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(rand::thread_rng().gen()),
        }
    }

    pub fn next(&self, now_secs: i64) -> String {
        let suffix = self.seq.fetch_add(1, Ordering::Relaxed) % 10_000;
        format!("BK{now_secs}{suffix:04}")
    }
}

/// Unambiguous charset: no I, O or 0.
const ACCESS_CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ123456789";
const ACCESS_CODE_LEN: usize = 6;

pub fn generate_access_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ACCESS_CODE_LEN)
        .map(|_| ACCESS_CODE_CHARSET[rng.gen_range(0..ACCESS_CODE_CHARSET.len())] as char)
        .collect()
}

// ── Facility state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FacilityState {
    pub id: Ulid,
    pub name: String,
    /// Max concurrent confirmed/active bookings.
    pub capacity: u32,
    pub hourly_rate: f64,
    pub currency: String,
    /// All bookings ever taken at this facility, sorted by `range.start`.
    pub bookings: Vec<Booking>,
}

impl FacilityState {
    pub fn new(id: Ulid, name: String, capacity: u32, hourly_rate: f64, currency: String) -> Self {
        Self {
            id,
            name,
            capacity,
            hourly_rate,
            currency,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by range.start. Extensions only move
    /// ends forward, so the ordering survives later mutation.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.range.start, |b| b.range.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose range overlaps the query window. Binary search skips
    /// everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.range.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end > query.start)
    }
}

// ── Events — flat, no nesting. This is the WAL record format. ────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BookingEvent {
    FacilityRegistered {
        id: Ulid,
        name: String,
        capacity: u32,
        hourly_rate: f64,
        currency: String,
    },
    FacilityUpdated {
        id: Ulid,
        name: String,
        capacity: u32,
        hourly_rate: f64,
    },
    FacilityRemoved {
        id: Ulid,
    },
    BookingCreated {
        facility_id: Ulid,
        booking: Booking,
    },
    BookingConfirmed {
        id: Ulid,
        facility_id: Ulid,
        at: Ms,
        method: PaymentMethod,
        transaction_id: Option<String>,
    },
    BookingCheckedIn {
        id: Ulid,
        facility_id: Ulid,
        record: CheckRecord,
    },
    BookingCheckedOut {
        id: Ulid,
        facility_id: Ulid,
        record: CheckOutRecord,
    },
    BookingCancelled {
        id: Ulid,
        facility_id: Ulid,
        record: Cancellation,
        /// True when a refund was issued — the booking lands in `refunded`.
        refunded: bool,
    },
    BookingMarkedNoShow {
        id: Ulid,
        facility_id: Ulid,
        at: Ms,
    },
    ExtensionRequested {
        id: Ulid,
        facility_id: Ulid,
        extension: Extension,
        /// True when auto-approved: the end-time shift applies with it.
        applied: bool,
    },
    ExtensionApproved {
        id: Ulid,
        facility_id: Ulid,
        index: usize,
        transaction_id: Option<String>,
        at: Ms,
    },
    RatingAdded {
        id: Ulid,
        facility_id: Ulid,
        rating: Rating,
    },
    NoteAdded {
        id: Ulid,
        facility_id: Ulid,
        note: Note,
    },
    NotificationRecorded {
        id: Ulid,
        facility_id: Ulid,
        record: NotificationRecord,
    },
    AccessAssigned {
        id: Ulid,
        facility_id: Ulid,
        qr_code: String,
        access_code: String,
    },
    RecurrenceExpanded {
        id: Ulid,
        facility_id: Ulid,
        instances: Vec<Ulid>,
    },
}

impl BookingEvent {
    /// Every event routes to exactly one facility.
    pub fn facility_id(&self) -> Ulid {
        match self {
            BookingEvent::FacilityRegistered { id, .. }
            | BookingEvent::FacilityUpdated { id, .. }
            | BookingEvent::FacilityRemoved { id } => *id,
            BookingEvent::BookingCreated { facility_id, .. }
            | BookingEvent::BookingConfirmed { facility_id, .. }
            | BookingEvent::BookingCheckedIn { facility_id, .. }
            | BookingEvent::BookingCheckedOut { facility_id, .. }
            | BookingEvent::BookingCancelled { facility_id, .. }
            | BookingEvent::BookingMarkedNoShow { facility_id, .. }
            | BookingEvent::ExtensionRequested { facility_id, .. }
            | BookingEvent::ExtensionApproved { facility_id, .. }
            | BookingEvent::RatingAdded { facility_id, .. }
            | BookingEvent::NoteAdded { facility_id, .. }
            | BookingEvent::NotificationRecorded { facility_id, .. }
            | BookingEvent::AccessAssigned { facility_id, .. }
            | BookingEvent::RecurrenceExpanded { facility_id, .. } => *facility_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FacilityInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub hourly_rate: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub is_available: bool,
    pub available_spaces: u32,
    pub total_spaces: u32,
}
