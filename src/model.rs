use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Candidate start times in the day view are this far apart.
pub const SLOT_GRANULARITY_MINUTES: i64 = 30;

/// A scheduled appointment this long past its start is reaped.
pub const OVERDUE_AFTER_HOURS: i64 = 24;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const ACCEPTED_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Half-open interval `[start, end)` in salon wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Window {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    pub fn starting_at(start: NaiveDateTime, duration_minutes: u32) -> Self {
        Self::new(start, start + Duration::minutes(i64::from(duration_minutes)))
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Touching endpoints are not an overlap.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }
}

// ── Salon catalogue ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salon {
    pub id: Ulid,
    pub name: Option<String>,
    pub opening_hour: u8,
    pub closing_hour: u8,
    /// Number of independent parallel calendars.
    pub max_concurrent_slots: u32,
    pub is_active: bool,
}

impl Salon {
    pub fn opens_on(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::MIN) + Duration::hours(i64::from(self.opening_hour))
    }

    pub fn closes_on(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::MIN) + Duration::hours(i64::from(self.closing_hour))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub salon_id: Ulid,
    pub name: Option<String>,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pricing {
    OneTime,
    Hourly,
}

impl Pricing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pricing::OneTime => "one_time",
            Pricing::Hourly => "hourly",
        }
    }
}

impl FromStr for Pricing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "one_time" | "onetime" | "fixed" => Ok(Pricing::OneTime),
            "hourly" => Ok(Pricing::Hourly),
            other => Err(format!("unknown pricing model: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubService {
    pub id: Ulid,
    pub service_id: Ulid,
    pub name: Option<String>,
    pub pricing: Pricing,
    /// Minor currency units; per hour when `pricing` is hourly.
    pub price: i64,
    pub is_active: bool,
}

impl SubService {
    pub fn price_for(&self, hours: u32) -> i64 {
        match self.pricing {
            Pricing::OneTime => self.price,
            Pricing::Hourly => self.price.saturating_mul(i64::from(hours)),
        }
    }
}

// ── Appointment ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    PendingReview,
    PendingCustomer,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::PendingReview => "pending_review",
            AppointmentStatus::PendingCustomer => "pending_customer",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }

    /// Only scheduled appointments hold a slot.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, AppointmentStatus::Scheduled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(AppointmentStatus::Scheduled),
            "pending_review" => Ok(AppointmentStatus::PendingReview),
            "pending_customer" => Ok(AppointmentStatus::PendingCustomer),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OffsiteStatus {
    Pending,
    Quoted,
    Accepted,
    Rejected,
    QuoteRejected,
}

impl OffsiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsiteStatus::Pending => "pending",
            OffsiteStatus::Quoted => "quoted",
            OffsiteStatus::Accepted => "accepted",
            OffsiteStatus::Rejected => "rejected",
            OffsiteStatus::QuoteRejected => "quote_rejected",
        }
    }
}

impl fmt::Display for OffsiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffsiteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OffsiteStatus::Pending),
            "quoted" => Ok(OffsiteStatus::Quoted),
            "accepted" => Ok(OffsiteStatus::Accepted),
            "rejected" => Ok(OffsiteStatus::Rejected),
            "quote_rejected" => Ok(OffsiteStatus::QuoteRejected),
            other => Err(format!("unknown offsite status: {other}")),
        }
    }
}

/// Off-site negotiation state. Present exactly when the booking is off-site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offsite {
    pub location: String,
    pub status: OffsiteStatus,
    /// Minor currency units.
    pub extra_charge: Option<i64>,
    pub response: Option<String>,
    pub responded_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub salon_id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub sub_service_id: Option<Ulid>,
    pub hours: u32,
    pub estimated_price: Option<i64>,
    pub start: NaiveDateTime,
    pub duration_minutes: u32,
    pub slot_number: u32,
    pub notes: Option<String>,
    pub status: AppointmentStatus,
    pub status_message: Option<String>,
    pub offsite: Option<Offsite>,
    pub created_at: NaiveDateTime,
}

impl Appointment {
    pub fn window(&self) -> Window {
        Window::starting_at(self.start, self.duration_minutes)
    }

    pub fn is_offsite(&self) -> bool {
        self.offsite.is_some()
    }

    pub fn offsite_status(&self) -> Option<OffsiteStatus> {
        self.offsite.as_ref().map(|o| o.status)
    }
}

// ── Per-salon state ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SalonState {
    pub salon: Salon,
    pub services: HashMap<Ulid, Service>,
    pub sub_services: HashMap<Ulid, SubService>,
    /// All appointments, sorted by `start`.
    pub appointments: Vec<Appointment>,
}

impl SalonState {
    pub fn new(salon: Salon) -> Self {
        Self {
            salon,
            services: HashMap::new(),
            sub_services: HashMap::new(),
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start; equal starts keep insertion order.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appointment.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn appointment_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Appointments starting on `date`, as a contiguous slice.
    pub fn on_date(&self, date: NaiveDate) -> &[Appointment] {
        let day_start = date.and_time(NaiveTime::MIN);
        let next_day = day_start + Duration::days(1);
        let lo = self.appointments.partition_point(|a| a.start < day_start);
        let hi = self.appointments.partition_point(|a| a.start < next_day);
        &self.appointments[lo..hi]
    }
}

// ── Transitions ──────────────────────────────────────────────────

/// Who is driving a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    /// Salon staff.
    Salon,
    /// The customer, identified so ownership can be checked.
    Customer(Ulid),
    /// Background sweeps.
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Complete { message: Option<String> },
    Cancel { message: Option<String> },
    AutoCancel,
    QuoteOffsite { extra_charge: i64, response: Option<String> },
    RejectOffsite { response: Option<String> },
    /// `slot_number` is the slot the engine re-validated at acceptance time.
    AcceptQuote { slot_number: u32 },
    RejectQuote,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Complete { .. } => "complete",
            Action::Cancel { .. } => "cancel",
            Action::AutoCancel => "auto_cancel",
            Action::QuoteOffsite { .. } => "quote_offsite",
            Action::RejectOffsite { .. } => "reject_offsite",
            Action::AcceptQuote { .. } => "accept_quote",
            Action::RejectQuote => "reject_quote",
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SalonCreated {
        salon: Salon,
    },
    SalonUpdated {
        salon: Salon,
    },
    ServiceCreated {
        service: Service,
    },
    SubServiceCreated {
        salon_id: Ulid,
        sub_service: SubService,
    },
    /// Also used by compaction to snapshot an appointment in its current state.
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentTransitioned {
        id: Ulid,
        salon_id: Ulid,
        actor: Actor,
        action: Action,
        at: NaiveDateTime,
    },
    /// One reaper sweep: `(salon_id, appointment ids)` cancelled together.
    OverdueSwept {
        swept: Vec<(Ulid, Vec<Ulid>)>,
        at: NaiveDateTime,
    },
}

// ── Requests and query results ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub salon_id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub sub_service_id: Option<Ulid>,
    pub hours: Option<u32>,
    pub start: NaiveDateTime,
    pub is_offsite: bool,
    pub offsite_location: Option<String>,
    pub notes: Option<String>,
}

impl BookingRequest {
    pub fn new(id: Ulid, salon_id: Ulid, customer_id: Ulid, service_id: Ulid, start: NaiveDateTime) -> Self {
        Self {
            id,
            salon_id,
            customer_id,
            service_id,
            sub_service_id: None,
            hours: None,
            start,
            is_offsite: false,
            offsite_location: None,
            notes: None,
        }
    }

    pub fn offsite(mut self, location: impl Into<String>) -> Self {
        self.is_offsite = true;
        self.offsite_location = Some(location.into());
        self
    }
}

/// A bookable start time and the slot it would land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotOffer {
    pub time: NaiveDateTime,
    pub slot_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityCheck {
    pub available: bool,
    pub slot_number: Option<u32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayReason {
    PastDate,
    NoSlots,
    Available,
}

impl DayReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayReason::PastDate => "past_date",
            DayReason::NoSlots => "no_slots",
            DayReason::Available => "available",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayAvailability {
    pub available: bool,
    pub total_slots: usize,
    pub reason: DayReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub salon_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub status: Option<AppointmentStatus>,
    pub offsite_status: Option<OffsiteStatus>,
    pub is_offsite: Option<bool>,
    /// 1-based; `None` means the first page.
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl AppointmentFilter {
    pub fn matches(&self, appt: &Appointment) -> bool {
        self.salon_id.is_none_or(|id| appt.salon_id == id)
            && self.customer_id.is_none_or(|id| appt.customer_id == id)
            && self.status.is_none_or(|s| appt.status == s)
            && self.is_offsite.is_none_or(|flag| appt.is_offsite() == flag)
            && self
                .offsite_status
                .is_none_or(|s| appt.offsite_status() == Some(s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentPage {
    pub appointments: Vec<Appointment>,
    pub total: usize,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: usize,
}

// ── Timestamps ───────────────────────────────────────────────────

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ACCEPTED_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
}
