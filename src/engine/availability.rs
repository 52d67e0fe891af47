use std::collections::BTreeMap;
use std::iter::FusedIterator;

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::limits::*;
use crate::model::*;

use super::allocator::find_slot;
use super::EngineError;

// ── Day view ──────────────────────────────────────────────────────

/// Bookable start times across one day, first-fit slot attached.
///
/// Candidates start at opening time and step by [`SLOT_GRANULARITY_MINUTES`]
/// while the appointment would still end by closing time. Cloning restarts
/// from the clone's position; nothing is cached between calls.
#[derive(Debug, Clone)]
pub struct DaySlots<'a> {
    day: &'a [Appointment],
    max_slots: u32,
    duration_minutes: u32,
    next: NaiveDateTime,
    last_start: NaiveDateTime,
}

impl<'a> DaySlots<'a> {
    fn new(state: &'a SalonState, date: NaiveDate, duration_minutes: u32) -> Self {
        let salon = &state.salon;
        Self {
            day: state.on_date(date),
            max_slots: salon.max_concurrent_slots,
            duration_minutes,
            next: salon.opens_on(date),
            last_start: salon.closes_on(date) - Duration::minutes(i64::from(duration_minutes)),
        }
    }
}

impl Iterator for DaySlots<'_> {
    type Item = SlotOffer;

    fn next(&mut self) -> Option<SlotOffer> {
        while self.next <= self.last_start {
            let time = self.next;
            self.next += Duration::minutes(SLOT_GRANULARITY_MINUTES);
            let window = Window::starting_at(time, self.duration_minutes);
            if let Some(slot_number) = find_slot(self.day, &window, self.max_slots) {
                return Some(SlotOffer { time, slot_number });
            }
        }
        None
    }
}

impl FusedIterator for DaySlots<'_> {}

pub fn day_slots(
    state: &SalonState,
    date: NaiveDate,
    duration_minutes: u32,
) -> Result<DaySlots<'_>, EngineError> {
    if duration_minutes == 0 {
        return Err(EngineError::Validation("service duration must be positive".into()));
    }
    Ok(DaySlots::new(state, date, duration_minutes))
}

// ── Month view ────────────────────────────────────────────────────

pub fn validate_month(year: i32, month: u32) -> Result<(), EngineError> {
    if !(1..=12).contains(&month) {
        return Err(EngineError::Validation("month must be between 1 and 12".into()));
    }
    if !(MIN_CALENDAR_YEAR..=MAX_CALENDAR_YEAR).contains(&year) {
        return Err(EngineError::Validation(format!(
            "year must be between {MIN_CALENDAR_YEAR} and {MAX_CALENDAR_YEAR}"
        )));
    }
    Ok(())
}

/// Per-day summary for a calendar month.
///
/// Days before `today` are reported as past without being computed.
pub fn month_availability(
    state: &SalonState,
    year: i32,
    month: u32,
    duration_minutes: u32,
    today: NaiveDate,
) -> Result<BTreeMap<NaiveDate, DayAvailability>, EngineError> {
    validate_month(year, month)?;
    if duration_minutes == 0 {
        return Err(EngineError::Validation("service duration must be positive".into()));
    }

    let mut days = BTreeMap::new();
    // Day 31 of a 30-day month simply doesn't exist.
    for date in (1..=31).filter_map(|day| NaiveDate::from_ymd_opt(year, month, day)) {
        let summary = if date < today {
            DayAvailability {
                available: false,
                total_slots: 0,
                reason: DayReason::PastDate,
            }
        } else {
            let total_slots = DaySlots::new(state, date, duration_minutes).count();
            DayAvailability {
                available: total_slots > 0,
                total_slots,
                reason: if total_slots > 0 {
                    DayReason::Available
                } else {
                    DayReason::NoSlots
                },
            }
        };
        days.insert(date, summary);
    }
    Ok(days)
}
