use chrono::{NaiveDateTime, Timelike, Utc};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Current instant, as naive UTC wall-clock time.
pub(crate) fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub(crate) fn validate_text(field: &'static str, value: Option<&str>) -> Result<(), EngineError> {
    if let Some(v) = value
        && v.len() > MAX_TEXT_LEN
    {
        return Err(EngineError::Validation(format!("{field} too long")));
    }
    Ok(())
}

/// Build the booking window and check it sits inside the salon's opening hours.
///
/// The start hour must fall in `[opening_hour, closing_hour)` and the window
/// may end exactly at closing time but not after it.
pub fn validate_operating_hours(
    salon: &Salon,
    start: NaiveDateTime,
    duration_minutes: u32,
) -> Result<Window, EngineError> {
    if duration_minutes == 0 {
        return Err(EngineError::Validation("service duration must be positive".into()));
    }
    if duration_minutes > MAX_SERVICE_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("service duration too long"));
    }

    let hour = start.hour();
    if hour < u32::from(salon.opening_hour) || hour >= u32::from(salon.closing_hour) {
        return Err(EngineError::OutOfHours(format!(
            "appointment time must be between {}:00 and {}:00",
            salon.opening_hour, salon.closing_hour
        )));
    }

    let window = Window::starting_at(start, duration_minutes);
    if window.end > salon.closes_on(start.date()) {
        return Err(EngineError::OutOfHours(format!(
            "appointment would extend beyond closing time ({}:00)",
            salon.closing_hour
        )));
    }
    Ok(window)
}

fn slot_is_free(day: &[Appointment], window: &Window, slot: u32) -> bool {
    let date = window.date();
    !day.iter().any(|existing| {
        existing.slot_number == slot
            && existing.status.occupies_slot()
            && existing.start.date() == date
            && existing.window().overlaps(window)
    })
}

/// Greedy first-fit: the lowest-numbered slot with no overlapping active booking.
///
/// `day` is the salon's appointments for the window's date. Returns `None`
/// when every slot conflicts.
pub fn find_slot(day: &[Appointment], window: &Window, max_slots: u32) -> Option<u32> {
    (1..=max_slots).find(|&slot| slot_is_free(day, window, slot))
}

/// Like [`find_slot`], but keeps `preferred` when it is still free.
pub fn find_slot_preferring(
    day: &[Appointment],
    window: &Window,
    max_slots: u32,
    preferred: u32,
) -> Option<u32> {
    if (1..=max_slots).contains(&preferred) && slot_is_free(day, window, preferred) {
        return Some(preferred);
    }
    find_slot(day, window, max_slots)
}

/// Hours check followed by slot allocation.
pub fn allocate(
    state: &SalonState,
    start: NaiveDateTime,
    duration_minutes: u32,
) -> Result<(Window, u32), EngineError> {
    let window = validate_operating_hours(&state.salon, start, duration_minutes)?;
    let max_slots = state.salon.max_concurrent_slots;
    let slot = find_slot(state.on_date(window.date()), &window, max_slots)
        .ok_or(EngineError::SlotUnavailable(max_slots))?;
    Ok((window, slot))
}
