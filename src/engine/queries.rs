use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::allocator::{allocate, now};
use super::availability::{self, day_slots};
use super::{Engine, EngineError, SharedSalonState};

fn service_duration(state: &SalonState, service_id: &Ulid) -> Result<u32, EngineError> {
    state
        .services
        .get(service_id)
        .map(|s| s.duration_minutes)
        .ok_or(EngineError::NotFound(*service_id))
}

impl Engine {
    async fn active_salon(&self, salon_id: Ulid) -> Result<SharedSalonState, EngineError> {
        let state = self
            .get_salon(&salon_id)
            .ok_or(EngineError::NotFound(salon_id))?;
        if !state.read().await.salon.is_active {
            return Err(EngineError::NotFound(salon_id));
        }
        Ok(state)
    }

    /// Would a booking at `start` succeed right now, and in which slot.
    ///
    /// Hours and capacity problems are reported in `reason`, not as errors.
    pub async fn check_availability(
        &self,
        salon_id: Ulid,
        service_id: Ulid,
        start: NaiveDateTime,
    ) -> Result<AvailabilityCheck, EngineError> {
        let state = self.active_salon(salon_id).await?;
        let guard = state.read().await;
        let duration = service_duration(&guard, &service_id)?;

        Ok(match allocate(&guard, start, duration) {
            Ok((_, slot)) => AvailabilityCheck {
                available: true,
                slot_number: Some(slot),
                reason: None,
            },
            Err(e @ (EngineError::OutOfHours(_) | EngineError::SlotUnavailable(_))) => {
                AvailabilityCheck {
                    available: false,
                    slot_number: None,
                    reason: Some(e.to_string()),
                }
            }
            Err(e) => return Err(e),
        })
    }

    pub async fn day_availability(
        &self,
        salon_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotOffer>, EngineError> {
        let state = self.active_salon(salon_id).await?;
        let guard = state.read().await;
        let duration = service_duration(&guard, &service_id)?;
        Ok(day_slots(&guard, date, duration)?.collect())
    }

    pub async fn month_availability(
        &self,
        salon_id: Ulid,
        service_id: Ulid,
        year: i32,
        month: u32,
    ) -> Result<BTreeMap<NaiveDate, DayAvailability>, EngineError> {
        availability::validate_month(year, month)?;
        let state = self.active_salon(salon_id).await?;
        let guard = state.read().await;
        let duration = service_duration(&guard, &service_id)?;
        availability::month_availability(&guard, year, month, duration, now().date())
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let salon_id = self.salon_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let state = self.get_salon(&salon_id).ok_or(EngineError::NotFound(salon_id))?;
        let guard = state.read().await;
        guard.appointment(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Filtered listing, newest appointment date first.
    pub async fn list_appointments(&self, filter: &AppointmentFilter) -> Result<AppointmentPage, EngineError> {
        let page = filter.page.unwrap_or(1);
        if page == 0 {
            return Err(EngineError::Validation("page must be at least 1".into()));
        }
        let per_page = filter.per_page.unwrap_or(DEFAULT_PAGE_SIZE);
        if per_page == 0 || per_page > MAX_PAGE_SIZE {
            return Err(EngineError::Validation(format!(
                "per_page must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let states: Vec<SharedSalonState> = match filter.salon_id {
            Some(id) => self.get_salon(&id).into_iter().collect(),
            None => self.salons.iter().map(|e| e.value().clone()).collect(),
        };

        let mut matched = Vec::new();
        for state in states {
            let guard = state.read().await;
            matched.extend(guard.appointments.iter().filter(|a| filter.matches(a)).cloned());
        }
        matched.sort_by(|a, b| b.start.cmp(&a.start).then(b.id.cmp(&a.id)));

        let total = matched.len();
        let skip = (page as usize - 1).saturating_mul(per_page as usize);
        let appointments: Vec<Appointment> =
            matched.into_iter().skip(skip).take(per_page as usize).collect();

        Ok(AppointmentPage {
            appointments,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page as usize),
        })
    }
}
