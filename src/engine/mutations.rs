use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::activity::ActivityEntry;
use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::observability;

use super::allocator::{allocate, find_slot_preferring, now, validate_operating_hours, validate_text};
use super::lifecycle;
use super::{apply_to_salon, Engine, EngineError, SharedSalonState, WalCommand};

fn validate_name(name: Option<&str>, what: &'static str) -> Result<(), EngineError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_salon_settings(opening_hour: u8, closing_hour: u8, max_slots: u32) -> Result<(), EngineError> {
    if opening_hour > 23 || closing_hour > 23 {
        return Err(EngineError::Validation("hours must be between 0 and 23".into()));
    }
    if opening_hour >= closing_hour {
        return Err(EngineError::Validation(
            "opening hour must be before closing hour".into(),
        ));
    }
    if max_slots == 0 {
        return Err(EngineError::Validation("max_concurrent_slots must be at least 1".into()));
    }
    if max_slots > MAX_CONCURRENT_SLOTS {
        return Err(EngineError::LimitExceeded("too many concurrent slots"));
    }
    Ok(())
}

fn record_error<T>(op: &'static str, result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(e) = &result {
        metrics::counter!(observability::ENGINE_ERRORS_TOTAL, "op" => op, "kind" => e.kind())
            .increment(1);
        if let EngineError::SlotUnavailable(_) = e {
            metrics::counter!(observability::SLOT_REJECTIONS_TOTAL).increment(1);
        }
    }
    result
}

/// Keep the booked slot if it is still free, else first-fit.
fn revalidate_slot(state: &SalonState, appt: &Appointment) -> Result<u32, EngineError> {
    let window = validate_operating_hours(&state.salon, appt.start, appt.duration_minutes)?;
    let max_slots = state.salon.max_concurrent_slots;
    find_slot_preferring(state.on_date(window.date()), &window, max_slots, appt.slot_number)
        .ok_or(EngineError::SlotUnavailable(max_slots))
}

impl Engine {
    // ── Catalogue ────────────────────────────────────────────────

    pub async fn create_salon(
        &self,
        id: Ulid,
        name: Option<String>,
        opening_hour: u8,
        closing_hour: u8,
        max_concurrent_slots: u32,
    ) -> Result<(), EngineError> {
        validate_name(name.as_deref(), "salon name too long")?;
        validate_salon_settings(opening_hour, closing_hour, max_concurrent_slots)?;

        // Held until the salon is in the map, so neither a duplicate create
        // nor a compaction snapshot can run in between.
        let _catalogue = self.catalogue.lock().await;
        if self.salons.len() >= MAX_SALONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many salons"));
        }
        if self.salons.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let salon = Salon {
            id,
            name,
            opening_hour,
            closing_hour,
            max_concurrent_slots,
            is_active: true,
        };
        let event = Event::SalonCreated { salon: salon.clone() };
        self.wal_append(&event).await?;
        self.salons.insert(id, Arc::new(RwLock::new(SalonState::new(salon))));
        info!(salon_id = %id, "salon registered");
        Ok(())
    }

    /// Replace a salon's hours, slot count and active flag.
    ///
    /// The slot count may not drop below the slot of any appointment that
    /// still holds one, whether or not it has started.
    pub async fn update_salon(
        &self,
        id: Ulid,
        opening_hour: u8,
        closing_hour: u8,
        max_concurrent_slots: u32,
        is_active: bool,
    ) -> Result<(), EngineError> {
        validate_salon_settings(opening_hour, closing_hour, max_concurrent_slots)?;
        let state = self.get_salon(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = state.write().await;

        if let Some(stranded) = guard
            .appointments
            .iter()
            .find(|a| a.status.occupies_slot() && a.slot_number > max_concurrent_slots)
        {
            return Err(EngineError::Validation(format!(
                "appointment {} is booked in slot {}",
                stranded.id, stranded.slot_number
            )));
        }

        let salon = Salon {
            opening_hour,
            closing_hour,
            max_concurrent_slots,
            is_active,
            ..guard.salon.clone()
        };
        let event = Event::SalonUpdated { salon };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn register_service(
        &self,
        id: Ulid,
        salon_id: Ulid,
        name: Option<String>,
        duration_minutes: u32,
    ) -> Result<(), EngineError> {
        validate_name(name.as_deref(), "service name too long")?;
        if duration_minutes == 0 {
            return Err(EngineError::Validation("service duration must be positive".into()));
        }
        if duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("service duration too long"));
        }
        let state = self
            .get_salon(&salon_id)
            .ok_or(EngineError::NotFound(salon_id))?;
        let mut guard = state.write().await;
        if guard.services.len() >= MAX_SERVICES_PER_SALON {
            return Err(EngineError::LimitExceeded("too many services on salon"));
        }

        let event = Event::ServiceCreated {
            service: Service {
                id,
                salon_id,
                name,
                duration_minutes,
            },
        };
        self.persist_new_entity(&mut guard, id, &event).await
    }

    pub async fn register_sub_service(
        &self,
        id: Ulid,
        service_id: Ulid,
        name: Option<String>,
        pricing: Pricing,
        price: i64,
    ) -> Result<(), EngineError> {
        validate_name(name.as_deref(), "sub-service name too long")?;
        if price < 0 {
            return Err(EngineError::Validation("price cannot be negative".into()));
        }
        let salon_id = self
            .salon_for_entity(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let state = self
            .get_salon(&salon_id)
            .ok_or(EngineError::NotFound(salon_id))?;
        let mut guard = state.write().await;
        if !guard.services.contains_key(&service_id) {
            return Err(EngineError::NotFound(service_id));
        }
        let siblings = guard
            .sub_services
            .values()
            .filter(|s| s.service_id == service_id)
            .count();
        if siblings >= MAX_SUB_SERVICES_PER_SERVICE {
            return Err(EngineError::LimitExceeded("too many sub-services on service"));
        }

        let event = Event::SubServiceCreated {
            salon_id,
            sub_service: SubService {
                id,
                service_id,
                name,
                pricing,
                price,
                is_active: true,
            },
        };
        self.persist_new_entity(&mut guard, id, &event).await
    }

    // ── Booking ──────────────────────────────────────────────────

    /// Validate a booking, assign a slot and persist it.
    ///
    /// The salon write lock is held from allocation until the event is
    /// applied, so two requests can never both win the same slot window.
    /// Off-site requests go through the same hours and slot check but land in
    /// `pending_review`, where they don't hold the slot yet.
    pub async fn book_appointment(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        let result = self.book_appointment_inner(req).await;
        if result.is_ok() {
            metrics::counter!(observability::APPOINTMENTS_BOOKED_TOTAL).increment(1);
        }
        record_error("book", result)
    }

    async fn book_appointment_inner(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        validate_text("notes", req.notes.as_deref())?;
        validate_text("offsite location", req.offsite_location.as_deref())?;
        let offsite_location = if req.is_offsite {
            match req.offsite_location.as_deref().map(str::trim) {
                Some(loc) if !loc.is_empty() => Some(loc.to_string()),
                _ => {
                    return Err(EngineError::Validation(
                        "off-site bookings need a location".into(),
                    ));
                }
            }
        } else {
            None
        };
        let hours = req.hours.unwrap_or(1);
        if hours == 0 {
            return Err(EngineError::Validation("hours must be at least 1".into()));
        }
        if hours > MAX_BOOKING_HOURS {
            return Err(EngineError::LimitExceeded("too many hours"));
        }

        let state = self
            .get_salon(&req.salon_id)
            .ok_or(EngineError::NotFound(req.salon_id))?;
        let mut guard = state.write().await;
        if !guard.salon.is_active {
            return Err(EngineError::NotFound(req.salon_id));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_SALON {
            return Err(EngineError::LimitExceeded("too many appointments on salon"));
        }

        let service = match guard.services.get(&req.service_id) {
            Some(service) => service.clone(),
            None if self.entity_to_salon.contains_key(&req.service_id) => {
                return Err(EngineError::Validation(
                    "service does not belong to this salon".into(),
                ));
            }
            None => return Err(EngineError::NotFound(req.service_id)),
        };

        let estimated_price = match req.sub_service_id {
            Some(sub_id) => {
                let sub = guard
                    .sub_services
                    .get(&sub_id)
                    .ok_or(EngineError::NotFound(sub_id))?;
                if sub.service_id != service.id {
                    return Err(EngineError::Validation(
                        "sub-service does not belong to this service".into(),
                    ));
                }
                if !sub.is_active {
                    return Err(EngineError::Validation("sub-service is not active".into()));
                }
                Some(sub.price_for(hours))
            }
            None => None,
        };

        let (window, slot_number) = allocate(&guard, req.start, service.duration_minutes)?;

        let (status, offsite) = match offsite_location {
            Some(location) => (
                AppointmentStatus::PendingReview,
                Some(Offsite {
                    location,
                    status: OffsiteStatus::Pending,
                    extra_charge: None,
                    response: None,
                    responded_at: None,
                }),
            ),
            None => (AppointmentStatus::Scheduled, None),
        };

        let created_at = now();
        let appointment = Appointment {
            id: req.id,
            salon_id: req.salon_id,
            customer_id: req.customer_id,
            service_id: service.id,
            sub_service_id: req.sub_service_id,
            hours,
            estimated_price,
            start: window.start,
            duration_minutes: service.duration_minutes,
            slot_number,
            notes: req.notes,
            status,
            status_message: None,
            offsite,
            created_at,
        };

        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_new_entity(&mut guard, appointment.id, &event).await?;
        drop(guard);

        debug!(
            appointment_id = %appointment.id,
            salon_id = %appointment.salon_id,
            slot = slot_number,
            status = %appointment.status,
            "appointment booked"
        );
        self.announce(
            Notification::new(NotificationKind::Booked, &appointment, created_at),
            ActivityEntry::booked(&appointment, created_at),
        )
        .await;
        Ok(appointment)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Run one lifecycle action: plan, persist, apply, announce.
    async fn transition(
        &self,
        appointment_id: Ulid,
        actor: Actor,
        action: Action,
    ) -> Result<Appointment, EngineError> {
        let name = action.name();
        let result = self.transition_inner(appointment_id, actor, action).await;
        if result.is_ok() {
            metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => name).increment(1);
        }
        record_error(name, result)
    }

    async fn transition_inner(
        &self,
        appointment_id: Ulid,
        actor: Actor,
        action: Action,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.resolve_appointment_write(&appointment_id).await?;
        let salon_id = guard.salon.id;

        let action = match action {
            // Pending bookings don't hold a slot, so the window is checked again.
            Action::AcceptQuote { .. } => {
                let appt = guard
                    .appointment(&appointment_id)
                    .ok_or(EngineError::NotFound(appointment_id))?;
                lifecycle::plan(appt, &actor, &Action::AcceptQuote { slot_number: appt.slot_number })?;
                let slot_number = revalidate_slot(&guard, appt)?;
                Action::AcceptQuote { slot_number }
            }
            other => other,
        };

        {
            let appt = guard
                .appointment(&appointment_id)
                .ok_or(EngineError::NotFound(appointment_id))?;
            lifecycle::plan(appt, &actor, &action)?;
        }

        let at = now();
        let event = Event::AppointmentTransitioned {
            id: appointment_id,
            salon_id,
            actor,
            action: action.clone(),
            at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .appointment(&appointment_id)
            .cloned()
            .ok_or(EngineError::NotFound(appointment_id))?;
        drop(guard);

        debug!(
            appointment_id = %appointment_id,
            action = action.name(),
            status = %updated.status,
            "appointment transitioned"
        );
        self.announce(
            Notification::new(NotificationKind::for_action(&actor, &action), &updated, at),
            ActivityEntry::transitioned(&updated, &actor, &action, at),
        )
        .await;
        Ok(updated)
    }

    pub async fn complete_appointment(
        &self,
        id: Ulid,
        message: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_text("message", message.as_deref())?;
        self.transition(id, Actor::Salon, Action::Complete { message }).await
    }

    /// Cancel as salon staff or as the owning customer.
    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        actor: Actor,
        message: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_text("message", message.as_deref())?;
        self.transition(id, actor, Action::Cancel { message }).await
    }

    pub async fn quote_offsite(
        &self,
        id: Ulid,
        extra_charge: i64,
        response: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_text("response", response.as_deref())?;
        self.transition(id, Actor::Salon, Action::QuoteOffsite { extra_charge, response })
            .await
    }

    pub async fn reject_offsite(
        &self,
        id: Ulid,
        response: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_text("response", response.as_deref())?;
        self.transition(id, Actor::Salon, Action::RejectOffsite { response })
            .await
    }

    /// The slot is re-checked; `slot_number` on the action is filled in by the engine.
    pub async fn accept_quote(&self, id: Ulid, customer_id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Actor::Customer(customer_id), Action::AcceptQuote { slot_number: 0 })
            .await
    }

    pub async fn reject_quote(&self, id: Ulid, customer_id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Actor::Customer(customer_id), Action::RejectQuote)
            .await
    }

    // ── Housekeeping ─────────────────────────────────────────────

    /// Cancel every appointment still scheduled more than a day past its start.
    ///
    /// All matches, across the requested salon or all salons, are committed as
    /// one WAL record. Returns the number cancelled.
    pub async fn sweep_overdue(
        &self,
        salon_id: Option<Ulid>,
        now: NaiveDateTime,
    ) -> Result<usize, EngineError> {
        let mut salon_ids: Vec<Ulid> = match salon_id {
            Some(id) => {
                if !self.salons.contains_key(&id) {
                    return Err(EngineError::NotFound(id));
                }
                vec![id]
            }
            None => self.salons.iter().map(|e| *e.key()).collect(),
        };
        // Sorted lock order keeps concurrent sweeps from deadlocking.
        salon_ids.sort();

        let mut guards = Vec::with_capacity(salon_ids.len());
        for id in &salon_ids {
            let state: SharedSalonState = self.get_salon(id).ok_or(EngineError::NotFound(*id))?;
            guards.push(state.write_owned().await);
        }

        let swept: Vec<(Ulid, Vec<Ulid>)> = guards
            .iter()
            .filter_map(|guard| {
                let ids: Vec<Ulid> = guard
                    .appointments
                    .iter()
                    .filter(|a| lifecycle::is_overdue(a, now))
                    .map(|a| a.id)
                    .collect();
                (!ids.is_empty()).then_some((guard.salon.id, ids))
            })
            .collect();
        let count: usize = swept.iter().map(|(_, ids)| ids.len()).sum();
        if count == 0 {
            return Ok(0);
        }

        let event = Event::OverdueSwept {
            swept: swept.clone(),
            at: now,
        };
        self.wal_append(&event).await?;
        for guard in guards.iter_mut() {
            apply_to_salon(guard, &event, &self.entity_to_salon);
        }

        let cancelled: Vec<Appointment> = swept
            .iter()
            .flat_map(|(sid, ids)| {
                let guard = guards.iter().find(|g| g.salon.id == *sid);
                ids.iter()
                    .filter_map(move |id| guard.and_then(|g| g.appointment(id)).cloned())
            })
            .collect();
        drop(guards);

        metrics::counter!(observability::APPOINTMENTS_REAPED_TOTAL).increment(count as u64);
        info!(count, "auto-cancelled overdue appointments");
        for appt in &cancelled {
            self.announce(
                Notification::new(NotificationKind::AutoCancelled, appt, now),
                ActivityEntry::transitioned(appt, &Actor::System, &Action::AutoCancel, now),
            )
            .await;
        }
        Ok(count)
    }

    /// Rewrite the WAL with the minimal events that recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No salon can appear between listing and the swap.
        let _catalogue = self.catalogue.lock().await;
        let mut salon_ids: Vec<Ulid> = self.salons.iter().map(|e| *e.key()).collect();
        salon_ids.sort();

        // Read locks stay held until the swap so no write slips in between
        // the snapshot and the new file.
        let mut guards = Vec::with_capacity(salon_ids.len());
        for id in &salon_ids {
            if let Some(state) = self.get_salon(id) {
                guards.push(state.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::SalonCreated {
                salon: guard.salon.clone(),
            });
            events.extend(guard.services.values().map(|service| Event::ServiceCreated {
                service: service.clone(),
            }));
            events.extend(guard.sub_services.values().map(|sub| Event::SubServiceCreated {
                salon_id: guard.salon.id,
                sub_service: sub.clone(),
            }));
            // Appointments are snapshotted in their current state.
            events.extend(guard.appointments.iter().map(|appt| Event::AppointmentBooked {
                appointment: appt.clone(),
            }));
        }
        let snapshot_len = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);

        info!(events = snapshot_len, "WAL compacted");
        Ok(())
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
