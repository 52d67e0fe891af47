use chrono::{Duration, NaiveDateTime};

use crate::model::*;

use super::offsite;
use super::EngineError;

/// Outcome of a permitted transition, before it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub status: AppointmentStatus,
    pub offsite_status: Option<OffsiteStatus>,
}

/// Status message written by the reaper.
pub fn auto_cancel_message(start: &NaiveDateTime) -> String {
    format!(
        "Auto-cancelled - {OVERDUE_AFTER_HOURS}+ hours past scheduled time ({})",
        format_timestamp(start)
    )
}

/// Still scheduled more than a day after it was due to start.
pub fn is_overdue(appt: &Appointment, now: NaiveDateTime) -> bool {
    appt.status == AppointmentStatus::Scheduled
        && appt.start < now - Duration::hours(OVERDUE_AFTER_HOURS)
}

fn authorize(appt: &Appointment, actor: &Actor, action: &Action) -> Result<(), EngineError> {
    match (actor, action) {
        (Actor::System, Action::AutoCancel) => Ok(()),
        (
            Actor::Salon,
            Action::Complete { .. }
            | Action::Cancel { .. }
            | Action::QuoteOffsite { .. }
            | Action::RejectOffsite { .. },
        ) => Ok(()),
        (
            Actor::Customer(customer_id),
            Action::Cancel { .. } | Action::AcceptQuote { .. } | Action::RejectQuote,
        ) => {
            // Someone else's appointment looks like a missing one.
            if *customer_id == appt.customer_id {
                Ok(())
            } else {
                Err(EngineError::NotFound(appt.id))
            }
        }
        (actor, action) => Err(EngineError::Validation(format!(
            "{actor:?} may not {}",
            action.name()
        ))),
    }
}

/// Decide whether `actor` may perform `action` on `appt` and where it lands.
///
/// Pure: nothing is mutated. Every status change in the engine goes through
/// here, and off-site steps are delegated to the negotiation table.
pub fn plan(appt: &Appointment, actor: &Actor, action: &Action) -> Result<StateChange, EngineError> {
    authorize(appt, actor, action)?;

    match action {
        Action::Complete { .. } | Action::Cancel { .. } | Action::AutoCancel => {
            // An open off-site request may be withdrawn, but only a
            // scheduled appointment can be completed or swept.
            let allowed = match action {
                Action::Cancel { .. } => !appt.status.is_terminal(),
                _ => appt.status == AppointmentStatus::Scheduled,
            };
            if !allowed {
                return Err(EngineError::InvalidTransition {
                    from: appt.status,
                    action: action.name(),
                });
            }
            let status = match action {
                Action::Complete { .. } => AppointmentStatus::Completed,
                _ => AppointmentStatus::Cancelled,
            };
            Ok(StateChange {
                status,
                offsite_status: appt.offsite_status(),
            })
        }
        Action::QuoteOffsite { .. }
        | Action::RejectOffsite { .. }
        | Action::AcceptQuote { .. }
        | Action::RejectQuote => {
            let offsite = appt.offsite.as_ref().ok_or(EngineError::NotFound(appt.id))?;
            offsite::next(appt, offsite, action)
        }
    }
}

/// Write a planned change onto the appointment.
///
/// Infallible so WAL replay can reuse it; callers run [`plan`] first.
pub fn apply(appt: &mut Appointment, actor: &Actor, action: &Action, change: StateChange, at: NaiveDateTime) {
    appt.status = change.status;

    match action {
        Action::Complete { message } => {
            appt.status_message = message.clone();
        }
        Action::Cancel { message } => {
            appt.status_message = message.clone().or_else(|| match actor {
                Actor::Customer(_) => Some("Cancelled by customer".to_string()),
                _ => None,
            });
        }
        Action::AutoCancel => {
            appt.status_message = Some(auto_cancel_message(&appt.start));
        }
        Action::QuoteOffsite { extra_charge, response } => {
            if let Some(offsite) = appt.offsite.as_mut() {
                offsite.extra_charge = Some(*extra_charge);
                offsite.response = response.clone();
                offsite.responded_at = Some(at);
            }
        }
        Action::RejectOffsite { response } => {
            if let Some(offsite) = appt.offsite.as_mut() {
                offsite.response = response.clone();
                offsite.responded_at = Some(at);
            }
        }
        Action::AcceptQuote { slot_number } => {
            appt.slot_number = *slot_number;
        }
        Action::RejectQuote => {}
    }

    if let (Some(offsite), Some(status)) = (appt.offsite.as_mut(), change.offsite_status) {
        offsite.status = status;
    }
}

/// [`plan`] then [`apply`].
pub fn advance(
    appt: &mut Appointment,
    actor: &Actor,
    action: &Action,
    at: NaiveDateTime,
) -> Result<StateChange, EngineError> {
    let change = plan(appt, actor, action)?;
    apply(appt, actor, action, change, at);
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 20)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn scheduled() -> Appointment {
        Appointment {
            id: Ulid::new(),
            salon_id: Ulid::new(),
            customer_id: Ulid::new(),
            service_id: Ulid::new(),
            sub_service_id: None,
            hours: 1,
            estimated_price: None,
            start: at(10, 0),
            duration_minutes: 60,
            slot_number: 1,
            notes: None,
            status: AppointmentStatus::Scheduled,
            status_message: None,
            offsite: None,
            created_at: at(8, 0),
        }
    }

    fn offsite_pending() -> Appointment {
        Appointment {
            status: AppointmentStatus::PendingReview,
            offsite: Some(Offsite {
                location: "Victoria Island".into(),
                status: OffsiteStatus::Pending,
                extra_charge: None,
                response: None,
                responded_at: None,
            }),
            ..scheduled()
        }
    }

    #[test]
    fn salon_completes_scheduled() {
        let mut appt = scheduled();
        let action = Action::Complete { message: Some("done".into()) };
        advance(&mut appt, &Actor::Salon, &action, at(11, 0)).unwrap();
        assert_eq!(appt.status, AppointmentStatus::Completed);
        assert_eq!(appt.status_message.as_deref(), Some("done"));
    }

    #[test]
    fn terminal_states_are_final() {
        let mut appt = scheduled();
        advance(&mut appt, &Actor::Salon, &Action::Cancel { message: None }, at(9, 0)).unwrap();

        let before = appt.clone();
        for action in [
            Action::Cancel { message: None },
            Action::Complete { message: None },
        ] {
            let err = advance(&mut appt, &Actor::Salon, &action, at(9, 5)).unwrap_err();
            assert!(matches!(
                err,
                EngineError::InvalidTransition { from: AppointmentStatus::Cancelled, .. }
            ));
        }
        assert_eq!(appt, before);
    }

    #[test]
    fn customer_cancel_requires_ownership() {
        let mut appt = scheduled();
        let stranger = Actor::Customer(Ulid::new());
        let err = advance(&mut appt, &stranger, &Action::Cancel { message: None }, at(9, 0)).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(id) if id == appt.id));
        assert_eq!(appt.status, AppointmentStatus::Scheduled);

        let owner = Actor::Customer(appt.customer_id);
        advance(&mut appt, &owner, &Action::Cancel { message: None }, at(9, 0)).unwrap();
        assert_eq!(appt.status, AppointmentStatus::Cancelled);
        assert_eq!(appt.status_message.as_deref(), Some("Cancelled by customer"));
    }

    #[test]
    fn customers_cannot_complete_or_quote() {
        let appt = scheduled();
        let owner = Actor::Customer(appt.customer_id);
        assert!(matches!(
            plan(&appt, &owner, &Action::Complete { message: None }),
            Err(EngineError::Validation(_))
        ));
        let pending = offsite_pending();
        let owner = Actor::Customer(pending.customer_id);
        assert!(matches!(
            plan(&pending, &owner, &Action::QuoteOffsite { extra_charge: 1, response: None }),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn auto_cancel_is_reserved_for_the_system() {
        let appt = scheduled();
        assert!(plan(&appt, &Actor::Salon, &Action::AutoCancel).is_err());
        let mut appt = appt;
        advance(&mut appt, &Actor::System, &Action::AutoCancel, at(12, 0)).unwrap();
        assert_eq!(appt.status, AppointmentStatus::Cancelled);
        assert!(appt.status_message.unwrap().starts_with("Auto-cancelled"));
    }

    #[test]
    fn pending_review_cannot_be_completed() {
        let appt = offsite_pending();
        assert!(matches!(
            plan(&appt, &Actor::Salon, &Action::Complete { message: None }),
            Err(EngineError::InvalidTransition { from: AppointmentStatus::PendingReview, .. })
        ));
    }

    #[test]
    fn customer_withdraws_pending_review_request() {
        let mut appt = offsite_pending();
        let owner = Actor::Customer(appt.customer_id);
        advance(&mut appt, &owner, &Action::Cancel { message: None }, at(9, 0)).unwrap();
        assert_eq!(appt.status, AppointmentStatus::Cancelled);
        assert_eq!(appt.offsite_status(), Some(OffsiteStatus::Pending));
        assert_eq!(appt.status_message.as_deref(), Some("Cancelled by customer"));

        // The negotiation is over once the request is withdrawn.
        let quote = Action::QuoteOffsite { extra_charge: 100, response: None };
        assert!(matches!(
            plan(&appt, &Actor::Salon, &quote),
            Err(EngineError::InvalidTransition { from: AppointmentStatus::Cancelled, .. })
        ));
    }

    #[test]
    fn salon_cancels_pending_customer_request() {
        let mut appt = offsite_pending();
        let quote = Action::QuoteOffsite { extra_charge: 100, response: None };
        advance(&mut appt, &Actor::Salon, &quote, at(9, 0)).unwrap();

        let cancel = Action::Cancel { message: Some("Stylist unavailable".into()) };
        advance(&mut appt, &Actor::Salon, &cancel, at(9, 30)).unwrap();
        assert_eq!(appt.status, AppointmentStatus::Cancelled);
        assert_eq!(appt.offsite_status(), Some(OffsiteStatus::Quoted));
        assert_eq!(appt.status_message.as_deref(), Some("Stylist unavailable"));

        let owner = Actor::Customer(appt.customer_id);
        assert!(plan(&appt, &owner, &Action::AcceptQuote { slot_number: 1 }).is_err());
    }

    #[test]
    fn offsite_actions_on_onsite_booking_are_not_found() {
        let appt = scheduled();
        let err = plan(&appt, &Actor::Salon, &Action::QuoteOffsite { extra_charge: 10, response: None })
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn full_offsite_negotiation() {
        let mut appt = offsite_pending();
        let quote = Action::QuoteOffsite {
            extra_charge: 500_000,
            response: Some("travel fee".into()),
        };
        advance(&mut appt, &Actor::Salon, &quote, at(9, 0)).unwrap();
        assert_eq!(appt.status, AppointmentStatus::PendingCustomer);
        let offsite = appt.offsite.as_ref().unwrap();
        assert_eq!(offsite.status, OffsiteStatus::Quoted);
        assert_eq!(offsite.extra_charge, Some(500_000));
        assert_eq!(offsite.responded_at, Some(at(9, 0)));

        let owner = Actor::Customer(appt.customer_id);
        advance(&mut appt, &owner, &Action::AcceptQuote { slot_number: 2 }, at(9, 30)).unwrap();
        assert_eq!(appt.status, AppointmentStatus::Scheduled);
        assert_eq!(appt.offsite_status(), Some(OffsiteStatus::Accepted));
        assert_eq!(appt.slot_number, 2);

        // Accepted off-site bookings behave like any scheduled one.
        advance(&mut appt, &Actor::Salon, &Action::Complete { message: None }, at(12, 0)).unwrap();
        assert_eq!(appt.status, AppointmentStatus::Completed);
        assert_eq!(appt.offsite_status(), Some(OffsiteStatus::Accepted));
    }

    #[test]
    fn overdue_needs_more_than_a_day() {
        let appt = scheduled();
        assert!(!is_overdue(&appt, at(10, 0) + Duration::hours(24)));
        assert!(is_overdue(&appt, at(10, 0) + Duration::hours(25)));

        let done = Appointment { status: AppointmentStatus::Completed, ..scheduled() };
        assert!(!is_overdue(&done, at(10, 0) + Duration::hours(48)));
    }
}
