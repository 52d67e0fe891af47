use crate::model::*;

use super::lifecycle::StateChange;
use super::EngineError;

/// Off-site negotiation table.
///
/// Every off-site step moves the top-level status with it:
///
/// | offsite         | action         | offsite'        | status'          |
/// |-----------------|----------------|-----------------|------------------|
/// | pending         | quote          | quoted          | pending_customer |
/// | pending         | reject offsite | rejected        | cancelled        |
/// | quoted          | accept quote   | accepted        | scheduled        |
/// | quoted          | reject quote   | quote_rejected  | cancelled        |
///
/// `pending` always pairs with `pending_review` and `quoted` with
/// `pending_customer`; a mismatch is refused. A request cancelled outright
/// keeps its off-site status and takes no further steps here.
pub(super) fn next(
    appt: &Appointment,
    offsite: &Offsite,
    action: &Action,
) -> Result<StateChange, EngineError> {
    use AppointmentStatus::*;
    use OffsiteStatus::*;

    let refuse = || EngineError::InvalidTransition {
        from: appt.status,
        action: action.name(),
    };

    let (offsite_status, status) = match (offsite.status, appt.status, action) {
        (Pending, PendingReview, Action::QuoteOffsite { extra_charge, .. }) => {
            if *extra_charge < 0 {
                return Err(EngineError::Validation("extra charge cannot be negative".into()));
            }
            (Quoted, PendingCustomer)
        }
        (Pending, PendingReview, Action::RejectOffsite { .. }) => (Rejected, Cancelled),
        (Quoted, PendingCustomer, Action::AcceptQuote { .. }) => (Accepted, Scheduled),
        (Quoted, PendingCustomer, Action::RejectQuote) => (QuoteRejected, Cancelled),
        _ => return Err(refuse()),
    };

    Ok(StateChange {
        status,
        offsite_status: Some(offsite_status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn pending_offsite() -> Appointment {
        let start = NaiveDate::from_ymd_opt(2026, 10, 20)
            .unwrap()
            .and_hms_opt(11, 0, 0)
            .unwrap();
        Appointment {
            id: Ulid::new(),
            salon_id: Ulid::new(),
            customer_id: Ulid::new(),
            service_id: Ulid::new(),
            sub_service_id: None,
            hours: 1,
            estimated_price: None,
            start,
            duration_minutes: 60,
            slot_number: 1,
            notes: None,
            status: AppointmentStatus::PendingReview,
            status_message: None,
            offsite: Some(Offsite {
                location: "Lekki Phase 1".into(),
                status: OffsiteStatus::Pending,
                extra_charge: None,
                response: None,
                responded_at: None,
            }),
            created_at: start,
        }
    }

    fn step(appt: &Appointment, action: Action) -> Result<StateChange, EngineError> {
        next(appt, appt.offsite.as_ref().unwrap(), &action)
    }

    fn with_state(mut appt: Appointment, status: AppointmentStatus, offsite: OffsiteStatus) -> Appointment {
        appt.status = status;
        appt.offsite.as_mut().unwrap().status = offsite;
        appt
    }

    #[test]
    fn pending_can_be_quoted_or_rejected() {
        let appt = pending_offsite();
        let quoted = step(&appt, Action::QuoteOffsite { extra_charge: 500_000, response: None }).unwrap();
        assert_eq!(quoted.status, AppointmentStatus::PendingCustomer);
        assert_eq!(quoted.offsite_status, Some(OffsiteStatus::Quoted));

        let rejected = step(&appt, Action::RejectOffsite { response: Some("too far".into()) }).unwrap();
        assert_eq!(rejected.status, AppointmentStatus::Cancelled);
        assert_eq!(rejected.offsite_status, Some(OffsiteStatus::Rejected));
    }

    #[test]
    fn zero_charge_quote_is_allowed() {
        let appt = pending_offsite();
        assert!(step(&appt, Action::QuoteOffsite { extra_charge: 0, response: None }).is_ok());
    }

    #[test]
    fn negative_charge_is_a_validation_error() {
        let appt = pending_offsite();
        let err = step(&appt, Action::QuoteOffsite { extra_charge: -1, response: None }).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn quoted_can_be_accepted_or_rejected_by_customer() {
        let appt = with_state(pending_offsite(), AppointmentStatus::PendingCustomer, OffsiteStatus::Quoted);
        let accepted = step(&appt, Action::AcceptQuote { slot_number: 1 }).unwrap();
        assert_eq!(accepted.status, AppointmentStatus::Scheduled);
        assert_eq!(accepted.offsite_status, Some(OffsiteStatus::Accepted));

        let declined = step(&appt, Action::RejectQuote).unwrap();
        assert_eq!(declined.status, AppointmentStatus::Cancelled);
        assert_eq!(declined.offsite_status, Some(OffsiteStatus::QuoteRejected));
    }

    #[test]
    fn out_of_order_steps_are_refused() {
        let pending = pending_offsite();
        assert!(matches!(
            step(&pending, Action::AcceptQuote { slot_number: 1 }),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(step(&pending, Action::RejectQuote), Err(EngineError::InvalidTransition { .. })));

        let quoted = with_state(pending_offsite(), AppointmentStatus::PendingCustomer, OffsiteStatus::Quoted);
        assert!(matches!(
            step(&quoted, Action::QuoteOffsite { extra_charge: 100, response: None }),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            step(&quoted, Action::RejectOffsite { response: None }),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn terminal_offsite_states_accept_nothing() {
        let cases = [
            (AppointmentStatus::Cancelled, OffsiteStatus::Rejected),
            (AppointmentStatus::Cancelled, OffsiteStatus::QuoteRejected),
            (AppointmentStatus::Scheduled, OffsiteStatus::Accepted),
        ];
        for (status, offsite) in cases {
            let appt = with_state(pending_offsite(), status, offsite);
            for action in [
                Action::QuoteOffsite { extra_charge: 1, response: None },
                Action::RejectOffsite { response: None },
                Action::AcceptQuote { slot_number: 1 },
                Action::RejectQuote,
            ] {
                assert!(step(&appt, action).is_err(), "{status} / {offsite} accepted a step");
            }
        }
    }

    #[test]
    fn mismatched_pairing_is_refused() {
        // Off-site still pending but top-level status already moved on.
        let appt = with_state(pending_offsite(), AppointmentStatus::Scheduled, OffsiteStatus::Pending);
        assert!(matches!(
            step(&appt, Action::QuoteOffsite { extra_charge: 100, response: None }),
            Err(EngineError::InvalidTransition { .. })
        ));
    }
}
