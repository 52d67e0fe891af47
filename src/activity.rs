use async_trait::async_trait;
use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::*;
use crate::notify::CollaboratorError;

/// One audit line for the salon's activity feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub salon_id: Ulid,
    pub appointment_id: Ulid,
    pub actor: Actor,
    pub activity: &'static str,
    pub description: String,
    pub at: NaiveDateTime,
}

impl ActivityEntry {
    pub fn booked(appt: &Appointment, at: NaiveDateTime) -> Self {
        let description = match &appt.offsite {
            Some(offsite) => format!(
                "Off-site appointment requested at {} for {}",
                offsite.location,
                format_timestamp(&appt.start)
            ),
            None => format!(
                "Appointment booked for {} in slot {}",
                format_timestamp(&appt.start),
                appt.slot_number
            ),
        };
        Self {
            salon_id: appt.salon_id,
            appointment_id: appt.id,
            actor: Actor::Customer(appt.customer_id),
            activity: "appointment_created",
            description,
            at,
        }
    }

    /// Describe a committed transition; `appt` is the state after it.
    pub fn transitioned(appt: &Appointment, actor: &Actor, action: &Action, at: NaiveDateTime) -> Self {
        let when = format_timestamp(&appt.start);
        let description = match action {
            Action::Complete { .. } => format!("Appointment for {when} completed"),
            Action::Cancel { .. } => match actor {
                Actor::Customer(_) => format!("Appointment for {when} cancelled by customer"),
                _ => format!("Appointment for {when} cancelled by salon"),
            },
            Action::AutoCancel => format!(
                "Appointment for {when} auto-cancelled after {OVERDUE_AFTER_HOURS} hours overdue"
            ),
            Action::QuoteOffsite { extra_charge, .. } => {
                format!("Off-site request quoted with extra charge {extra_charge}")
            }
            Action::RejectOffsite { .. } => "Off-site request rejected".to_string(),
            Action::AcceptQuote { slot_number } => {
                format!("Off-site quote accepted, scheduled for {when} in slot {slot_number}")
            }
            Action::RejectQuote => "Off-site quote declined by customer".to_string(),
        };
        Self {
            salon_id: appt.salon_id,
            appointment_id: appt.id,
            actor: *actor,
            activity: action.name(),
            description,
            at,
        }
    }
}

#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn record(&self, entry: &ActivityEntry) -> Result<(), CollaboratorError>;
}

/// Default sink: structured log lines under `chairtime::activity`.
#[derive(Debug, Default)]
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn record(&self, entry: &ActivityEntry) -> Result<(), CollaboratorError> {
        tracing::info!(
            target: "chairtime::activity",
            salon_id = %entry.salon_id,
            appointment_id = %entry.appointment_id,
            actor = ?entry.actor,
            activity = entry.activity,
            "{}",
            entry.description
        );
        Ok(())
    }
}
