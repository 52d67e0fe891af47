use async_trait::async_trait;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

/// A sink failed. Collaborator errors are logged and never undo a transition.
#[derive(Debug, Error)]
#[error("collaborator failed: {0}")]
pub struct CollaboratorError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    #[serde(rename = "booking_created")]
    Booked,
    Completed,
    #[serde(rename = "booking_cancelled_by_salon")]
    CancelledBySalon,
    #[serde(rename = "booking_cancelled_by_customer")]
    CancelledByCustomer,
    AutoCancelled,
    OffsiteQuoted,
    OffsiteRejected,
    QuoteAccepted,
    QuoteRejected,
}

impl NotificationKind {
    pub fn for_action(actor: &Actor, action: &Action) -> Self {
        match action {
            Action::Complete { .. } => NotificationKind::Completed,
            Action::Cancel { .. } => match actor {
                Actor::Customer(_) => NotificationKind::CancelledByCustomer,
                _ => NotificationKind::CancelledBySalon,
            },
            Action::AutoCancel => NotificationKind::AutoCancelled,
            Action::QuoteOffsite { .. } => NotificationKind::OffsiteQuoted,
            Action::RejectOffsite { .. } => NotificationKind::OffsiteRejected,
            Action::AcceptQuote { .. } => NotificationKind::QuoteAccepted,
            Action::RejectQuote => NotificationKind::QuoteRejected,
        }
    }
}

/// Structured event emitted after a committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub salon_id: Ulid,
    pub appointment_id: Ulid,
    pub customer_id: Ulid,
    pub status: &'static str,
    pub offsite_status: Option<&'static str>,
    pub extra_charge: Option<i64>,
    pub slot_number: u32,
    pub appointment_date: String,
    pub at: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, appt: &Appointment, at: NaiveDateTime) -> Self {
        Self {
            kind,
            salon_id: appt.salon_id,
            appointment_id: appt.id,
            customer_id: appt.customer_id,
            status: appt.status.as_str(),
            offsite_status: appt.offsite_status().map(|s| s.as_str()),
            extra_charge: appt.offsite.as_ref().and_then(|o| o.extra_charge),
            slot_number: appt.slot_number,
            appointment_date: format_timestamp(&appt.start),
            at: format_timestamp(&at),
        }
    }

    /// JSON body for delivery channels.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), CollaboratorError>;
}

/// In-process broadcast hub, one channel per salon.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a salon's notifications. Creates the channel if needed.
    pub fn subscribe(&self, salon_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(salon_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        if let Some(sender) = self.channels.get(&notification.salon_id) {
            let _ = sender.send(notification.clone());
        }
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify(&self, notification: &Notification) -> Result<(), CollaboratorError> {
        self.send(notification);
        Ok(())
    }
}
