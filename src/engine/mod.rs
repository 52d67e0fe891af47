mod allocator;
mod availability;
mod error;
mod lifecycle;
mod mutations;
mod offsite;
mod queries;

pub use allocator::{allocate, find_slot, find_slot_preferring, validate_operating_hours};
pub use availability::{day_slots, month_availability, DaySlots};
pub use error::EngineError;
pub use lifecycle::{auto_cancel_message, is_overdue, StateChange};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::activity::{ActivityEntry, ActivityLog, TracingActivityLog};
use crate::model::*;
use crate::notify::{Notification, Notifier, NotifyHub};
use crate::observability;
use crate::wal::Wal;

pub type SharedSalonState = Arc<RwLock<SalonState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Compaction must see every append queued before it.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        warn!(batch = batch.len(), "WAL flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't ride
    // along with the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Collaborators ─────────────────────────────────────────

/// Outbound sinks. Both are best-effort: a failure is logged, never rolled back.
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub activity: Arc<dyn ActivityLog>,
}

impl Collaborators {
    pub fn new(notifier: Arc<dyn Notifier>, activity: Arc<dyn ActivityLog>) -> Self {
        Self { notifier, activity }
    }

    pub fn with_hub(hub: Arc<NotifyHub>) -> Self {
        Self::new(hub, Arc::new(TracingActivityLog))
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::with_hub(Arc::new(NotifyHub::new()))
    }
}

// ── Engine ────────────────────────────────────────────────

pub struct Engine {
    pub salons: DashMap<Ulid, SharedSalonState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) collaborators: Collaborators,
    /// Reverse lookup: service / sub-service / appointment id → salon id.
    pub(super) entity_to_salon: DashMap<Ulid, Ulid>,
    /// Held by salon creation and by compaction from listing salons
    /// through the file swap.
    pub(super) catalogue: Mutex<()>,
}

/// Apply an event to one salon's state (caller holds the lock).
fn apply_to_salon(state: &mut SalonState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::SalonUpdated { salon } => {
            state.salon = salon.clone();
        }
        Event::ServiceCreated { service } => {
            entity_map.insert(service.id, service.salon_id);
            state.services.insert(service.id, service.clone());
        }
        Event::SubServiceCreated { salon_id, sub_service } => {
            entity_map.insert(sub_service.id, *salon_id);
            state.sub_services.insert(sub_service.id, sub_service.clone());
        }
        Event::AppointmentBooked { appointment } => {
            entity_map.insert(appointment.id, appointment.salon_id);
            state.insert_appointment(appointment.clone());
        }
        Event::AppointmentTransitioned { id, actor, action, at, .. } => {
            if let Some(appt) = state.appointment_mut(id)
                && let Err(e) = lifecycle::advance(appt, actor, action, *at)
            {
                warn!(appointment_id = %id, "skipping transition that no longer applies: {e}");
            }
        }
        Event::OverdueSwept { swept, at } => {
            let salon_id = state.salon.id;
            for (_, ids) in swept.iter().filter(|(sid, _)| *sid == salon_id) {
                for id in ids {
                    if let Some(appt) = state.appointment_mut(id)
                        && let Err(e) = lifecycle::advance(appt, &Actor::System, &Action::AutoCancel, *at)
                    {
                        warn!(appointment_id = %id, "skipping auto-cancel that no longer applies: {e}");
                    }
                }
            }
        }
        // Salon creation is handled at the DashMap level.
        Event::SalonCreated { .. } => {}
    }
}

/// Salons an event touches (empty for `SalonCreated`).
fn event_salon_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::SalonCreated { .. } => Vec::new(),
        Event::SalonUpdated { salon } => vec![salon.id],
        Event::ServiceCreated { service } => vec![service.salon_id],
        Event::SubServiceCreated { salon_id, .. } => vec![*salon_id],
        Event::AppointmentBooked { appointment } => vec![appointment.salon_id],
        Event::AppointmentTransitioned { salon_id, .. } => vec![*salon_id],
        Event::OverdueSwept { swept, .. } => swept.iter().map(|(sid, _)| *sid).collect(),
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, collaborators: Collaborators) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_salon = DashMap::new();

        // Rebuild plain state first; nothing else can see it yet.
        let mut replayed: HashMap<Ulid, SalonState> = HashMap::new();
        for event in &events {
            if let Event::SalonCreated { salon } = event {
                replayed.insert(salon.id, SalonState::new(salon.clone()));
                continue;
            }
            for salon_id in event_salon_ids(event) {
                if let Some(state) = replayed.get_mut(&salon_id) {
                    apply_to_salon(state, event, &entity_to_salon);
                }
            }
        }
        if !events.is_empty() {
            tracing::info!(
                events = events.len(),
                salons = replayed.len(),
                "replayed WAL {}",
                wal_path.display()
            );
        }

        let salons = DashMap::new();
        for (id, state) in replayed {
            salons.insert(id, Arc::new(RwLock::new(state)));
        }

        Ok(Self {
            salons,
            wal_tx,
            collaborators,
            entity_to_salon,
            catalogue: Mutex::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_salon(&self, id: &Ulid) -> Option<SharedSalonState> {
        self.salons.get(id).map(|e| e.value().clone())
    }

    pub fn salon_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_salon.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut SalonState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_salon(state, event, &self.entity_to_salon);
        Ok(())
    }

    /// Like [`persist_and_apply`](Self::persist_and_apply) for an event that
    /// introduces `id`. The id is claimed before the append, so two requests
    /// reusing it can't both commit.
    pub(super) async fn persist_new_entity(
        &self,
        state: &mut SalonState,
        id: Ulid,
        event: &Event,
    ) -> Result<(), EngineError> {
        match self.entity_to_salon.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(state.salon.id);
            }
        }
        if let Err(e) = self.persist_and_apply(state, event).await {
            self.entity_to_salon.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Lookup appointment → salon, acquire the salon's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SalonState>, EngineError> {
        let salon_id = self
            .salon_for_entity(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let state = self
            .get_salon(&salon_id)
            .ok_or(EngineError::NotFound(salon_id))?;
        let guard = state.write_owned().await;
        if guard.appointment(appointment_id).is_none() {
            return Err(EngineError::NotFound(*appointment_id));
        }
        Ok(guard)
    }

    /// Hand a committed change to the notifier and activity log.
    /// Call after releasing the salon lock.
    pub(super) async fn announce(&self, notification: Notification, entry: ActivityEntry) {
        if let Err(e) = self.collaborators.notifier.notify(&notification).await {
            metrics::counter!(observability::COLLABORATOR_FAILURES_TOTAL, "sink" => "notifier")
                .increment(1);
            warn!(appointment_id = %notification.appointment_id, "notification failed: {e}");
        }
        if let Err(e) = self.collaborators.activity.record(&entry).await {
            metrics::counter!(observability::COLLABORATOR_FAILURES_TOTAL, "sink" => "activity")
                .increment(1);
            warn!(appointment_id = %entry.appointment_id, "activity log failed: {e}");
        }
    }
}
