mod catalog;
mod conflict;
mod error;
mod ledger;
mod queries;
mod reviews;
mod store;

pub use error::{EngineError, Entity};
pub use reviews::check_review_precondition;
pub use store::{EntityIndex, IdSequence};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};

use crate::model::*;
use crate::wal::Wal;

pub type SharedServiceState = Arc<RwLock<ServiceState>>;

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One fsync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(events = batch.len(), "WAL flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All or nothing: on any failure the log is cut back to the last synced
/// entry, so no event of a rejected batch can surface on replay.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!(path = %wal.path().display(), "WAL rollback failed: {e}");
    }
    result
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
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The booking ledger, catalog and review store, all in memory and backed by the WAL.
pub struct Engine {
    pub(super) services: DashMap<ServiceId, SharedServiceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) index: EntityIndex,
    pub(super) ids: IdSequence,
    /// Mutations hold this shared; compaction holds it exclusively so its
    /// snapshot and the log swap see no interleaved appends.
    commit_gate: RwLock<()>,
    /// Serializes service creation and deletion.
    pub(super) catalog_lock: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            services: DashMap::new(),
            wal_tx,
            index: EntityIndex::new(),
            ids: IdSequence::new(),
            commit_gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        // Never block here: this may run inside an async context.
        for event in &events {
            engine.ids.observe(event);
            match event {
                Event::ServiceCreated {
                    id,
                    title,
                    description,
                    price_cents,
                    duration_minutes,
                    active,
                    created_at,
                } => {
                    let info = ServiceInfo {
                        id: *id,
                        title: title.clone(),
                        description: description.clone(),
                        price_cents: *price_cents,
                        duration_minutes: *duration_minutes,
                        active: *active,
                        created_at: *created_at,
                    };
                    engine
                        .services
                        .insert(*id, Arc::new(RwLock::new(ServiceState::new(info))));
                }
                Event::ServiceDeleted { id } => {
                    engine.services.remove(id);
                }
                other => {
                    let Some(service_id) = other.service_id() else { continue };
                    let Some(rs) = engine.get_service(&service_id) else {
                        tracing::warn!(service_id, "replay: event for unknown service skipped");
                        continue;
                    };
                    match rs.try_write() {
                        Ok(mut guard) => engine.index.apply_event(&mut guard, other),
                        Err(_) => tracing::warn!(service_id, "replay: service state contended"),
                    }
                }
            }
        }

        tracing::info!(
            events = events.len(),
            services = engine.services.len(),
            "engine state restored"
        );
        Ok(engine)
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

    pub fn get_service(&self, id: &ServiceId) -> Option<SharedServiceState> {
        self.services.get(id).map(|e| e.value().clone())
    }

    /// Taken by every mutation before any service lock.
    pub(super) async fn commit_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// WAL-append then apply. Nothing touches memory if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ServiceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.index.apply_event(rs, event);
        Ok(())
    }

    /// Acquire the write lock of a live service.
    pub(super) async fn write_service(
        &self,
        id: ServiceId,
    ) -> Result<OwnedRwLockWriteGuard<ServiceState>, EngineError> {
        let rs = self
            .get_service(&id)
            .ok_or(EngineError::NotFound(Entity::Service, id))?;
        let guard = rs.write_owned().await;
        // Deleted while we queued for the lock.
        if guard.retired {
            return Err(EngineError::NotFound(Entity::Service, id));
        }
        Ok(guard)
    }

    /// Lookup booking → service, then lock the service and confirm the booking is still there.
    pub(super) async fn lock_booking(
        &self,
        id: BookingId,
    ) -> Result<OwnedRwLockWriteGuard<ServiceState>, EngineError> {
        let not_found = || EngineError::NotFound(Entity::Booking, id);
        let service_id = self.index.service_for_booking(&id).ok_or_else(not_found)?;
        let guard = self.write_service(service_id).await.map_err(|_| not_found())?;
        if guard.booking(id).is_none() {
            return Err(not_found());
        }
        Ok(guard)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let (next_booking_id, next_review_id) = self.ids.peek();
        let mut events = vec![Event::IdsReserved {
            next_booking_id,
            next_review_id,
        }];

        let mut service_ids: Vec<ServiceId> = self.services.iter().map(|e| *e.key()).collect();
        service_ids.sort_unstable();
        for id in service_ids {
            let Some(rs) = self.get_service(&id) else { continue };
            let guard = rs.read().await;
            let info = &guard.info;
            events.push(Event::ServiceCreated {
                id: info.id,
                title: info.title.clone(),
                description: info.description.clone(),
                price_cents: info.price_cents,
                duration_minutes: info.duration_minutes,
                active: info.active,
                created_at: info.created_at,
            });
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    user_id: b.user_id,
                    service_id: b.service_id,
                    span: b.span,
                    status: b.status,
                    created_at: b.created_at,
                });
            }
            let mut reviews: Vec<&Review> = guard.reviews.values().collect();
            reviews.sort_unstable_by_key(|r| r.id);
            for r in reviews {
                events.push(Event::ReviewCreated {
                    id: r.id,
                    booking_id: r.booking_id,
                    service_id: info.id,
                    user_id: r.user_id,
                    rating: r.rating,
                    comment: r.comment.clone(),
                    created_at: r.created_at,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
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
