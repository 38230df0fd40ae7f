mod error;
mod index;
mod journal;
mod ledger;
mod moderation;
mod queries;
mod scheduling;

pub use error::EngineError;
pub use index::{AvailabilityIndex, DayLocks, DaySchedule, SharedDay};
pub use journal::{Journal, MemoryJournal, WalJournal};
pub use ledger::{Ledger, Plan, plan_edit, plan_transition};
pub use moderation::ModerationAction;
pub use scheduling::BookingEdit;

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::SchedulePolicy;
use crate::model::*;
use crate::notify::EventHub;

/// Scheduling core: ledger, per-day availability index and journal behind one
/// set of operations.
///
/// Every mutation holds the compaction gate for reading and the write lock of
/// each (room, date) shard it touches, so check, write and journal happen as
/// one step.
pub struct Engine {
    ledger: Ledger,
    index: AvailabilityIndex,
    journal: Arc<dyn Journal>,
    pub notify: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    policy: SchedulePolicy,
    gate: RwLock<()>,
}

impl Engine {
    /// Replay the journal file at `path` and start its writer task.
    pub fn open(
        path: &Path,
        policy: SchedulePolicy,
        clock: Arc<dyn Clock>,
        notify: Arc<EventHub>,
    ) -> io::Result<Self> {
        let (journal, history) = WalJournal::open(path)?;
        Ok(Self::with_journal(Arc::new(journal), &history, policy, clock, notify))
    }

    /// Build state from `history`, then write new events to `journal`.
    pub fn with_journal(
        journal: Arc<dyn Journal>,
        history: &[Event],
        policy: SchedulePolicy,
        clock: Arc<dyn Clock>,
        notify: Arc<EventHub>,
    ) -> Self {
        let ledger = Ledger::new();
        for event in history {
            if let Err(e) = ledger.apply(event) {
                warn!(booking = %event.booking_id(), error = %e, "skipping journal event on replay");
            }
        }
        let bookings = ledger.all();
        let (index, rejected) = AvailabilityIndex::rebuild(&bookings);
        for id in rejected {
            warn!(booking = %id, "replayed booking overlaps an earlier one; left out of the index");
        }
        tracing::info!(
            bookings = ledger.len(),
            days = index.day_count(),
            "engine state restored"
        );

        Self {
            ledger,
            index,
            journal,
            notify,
            clock,
            policy,
            gate: RwLock::new(()),
        }
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Journal + apply + notify. The caller holds the relevant day locks.
    async fn persist_and_apply(&self, event: &Event) -> Result<Booking, EngineError> {
        self.journal.append(event).await?;
        let booking = self.ledger.apply(event)?;
        self.notify.publish(event);
        Ok(booking)
    }

    /// Lock the day shard holding `id` (plus `extra`, in key order) and return
    /// the booking as seen under those locks.
    async fn lock_booking(&self, id: Ulid, extra: Option<DayKey>) -> Result<(Booking, DayLocks), EngineError> {
        loop {
            let seen = self.ledger.get(&id)?;
            let mut keys = vec![seen.day_key()];
            keys.extend(extra.clone());
            let locks = self.index.lock_many(keys).await;
            let current = self.ledger.get(&id)?;
            // An edit may have moved it to another day while we waited.
            if current.day_key() == seen.day_key() {
                return Ok((current, locks));
            }
        }
    }
}
