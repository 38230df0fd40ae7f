use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn get(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.ledger.get(&id)
    }

    /// Like `get`, but other owners' bookings read as missing.
    pub fn get_for(&self, owner: &OwnerId, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.ledger.get(&id)?;
        if &booking.owner != owner {
            return Err(EngineError::NotFound(id));
        }
        Ok(booking)
    }

    /// Every booking of `owner`, by date then start time.
    pub fn list_for_owner(&self, owner: &OwnerId) -> Vec<Booking> {
        self.ledger.list_for_owner(owner)
    }

    /// Moderation queue, oldest request first.
    pub fn list_pending(&self) -> Vec<Booking> {
        self.ledger.list_by_status(BookingStatus::Pending)
    }

    /// True when `interval` collides with a Pending or Active booking in `room`.
    pub async fn is_taken(&self, room: &RoomCode, interval: &TimeInterval) -> bool {
        self.index.query(room, interval).await
    }

    /// Blocking slots of one room and day, by start time.
    pub async fn occupied(&self, room: &RoomCode, date: NaiveDate) -> Vec<Slot> {
        self.index.slots(&DayKey::new(room.clone(), date)).await
    }

    /// Operating-hours gaps of at least `min_minutes` with no blocking booking.
    pub async fn free_windows(&self, room: &RoomCode, date: NaiveDate, min_minutes: u16) -> Vec<(u16, u16)> {
        let key = DayKey::new(room.clone(), date);
        self.index
            .free_windows(&key, self.policy.open, self.policy.close, min_minutes)
            .await
    }

    pub fn rooms(&self) -> Vec<RoomCode> {
        self.policy.rooms.iter().cloned().collect()
    }

    /// Active bookings whose interval ended at or before `now`, with the version
    /// to transition from.
    pub fn collect_elapsed(&self, now: Ms) -> Vec<(Ulid, u64)> {
        let offset = self.policy.utc_offset_minutes;
        self.ledger
            .list_active()
            .into_iter()
            .filter(|b| b.interval.end_ms(offset) <= now)
            .map(|b| (b.id, b.version))
            .collect()
    }

    pub fn booking_count(&self) -> usize {
        self.ledger.len()
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }

    /// Rewrite the journal as one `Restored` snapshot per booking. Mutations
    /// wait on the gate until the swap is done.
    pub async fn compact_journal(&self) -> Result<usize, EngineError> {
        let _gate = self.gate.write().await;
        let snapshot: Vec<Event> = self
            .ledger
            .all()
            .into_iter()
            .map(|booking| Event::Restored { booking })
            .collect();
        let count = snapshot.len();
        self.journal.compact(snapshot).await?;
        info!(bookings = count, "journal compacted");
        Ok(count)
    }
}
