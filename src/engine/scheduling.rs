use chrono::NaiveDate;
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::to_interval;
use crate::limits::*;
use crate::model::*;

use super::ledger::{Plan, plan_edit, plan_transition};
use super::{Engine, EngineError};

/// Fields an owner may change on a Pending booking. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingEdit {
    pub party_size: Option<u32>,
    pub purpose: Option<String>,
    pub interval: Option<TimeInterval>,
}

impl BookingEdit {
    pub fn is_empty(&self) -> bool {
        self.party_size.is_none() && self.purpose.is_none() && self.interval.is_none()
    }
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidInput(msg.into())
}

fn validate_owner(owner: &OwnerId) -> Result<(), EngineError> {
    if owner.as_str().trim().is_empty() {
        return Err(invalid("owner id must not be empty"));
    }
    if owner.as_str().len() > MAX_OWNER_ID_LEN {
        return Err(invalid("owner id too long"));
    }
    Ok(())
}

fn validate_party_size(party_size: u32) -> Result<(), EngineError> {
    if party_size == 0 {
        return Err(invalid("party size must be at least 1"));
    }
    if party_size > MAX_PARTY_SIZE {
        return Err(invalid(format!("party size above {MAX_PARTY_SIZE}")));
    }
    Ok(())
}

fn validate_purpose(purpose: &str) -> Result<String, EngineError> {
    let purpose = purpose.trim();
    if purpose.is_empty() {
        return Err(invalid("purpose must not be empty"));
    }
    if purpose.len() > MAX_PURPOSE_LEN {
        return Err(invalid("purpose too long"));
    }
    Ok(purpose.to_string())
}

impl Engine {
    fn validate_room(&self, room: &RoomCode) -> Result<(), EngineError> {
        if room.as_str().is_empty() || room.as_str().len() > MAX_ROOM_CODE_LEN {
            return Err(invalid("malformed room code"));
        }
        if !self.policy.knows_room(room) {
            return Err(invalid(format!("unknown room {room}")));
        }
        Ok(())
    }

    fn validate_interval(&self, interval: &TimeInterval) -> Result<(), EngineError> {
        if !self.policy.within_hours(interval) {
            return Err(invalid(format!("{interval} is outside operating hours")));
        }
        if interval.end_ms(self.policy.utc_offset_minutes) <= self.clock.now() {
            return Err(invalid(format!("{interval} is already over")));
        }
        Ok(())
    }

    /// Parse `HH:MM` bounds on `date`, then `submit`.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_at(
        &self,
        owner: &OwnerId,
        room: &RoomCode,
        date: NaiveDate,
        start: &str,
        end: &str,
        party_size: u32,
        purpose: &str,
    ) -> Result<Booking, EngineError> {
        let interval = to_interval(date, start, end)?;
        self.submit(owner, room, interval, party_size, purpose).await
    }

    /// Create a Pending booking if the slot is free.
    ///
    /// Ledger create, index insert and journal append run under the day lock;
    /// a failing step undoes the ones before it.
    pub async fn submit(
        &self,
        owner: &OwnerId,
        room: &RoomCode,
        interval: TimeInterval,
        party_size: u32,
        purpose: &str,
    ) -> Result<Booking, EngineError> {
        validate_owner(owner)?;
        self.validate_room(room)?;
        validate_party_size(party_size)?;
        let purpose = validate_purpose(purpose)?;
        self.validate_interval(&interval)?;

        let _gate = self.gate.read().await;
        let key = DayKey::new(room.clone(), interval.date);
        let mut day = self.index.lock(&key).await;
        if let Some(other) = day.first_conflict(&interval) {
            return Err(EngineError::SlotUnavailable(other));
        }

        let now = self.clock.now();
        let booking = Booking {
            id: Ulid::new(),
            owner: owner.clone(),
            room: room.clone(),
            interval,
            party_size,
            purpose,
            status: BookingStatus::Pending,
            tracking_note: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.ledger.create(booking.clone())?;
        if let Err(other) = day.insert(booking.id, &interval) {
            self.ledger.discard(&booking.id);
            return Err(EngineError::SlotUnavailable(other));
        }
        let event = Event::Submitted {
            booking: booking.clone(),
        };
        if let Err(e) = self.journal.append(&event).await {
            day.remove(booking.id);
            self.ledger.discard(&booking.id);
            warn!(booking = %booking.id, error = %e, "submit rolled back");
            return Err(e);
        }
        self.notify.publish(&event);
        info!(booking = %booking.id, owner = %owner, slot = %interval, room = %room, "booking submitted");
        Ok(booking)
    }

    /// Change a Pending booking in place. A new interval must itself be free; on
    /// conflict the old interval stays booked.
    pub async fn edit(
        &self,
        owner: &OwnerId,
        id: Ulid,
        expected_version: u64,
        changes: BookingEdit,
    ) -> Result<Booking, EngineError> {
        if changes.is_empty() {
            return Err(invalid("edit changes nothing"));
        }
        if let Some(p) = changes.party_size {
            validate_party_size(p)?;
        }
        let purpose = changes.purpose.as_deref().map(validate_purpose).transpose()?;
        if let Some(iv) = &changes.interval {
            self.validate_interval(iv)?;
        }

        let seen = self.ledger.get(&id)?;
        if &seen.owner != owner {
            return Err(EngineError::NotFound(id));
        }
        let target_day = changes.interval.map(|iv| DayKey::new(seen.room.clone(), iv.date));

        let _gate = self.gate.read().await;
        let (current, mut locks) = self.lock_booking(id, target_day).await?;
        let next = changes.interval.unwrap_or(current.interval);
        let event = plan_edit(
            &current,
            expected_version,
            next,
            changes.party_size.unwrap_or(current.party_size),
            purpose.unwrap_or_else(|| current.purpose.clone()),
            self.clock.now(),
        )?;

        if next == current.interval {
            let booking = self.persist_and_apply(&event).await?;
            info!(booking = %id, version = booking.version, "booking edited");
            return Ok(booking);
        }

        let old_key = current.day_key();
        let new_key = DayKey::new(current.room.clone(), next.date);
        move_slot(&mut locks, id, &old_key, &current.interval, &new_key, &next)?;
        match self.persist_and_apply(&event).await {
            Ok(booking) => {
                info!(booking = %id, version = booking.version, from = %current.interval, to = %next, "booking moved");
                Ok(booking)
            }
            Err(e) => {
                // Put the old slot back; both days are still locked so it stays free.
                if let Err(restore) = move_slot(&mut locks, id, &new_key, &next, &old_key, &current.interval) {
                    warn!(booking = %id, error = %restore, "could not restore original slot");
                }
                warn!(booking = %id, error = %e, "edit rolled back");
                Err(e)
            }
        }
    }

    /// Owner withdraws a Pending booking; the slot is released.
    pub async fn cancel(&self, owner: &OwnerId, id: Ulid, expected_version: u64) -> Result<Booking, EngineError> {
        let seen = self.ledger.get(&id)?;
        if &seen.owner != owner {
            return Err(EngineError::NotFound(id));
        }

        let _gate = self.gate.read().await;
        let (current, mut locks) = self.lock_booking(id, None).await?;
        let plan = plan_transition(
            &current,
            expected_version,
            BookingStatus::Cancelled,
            Actor::Owner,
            None,
            self.clock.now(),
        )?;
        let booking = match plan {
            Plan::Unchanged(booking) => return Ok(booking),
            Plan::Apply(event) => self.persist_and_apply(&event).await?,
        };
        if let Some(day) = locks.get_mut(&current.day_key()) {
            day.remove(id);
        }
        info!(booking = %id, "booking cancelled by owner");
        Ok(booking)
    }
}

/// Remove `id` from `from_key` and insert it at `to` in `to_key`. Leaves both
/// days untouched on conflict.
fn move_slot(
    locks: &mut super::DayLocks,
    id: Ulid,
    from_key: &DayKey,
    from: &TimeInterval,
    to_key: &DayKey,
    to: &TimeInterval,
) -> Result<(), EngineError> {
    if let Some(day) = locks.get_mut(from_key) {
        day.remove(id);
    }
    let conflict = match locks.get_mut(to_key) {
        Some(day) => day.insert(id, to).err(),
        None => Some(id),
    };
    if let Some(other) = conflict {
        if let Some(day) = locks.get_mut(from_key) {
            let _ = day.insert(id, from);
        }
        return Err(EngineError::SlotUnavailable(other));
    }
    Ok(())
}
