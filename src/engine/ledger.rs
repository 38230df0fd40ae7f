use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Outcome of planning a change against the current booking.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Persist this event, then apply it.
    Apply(Event),
    /// Already in the requested state; nothing to write.
    Unchanged(Booking),
}

/// Authoritative booking store. Records are never removed once committed.
#[derive(Default)]
pub struct Ledger {
    bookings: DashMap<Ulid, Booking>,
    by_owner: DashMap<OwnerId, Vec<Ulid>>,
    /// Ids currently Active; the elapse sweep reads this instead of the full history.
    active: DashSet<Ulid>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub fn create(&self, booking: Booking) -> Result<(), EngineError> {
        let owner = booking.owner.clone();
        let id = booking.id;
        let status = booking.status;
        match self.bookings.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(booking);
            }
        }
        self.by_owner.entry(owner).or_default().push(id);
        self.track(id, status);
        Ok(())
    }

    fn track(&self, id: Ulid, status: BookingStatus) {
        if status == BookingStatus::Active {
            self.active.insert(id);
        } else {
            self.active.remove(&id);
        }
    }

    /// Undo a `create` whose commit failed.
    pub fn discard(&self, id: &Ulid) -> Option<Booking> {
        let (_, booking) = self.bookings.remove(id)?;
        self.active.remove(id);
        if let Some(mut ids) = self.by_owner.get_mut(&booking.owner) {
            ids.retain(|b| b != id);
        }
        Some(booking)
    }

    /// Check and apply a status change in one step.
    pub fn transition(
        &self,
        id: Ulid,
        expected_version: u64,
        to: BookingStatus,
        actor: Actor,
        note: Option<String>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let current = self.get(&id)?;
        match plan_transition(&current, expected_version, to, actor, note, now)? {
            Plan::Unchanged(booking) => Ok(booking),
            Plan::Apply(event) => self.apply(&event),
        }
    }

    /// Apply a journaled event. Version steps are re-checked so a stale event can
    /// never overwrite newer state.
    pub fn apply(&self, event: &Event) -> Result<Booking, EngineError> {
        match event {
            Event::Submitted { booking } => {
                self.create(booking.clone())?;
                Ok(booking.clone())
            }
            Event::Restored { booking } => {
                if let Some(old) = self.bookings.get(&booking.id).map(|b| b.owner.clone())
                    && old != booking.owner
                    && let Some(mut ids) = self.by_owner.get_mut(&old)
                {
                    ids.retain(|b| b != &booking.id);
                }
                let known = self.bookings.insert(booking.id, booking.clone()).is_some();
                if !known {
                    self.by_owner.entry(booking.owner.clone()).or_default().push(booking.id);
                }
                self.track(booking.id, booking.status);
                Ok(booking.clone())
            }
            Event::Edited {
                id,
                version,
                interval,
                party_size,
                purpose,
                at,
                ..
            } => {
                let mut entry = self.bookings.get_mut(id).ok_or(EngineError::NotFound(*id))?;
                check_step(&entry, *version)?;
                if entry.status != BookingStatus::Pending {
                    return Err(EngineError::IllegalTransition {
                        id: *id,
                        from: entry.status,
                        to: BookingStatus::Pending,
                    });
                }
                entry.interval = *interval;
                entry.party_size = *party_size;
                entry.purpose = purpose.clone();
                entry.version = *version;
                entry.updated_at = *at;
                Ok(entry.clone())
            }
            Event::Transitioned {
                id,
                version,
                from,
                to,
                note,
                at,
                ..
            } => {
                let mut entry = self.bookings.get_mut(id).ok_or(EngineError::NotFound(*id))?;
                check_step(&entry, *version)?;
                if entry.status != *from || !from.can_transition_to(*to) {
                    return Err(EngineError::IllegalTransition {
                        id: *id,
                        from: entry.status,
                        to: *to,
                    });
                }
                entry.status = *to;
                self.track(*id, *to);
                if note.is_some() {
                    entry.tracking_note = note.clone();
                }
                entry.version = *version;
                entry.updated_at = *at;
                Ok(entry.clone())
            }
        }
    }

    /// Bookings of one owner, by date and start time.
    pub fn list_for_owner(&self, owner: &OwnerId) -> Vec<Booking> {
        let ids = self
            .by_owner
            .get(owner)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out: Vec<Booking> = ids.iter().filter_map(|id| self.get(id).ok()).collect();
        out.sort_by_key(|b| (b.interval.date, b.interval.start, b.id));
        out
    }

    /// Bookings in `status`, oldest request first.
    pub fn list_by_status(&self, status: BookingStatus) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.created_at, b.id));
        out
    }

    /// Active bookings, unordered.
    pub fn list_active(&self) -> Vec<Booking> {
        // Copy the ids out first; `apply` touches `active` while holding a booking entry.
        let ids: Vec<Ulid> = self.active.iter().map(|id| *id.key()).collect();
        ids.iter().filter_map(|id| self.get(id).ok()).collect()
    }

    pub fn all(&self) -> Vec<Booking> {
        let mut out: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|b| b.id);
        out
    }
}

fn check_step(current: &Booking, next_version: u64) -> Result<(), EngineError> {
    if current.version + 1 != next_version {
        return Err(EngineError::VersionConflict {
            id: current.id,
            expected: next_version.saturating_sub(1),
            actual: current.version,
        });
    }
    Ok(())
}

/// Decide a status change. The version is checked before legality so a caller
/// holding a stale read always learns that first.
///
/// Re-delivering the elapse trigger to a Done booking is not an error.
pub fn plan_transition(
    current: &Booking,
    expected_version: u64,
    to: BookingStatus,
    actor: Actor,
    note: Option<String>,
    now: Ms,
) -> Result<Plan, EngineError> {
    if to == BookingStatus::Done && current.status == BookingStatus::Done {
        return Ok(Plan::Unchanged(current.clone()));
    }
    if current.version != expected_version {
        return Err(EngineError::VersionConflict {
            id: current.id,
            expected: expected_version,
            actual: current.version,
        });
    }
    if !current.status.can_transition_to(to) {
        return Err(EngineError::IllegalTransition {
            id: current.id,
            from: current.status,
            to,
        });
    }
    Ok(Plan::Apply(Event::Transitioned {
        id: current.id,
        room: current.room.clone(),
        version: current.version + 1,
        from: current.status,
        to,
        actor,
        note,
        at: now,
    }))
}

/// Decide an in-place edit. Only Pending bookings are editable.
pub fn plan_edit(
    current: &Booking,
    expected_version: u64,
    interval: TimeInterval,
    party_size: u32,
    purpose: String,
    now: Ms,
) -> Result<Event, EngineError> {
    if current.version != expected_version {
        return Err(EngineError::VersionConflict {
            id: current.id,
            expected: expected_version,
            actual: current.version,
        });
    }
    if current.status != BookingStatus::Pending {
        return Err(EngineError::IllegalTransition {
            id: current.id,
            from: current.status,
            to: BookingStatus::Pending,
        });
    }
    Ok(Event::Edited {
        id: current.id,
        room: current.room.clone(),
        version: current.version + 1,
        interval,
        party_size,
        purpose,
        at: now,
    })
}
