use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::{MAX_NOTE_LEN, MAX_SETTLE_ATTEMPTS};
use crate::model::*;

use super::ledger::{Plan, plan_transition};
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationAction {
    Approve,
    Reject,
    Elapse,
}

impl ModerationAction {
    /// Status the booking ends up in when the action succeeds.
    pub fn target(self) -> BookingStatus {
        match self {
            Self::Approve => BookingStatus::Active,
            Self::Reject => BookingStatus::Cancelled,
            Self::Elapse => BookingStatus::Done,
        }
    }

    /// True when `status` already answers this action, so a retry has nothing to do.
    pub fn is_decided(self, status: BookingStatus) -> bool {
        match self {
            Self::Approve | Self::Reject => status != BookingStatus::Pending,
            Self::Elapse => status == BookingStatus::Done,
        }
    }

    fn actor(self) -> Actor {
        match self {
            Self::Approve | Self::Reject => Actor::Moderator,
            Self::Elapse => Actor::Timer,
        }
    }
}

fn validate_note(note: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = note
        && n.len() > MAX_NOTE_LEN
    {
        return Err(EngineError::InvalidInput("tracking note too long".into()));
    }
    Ok(())
}

impl Engine {
    /// Pending -> Active.
    pub async fn approve(&self, id: Ulid, expected_version: u64, note: Option<String>) -> Result<Booking, EngineError> {
        self.moderate(id, expected_version, ModerationAction::Approve, note).await
    }

    /// Pending -> Cancelled. Frees the slot.
    pub async fn reject(&self, id: Ulid, expected_version: u64, note: Option<String>) -> Result<Booking, EngineError> {
        self.moderate(id, expected_version, ModerationAction::Reject, note).await
    }

    /// Active -> Done once the interval has ended. Re-delivery to a Done booking
    /// returns it unchanged.
    pub async fn mark_elapsed(&self, id: Ulid, expected_version: u64) -> Result<Booking, EngineError> {
        self.moderate(id, expected_version, ModerationAction::Elapse, None).await
    }

    pub async fn moderate(
        &self,
        id: Ulid,
        expected_version: u64,
        action: ModerationAction,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        validate_note(&note)?;
        let _gate = self.gate.read().await;
        let (current, mut locks) = self.lock_booking(id, None).await?;
        let now = self.clock.now();

        let event = match plan_transition(&current, expected_version, action.target(), action.actor(), note, now)? {
            Plan::Unchanged(booking) => {
                debug!(booking = %id, status = %booking.status, "already settled");
                return Ok(booking);
            }
            Plan::Apply(event) => event,
        };
        // Version and legality passed; an Active booking still cannot end early.
        if action == ModerationAction::Elapse && now < current.interval.end_ms(self.policy.utc_offset_minutes) {
            return Err(EngineError::IllegalTransition {
                id,
                from: current.status,
                to: BookingStatus::Done,
            });
        }
        let booking = self.persist_and_apply(&event).await?;
        if !booking.is_blocking()
            && let Some(day) = locks.get_mut(&current.day_key())
        {
            day.remove(id);
        }
        info!(booking = %id, from = %current.status, to = %booking.status, version = booking.version, "booking moderated");
        Ok(booking)
    }

    /// Apply `action` at `expected_version`, re-reading after each lost race.
    ///
    /// When the fresh read shows the request was already decided (no longer
    /// Pending for approve/reject, Done for elapse) the booking is returned as
    /// is and nothing is written. Otherwise the action is retried at the new
    /// version, up to `MAX_SETTLE_ATTEMPTS` times.
    pub async fn moderate_settled(
        &self,
        id: Ulid,
        expected_version: u64,
        action: ModerationAction,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        let mut version = expected_version;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let conflict = match self.moderate(id, version, action, note.clone()).await {
                Err(e @ EngineError::VersionConflict { .. }) => e,
                other => return other,
            };
            let current = self.ledger.get(&id)?;
            if action.is_decided(current.status) {
                debug!(booking = %id, status = %current.status, "lost race, request already decided");
                return Ok(current);
            }
            if attempt >= MAX_SETTLE_ATTEMPTS {
                return Err(conflict);
            }
            debug!(booking = %id, attempt, "version moved, retrying");
            version = current.version;
        }
    }
}
