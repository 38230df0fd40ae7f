use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::{format_clock, instant_of};

/// Unix milliseconds.
pub type Ms = i64;

/// Room code as printed on the door, e.g. `E113`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(pub String);

impl RoomCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verified identity of whoever asked for a booking. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open `[start, end)` minutes of a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    pub date: NaiveDate,
    pub start: u16,
    pub end: u16,
}

impl TimeInterval {
    pub fn new(date: NaiveDate, start: u16, end: u16) -> Self {
        debug_assert!(start < end, "TimeInterval start must be before end");
        Self { date, start, end }
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end - self.start
    }

    /// Touching intervals (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.date == other.date && self.start < other.end && other.start < self.end
    }

    pub fn start_ms(&self, utc_offset_minutes: i32) -> Ms {
        instant_of(self.date, self.start, utc_offset_minutes)
    }

    pub fn end_ms(&self, utc_offset_minutes: i32) -> Ms {
        instant_of(self.date, self.end, utc_offset_minutes)
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}-{}", self.date, format_clock(self.start), format_clock(self.end))
    }
}

/// Shard key of the availability index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey {
    pub room: RoomCode,
    pub date: NaiveDate,
}

impl DayKey {
    pub fn new(room: RoomCode, date: NaiveDate) -> Self {
        Self { room, date }
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.room, self.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Active,
    Done,
    Cancelled,
}

impl BookingStatus {
    /// Pending and Active bookings hold their slot.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// ```text
    /// Pending -> Active -> Done
    ///    \-> Cancelled
    /// ```
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Active) | (Self::Pending, Self::Cancelled) | (Self::Active, Self::Done)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "done" => Ok(Self::Done),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Who drove a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Owner,
    Moderator,
    Timer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub owner: OwnerId,
    pub room: RoomCode,
    pub interval: TimeInterval,
    pub party_size: u32,
    pub purpose: String,
    pub status: BookingStatus,
    pub tracking_note: Option<String>,
    pub version: u64,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn day_key(&self) -> DayKey {
        DayKey::new(self.room.clone(), self.interval.date)
    }

    pub fn is_blocking(&self) -> bool {
        self.status.is_blocking()
    }
}

/// Journal record and notification payload. One variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Submitted {
        booking: Booking,
    },
    Edited {
        id: Ulid,
        room: RoomCode,
        version: u64,
        interval: TimeInterval,
        party_size: u32,
        purpose: String,
        at: Ms,
    },
    Transitioned {
        id: Ulid,
        room: RoomCode,
        version: u64,
        from: BookingStatus,
        to: BookingStatus,
        actor: Actor,
        note: Option<String>,
        at: Ms,
    },
    /// Full snapshot written by journal compaction.
    Restored {
        booking: Booking,
    },
}

impl Event {
    pub fn booking_id(&self) -> Ulid {
        match self {
            Event::Submitted { booking } | Event::Restored { booking } => booking.id,
            Event::Edited { id, .. } | Event::Transitioned { id, .. } => *id,
        }
    }

    pub fn room(&self) -> &RoomCode {
        match self {
            Event::Submitted { booking } | Event::Restored { booking } => &booking.room,
            Event::Edited { room, .. } | Event::Transitioned { room, .. } => room,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// One occupied interval inside a day shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub start: u16,
    pub end: u16,
}

impl Slot {
    pub fn overlaps(&self, start: u16, end: u16) -> bool {
        self.start < end && start < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 4).unwrap()
    }

    #[test]
    fn interval_overlap() {
        let a = TimeInterval::new(date(), 540, 600);
        let b = TimeInterval::new(date(), 570, 630);
        let c = TimeInterval::new(date(), 600, 660);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back is legal
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn intervals_on_other_days_never_overlap() {
        let a = TimeInterval::new(date(), 540, 600);
        let next_day = date().succ_opt().unwrap();
        let b = TimeInterval::new(next_day, 540, 600);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn interval_instants() {
        let iv = TimeInterval::new(date(), 540, 600);
        assert_eq!(iv.end_ms(0) - iv.start_ms(0), 60 * 60_000);
        assert_eq!(iv.start_ms(60), iv.start_ms(0) - 60 * 60_000);
        assert_eq!(iv.to_string(), "2025-09-04 09:00-10:00");
    }

    #[test]
    fn status_machine_edges() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Done));
        assert!(!Active.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Done));
        for terminal in [Done, Cancelled] {
            for target in [Pending, Active, Done, Cancelled] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn status_flags() {
        use BookingStatus::*;
        assert!(Pending.is_blocking() && Active.is_blocking());
        assert!(!Done.is_blocking() && !Cancelled.is_blocking());
        assert!(Done.is_terminal() && Cancelled.is_terminal());
        assert!(!Pending.is_terminal());
    }

    #[test]
    fn status_parse() {
        assert_eq!("Pending".parse::<BookingStatus>(), Ok(BookingStatus::Pending));
        assert_eq!("canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("approved".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn day_keys_order_by_room_then_date() {
        let a = DayKey::new(RoomCode::new("B317"), date());
        let b = DayKey::new(RoomCode::new("E113"), date());
        let c = DayKey::new(RoomCode::new("E113"), date().succ_opt().unwrap());
        assert!(a < b && b < c);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::Transitioned {
            id: Ulid::new(),
            room: RoomCode::new("E113"),
            version: 1,
            from: BookingStatus::Pending,
            to: BookingStatus::Active,
            actor: Actor::Moderator,
            note: Some("ok".into()),
            at: 1_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
