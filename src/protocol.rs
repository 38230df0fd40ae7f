//! JSON-lines frames exchanged with the identity gateway.
//!
//! Client -> server: one `Envelope` per line. The first one must be `hello`.
//!
//! ```text
//! {"op":"hello","secret":"..."}
//! {"seq":1,"identity":{"owner_id":"alice","is_admin":false},"op":"submit","room":"E113",
//!  "date":"2025-09-04","start":"09:00","end":"10:00","party_size":3,"purpose":"study"}
//! ```
//!
//! Server -> client: `Frame`s, either a reply echoing `seq` or a pushed event.
//! Watchers without the moderator role get full events only for their own
//! bookings; changes to anyone else's arrive as a `slot` frame without owner or
//! purpose.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::{TimeFormatError, format_clock};
use crate::engine::EngineError;
use crate::model::*;

/// Verified caller, as asserted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub owner_id: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl Identity {
    pub fn owner(&self) -> OwnerId {
        OwnerId::new(self.owner_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        secret: String,
    },
    Submit {
        room: String,
        date: String,
        start: String,
        end: String,
        party_size: u32,
        purpose: String,
    },
    /// `start`/`end` move the booking; `date` defaults to its current day.
    Edit {
        id: Ulid,
        version: u64,
        #[serde(default)]
        party_size: Option<u32>,
        #[serde(default)]
        purpose: Option<String>,
        #[serde(default)]
        date: Option<String>,
        #[serde(default)]
        start: Option<String>,
        #[serde(default)]
        end: Option<String>,
    },
    Cancel {
        id: Ulid,
        version: u64,
    },
    Approve {
        id: Ulid,
        version: u64,
        #[serde(default)]
        note: Option<String>,
        /// Retry on a lost race; a request another moderator already decided is returned as is.
        #[serde(default)]
        settle: bool,
    },
    Reject {
        id: Ulid,
        version: u64,
        #[serde(default)]
        note: Option<String>,
        /// Retry on a lost race; a request another moderator already decided is returned as is.
        #[serde(default)]
        settle: bool,
    },
    MarkElapsed {
        id: Ulid,
        version: u64,
    },
    Get {
        id: Ulid,
    },
    ListMine,
    ListForOwner {
        owner_id: String,
    },
    ListPending,
    Occupied {
        room: String,
        date: String,
    },
    Free {
        room: String,
        date: String,
        #[serde(default)]
        min_minutes: Option<u16>,
    },
    Rooms,
    /// Push events for one room, or every room when `room` is absent.
    Watch {
        #[serde(default)]
        room: Option<String>,
    },
    Unwatch,
}

impl Request {
    pub fn is_admin_only(&self) -> bool {
        matches!(
            self,
            Request::Approve { .. } | Request::Reject { .. } | Request::MarkElapsed { .. } | Request::ListPending
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Reply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Event {
        event: Event,
    },
    Slot {
        slot: SlotNotice,
    },
}

impl Frame {
    pub fn ok(seq: Option<u64>, body: serde_json::Value) -> Self {
        Frame::Reply {
            seq,
            ok: Some(body),
            error: None,
        }
    }

    pub fn error(seq: Option<u64>, err: &ProtocolError) -> Self {
        Frame::Reply {
            seq,
            ok: None,
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Transport(#[from] tokio_util::codec::LinesCodecError),
}

impl ProtocolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "Malformed",
            ProtocolError::Unauthenticated => "Unauthenticated",
            ProtocolError::Forbidden(_) => "Forbidden",
            ProtocolError::Engine(e) => e.kind(),
            ProtocolError::Encode(_) => "Internal",
            ProtocolError::Transport(_) => "Transport",
        }
    }
}

impl From<TimeFormatError> for ProtocolError {
    fn from(e: TimeFormatError) -> Self {
        ProtocolError::Engine(e.into())
    }
}

/// Booking as shown to clients, with clock times instead of minute offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingView {
    pub id: Ulid,
    pub owner_id: String,
    pub room: String,
    pub date: String,
    pub start: String,
    pub end: String,
    pub party_size: u32,
    pub purpose: String,
    pub status: BookingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_note: Option<String>,
    pub version: u64,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl From<&Booking> for BookingView {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            owner_id: b.owner.to_string(),
            room: b.room.to_string(),
            date: b.interval.date.to_string(),
            start: format_clock(b.interval.start),
            end: format_clock(b.interval.end),
            party_size: b.party_size,
            purpose: b.purpose.clone(),
            status: b.status,
            tracking_note: b.tracking_note.clone(),
            version: b.version,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

/// What a watcher may learn about another owner's booking: where it sits and
/// in which state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotNotice {
    pub booking_id: Ulid,
    pub room: String,
    pub date: String,
    pub start: String,
    pub end: String,
    pub status: BookingStatus,
    pub version: u64,
}

impl SlotNotice {
    /// `booking` is the stored record `event` belongs to; the event's own fields win.
    pub fn new(event: &Event, booking: &Booking) -> Self {
        let (interval, status, version) = match event {
            Event::Submitted { booking: b } | Event::Restored { booking: b } => (b.interval, b.status, b.version),
            Event::Edited { interval, version, .. } => (*interval, BookingStatus::Pending, *version),
            Event::Transitioned { to, version, .. } => (booking.interval, *to, *version),
        };
        Self {
            booking_id: event.booking_id(),
            room: event.room().to_string(),
            date: interval.date.to_string(),
            start: format_clock(interval.start),
            end: format_clock(interval.end),
            status,
            version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<Ulid>,
    pub start: String,
    pub end: String,
}

impl WindowView {
    pub fn free(start: u16, end: u16) -> Self {
        Self {
            booking_id: None,
            start: format_clock(start),
            end: format_clock(end),
        }
    }

    pub fn occupied(slot: &Slot) -> Self {
        Self {
            booking_id: Some(slot.id),
            start: format_clock(slot.start),
            end: format_clock(slot.end),
        }
    }
}
