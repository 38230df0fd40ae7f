use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::SharedSecret;
use crate::clock::{parse_date, to_interval};
use crate::engine::{BookingEdit, Engine, EngineError, ModerationAction};
use crate::limits::MAX_FRAME_LEN;
use crate::model::*;
use crate::observability::{self, op_label};
use crate::protocol::*;

type Conn = Framed<TcpStream, LinesCodec>;

enum Incoming {
    Line(Option<Result<String, LinesCodecError>>),
    Event(Result<Event, RecvError>),
}

async fn send(conn: &mut Conn, frame: &Frame) -> Result<(), ProtocolError> {
    let line = serde_json::to_string(frame)?;
    conn.send(line).await?;
    Ok(())
}

struct Watch {
    rx: broadcast::Receiver<Event>,
    /// `None` for moderators, who see every event in full.
    viewer: Option<OwnerId>,
}

async fn next_event(watch: &mut Option<Watch>) -> Result<Event, RecvError> {
    match watch {
        Some(w) => w.rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Full event for moderators and for the viewer's own bookings, a `SlotNotice` otherwise.
fn event_frame(engine: &Engine, viewer: Option<&OwnerId>, event: Event) -> Option<Frame> {
    let Some(viewer) = viewer else {
        return Some(Frame::Event { event });
    };
    let booking = match &event {
        Event::Submitted { booking } | Event::Restored { booking } => booking.clone(),
        Event::Edited { id, .. } | Event::Transitioned { id, .. } => engine.get(*id).ok()?,
    };
    if &booking.owner == viewer {
        return Some(Frame::Event { event });
    }
    Some(Frame::Slot {
        slot: SlotNotice::new(&event, &booking),
    })
}

/// Serve one gateway connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    secret: SharedSecret,
) -> Result<(), ProtocolError> {
    let mut conn = Framed::new(socket, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    let Some(first) = conn.next().await else {
        return Ok(());
    };
    let authed = match serde_json::from_str::<Envelope>(&first?) {
        Ok(Envelope {
            request: Request::Hello { secret: presented },
            ..
        }) => secret.verify(&presented),
        _ => false,
    };
    if !authed {
        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        send(&mut conn, &Frame::error(None, &ProtocolError::Unauthenticated)).await?;
        return Ok(());
    }
    send(
        &mut conn,
        &Frame::ok(None, json!({ "server": "roombook", "version": env!("CARGO_PKG_VERSION") })),
    )
    .await?;

    let mut watch: Option<Watch> = None;
    loop {
        let incoming = tokio::select! {
            line = conn.next() => Incoming::Line(line),
            event = next_event(&mut watch) => Incoming::Event(event),
        };

        match incoming {
            Incoming::Line(None) => break,
            Incoming::Line(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                let err = ProtocolError::Malformed(format!("frame longer than {MAX_FRAME_LEN} bytes"));
                send(&mut conn, &Frame::error(None, &err)).await?;
            }
            Incoming::Line(Some(Err(e))) => return Err(e.into()),
            Incoming::Line(Some(Ok(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                let frame = match serde_json::from_str::<Envelope>(&line) {
                    Ok(env) => handle(&engine, env, &mut watch).await,
                    Err(e) => Frame::error(None, &ProtocolError::Malformed(e.to_string())),
                };
                send(&mut conn, &frame).await?;
            }
            Incoming::Event(Ok(event)) => {
                let viewer = watch.as_ref().and_then(|w| w.viewer.as_ref());
                if let Some(frame) = event_frame(&engine, viewer, event) {
                    send(&mut conn, &frame).await?;
                }
            }
            Incoming::Event(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "watcher fell behind; events dropped");
            }
            Incoming::Event(Err(RecvError::Closed)) => watch = None,
        }
    }
    Ok(())
}

async fn handle(engine: &Engine, env: Envelope, watch: &mut Option<Watch>) -> Frame {
    let op = op_label(&env.request);
    let start = Instant::now();
    let result = dispatch(engine, env.identity.as_ref(), env.request, watch).await;
    metrics::histogram!(observability::OP_DURATION_SECONDS, "op" => op).record(start.elapsed().as_secs_f64());

    match result {
        Ok(body) => {
            metrics::counter!(observability::OPS_TOTAL, "op" => op, "outcome" => "ok").increment(1);
            Frame::ok(env.seq, body)
        }
        Err(err) => {
            let kind = err.kind();
            metrics::counter!(observability::OPS_TOTAL, "op" => op, "outcome" => kind).increment(1);
            match &err {
                ProtocolError::Engine(EngineError::SlotUnavailable(_)) => {
                    metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                }
                ProtocolError::Engine(EngineError::VersionConflict { .. }) => {
                    metrics::counter!(observability::VERSION_CONFLICTS_TOTAL).increment(1);
                }
                _ => {}
            }
            debug!(op, kind, error = %err, "request failed");
            Frame::error(env.seq, &err)
        }
    }
}

fn booking(b: &Booking) -> Result<Value, ProtocolError> {
    Ok(serde_json::to_value(BookingView::from(b))?)
}

fn bookings(list: &[Booking]) -> Result<Value, ProtocolError> {
    let views: Vec<BookingView> = list.iter().map(BookingView::from).collect();
    Ok(serde_json::to_value(views)?)
}

async fn moderate(
    engine: &Engine,
    id: Ulid,
    version: u64,
    action: ModerationAction,
    note: Option<String>,
    settle: bool,
) -> Result<Booking, EngineError> {
    if settle {
        engine.moderate_settled(id, version, action, note).await
    } else {
        engine.moderate(id, version, action, note).await
    }
}

fn room_code(raw: String) -> Result<RoomCode, ProtocolError> {
    if raw.trim().is_empty() {
        return Err(EngineError::InvalidInput("room must not be empty".into()).into());
    }
    Ok(RoomCode::new(raw.trim()))
}

async fn dispatch(
    engine: &Engine,
    identity: Option<&Identity>,
    request: Request,
    watch: &mut Option<Watch>,
) -> Result<Value, ProtocolError> {
    match &request {
        Request::Hello { .. } => return Err(ProtocolError::Malformed("already authenticated".into())),
        Request::Rooms => {
            let rooms: Vec<String> = engine.rooms().iter().map(|r| r.to_string()).collect();
            return Ok(json!(rooms));
        }
        _ => {}
    }

    let identity = identity.ok_or(ProtocolError::Unauthenticated)?;
    if request.is_admin_only() && !identity.is_admin {
        return Err(ProtocolError::Forbidden("moderator role required"));
    }
    let owner = identity.owner();

    match request {
        Request::Submit {
            room,
            date,
            start,
            end,
            party_size,
            purpose,
        } => {
            let date = parse_date(&date)?;
            let b = engine
                .submit_at(&owner, &room_code(room)?, date, &start, &end, party_size, &purpose)
                .await?;
            booking(&b)
        }
        Request::Edit {
            id,
            version,
            party_size,
            purpose,
            date,
            start,
            end,
        } => {
            let interval = match (start, end) {
                (Some(start), Some(end)) => {
                    let date = match date {
                        Some(d) => parse_date(&d)?,
                        None => engine.get_for(&owner, id)?.interval.date,
                    };
                    Some(to_interval(date, &start, &end)?)
                }
                (None, None) if date.is_none() => None,
                _ => {
                    return Err(EngineError::InvalidInput("moving a booking needs both start and end".into()).into());
                }
            };
            let changes = BookingEdit {
                party_size,
                purpose,
                interval,
            };
            booking(&engine.edit(&owner, id, version, changes).await?)
        }
        Request::Cancel { id, version } => booking(&engine.cancel(&owner, id, version).await?),
        Request::Approve {
            id,
            version,
            note,
            settle,
        } => booking(&moderate(engine, id, version, ModerationAction::Approve, note, settle).await?),
        Request::Reject {
            id,
            version,
            note,
            settle,
        } => booking(&moderate(engine, id, version, ModerationAction::Reject, note, settle).await?),
        Request::MarkElapsed { id, version } => booking(&engine.mark_elapsed(id, version).await?),
        Request::Get { id } => {
            let b = if identity.is_admin {
                engine.get(id)?
            } else {
                engine.get_for(&owner, id)?
            };
            booking(&b)
        }
        Request::ListMine => bookings(&engine.list_for_owner(&owner)),
        Request::ListForOwner { owner_id } => {
            if !identity.is_admin && owner_id != identity.owner_id {
                return Err(ProtocolError::Forbidden("can only list your own bookings"));
            }
            bookings(&engine.list_for_owner(&OwnerId::new(owner_id)))
        }
        Request::ListPending => bookings(&engine.list_pending()),
        Request::Occupied { room, date } => {
            let date = parse_date(&date)?;
            let slots = engine.occupied(&room_code(room)?, date).await;
            let views: Vec<WindowView> = slots.iter().map(WindowView::occupied).collect();
            Ok(serde_json::to_value(views)?)
        }
        Request::Free {
            room,
            date,
            min_minutes,
        } => {
            let date = parse_date(&date)?;
            let windows = engine
                .free_windows(&room_code(room)?, date, min_minutes.unwrap_or(1))
                .await;
            let views: Vec<WindowView> = windows.into_iter().map(|(s, e)| WindowView::free(s, e)).collect();
            Ok(serde_json::to_value(views)?)
        }
        Request::Watch { room } => {
            let rx = match room {
                Some(room) => engine.notify.subscribe(&room_code(room)?),
                None if identity.is_admin => engine.notify.subscribe_all(),
                None => return Err(ProtocolError::Forbidden("watching every room needs the moderator role")),
            };
            *watch = Some(Watch {
                rx,
                viewer: (!identity.is_admin).then(|| owner.clone()),
            });
            Ok(json!({ "watching": true }))
        }
        Request::Unwatch => {
            *watch = None;
            engine.notify.prune();
            Ok(json!({ "watching": false }))
        }
        Request::Hello { .. } | Request::Rooms => Err(ProtocolError::Malformed("unexpected op".into())),
    }
}
