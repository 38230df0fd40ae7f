use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use roombook::auth::SharedSecret;
use roombook::clock::SystemClock;
use roombook::config::SchedulePolicy;
use roombook::engine::Engine;
use roombook::model::{BookingStatus, Event};
use roombook::notify::EventHub;
use roombook::protocol::Frame;
use roombook::wire;

const SECRET: &str = "gateway-secret";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roombook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::open(
            &dir.join("bookings.wal"),
            SchedulePolicy::with_rooms(["E113", "B317"]),
            Arc::new(SystemClock),
            Arc::new(EventHub::new()),
        )
        .unwrap(),
    );

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, SharedSecret::new(SECRET.into())).await;
            });
        }
    });

    addr
}

/// A date safely in the future so nothing is refused as already over.
fn booking_date() -> String {
    (chrono::Utc::now().date_naive() + chrono::Days::new(30)).to_string()
}

struct Client {
    conn: Framed<TcpStream, LinesCodec>,
    identity: Value,
    seq: u64,
    pushed: VecDeque<Frame>,
}

impl Client {
    async fn connect(addr: SocketAddr, owner: &str, is_admin: bool) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        let mut conn = Framed::new(socket, LinesCodec::new());
        conn.send(json!({ "op": "hello", "secret": SECRET }).to_string()).await.unwrap();
        let hello: Frame = serde_json::from_str(&conn.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(hello, Frame::Reply { ok: Some(_), .. }), "handshake failed: {hello:?}");
        Self {
            conn,
            identity: json!({ "owner_id": owner, "is_admin": is_admin }),
            seq: 0,
            pushed: VecDeque::new(),
        }
    }

    async fn read_frame(&mut self) -> Option<Frame> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.conn.next())
            .await
            .ok()??
            .ok()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Send one request and wait for its reply, buffering pushed frames.
    async fn call(&mut self, mut request: Value) -> Result<Value, (String, String)> {
        self.seq += 1;
        request["seq"] = json!(self.seq);
        request["identity"] = self.identity.clone();
        self.conn.send(request.to_string()).await.unwrap();
        loop {
            match self.read_frame().await.expect("connection closed before reply") {
                Frame::Reply { seq, ok, error } => {
                    assert_eq!(seq, Some(self.seq));
                    return match (ok, error) {
                        (Some(body), None) => Ok(body),
                        (None, Some(e)) => Err((e.kind, e.message)),
                        other => panic!("reply with neither ok nor error: {other:?}"),
                    };
                }
                pushed => self.pushed.push_back(pushed),
            }
        }
    }

    /// Next pushed `event` or `slot` frame.
    async fn next_push(&mut self) -> Option<Frame> {
        if let Some(frame) = self.pushed.pop_front() {
            return Some(frame);
        }
        match self.read_frame().await? {
            Frame::Reply { .. } => None,
            pushed => Some(pushed),
        }
    }
}

fn submit(room: &str, start: &str, end: &str) -> Value {
    json!({
        "op": "submit",
        "room": room,
        "date": booking_date(),
        "start": start,
        "end": end,
        "party_size": 3,
        "purpose": "study"
    })
}

fn kind(result: Result<Value, (String, String)>) -> String {
    result.expect_err("expected an error reply").0
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_secret_is_refused() {
    let addr = start_test_server().await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut conn = Framed::new(socket, LinesCodec::new());
    conn.send(json!({ "op": "hello", "secret": "guess" }).to_string()).await.unwrap();

    let reply: Frame = serde_json::from_str(&conn.next().await.unwrap().unwrap()).unwrap();
    match reply {
        Frame::Reply { error: Some(e), .. } => assert_eq!(e.kind, "Unauthenticated"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(conn.next().await.is_none(), "server should hang up");
}

#[tokio::test]
async fn submit_then_conflict() {
    let addr = start_test_server().await;
    let mut alice = Client::connect(addr, "alice", false).await;
    let mut bob = Client::connect(addr, "bob", false).await;

    let booking = alice.call(submit("E113", "09:00", "10:00")).await.unwrap();
    assert_eq!(booking["status"], "pending");
    assert_eq!(booking["start"], "09:00");
    assert_eq!(booking["version"], 0);
    assert_eq!(booking["owner_id"], "alice");

    assert_eq!(kind(bob.call(submit("E113", "09:30", "10:30")).await), "SlotUnavailable");
    assert_eq!(kind(bob.call(submit("E113", "9:00", "24:00")).await), "InvalidTimeFormat");
    assert_eq!(kind(bob.call(submit("Z999", "11:00", "12:00")).await), "InvalidInput");
    bob.call(submit("E113", "10:00", "11:00")).await.unwrap();

    let mine = alice.call(json!({ "op": "list_mine" })).await.unwrap();
    assert_eq!(mine.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn moderation_needs_admin_and_current_version() {
    let addr = start_test_server().await;
    let mut alice = Client::connect(addr, "alice", false).await;
    let mut admin = Client::connect(addr, "desk", true).await;

    let booking = alice.call(submit("B317", "13:00", "14:00")).await.unwrap();
    let id = booking["id"].as_str().unwrap().to_string();

    assert_eq!(
        kind(alice.call(json!({ "op": "approve", "id": id, "version": 0 })).await),
        "Forbidden"
    );
    assert_eq!(kind(alice.call(json!({ "op": "list_pending" })).await), "Forbidden");

    let pending = admin.call(json!({ "op": "list_pending" })).await.unwrap();
    assert_eq!(pending[0]["id"], id.as_str());

    let active = admin
        .call(json!({ "op": "approve", "id": id, "version": 0, "note": "key at desk" }))
        .await
        .unwrap();
    assert_eq!(active["status"], "active");
    assert_eq!(active["version"], 1);
    assert_eq!(active["tracking_note"], "key at desk");

    assert_eq!(
        kind(admin.call(json!({ "op": "approve", "id": id, "version": 0 })).await),
        "VersionConflict"
    );
    assert_eq!(
        kind(alice.call(json!({ "op": "cancel", "id": id, "version": 1 })).await),
        "IllegalTransition"
    );
}

#[tokio::test]
async fn owners_only_see_their_own() {
    let addr = start_test_server().await;
    let mut alice = Client::connect(addr, "alice", false).await;
    let mut bob = Client::connect(addr, "bob", false).await;

    let booking = alice.call(submit("E113", "15:00", "16:00")).await.unwrap();
    let id = booking["id"].as_str().unwrap().to_string();

    assert_eq!(kind(bob.call(json!({ "op": "get", "id": id })).await), "NotFound");
    assert_eq!(
        kind(bob.call(json!({ "op": "cancel", "id": id, "version": 0 })).await),
        "NotFound"
    );
    assert_eq!(
        kind(bob.call(json!({ "op": "list_for_owner", "owner_id": "alice" })).await),
        "Forbidden"
    );

    let moved = alice
        .call(json!({ "op": "edit", "id": id, "version": 0, "start": "16:00", "end": "17:00" }))
        .await
        .unwrap();
    assert_eq!(moved["start"], "16:00");
    assert_eq!(moved["version"], 1);

    let occupied = bob
        .call(json!({ "op": "occupied", "room": "E113", "date": booking_date() }))
        .await
        .unwrap();
    assert_eq!(occupied, json!([{ "booking_id": id, "start": "16:00", "end": "17:00" }]));

    let free = bob
        .call(json!({ "op": "free", "room": "E113", "date": booking_date(), "min_minutes": 60 }))
        .await
        .unwrap();
    assert_eq!(free, json!([{ "start": "00:00", "end": "16:00" }, { "start": "17:00", "end": "24:00" }]));
}

#[tokio::test]
async fn watchers_only_see_other_owners_slots() {
    let addr = start_test_server().await;
    let mut watcher = Client::connect(addr, "bob", false).await;
    let mut alice = Client::connect(addr, "alice", false).await;
    let mut admin = Client::connect(addr, "desk", true).await;

    watcher.call(json!({ "op": "watch", "room": "E113" })).await.unwrap();
    assert_eq!(kind(watcher.call(json!({ "op": "watch" })).await), "Forbidden");
    admin.call(json!({ "op": "watch" })).await.unwrap();

    alice.call(submit("B317", "08:00", "09:00")).await.unwrap();
    let booking = alice.call(submit("E113", "08:00", "09:00")).await.unwrap();
    let id = booking["id"].as_str().unwrap().to_string();

    // The failed firehose request left the room subscription in place.
    match watcher.next_push().await.expect("expected a push") {
        Frame::Slot { slot } => {
            assert_eq!(slot.booking_id.to_string(), id);
            assert_eq!(slot.room, "E113");
            assert_eq!(slot.start, "08:00");
            assert_eq!(slot.status, BookingStatus::Pending);
            let text = serde_json::to_string(&slot).unwrap();
            assert!(!text.contains("alice"));
            assert!(!text.contains("study"));
        }
        other => panic!("unexpected {other:?}"),
    }

    admin
        .call(json!({ "op": "approve", "id": id, "version": 0, "note": "key at desk" }))
        .await
        .unwrap();
    match watcher.next_push().await.expect("expected a push") {
        Frame::Slot { slot } => {
            assert_eq!(slot.status, BookingStatus::Active);
            assert_eq!(slot.version, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    // The moderator firehose carries full events for every room.
    let mut rooms_seen = Vec::new();
    for _ in 0..3 {
        match admin.next_push().await.expect("expected a push") {
            Frame::Event { event } => rooms_seen.push(event.room().to_string()),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(rooms_seen, ["B317", "E113", "E113"]);

    // Own bookings still arrive in full.
    let own = watcher.call(submit("E113", "10:00", "11:00")).await.unwrap();
    match watcher.next_push().await.expect("expected a push") {
        Frame::Event {
            event: Event::Submitted { booking: b },
        } => {
            assert_eq!(b.id.to_string(), own["id"].as_str().unwrap());
            assert_eq!(b.owner.as_str(), "bob");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn settled_approve_after_reject_is_a_no_op() {
    let addr = start_test_server().await;
    let mut alice = Client::connect(addr, "alice", false).await;
    let mut desk = Client::connect(addr, "desk", true).await;
    let mut other_desk = Client::connect(addr, "front", true).await;

    let booking = alice.call(submit("B317", "15:00", "16:00")).await.unwrap();
    let id = booking["id"].as_str().unwrap().to_string();

    desk.call(json!({ "op": "reject", "id": id, "version": 0, "note": "room closed" }))
        .await
        .unwrap();
    assert_eq!(
        kind(other_desk.call(json!({ "op": "approve", "id": id, "version": 0 })).await),
        "VersionConflict"
    );
    let settled = other_desk
        .call(json!({ "op": "approve", "id": id, "version": 0, "settle": true }))
        .await
        .unwrap();
    assert_eq!(settled["status"], "cancelled");
    assert_eq!(settled["version"], 1);
    assert_eq!(settled["tracking_note"], "room closed");
}

#[tokio::test]
async fn malformed_frames_keep_the_connection() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr, "alice", false).await;

    client.conn.send("this is not json".to_string()).await.unwrap();
    match client.read_frame().await.unwrap() {
        Frame::Reply { error: Some(e), seq: None, .. } => assert_eq!(e.kind, "Malformed"),
        other => panic!("unexpected {other:?}"),
    }

    let rooms = client.call(json!({ "op": "rooms" })).await.unwrap();
    assert_eq!(rooms, json!(["B317", "E113"]));
    assert_eq!(
        kind(client.call(json!({ "op": "hello", "secret": SECRET })).await),
        "Malformed"
    );
}
