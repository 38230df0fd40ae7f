use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, RoomCode};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking events, per room plus one firehose.
pub struct EventHub {
    channels: DashMap<RoomCode, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one room. Creates the channel if needed.
    pub fn subscribe(&self, room: &RoomCode) -> broadcast::Receiver<Event> {
        self.channels
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn publish(&self, event: &Event) {
        if let Some(sender) = self.channels.get(event.room()) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }

    /// Drop room channels nobody listens to anymore.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub fn room_channels(&self) -> usize {
        self.channels.len()
    }
}
