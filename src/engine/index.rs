use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedDay = Arc<RwLock<DaySchedule>>;

/// Blocking intervals of one room on one date, sorted by start.
///
/// Slots never overlap: `insert` is the only way in and it refuses conflicts.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    key: DayKey,
    slots: Vec<Slot>,
}

impl DaySchedule {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            slots: Vec::new(),
        }
    }

    pub fn key(&self) -> &DayKey {
        &self.key
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots overlapping `[start, end)`.
    /// Binary search skips every slot starting at or after `end`.
    pub fn overlapping(&self, start: u16, end: u16) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.start < end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.end > start)
    }

    pub fn first_conflict(&self, interval: &TimeInterval) -> Option<Ulid> {
        debug_assert_eq!(interval.date, self.key.date);
        self.overlapping(interval.start, interval.end).next().map(|s| s.id)
    }

    /// True when `interval` collides with a blocking booking.
    pub fn query(&self, interval: &TimeInterval) -> bool {
        self.first_conflict(interval).is_some()
    }

    /// Checked insert. On conflict nothing changes and the blocking id is returned.
    pub fn insert(&mut self, id: Ulid, interval: &TimeInterval) -> Result<(), Ulid> {
        if let Some(conflict) = self.first_conflict(interval) {
            return Err(conflict);
        }
        let slot = Slot {
            id,
            start: interval.start,
            end: interval.end,
        };
        let pos = self.slots.partition_point(|s| s.start < slot.start);
        self.slots.insert(pos, slot);
        Ok(())
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    /// Gaps inside `[open, close)` not covered by any slot, at least `min_minutes` long.
    pub fn free_windows(&self, open: u16, close: u16, min_minutes: u16) -> Vec<(u16, u16)> {
        let mut free = Vec::new();
        let mut cursor = open;
        for slot in self.overlapping(open, close) {
            if slot.start > cursor {
                free.push((cursor, slot.start));
            }
            cursor = cursor.max(slot.end);
        }
        if cursor < close {
            free.push((cursor, close));
        }
        free.retain(|(s, e)| e - s >= min_minutes.max(1));
        free
    }
}

/// Write guards over one or more day shards, acquired in key order.
pub struct DayLocks {
    guards: Vec<OwnedRwLockWriteGuard<DaySchedule>>,
}

impl DayLocks {
    pub fn get_mut(&mut self, key: &DayKey) -> Option<&mut DaySchedule> {
        self.guards
            .iter_mut()
            .find(|g| g.key() == key)
            .map(|g| &mut **g)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DayKey> {
        self.guards.iter().map(|g| g.key())
    }
}

/// Per-(room, date) interval sets. Each shard is its own lock, so conflict checks
/// for different rooms or days never contend.
#[derive(Default)]
pub struct AvailabilityIndex {
    days: DashMap<DayKey, SharedDay>,
}

impl AvailabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the blocking bookings of a ledger. Conflicting entries are returned
    /// instead of indexed.
    pub fn rebuild<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> (Self, Vec<Ulid>) {
        let mut days: HashMap<DayKey, DaySchedule> = HashMap::new();
        let mut rejected = Vec::new();
        for booking in bookings.into_iter().filter(|b| b.is_blocking()) {
            let key = booking.day_key();
            let day = days
                .entry(key.clone())
                .or_insert_with(|| DaySchedule::new(key));
            if day.insert(booking.id, &booking.interval).is_err() {
                rejected.push(booking.id);
            }
        }
        let index = Self::new();
        for (key, day) in days {
            index.days.insert(key, Arc::new(RwLock::new(day)));
        }
        (index, rejected)
    }

    pub fn day(&self, key: &DayKey) -> SharedDay {
        if let Some(day) = self.days.get(key) {
            return day.value().clone();
        }
        self.days
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(key.clone()))))
            .value()
            .clone()
    }

    pub fn day_count(&self) -> usize {
        self.days.len()
    }

    pub async fn lock(&self, key: &DayKey) -> OwnedRwLockWriteGuard<DaySchedule> {
        self.day(key).write_owned().await
    }

    /// Lock several shards. Sorted, deduplicated order prevents deadlocks between
    /// callers that need overlapping sets of days.
    pub async fn lock_many(&self, mut keys: Vec<DayKey>) -> DayLocks {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key).await);
        }
        DayLocks { guards }
    }

    pub async fn query(&self, room: &RoomCode, interval: &TimeInterval) -> bool {
        let key = DayKey::new(room.clone(), interval.date);
        match self.days.get(&key).map(|d| d.value().clone()) {
            Some(day) => day.read().await.query(interval),
            None => false,
        }
    }

    pub async fn insert(&self, room: &RoomCode, interval: &TimeInterval, id: Ulid) -> Result<(), Ulid> {
        let key = DayKey::new(room.clone(), interval.date);
        self.lock(&key).await.insert(id, interval)
    }

    pub async fn remove(&self, room: &RoomCode, interval: &TimeInterval, id: Ulid) -> bool {
        let key = DayKey::new(room.clone(), interval.date);
        match self.days.get(&key).map(|d| d.value().clone()) {
            Some(day) => day.write().await.remove(id).is_some(),
            None => false,
        }
    }

    pub async fn slots(&self, key: &DayKey) -> Vec<Slot> {
        match self.days.get(key).map(|d| d.value().clone()) {
            Some(day) => day.read().await.slots().to_vec(),
            None => Vec::new(),
        }
    }

    pub async fn free_windows(&self, key: &DayKey, open: u16, close: u16, min_minutes: u16) -> Vec<(u16, u16)> {
        match self.days.get(key).map(|d| d.value().clone()) {
            Some(day) => day.read().await.free_windows(open, close, min_minutes),
            None if close > open && close - open >= min_minutes.max(1) => vec![(open, close)],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 4).unwrap()
    }

    fn room() -> RoomCode {
        RoomCode::new("E113")
    }

    fn iv(start: u16, end: u16) -> TimeInterval {
        TimeInterval::new(date(), start, end)
    }

    fn day() -> DaySchedule {
        DaySchedule::new(DayKey::new(room(), date()))
    }

    #[test]
    fn insert_keeps_slots_sorted() {
        let mut d = day();
        d.insert(Ulid::new(), &iv(600, 660)).unwrap();
        d.insert(Ulid::new(), &iv(480, 540)).unwrap();
        d.insert(Ulid::new(), &iv(540, 600)).unwrap();
        let starts: Vec<u16> = d.slots().iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![480, 540, 600]);
    }

    #[test]
    fn back_to_back_is_not_a_conflict() {
        let mut d = day();
        d.insert(Ulid::new(), &iv(540, 600)).unwrap();
        assert!(!d.query(&iv(600, 660)));
        assert!(!d.query(&iv(480, 540)));
        assert!(d.query(&iv(599, 601)));
    }

    #[test]
    fn checked_insert_refuses_overlap() {
        let mut d = day();
        let first = Ulid::new();
        d.insert(first, &iv(540, 600)).unwrap();
        assert_eq!(d.insert(Ulid::new(), &iv(570, 630)), Err(first));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn overlapping_skips_earlier_and_later_slots() {
        let mut d = day();
        d.insert(Ulid::new(), &iv(60, 120)).unwrap();
        let hit = Ulid::new();
        d.insert(hit, &iv(450, 600)).unwrap();
        d.insert(Ulid::new(), &iv(1000, 1100)).unwrap();
        let hits: Vec<_> = d.overlapping(500, 800).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, hit);
    }

    #[test]
    fn wide_query_sees_enclosed_slot() {
        let mut d = day();
        d.insert(Ulid::new(), &iv(500, 510)).unwrap();
        assert!(d.query(&iv(0, 1439)));
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut d = day();
        d.insert(Ulid::new(), &iv(100, 200)).unwrap();
        assert!(d.remove(Ulid::new()).is_none());
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut d = day();
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            let start = i as u16 * 100;
            d.insert(*id, &iv(start, start + 50)).unwrap();
        }
        d.remove(ids[1]);
        let left: Vec<Ulid> = d.slots().iter().map(|s| s.id).collect();
        assert_eq!(left, vec![ids[0], ids[2]]);
    }

    #[test]
    fn free_windows_between_slots() {
        let mut d = day();
        d.insert(Ulid::new(), &iv(540, 600)).unwrap();
        d.insert(Ulid::new(), &iv(660, 720)).unwrap();
        assert_eq!(d.free_windows(480, 1080, 1), vec![(480, 540), (600, 660), (720, 1080)]);
        assert_eq!(d.free_windows(480, 1080, 90), vec![(720, 1080)]);
    }

    #[test]
    fn free_windows_clamped_to_opening_hours() {
        let mut d = day();
        d.insert(Ulid::new(), &iv(420, 510)).unwrap();
        d.insert(Ulid::new(), &iv(1020, 1200)).unwrap();
        assert_eq!(d.free_windows(480, 1080, 1), vec![(510, 1020)]);
    }

    #[tokio::test]
    async fn index_insert_query_remove_roundtrip() {
        let index = AvailabilityIndex::new();
        let id = Ulid::new();
        assert!(!index.query(&room(), &iv(540, 600)).await);
        index.insert(&room(), &iv(540, 600), id).await.unwrap();
        assert!(index.query(&room(), &iv(570, 630)).await);
        assert!(!index.query(&RoomCode::new("E107"), &iv(570, 630)).await);
        assert!(index.remove(&room(), &iv(540, 600), id).await);
        assert!(!index.query(&room(), &iv(570, 630)).await);
    }

    #[tokio::test]
    async fn lock_many_dedups_and_orders() {
        let index = AvailabilityIndex::new();
        let a = DayKey::new(room(), date());
        let b = DayKey::new(room(), date().succ_opt().unwrap());
        let mut locks = index.lock_many(vec![b.clone(), a.clone(), b.clone()]).await;
        let keys: Vec<DayKey> = locks.keys().cloned().collect();
        assert_eq!(keys, vec![a.clone(), b]);
        locks.get_mut(&a).unwrap().insert(Ulid::new(), &iv(0, 60)).unwrap();
        drop(locks);
        assert_eq!(index.slots(&a).await.len(), 1);
    }

    #[test]
    fn rebuild_indexes_only_blocking_bookings() {
        let make = |status, start, end| Booking {
            id: Ulid::new(),
            owner: OwnerId::new("u"),
            room: room(),
            interval: iv(start, end),
            party_size: 1,
            purpose: "p".into(),
            status,
            tracking_note: None,
            version: 0,
            created_at: 0,
            updated_at: 0,
        };
        let bookings = vec![
            make(BookingStatus::Active, 540, 600),
            make(BookingStatus::Cancelled, 540, 600),
            make(BookingStatus::Pending, 600, 660),
            make(BookingStatus::Done, 0, 60),
        ];
        let (index, rejected) = AvailabilityIndex::rebuild(&bookings);
        assert!(rejected.is_empty());
        assert_eq!(index.day_count(), 1);
    }
}
