use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Mark every Active booking whose interval has ended as Done. Returns how many moved.
pub async fn sweep_elapsed(engine: &Engine) -> usize {
    let mut moved = 0;
    for (id, version) in engine.collect_elapsed(engine.now()) {
        match engine.mark_elapsed(id, version).await {
            Ok(_) => {
                moved += 1;
                metrics::counter!(crate::observability::SWEEPER_ELAPSED_TOTAL).increment(1);
                info!(booking = %id, "booking elapsed");
            }
            // Someone else moved it first.
            Err(e) => debug!(booking = %id, error = %e, "sweeper skip"),
        }
    }
    moved
}

/// Background task that periodically retires elapsed bookings.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_elapsed(&engine).await;
    }
}

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.journal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_journal().await {
            warn!(error = %e, appends, "journal compaction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SchedulePolicy;
    use crate::engine::MemoryJournal;
    use crate::model::*;
    use crate::notify::EventHub;
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 4).unwrap()
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweeper_retires_only_ended_active_bookings() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = Engine::with_journal(
            Arc::new(MemoryJournal::new()),
            &[],
            SchedulePolicy::default(),
            clock.clone(),
            Arc::new(EventHub::new()),
        );
        let owner = OwnerId::new("alice");
        let room = RoomCode::new("E113");

        let ended = engine.submit(&owner, &room, TimeInterval::new(day(), 540, 600), 1, "a").await.unwrap();
        engine.approve(ended.id, 0, None).await.unwrap();
        let running = engine.submit(&owner, &room, TimeInterval::new(day(), 600, 720), 1, "b").await.unwrap();
        engine.approve(running.id, 0, None).await.unwrap();
        let pending = engine.submit(&owner, &room, TimeInterval::new(day(), 480, 540), 1, "c").await.unwrap();

        clock.set(TimeInterval::new(day(), 600, 660).start_ms(0));
        assert_eq!(sweep_elapsed(&engine).await, 1);
        assert_eq!(engine.get(ended.id).unwrap().status, BookingStatus::Done);
        assert_eq!(engine.get(running.id).unwrap().status, BookingStatus::Active);
        assert_eq!(engine.get(pending.id).unwrap().status, BookingStatus::Pending);

        // Nothing left to do on a second pass.
        assert_eq!(sweep_elapsed(&engine).await, 0);
    }

    #[tokio::test]
    async fn compactor_runs_past_threshold() {
        let path = test_wal_path("compactor.wal");
        let clock = Arc::new(ManualClock::new(0));
        let engine = Arc::new(
            Engine::open(&path, SchedulePolicy::default(), clock, Arc::new(EventHub::new())).unwrap(),
        );
        let owner = OwnerId::new("alice");
        let room = RoomCode::new("E113");
        for hour in 8u16..12 {
            let b = engine
                .submit(&owner, &room, TimeInterval::new(day(), hour * 60, hour * 60 + 30), 1, "x")
                .await
                .unwrap();
            engine.cancel(&owner, b.id, 0).await.unwrap();
        }
        assert_eq!(engine.journal_appends_since_compact().await, 8);

        let task = tokio::spawn(run_compactor(engine.clone(), 5, Duration::from_secs(1)));
        // The first tick fires immediately; give the task a chance to run it.
        for _ in 0..50 {
            if engine.journal_appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();

        assert_eq!(engine.journal_appends_since_compact().await, 0);
        assert_eq!(crate::wal::Wal::replay(&path).unwrap().events.len(), 4);
    }
}
