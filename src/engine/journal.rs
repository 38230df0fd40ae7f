use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::wal::Wal;

use super::EngineError;

/// Durable, ordered record of every committed change. An `append` that returns
/// Ok survives a restart.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, event: &Event) -> Result<(), EngineError>;

    /// Replace the whole journal with `events`.
    async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError>;

    async fn appends_since_compact(&self) -> u64;
}

fn unavailable(e: impl std::fmt::Display) -> EngineError {
    EngineError::Unavailable(e.to_string())
}

// ── Group-commit writer ──────────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("journal writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "journal flush failed");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes never join the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// File-backed journal. All I/O happens on one writer task.
pub struct WalJournal {
    tx: mpsc::Sender<WalCommand>,
}

impl WalJournal {
    /// Replay the file at `path`, then start the writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replayed = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Ok((Self { tx }, replayed.events))
    }
}

#[async_trait]
impl Journal for WalJournal {
    async fn append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| unavailable("journal writer shut down"))?;
        rx.await
            .map_err(|_| unavailable("journal writer dropped response"))?
            .map_err(unavailable)
    }

    async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| unavailable("journal writer shut down"))?;
        rx.await
            .map_err(|_| unavailable("journal writer dropped response"))?
            .map_err(unavailable)
    }

    async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WalCommand::AppendsSinceCompact { response: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// In-process journal for tests and benches. `set_failing(true)` makes every
/// write fail with `Unavailable`.
#[derive(Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<Event>>,
    appends: AtomicU64,
    failing: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), EngineError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("injected journal failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, event: &Event) -> Result<(), EngineError> {
        self.check()?;
        self.events.lock().map_err(unavailable)?.push(event.clone());
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        self.check()?;
        *self.events.lock().map_err(unavailable)? = events;
        self.appends.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        self.appends.load(Ordering::SeqCst)
    }
}
