//! Bounded, most-recent-first log of detection results.
//!
//! Appends land in memory immediately and are persisted by a dedicated writer
//! thread, so the detection path never waits on disk.

use crate::backend::Backend;
use crate::error::{Result, StoreError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use vigil_core::DetectionResult;

/// Default number of results retained.
pub const DEFAULT_CAPACITY: usize = 500;

/// Appends queued for the writer beyond this many stay memory-only.
const WRITE_QUEUE_DEPTH: usize = 64;

enum WriterCommand {
    Append(Arc<DetectionResult>),
    Clear(mpsc::Sender<Result<()>>),
    Flush(mpsc::Sender<()>),
    Shutdown,
}

struct Writer {
    sender: Sender<WriterCommand>,
    pending: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl Writer {
    /// Queue an append unless the writer is already `WRITE_QUEUE_DEPTH`
    /// appends behind. Never blocks.
    fn try_append(&self, result: Arc<DetectionResult>) {
        if self.pending.fetch_add(1, Ordering::AcqRel) >= WRITE_QUEUE_DEPTH {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(id = %result.id, "result writer backed up, entry not persisted");
            return;
        }
        if self.sender.send(WriterCommand::Append(result)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!("result writer stopped, entry not persisted");
        }
    }
}

pub struct ResultLog {
    entries: Mutex<VecDeque<Arc<DetectionResult>>>,
    capacity: usize,
    writer: Option<Writer>,
}

impl ResultLog {
    /// Open a persistent log, priming memory with the most recent stored
    /// results.
    pub fn open(backend: Arc<dyn Backend>, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let stored = backend.load_results(capacity)?;
        tracing::info!(results = stored.len(), capacity, "result log loaded");
        let entries = stored.into_iter().map(Arc::new).collect();

        let (sender, receiver) = mpsc::channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let drained = pending.clone();
        let worker = thread::Builder::new()
            .name("vigil-result-writer".into())
            .spawn(move || run_writer(backend, receiver, drained, capacity))
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn result writer");
                StoreError::WriterStopped
            })?;

        Ok(Self {
            entries: Mutex::new(entries),
            capacity,
            writer: Some(Writer {
                sender,
                pending,
                worker: Some(worker),
            }),
        })
    }

    /// Memory-only log; nothing survives the process.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            writer: None,
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<Arc<DetectionResult>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a result as the newest entry, evicting the oldest beyond
    /// capacity. Never blocks on persistence; if the writer is backed up the
    /// entry stays memory-only.
    pub fn append(&self, result: Arc<DetectionResult>) {
        let mut entries = self.entries();
        entries.push_front(result.clone());
        entries.truncate(self.capacity);

        // Sent under the lock so the writer sees appends and clears in the
        // same order as memory.
        if let Some(writer) = &self.writer {
            writer.try_append(result);
        }
    }

    /// Snapshot of all retained results, most recent first.
    pub fn list(&self) -> Vec<Arc<DetectionResult>> {
        self.entries().iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<DetectionResult>> {
        self.entries().iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Remove every result, in memory and on disk. Waits for the backend,
    /// but never while holding the lock `append` needs.
    pub fn clear(&self) -> Result<()> {
        let reply = {
            let mut entries = self.entries();
            entries.clear();
            match &self.writer {
                Some(writer) => {
                    let (tx, rx) = mpsc::channel();
                    writer
                        .sender
                        .send(WriterCommand::Clear(tx))
                        .map_err(|_| StoreError::WriterStopped)?;
                    Some(rx)
                }
                None => None,
            }
        };
        tracing::info!("result log cleared");

        match reply {
            Some(rx) => rx.recv().map_err(|_| StoreError::WriterStopped)?,
            None => Ok(()),
        }
    }

    /// Block until every queued write has been applied.
    pub fn flush(&self) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        let (tx, rx) = mpsc::channel();
        writer
            .sender
            .send(WriterCommand::Flush(tx))
            .map_err(|_| StoreError::WriterStopped)?;
        rx.recv().map_err(|_| StoreError::WriterStopped)
    }
}

impl Drop for ResultLog {
    fn drop(&mut self) {
        if let Some(writer) = &mut self.writer {
            let _ = writer.sender.send(WriterCommand::Shutdown);
            if let Some(worker) = writer.worker.take() {
                if worker.join().is_err() {
                    tracing::error!("result writer panicked");
                }
            }
        }
    }
}

fn run_writer(
    backend: Arc<dyn Backend>,
    commands: Receiver<WriterCommand>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
) {
    tracing::debug!("result writer started");
    while let Ok(command) = commands.recv() {
        match command {
            WriterCommand::Append(result) => {
                if let Err(e) = backend
                    .append_result(&result)
                    .and_then(|_| backend.trim_results(capacity))
                {
                    tracing::error!(id = %result.id, error = %e, "failed to persist result");
                }
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            WriterCommand::Clear(reply) => {
                let outcome = backend.clear_results();
                if let Err(e) = &outcome {
                    tracing::error!(error = %e, "failed to clear stored results");
                }
                let _ = reply.send(outcome);
            }
            WriterCommand::Flush(reply) => {
                let _ = reply.send(());
            }
            WriterCommand::Shutdown => break,
        }
    }
    tracing::debug!("result writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::sqlite::SqliteBackend;
    use std::time::{Duration, Instant};
    use vigil_core::{ImageBuffer, Origin, Person};

    /// Memory backend whose result writes take `delay`.
    struct SlowBackend {
        inner: MemoryBackend,
        delay: Duration,
    }

    impl Backend for SlowBackend {
        fn load_persons(&self) -> Result<Vec<Person>> {
            self.inner.load_persons()
        }
        fn upsert_persons(&self, persons: &[Person]) -> Result<()> {
            self.inner.upsert_persons(persons)
        }
        fn delete_person(&self, id: &str) -> Result<()> {
            self.inner.delete_person(id)
        }
        fn load_results(&self, limit: usize) -> Result<Vec<DetectionResult>> {
            self.inner.load_results(limit)
        }
        fn append_result(&self, result: &DetectionResult) -> Result<()> {
            std::thread::sleep(self.delay);
            self.inner.append_result(result)
        }
        fn trim_results(&self, keep: usize) -> Result<()> {
            self.inner.trim_results(keep)
        }
        fn clear_results(&self) -> Result<()> {
            self.inner.clear_results()
        }
    }

    fn result(tag: &str) -> Arc<DetectionResult> {
        Arc::new(DetectionResult::new(
            Arc::new(ImageBuffer::gray(1, 1, vec![0])),
            Vec::new(),
            Origin::StaticUpload,
            Some(tag.into()),
        ))
    }

    fn tags(log: &ResultLog) -> Vec<String> {
        log.list()
            .iter()
            .map(|r| r.stream_id.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_most_recent_first() {
        let log = ResultLog::in_memory(10);
        for tag in ["a", "b", "c"] {
            log.append(result(tag));
        }
        assert_eq!(tags(&log), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = ResultLog::in_memory(3);
        for i in 0..5 {
            log.append(result(&i.to_string()));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(tags(&log), vec!["4", "3", "2"]);
    }

    #[test]
    fn test_get_and_clear() {
        let log = ResultLog::in_memory(5);
        let r = result("x");
        log.append(r.clone());
        assert_eq!(log.get(&r.id).unwrap().id, r.id);
        assert!(log.get("nope").is_none());

        log.clear().unwrap();
        assert!(log.is_empty());
        assert!(log.get(&r.id).is_none());
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let log = ResultLog::in_memory(5);
        log.append(result("a"));
        let before = log.list();
        log.append(result("b"));
        assert_eq!(before.len(), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_persisted_results_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.db");

        {
            let backend = SqliteBackend::open(&path).unwrap().into_shared();
            let log = ResultLog::open(backend, 2).unwrap();
            for tag in ["a", "b", "c"] {
                log.append(result(tag));
            }
            log.flush().unwrap();
        }

        let backend = SqliteBackend::open(&path).unwrap().into_shared();
        let log = ResultLog::open(backend, 2).unwrap();
        assert_eq!(tags(&log), vec!["c", "b"]);
    }

    #[test]
    fn test_clear_reaches_backend() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let log = ResultLog::open(backend.clone(), 10).unwrap();
        log.append(result("a"));
        log.append(result("b"));
        log.flush().unwrap();
        assert_eq!(backend.load_results(10).unwrap().len(), 2);

        log.clear().unwrap();
        assert!(backend.load_results(10).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_appends_keep_capacity() {
        let log = Arc::new(ResultLog::in_memory(50));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        log.append(result(&format!("{t}-{i}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 50);
    }

    #[test]
    fn test_append_never_waits_behind_pending_clear() {
        let backend: Arc<dyn Backend> = Arc::new(SlowBackend {
            inner: MemoryBackend::new(),
            delay: Duration::from_millis(20),
        });
        let log = Arc::new(ResultLog::open(backend.clone(), 500).unwrap());
        for i in 0..200 {
            log.append(result(&i.to_string()));
        }

        let clearing = {
            let log = log.clone();
            std::thread::spawn(move || log.clear())
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        log.append(result("late"));
        assert!(started.elapsed() < Duration::from_millis(100));

        clearing.join().unwrap().unwrap();
        assert_eq!(tags(&log), vec!["late"]);
        log.flush().unwrap();
        assert!(backend.load_results(500).unwrap().len() <= 1);
    }
}
