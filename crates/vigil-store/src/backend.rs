//! Storage engine abstraction behind the watchlist and the result log.

use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use vigil_core::{DetectionResult, Person};

/// Durable storage for persons and detection results.
///
/// The stores keep the authoritative in-memory view; a backend only has to
/// persist and reload it.
pub trait Backend: Send + Sync {
    /// All persons in insertion order.
    fn load_persons(&self) -> Result<Vec<Person>>;

    /// Insert or replace persons by id, atomically. Replacing keeps the
    /// original insertion position.
    fn upsert_persons(&self, persons: &[Person]) -> Result<()>;

    fn delete_person(&self, id: &str) -> Result<()>;

    /// Up to `limit` results, most recent first.
    fn load_results(&self, limit: usize) -> Result<Vec<DetectionResult>>;

    fn append_result(&self, result: &DetectionResult) -> Result<()>;

    /// Keep only the `keep` most recent results.
    fn trim_results(&self, keep: usize) -> Result<()>;

    fn clear_results(&self) -> Result<()>;
}

/// Process-local backend for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBackend {
    persons: Mutex<Vec<Person>>,
    results: Mutex<VecDeque<DetectionResult>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn load_persons(&self) -> Result<Vec<Person>> {
        Ok(self.persons.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn upsert_persons(&self, persons: &[Person]) -> Result<()> {
        let mut stored = self.persons.lock().unwrap_or_else(PoisonError::into_inner);
        for person in persons {
            match stored.iter_mut().find(|p| p.id == person.id) {
                Some(existing) => *existing = person.clone(),
                None => stored.push(person.clone()),
            }
        }
        Ok(())
    }

    fn delete_person(&self, id: &str) -> Result<()> {
        self.persons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p| p.id != id);
        Ok(())
    }

    fn load_results(&self, limit: usize) -> Result<Vec<DetectionResult>> {
        Ok(self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    fn append_result(&self, result: &DetectionResult) -> Result<()> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(result.clone());
        Ok(())
    }

    fn trim_results(&self, keep: usize) -> Result<()> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .truncate(keep);
        Ok(())
    }

    fn clear_results(&self) -> Result<()> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}
