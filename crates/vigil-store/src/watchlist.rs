//! The watchlist: registry of known persons.

use crate::backend::{Backend, MemoryBackend};
use crate::error::{Result, StoreError};
use crate::export::WatchlistExport;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use vigil_core::{frame, Person, PersonInput, PersonUpdate};

/// Cloneable handle to the shared watchlist.
///
/// Reads are served from memory. Mutations validate first, write through to
/// the backend under the write lock and only then publish the new state, so a
/// failed mutation changes nothing and readers never see a partial update.
#[derive(Clone)]
pub struct WatchlistStore {
    inner: Arc<Inner>,
}

struct Inner {
    persons: RwLock<Arc<Vec<Person>>>,
    backend: Arc<dyn Backend>,
}

impl WatchlistStore {
    /// Load the watchlist from `backend`.
    pub fn open(backend: Arc<dyn Backend>) -> Result<Self> {
        let persons = backend.load_persons()?;
        tracing::info!(persons = persons.len(), "watchlist loaded");
        Ok(Self {
            inner: Arc::new(Inner {
                persons: RwLock::new(Arc::new(persons)),
                backend,
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                persons: RwLock::new(Arc::new(Vec::new())),
                backend: Arc::new(MemoryBackend::new()),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<Vec<Person>>> {
        self.inner.persons.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<Vec<Person>>> {
        self.inner.persons.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a person and return the assigned id.
    pub fn add(&self, input: PersonInput) -> Result<String> {
        validate_name(&input.name)?;
        validate_image(&input.reference_image)?;

        let mut persons = self.write();
        let mut id = uuid::Uuid::new_v4().to_string();
        while persons.iter().any(|p| p.id == id) {
            id = uuid::Uuid::new_v4().to_string();
        }

        let person = Person::from_input(id.clone(), input, Utc::now());
        self.inner.backend.upsert_persons(std::slice::from_ref(&person))?;
        tracing::info!(id = %person.id, status = person.status.as_str(), "person added");
        Arc::make_mut(&mut persons).push(person);
        Ok(id)
    }

    pub fn update(&self, id: &str, update: PersonUpdate) -> Result<()> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        if let Some(image) = &update.reference_image {
            validate_image(image)?;
        }

        let mut persons = self.write();
        let index = position(&persons, id)?;
        let mut updated = persons[index].clone();
        update.apply_to(&mut updated);

        self.inner.backend.upsert_persons(std::slice::from_ref(&updated))?;
        tracing::info!(id, "person updated");
        Arc::make_mut(&mut persons)[index] = updated;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut persons = self.write();
        let index = position(&persons, id)?;
        self.inner.backend.delete_person(id)?;
        tracing::info!(id, "person deleted");
        Arc::make_mut(&mut persons).remove(index);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Person> {
        self.read()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// All persons in insertion order.
    pub fn list(&self) -> Vec<Person> {
        Vec::clone(&self.read())
    }

    /// Persons whose name or notes contain `query`, case-insensitively.
    /// An empty query returns everyone.
    pub fn search(&self, query: &str) -> Vec<Person> {
        let needle = query.to_lowercase();
        self.read()
            .iter()
            .filter(|p| p.matches_lowercase(&needle))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Consistent point-in-time view for matching. Later mutations do not
    /// affect a snapshot already taken.
    pub fn snapshot(&self) -> Arc<Vec<Person>> {
        self.read().clone()
    }

    pub fn export(&self) -> WatchlistExport {
        WatchlistExport::new(self.list())
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    /// Merge an export into the watchlist, keyed by id.
    ///
    /// Ids, timestamps and every other field are kept exactly. The whole
    /// document is validated before anything is written; on error nothing
    /// changes. Returns the number of persons imported.
    pub fn import(&self, export: WatchlistExport) -> Result<usize> {
        if !export.is_supported() {
            return Err(StoreError::UnsupportedVersion(export.version));
        }

        let mut seen = HashSet::new();
        for person in &export.persons {
            if person.id.trim().is_empty() {
                return Err(StoreError::Validation("person id is empty".into()));
            }
            if !seen.insert(person.id.as_str()) {
                return Err(StoreError::Validation(format!(
                    "duplicate person id {} in import",
                    person.id
                )));
            }
            validate_name(&person.name)?;
            validate_image(&person.reference_image)
                .map_err(|e| StoreError::Validation(format!("{}: {e}", person.id)))?;
        }

        let mut persons = self.write();
        self.inner.backend.upsert_persons(&export.persons)?;

        let table = Arc::make_mut(&mut persons);
        for person in &export.persons {
            match table.iter_mut().find(|p| p.id == person.id) {
                Some(existing) => *existing = person.clone(),
                None => table.push(person.clone()),
            }
        }
        tracing::info!(count = export.persons.len(), "watchlist imported");
        Ok(export.persons.len())
    }

    pub fn import_json(&self, json: &str) -> Result<usize> {
        self.import(serde_json::from_str(json)?)
    }
}

fn position(persons: &[Person], id: &str) -> Result<usize> {
    persons
        .iter()
        .position(|p| p.id == id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation("name is required".into()));
    }
    Ok(())
}

fn validate_image(bytes: &[u8]) -> Result<()> {
    frame::decode_reference(bytes)
        .map(|_| ())
        .map_err(|e| StoreError::Validation(format!("reference image: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteBackend;
    use image::GrayImage;
    use std::io::Cursor;
    use vigil_core::PersonStatus;

    pub(crate) fn png(shade: u8) -> Vec<u8> {
        let img = GrayImage::from_pixel(4, 4, image::Luma([shade]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn input(name: &str, notes: Option<&str>) -> PersonInput {
        PersonInput {
            name: name.into(),
            status: PersonStatus::Safe,
            reference_image: png(120),
            notes: notes.map(str::to_string),
        }
    }

    #[test]
    fn test_add_then_get_returns_input_with_id() {
        let store = WatchlistStore::in_memory();
        let original = input("Ada Lovelace", Some("analyst"));
        let id = store.add(original.clone()).unwrap();

        let person = store.get(&id).unwrap();
        assert_eq!(person.id, id);
        assert_eq!(person.name, original.name);
        assert_eq!(person.status, original.status);
        assert_eq!(person.reference_image, original.reference_image);
        assert_eq!(person.notes, original.notes);
    }

    #[test]
    fn test_add_requires_name_and_image() {
        let store = WatchlistStore::in_memory();
        assert!(matches!(store.add(input("  ", None)), Err(StoreError::Validation(_))));

        let mut no_image = input("Bob", None);
        no_image.reference_image.clear();
        assert!(matches!(store.add(no_image), Err(StoreError::Validation(_))));

        let mut garbage = input("Bob", None);
        garbage.reference_image = b"definitely not a png".to_vec();
        assert!(matches!(store.add(garbage), Err(StoreError::Validation(_))));

        assert!(store.is_empty());
    }

    #[test]
    fn test_ids_unique_and_deleted_ids_disappear() {
        let store = WatchlistStore::in_memory();
        let ids: Vec<String> = (0..20)
            .map(|i| store.add(input(&format!("p{i}"), None)).unwrap())
            .collect();
        for id in ids.iter().step_by(3) {
            store.delete(id).unwrap();
        }

        let listed: Vec<String> = store.list().into_iter().map(|p| p.id).collect();
        let unique: HashSet<&String> = listed.iter().collect();
        assert_eq!(unique.len(), listed.len());
        for id in ids.iter().step_by(3) {
            assert!(!listed.contains(id));
            assert!(matches!(store.get(id), Err(StoreError::NotFound(_))));
        }
        assert_eq!(listed.len(), 20 - 7);
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let store = WatchlistStore::in_memory();
        let a = store.add(input("a", None)).unwrap();
        let b = store.add(input("b", None)).unwrap();
        let c = store.add(input("c", None)).unwrap();
        store.update(&a, PersonUpdate { name: Some("z".into()), ..Default::default() }).unwrap();
        let ids: Vec<String> = store.list().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn test_update_and_delete_unknown_id() {
        let store = WatchlistStore::in_memory();
        let err = store.update("missing", PersonUpdate::default()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "missing"));
        assert!(matches!(store.delete("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_update_validation_leaves_person_untouched() {
        let store = WatchlistStore::in_memory();
        let id = store.add(input("Carol", None)).unwrap();
        let bad = PersonUpdate {
            name: Some("Caroline".into()),
            reference_image: Some(vec![0, 1, 2]),
            ..Default::default()
        };
        assert!(matches!(store.update(&id, bad), Err(StoreError::Validation(_))));
        assert_eq!(store.get(&id).unwrap().name, "Carol");

        let ok = PersonUpdate { status: Some(PersonStatus::Flagged), ..Default::default() };
        store.update(&id, ok).unwrap();
        assert!(store.get(&id).unwrap().is_flagged());
    }

    #[test]
    fn test_search_is_subset_of_list() {
        let store = WatchlistStore::in_memory();
        store.add(input("Dana Scully", Some("FBI"))).unwrap();
        store.add(input("Fox Mulder", Some("believer, fbi"))).unwrap();
        store.add(input("Walter Skinner", None)).unwrap();

        assert_eq!(store.search("").len(), 3);
        assert_eq!(store.search("fbi").len(), 2);
        assert_eq!(store.search("SKIN").len(), 1);
        assert!(store.search("cigarette").is_empty());

        let all = store.list();
        for query in ["a", "fbi", "er"] {
            let expected: Vec<_> = all
                .iter()
                .filter(|p| {
                    p.name.to_lowercase().contains(query)
                        || p.notes.as_deref().unwrap_or("").to_lowercase().contains(query)
                })
                .cloned()
                .collect();
            assert_eq!(store.search(query), expected);
        }
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_mutations() {
        let store = WatchlistStore::in_memory();
        let id = store.add(input("Eve", None)).unwrap();
        let snapshot = store.snapshot();
        store.delete(&id).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert!(store.is_empty());
    }

    #[test]
    fn test_export_import_roundtrip() {
        let source = WatchlistStore::in_memory();
        source.add(input("Frank", Some("watch the docks"))).unwrap();
        let flagged = source
            .add(PersonInput { status: PersonStatus::Flagged, ..input("Grace", None) })
            .unwrap();

        let json = source.export_json().unwrap();
        let target = WatchlistStore::in_memory();
        assert_eq!(target.import_json(&json).unwrap(), 2);
        assert_eq!(target.list(), source.list());
        assert!(target.get(&flagged).unwrap().is_flagged());

        // importing again is idempotent
        target.import_json(&json).unwrap();
        assert_eq!(target.list(), source.list());
    }

    #[test]
    fn test_import_rejects_whole_document_on_bad_entry() {
        let source = WatchlistStore::in_memory();
        source.add(input("Heidi", None)).unwrap();
        let mut export = source.export();
        let mut broken = export.persons[0].clone();
        broken.id = "other".into();
        broken.reference_image = vec![1, 2, 3];
        export.persons.push(broken);

        let target = WatchlistStore::in_memory();
        assert!(matches!(target.import(export), Err(StoreError::Validation(_))));
        assert!(target.is_empty());
    }

    #[test]
    fn test_import_rejects_future_version() {
        let mut export = WatchlistExport::new(Vec::new());
        export.version = "2.0".into();
        let store = WatchlistStore::in_memory();
        assert!(matches!(store.import(export), Err(StoreError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_sqlite_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchlist.db");

        let id = {
            let store = WatchlistStore::open(SqliteBackend::open(&path).unwrap().into_shared()).unwrap();
            let id = store.add(input("Ivan", Some("night shift"))).unwrap();
            store.update(&id, PersonUpdate { status: Some(PersonStatus::Flagged), ..Default::default() }).unwrap();
            store.add(input("Judy", None)).unwrap();
            id
        };

        let store = WatchlistStore::open(SqliteBackend::open(&path).unwrap().into_shared()).unwrap();
        assert_eq!(store.len(), 2);
        let ivan = store.get(&id).unwrap();
        assert!(ivan.is_flagged());
        assert_eq!(ivan.notes.as_deref(), Some("night shift"));
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_updates() {
        let store = WatchlistStore::in_memory();
        let id = store.add(input("Mallory", Some("v0"))).unwrap();

        let writer = {
            let store = store.clone();
            let id = id.clone();
            std::thread::spawn(move || {
                for i in 1..200 {
                    let v = format!("v{i}");
                    store
                        .update(&id, PersonUpdate {
                            name: Some(v.clone()),
                            notes: Some(v),
                            ..Default::default()
                        })
                        .unwrap();
                }
            })
        };

        for _ in 0..500 {
            let p = store.get(&id).unwrap();
            if p.name != "Mallory" {
                assert_eq!(Some(p.name.as_str()), p.notes.as_deref());
            }
        }
        writer.join().unwrap();
    }
}
