use crate::alert::AlertError;
use crate::pipeline::{DetectionPipeline, PipelineError, StreamContext};
use serde_json::{json, Value};
use std::sync::Arc;
use vigil_core::{DetectionResult, ImageBuffer, Person, PersonInput, PersonStatus, PersonUpdate};
use vigil_store::{StoreError, WatchlistStore};
use zbus::interface;

pub const BUS_NAME: &str = "org.vigil.Watchlist1";
pub const OBJECT_PATH: &str = "/org/vigil/Watchlist1";

/// D-Bus interface for the Vigil watchlist daemon.
///
/// Bus name: org.vigil.Watchlist1
/// Object path: /org/vigil/Watchlist1
///
/// Structured replies are JSON strings. Person listings omit the reference
/// image; `GetPerson` and `ExportWatchlist` include it base64-encoded.
pub struct VigilService {
    pipeline: Arc<DetectionPipeline>,
    /// Context for uploads and captures that arrive over the bus.
    upload_context: StreamContext,
}

impl VigilService {
    pub fn new(pipeline: Arc<DetectionPipeline>, upload_context: StreamContext) -> Self {
        Self {
            pipeline,
            upload_context,
        }
    }

    fn watchlist(&self) -> &WatchlistStore {
        self.pipeline.watchlist()
    }
}

#[interface(name = "org.vigil.Watchlist1")]
impl VigilService {
    /// Add a person. `status` is "safe" or "flagged"; empty `notes` means none.
    async fn add_person(
        &self,
        name: &str,
        status: &str,
        reference_image: Vec<u8>,
        notes: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, status, "add_person requested");
        let status = parse_status(status)?;
        let input = PersonInput {
            name: name.to_string(),
            status,
            reference_image,
            notes: (!notes.is_empty()).then(|| notes.to_string()),
        };
        let watchlist = self.watchlist().clone();
        blocking(move || watchlist.add(input).map_err(store_error)).await
    }

    /// Apply a partial update given as a JSON object of the changed fields.
    async fn update_person(&self, id: &str, changes: &str) -> zbus::fdo::Result<()> {
        tracing::info!(id, "update_person requested");
        let update: PersonUpdate = serde_json::from_str(changes)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("update: {e}")))?;
        let (watchlist, id) = (self.watchlist().clone(), id.to_string());
        blocking(move || watchlist.update(&id, update).map_err(store_error)).await
    }

    async fn delete_person(&self, id: &str) -> zbus::fdo::Result<()> {
        tracing::info!(id, "delete_person requested");
        let (watchlist, id) = (self.watchlist().clone(), id.to_string());
        blocking(move || watchlist.delete(&id).map_err(store_error)).await
    }

    async fn get_person(&self, id: &str) -> zbus::fdo::Result<String> {
        let person = self.watchlist().get(id).map_err(store_error)?;
        to_json(&person)
    }

    async fn list_persons(&self) -> zbus::fdo::Result<String> {
        Ok(person_list(&self.watchlist().list()).to_string())
    }

    async fn search_persons(&self, query: &str) -> zbus::fdo::Result<String> {
        Ok(person_list(&self.watchlist().search(query)).to_string())
    }

    async fn export_watchlist(&self) -> zbus::fdo::Result<String> {
        tracing::info!("export requested");
        let watchlist = self.watchlist().clone();
        blocking(move || watchlist.export_json().map_err(store_error)).await
    }

    /// Returns the number of persons imported.
    async fn import_watchlist(&self, document: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(bytes = document.len(), "import requested");
        let (watchlist, document) = (self.watchlist().clone(), document.to_string());
        let count = blocking(move || watchlist.import_json(&document).map_err(store_error)).await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Most recent results first. `limit` 0 means all retained results.
    async fn list_results(&self, limit: u32) -> zbus::fdo::Result<String> {
        let mut results = self.pipeline.log().list();
        if limit > 0 {
            results.truncate(limit as usize);
        }
        let results: Vec<Value> = results
            .iter()
            .map(|r| result_summary(r, self.watchlist()))
            .collect();
        Ok(Value::Array(results).to_string())
    }

    async fn clear_results(&self) -> zbus::fdo::Result<()> {
        tracing::info!("clear_results requested");
        let log = self.pipeline.log().clone();
        blocking(move || log.clear().map_err(store_error)).await
    }

    async fn dismiss(&self, person_id: &str) -> zbus::fdo::Result<()> {
        let alerts = self.alerts()?;
        alerts.dismiss(person_id).map_err(alert_error)
    }

    async fn acknowledge(&self, person_id: &str) -> zbus::fdo::Result<()> {
        let alerts = self.alerts()?;
        alerts.acknowledge(person_id).map_err(alert_error)
    }

    async fn active_alerts(&self) -> zbus::fdo::Result<String> {
        let alerts = self.alerts()?;
        to_json(&alerts.active())
    }

    /// Run an encoded image through detection and matching. Returns the
    /// result summary, or `null` when no face was found.
    async fn scan_image(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "scan_image requested");
        let frame = blocking(move || {
            ImageBuffer::from_encoded(&image)
                .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("image: {e}")))
        })
        .await?;
        let result = self
            .pipeline
            .process_image(&frame, &self.upload_context)
            .await
            .map_err(pipeline_error)?;
        Ok(optional_summary(result.as_deref(), self.watchlist()))
    }

    /// Process the last frame of a stream again, e.g. while paused.
    async fn capture(&self, stream_id: &str) -> zbus::fdo::Result<String> {
        let result = self.pipeline.capture(stream_id).await.map_err(pipeline_error)?;
        Ok(optional_summary(result.as_deref(), self.watchlist()))
    }

    async fn pause_stream(&self, stream_id: &str) -> zbus::fdo::Result<()> {
        self.pipeline.pause(stream_id).map_err(pipeline_error)
    }

    async fn resume_stream(&self, stream_id: &str) -> zbus::fdo::Result<()> {
        self.pipeline.resume(stream_id).map_err(pipeline_error)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let streams: Vec<Value> = self
            .pipeline
            .streams_status()
            .into_iter()
            .map(|(id, state)| json!({ "id": id, "state": state }))
            .collect();
        let alerts = self.pipeline.alerts();
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "persons": self.watchlist().len(),
            "results": self.pipeline.log().len(),
            "result_capacity": self.pipeline.log().capacity(),
            "streams": streams,
            "active_alerts": alerts.map_or(0, |a| a.active().len()),
            "alarm": alerts.is_some_and(|a| a.alarm_active()),
        })
        .to_string())
    }
}

impl VigilService {
    fn alerts(&self) -> zbus::fdo::Result<&Arc<crate::alert::AlertCoordinator>> {
        self.pipeline
            .alerts()
            .ok_or_else(|| zbus::fdo::Error::NotSupported("alerting is disabled".into()))
    }
}

/// Run storage or decode work on the blocking pool, off the bus handler's
/// worker thread.
async fn blocking<T, F>(work: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> zbus::fdo::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        tracing::error!(error = %e, "blocking handler task failed");
        zbus::fdo::Error::Failed(e.to_string())
    })?
}

fn parse_status(value: &str) -> zbus::fdo::Result<PersonStatus> {
    PersonStatus::parse(value)
        .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("unknown status '{value}'")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

pub fn store_error(e: StoreError) -> zbus::fdo::Error {
    match e {
        StoreError::Validation(_) | StoreError::UnsupportedVersion(_) | StoreError::Serialization(_) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        StoreError::NotFound(_) => zbus::fdo::Error::FileNotFound(e.to_string()),
        StoreError::Storage(_) | StoreError::WriterStopped => {
            tracing::error!(error = %e, "storage failure");
            zbus::fdo::Error::Failed(e.to_string())
        }
    }
}

fn alert_error(e: AlertError) -> zbus::fdo::Error {
    match e {
        AlertError::NotFound(_) => zbus::fdo::Error::FileNotFound(e.to_string()),
    }
}

fn pipeline_error(e: PipelineError) -> zbus::fdo::Error {
    match e {
        PipelineError::InvalidFrame(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        PipelineError::UnknownStream(_) | PipelineError::NoFrame(_) => {
            zbus::fdo::Error::FileNotFound(e.to_string())
        }
        PipelineError::Busy(_) => zbus::fdo::Error::LimitsExceeded(e.to_string()),
        PipelineError::Task(_) => zbus::fdo::Error::Failed(e.to_string()),
    }
}

/// Person without the reference image.
pub fn person_summary(person: &Person) -> Value {
    json!({
        "id": person.id,
        "name": person.name,
        "status": person.status,
        "notes": person.notes,
        "created_at": person.created_at,
    })
}

fn person_list(persons: &[Person]) -> Value {
    Value::Array(persons.iter().map(person_summary).collect())
}

/// Result metadata with outcomes re-resolved against the current watchlist.
pub fn result_summary(result: &DetectionResult, watchlist: &WatchlistStore) -> Value {
    json!({
        "id": result.id,
        "timestamp": result.timestamp,
        "origin": result.origin,
        "stream_id": result.stream_id,
        "width": result.source_image.width,
        "height": result.source_image.height,
        "outcomes": result.resolve(|id| watchlist.get(id).ok()),
    })
}

fn optional_summary(result: Option<&DetectionResult>, watchlist: &WatchlistStore) -> String {
    result
        .map_or(Value::Null, |r| result_summary(r, watchlist))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::tests::add_person;
    use std::time::Duration;
    use vigil_core::{BoundingBox, FaceRegion, MatchOutcome, Origin};

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_work_leaves_runtime_free() {
        let slow = tokio::spawn(blocking(|| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(7)
        }));
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(slow.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_blocking_work_errors_and_panics_map_to_bus_errors() {
        let err = blocking::<(), _>(|| Err(store_error(StoreError::NotFound("x".into()))))
            .await
            .unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::FileNotFound(_)));

        let err = blocking::<(), _>(|| panic!("backend exploded")).await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::Failed(_)));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            store_error(StoreError::Validation("name".into())),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            store_error(StoreError::NotFound("x".into())),
            zbus::fdo::Error::FileNotFound(_)
        ));
        assert!(matches!(store_error(StoreError::WriterStopped), zbus::fdo::Error::Failed(_)));
        assert!(matches!(
            pipeline_error(PipelineError::Busy("cam".into())),
            zbus::fdo::Error::LimitsExceeded(_)
        ));
    }

    #[test]
    fn test_person_summary_omits_image() {
        let store = WatchlistStore::in_memory();
        let id = add_person(&store, "Peggy", PersonStatus::Flagged);
        let summary = person_summary(&store.get(&id).unwrap());
        assert_eq!(summary["name"], "Peggy");
        assert_eq!(summary["status"], "flagged");
        assert!(summary.get("reference_image").is_none());
    }

    #[test]
    fn test_result_summary_resolves_names_and_dangling() {
        let store = WatchlistStore::in_memory();
        let kept = add_person(&store, "Victor", PersonStatus::Safe);
        let region = FaceRegion::new(BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 }, 1.0);
        let result = DetectionResult::new(
            Arc::new(ImageBuffer::gray(1, 1, vec![0])),
            vec![
                MatchOutcome::matched(region, kept.clone(), 0.9),
                MatchOutcome::matched(region, "gone", 0.85),
                MatchOutcome::no_match(region),
            ],
            Origin::StaticUpload,
            None,
        );

        let summary = result_summary(&result, &store);
        let outcomes = summary["outcomes"].as_array().unwrap();
        assert_eq!(outcomes[0]["classification"], "safe");
        assert_eq!(outcomes[0]["person_name"], "Victor");
        assert_eq!(outcomes[1]["classification"], "unknown");
        assert_eq!(outcomes[1]["dangling"], true);
        assert_eq!(outcomes[2]["dangling"], false);
        assert_eq!(summary["origin"], "static-upload");
    }
}
