//! Detection pipeline: frame → regions → match outcomes → result log → alerts.
//!
//! Each stream runs at most one detect+match cycle at a time. A frame that
//! arrives while a cycle is in flight is dropped, never queued.

use crate::alert::{AlertContext, AlertCoordinator};
use crate::source::FrameSource;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use vigil_core::{
    DetectionResult, Detector, FaceRegion, FrameError, ImageBuffer, MatchOutcome, Matcher, Origin,
    Person,
};
use vigil_store::{ResultLog, WatchlistStore};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),
    #[error("unknown stream {0}")]
    UnknownStream(String),
    #[error("stream {0} is busy")]
    Busy(String),
    #[error("no frame captured for stream {0}")]
    NoFrame(String),
    #[error("processing task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Active,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// A cycle for the stream was still in flight.
    DroppedBusy,
    /// The stream is not active.
    Ignored,
}

/// Per-stream session context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamContext {
    pub alert: AlertContext,
}

struct Stream {
    state: StreamState,
    context: StreamContext,
    busy: Arc<AtomicBool>,
    last_frame: Option<Arc<ImageBuffer>>,
}

/// Clears the stream's busy flag when the cycle ends, however it ends.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn try_claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct CycleCore {
    detector: Arc<dyn Detector>,
    matcher: Arc<dyn Matcher>,
    watchlist: WatchlistStore,
}

impl CycleCore {
    /// One detect+match pass. Returns `None` when the frame yields no usable
    /// regions. Detection and match failures are absorbed here.
    fn run_cycle(
        &self,
        frame: Arc<ImageBuffer>,
        origin: Origin,
        stream_id: Option<String>,
    ) -> Option<DetectionResult> {
        let regions = match self.detector.detect(&frame) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(stream = ?stream_id, error = %e, "detection failed; frame skipped");
                return None;
            }
        };

        let detected = regions.len();
        let regions: Vec<FaceRegion> = regions
            .into_iter()
            .filter(|r| r.bounding_box.within(frame.width, frame.height))
            .collect();
        if regions.len() < detected {
            tracing::debug!(
                stream = ?stream_id,
                discarded = detected - regions.len(),
                "discarded regions outside the frame"
            );
        }
        if regions.is_empty() {
            return None;
        }

        let snapshot = self.watchlist.snapshot();
        let outcomes: Vec<MatchOutcome> = regions
            .iter()
            .map(|region| match self.matcher.match_region(&frame, region, &snapshot) {
                Ok(outcome) if outcome.is_match && !in_snapshot(&outcome, &snapshot) => {
                    tracing::warn!(stream = ?stream_id, "matcher returned a person outside the snapshot");
                    MatchOutcome::no_match(*region)
                }
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(stream = ?stream_id, error = %e, "match failed; region recorded as unknown");
                    MatchOutcome::no_match(*region)
                }
            })
            .collect();

        tracing::debug!(
            stream = ?stream_id,
            regions = outcomes.len(),
            matches = outcomes.iter().filter(|o| o.is_match).count(),
            "cycle complete"
        );
        Some(DetectionResult::new(frame, outcomes, origin, stream_id))
    }
}

fn in_snapshot(outcome: &MatchOutcome, snapshot: &[Person]) -> bool {
    outcome
        .matched_person_id
        .as_deref()
        .is_some_and(|id| snapshot.iter().any(|p| p.id == id))
}

pub struct DetectionPipeline {
    core: Arc<CycleCore>,
    log: Arc<ResultLog>,
    alerts: Option<Arc<AlertCoordinator>>,
    streams: Mutex<HashMap<String, Stream>>,
}

impl DetectionPipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        matcher: Arc<dyn Matcher>,
        watchlist: WatchlistStore,
        log: Arc<ResultLog>,
    ) -> Self {
        Self {
            core: Arc::new(CycleCore {
                detector,
                matcher,
                watchlist,
            }),
            log,
            alerts: None,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertCoordinator>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn log(&self) -> &Arc<ResultLog> {
        &self.log
    }

    pub fn watchlist(&self) -> &WatchlistStore {
        &self.core.watchlist
    }

    pub fn alerts(&self) -> Option<&Arc<AlertCoordinator>> {
        self.alerts.as_ref()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a stream active with the given context. Restarting an active or
    /// paused stream replaces its context.
    pub fn start(&self, stream_id: &str, context: StreamContext) {
        let mut streams = self.streams();
        let stream = streams.entry(stream_id.to_string()).or_insert_with(|| Stream {
            state: StreamState::Idle,
            context: StreamContext::default(),
            busy: Arc::new(AtomicBool::new(false)),
            last_frame: None,
        });
        stream.state = StreamState::Active;
        stream.context = context;
        tracing::info!(stream = stream_id, "stream started");
    }

    pub fn pause(&self, stream_id: &str) -> Result<(), PipelineError> {
        self.transition(stream_id, StreamState::Active, StreamState::Paused)
    }

    pub fn resume(&self, stream_id: &str) -> Result<(), PipelineError> {
        self.transition(stream_id, StreamState::Paused, StreamState::Active)
    }

    fn transition(&self, stream_id: &str, from: StreamState, to: StreamState) -> Result<(), PipelineError> {
        let mut streams = self.streams();
        let stream = streams
            .get_mut(stream_id)
            .filter(|s| s.state != StreamState::Idle)
            .ok_or_else(|| PipelineError::UnknownStream(stream_id.to_string()))?;
        if stream.state == from {
            stream.state = to;
            tracing::info!(stream = stream_id, state = ?to, "stream state changed");
        }
        Ok(())
    }

    /// Return the stream to idle. A cycle already in flight still completes
    /// and is logged.
    pub fn stop(&self, stream_id: &str) {
        if let Some(stream) = self.streams().get_mut(stream_id) {
            stream.state = StreamState::Idle;
            stream.context = StreamContext::default();
            stream.last_frame = None;
            tracing::info!(stream = stream_id, "stream stopped");
        }
    }

    pub fn state(&self, stream_id: &str) -> StreamState {
        self.streams()
            .get(stream_id)
            .map_or(StreamState::Idle, |s| s.state)
    }

    /// Ids and states of every non-idle stream.
    pub fn streams_status(&self) -> Vec<(String, StreamState)> {
        let mut status: Vec<_> = self
            .streams()
            .iter()
            .filter(|(_, s)| s.state != StreamState::Idle)
            .map(|(id, s)| (id.clone(), s.state))
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    pub fn is_busy(&self, stream_id: &str) -> bool {
        self.streams()
            .get(stream_id)
            .is_some_and(|s| s.busy.load(Ordering::Acquire))
    }

    /// Claim the stream for one cycle, copying the frame.
    fn claim(&self, stream_id: &str, frame: &ImageBuffer) -> Result<(InFlight, Arc<ImageBuffer>, StreamContext), SubmitOutcome> {
        let mut streams = self.streams();
        let Some(stream) = streams
            .get_mut(stream_id)
            .filter(|s| s.state == StreamState::Active)
        else {
            return Err(SubmitOutcome::Ignored);
        };
        let guard = InFlight::try_claim(&stream.busy).ok_or(SubmitOutcome::DroppedBusy)?;
        let frame = Arc::new(frame.clone());
        stream.last_frame = Some(frame.clone());
        Ok((guard, frame, stream.context.clone()))
    }

    /// Offer a frame to an active stream. The cycle runs in the background;
    /// this never waits for it. Must run inside a tokio runtime.
    pub fn submit_frame(self: &Arc<Self>, stream_id: &str, frame: &ImageBuffer) -> SubmitOutcome {
        let (guard, frame, context) = match self.claim(stream_id, frame) {
            Ok(claimed) => claimed,
            Err(outcome) => {
                if outcome == SubmitOutcome::DroppedBusy {
                    tracing::trace!(stream = stream_id, "frame dropped, cycle in flight");
                }
                return outcome;
            }
        };
        self.spawn_cycle(guard, frame, Origin::LiveStream, Some(stream_id.to_string()), context);
        SubmitOutcome::Accepted
    }

    /// Offer a frame and wait for its cycle to finish. Dropping the returned
    /// future does not abort the cycle.
    pub async fn submit_frame_wait(
        self: &Arc<Self>,
        stream_id: &str,
        frame: &ImageBuffer,
    ) -> Result<SubmitOutcome, PipelineError> {
        let (guard, frame, context) = match self.claim(stream_id, frame) {
            Ok(claimed) => claimed,
            Err(outcome) => return Ok(outcome),
        };
        self.spawn_cycle(guard, frame, Origin::LiveStream, Some(stream_id.to_string()), context)
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;
        Ok(SubmitOutcome::Accepted)
    }

    /// Run one claimed cycle to completion on its own task. The task owns
    /// the guard, so the stream stays busy until the result is logged and
    /// alerts have seen it, whatever happens to the caller.
    fn spawn_cycle(
        self: &Arc<Self>,
        guard: InFlight,
        frame: Arc<ImageBuffer>,
        origin: Origin,
        stream_id: Option<String>,
        context: StreamContext,
    ) -> JoinHandle<Result<Option<Arc<DetectionResult>>, PipelineError>> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let core = pipeline.core.clone();
            let label = stream_id.clone();
            let result = tokio::task::spawn_blocking(move || core.run_cycle(frame, origin, stream_id))
                .await
                .map_err(|e| {
                    tracing::error!(stream = ?label, error = %e, "cycle failed");
                    PipelineError::Task(e.to_string())
                })?;

            let Some(result) = result else {
                return Ok(None);
            };
            let result = Arc::new(result);
            pipeline.log.append(result.clone());
            if let Some(alerts) = &pipeline.alerts {
                alerts.on_new_result(&result, &context.alert);
            }
            Ok(Some(result))
        })
    }

    /// Run a one-shot upload through detection and matching. Returns `None`
    /// when no face was found; nothing is logged in that case.
    pub async fn process_image(
        self: &Arc<Self>,
        image: &ImageBuffer,
        context: &StreamContext,
    ) -> Result<Option<Arc<DetectionResult>>, PipelineError> {
        image.validate()?;
        let standalone = InFlight(Arc::new(AtomicBool::new(true)));
        self.spawn_cycle(
            standalone,
            Arc::new(image.clone()),
            Origin::StaticUpload,
            None,
            context.clone(),
        )
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
    }

    /// Run a cycle on the last frame accepted for `stream_id`. Works while
    /// the stream is paused.
    pub async fn capture(
        self: &Arc<Self>,
        stream_id: &str,
    ) -> Result<Option<Arc<DetectionResult>>, PipelineError> {
        let (guard, frame, context) = {
            let streams = self.streams();
            let stream = streams
                .get(stream_id)
                .filter(|s| s.state != StreamState::Idle)
                .ok_or_else(|| PipelineError::UnknownStream(stream_id.to_string()))?;
            let frame = stream
                .last_frame
                .clone()
                .ok_or_else(|| PipelineError::NoFrame(stream_id.to_string()))?;
            let guard = InFlight::try_claim(&stream.busy)
                .ok_or_else(|| PipelineError::Busy(stream_id.to_string()))?;
            (guard, frame, stream.context.clone())
        };
        self.spawn_cycle(guard, frame, Origin::LiveStream, Some(stream_id.to_string()), context)
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?
    }

    /// Pull frames from `source` every `interval` while the stream is
    /// active, until `cancel` fires. No frame is pulled while a cycle for
    /// the stream is in flight.
    pub async fn run_stream<S>(
        self: Arc<Self>,
        stream_id: String,
        source: S,
        interval: Duration,
        cancel: CancellationToken,
    ) where
        S: FrameSource + 'static,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut source = Some(source);
        tracing::info!(stream = %stream_id, ?interval, "stream loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.state(&stream_id) != StreamState::Active || self.is_busy(&stream_id) {
                continue;
            }

            let Some(mut src) = source.take() else { break };
            let pulled = tokio::task::spawn_blocking(move || {
                let frame = src.next_frame();
                (src, frame)
            })
            .await;
            let frame = match pulled {
                Ok((src, frame)) => {
                    source = Some(src);
                    frame
                }
                Err(e) => {
                    tracing::error!(stream = %stream_id, error = %e, "frame source panicked");
                    break;
                }
            };

            let Some(frame) = frame else { continue };
            if cancel.is_cancelled() {
                break;
            }
            match self.submit_frame_wait(&stream_id, &frame).await {
                Ok(SubmitOutcome::Accepted) => {}
                Ok(outcome) => tracing::trace!(stream = %stream_id, ?outcome, "frame not processed"),
                Err(e) => tracing::error!(stream = %stream_id, error = %e, "cycle failed"),
            }
        }
        tracing::info!(stream = %stream_id, "stream loop stopped");
    }
}
