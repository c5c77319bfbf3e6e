//! vigild — Detection pipeline, alerting and the D-Bus administration surface.

pub mod alert;
pub mod config;
pub mod dbus_interface;
pub mod notify;
pub mod pipeline;
pub mod source;

pub use alert::{AlertContext, AlertCoordinator, AlertError, AlertPhase, AlertState};
pub use config::Config;
pub use notify::{CommandSink, LogSink, NotificationError, NotificationSink};
pub use pipeline::{DetectionPipeline, PipelineError, StreamContext, StreamState, SubmitOutcome};
pub use source::{DirectorySource, FrameSource, VecSource};
