//! Domain model: jobs, options, capabilities, errors and events.
//!
//! Pure data and pure functions. No I/O happens in this module.

pub mod capabilities;
pub mod classify;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod options;
pub mod stats;

pub use capabilities::ProviderCapabilities;
pub use classify::{BackendFailure, ErrorMapper};
pub use envelope::PayloadEnvelope;
pub use errors::{
    BoxError, Cause, ConfigurationCode, DataCode, ErrorInfo, ErrorKind, JobFailure, QueueError,
    Result, RuntimeCode,
};
pub use events::{QueueEvent, QueueEventKind};
pub use ids::{Id, IdMarker, Instance, InstanceId, JobId, Lease, LeaseId};
pub use job::{
    validate_queue_name, ActiveJob, Job, JobStatus, LeaseToken, Metadata, NackOutcome, NewJob,
};
pub use options::{
    delay_until, JobDefaults, JobIdSource, JobOptions, NormalizedOptions, ProviderOptions,
    Retention, DEFAULT_ATTEMPTS,
};
pub use stats::{HealthStatus, QueueStats};
