//! Batch conversion orchestration: pod creation, lifecycle tracking and
//! conversion pipeline state.

pub mod conversion;
pub mod orchestrator;
pub mod platform;
pub mod tracker;
pub mod types;

pub use conversion::{encode_file_key, ConversionStore};
pub use orchestrator::{BatchCreationOrchestrator, ARTIFACT_KINDS};
pub use platform::{
    conversion_pod_name, optimizer_pod_name, ContainerPlatform, FileStore, HealthVerdict,
    HttpHealthProbe, PodHealthProbe, ServiceEndpoint,
};
pub use tracker::PodLifecycleTracker;
pub use types::{
    ConversionStatus, FileConversionEntry, PodObject, PodPhase, PodSpec, PodStatusSnapshot,
    PodType, WorkerVmEntry, WorkerVmStatus,
};
