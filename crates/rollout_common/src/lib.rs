//! Client-side orchestration of Trident A/B updates.
//!
//! Reads a host's status over SSH, rewrites its Host Configuration so the
//! inactive A/B volumes receive a new OS version, runs the remote engine and
//! classifies the result, reconnecting across the reboots an update causes.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod host_config;
pub mod host_status;
pub mod orchestrator;
pub mod outcome;
pub mod retry;
pub mod session;
pub mod ssh;
pub mod transform;
pub mod yaml_tags;

pub use channel::{
    Connector, ExecOutput, FakeChannel, FakeConnector, FakeConnectorBuilder, RemoteChannel,
    Termination,
};
pub use config::RolloutConfig;
pub use engine::{EngineCommand, EngineInvoker, RuntimeEnv};
pub use error::{Result, RolloutError};
pub use host_config::{AllowedOperation, HostConfiguration};
pub use host_status::{AbVolume, HostStatus};
pub use orchestrator::{AbUpdateRequest, Orchestrator, RolloutReport};
pub use outcome::{LogMarkers, Outcome, OutcomeClassifier, SuccessCriterion};
pub use retry::RetryPolicy;
pub use ssh::{SshConnector, SshTarget};
pub use transform::{PackagingFormat, StageParams};
pub use yaml_tags::TagRegistry;
