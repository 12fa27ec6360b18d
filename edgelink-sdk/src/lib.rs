//! EdgeLink SDK: edge cloudlet discovery and migration for client apps
//!
//! A session goes through:
//! 1. `CloudletResolver`: register with the directory service and find the
//!    best cloudlet (proximity or performance mode)
//! 2. `EdgeEventsManager::start`: open the edge-events channel, run the
//!    location/latency telemetry loops, listen for server triggers
//! 3. Server triggers are evaluated and, when a better cloudlet exists, the
//!    session migrates and the host is told through its callbacks

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod directory;
pub mod error;
pub mod evaluator;
pub mod manager;
pub mod models;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod state;

pub use channel::{EdgeEventsChannel, EventTransport, MqttEventTransport, ServerTrigger};
pub use config::{DirectoryConfig, EdgeEventsConfig, EventsConfig, FindCloudletEventTrigger, UpdateConfig, UpdatePattern};
pub use coordinator::{ConnectionUpgrade, HostCallbacks, MigrationCoordinator, MigrationOutcome};
pub use device::{DeviceInfoProvider, LocationProvider, StaticLocation};
pub use directory::{DirectoryClient, HttpDirectoryClient};
pub use error::{
    ChannelError, DirectoryError, EdgeEventsFailure, FailureReason, FindCloudletFailure, RegisterFailure,
    ResolverError, SetupError,
};
pub use evaluator::{DecisionReason, MigrationDecision, MigrationEvaluator};
pub use manager::EdgeEventsManager;
pub use models::{ClientIdentity, CloudletDescriptor, FindCloudletMode, LatencyStats, Location};
pub use probe::{LatencyTester, NetProbe, TransportProbe};
pub use registry::SessionRegistry;
pub use resolver::CloudletResolver;
pub use scheduler::{LoopKind, UpdateScheduler, UpdateStatus, UpdatesState};
