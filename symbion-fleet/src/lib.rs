//! Symbion Fleet - command-and-control core for a GPU node fleet
//!
//! - Node registry with deterministic ids and last-known telemetry
//! - One pooled remote-shell session per node
//! - Parallel, best-effort command fan-out with per-node outcomes
//! - Telemetry parsing (GPU, CPU load, memory) into typed metrics
//! - Fleet statistics and named workload deployment

pub mod aggregator;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod fleet;
pub mod models;
pub mod playbook;
pub mod pool;
pub mod registry;
pub mod telemetry;
pub mod transport;
pub mod workload;

pub use aggregator::{summarize, FleetAverages, FleetSnapshot, FleetTotals};
pub use config::{load_config, load_config_from, FleetConfig};
pub use credentials::{Credential, CredentialStore, StaticKeyStore};
pub use dispatcher::{CommandDispatcher, NodeError, Outcome, OutcomeMap, ERROR_PREFIX};
pub use error::{FleetError, Result};
pub use fleet::Fleet;
pub use models::{CpuMetrics, GpuMetrics, MemoryMetrics, Node, NodeId, NodeStatus};
pub use pool::{ConnectResult, ConnectionPool};
pub use registry::NodeRegistry;
pub use telemetry::{ParseError, PollReport, TelemetryCollector};
pub use transport::{CommandOutput, NodeTarget, Session, SshTransport, Transport, TransportError};
pub use workload::{
    DeploymentReport, FirstNPolicy, ServiceDeployment, StepReport, TargetSelection, WorkloadDistributor, WorkloadKind,
};
