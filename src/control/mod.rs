//! Manager-side control plane: account registry, execution process
//! supervision, per-account proxies and the telemetry aggregator.

pub mod aggregator;
pub mod launcher;
pub mod proxy;
pub mod registry;
pub mod supervisor;

pub use aggregator::{
    Aggregator, AggregatorHandle, Subscription, SubscriptionFilter, Telemetry, TelemetryKind,
};
pub use launcher::{CommandLauncher, LaunchSpec, ProcessHandle, ProcessLauncher, Transport, UnixTransport};
pub use proxy::{ExecutionProxy, PushCallback};
pub use registry::{AccountRuntimeRecord, AccountStatus, HeartbeatClock, ProcessState, Registry};
pub use supervisor::{Supervisor, SupervisorEvent, SupervisorHandle};
