//! Storage Control Sync - controller/satellite state synchronization
//!
//! A controller holds the authoritative model of a storage cluster and keeps
//! a fleet of per-node satellites consistent with it: authentication, full
//! resynchronization, and strictly ordered incremental updates invalidated
//! by epochs. A shared storage pool lock keeps two nodes from activating
//! resources on the same physical medium at the same time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                Controller                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    Mutation     │  │  Authenticator  │  │   Shared Pool Lock          │  │
//! │  │      API        │  │   Full Sync     │  │   Manager                   │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                                │                                            │
//! │               ┌────────────────┴───────────────┐                            │
//! │               │  Core Model (lock hierarchy)   │                            │
//! │               │  Peer Registry (sharded)       │                            │
//! │               └────────────────┬───────────────┘                            │
//! │                                │                                            │
//! │     Retry / Reconnect / Keep-alive supervisors                              │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                   length-delimited JSON frames                              │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                                Satellite                                    │
//! │  ┌─────────────────┐  ┌────────┴────────┐  ┌─────────────────────────────┐  │
//! │  │ Update Monitor  │  │ Update Applier  │  │   Device Reconciler         │  │
//! │  │ (epoch, status) │  │ (reorder buffer)│  │   Environment Probe         │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Authoritative side, sessions, fan-out and shared pool locks
//! - [`satellite`]: Local projection and the ordered update applier
//! - [`model`]: Collections behind the fixed lock hierarchy
//! - [`protocol`]: Wire messages and framing
//! - [`session`]: Peer sessions and registry
//! - [`supervisor`]: Retry, reconnect and keep-alive loops
//! - [`domain`]: Entities, identities and ports
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod model;
pub mod net;
pub mod protocol;
pub mod satellite;
pub mod session;
pub mod supervisor;

// Re-export commonly used types
pub use config::{ControllerConfig, SatelliteConfig};

pub use controller::{
    Controller, ControllerStatus, DeliveryReport, SharedPoolLockManager,
};

pub use domain::ports::{
    CapabilityReport, DeviceReconciler, EnvironmentProbe, LifecycleControl, RetryDelivery,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::SyncMetrics;

pub use model::{CoreModel, LockObj, LockRequest};

pub use satellite::{
    LoggingReconciler, ProcessLifecycle, Satellite, SatelliteState, SatelliteStatus,
    StaticProbe,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
