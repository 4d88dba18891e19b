//! # magiklaunch
//!
//! **Workload launcher core for edge devices**
//!
//! Given a declarative set of services, layers and instances, this crate
//! reconciles the device's running workload set to match it, restores the
//! set after a reboot from persisted state, and reports aggregated run
//! status upstream.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            Launcher                                 │
//! │   run_instances │ run_last_instances │ update_run_status            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐   │
//! │  │  ReconcilePlan   │  │  BundlePreparer  │  │ StatusAggregator │   │
//! │  │ start/stop/keep  │  │ image + instance │  │ one sorted batch │   │
//! │  │                  │  │  → config.json   │  │  per round       │   │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────┘   │
//! │                    ┌──────────────────────┐                         │
//! │                    │   InstanceRegistry   │                         │
//! │                    │ single-writer mirror │                         │
//! │                    └──────────────────────┘                         │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                         Collaborators                               │
//! │  ┌──────────────┐ ┌──────────────┐ ┌─────────────┐ ┌────────────┐   │
//! │  │ServiceManager│ │InstanceRunner│ │OciSpecCodec │ │ StatusSink │   │
//! │  │   install    │ │  start/stop  │ │ load/save   │ │ run/update │   │
//! │  └──────────────┘ └──────────────┘ └─────────────┘ └────────────┘   │
//! │                     ┌─────────────────┐                             │
//! │                     │ InstanceStorage │                             │
//! │                     └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Bounded Resources
//!
//! Every collection has a declared capacity (see [`constants`]). Exceeding
//! it fails with [`Error::NoMemory`]; nothing grows without bound. Start and
//! stop operations run on at most `num_cooperate_launches` workers, and every
//! collaborator call is bounded by a timeout.
//!
//! # Crash Consistency
//!
//! - Runtime directories are built in a temp sibling and swapped into place.
//! - [`FileInstanceStorage`] rewrites its document through temp file + rename.
//! - The registry mirror changes only after the durable write succeeded.
//!
//! # Example
//!
//! ```rust,ignore
//! use magiklaunch::{Collaborators, Launcher, LauncherConfig};
//!
//! async fn run(collaborators: Collaborators) -> magiklaunch::Result<()> {
//!     let config = LauncherConfig::load("/etc/aos/launcher.yaml".as_ref())?;
//!     let launcher = Launcher::init(config, collaborators).await?;
//!
//!     // Restore what was running before the reboot
//!     launcher.run_last_instances().await?;
//!     Ok(())
//! }
//! ```

pub mod bounded;
pub mod bundle;
pub mod config;
pub mod constants;
pub mod error;
pub mod launcher;
pub mod oci;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod status;
pub mod storage;
pub mod types;

// Re-exports
pub use bounded::BoundedVec;
pub use bundle::BundlePreparer;
pub use config::LauncherConfig;
pub use error::{Error, ErrorKind, Result, StatusError};
pub use launcher::instance::{Instance, InstanceState};
pub use launcher::plan::ReconcilePlan;
pub use launcher::{Collaborators, Launcher};
pub use oci::{ImageSpec, JsonSpecCodec, OciSpecCodec, RuntimeSpec};
pub use registry::InstanceRegistry;
pub use runtime::{
    ContainerState, ContainerStatus, InstanceRunner, OciRunner, OciRuntime, RunStatusReceiver,
    Signal,
};
pub use service::ServiceManager;
pub use status::{DeliveryKind, StatusAggregator, StatusSink};
pub use storage::{FileInstanceStorage, InstanceStorage};
pub use types::{
    ImageParts, InstanceIdent, InstanceInfo, InstanceRunState, InstanceStatus, LayerInfo,
    RunStatus, ServiceData, ServiceInfo, VersionInfo,
};
