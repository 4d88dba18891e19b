//! # Launcher Constants
//!
//! Capacities, identifier limits, timeouts and on-disk names for the
//! launcher core. These constants are the **single source of truth** for the
//! bounds enforced throughout the crate; [`crate::config::LauncherConfig`]
//! takes its defaults from here and may only tighten the capacities.
//!
//! ## Bounded Capacity
//!
//! The launcher runs on devices with a fixed memory budget. Every collection
//! it manipulates (desired instances, services, layers, status batches) has a
//! declared maximum size. Exceeding it is an error
//! ([`crate::Error::NoMemory`]), never a reallocation.
//!
//! ## Cross-References
//!
//! - [`crate::bounded`]: Enforces the capacities
//! - [`crate::launcher`]: Uses timeouts and the cooperative launch count
//! - [`crate::bundle`]: Uses the runtime directory layout and file names

use std::time::Duration;

// =============================================================================
// Capacities
// =============================================================================
//
// Upper bounds on the number of items per reconciliation round. Status
// batches can hold at most one entry per instance, so they share
// MAX_NUM_INSTANCES.
// =============================================================================

/// Maximum number of instances handled by one launcher.
///
/// **Rationale**: Bounds the registry mirror, desired-set submissions and
/// status batches alike.
pub const MAX_NUM_INSTANCES: usize = 64;

/// Maximum number of services in one install batch.
pub const MAX_NUM_SERVICES: usize = 32;

/// Maximum number of layers in one install batch.
pub const MAX_NUM_LAYERS: usize = 32;

/// Number of instance start/stop operations executed in parallel.
///
/// **Rationale**: The device has a fixed worker capacity; additional
/// operations queue until a worker is free.
pub const NUM_COOPERATE_LAUNCHES: usize = 5;

// =============================================================================
// Identifier Limits
// =============================================================================

/// Maximum service ID length in bytes.
pub const SERVICE_ID_LEN: usize = 40;

/// Maximum subject ID length in bytes.
pub const SUBJECT_ID_LEN: usize = 40;

/// Maximum provider ID length in bytes.
pub const PROVIDER_ID_LEN: usize = 40;

/// Maximum layer ID length in bytes.
pub const LAYER_ID_LEN: usize = 40;

/// Maximum file path length in bytes (storage/state paths).
pub const FILE_PATH_LEN: usize = 256;

/// Length of the derived instance ID (hex of 16 hash bytes).
pub const INSTANCE_ID_LEN: usize = 32;

// =============================================================================
// Timeouts
// =============================================================================
//
// Every blocking collaborator call is bounded. Expiry marks the affected
// instance Failed with a timeout error; the round proceeds without it.
// =============================================================================

/// Timeout for installing a service/layer batch (10 minutes).
///
/// **Rationale**: Installation downloads service bundles; slow links on
/// edge devices need a generous bound.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for preparing one instance runtime directory (30 seconds).
pub const PREPARE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for starting one instance (60 seconds).
pub const INSTANCE_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for stopping one instance (30 seconds).
pub const INSTANCE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded wait for a whole reconciliation round (5 minutes).
///
/// **Rationale**: Operations still outstanding when this elapses are
/// aborted and reported as timed out.
pub const ROUND_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period between SIGTERM and SIGKILL when stopping through an OCI
/// runtime backend.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

// =============================================================================
// Paths and File Names
// =============================================================================

/// Default runtime directory holding per-instance runtime bundles.
///
/// Structure: `<runtime_dir>/<instance-id>-v<version>/config.json`
pub const DEFAULT_RUNTIME_DIR: &str = "/run/aos/runtime";

/// Runtime spec file inside a prepared runtime directory.
pub const RUNTIME_SPEC_FILE: &str = "config.json";

/// Image spec file inside an installed service image.
pub const IMAGE_SPEC_FILE: &str = "image.json";

/// Service-provided runtime spec inside an installed service image.
pub const SERVICE_SPEC_FILE: &str = "service.json";

/// Root filesystem directory inside an installed service image.
pub const SERVICE_ROOTFS_DIR: &str = "rootfs";

/// Mount point of the instance storage directory inside the workload.
pub const STORAGE_MOUNT_POINT: &str = "/storage";

/// Mount point of the instance state file inside the workload.
pub const STATE_MOUNT_POINT: &str = "/state";

/// Default PATH added when the image spec does not set one.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// =============================================================================
// OCI Versions and Annotations
// =============================================================================

/// OCI Runtime Spec version for generated `config.json`.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Annotation carrying the service ID of a prepared instance.
pub const ANNOTATION_SERVICE_ID: &str = "io.aos.service.id";

/// Annotation carrying the subject ID of a prepared instance.
pub const ANNOTATION_SUBJECT_ID: &str = "io.aos.subject.id";

/// Annotation carrying the instance index of a prepared instance.
pub const ANNOTATION_INSTANCE_INDEX: &str = "io.aos.instance.index";

/// Annotation carrying the bound service version.
pub const ANNOTATION_SERVICE_VERSION: &str = "io.aos.service.version";

// =============================================================================
// Identifier Validation Helper
// =============================================================================

/// Validates an identifier (service, subject, provider or layer ID).
///
/// Identifiers end up in log lines, annotations and registry keys. They must
/// be non-empty, bounded, and free of control characters and path separators.
#[inline]
#[must_use = "validation result must be checked"]
pub fn validate_id(id: &str, max_len: usize) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("identifier cannot be empty");
    }
    if id.len() > max_len {
        return Err("identifier exceeds maximum length");
    }
    if id.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
        return Err("identifier contains invalid characters");
    }
    Ok(())
}
