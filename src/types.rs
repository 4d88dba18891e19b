//! Identity and status model.
//!
//! This module defines the value types exchanged between the launcher and
//! its collaborators:
//! - `InstanceIdent`: identity key of one instance slot
//! - `InstanceInfo`: desired-state record, persisted in the registry
//! - `ServiceInfo` / `LayerInfo`: desired install batch entries
//! - `ServiceData` / `ImageParts`: installed service and its image files
//! - `RunStatus` / `InstanceStatus`: per-instance run outcomes

use crate::error::StatusError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;

// =============================================================================
// Instance Identity
// =============================================================================

/// Identity of one instance slot.
///
/// Equality and ordering are structural over all three fields; the order
/// (service, subject, index) is the order of every status batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdent {
    /// Service the instance runs.
    pub service_id: String,
    /// Subject the instance belongs to.
    pub subject_id: String,
    /// Index distinguishing instances of the same service and subject.
    pub instance: u64,
}

impl InstanceIdent {
    /// Creates an instance identity.
    pub fn new(service_id: impl Into<String>, subject_id: impl Into<String>, instance: u64) -> Self {
        Self {
            service_id: service_id.into(),
            subject_id: subject_id.into(),
            instance,
        }
    }

    /// Returns the execution-level instance ID.
    ///
    /// Derived from SHA256 of `service/subject/index` so that the same
    /// identity always maps to the same ID across reboots.
    #[must_use]
    pub fn instance_id(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.service_id.as_bytes());
        hasher.update(b"/");
        hasher.update(self.subject_id.as_bytes());
        hasher.update(b"/");
        hasher.update(self.instance.to_string().as_bytes());
        let hash = hasher.finalize();

        hex::encode(&hash[..16])
    }
}

impl std::fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.service_id, self.subject_id, self.instance)
    }
}

// =============================================================================
// Desired State
// =============================================================================

/// Desired-state record of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    /// Instance identity.
    pub ident: InstanceIdent,
    /// User the workload runs as.
    pub uid: u32,
    /// Scheduling priority assigned upstream.
    #[serde(default)]
    pub priority: u64,
    /// Host directory mounted as the instance storage (empty = none).
    #[serde(default)]
    pub storage_path: String,
    /// Host file mounted as the instance state (empty = none).
    #[serde(default)]
    pub state_path: String,
}

impl InstanceInfo {
    /// Creates an instance record without storage or state bindings.
    pub fn new(ident: InstanceIdent, uid: u32) -> Self {
        Self {
            ident,
            uid,
            priority: 0,
            storage_path: String::new(),
            state_path: String::new(),
        }
    }
}

/// Service or layer version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Monotonic version number; any change forces dependent restarts.
    pub version_id: u64,
    /// Vendor version string.
    #[serde(default)]
    pub version_string: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

impl VersionInfo {
    /// Creates version info with the given version number.
    pub fn new(version_id: u64, version_string: impl Into<String>) -> Self {
        Self {
            version_id,
            version_string: version_string.into(),
            description: String::new(),
        }
    }
}

/// Desired service descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub version_info: VersionInfo,
    pub service_id: String,
    pub provider_id: String,
    /// Group the service workloads run as.
    #[serde(default)]
    pub gid: u32,
    /// Download location of the service bundle.
    #[serde(default)]
    pub url: String,
    /// Expected SHA256 of the bundle (hex).
    #[serde(default)]
    pub sha256: String,
    /// Bundle size in bytes.
    #[serde(default)]
    pub size: u64,
}

impl ServiceInfo {
    /// Creates a service descriptor with the given version.
    pub fn new(service_id: impl Into<String>, provider_id: impl Into<String>, version_id: u64) -> Self {
        Self {
            version_info: VersionInfo::new(version_id, ""),
            service_id: service_id.into(),
            provider_id: provider_id.into(),
            gid: 0,
            url: String::new(),
            sha256: String::new(),
            size: 0,
        }
    }
}

/// Shared filesystem layer descriptor. Passed through to installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub version_info: VersionInfo,
    pub layer_id: String,
    pub layer_digest: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub size: u64,
}

// =============================================================================
// Installed State
// =============================================================================

/// Installed service record, owned by the service manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceData {
    pub version_info: VersionInfo,
    pub service_id: String,
    pub provider_id: String,
    #[serde(default)]
    pub gid: u32,
    /// Directory holding the installed image.
    pub image_path: PathBuf,
}

impl ServiceData {
    /// Returns the installed version number.
    pub fn version_id(&self) -> u64 {
        self.version_info.version_id
    }
}

impl From<&ServiceInfo> for ServiceData {
    /// Builds the record an installer would store for `info`, with an
    /// empty image path.
    fn from(info: &ServiceInfo) -> Self {
        Self {
            version_info: info.version_info.clone(),
            service_id: info.service_id.clone(),
            provider_id: info.provider_id.clone(),
            gid: info.gid,
            image_path: PathBuf::new(),
        }
    }
}

/// Resolved file locations of one installed service image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageParts {
    /// OCI image spec (entrypoint, cmd, env).
    pub image_spec_path: PathBuf,
    /// Service-provided runtime spec, may not exist.
    pub runtime_spec_path: PathBuf,
    /// Root filesystem of the image.
    pub image_root_path: PathBuf,
}

// =============================================================================
// Run State
// =============================================================================

/// Reported run state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRunState {
    /// Instance is running.
    #[default]
    Active,
    /// Instance failed to start or crashed.
    Failed,
}

impl std::fmt::Display for InstanceRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result reported by the execution collaborator for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    /// Execution-level instance ID (see [`InstanceIdent::instance_id`]).
    pub instance_id: String,
    pub state: InstanceRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
}

impl RunStatus {
    /// Creates an active run status.
    pub fn active(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            state: InstanceRunState::Active,
            error: None,
        }
    }

    /// Creates a failed run status.
    pub fn failed(instance_id: impl Into<String>, error: StatusError) -> Self {
        Self {
            instance_id: instance_id.into(),
            state: InstanceRunState::Failed,
            error: Some(error),
        }
    }
}

/// Aggregated status of one instance as reported to the status sink.
///
/// Equality and ordering consider the identity only: two statuses for the
/// same instance compare equal even if their state or error differ. Use
/// the fields directly to inspect the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub ident: InstanceIdent,
    /// Version of the bound service.
    pub service_version: u64,
    pub run_state: InstanceRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
}

impl InstanceStatus {
    /// Creates an active status.
    pub fn active(ident: InstanceIdent, service_version: u64) -> Self {
        Self {
            ident,
            service_version,
            run_state: InstanceRunState::Active,
            error: None,
        }
    }

    /// Creates a failed status.
    pub fn failed(ident: InstanceIdent, service_version: u64, error: StatusError) -> Self {
        Self {
            ident,
            service_version,
            run_state: InstanceRunState::Failed,
            error: Some(error),
        }
    }

    /// Returns true if the instance is active.
    pub fn is_active(&self) -> bool {
        self.run_state == InstanceRunState::Active
    }
}

impl PartialEq for InstanceStatus {
    fn eq(&self, other: &Self) -> bool {
        self.ident == other.ident
    }
}

impl Eq for InstanceStatus {}

impl PartialOrd for InstanceStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InstanceStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ident.cmp(&other.ident)
    }
}
