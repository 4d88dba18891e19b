//! OCI image and runtime spec documents.
//!
//! The launcher reads an installed service's image spec, optionally its
//! service-provided runtime spec, and writes one merged runtime spec per
//! instance. Parsing and serialization go through the [`OciSpecCodec`]
//! trait; [`JsonSpecCodec`] is the file-backed implementation.
//!
//! Maps in these documents are `BTreeMap`s so that serializing the same
//! spec twice yields identical bytes.

use crate::constants::{OCI_RUNTIME_SPEC_VERSION, SERVICE_ROOTFS_DIR};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

// =============================================================================
// Image Spec
// =============================================================================

/// OCI image spec (the subset the launcher consumes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    #[serde(default)]
    pub config: ImageConfig,
}

/// OCI image execution config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

impl ImageConfig {
    /// Returns the process arguments: entrypoint followed by cmd.
    pub fn args(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.cmd.iter()).cloned().collect()
    }
}

// =============================================================================
// Runtime Spec
// =============================================================================

/// OCI runtime spec (`config.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub root: Root,
    pub process: Process,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<Vm>,
}

impl Default for RuntimeSpec {
    /// Runtime spec used when a service ships none of its own.
    fn default() -> Self {
        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: Root {
                path: SERVICE_ROOTFS_DIR.to_string(),
                readonly: true,
            },
            process: Process {
                terminal: false,
                user: User { uid: 0, gid: 0 },
                args: Vec::new(),
                env: Vec::new(),
                cwd: "/".to_string(),
            },
            hostname: String::new(),
            mounts: vec![
                Mount {
                    destination: "/proc".to_string(),
                    mount_type: "proc".to_string(),
                    source: "proc".to_string(),
                    options: Vec::new(),
                },
                Mount {
                    destination: "/tmp".to_string(),
                    mount_type: "tmpfs".to_string(),
                    source: "tmpfs".to_string(),
                    options: vec!["nosuid".to_string(), "strictatime".to_string(), "mode=1777".to_string()],
                },
            ],
            annotations: BTreeMap::new(),
            linux: Some(Linux {
                namespaces: ["pid", "ipc", "uts", "mount"]
                    .iter()
                    .map(|ns| Namespace {
                        ns_type: (*ns).to_string(),
                        path: None,
                    })
                    .collect(),
            }),
            vm: None,
        }
    }
}

/// Root filesystem config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Process config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    pub user: User,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
}

/// Process user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

/// Mount entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// Creates a read-write bind mount.
    pub fn bind(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            mount_type: "bind".to_string(),
            source: source.into(),
            options: vec!["bind".to_string(), "rw".to_string()],
        }
    }
}

/// Linux-specific config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Linux {
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
}

/// Namespace entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Config for virtual-machine based workloads (unikernels).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vm {
    #[serde(default)]
    pub hypervisor: VmImage,
    #[serde(default)]
    pub kernel: VmImage,
    #[serde(default)]
    pub hw_config: VmHwConfig,
}

/// Hypervisor or kernel image with parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmImage {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

/// VM hardware config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmHwConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_tree: String,
    #[serde(default)]
    pub vcpus: u32,
    #[serde(default)]
    pub mem_kb: u64,
    #[serde(default)]
    pub dt_devs: Vec<String>,
    #[serde(default)]
    pub irqs: Vec<u32>,
}

// =============================================================================
// Codec
// =============================================================================

/// Loads and saves OCI spec documents.
///
/// A missing document is reported as [`Error::NotFound`].
#[async_trait]
pub trait OciSpecCodec: Send + Sync {
    /// Loads an image spec.
    async fn load_image_spec(&self, path: &Path) -> Result<ImageSpec>;

    /// Saves an image spec.
    async fn save_image_spec(&self, path: &Path, spec: &ImageSpec) -> Result<()>;

    /// Loads a runtime spec.
    async fn load_runtime_spec(&self, path: &Path) -> Result<RuntimeSpec>;

    /// Saves a runtime spec.
    async fn save_runtime_spec(&self, path: &Path, spec: &RuntimeSpec) -> Result<()>;
}

/// JSON file codec.
///
/// Writes go to a uniquely named temp file in the target directory and are
/// renamed into place, so readers never observe a partially written spec.
#[derive(Debug, Clone, Default)]
pub struct JsonSpecCodec;

impl JsonSpecCodec {
    /// Creates the codec.
    pub fn new() -> Self {
        Self
    }

    fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        serde_json::from_slice(&data).map_err(|e| Error::InvalidSpec {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn save<T: Serialize>(path: &Path, spec: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(spec)?;
        write_atomic(path, &json)?;
        debug!(path = %path.display(), bytes = json.len(), "Saved spec");
        Ok(())
    }
}

#[async_trait]
impl OciSpecCodec for JsonSpecCodec {
    async fn load_image_spec(&self, path: &Path) -> Result<ImageSpec> {
        Self::load(path)
    }

    async fn save_image_spec(&self, path: &Path, spec: &ImageSpec) -> Result<()> {
        Self::save(path, spec)
    }

    async fn load_runtime_spec(&self, path: &Path) -> Result<RuntimeSpec> {
        Self::load(path)
    }

    async fn save_runtime_spec(&self, path: &Path, spec: &RuntimeSpec) -> Result<()> {
        Self::save(path, spec)
    }
}

/// Writes `data` to `path` via a temp file and rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_name = format!("tmp.{}", uuid::Uuid::now_v7());
    let temp_path = path.with_extension(temp_name);
    fs::write(&temp_path, data)?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::Io(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_image_config_args() {
        let config = ImageConfig {
            entrypoint: vec!["/bin/app".to_string()],
            cmd: vec!["--serve".to_string()],
            ..Default::default()
        };
        assert_eq!(config.args(), vec!["/bin/app", "--serve"]);
    }

    #[test]
    fn test_image_spec_uses_oci_field_names() {
        let json = r#"{"config":{"Entrypoint":["/init"],"Cmd":["run"],"Env":["A=1"]}}"#;
        let spec: ImageSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.config.entrypoint, vec!["/init"]);
        assert_eq!(spec.config.cmd, vec!["run"]);
        assert_eq!(spec.config.env, vec!["A=1"]);
    }

    #[tokio::test]
    async fn test_missing_spec_is_not_found() {
        let temp = TempDir::new().unwrap();
        let codec = JsonSpecCodec::new();

        let err = codec
            .load_runtime_spec(&temp.path().join("service.json"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_malformed_spec_is_invalid() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("image.json");
        fs::write(&path, b"{not json").unwrap();

        let err = JsonSpecCodec::new().load_image_spec(&path).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");
        let codec = JsonSpecCodec::new();

        codec.save_runtime_spec(&path, &RuntimeSpec::default()).await.unwrap();

        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(codec.load_runtime_spec(&path).await.unwrap(), RuntimeSpec::default());
    }
}
