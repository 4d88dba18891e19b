//! Runtime directory preparation.
//!
//! Converts an installed service image plus one instance record into the
//! runtime directory handed to the execution collaborator:
//!
//! ```text
//! <runtime_dir>/
//! └── <instance-id>-v<version>/
//!     └── config.json        # merged OCI runtime spec
//! ```
//!
//! The root filesystem is not copied: `root.path` points at the installed
//! image root, shared read-only by every instance of the service.
//!
//! ## Merge Order
//!
//! 1. Service runtime spec (`service.json`) if the image ships one,
//!    otherwise [`RuntimeSpec::default`]
//! 2. Image config: `args = Entrypoint ++ Cmd`, `Env`, `WorkingDir`
//! 3. Instance parameters: uid, service gid, storage/state bind mounts,
//!    identity annotations
//!
//! The output only depends on these inputs, so preparing the same instance
//! twice yields byte-identical `config.json` files.

use crate::constants::{
    ANNOTATION_INSTANCE_INDEX, ANNOTATION_SERVICE_ID, ANNOTATION_SERVICE_VERSION,
    ANNOTATION_SUBJECT_ID, DEFAULT_PATH_ENV, RUNTIME_SPEC_FILE, STATE_MOUNT_POINT,
    STORAGE_MOUNT_POINT,
};
use crate::error::{Error, Result};
use crate::oci::{ImageSpec, Mount, OciSpecCodec, RuntimeSpec};
use crate::service::ServiceManager;
use crate::types::{InstanceIdent, InstanceInfo, ServiceData};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of directories under construction.
const TEMP_PREFIX: &str = ".tmp-";

/// Prefix of replaced directories awaiting removal.
const OLD_PREFIX: &str = ".old-";

// =============================================================================
// Bundle Preparer
// =============================================================================

/// Builds per-instance runtime directories.
pub struct BundlePreparer {
    /// Base directory for runtime directories.
    base_dir: PathBuf,
    service_manager: Arc<dyn ServiceManager>,
    codec: Arc<dyn OciSpecCodec>,
}

impl BundlePreparer {
    /// Creates a preparer rooted at `base_dir`.
    pub fn with_path(
        base_dir: PathBuf,
        service_manager: Arc<dyn ServiceManager>,
        codec: Arc<dyn OciSpecCodec>,
    ) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            service_manager,
            codec,
        })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the runtime directory of an instance at a service version.
    pub fn runtime_dir(&self, ident: &InstanceIdent, version_id: u64) -> PathBuf {
        self.base_dir.join(dir_name(ident, version_id))
    }

    /// Prepares the runtime directory of `instance` bound to `service`.
    ///
    /// Any previous directory for the same instance and version is replaced
    /// as a whole.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the image parts or image spec are missing
    /// - [`Error::InvalidSpec`] if the image defines no process arguments
    /// - codec and I/O errors unchanged
    pub async fn prepare(&self, service: &ServiceData, instance: &InstanceInfo) -> Result<PathBuf> {
        let parts = self.service_manager.get_image_parts(service).await?;
        let image_spec = self.codec.load_image_spec(&parts.image_spec_path).await?;

        let base_spec = match self.codec.load_runtime_spec(&parts.runtime_spec_path).await {
            Ok(spec) => spec,
            Err(e) if e.is_not_found() => {
                debug!(service = %service.service_id, "No service runtime spec, using default");
                RuntimeSpec::default()
            }
            Err(e) => return Err(e),
        };

        let spec = merge_spec(
            base_spec,
            &image_spec,
            &parts.image_spec_path,
            &parts.image_root_path,
            service,
            instance,
        )?;

        let target = self.runtime_dir(&instance.ident, service.version_id());
        let temp = self.base_dir.join(format!(
            "{TEMP_PREFIX}{}-{}",
            dir_name(&instance.ident, service.version_id()),
            uuid::Uuid::now_v7()
        ));

        fs::create_dir_all(&temp)?;
        if let Err(e) = self
            .codec
            .save_runtime_spec(&temp.join(RUNTIME_SPEC_FILE), &spec)
            .await
        {
            let _ = fs::remove_dir_all(&temp);
            return Err(e);
        }

        if let Err(e) = swap_dir(&temp, &target) {
            let _ = fs::remove_dir_all(&temp);
            return Err(e);
        }

        info!(
            instance = %instance.ident,
            version = service.version_id(),
            path = %target.display(),
            "Prepared runtime directory"
        );

        Ok(target)
    }

    /// Removes every runtime directory of an instance (all versions,
    /// including leftovers of interrupted preparations).
    pub fn cleanup(&self, ident: &InstanceIdent) -> Result<()> {
        let prefix = format!("{}-v", ident.instance_id());

        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stripped = name
                .strip_prefix(TEMP_PREFIX)
                .or_else(|| name.strip_prefix(OLD_PREFIX))
                .unwrap_or(&name);

            if stripped.starts_with(&prefix) {
                debug!(instance = %ident, path = %entry.path().display(), "Removing runtime directory");
                fs::remove_dir_all(entry.path())?;
            }
        }

        Ok(())
    }
}

// =============================================================================
// Spec Merge
// =============================================================================

fn dir_name(ident: &InstanceIdent, version_id: u64) -> String {
    format!("{}-v{version_id}", ident.instance_id())
}

/// Merges image config and instance parameters into the base spec.
fn merge_spec(
    mut spec: RuntimeSpec,
    image: &ImageSpec,
    image_spec_path: &Path,
    image_root: &Path,
    service: &ServiceData,
    instance: &InstanceInfo,
) -> Result<RuntimeSpec> {
    let args = image.config.args();
    if args.is_empty() {
        return Err(Error::InvalidSpec {
            path: image_spec_path.to_path_buf(),
            reason: "image defines neither entrypoint nor cmd".to_string(),
        });
    }
    spec.process.args = args;

    for var in &image.config.env {
        set_env(&mut spec.process.env, var);
    }
    if !spec.process.env.iter().any(|v| env_key(v) == "PATH") {
        spec.process.env.push(DEFAULT_PATH_ENV.to_string());
    }

    if !image.config.working_dir.is_empty() {
        spec.process.cwd = image.config.working_dir.clone();
    } else if spec.process.cwd.is_empty() {
        spec.process.cwd = "/".to_string();
    }

    spec.process.user.uid = instance.uid;
    spec.process.user.gid = service.gid;
    spec.root.path = image_root.to_string_lossy().into_owned();

    if !instance.storage_path.is_empty() {
        add_mount(&mut spec, Mount::bind(&instance.storage_path, STORAGE_MOUNT_POINT));
    }
    if !instance.state_path.is_empty() {
        add_mount(&mut spec, Mount::bind(&instance.state_path, STATE_MOUNT_POINT));
    }

    let ident = &instance.ident;
    spec.annotations
        .insert(ANNOTATION_SERVICE_ID.to_string(), ident.service_id.clone());
    spec.annotations
        .insert(ANNOTATION_SUBJECT_ID.to_string(), ident.subject_id.clone());
    spec.annotations
        .insert(ANNOTATION_INSTANCE_INDEX.to_string(), ident.instance.to_string());
    spec.annotations.insert(
        ANNOTATION_SERVICE_VERSION.to_string(),
        service.version_id().to_string(),
    );

    Ok(spec)
}

fn env_key(var: &str) -> &str {
    var.split_once('=').map_or(var, |(key, _)| key)
}

/// Sets `KEY=value`, replacing an existing entry with the same key.
fn set_env(env: &mut Vec<String>, var: &str) {
    let key = env_key(var);
    match env.iter_mut().find(|v| env_key(v) == key) {
        Some(existing) => *existing = var.to_string(),
        None => env.push(var.to_string()),
    }
}

/// Adds a mount, replacing any mount at the same destination.
fn add_mount(spec: &mut RuntimeSpec, mount: Mount) {
    spec.mounts.retain(|m| m.destination != mount.destination);
    spec.mounts.push(mount);
}

/// Moves a fully written directory into place.
///
/// An existing target is first renamed aside and removed afterwards, so the
/// target path always names either the old or the new complete directory.
fn swap_dir(temp: &Path, target: &Path) -> Result<()> {
    if !target.exists() {
        fs::rename(temp, target)?;
        return Ok(());
    }

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Internal(format!("invalid runtime dir {}", target.display())))?;
    let old = target.with_file_name(format!("{OLD_PREFIX}{name}-{}", uuid::Uuid::now_v7()));

    fs::rename(target, &old)?;
    if let Err(e) = fs::rename(temp, target) {
        let _ = fs::rename(&old, target);
        return Err(Error::Io(e));
    }
    if let Err(e) = fs::remove_dir_all(&old) {
        warn!(path = %old.display(), error = %e, "Failed to remove replaced runtime directory");
    }

    Ok(())
}
