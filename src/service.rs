//! Service content management interface.
//!
//! Downloading and unpacking service bundles is done elsewhere; the launcher
//! only asks to install a batch, looks up installed services and resolves
//! where their image files live.

use crate::constants::{IMAGE_SPEC_FILE, SERVICE_ROOTFS_DIR, SERVICE_SPEC_FILE};
use crate::error::Result;
use crate::types::{ImageParts, LayerInfo, ServiceData, ServiceInfo};
use async_trait::async_trait;

/// Service content collaborator.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Installs a batch of services and layers.
    ///
    /// Returns an error only when installation fails as a whole (storage
    /// exhausted, installer unavailable). A single service that fails to
    /// install is simply absent afterwards: [`ServiceManager::get_service`]
    /// reports it as not found.
    async fn install_services(&self, services: &[ServiceInfo], layers: &[LayerInfo]) -> Result<()>;

    /// Returns an installed service.
    ///
    /// # Errors
    ///
    /// [`crate::Error::NotFound`] if the service is not installed.
    async fn get_service(&self, service_id: &str) -> Result<ServiceData>;

    /// Resolves the image files of an installed service.
    ///
    /// The default layout is `image.json`, `service.json` and `rootfs/`
    /// under the service image path.
    async fn get_image_parts(&self, service: &ServiceData) -> Result<ImageParts> {
        Ok(default_image_parts(service))
    }
}

/// Returns the standard image layout under `service.image_path`.
pub fn default_image_parts(service: &ServiceData) -> ImageParts {
    ImageParts {
        image_spec_path: service.image_path.join(IMAGE_SPEC_FILE),
        runtime_spec_path: service.image_path.join(SERVICE_SPEC_FILE),
        image_root_path: service.image_path.join(SERVICE_ROOTFS_DIR),
    }
}
