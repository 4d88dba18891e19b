//! Shared test fixtures: in-process collaborators with failure injection.

#![allow(dead_code)]

use async_trait::async_trait;
use magiklaunch::{
    Collaborators, ContainerState, ContainerStatus, DeliveryKind, Error, FileInstanceStorage,
    ImageSpec, InstanceIdent, InstanceInfo, InstanceRunState, InstanceRunner, InstanceStatus,
    InstanceStorage, JsonSpecCodec, Launcher, LauncherConfig, LayerInfo, OciRuntime, Result,
    RunStatus, ServiceData, ServiceInfo, ServiceManager, Signal, StatusError, StatusSink,
};
use magiklaunch::error::ErrorKind;
use magiklaunch::oci::ImageConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Builders
// =============================================================================

pub fn service(service_id: &str, version: u64) -> ServiceInfo {
    let mut info = ServiceInfo::new(service_id, "provider1", version);
    info.gid = 6000;
    info
}

pub fn instance(service_id: &str, index: u64) -> InstanceInfo {
    InstanceInfo::new(InstanceIdent::new(service_id, "subject1", index), 5000 + index as u32)
}

pub fn instances(service_id: &str, indices: impl IntoIterator<Item = u64>) -> Vec<InstanceInfo> {
    indices.into_iter().map(|i| instance(service_id, i)).collect()
}

/// `(index, version, state)` per status, in batch order.
pub fn summary(statuses: &[InstanceStatus]) -> Vec<(u64, u64, InstanceRunState)> {
    statuses
        .iter()
        .map(|s| (s.ident.instance, s.service_version, s.run_state))
        .collect()
}

// =============================================================================
// Service Manager
// =============================================================================

/// Installs services as image directories under a temp root.
pub struct MockServiceManager {
    root: PathBuf,
    services: Mutex<BTreeMap<String, ServiceData>>,
    skipped: Mutex<BTreeSet<String>>,
    fail_install: AtomicBool,
    install_calls: AtomicUsize,
}

impl MockServiceManager {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            services: Mutex::new(BTreeMap::new()),
            skipped: Mutex::new(BTreeSet::new()),
            fail_install: AtomicBool::new(false),
            install_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_install(&self, fail: bool) {
        self.fail_install.store(fail, Ordering::SeqCst);
    }

    /// The service silently fails to install from now on.
    pub fn skip_service(&self, service_id: &str) {
        self.skipped.lock().unwrap().insert(service_id.to_string());
    }

    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }

    /// Writes an image for `info` and returns its installed record.
    pub fn write_image(&self, info: &ServiceInfo) -> ServiceData {
        let image_path = self
            .root
            .join(&info.service_id)
            .join(format!("v{}", info.version_info.version_id));
        fs::create_dir_all(image_path.join("rootfs")).unwrap();

        let image = ImageSpec {
            config: ImageConfig {
                entrypoint: vec![format!("/bin/{}", info.service_id)],
                cmd: vec!["--run".to_string()],
                env: vec!["SERVICE=1".to_string()],
                working_dir: String::new(),
            },
        };
        fs::write(image_path.join("image.json"), serde_json::to_vec(&image).unwrap()).unwrap();

        let mut data = ServiceData::from(info);
        data.image_path = image_path;
        data
    }
}

#[async_trait]
impl ServiceManager for MockServiceManager {
    async fn install_services(&self, services: &[ServiceInfo], _layers: &[LayerInfo]) -> Result<()> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(Error::collaborator("service manager", "storage exhausted"));
        }

        let skipped = self.skipped.lock().unwrap().clone();
        let installed = services
            .iter()
            .filter(|s| !skipped.contains(&s.service_id))
            .map(|s| (s.service_id.clone(), self.write_image(s)))
            .collect();

        *self.services.lock().unwrap() = installed;
        Ok(())
    }

    async fn get_service(&self, service_id: &str) -> Result<ServiceData> {
        self.services
            .lock()
            .unwrap()
            .get(service_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("service {service_id}")))
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Records start/stop calls and holds a container per started instance.
///
/// Like a real runtime, a container stays registered after it exits until it
/// is stopped, and starting an instance whose container is still held fails.
#[derive(Default)]
pub struct MockRunner {
    /// Held containers; `true` while running.
    containers: Mutex<BTreeMap<String, bool>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    fail_start: Mutex<BTreeSet<String>>,
    fail_stop: AtomicBool,
    start_delay: Mutex<Duration>,
    hang_after_start: Mutex<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, ident: &InstanceIdent) {
        self.fail_start.lock().unwrap().insert(ident.instance_id());
    }

    pub fn clear_failures(&self) {
        self.fail_start.lock().unwrap().clear();
        self.fail_stop.store(false, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Delay before the container is created.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    /// Delay after the container is running but before the start returns.
    pub fn set_hang_after_start(&self, delay: Duration) {
        *self.hang_after_start.lock().unwrap() = delay;
    }

    /// The instance process exits; its container stays held.
    pub fn crash(&self, ident: &InstanceIdent) {
        if let Some(running) = self.containers.lock().unwrap().get_mut(&ident.instance_id()) {
            *running = false;
        }
    }

    pub fn is_running(&self, ident: &InstanceIdent) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(&ident.instance_id())
            .copied()
            .unwrap_or(false)
    }

    pub fn is_held(&self, ident: &InstanceIdent) -> bool {
        self.containers.lock().unwrap().contains_key(&ident.instance_id())
    }

    pub fn running_count(&self) -> usize {
        self.containers.lock().unwrap().values().filter(|r| **r).count()
    }

    pub fn start_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn stop_count(&self) -> usize {
        self.stopped.lock().unwrap().len()
    }

    pub fn was_stopped(&self, ident: &InstanceIdent) -> bool {
        self.stopped.lock().unwrap().contains(&ident.instance_id())
    }

    /// Highest number of starts observed in flight at once.
    pub fn max_concurrent_starts(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceRunner for MockRunner {
    async fn start_instance(&self, instance_id: &str, runtime_dir: &Path) -> RunStatus {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !runtime_dir.join("config.json").exists() {
            return RunStatus::failed(
                instance_id,
                StatusError::new(ErrorKind::NotFound, "config.json missing"),
            );
        }
        if self.fail_start.lock().unwrap().contains(instance_id) {
            return RunStatus::failed(instance_id, StatusError::new(ErrorKind::Failed, "crashed on start"));
        }

        {
            let mut containers = self.containers.lock().unwrap();
            if containers.contains_key(instance_id) {
                return RunStatus::failed(
                    instance_id,
                    StatusError::new(ErrorKind::AlreadyExists, format!("container {instance_id}")),
                );
            }
            containers.insert(instance_id.to_string(), true);
        }
        self.started.lock().unwrap().push(instance_id.to_string());

        let hang = *self.hang_after_start.lock().unwrap();
        if !hang.is_zero() {
            tokio::time::sleep(hang).await;
        }
        RunStatus::active(instance_id)
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.stopped.lock().unwrap().push(instance_id.to_string());
        self.containers.lock().unwrap().remove(instance_id);

        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::collaborator("runner", "stop failed"));
        }
        Ok(())
    }
}

// =============================================================================
// OCI Backend
// =============================================================================

/// In-memory backend following the OCI container lifecycle.
#[derive(Default)]
pub struct FakeRuntime {
    pub containers: Mutex<HashMap<String, ContainerStatus>>,
    pub signals: Mutex<Vec<(String, Signal)>>,
    pub fail_start: bool,
    pub ignore_term: bool,
}

impl FakeRuntime {
    /// Forces a container into `status`, e.g. `Stopped` after a crash.
    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        if let Some(current) = self.containers.lock().unwrap().get_mut(id) {
            *current = status;
        }
    }

    pub fn status(&self, id: &str) -> Option<ContainerStatus> {
        self.containers.lock().unwrap().get(id).copied()
    }
}

#[async_trait]
impl OciRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        if !bundle.join("config.json").exists() {
            return Err(Error::NotFound(format!("{}/config.json", bundle.display())));
        }
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(id) {
            return Err(Error::AlreadyExists(id.to_string()));
        }
        containers.insert(id.to_string(), ContainerStatus::Created);
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        if self.fail_start {
            return Err(Error::collaborator("fake", "exec failed"));
        }
        let mut containers = self.containers.lock().unwrap();
        let status = containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        *status = ContainerStatus::Running;
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        let status = self
            .status(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(ContainerState {
            id: id.to_string(),
            status,
            pid: (status == ContainerStatus::Running).then_some(4242),
            bundle: String::new(),
        })
    }

    async fn kill(&self, id: &str, signal: Signal) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let status = containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.signals.lock().unwrap().push((id.to_string(), signal));
        if signal == Signal::Kill || !self.ignore_term {
            *status = ContainerStatus::Stopped;
        }
        Ok(())
    }

    async fn delete(&self, id: &str, _force: bool) -> Result<()> {
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }
}

// =============================================================================
// Storage
// =============================================================================

/// File storage whose writes can be made to fail.
pub struct FlakyStorage {
    inner: FileInstanceStorage,
    fail_writes: AtomicBool,
}

impl FlakyStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            inner: FileInstanceStorage::with_path(dir, magiklaunch::constants::MAX_NUM_INSTANCES).unwrap(),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceStorage for FlakyStorage {
    async fn add_instance(&self, instance: &InstanceInfo) -> Result<()> {
        self.check()?;
        self.inner.add_instance(instance).await
    }

    async fn update_instance(&self, instance: &InstanceInfo) -> Result<()> {
        self.check()?;
        self.inner.update_instance(instance).await
    }

    async fn remove_instance(&self, ident: &InstanceIdent) -> Result<()> {
        self.check()?;
        self.inner.remove_instance(ident).await
    }

    async fn get_all_instances(&self) -> Result<Vec<InstanceInfo>> {
        self.inner.get_all_instances().await
    }
}

// =============================================================================
// Status Sink
// =============================================================================

#[derive(Debug, Clone)]
pub struct Delivery {
    pub kind: DeliveryKind,
    pub statuses: Vec<InstanceStatus>,
}

/// Records deliveries; [`MockSink::arm`] returns a one-shot signal for the
/// next delivery.
#[derive(Default)]
pub struct MockSink {
    deliveries: Mutex<Vec<Delivery>>,
    waiter: Mutex<Option<oneshot::Sender<Delivery>>>,
    fail: AtomicBool,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) -> oneshot::Receiver<Delivery> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock().unwrap() = Some(tx);
        rx
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Delivery> {
        self.deliveries.lock().unwrap().last().cloned()
    }

    fn deliver(&self, kind: DeliveryKind, statuses: &[InstanceStatus]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::collaborator("status sink", "connection lost"));
        }

        let delivery = Delivery {
            kind,
            statuses: statuses.to_vec(),
        };
        self.deliveries.lock().unwrap().push(delivery.clone());
        if let Some(tx) = self.waiter.lock().unwrap().take() {
            let _ = tx.send(delivery);
        }
        Ok(())
    }
}

#[async_trait]
impl StatusSink for MockSink {
    async fn instances_run_status(&self, statuses: &[InstanceStatus]) -> Result<()> {
        self.deliver(DeliveryKind::Run, statuses)
    }

    async fn instances_update_status(&self, statuses: &[InstanceStatus]) -> Result<()> {
        self.deliver(DeliveryKind::Update, statuses)
    }
}

/// Awaits an armed delivery signal.
pub async fn wait_delivery(rx: oneshot::Receiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("status delivery timed out")
        .expect("status sink dropped")
}

// =============================================================================
// Environment
// =============================================================================

/// A launcher environment rooted in a temp directory.
pub struct TestEnv {
    pub temp: TempDir,
    pub services: Arc<MockServiceManager>,
    pub runner: Arc<MockRunner>,
    pub storage: Arc<FlakyStorage>,
    pub sink: Arc<MockSink>,
    pub config: LauncherConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();

        let temp = TempDir::new().unwrap();
        let config = LauncherConfig {
            runtime_dir: temp.path().join("runtime"),
            num_cooperate_launches: 5,
            max_instances: 16,
            install_timeout_secs: 5,
            prepare_timeout_secs: 5,
            start_timeout_secs: 5,
            stop_timeout_secs: 5,
            round_timeout_secs: 30,
        };

        Self {
            services: Arc::new(MockServiceManager::new(temp.path().join("services"))),
            runner: Arc::new(MockRunner::new()),
            storage: Arc::new(FlakyStorage::new(temp.path().join("state"))),
            sink: Arc::new(MockSink::new()),
            config,
            temp,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            service_manager: self.services.clone(),
            runner: self.runner.clone(),
            codec: Arc::new(JsonSpecCodec::new()),
            storage: self.storage.clone(),
            sink: self.sink.clone(),
        }
    }

    pub async fn launcher(&self) -> Launcher {
        Launcher::init(self.config.clone(), self.collaborators())
            .await
            .unwrap()
    }

    /// A launcher whose instances run on `runner` instead of the mock.
    pub async fn launcher_with_runner(&self, runner: Arc<dyn InstanceRunner>) -> Launcher {
        let collaborators = Collaborators {
            runner,
            ..self.collaborators()
        };
        Launcher::init(self.config.clone(), collaborators).await.unwrap()
    }

    /// Simulates a device reboot: nothing is running any more.
    pub fn reboot(&mut self) {
        self.runner = Arc::new(MockRunner::new());
    }
}
