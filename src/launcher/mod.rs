//! Reconciliation engine.
//!
//! Drives the device's running instance set towards a desired set:
//!
//! ```text
//!   run_instances(services, layers, instances)      run_last_instances()
//!            │                                              │
//!            ▼                                              │
//!     validate ─▶ install_services                          │
//!            │                                              │
//!            └──────────────┬───────────────────────────────┘
//!                           ▼
//!         resolve services ─▶ ReconcilePlan::compute
//!                           │
//!            ┌──────────────┴──────────────┐
//!            ▼                             ▼
//!       stop tasks                    start tasks        (≤ num_cooperate_launches
//!   stop ─▶ cleanup ─▶ unregister   prepare ─▶ start ─▶ register     at a time)
//!            │                             │
//!            └──────────────┬──────────────┘
//!                           ▼
//!              StatusAggregator::finish ─▶ StatusSink
//! ```
//!
//! Rounds are serialized. Within a round every collaborator call is bounded
//! by its timeout and the round as a whole by `round_timeout`.

pub mod instance;
pub mod plan;

use crate::bounded::BoundedVec;
use crate::bundle::BundlePreparer;
use crate::config::LauncherConfig;
use crate::constants::{
    FILE_PATH_LEN, LAYER_ID_LEN, MAX_NUM_LAYERS, MAX_NUM_SERVICES, PROVIDER_ID_LEN,
    SERVICE_ID_LEN, SUBJECT_ID_LEN, validate_id,
};
use crate::error::{Error, ErrorKind, Result, StatusError};
use crate::oci::OciSpecCodec;
use crate::registry::InstanceRegistry;
use crate::runtime::{InstanceRunner, RunStatusReceiver};
use crate::service::ServiceManager;
use crate::status::{DeliveryKind, StatusAggregator, StatusSink};
use crate::storage::InstanceStorage;
use crate::types::{
    InstanceIdent, InstanceInfo, InstanceRunState, InstanceStatus, LayerInfo, RunStatus,
    ServiceData, ServiceInfo,
};
use async_trait::async_trait;
use instance::{Instance, InstanceState};
use plan::{Current, ReconcilePlan, StartAction};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// External collaborators of the launcher.
#[derive(Clone)]
pub struct Collaborators {
    pub service_manager: Arc<dyn ServiceManager>,
    pub runner: Arc<dyn InstanceRunner>,
    pub codec: Arc<dyn OciSpecCodec>,
    pub storage: Arc<dyn InstanceStorage>,
    pub sink: Arc<dyn StatusSink>,
}

/// Where the desired set of a round comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Submitted by the caller; successful starts are persisted.
    Run,
    /// Read back from the registry; the registry is left as is.
    Restore,
}

#[derive(Debug, Default)]
struct RoundState {
    /// Set once a `run_instances` round delivered its batch.
    first_run_done: bool,
}

/// State of one reconciliation round, shared by its tasks.
struct Round {
    mode: Mode,
    aggregator: StatusAggregator,
    completed: Mutex<BTreeSet<InstanceIdent>>,
}

impl Round {
    fn new(mode: Mode, capacity: usize) -> Self {
        Self {
            mode,
            aggregator: StatusAggregator::new(capacity),
            completed: Mutex::new(BTreeSet::new()),
        }
    }

    fn complete(&self, ident: InstanceIdent) {
        self.completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(ident);
    }

    fn is_completed(&self, ident: &InstanceIdent) -> bool {
        self.completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(ident)
    }

    fn report(&self, status: InstanceStatus) {
        let ident = status.ident.clone();
        if let Err(e) = self.aggregator.add(status) {
            error!(instance = %ident, error = %e, "Dropping instance status");
        }
    }
}

/// Installed service per service ID, or why it could not be resolved.
type ResolvedServices = BTreeMap<String, std::result::Result<ServiceData, StatusError>>;

// =============================================================================
// Launcher
// =============================================================================

/// Workload launcher.
pub struct Launcher {
    shared: Arc<Shared>,
    round: tokio::sync::Mutex<RoundState>,
}

struct Shared {
    config: LauncherConfig,
    service_manager: Arc<dyn ServiceManager>,
    runner: Arc<dyn InstanceRunner>,
    sink: Arc<dyn StatusSink>,
    preparer: BundlePreparer,
    registry: InstanceRegistry,
    instances: Mutex<BTreeMap<InstanceIdent, Instance>>,
    workers: Arc<Semaphore>,
}

impl Launcher {
    /// Creates a launcher and loads the persisted instance set.
    ///
    /// Nothing is started; call [`Launcher::run_last_instances`] to restore
    /// the persisted set.
    pub async fn init(config: LauncherConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let preparer = BundlePreparer::with_path(
            config.runtime_dir.clone(),
            Arc::clone(&collaborators.service_manager),
            collaborators.codec,
        )?;
        let registry = InstanceRegistry::new(collaborators.storage, config.max_instances);
        registry.load().await?;

        info!(
            runtime_dir = %config.runtime_dir.display(),
            workers = config.num_cooperate_launches,
            max_instances = config.max_instances,
            "Launcher initialized"
        );

        let workers = Arc::new(Semaphore::new(config.num_cooperate_launches));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                service_manager: collaborators.service_manager,
                runner: collaborators.runner,
                sink: collaborators.sink,
                preparer,
                registry,
                instances: Mutex::new(BTreeMap::new()),
                workers,
            }),
            round: tokio::sync::Mutex::new(RoundState::default()),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LauncherConfig {
        &self.shared.config
    }

    /// Returns the runtime directory of an instance at a service version.
    pub fn runtime_dir(&self, ident: &InstanceIdent, version_id: u64) -> PathBuf {
        self.shared.preparer.runtime_dir(ident, version_id)
    }

    /// Restarts the persisted instance set.
    ///
    /// Instances already running at the installed version are left alone
    /// but still reported, so the delivered batch describes the whole set.
    pub async fn run_last_instances(&self) -> Result<()> {
        let _round = self.round.lock().await;

        let desired = self.shared.registry.list().await?.into_inner();
        info!(count = desired.len(), "Running last instances");

        self.reconcile(desired, Mode::Restore, DeliveryKind::Run).await
    }

    /// Reconciles the running set to `instances`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] / [`Error::NoMemory`] for a rejected
    ///   submission; nothing is changed
    /// - the install error if the service batch cannot be installed; no
    ///   status is delivered
    /// - the sink error if the status batch is rejected
    pub async fn run_instances(
        &self,
        services: &[ServiceInfo],
        layers: &[LayerInfo],
        instances: &[InstanceInfo],
    ) -> Result<()> {
        let mut round = self.round.lock().await;

        let desired = validate_request(services, layers, instances, self.shared.config.max_instances)?;

        info!(
            services = services.len(),
            layers = layers.len(),
            instances = desired.len(),
            "Running instances"
        );

        let config = &self.shared.config;
        with_timeout(
            "install services",
            config.install_timeout(),
            self.shared.service_manager.install_services(services, layers),
        )
        .await
        .inspect_err(|e| error!(error = %e, "Service installation failed"))?;

        let kind = if round.first_run_done {
            DeliveryKind::Update
        } else {
            DeliveryKind::Run
        };

        let result = self.reconcile(desired.into_inner(), Mode::Run, kind).await;
        round.first_run_done = true;
        result
    }

    /// Applies run-state changes reported by the runner and forwards the
    /// affected statuses as an update.
    pub async fn update_run_status(&self, statuses: &[RunStatus]) -> Result<()> {
        let _round = self.round.lock().await;

        let aggregator = StatusAggregator::new(self.shared.config.max_instances);
        {
            let mut instances = self.shared.tracked();
            for run_status in statuses {
                let Some(instance) = instances
                    .values_mut()
                    .find(|i| i.info.ident.instance_id() == run_status.instance_id)
                else {
                    warn!(instance_id = %run_status.instance_id, "Run status for unknown instance");
                    continue;
                };

                match (instance.state(), run_status.state) {
                    (InstanceState::Active, InstanceRunState::Failed) => {
                        let error = run_status
                            .error
                            .clone()
                            .unwrap_or_else(|| StatusError::new(ErrorKind::Failed, "instance failed"));
                        warn!(instance = %instance.info.ident, error = %error, "Instance failed");
                        instance.fail(error)?;
                    }
                    (state, run_state) => {
                        debug!(
                            instance = %instance.info.ident,
                            state = %state,
                            reported = %run_state,
                            "Run status unchanged"
                        );
                        continue;
                    }
                }

                if let Some(status) = instance.status() {
                    aggregator.add(status)?;
                }
            }
        }

        if aggregator.is_empty() {
            return Ok(());
        }

        aggregator
            .finish(DeliveryKind::Update, self.shared.sink.as_ref())
            .await?;
        Ok(())
    }

    /// Returns the persisted desired set, ordered by identity.
    pub async fn instances(&self) -> Result<BoundedVec<InstanceInfo>> {
        self.shared.registry.list().await
    }

    /// Returns the last known status of every tracked instance, ordered by
    /// identity.
    pub fn instance_statuses(&self) -> Vec<InstanceStatus> {
        self.shared
            .tracked()
            .values()
            .filter_map(Instance::status)
            .collect()
    }

    // =========================================================================
    // Round
    // =========================================================================

    async fn reconcile(&self, desired: Vec<InstanceInfo>, mode: Mode, kind: DeliveryKind) -> Result<()> {
        let shared = &self.shared;

        let resolved = shared.resolve_services(&desired).await;
        let versions: BTreeMap<String, u64> = resolved
            .iter()
            .filter_map(|(id, service)| service.as_ref().ok().map(|s| (id.clone(), s.version_id())))
            .collect();

        let registered: BTreeSet<InstanceIdent> = shared
            .registry
            .list()
            .await?
            .iter()
            .map(|i| i.ident.clone())
            .collect();
        let tracked: BTreeMap<InstanceIdent, Current> = shared
            .tracked()
            .values()
            .map(|i| {
                let current = Current {
                    info: i.info.clone(),
                    version: i.service_version,
                    active: i.state() == InstanceState::Active,
                };
                (i.info.ident.clone(), current)
            })
            .collect();

        let plan = ReconcilePlan::compute(&desired, &versions, &tracked, &registered);
        info!(
            to_start = plan.to_start.len(),
            to_stop = plan.to_stop.len(),
            unchanged = plan.unchanged.len(),
            "Reconciling instances"
        );

        let round = Arc::new(Round::new(mode, shared.config.max_instances));

        if mode == Mode::Restore {
            let instances = shared.tracked();
            for info in &plan.unchanged {
                if let Some(status) = instances.get(&info.ident).and_then(Instance::status) {
                    round.report(status);
                }
            }
        }

        let mut tasks = JoinSet::new();
        for ident in &plan.to_stop {
            tasks.spawn(Arc::clone(shared).stop_task(Arc::clone(&round), ident.clone()));
        }
        for action in &plan.to_start {
            let service = resolved
                .get(&action.info.ident.service_id)
                .cloned()
                .unwrap_or_else(|| {
                    Err(StatusError::new(
                        ErrorKind::NotFound,
                        format!("service {} not resolved", action.info.ident.service_id),
                    ))
                });
            tasks.spawn(Arc::clone(shared).start_task(Arc::clone(&round), action.clone(), service));
        }

        let round_timeout = shared.config.round_timeout();
        let drained = tokio::time::timeout(round_timeout, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    error!(error = %e, "Instance task aborted");
                }
            }
        })
        .await;

        let timed_out = drained.is_err();
        if timed_out {
            warn!(timeout = ?round_timeout, outstanding = tasks.len(), "Round timed out, aborting tasks");
            tasks.shutdown().await;
        }

        shared.settle_outstanding(&round, &plan, timed_out).await;

        let round = Arc::try_unwrap(round)
            .map_err(|_| Error::Internal("round state still shared after all tasks ended".to_string()))?;
        let batch = round.aggregator.finish(kind, shared.sink.as_ref()).await?;

        info!(kind = %kind, statuses = batch.len(), "Round complete");
        Ok(())
    }
}

#[async_trait]
impl RunStatusReceiver for Launcher {
    async fn update_run_status(&self, statuses: &[RunStatus]) -> Result<()> {
        Launcher::update_run_status(self, statuses).await
    }
}

// =============================================================================
// Per-Instance Tasks
// =============================================================================

impl Shared {
    fn tracked(&self) -> MutexGuard<'_, BTreeMap<InstanceIdent, Instance>> {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Looks up every distinct service of the desired set once.
    async fn resolve_services(&self, desired: &[InstanceInfo]) -> ResolvedServices {
        let service_ids: BTreeSet<&str> = desired.iter().map(|i| i.ident.service_id.as_str()).collect();

        let mut resolved = ResolvedServices::new();
        for service_id in service_ids {
            let result = with_timeout(
                "get service",
                self.config.prepare_timeout(),
                self.service_manager.get_service(service_id),
            )
            .await;

            if let Err(e) = &result {
                warn!(service = service_id, error = %e, "Service not available");
            }
            resolved.insert(service_id.to_string(), result.map_err(|e| e.to_status()));
        }
        resolved
    }

    /// Applies `to` if the instance is tracked.
    fn transition(&self, ident: &InstanceIdent, to: InstanceState) {
        if let Some(instance) = self.tracked().get_mut(ident) {
            let _ = instance.transition(to);
        }
    }

    async fn stop_task(self: Arc<Self>, round: Arc<Round>, ident: InstanceIdent) {
        let _permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(instance = %ident, error = %e, "Worker pool closed");
                return;
            }
        };

        self.transition(&ident, InstanceState::Stopping);

        if let Err(e) = self.stop_runner(&ident).await {
            warn!(instance = %ident, error = %e, "Failed to stop instance");
        }
        self.forget(&ident).await;

        info!(instance = %ident, "Instance removed");
        round.complete(ident);
    }

    /// Removes every trace of an instance that left the desired set.
    async fn forget(&self, ident: &InstanceIdent) {
        if let Err(e) = self.preparer.cleanup(ident) {
            warn!(instance = %ident, error = %e, "Failed to remove runtime directory");
        }

        match self.registry.remove(ident).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(instance = %ident, error = %e, "Failed to unregister instance"),
        }

        if let Some(mut instance) = self.tracked().remove(ident) {
            let _ = instance.transition(InstanceState::Removed);
        }
    }

    async fn start_task(
        self: Arc<Self>,
        round: Arc<Round>,
        action: StartAction,
        service: std::result::Result<ServiceData, StatusError>,
    ) {
        let ident = action.info.ident.clone();
        let version = match &service {
            Ok(service) => service.version_id(),
            Err(_) => action.running_version.unwrap_or_default(),
        };

        let status = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(_permit) => self.start_instance(&round, action, service, version).await,
            Err(e) => {
                let error = Error::Internal(format!("worker pool closed: {e}")).to_status();
                self.mark_failed(&ident, version, error.clone());
                InstanceStatus::failed(ident.clone(), version, error)
            }
        };

        round.report(status);
        round.complete(ident);
    }

    async fn start_instance(
        &self,
        round: &Round,
        action: StartAction,
        service: std::result::Result<ServiceData, StatusError>,
        version: u64,
    ) -> InstanceStatus {
        let ident = action.info.ident.clone();

        if action.needs_stop {
            match action.running_version {
                Some(running_version) => {
                    info!(instance = %ident, from = running_version, to = version, "Restarting instance");
                    self.transition(&ident, InstanceState::Restarting);
                }
                None => debug!(instance = %ident, "Clearing failed incarnation before start"),
            }
            if let Err(e) = self.stop_runner(&ident).await {
                warn!(instance = %ident, error = %e, "Failed to stop previous incarnation");
            }
        }

        self.begin_start(&action.info, version);

        match self.launch(round.mode, &action.info, service).await {
            Ok(()) => {
                if let Some(instance) = self.tracked().get_mut(&ident) {
                    let _ = instance.transition(InstanceState::Active);
                }
                info!(instance = %ident, version, "Instance started");
                InstanceStatus::active(ident, version)
            }
            Err(error) => {
                error!(instance = %ident, version, error = %error, "Instance start failed");
                if let Err(e) = self.preparer.cleanup(&ident) {
                    warn!(instance = %ident, error = %e, "Failed to remove runtime directory");
                }
                self.mark_failed(&ident, version, error.clone());
                InstanceStatus::failed(ident, version, error)
            }
        }
    }

    /// Tracks the instance as starting with the given parameters.
    fn begin_start(&self, info: &InstanceInfo, version: u64) {
        let mut instances = self.tracked();
        let instance = instances
            .entry(info.ident.clone())
            .or_insert_with(|| Instance::new(info.clone(), version));

        instance.info = info.clone();
        instance.service_version = version;
        if instance.transition(InstanceState::Starting).is_err() {
            let mut fresh = Instance::new(info.clone(), version);
            let _ = fresh.transition(InstanceState::Starting);
            *instance = fresh;
        }
    }

    /// Records a failure for a tracked (or untracked) instance.
    fn mark_failed(&self, ident: &InstanceIdent, version: u64, error: StatusError) {
        let mut instances = self.tracked();
        let Some(instance) = instances.get_mut(ident) else {
            return;
        };

        instance.service_version = version;
        if matches!(instance.state(), InstanceState::Pending | InstanceState::Restarting) {
            let _ = instance.transition(InstanceState::Starting);
        }
        let _ = instance.fail(error);
    }

    /// Prepares, starts and registers one instance.
    async fn launch(
        &self,
        mode: Mode,
        info: &InstanceInfo,
        service: std::result::Result<ServiceData, StatusError>,
    ) -> std::result::Result<(), StatusError> {
        let service = service?;
        let ident = &info.ident;
        let instance_id = ident.instance_id();

        self.preparer.cleanup(ident).map_err(|e| e.to_status())?;

        let runtime_dir = with_timeout(
            "prepare runtime directory",
            self.config.prepare_timeout(),
            self.preparer.prepare(&service, info),
        )
        .await
        .map_err(|e| e.to_status())?;

        let start_timeout = self.config.start_timeout();
        let run_status = match tokio::time::timeout(
            start_timeout,
            self.runner.start_instance(&instance_id, &runtime_dir),
        )
        .await
        {
            Ok(status) => status,
            Err(_) => {
                if let Err(e) = self.stop_runner(ident).await {
                    warn!(instance = %ident, error = %e, "Failed to stop timed out instance");
                }
                return Err(timeout_error("start instance", start_timeout).to_status());
            }
        };

        if run_status.state == InstanceRunState::Failed {
            return Err(run_status
                .error
                .unwrap_or_else(|| StatusError::new(ErrorKind::Failed, "runner reported failure")));
        }

        if mode == Mode::Run
            && let Err(e) = self.registry.upsert(info).await
        {
            error!(instance = %ident, error = %e, "Failed to register instance, stopping it");
            if let Err(stop_err) = self.stop_runner(ident).await {
                warn!(instance = %ident, error = %stop_err, "Failed to stop unregistered instance");
            }
            return Err(e.to_status());
        }

        Ok(())
    }

    async fn stop_runner(&self, ident: &InstanceIdent) -> Result<()> {
        with_timeout(
            "stop instance",
            self.config.stop_timeout(),
            self.runner.stop_instance(&ident.instance_id()),
        )
        .await
    }

    /// Accounts for tasks that did not finish (round timeout or abort).
    async fn settle_outstanding(&self, round: &Round, plan: &ReconcilePlan, timed_out: bool) {
        for action in &plan.to_start {
            let ident = &action.info.ident;
            if round.is_completed(ident) {
                continue;
            }

            let error = if timed_out {
                timeout_error("round", self.config.round_timeout()).to_status()
            } else {
                StatusError::new(ErrorKind::Failed, "instance task aborted")
            };
            let version = self
                .tracked()
                .get(ident)
                .map_or(action.running_version.unwrap_or_default(), |i| i.service_version);

            warn!(instance = %ident, error = %error, "Start did not complete, stopping instance");
            if let Err(e) = self.stop_runner(ident).await {
                warn!(instance = %ident, error = %e, "Failed to stop unfinished start");
            }
            if let Err(e) = self.preparer.cleanup(ident) {
                warn!(instance = %ident, error = %e, "Failed to remove runtime directory");
            }
            self.mark_failed(ident, version, error.clone());
            round.report(InstanceStatus::failed(ident.clone(), version, error));
        }

        for ident in &plan.to_stop {
            if !round.is_completed(ident) {
                warn!(instance = %ident, "Stop did not complete, removing instance");
                self.forget(ident).await;
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn timeout_error(operation: &str, duration: Duration) -> Error {
    Error::Timeout {
        operation: operation.to_string(),
        duration,
    }
}

/// Runs a collaborator call with a deadline.
async fn with_timeout<T>(
    operation: &str,
    duration: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| timeout_error(operation, duration))?
}

/// Checks a submission before anything is changed.
fn validate_request(
    services: &[ServiceInfo],
    layers: &[LayerInfo],
    instances: &[InstanceInfo],
    max_instances: usize,
) -> Result<BoundedVec<InstanceInfo>> {
    BoundedVec::from_slice("services", MAX_NUM_SERVICES, services)?;
    BoundedVec::from_slice("layers", MAX_NUM_LAYERS, layers)?;
    let desired = BoundedVec::from_slice("instances", max_instances, instances)?;

    let invalid = |what: &str, id: &str, reason: &str| {
        Error::InvalidArgument(format!("{what} '{id}': {reason}"))
    };

    let mut service_ids = BTreeSet::new();
    for service in services {
        validate_id(&service.service_id, SERVICE_ID_LEN)
            .map_err(|r| invalid("service", &service.service_id, r))?;
        validate_id(&service.provider_id, PROVIDER_ID_LEN)
            .map_err(|r| invalid("provider", &service.provider_id, r))?;
        if !service_ids.insert(service.service_id.as_str()) {
            return Err(invalid("service", &service.service_id, "duplicate"));
        }
    }

    for layer in layers {
        validate_id(&layer.layer_id, LAYER_ID_LEN).map_err(|r| invalid("layer", &layer.layer_id, r))?;
    }

    let mut idents = BTreeSet::new();
    for info in instances {
        let ident = &info.ident;
        validate_id(&ident.service_id, SERVICE_ID_LEN)
            .map_err(|r| invalid("service", &ident.service_id, r))?;
        validate_id(&ident.subject_id, SUBJECT_ID_LEN)
            .map_err(|r| invalid("subject", &ident.subject_id, r))?;
        if info.storage_path.len() > FILE_PATH_LEN || info.state_path.len() > FILE_PATH_LEN {
            return Err(invalid("instance", &ident.to_string(), "path exceeds maximum length"));
        }
        if !idents.insert(ident) {
            return Err(invalid("instance", &ident.to_string(), "duplicate"));
        }
    }

    Ok(desired)
}
