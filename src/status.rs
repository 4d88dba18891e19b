//! Status aggregation.
//!
//! Per-instance tasks report their outcome concurrently; the aggregator
//! collects them into one bounded batch and delivers it to the
//! [`StatusSink`] exactly once, ordered by instance identity.

use crate::bounded::BoundedVec;
use crate::error::Result;
use crate::types::InstanceStatus;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Remote-facing status collaborator.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Receives the full status of a run round.
    async fn instances_run_status(&self, statuses: &[InstanceStatus]) -> Result<()>;

    /// Receives an incremental status update.
    async fn instances_update_status(&self, statuses: &[InstanceStatus]) -> Result<()>;
}

/// Which sink entry point a batch goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Full status set ([`StatusSink::instances_run_status`]).
    Run,
    /// Incremental update ([`StatusSink::instances_update_status`]).
    Update,
}

impl std::fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Collects instance statuses of one round.
///
/// `add` may be called from any task; `finish` consumes the aggregator so a
/// batch cannot be delivered twice.
pub struct StatusAggregator {
    statuses: Mutex<BoundedVec<InstanceStatus>>,
}

impl StatusAggregator {
    /// Creates an aggregator holding at most `capacity` statuses.
    pub fn new(capacity: usize) -> Self {
        Self {
            statuses: Mutex::new(BoundedVec::new("status batch", capacity)),
        }
    }

    /// Records a status.
    ///
    /// A second status for the same instance replaces the first.
    pub fn add(&self, status: InstanceStatus) -> Result<()> {
        let mut statuses = self.lock();
        if let Some(existing) = statuses.find_mut(|s| s.ident == status.ident) {
            *existing = status;
            return Ok(());
        }
        statuses.push(status)
    }

    /// Returns the number of recorded statuses.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sorts the batch by identity and delivers it.
    ///
    /// Returns the delivered batch. A sink error is returned unchanged.
    pub async fn finish(self, kind: DeliveryKind, sink: &dyn StatusSink) -> Result<Vec<InstanceStatus>> {
        let mut statuses = self
            .statuses
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        statuses.sort_by_key(|s| s.ident.clone());

        debug!(kind = %kind, count = statuses.len(), "Delivering status batch");

        let result = match kind {
            DeliveryKind::Run => sink.instances_run_status(&statuses).await,
            DeliveryKind::Update => sink.instances_update_status(&statuses).await,
        };

        if let Err(e) = result {
            warn!(kind = %kind, error = %e, "Status sink rejected batch");
            return Err(e);
        }

        Ok(statuses.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoundedVec<InstanceStatus>> {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
