//! Per-instance lifecycle tracking.
//!
//! State machine:
//!
//! ```text
//!   Pending ──▶ Starting ──▶ Active ──▶ Stopping ──▶ Removed
//!                 │   ▲        │  │        ▲
//!                 ▼   │        │  ▼        │
//!               Failed ◀───────┘ Restarting│
//!                 │   └────────────┘       │
//!                 └────────────────────────┘
//! ```
//!
//! `Active ──▶ Failed` happens when the runner reports a crash.

use crate::error::{Error, StatusError};
use crate::types::{InstanceInfo, InstanceStatus};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Lifecycle state of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Pending,
    Starting,
    Active,
    Failed,
    Stopping,
    Removed,
    Restarting,
}

impl InstanceState {
    /// Returns true if `self ──▶ to` is a legal transition.
    pub fn can_transition_to(self, to: Self) -> bool {
        use InstanceState::*;
        matches!(
            (self, to),
            (Pending, Starting)
                | (Starting, Active)
                | (Starting, Failed)
                | (Active, Stopping)
                | (Active, Restarting)
                | (Active, Failed)
                | (Restarting, Starting)
                | (Stopping, Removed)
                | (Failed, Starting)
                | (Failed, Stopping)
        )
    }

    /// Returns true for the states a round ends in.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Active | Self::Failed | Self::Removed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
            Self::Removed => "removed",
            Self::Restarting => "restarting",
        };
        write!(f, "{s}")
    }
}

/// A tracked instance.
#[derive(Debug, Clone)]
pub struct Instance {
    pub info: InstanceInfo,
    /// Version of the service the instance is bound to.
    pub service_version: u64,
    state: InstanceState,
    error: Option<StatusError>,
    started_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Creates a pending instance.
    pub fn new(info: InstanceInfo, service_version: u64) -> Self {
        Self {
            info,
            service_version,
            state: InstanceState::Pending,
            error: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Moves to `to`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an illegal transition; the state is
    /// left unchanged.
    pub fn transition(&mut self, to: InstanceState) -> crate::Result<()> {
        if !self.state.can_transition_to(to) {
            warn!(
                instance = %self.info.ident,
                from = %self.state,
                to = %to,
                "Illegal instance state transition"
            );
            return Err(Error::InvalidArgument(format!(
                "instance {}: illegal transition {} -> {}",
                self.info.ident, self.state, to
            )));
        }

        match to {
            InstanceState::Active => {
                self.error = None;
                self.started_at = Some(Utc::now());
            }
            InstanceState::Starting => self.error = None,
            _ => {}
        }

        self.state = to;
        Ok(())
    }

    /// Moves to [`InstanceState::Failed`] recording `error`.
    pub fn fail(&mut self, error: StatusError) -> crate::Result<()> {
        self.transition(InstanceState::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Returns the reportable status, `None` while the instance is between
    /// terminal states or removed.
    pub fn status(&self) -> Option<InstanceStatus> {
        let ident = self.info.ident.clone();
        match self.state {
            InstanceState::Active => Some(InstanceStatus::active(ident, self.service_version)),
            InstanceState::Failed => Some(InstanceStatus {
                ident,
                service_version: self.service_version,
                run_state: crate::types::InstanceRunState::Failed,
                error: self.error.clone(),
            }),
            _ => None,
        }
    }
}
