//! Desired vs current diff.

use crate::types::{InstanceIdent, InstanceInfo};
use std::collections::{BTreeMap, BTreeSet};

/// One instance to (re)start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAction {
    pub info: InstanceInfo,
    /// Version of the incarnation currently active, if any.
    pub running_version: Option<u64>,
    /// The runner may still hold an earlier incarnation (active, crashed or
    /// abandoned); it must be stopped before the new start.
    pub needs_stop: bool,
}

/// What the launcher tracks for one instance when a round is planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Current {
    /// Parameters the instance was last started with.
    pub info: InstanceInfo,
    pub version: u64,
    /// Started and not reported failed since.
    pub active: bool,
}

/// Disjoint action sets of one round, each ordered by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_start: Vec<StartAction>,
    pub to_stop: Vec<InstanceIdent>,
    pub unchanged: Vec<InstanceInfo>,
}

impl ReconcilePlan {
    /// Computes the plan.
    ///
    /// - `desired`: the submitted instance set (identities unique)
    /// - `resolved`: installed version per resolvable service ID
    /// - `tracked`: every instance the launcher has started or tried to
    /// - `registered`: every identity in the registry
    ///
    /// An instance is unchanged only if it is active at the installed
    /// version with exactly the desired parameters.
    pub fn compute(
        desired: &[InstanceInfo],
        resolved: &BTreeMap<String, u64>,
        tracked: &BTreeMap<InstanceIdent, Current>,
        registered: &BTreeSet<InstanceIdent>,
    ) -> Self {
        let mut plan = Self::default();
        let mut desired_idents = BTreeSet::new();

        for info in desired {
            desired_idents.insert(info.ident.clone());

            let installed = resolved.get(&info.ident.service_id).copied();
            match tracked.get(&info.ident) {
                Some(current)
                    if current.active && installed == Some(current.version) && current.info == *info =>
                {
                    plan.unchanged.push(info.clone());
                }
                Some(current) => plan.to_start.push(StartAction {
                    info: info.clone(),
                    running_version: current.active.then_some(current.version),
                    needs_stop: true,
                }),
                None => plan.to_start.push(StartAction {
                    info: info.clone(),
                    running_version: None,
                    needs_stop: false,
                }),
            }
        }

        plan.to_stop = registered
            .iter()
            .chain(tracked.keys())
            .filter(|ident| !desired_idents.contains(*ident))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        plan.to_start.sort_by(|a, b| a.info.ident.cmp(&b.info.ident));
        plan.unchanged.sort_by(|a, b| a.ident.cmp(&b.ident));
        plan
    }

    /// Returns true if nothing needs to start or stop.
    pub fn is_noop(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(service: &str, index: u64) -> InstanceInfo {
        InstanceInfo::new(InstanceIdent::new(service, "subject1", index), 5000)
    }

    fn resolved(entries: &[(&str, u64)]) -> BTreeMap<String, u64> {
        entries.iter().map(|(s, v)| (s.to_string(), *v)).collect()
    }

    fn active(info: &InstanceInfo, version: u64) -> (InstanceIdent, Current) {
        (
            info.ident.clone(),
            Current {
                info: info.clone(),
                version,
                active: true,
            },
        )
    }

    #[test]
    fn test_new_instances_start() {
        let desired = vec![info("service1", 1), info("service1", 0)];
        let plan = ReconcilePlan::compute(
            &desired,
            &resolved(&[("service1", 1)]),
            &BTreeMap::new(),
            &BTreeSet::new(),
        );

        assert_eq!(plan.to_start.len(), 2);
        assert_eq!(plan.to_start[0].info.ident.instance, 0);
        assert!(plan.to_start.iter().all(|a| a.running_version.is_none() && !a.needs_stop));
        assert!(plan.to_stop.is_empty());
    }

    #[test]
    fn test_same_version_is_unchanged() {
        let desired = vec![info("service1", 0)];
        let tracked = BTreeMap::from([active(&desired[0], 1)]);
        let registered = BTreeSet::from([desired[0].ident.clone()]);

        let plan = ReconcilePlan::compute(&desired, &resolved(&[("service1", 1)]), &tracked, &registered);

        assert!(plan.is_noop());
        assert_eq!(plan.unchanged, desired);
    }

    #[test]
    fn test_version_change_restarts() {
        let desired = vec![info("service1", 0)];
        let tracked = BTreeMap::from([active(&desired[0], 1)]);

        let plan = ReconcilePlan::compute(
            &desired,
            &resolved(&[("service1", 2)]),
            &tracked,
            &BTreeSet::new(),
        );

        assert_eq!(plan.to_start.len(), 1);
        assert_eq!(plan.to_start[0].running_version, Some(1));
        assert!(plan.to_start[0].needs_stop);
    }

    #[test]
    fn test_parameter_change_restarts_at_same_version() {
        let running = info("service1", 0);
        let tracked = BTreeMap::from([active(&running, 1)]);

        let mut desired = running.clone();
        desired.uid = 7777;
        desired.storage_path = "/var/aos/storages/0".to_string();

        let plan = ReconcilePlan::compute(
            std::slice::from_ref(&desired),
            &resolved(&[("service1", 1)]),
            &tracked,
            &BTreeSet::new(),
        );

        assert!(plan.unchanged.is_empty());
        assert_eq!(plan.to_start[0].info, desired);
        assert_eq!(plan.to_start[0].running_version, Some(1));
    }

    #[test]
    fn test_failed_instance_is_stopped_before_retry() {
        let desired = vec![info("service1", 0)];
        let tracked = BTreeMap::from([(
            desired[0].ident.clone(),
            Current {
                info: desired[0].clone(),
                version: 1,
                active: false,
            },
        )]);

        let plan = ReconcilePlan::compute(&desired, &resolved(&[("service1", 1)]), &tracked, &BTreeSet::new());

        assert!(plan.unchanged.is_empty());
        assert_eq!(plan.to_start[0].running_version, None);
        assert!(plan.to_start[0].needs_stop);
    }

    #[test]
    fn test_unresolved_service_starts_and_fails_later() {
        let desired = vec![info("missing", 0)];
        let tracked = BTreeMap::from([active(&desired[0], 1)]);

        let plan = ReconcilePlan::compute(&desired, &BTreeMap::new(), &tracked, &BTreeSet::new());

        assert_eq!(plan.to_start.len(), 1);
        assert!(plan.unchanged.is_empty());
    }

    #[test]
    fn test_undesired_known_instances_stop() {
        let registered = info("service1", 0).ident;
        let tracked_info = info("service2", 3);
        let tracked = BTreeMap::from([active(&tracked_info, 1)]);

        let plan = ReconcilePlan::compute(&[], &BTreeMap::new(), &tracked, &BTreeSet::from([registered.clone()]));

        assert_eq!(plan.to_stop, vec![registered, tracked_info.ident]);
        assert!(plan.to_start.is_empty());
    }

    #[test]
    fn test_index_only_difference_is_independent() {
        let desired = vec![info("service1", 1)];
        let running = info("service1", 0);
        let tracked = BTreeMap::from([active(&running, 1)]);

        let plan = ReconcilePlan::compute(&desired, &resolved(&[("service1", 1)]), &tracked, &BTreeSet::new());

        assert_eq!(plan.to_stop, vec![running.ident]);
        assert_eq!(plan.to_start[0].info.ident.instance, 1);
        assert!(!plan.to_start[0].needs_stop);
    }
}
