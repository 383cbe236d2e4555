//! The set of active instances, keyed by SID.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Instance;

/// Classification of discovered SIDs against current membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Discovered, not registered.
    pub new: Vec<String>,
    /// Discovered and registered.
    pub same: Vec<String>,
    /// Registered, no longer discovered.
    pub gone: Vec<String>,
}

/// Splits SIDs into new / same / gone. All three lists are sorted.
pub fn reconcile<'a, D, C>(discovered: D, current: C) -> Reconciliation
where
    D: IntoIterator<Item = &'a str>,
    C: IntoIterator<Item = &'a str>,
{
    let discovered: BTreeSet<&str> = discovered.into_iter().collect();
    let current: BTreeSet<&str> = current.into_iter().collect();
    Reconciliation {
        new: discovered
            .difference(&current)
            .map(|s| s.to_string())
            .collect(),
        same: discovered
            .intersection(&current)
            .map(|s| s.to_string())
            .collect(),
        gone: current
            .difference(&discovered)
            .map(|s| s.to_string())
            .collect(),
    }
}

/// Active instances. Mutated only by discovery; everyone else snapshots.
#[derive(Default)]
pub struct InstanceRegistry {
    members: Mutex<Vec<Arc<Instance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of the member list, in SID order.
    pub fn snapshot(&self) -> Vec<Arc<Instance>> {
        self.members.lock().clone()
    }

    pub fn sids(&self) -> Vec<String> {
        self.members
            .lock()
            .iter()
            .map(|i| i.sid().to_string())
            .collect()
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Instance>> {
        self.members.lock().iter().find(|i| i.sid() == sid).cloned()
    }

    /// Adds an instance, replacing any member with the same SID.
    pub fn add(&self, instance: Arc<Instance>) {
        let mut members = self.members.lock();
        members.retain(|i| i.sid() != instance.sid());
        let pos = members
            .binary_search_by(|i| i.sid().cmp(instance.sid()))
            .unwrap_or_else(|p| p);
        members.insert(pos, instance);
    }

    pub fn remove(&self, sid: &str) -> Option<Arc<Instance>> {
        let mut members = self.members.lock();
        let pos = members.iter().position(|i| i.sid() == sid)?;
        Some(members.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockConnector;
    use crate::instance::testutil::context;

    fn sets() -> Vec<(Vec<&'static str>, Vec<&'static str>)> {
        vec![
            (vec![], vec![]),
            (vec!["A"], vec![]),
            (vec![], vec!["A"]),
            (vec!["A", "B", "C"], vec!["B", "C", "D"]),
            (vec!["A", "A", "B"], vec!["B"]),
            (vec!["X", "Y"], vec!["X", "Y"]),
            (vec!["ORCL1", "ORCL2", "TEST1"], vec!["ORCL2", "DEV9"]),
        ]
    }

    #[test]
    fn test_reconciliation_partitions_both_sets() {
        for (d, c) in sets() {
            let r = reconcile(d.iter().copied(), c.iter().copied());
            let dset: BTreeSet<String> = d.iter().map(|s| s.to_string()).collect();
            let cset: BTreeSet<String> = c.iter().map(|s| s.to_string()).collect();
            let new: BTreeSet<String> = r.new.iter().cloned().collect();
            let same: BTreeSet<String> = r.same.iter().cloned().collect();
            let gone: BTreeSet<String> = r.gone.iter().cloned().collect();

            assert!(new.is_disjoint(&same), "{d:?} {c:?}");
            assert!(new.is_disjoint(&gone), "{d:?} {c:?}");
            assert!(same.is_disjoint(&gone), "{d:?} {c:?}");
            assert_eq!(new.union(&same).cloned().collect::<BTreeSet<_>>(), dset);
            assert_eq!(gone.union(&same).cloned().collect::<BTreeSet<_>>(), cset);
        }
    }

    #[test]
    fn test_reconcile_example() {
        let r = reconcile(["A", "B", "C"], ["B", "C", "D"]);
        assert_eq!(r.new, vec!["A"]);
        assert_eq!(r.same, vec!["B", "C"]);
        assert_eq!(r.gone, vec!["D"]);
    }

    #[test]
    fn test_membership_is_sorted_and_keyed_by_sid() {
        let mock = MockConnector::new();
        let ctx = context(&mock, false);
        let reg = InstanceRegistry::new();
        reg.add(Instance::new("ORCL2", 2, Arc::clone(&ctx)));
        reg.add(Instance::new("ORCL1", 1, Arc::clone(&ctx)));
        reg.add(Instance::new("ORCL2", 22, Arc::clone(&ctx)));

        assert_eq!(reg.sids(), vec!["ORCL1", "ORCL2"]);
        assert_eq!(reg.get("ORCL2").unwrap().view().pid, 22);

        let snap = reg.snapshot();
        assert!(reg.remove("ORCL1").is_some());
        assert!(reg.remove("ORCL1").is_none());
        assert_eq!(snap.len(), 2);
        assert_eq!(reg.len(), 1);
    }
}
