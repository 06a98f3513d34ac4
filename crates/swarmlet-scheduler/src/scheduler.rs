//! Pod scheduling — picks a node per workload instance.
//!
//! Intentionally trivial: a non-empty node selector picks the first
//! node whose labels are a superset, anything else goes to a uniformly
//! random member. The scheduler also keeps the cluster-wide pod
//! bookkeeping the workload controller and recovery consult. Richer
//! policies can replace this without touching the registry or store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::seq::SliceRandom;
use tracing::info;

use swarmlet_state::{selector_matches, Node, Pod, PodState};

use crate::error::{ScheduleError, ScheduleResult};

/// The narrow view of the membership layer the scheduler needs.
pub trait MemberView: Send + Sync {
    fn members(&self) -> Vec<Node>;
}

/// Assigns pods to nodes and tracks scheduling decisions.
pub struct Scheduler {
    members: Arc<dyn MemberView>,
    pods: RwLock<HashMap<String, Pod>>,
}

impl Scheduler {
    pub fn new(members: Arc<dyn MemberView>) -> Self {
        Scheduler {
            members,
            pods: RwLock::new(HashMap::new()),
        }
    }

    /// Assign a node to the pod, record the decision, and return the
    /// node name. The pod's `node_name` is filled in.
    pub fn schedule(&self, pod: &mut Pod) -> ScheduleResult<String> {
        let nodes = self.members.members();

        let target = if pod.node_selector.is_empty() {
            nodes
                .choose(&mut rand::thread_rng())
                .ok_or(ScheduleError::NoNodes)?
                .clone()
        } else {
            nodes
                .into_iter()
                .find(|n| selector_matches(&n.labels, &pod.node_selector))
                .ok_or(ScheduleError::NoSelectorMatch)?
        };

        pod.node_name = target.name.clone();
        self.record(pod);
        info!(pod = %pod.name, node = %target.name, "scheduled pod");
        Ok(target.name)
    }

    /// Insert or refresh a scheduling record (keyed by pod id).
    pub fn record(&self, pod: &Pod) {
        self.pods
            .write()
            .expect("pods lock")
            .insert(pod.id.clone(), pod.clone());
    }

    /// Re-key a record after realization replaced the pod id.
    pub fn rekey(&self, old_id: &str, pod: &Pod) {
        let mut pods = self.pods.write().expect("pods lock");
        pods.remove(old_id);
        pods.insert(pod.id.clone(), pod.clone());
    }

    pub fn pod(&self, id: &str) -> Option<Pod> {
        self.pods.read().expect("pods lock").get(id).cloned()
    }

    /// All pods scheduled to a given node.
    pub fn pods_on(&self, node_name: &str) -> Vec<Pod> {
        self.pods
            .read()
            .expect("pods lock")
            .values()
            .filter(|p| p.node_name == node_name)
            .cloned()
            .collect()
    }

    pub fn all_pods(&self) -> Vec<Pod> {
        self.pods.read().expect("pods lock").values().cloned().collect()
    }

    pub fn remove_pod(&self, id: &str) {
        self.pods.write().expect("pods lock").remove(id);
    }

    /// Update the recorded state of a pod. Returns false when unknown.
    pub fn set_pod_state(&self, id: &str, state: PodState) -> bool {
        let mut pods = self.pods.write().expect("pods lock");
        match pods.get_mut(id) {
            Some(pod) => {
                pod.state = state;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmlet_state::NodeStatus;

    struct FixedMembers(Vec<Node>);
    impl MemberView for FixedMembers {
        fn members(&self) -> Vec<Node> {
            self.0.clone()
        }
    }

    fn node(name: &str, labels: &[(&str, &str)]) -> Node {
        Node {
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            status: NodeStatus::Ready,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn pod(name: &str, selector: &[(&str, &str)]) -> Pod {
        Pod {
            id: format!("pod-{name}"),
            name: name.to_string(),
            namespace: "default".to_string(),
            node_name: String::new(),
            state: PodState::Pending,
            image: "nginx".to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            ports: Vec::new(),
            env: Vec::new(),
            volume_mounts: Vec::new(),
            node_selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_at: 1000,
        }
    }

    #[test]
    fn random_placement_picks_a_member() {
        let scheduler = Scheduler::new(Arc::new(FixedMembers(vec![
            node("node-1", &[]),
            node("node-2", &[]),
        ])));

        let mut p = pod("web-0", &[]);
        let target = scheduler.schedule(&mut p).unwrap();
        assert!(target == "node-1" || target == "node-2");
        assert_eq!(p.node_name, target);
    }

    #[test]
    fn selector_picks_matching_node() {
        let scheduler = Scheduler::new(Arc::new(FixedMembers(vec![
            node("cpu-node", &[("disk", "hdd")]),
            node("gpu-node", &[("gpu", "true"), ("disk", "ssd")]),
        ])));

        let mut p = pod("train-0", &[("gpu", "true")]);
        assert_eq!(scheduler.schedule(&mut p).unwrap(), "gpu-node");
    }

    #[test]
    fn selector_without_match_is_a_distinct_error() {
        let scheduler = Scheduler::new(Arc::new(FixedMembers(vec![node("node-1", &[])])));

        let mut p = pod("train-0", &[("gpu", "true")]);
        assert_eq!(
            scheduler.schedule(&mut p),
            Err(ScheduleError::NoSelectorMatch)
        );
        // No partial state: the pod was not recorded.
        assert!(scheduler.all_pods().is_empty());
        assert!(p.node_name.is_empty());
    }

    #[test]
    fn empty_cluster_cannot_schedule() {
        let scheduler = Scheduler::new(Arc::new(FixedMembers(vec![])));
        let mut p = pod("web-0", &[]);
        assert_eq!(scheduler.schedule(&mut p), Err(ScheduleError::NoNodes));
    }

    #[test]
    fn bookkeeping_by_node() {
        let scheduler = Scheduler::new(Arc::new(FixedMembers(vec![node("node-1", &[])])));

        let mut a = pod("web-0", &[]);
        let mut b = pod("web-1", &[]);
        scheduler.schedule(&mut a).unwrap();
        scheduler.schedule(&mut b).unwrap();

        assert_eq!(scheduler.pods_on("node-1").len(), 2);
        assert_eq!(scheduler.pods_on("node-2").len(), 0);
        assert!(scheduler.pod(&a.id).is_some());

        scheduler.remove_pod(&a.id);
        assert_eq!(scheduler.all_pods().len(), 1);
    }

    #[test]
    fn rekey_replaces_placeholder_id() {
        let scheduler = Scheduler::new(Arc::new(FixedMembers(vec![node("node-1", &[])])));

        let mut p = pod("web-0", &[]);
        scheduler.schedule(&mut p).unwrap();
        let placeholder = p.id.clone();

        p.id = "runtime-ctr-123".to_string();
        scheduler.rekey(&placeholder, &p);

        assert!(scheduler.pod(&placeholder).is_none());
        assert!(scheduler.pod("runtime-ctr-123").is_some());
    }

    #[test]
    fn set_pod_state_updates_record() {
        let scheduler = Scheduler::new(Arc::new(FixedMembers(vec![node("node-1", &[])])));

        let mut p = pod("web-0", &[]);
        scheduler.schedule(&mut p).unwrap();

        assert!(scheduler.set_pod_state(&p.id, PodState::Running));
        assert_eq!(scheduler.pod(&p.id).unwrap().state, PodState::Running);
        assert!(!scheduler.set_pod_state("ghost", PodState::Failed));
    }
}
