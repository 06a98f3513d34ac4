//! Startup recovery — rebuild workloads from the persisted snapshot.
//!
//! Runs once after the membership has had a few seconds to stabilize.
//! Every persisted deployment gets its pod list rebuilt from the
//! template: replicas are re-scheduled and the ones landing on this
//! node are re-created through the runtime, replacing stale pod ids
//! with the fresh container ids. Stored services then re-register
//! endpoints for the matching local pods.

use std::time::Duration;

use tracing::{error, info};

use swarmlet_state::{selector_matches, PodState};

use crate::controller::WorkloadController;

/// Delay before recovery starts, giving membership time to settle.
pub const RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// Counts of what recovery did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub deployments_recovered: usize,
    pub pods_failed: usize,
    pub services_recovered: usize,
}

impl WorkloadController {
    /// Recreate all persisted workloads and service registrations.
    pub async fn recover(&self) -> RecoveryStats {
        info!("starting state recovery from persisted snapshot");
        let mut stats = RecoveryStats::default();

        for mut deployment in self.store().list_deployments() {
            info!(
                deployment = %deployment.name,
                namespace = %deployment.namespace,
                "recovering deployment"
            );

            let desired = deployment.replicas as usize;
            deployment.pods.clear();
            for i in 0..deployment.replicas {
                let pod_name = format!("{}-{}", deployment.name, i);
                match self.realize_replica(&deployment, &pod_name).await {
                    Some(pod) => {
                        self.store().save_pod(&pod);
                        deployment.pods.push(pod);
                    }
                    None => stats.pods_failed += 1,
                }
            }

            if deployment.pods.len() < desired {
                error!(
                    deployment = %deployment.name,
                    recovered = deployment.pods.len(),
                    desired,
                    "some replicas failed to recover"
                );
            }

            self.store().save_deployment(&deployment);
            stats.deployments_recovered += 1;
        }

        for service in self.store().list_services() {
            info!(service = %service.name, namespace = %service.namespace, "recovering service");
            for pod in self.scheduler().all_pods() {
                if pod.state == PodState::Running
                    && pod.namespace == service.namespace
                    && selector_matches(&pod.labels, &service.selector)
                {
                    self.registry().register(&service, &pod);
                }
            }
            stats.services_recovered += 1;
        }

        info!(
            deployments = stats.deployments_recovered,
            services = stats.services_recovered,
            failed_pods = stats.pods_failed,
            "state recovery complete"
        );
        stats
    }
}
