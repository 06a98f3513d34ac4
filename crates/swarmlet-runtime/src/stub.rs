//! In-memory runtime used by tests and engine-less agents.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use swarmlet_state::{Pod, PodState};

use crate::{ContainerRuntime, RuntimeError, RuntimeResult};

/// A container runtime that only pretends.
///
/// Containers are rows in a map; lifecycle transitions happen
/// instantly. Tests use it to observe what the workload controller
/// asked the runtime to do.
#[derive(Default)]
pub struct StubRuntime {
    containers: RwLock<HashMap<String, StubContainer>>,
    dns_ip: RwLock<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct StubContainer {
    pub name: String,
    pub image: String,
    pub state: PodState,
    pub dns_ip: Option<String>,
}

impl StubRuntime {
    pub fn new() -> Self {
        StubRuntime::default()
    }

    /// Snapshot of all containers, keyed by id.
    pub fn containers(&self) -> HashMap<String, StubContainer> {
        self.containers.read().expect("stub lock").clone()
    }

    pub fn container_count(&self) -> usize {
        self.containers.read().expect("stub lock").len()
    }

    /// Drop every container without going through stop/remove, as if
    /// an operator wiped the engine behind the agent's back.
    pub fn wipe(&self) {
        self.containers.write().expect("stub lock").clear();
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn create(&self, pod: &Pod) -> RuntimeResult<String> {
        let id = format!("stub-{}", Uuid::new_v4());
        let container = StubContainer {
            name: pod.name.clone(),
            image: pod.image.clone(),
            state: PodState::Pending,
            dns_ip: self.dns_ip.read().expect("stub lock").clone(),
        };
        self.containers
            .write()
            .expect("stub lock")
            .insert(id.clone(), container);
        Ok(id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        let mut containers = self.containers.write().expect("stub lock");
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.state = PodState::Running;
        Ok(())
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        let mut containers = self.containers.write().expect("stub lock");
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.state = PodState::Succeeded;
        Ok(())
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.containers.write().expect("stub lock").remove(id);
        Ok(())
    }

    async fn state(&self, id: &str) -> RuntimeResult<PodState> {
        self.containers
            .read()
            .expect("stub lock")
            .get(id)
            .map(|c| c.state)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn pull(&self, _image: &str) -> RuntimeResult<()> {
        Ok(())
    }

    async fn logs(&self, id: &str, _tail: Option<u32>) -> RuntimeResult<String> {
        self.containers
            .read()
            .expect("stub lock")
            .get(id)
            .map(|_| String::new())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn set_dns(&self, ip: &str) {
        *self.dns_ip.write().expect("stub lock") = Some(ip.to_string());
    }
}
