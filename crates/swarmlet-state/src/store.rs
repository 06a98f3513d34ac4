//! Store — the authoritative declared state of the cluster.
//!
//! All four entity maps live behind one read-write lock and are keyed
//! `{namespace}/{name}`. Every mutation bumps `last_modified` and
//! persists the full snapshot with an atomic tmp-write + rename, so the
//! on-disk `state.json` is never torn. A persist failure is logged and
//! does not fail the mutation: the in-memory write has already happened
//! and the next mutation (or merge) retries the write.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::types::*;

const STATE_FILE: &str = "state.json";
const STATE_TMP_FILE: &str = "state.json.tmp";
const STATE_VERSION: u32 = 1;

const SNAPSHOT_MODE: u32 = 0o640;

/// Persistent store for the declared cluster state.
pub struct Store {
    data_dir: PathBuf,
    inner: RwLock<ClusterState>,
}

impl Store {
    /// Open the store, creating the data directory if needed and
    /// loading any existing snapshot.
    ///
    /// An absent snapshot starts the store empty. A corrupt snapshot is
    /// logged and left in place (it is the operator's recovery
    /// artifact); the store starts empty.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        fs::create_dir_all(data_dir)?;

        let store = Store {
            data_dir: data_dir.to_path_buf(),
            inner: RwLock::new(ClusterState {
                version: STATE_VERSION,
                ..Default::default()
            }),
        };
        store.load();
        Ok(store)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn save_deployment(&self, deployment: &Deployment) {
        let mut inner = self.inner.write().expect("state lock");
        let key = resource_key(&deployment.namespace, &deployment.name);
        inner.deployments.insert(key.clone(), deployment.clone());
        inner.last_modified = now_millis();
        self.persist_locked(&inner);
        debug!(%key, "deployment stored");
    }

    pub fn get_deployment(&self, namespace: &str, name: &str) -> StoreResult<Deployment> {
        let inner = self.inner.read().expect("state lock");
        let key = resource_key(namespace, name);
        inner
            .deployments
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("deployment {key}")))
    }

    /// Delete is idempotent: removing an absent deployment is not an error.
    pub fn delete_deployment(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().expect("state lock");
        inner.deployments.remove(&resource_key(namespace, name));
        inner.last_modified = now_millis();
        self.persist_locked(&inner);
    }

    pub fn list_deployments(&self) -> Vec<Deployment> {
        let inner = self.inner.read().expect("state lock");
        inner.deployments.values().cloned().collect()
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn save_service(&self, service: &Service) {
        let mut inner = self.inner.write().expect("state lock");
        let key = resource_key(&service.namespace, &service.name);
        inner.services.insert(key.clone(), service.clone());
        inner.last_modified = now_millis();
        self.persist_locked(&inner);
        debug!(%key, "service stored");
    }

    pub fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Service> {
        let inner = self.inner.read().expect("state lock");
        let key = resource_key(namespace, name);
        inner
            .services
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("service {key}")))
    }

    pub fn delete_service(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().expect("state lock");
        inner.services.remove(&resource_key(namespace, name));
        inner.last_modified = now_millis();
        self.persist_locked(&inner);
    }

    pub fn list_services(&self) -> Vec<Service> {
        let inner = self.inner.read().expect("state lock");
        inner.services.values().cloned().collect()
    }

    // ── Ingresses ──────────────────────────────────────────────────

    pub fn save_ingress(&self, ingress: &Ingress) {
        let mut inner = self.inner.write().expect("state lock");
        let key = resource_key(&ingress.namespace, &ingress.name);
        inner.ingresses.insert(key.clone(), ingress.clone());
        inner.last_modified = now_millis();
        self.persist_locked(&inner);
        debug!(%key, "ingress stored");
    }

    pub fn get_ingress(&self, namespace: &str, name: &str) -> StoreResult<Ingress> {
        let inner = self.inner.read().expect("state lock");
        let key = resource_key(namespace, name);
        inner
            .ingresses
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ingress {key}")))
    }

    pub fn delete_ingress(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().expect("state lock");
        inner.ingresses.remove(&resource_key(namespace, name));
        inner.last_modified = now_millis();
        self.persist_locked(&inner);
    }

    pub fn list_ingresses(&self) -> Vec<Ingress> {
        let inner = self.inner.read().expect("state lock");
        inner.ingresses.values().cloned().collect()
    }

    // ── Pods ───────────────────────────────────────────────────────

    pub fn save_pod(&self, pod: &Pod) {
        let mut inner = self.inner.write().expect("state lock");
        let key = resource_key(&pod.namespace, &pod.name);
        inner.pods.insert(key.clone(), pod.clone());
        inner.last_modified = now_millis();
        self.persist_locked(&inner);
    }

    pub fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod> {
        let inner = self.inner.read().expect("state lock");
        let key = resource_key(namespace, name);
        inner
            .pods
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("pod {key}")))
    }

    pub fn delete_pod(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().expect("state lock");
        inner.pods.remove(&resource_key(namespace, name));
        inner.last_modified = now_millis();
        self.persist_locked(&inner);
    }

    pub fn list_pods(&self) -> Vec<Pod> {
        let inner = self.inner.read().expect("state lock");
        inner.pods.values().cloned().collect()
    }

    // ── Snapshot access and merge ──────────────────────────────────

    /// Clone out the full state for broadcast or inspection.
    pub fn state(&self) -> ClusterState {
        self.inner.read().expect("state lock").clone()
    }

    /// Unix millis of the last local mutation.
    pub fn last_modified(&self) -> u64 {
        self.inner.read().expect("state lock").last_modified
    }

    /// Merge an incoming peer snapshot, last-writer-wins.
    ///
    /// When the incoming snapshot is newer, its deployments, services
    /// and ingresses overwrite local entries at the same key. Pods use
    /// per-record precedence by `created_at`. An older or equal
    /// snapshot is ignored. Returns whether anything was merged.
    ///
    /// Deletes carry no tombstones: a stale peer re-broadcasting a
    /// deleted entity resurrects it until the deleting node's next
    /// snapshot dominates again.
    pub fn merge(&self, incoming: &ClusterState) -> bool {
        let mut inner = self.inner.write().expect("state lock");

        if incoming.last_modified <= inner.last_modified {
            return false;
        }

        info!(
            incoming = incoming.last_modified,
            local = inner.last_modified,
            "merging newer state from peer"
        );

        for (key, deployment) in &incoming.deployments {
            inner.deployments.insert(key.clone(), deployment.clone());
        }
        for (key, service) in &incoming.services {
            inner.services.insert(key.clone(), service.clone());
        }
        for (key, ingress) in &incoming.ingresses {
            inner.ingresses.insert(key.clone(), ingress.clone());
        }
        for (key, pod) in &incoming.pods {
            let newer = match inner.pods.get(key) {
                Some(existing) => pod.created_at > existing.created_at,
                None => true,
            };
            if newer {
                inner.pods.insert(key.clone(), pod.clone());
            }
        }

        inner.last_modified = now_millis();
        self.persist_locked(&inner);
        true
    }

    // ── Persistence ────────────────────────────────────────────────

    fn persist_locked(&self, state: &ClusterState) {
        if let Err(e) = self.write_snapshot(state) {
            error!(error = %e, "failed to persist state; in-memory copy retained");
        }
    }

    fn write_snapshot(&self, state: &ClusterState) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(state)?;

        let tmp_path = self.data_dir.join(STATE_TMP_FILE);
        fs::write(&tmp_path, &data)?;
        set_mode(&tmp_path, SNAPSHOT_MODE)?;

        // Atomic rename: readers never observe a partial snapshot.
        fs::rename(&tmp_path, self.data_dir.join(STATE_FILE))?;
        Ok(())
    }

    fn load(&self) {
        let path = self.data_dir.join(STATE_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no existing state file, starting fresh");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read state file, starting fresh");
                return;
            }
        };

        match serde_json::from_slice::<ClusterState>(&data) {
            Ok(state) => {
                info!(
                    deployments = state.deployments.len(),
                    services = state.services.len(),
                    ingresses = state.ingresses.len(),
                    pods = state.pods.len(),
                    "loaded state snapshot"
                );
                *self.inner.write().expect("state lock") = state;
            }
            Err(e) => {
                // Leave the corrupt file alone: it is the operator's
                // recovery artifact.
                warn!(error = %e, path = %path.display(), "corrupt state file, starting fresh");
            }
        }
    }

    /// Write a timestamped backup copy of the current snapshot.
    pub fn backup(&self) -> StoreResult<PathBuf> {
        let data = {
            let inner = self.inner.read().expect("state lock");
            serde_json::to_vec_pretty(&*inner)?
        };

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = self.data_dir.join(format!("state-backup-{stamp}.json"));
        fs::write(&path, &data)?;
        set_mode(&path, SNAPSHOT_MODE)?;

        info!(path = %path.display(), "state backup created");
        Ok(path)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (store, dir)
    }

    fn test_deployment(namespace: &str, name: &str) -> Deployment {
        Deployment {
            name: name.to_string(),
            namespace: namespace.to_string(),
            replicas: 2,
            template: PodTemplate {
                image: "nginx:1.25".to_string(),
                labels: HashMap::from([("app".to_string(), name.to_string())]),
                ..Default::default()
            },
            selector: HashMap::from([("app".to_string(), name.to_string())]),
            labels: HashMap::new(),
            pods: Vec::new(),
        }
    }

    fn test_service(namespace: &str, name: &str) -> Service {
        Service {
            name: name.to_string(),
            namespace: namespace.to_string(),
            selector: HashMap::from([("app".to_string(), name.to_string())]),
            ports: vec![ServicePort {
                name: None,
                port: 80,
                target_port: None,
                protocol: "TCP".to_string(),
            }],
            labels: HashMap::new(),
        }
    }

    fn test_pod(namespace: &str, name: &str, created_at: u64) -> Pod {
        Pod {
            id: format!("pod-{name}"),
            name: name.to_string(),
            namespace: namespace.to_string(),
            node_name: "node-1".to_string(),
            state: PodState::Running,
            image: "nginx:1.25".to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            ports: Vec::new(),
            env: Vec::new(),
            volume_mounts: Vec::new(),
            node_selector: HashMap::new(),
            created_at,
        }
    }

    // ── CRUD invariants ────────────────────────────────────────────

    #[test]
    fn save_then_get_returns_deployment() {
        let (store, _dir) = test_store();
        let dep = test_deployment("default", "web");

        store.save_deployment(&dep);
        let got = store.get_deployment("default", "web").unwrap();
        assert_eq!(got, dep);
    }

    #[test]
    fn get_missing_returns_not_found() {
        let (store, _dir) = test_store();
        assert!(matches!(
            store.get_deployment("default", "nope"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn delete_then_get_returns_not_found() {
        let (store, _dir) = test_store();
        store.save_service(&test_service("default", "api"));

        store.delete_service("default", "api");
        assert!(store.get_service("default", "api").is_err());
    }

    #[test]
    fn delete_missing_is_idempotent() {
        let (store, _dir) = test_store();
        store.delete_deployment("default", "absent");
        store.delete_service("default", "absent");
        store.delete_ingress("default", "absent");
        store.delete_pod("default", "absent");
    }

    #[test]
    fn same_name_different_namespace_are_distinct() {
        let (store, _dir) = test_store();
        store.save_service(&test_service("ns1", "api"));
        store.save_service(&test_service("ns2", "api"));

        assert_eq!(store.list_services().len(), 2);
        store.delete_service("ns1", "api");
        assert!(store.get_service("ns2", "api").is_ok());
    }

    #[test]
    fn mutation_bumps_last_modified() {
        let (store, _dir) = test_store();
        let before = store.last_modified();
        store.save_deployment(&test_deployment("default", "web"));
        assert!(store.last_modified() >= before);
        assert!(store.last_modified() > 0);
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.save_deployment(&test_deployment("prod", "api"));
            store.save_service(&test_service("prod", "api"));
        }

        let store = Store::open(dir.path()).unwrap();
        assert!(store.get_deployment("prod", "api").is_ok());
        assert!(store.get_service("prod", "api").is_ok());
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let (store, dir) = test_store();
        store.save_deployment(&test_deployment("default", "web"));

        assert!(dir.path().join("state.json").exists());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn stale_tmp_file_is_ignored_on_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.save_deployment(&test_deployment("prod", "api"));
        }
        // Simulate a crash between tmp-write and rename.
        fs::write(dir.path().join("state.json.tmp"), b"{\"partial\":").unwrap();

        let store = Store::open(dir.path()).unwrap();
        assert!(store.get_deployment("prod", "api").is_ok());
    }

    #[test]
    fn corrupt_snapshot_starts_empty_and_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("state.json"), b"not json at all").unwrap();

        let store = Store::open(dir.path()).unwrap();
        assert!(store.list_deployments().is_empty());
        // The corrupt file is the operator's recovery artifact.
        assert_eq!(
            fs::read(dir.path().join("state.json")).unwrap(),
            b"not json at all"
        );
    }

    #[cfg(unix)]
    #[test]
    fn snapshot_mode_is_0640() {
        use std::os::unix::fs::PermissionsExt;
        let (store, dir) = test_store();
        store.save_deployment(&test_deployment("default", "web"));

        let mode = fs::metadata(dir.path().join("state.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn backup_creates_timestamped_copy() {
        let (store, _dir) = test_store();
        store.save_deployment(&test_deployment("default", "web"));

        let path = store.backup().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("state-backup-"));
        assert!(name.ends_with(".json"));

        let data = fs::read(&path).unwrap();
        let state: ClusterState = serde_json::from_slice(&data).unwrap();
        assert_eq!(state.deployments.len(), 1);
    }

    // ── Merge ──────────────────────────────────────────────────────

    #[test]
    fn merge_newer_snapshot_wins() {
        let (store, _dir) = test_store();
        store.save_deployment(&test_deployment("default", "web"));

        let mut incoming = ClusterState::default();
        let mut dep = test_deployment("default", "web");
        dep.replicas = 5;
        incoming
            .deployments
            .insert("default/web".to_string(), dep);
        incoming.last_modified = store.last_modified() + 10_000;

        assert!(store.merge(&incoming));
        assert_eq!(store.get_deployment("default", "web").unwrap().replicas, 5);
    }

    #[test]
    fn merge_older_snapshot_ignored() {
        let (store, _dir) = test_store();
        store.save_deployment(&test_deployment("default", "web"));

        let mut incoming = ClusterState::default();
        let mut dep = test_deployment("default", "web");
        dep.replicas = 9;
        incoming
            .deployments
            .insert("default/web".to_string(), dep);
        incoming.last_modified = 1; // far in the past

        assert!(!store.merge(&incoming));
        assert_eq!(store.get_deployment("default", "web").unwrap().replicas, 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let (store, _dir) = test_store();

        let mut incoming = ClusterState::default();
        incoming
            .deployments
            .insert("default/web".to_string(), test_deployment("default", "web"));
        incoming.last_modified = now_millis() + 10_000;

        assert!(store.merge(&incoming));
        let after_first = store.state();

        // Second merge of the same snapshot is a no-op: the local stamp
        // has moved past the incoming one.
        assert!(!store.merge(&incoming));
        let after_second = store.state();
        assert_eq!(after_first.deployments, after_second.deployments);
    }

    #[test]
    fn merge_keeps_locally_unique_entries() {
        let (store, _dir) = test_store();
        store.save_service(&test_service("default", "local-only"));

        let mut incoming = ClusterState::default();
        incoming
            .services
            .insert("default/remote".to_string(), test_service("default", "remote"));
        incoming.last_modified = store.last_modified() + 10_000;

        assert!(store.merge(&incoming));
        assert!(store.get_service("default", "local-only").is_ok());
        assert!(store.get_service("default", "remote").is_ok());
    }

    #[test]
    fn merge_pods_prefer_newer_created_at() {
        let (store, _dir) = test_store();
        store.save_pod(&test_pod("default", "web-0", 2000));

        let mut incoming = ClusterState::default();
        incoming
            .pods
            .insert("default/web-0".to_string(), test_pod("default", "web-0", 1000));
        incoming
            .pods
            .insert("default/web-1".to_string(), test_pod("default", "web-1", 3000));
        incoming.last_modified = store.last_modified() + 10_000;

        assert!(store.merge(&incoming));
        // Older incoming pod record loses; unknown pod is added.
        assert_eq!(store.get_pod("default", "web-0").unwrap().created_at, 2000);
        assert_eq!(store.get_pod("default", "web-1").unwrap().created_at, 3000);
    }
}
