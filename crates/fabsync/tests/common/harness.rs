//! Test harness for isolated reconciliation cycles.
//!
//! The `TestHarness` struct owns a complete engine instance:
//! - A temporary source tree with the raw drop directory
//! - An in-memory record store and cluster
//! - A `SyncOrchestrator` wired to all three

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use assert_fs::prelude::*;
use assert_fs::TempDir;

use fabsync::config::{Config, RetryConfig};
use fabsync::db::{alert_repo, resource_repo, Database};
use fabsync::gitops::{
    Alert, AlertType, ClusterObject, CycleReport, InMemoryCluster, LocalFileTree, ManagedResource,
    ProgressBroadcaster, ResourceKind, SyncOrchestrator,
};

use super::builders::identity;

pub const FABRIC: &str = "fab-1";

pub struct TestHarness {
    temp_dir: TempDir,
    pub root: PathBuf,
    pub db: Database,
    pub cluster: Arc<InMemoryCluster>,
    pub orchestrator: SyncOrchestrator,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Builds a harness after letting `tweak` adjust the default config.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_path_buf();
        temp_dir
            .child("raw")
            .create_dir_all()
            .expect("Failed to create raw dir");

        let mut config = Config::new(FABRIC, &root.display().to_string());
        config.worker_count = 2;
        config.retry = RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        tweak(&mut config);

        let db = Database::open_in_memory().expect("Failed to open database");
        let cluster = Arc::new(InMemoryCluster::new());
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            Arc::new(LocalFileTree::new(&root)),
            cluster.clone(),
            &config,
            ProgressBroadcaster::default(),
        );

        Self {
            temp_dir,
            root,
            db,
            cluster,
            orchestrator,
        }
    }

    /// Writes a file relative to the source root, creating parents.
    pub fn write(&self, relative: &str, content: &str) {
        self.temp_dir
            .child(relative)
            .write_str(content)
            .expect("Failed to write file");
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.root.join(relative)).expect("Failed to read file")
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.root.join(relative).exists()
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.root.join(relative)).expect("Failed to remove file");
    }

    pub async fn cycle(&self) -> CycleReport {
        self.orchestrator.run_cycle().await.expect("cycle failed")
    }

    pub fn resource(&self, kind: ResourceKind, name: &str) -> Option<ManagedResource> {
        resource_repo::find_by_identity(&self.db, FABRIC, &identity(kind, name))
            .expect("Failed to query resource")
    }

    pub fn vpc(&self, name: &str) -> ManagedResource {
        self.resource(ResourceKind::Vpc, name)
            .unwrap_or_else(|| panic!("no record for VPC {}", name))
    }

    pub fn open_alerts(&self) -> Vec<Alert> {
        alert_repo::list_open(&self.db, FABRIC).expect("Failed to query alerts")
    }

    pub fn open_alerts_of(&self, alert_type: AlertType) -> Vec<Alert> {
        self.open_alerts()
            .into_iter()
            .filter(|a| a.alert_type == alert_type)
            .collect()
    }

    /// Makes the cluster report `object`.
    pub fn apply(&self, object: ClusterObject) {
        self.cluster.insert(object);
    }
}
