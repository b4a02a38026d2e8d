//! K8s-style resource types tracked by the reconciliation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Annotation marking a record as written by the engine.
pub const ANNOTATION_MANAGED_BY: &str = "fabsync.io/managed-by";
/// Annotation carrying the owning fabric id.
pub const ANNOTATION_FABRIC: &str = "fabsync.io/fabric";
/// Annotation carrying the raw file the record was split from.
pub const ANNOTATION_SOURCE_FILE: &str = "fabsync.io/source-file";
/// Annotation carrying the 0-based document index inside the raw file.
pub const ANNOTATION_DOCUMENT_INDEX: &str = "fabsync.io/document-index";
/// Annotation carrying the ingestion timestamp (RFC 3339).
pub const ANNOTATION_INGESTED_AT: &str = "fabsync.io/ingested-at";
/// Value of [`ANNOTATION_MANAGED_BY`].
pub const MANAGER_NAME: &str = "fabsync";

/// The kind of a fabric resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "VPC")]
    Vpc,
    #[serde(rename = "VPCAttachment")]
    VpcAttachment,
    #[serde(rename = "VPCPeering")]
    VpcPeering,
    External,
    ExternalAttachment,
    ExternalPeering,
    #[serde(rename = "IPv4Namespace")]
    Ipv4Namespace,
    #[serde(rename = "VLANNamespace")]
    VlanNamespace,
    Switch,
    SwitchGroup,
    Server,
    Connection,
}

impl ResourceKind {
    /// Returns the destination directory for managed records of this kind.
    pub fn directory(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "vpcs",
            ResourceKind::VpcAttachment => "vpc-attachments",
            ResourceKind::VpcPeering => "vpc-peerings",
            ResourceKind::External => "externals",
            ResourceKind::ExternalAttachment => "external-attachments",
            ResourceKind::ExternalPeering => "external-peerings",
            ResourceKind::Ipv4Namespace => "ipv4-namespaces",
            ResourceKind::VlanNamespace => "vlan-namespaces",
            ResourceKind::Switch => "switches",
            ResourceKind::SwitchGroup => "switch-groups",
            ResourceKind::Server => "servers",
            ResourceKind::Connection => "connections",
        }
    }

    /// API group and version used when the engine writes a record itself.
    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::Vpc
            | ResourceKind::VpcAttachment
            | ResourceKind::VpcPeering
            | ResourceKind::External
            | ResourceKind::ExternalAttachment
            | ResourceKind::ExternalPeering
            | ResourceKind::Ipv4Namespace => "vpc.githedgehog.com/v1beta1",
            ResourceKind::VlanNamespace
            | ResourceKind::Switch
            | ResourceKind::SwitchGroup
            | ResourceKind::Server
            | ResourceKind::Connection => "wiring.githedgehog.com/v1beta1",
        }
    }

    /// Returns all resource kinds.
    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Vpc,
            ResourceKind::VpcAttachment,
            ResourceKind::VpcPeering,
            ResourceKind::External,
            ResourceKind::ExternalAttachment,
            ResourceKind::ExternalPeering,
            ResourceKind::Ipv4Namespace,
            ResourceKind::VlanNamespace,
            ResourceKind::Switch,
            ResourceKind::SwitchGroup,
            ResourceKind::Server,
            ResourceKind::Connection,
        ]
    }

    /// Canonical kind name as it appears in declarative files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "VPC",
            ResourceKind::VpcAttachment => "VPCAttachment",
            ResourceKind::VpcPeering => "VPCPeering",
            ResourceKind::External => "External",
            ResourceKind::ExternalAttachment => "ExternalAttachment",
            ResourceKind::ExternalPeering => "ExternalPeering",
            ResourceKind::Ipv4Namespace => "IPv4Namespace",
            ResourceKind::VlanNamespace => "VLANNamespace",
            ResourceKind::Switch => "Switch",
            ResourceKind::SwitchGroup => "SwitchGroup",
            ResourceKind::Server => "Server",
            ResourceKind::Connection => "Connection",
        }
    }

    /// Returns the kind whose destination directory is `dir`.
    pub fn from_directory(dir: &str) -> Option<ResourceKind> {
        Self::all().iter().copied().find(|k| k.directory() == dir)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        ResourceKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str().to_lowercase() == lower)
            .ok_or_else(|| format!("Unknown resource kind: {}", s))
    }
}

/// An opaque, key-ordered spec document.
///
/// Keys are kept sorted so equality and serialization never depend on the
/// order a source happened to emit them in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecDocument(Map<String, Value>);

impl SpecDocument {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps an existing JSON object. Returns `None` for non-object values.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Inserts a top-level key, returning the document for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the document as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for SpecDocument {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Lifecycle state of a managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Draft,
    Committed,
    Pending,
    Synced,
    Drifted,
    Orphaned,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Draft => "DRAFT",
            ResourceState::Committed => "COMMITTED",
            ResourceState::Pending => "PENDING",
            ResourceState::Synced => "SYNCED",
            ResourceState::Drifted => "DRIFTED",
            ResourceState::Orphaned => "ORPHANED",
        }
    }

    pub fn all() -> &'static [ResourceState] {
        &[
            ResourceState::Draft,
            ResourceState::Committed,
            ResourceState::Pending,
            ResourceState::Synced,
            ResourceState::Drifted,
            ResourceState::Orphaned,
        ]
    }

    /// States in which `desired_spec` must be present.
    pub fn requires_desired(&self) -> bool {
        matches!(
            self,
            ResourceState::Committed
                | ResourceState::Pending
                | ResourceState::Synced
                | ResourceState::Drifted
        )
    }

    /// States in which `actual_spec` must be present.
    pub fn requires_actual(&self) -> bool {
        matches!(
            self,
            ResourceState::Synced | ResourceState::Drifted | ResourceState::Orphaned
        )
    }

    /// States that must always carry an open alert.
    pub fn requires_alert(&self) -> bool {
        matches!(self, ResourceState::Drifted | ResourceState::Orphaned)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceState::all()
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown resource state: {}", s))
    }
}

/// Drift classification stored on a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    #[default]
    InSync,
    SpecDrift,
    DesiredOnly,
    ActualOnly,
    CreationPending,
    DeletionPending,
}

impl DriftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftStatus::InSync => "in_sync",
            DriftStatus::SpecDrift => "spec_drift",
            DriftStatus::DesiredOnly => "desired_only",
            DriftStatus::ActualOnly => "actual_only",
            DriftStatus::CreationPending => "creation_pending",
            DriftStatus::DeletionPending => "deletion_pending",
        }
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_sync" => Ok(DriftStatus::InSync),
            "spec_drift" => Ok(DriftStatus::SpecDrift),
            "desired_only" => Ok(DriftStatus::DesiredOnly),
            "actual_only" => Ok(DriftStatus::ActualOnly),
            "creation_pending" => Ok(DriftStatus::CreationPending),
            "deletion_pending" => Ok(DriftStatus::DeletionPending),
            other => Err(format!("Unknown drift status: {}", other)),
        }
    }
}

/// A single differing key between desired and actual state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDiff {
    pub key: String,
    /// Desired value, `null` when the key is absent on the desired side.
    pub desired: Value,
    /// Actual value, `null` when the key is absent on the actual side.
    pub actual: Value,
}

/// Structured diff between desired and actual state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftDetails {
    pub differences: Vec<KeyDiff>,
}

impl DriftDetails {
    pub fn keys(&self) -> Vec<&str> {
        self.differences.iter().map(|d| d.key.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }
}

/// Identity of a resource within a fabric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A resource record owned by the reconciliation engine.
///
/// Constructed through [`ManagedResource::draft`], [`ManagedResource::ingested`]
/// or [`ManagedResource::discovered`]; every later change goes through
/// [`crate::gitops::lifecycle::transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub id: String,
    pub fabric_id: String,
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub state: ResourceState,
    pub draft_spec: Option<SpecDocument>,
    pub desired_spec: Option<SpecDocument>,
    pub actual_spec: Option<SpecDocument>,
    pub desired_commit: Option<String>,
    pub desired_updated: Option<DateTime<Utc>>,
    pub actual_updated: Option<DateTime<Utc>>,
    pub actual_status: Option<Value>,
    pub drift_score: f64,
    pub drift_details: Option<DriftDetails>,
    pub drift_status: DriftStatus,
    pub last_state_change: DateTime<Utc>,
    pub state_change_reason: Option<String>,
    /// Managed record path, relative to the source tree root.
    pub source_path: Option<String>,
    /// Optimistic concurrency counter.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl ManagedResource {
    fn blank(
        fabric_id: &str,
        identity: &ResourceIdentity,
        state: ResourceState,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fabric_id: fabric_id.to_string(),
            kind: identity.kind,
            namespace: identity.namespace.clone(),
            name: identity.name.clone(),
            state,
            draft_spec: None,
            desired_spec: None,
            actual_spec: None,
            desired_commit: None,
            desired_updated: None,
            actual_updated: None,
            actual_status: None,
            drift_score: 0.0,
            drift_details: None,
            drift_status: DriftStatus::InSync,
            last_state_change: now,
            state_change_reason: Some(reason.to_string()),
            source_path: None,
            version: 0,
            created_at: now,
        }
    }

    /// A new operator draft.
    pub fn draft(
        fabric_id: &str,
        identity: &ResourceIdentity,
        draft: SpecDocument,
        now: DateTime<Utc>,
    ) -> Self {
        let mut resource = Self::blank(fabric_id, identity, ResourceState::Draft, now, "draft created");
        resource.draft_spec = Some(draft);
        resource
    }

    /// A resource created from an ingested document; enters COMMITTED.
    pub fn ingested(
        fabric_id: &str,
        identity: &ResourceIdentity,
        desired: SpecDocument,
        commit: String,
        source_path: String,
        now: DateTime<Utc>,
    ) -> Self {
        let mut resource =
            Self::blank(fabric_id, identity, ResourceState::Committed, now, "ingested from source tree");
        resource.desired_spec = Some(desired);
        resource.desired_commit = Some(commit);
        resource.desired_updated = Some(now);
        resource.drift_score = 1.0;
        resource.drift_status = DriftStatus::DesiredOnly;
        resource.source_path = Some(source_path);
        resource
    }

    /// A resource observed in the cluster without any desired declaration.
    pub fn discovered(
        fabric_id: &str,
        identity: &ResourceIdentity,
        actual: SpecDocument,
        status: Option<Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut resource =
            Self::blank(fabric_id, identity, ResourceState::Orphaned, now, "observed in cluster without desired state");
        resource.actual_spec = Some(actual);
        resource.actual_status = status;
        resource.actual_updated = Some(now);
        resource.drift_score = 1.0;
        resource.drift_status = DriftStatus::ActualOnly;
        resource
    }

    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(self.kind, self.namespace.clone(), self.name.clone())
    }

    /// Checks the per-state field invariants. Returns a description of the
    /// first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.state.requires_desired() && self.desired_spec.is_none() {
            return Err(format!("{} resource {} has no desired spec", self.state, self.identity()));
        }
        if self.state.requires_actual() && self.actual_spec.is_none() {
            return Err(format!("{} resource {} has no actual spec", self.state, self.identity()));
        }
        if self.state == ResourceState::Drifted && self.drift_details.is_none() {
            return Err(format!("DRIFTED resource {} has no drift details", self.identity()));
        }
        if self.state == ResourceState::Draft && self.draft_spec.is_none() {
            return Err(format!("DRAFT resource {} has no draft spec", self.identity()));
        }
        Ok(())
    }
}

/// Metadata section of a declarative record, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A managed record as written to the source tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedRecord {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SpecDocument,
}

impl ManagedRecord {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    pub fn is_managed(&self) -> bool {
        self.annotation(ANNOTATION_MANAGED_BY) == Some(MANAGER_NAME)
    }
}
