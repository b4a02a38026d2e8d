//! Fabric aggregate: connection and sync status plus cached counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alert::{Alert, AlertStatus, AlertType, Severity};
use super::resource::{ManagedResource, ResourceState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Testing,
    Connected,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Unknown => "UNKNOWN",
            ConnectionStatus::Testing => "TESTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(ConnectionStatus::Unknown),
            "TESTING" => Ok(ConnectionStatus::Testing),
            "CONNECTED" => Ok(ConnectionStatus::Connected),
            "FAILED" => Ok(ConnectionStatus::Failed),
            other => Err(format!("Unknown connection status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    NeverSynced,
    Syncing,
    InSync,
    OutOfSync,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NeverSynced => "NEVER_SYNCED",
            SyncStatus::Syncing => "SYNCING",
            SyncStatus::InSync => "IN_SYNC",
            SyncStatus::OutOfSync => "OUT_OF_SYNC",
            SyncStatus::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEVER_SYNCED" => Ok(SyncStatus::NeverSynced),
            "SYNCING" => Ok(SyncStatus::Syncing),
            "IN_SYNC" => Ok(SyncStatus::InSync),
            "OUT_OF_SYNC" => Ok(SyncStatus::OutOfSync),
            "ERROR" => Ok(SyncStatus::Error),
            other => Err(format!("Unknown sync status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricCounts {
    pub total: u32,
    pub draft: u32,
    pub committed: u32,
    pub pending: u32,
    pub synced: u32,
    pub drifted: u32,
    pub orphaned: u32,
    pub open_alerts: u32,
    pub critical_alerts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fabric {
    pub id: String,
    pub name: String,
    pub connection_status: ConnectionStatus,
    pub sync_status: SyncStatus,
    pub counts: FabricCounts,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Fabric {
    pub fn new(id: &str, name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            connection_status: ConnectionStatus::Unknown,
            sync_status: SyncStatus::NeverSynced,
            counts: FabricCounts::default(),
            last_sync_at: None,
            last_error: None,
            updated_at: now,
        }
    }
}

/// Counts resources and open alerts.
pub fn count(resources: &[ManagedResource], alerts: &[Alert]) -> FabricCounts {
    let mut counts = FabricCounts::default();
    for resource in resources {
        counts.total += 1;
        match resource.state {
            ResourceState::Draft => counts.draft += 1,
            ResourceState::Committed => counts.committed += 1,
            ResourceState::Pending => counts.pending += 1,
            ResourceState::Synced => counts.synced += 1,
            ResourceState::Drifted => counts.drifted += 1,
            ResourceState::Orphaned => counts.orphaned += 1,
        }
    }
    for alert in alerts.iter().filter(|a| a.is_open()) {
        counts.open_alerts += 1;
        if alert.severity == Severity::Critical {
            counts.critical_alerts += 1;
        }
    }
    counts
}

/// Derives the sync status from resources and alerts.
///
/// Only open alerts count; resolved history never pins a fabric in ERROR.
pub fn sync_status(resources: &[ManagedResource], alerts: &[Alert]) -> SyncStatus {
    let failing = alerts.iter().filter(|a| a.is_open()).any(|a| {
        a.severity == Severity::Critical
            || (a.alert_type == AlertType::SyncFailure && a.status == AlertStatus::Active)
    });
    if failing {
        return SyncStatus::Error;
    }

    let out_of_sync = resources
        .iter()
        .any(|r| matches!(r.state, ResourceState::Drifted | ResourceState::Orphaned));
    if out_of_sync {
        SyncStatus::OutOfSync
    } else {
        SyncStatus::InSync
    }
}

/// Recomputes a fabric after a cycle.
pub fn recompute(
    fabric: &Fabric,
    resources: &[ManagedResource],
    alerts: &[Alert],
    now: DateTime<Utc>,
) -> Fabric {
    Fabric {
        counts: count(resources, alerts),
        sync_status: sync_status(resources, alerts),
        last_sync_at: Some(now),
        updated_at: now,
        ..fabric.clone()
    }
}
