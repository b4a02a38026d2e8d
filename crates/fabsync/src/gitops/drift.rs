//! Desired-vs-actual drift detection.
//!
//! Everything here is pure: identical inputs always yield identical reports,
//! independent of the order keys were produced in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use super::alert::Severity;
use super::resource::{DriftDetails, DriftStatus, KeyDiff, SpecDocument};

/// Outcome of comparing a desired and an actual spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    /// Fraction of differing keys, 0.0 to 1.0.
    pub score: f64,
    pub status: DriftStatus,
    pub details: DriftDetails,
}

impl DriftReport {
    pub fn in_sync() -> Self {
        Self {
            score: 0.0,
            status: DriftStatus::InSync,
            details: DriftDetails::default(),
        }
    }

    pub fn has_drift(&self) -> bool {
        self.score > 0.0
    }

    pub fn severity(&self) -> Severity {
        classify(self.score)
    }
}

/// Compares `desired` against `actual`.
///
/// Returns `None` when both sides are absent; that combination has no
/// meaningful drift.
pub fn detect(desired: Option<&SpecDocument>, actual: Option<&SpecDocument>) -> Option<DriftReport> {
    match (desired, actual) {
        (None, None) => None,
        (Some(desired), None) => Some(one_sided(desired, DriftStatus::DesiredOnly, true)),
        (None, Some(actual)) => Some(one_sided(actual, DriftStatus::ActualOnly, false)),
        (Some(desired), Some(actual)) => Some(compare(desired, actual)),
    }
}

fn one_sided(present: &SpecDocument, status: DriftStatus, desired_side: bool) -> DriftReport {
    let differences = present
        .keys()
        .map(|key| {
            let value = present.get(key).cloned().unwrap_or(Value::Null);
            let (desired, actual) = if desired_side {
                (value, Value::Null)
            } else {
                (Value::Null, value)
            };
            KeyDiff {
                key: key.clone(),
                desired,
                actual,
            }
        })
        .collect();

    DriftReport {
        score: 1.0,
        status,
        details: DriftDetails { differences },
    }
}

fn compare(desired: &SpecDocument, actual: &SpecDocument) -> DriftReport {
    let union: BTreeSet<&String> = desired.keys().chain(actual.keys()).collect();
    if union.is_empty() {
        return DriftReport::in_sync();
    }

    let mut differences = Vec::new();
    for key in &union {
        let d = desired.get(key);
        let a = actual.get(key);
        if d != a {
            differences.push(KeyDiff {
                key: (*key).clone(),
                desired: d.cloned().unwrap_or(Value::Null),
                actual: a.cloned().unwrap_or(Value::Null),
            });
        }
    }

    let score = differences.len() as f64 / union.len() as f64;
    let status = if differences.is_empty() {
        DriftStatus::InSync
    } else {
        DriftStatus::SpecDrift
    };

    DriftReport {
        score,
        status,
        details: DriftDetails { differences },
    }
}

/// Maps a drift score onto an alert severity.
///
/// [0.0, 0.1) low, [0.1, 0.5) medium, [0.5, 0.8) high, [0.8, 1.0] critical.
pub fn classify(score: f64) -> Severity {
    if score >= 0.8 {
        Severity::Critical
    } else if score >= 0.5 {
        Severity::High
    } else if score >= 0.1 {
        Severity::Medium
    } else {
        Severity::Low
    }
}
