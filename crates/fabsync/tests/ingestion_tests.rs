//! Raw file ingestion as seen through full cycles.

mod common;

use common::*;
use fabsync::gitops::{AlertType, ResourceKind, ResourceState};

#[tokio::test]
async fn test_raw_file_is_split_and_archived() {
    let h = TestHarness::new();
    h.write(
        "raw/fabric.yaml",
        &multi_doc(&[
            vpc("vpc-1", 10),
            vpc("vpc-2", 20).namespace("tenant-a"),
            DocBuilder::new("Switch", "leaf-1"),
        ]),
    );

    let report = h.cycle().await;
    let ingestion = report.ingestion.expect("ingestion ran");
    assert!(ingestion.success);
    assert_eq!(ingestion.created_resources.len(), 3);

    assert!(!h.exists("raw/fabric.yaml"));
    assert!(h.exists("raw/fabric.yaml.processed"));
    assert!(h.exists("vpcs/vpc-1.yaml"));
    assert!(h.exists("vpcs/vpc-2.yaml"));
    assert!(h.exists("switches/leaf-1.yaml"));

    let record = h.read("vpcs/vpc-2.yaml");
    assert!(record.contains("namespace: tenant-a"));
    assert!(record.contains("fabsync.io/managed-by: fabsync"));
    assert!(record.contains("fabsync.io/source-file: raw/fabric.yaml"));
    assert!(record.contains("fabsync.io/document-index:"));
}

#[tokio::test]
async fn test_invalid_documents_do_not_block_the_file() {
    let h = TestHarness::new();
    h.write(
        "raw/batch.yaml",
        &multi_doc(&[
            vpc("good", 1),
            DocBuilder::unnamed("VPC"),
            DocBuilder::new("Widget", "w-1"),
        ]),
    );

    let report = h.cycle().await;
    let ingestion = report.ingestion.expect("ingestion ran");
    assert_eq!(ingestion.created_resources.len(), 1);
    assert_eq!(ingestion.warnings.len(), 1);
    assert_eq!(ingestion.errors.len(), 1);
    assert!(h.exists("raw/batch.yaml.processed"));

    let invalid = h.open_alerts_of(AlertType::ValidationError);
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].subject, "raw/batch.yaml#1");
    assert_eq!(h.vpc("good").state, ResourceState::Pending);
}

#[tokio::test]
async fn test_undecodable_file_stays_until_fixed() {
    let h = TestHarness::new();
    h.write("raw/broken.yaml", "kind: VPC\nmetadata: [oops\n");

    let report = h.cycle().await;
    assert_eq!(report.ingested, 0);
    assert!(!report.errors.is_empty());
    assert!(h.exists("raw/broken.yaml"));
    let invalid = h.open_alerts_of(AlertType::ValidationError);
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].subject, "raw/broken.yaml");

    // the same failure again does not raise a second alert
    let report = h.cycle().await;
    assert_eq!(report.alerts_created, 0);

    h.write("raw/broken.yaml", &vpc("vpc-1", 10).to_yaml());
    let report = h.cycle().await;
    assert_eq!(report.ingested, 1);
    assert!(h.open_alerts_of(AlertType::ValidationError).is_empty());
    assert!(h.exists("raw/broken.yaml.processed"));
}

#[tokio::test]
async fn test_ingesting_a_known_identity_raises_conflict() {
    let h = TestHarness::new();
    h.write("raw/first.yaml", &vpc("vpc-1", 10).to_yaml());
    h.cycle().await;

    h.write("raw/second.yaml", &vpc("vpc-1", 99).to_yaml());
    let report = h.cycle().await;
    assert_eq!(report.ingested, 0);
    assert!(h.exists("vpcs/vpc-1-1.yaml"));

    let conflicts = h.open_alerts_of(AlertType::ConflictDetected);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].resource_id.as_deref(), Some(h.vpc("vpc-1").id.as_str()));
    // the original declaration stays in force
    assert_eq!(h.vpc("vpc-1").desired_spec, Some(vpc_spec(10)));

    h.remove("vpcs/vpc-1-1.yaml");
    h.cycle().await;
    assert!(h.open_alerts_of(AlertType::ConflictDetected).is_empty());
}

#[tokio::test]
async fn test_archive_name_is_made_unique() {
    let h = TestHarness::new();
    h.write("raw/drop.yaml", &vpc("vpc-1", 1).to_yaml());
    h.cycle().await;
    h.write("raw/drop.yaml", &vpc("vpc-2", 2).to_yaml());
    h.cycle().await;

    assert!(h.exists("raw/drop.yaml.processed"));
    assert!(h.exists("raw/drop.yaml.1.processed"));
    assert!(h.resource(ResourceKind::Vpc, "vpc-2").is_some());
}
