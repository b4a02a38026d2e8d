//! Index of the desired state declared in the managed kind directories.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::ingest::{self, WrittenRecord};
use super::resource::{ManagedRecord, ResourceIdentity, ResourceKind, SpecDocument};
use super::source::{SourceError, SourceTree};

/// One managed record found in the source tree.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub identity: ResourceIdentity,
    pub path: PathBuf,
    pub spec: SpecDocument,
}

/// A record file that could not be read as a managed record.
#[derive(Debug, Clone, PartialEq)]
pub struct UnreadableRecord {
    pub path: PathBuf,
    pub message: String,
}

/// What the source tree declares for one identity.
#[derive(Debug, PartialEq)]
pub enum Declared<'a> {
    Missing,
    Unique(&'a IndexEntry),
    /// Two or more records claim the identity.
    Conflict(Vec<&'a Path>),
}

#[derive(Debug, Default)]
pub struct DesiredIndex {
    entries: BTreeMap<ResourceIdentity, Vec<IndexEntry>>,
    unreadable: Vec<UnreadableRecord>,
}

impl DesiredIndex {
    /// Reads every YAML record under the managed kind directories. Records
    /// without a namespace land in `default_namespace`.
    pub fn build(source: &dyn SourceTree, default_namespace: &str) -> Result<Self, SourceError> {
        let _span = tracing::info_span!("index").entered();
        let mut index = Self::default();

        for &kind in ResourceKind::all() {
            for file in source.list_files(Path::new(kind.directory()))? {
                if !ingest::is_yaml(&file.path) {
                    continue;
                }
                let bytes = match source.read(&file.path) {
                    Ok(bytes) => bytes,
                    // Removed between listing and reading.
                    Err(SourceError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                match parse_record(kind, &bytes, default_namespace) {
                    Ok((identity, spec)) => index.insert(IndexEntry {
                        identity,
                        path: file.path,
                        spec,
                    }),
                    Err(message) => {
                        log::warn!("Skipping record {}: {}", file.path.display(), message);
                        index.unreadable.push(UnreadableRecord {
                            path: file.path,
                            message,
                        });
                    }
                }
            }
        }

        log::debug!(
            "Indexed {} identities ({} unreadable record(s))",
            index.entries.len(),
            index.unreadable.len()
        );
        Ok(index)
    }

    /// Adds records written during this cycle's ingestion run.
    pub fn merge_written(&mut self, records: &[WrittenRecord]) {
        for record in records {
            self.insert(IndexEntry {
                identity: record.identity.clone(),
                path: record.path.clone(),
                spec: record.spec.clone(),
            });
        }
    }

    fn insert(&mut self, entry: IndexEntry) {
        let entries = self.entries.entry(entry.identity.clone()).or_default();
        if !entries.iter().any(|e| e.path == entry.path) {
            entries.push(entry);
            entries.sort_by(|a, b| a.path.cmp(&b.path));
        }
    }

    pub fn lookup(&self, identity: &ResourceIdentity) -> Declared<'_> {
        match self.entries.get(identity).map(Vec::as_slice) {
            None | Some([]) => Declared::Missing,
            Some([entry]) => Declared::Unique(entry),
            Some(entries) => Declared::Conflict(entries.iter().map(|e| e.path.as_path()).collect()),
        }
    }

    pub fn identities(&self) -> impl Iterator<Item = &ResourceIdentity> {
        self.entries.keys()
    }

    pub fn namespaces(&self) -> BTreeSet<String> {
        self.entries.keys().map(|i| i.namespace.clone()).collect()
    }

    pub fn unreadable(&self) -> &[UnreadableRecord] {
        &self.unreadable
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_record(
    dir_kind: ResourceKind,
    bytes: &[u8],
    default_namespace: &str,
) -> Result<(ResourceIdentity, SpecDocument), String> {
    let record: ManagedRecord = serde_yaml::from_slice(bytes).map_err(|e| e.to_string())?;

    let kind: ResourceKind = record.kind.parse()?;
    if kind != dir_kind {
        return Err(format!(
            "kind {} does not belong in {}/",
            record.kind,
            dir_kind.directory()
        ));
    }
    if record.metadata.name.trim().is_empty() {
        return Err("metadata.name is empty".to_string());
    }

    let namespace = record
        .metadata
        .namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| default_namespace.to_string());
    Ok((
        ResourceIdentity::new(kind, namespace, record.metadata.name),
        record.spec,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::source::LocalFileTree;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> (TempDir, LocalFileTree) {
        let dir = TempDir::new().unwrap();
        let tree = LocalFileTree::new(dir.path());
        (dir, tree)
    }

    fn write(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn vpc(name: &str) -> ResourceIdentity {
        ResourceIdentity::new(ResourceKind::Vpc, "default", name)
    }

    #[test]
    fn test_indexes_records_by_identity() {
        let (dir, tree) = tree();
        write(&dir, "vpcs/vpc-1.yaml", "kind: VPC\nmetadata:\n  name: vpc-1\nspec:\n  vlan: 10\n");
        write(
            &dir,
            "switches/leaf-1.yml",
            "kind: Switch\nmetadata:\n  name: leaf-1\n  namespace: fab\n",
        );
        write(&dir, "vpcs/notes.txt", "not a record");

        let index = DesiredIndex::build(&tree, "default").unwrap();
        assert_eq!(index.len(), 2);
        match index.lookup(&vpc("vpc-1")) {
            Declared::Unique(entry) => {
                assert_eq!(entry.path, PathBuf::from("vpcs/vpc-1.yaml"));
                assert_eq!(entry.spec, SpecDocument::new().with("vlan", 10));
            }
            other => panic!("unexpected lookup result: {:?}", other),
        }
        let leaf = ResourceIdentity::new(ResourceKind::Switch, "fab", "leaf-1");
        assert!(matches!(index.lookup(&leaf), Declared::Unique(e) if e.spec.is_empty()));
        assert_eq!(index.lookup(&vpc("absent")), Declared::Missing);
        assert_eq!(
            index.namespaces(),
            BTreeSet::from(["default".to_string(), "fab".to_string()])
        );
    }

    #[test]
    fn test_two_records_for_one_identity_conflict() {
        let (dir, tree) = tree();
        write(&dir, "vpcs/a.yaml", "kind: VPC\nmetadata:\n  name: same\n");
        write(&dir, "vpcs/b.yaml", "kind: VPC\nmetadata:\n  name: same\n");

        let index = DesiredIndex::build(&tree, "default").unwrap();
        assert_eq!(
            index.lookup(&vpc("same")),
            Declared::Conflict(vec![Path::new("vpcs/a.yaml"), Path::new("vpcs/b.yaml")])
        );
    }

    #[test]
    fn test_unreadable_and_misplaced_records_are_reported() {
        let (dir, tree) = tree();
        write(&dir, "vpcs/broken.yaml", "kind: VPC\nmetadata: [oops\n");
        write(&dir, "vpcs/switch.yaml", "kind: Switch\nmetadata:\n  name: leaf-1\n");

        let index = DesiredIndex::build(&tree, "default").unwrap();
        assert!(index.is_empty());
        let paths: Vec<&Path> = index.unreadable().iter().map(|u| u.path.as_path()).collect();
        assert_eq!(paths, vec![Path::new("vpcs/broken.yaml"), Path::new("vpcs/switch.yaml")]);
        assert!(index.unreadable()[1].message.contains("does not belong"));
    }

    #[test]
    fn test_merge_written_skips_known_paths() {
        let (dir, tree) = tree();
        write(&dir, "vpcs/vpc-1.yaml", "kind: VPC\nmetadata:\n  name: vpc-1\n");
        let mut index = DesiredIndex::build(&tree, "default").unwrap();

        index.merge_written(&[
            WrittenRecord {
                identity: vpc("vpc-1"),
                path: PathBuf::from("vpcs/vpc-1.yaml"),
                spec: SpecDocument::new(),
                created: true,
            },
            WrittenRecord {
                identity: vpc("vpc-2"),
                path: PathBuf::from("vpcs/vpc-2.yaml"),
                spec: SpecDocument::new(),
                created: true,
            },
        ]);
        assert!(matches!(index.lookup(&vpc("vpc-1")), Declared::Unique(_)));
        assert!(matches!(index.lookup(&vpc("vpc-2")), Declared::Unique(_)));
        assert_eq!(index.identities().count(), 2);
    }
}
