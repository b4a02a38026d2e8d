//! Ingestion of raw multi-document YAML files.
//!
//! Raw files are parsed concurrently, then applied one at a time in
//! modification-time order: each valid document becomes a managed record in
//! its kind's directory plus a COMMITTED resource, and the raw file is
//! archived. A file that fails to decode is left untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::alert::{Alert, AlertType, Severity};
use super::alert_manager::AlertManager;
use super::error::{GitOpsError, Result};
use super::resource::{
    ManagedRecord, ManagedResource, ObjectMeta, ResourceIdentity, ResourceKind, SpecDocument,
    ANNOTATION_DOCUMENT_INDEX, ANNOTATION_FABRIC, ANNOTATION_INGESTED_AT, ANNOTATION_MANAGED_BY,
    ANNOTATION_SOURCE_FILE, MANAGER_NAME,
};
use super::source::{self, SourceError, SourceFile, SourceTree};
use crate::config::Config;
use crate::db::{resource_repo, Database};

/// Upper bound on numbered variants tried for a record or archive name.
const MAX_NAME_ATTEMPTS: u32 = 1000;

const MAX_NAME_LENGTH: usize = 253;

static RE_RESOURCE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").unwrap());

/// A managed record written during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WrittenRecord {
    pub identity: ResourceIdentity,
    /// Record path relative to the source root.
    pub path: PathBuf,
    pub spec: SpecDocument,
    /// False when the identity already existed and only a conflict was raised.
    pub created: bool,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionResult {
    pub success: bool,
    pub processed_files: Vec<PathBuf>,
    pub archived_files: Vec<PathBuf>,
    pub created_resources: Vec<ResourceIdentity>,
    pub records: Vec<WrittenRecord>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub alerts_raised: usize,
}

/// A document that passed validation.
#[derive(Debug, Clone, PartialEq)]
struct ValidDocument {
    index: usize,
    identity: ResourceIdentity,
    api_version: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    spec: SpecDocument,
}

#[derive(Debug, Clone, PartialEq)]
enum Document {
    Valid(ValidDocument),
    Unsupported { index: usize, kind: String },
    Invalid { index: usize, message: String },
}

/// Result of parsing one raw file on a worker.
struct ParsedFile {
    position: usize,
    file: SourceFile,
    documents: std::result::Result<Vec<Document>, String>,
}

pub struct IngestionProcessor {
    db: Database,
    source: Arc<dyn SourceTree>,
    alerts: AlertManager,
    fabric_id: String,
    namespace: String,
    archive_suffix: String,
    worker_count: usize,
}

impl IngestionProcessor {
    pub fn new(db: Database, source: Arc<dyn SourceTree>, config: &Config) -> Self {
        Self {
            alerts: AlertManager::new(db.clone(), config.fabric_id.clone()),
            db,
            source,
            fabric_id: config.fabric_id.clone(),
            namespace: config.namespace.clone(),
            archive_suffix: config.archive_suffix.clone(),
            worker_count: config.worker_count.max(1),
        }
    }

    /// Ingests every `.yaml` / `.yml` file under `raw_dir`.
    ///
    /// Only record-store failures abort the run; everything file-local is
    /// collected into the result and raised as an alert.
    pub fn run(&self, raw_dir: &Path, now: DateTime<Utc>) -> Result<IngestionResult> {
        let _span = tracing::info_span!("ingest", raw_dir = %raw_dir.display()).entered();

        let files: Vec<SourceFile> = self
            .source
            .list_files(raw_dir)?
            .into_iter()
            .filter(|f| is_yaml(&f.path))
            .collect();

        let mut result = IngestionResult::default();
        if files.is_empty() {
            result.success = true;
            return Ok(result);
        }

        log::info!("Ingesting {} raw file(s) from {}", files.len(), raw_dir.display());

        let commit = source::commit_id(self.source.as_ref(), now);
        for parsed in self.parse_all(files) {
            self.apply_file(parsed, &commit, now, &mut result)?;
        }

        result.success = result.errors.is_empty();
        log::info!(
            "Ingestion finished: {} file(s), {} archived, {} resource(s) created, {} warning(s), {} error(s)",
            result.processed_files.len(),
            result.archived_files.len(),
            result.created_resources.len(),
            result.warnings.len(),
            result.errors.len()
        );
        Ok(result)
    }

    /// Parses files on a bounded worker set and returns them in their
    /// original (mtime) order.
    fn parse_all(&self, files: Vec<SourceFile>) -> Vec<ParsedFile> {
        let workers = self.worker_count.min(files.len()).max(1);
        let total = files.len();
        let (job_tx, job_rx) = bounded::<(usize, SourceFile)>(workers * 2);
        let (result_tx, result_rx) = unbounded::<ParsedFile>();

        let mut parsed: Vec<ParsedFile> = std::thread::scope(|scope| {
            for worker_id in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let source = Arc::clone(&self.source);
                let namespace = self.namespace.as_str();
                scope.spawn(move || run_parser(worker_id, job_rx, result_tx, source, namespace));
            }
            drop(job_rx);
            drop(result_tx);

            for job in files.into_iter().enumerate() {
                if job_tx.send(job).is_err() {
                    log::error!("Parser workers exited early");
                    break;
                }
            }
            drop(job_tx);

            result_rx.iter().collect()
        });

        if parsed.len() != total {
            log::warn!("Parsed {} of {} raw file(s)", parsed.len(), total);
        }
        parsed.sort_by_key(|p| p.position);
        parsed
    }

    fn apply_file(
        &self,
        parsed: ParsedFile,
        commit: &str,
        now: DateTime<Utc>,
        result: &mut IngestionResult,
    ) -> Result<()> {
        let path = parsed.file.path;
        let path_str = path.display().to_string();
        result.processed_files.push(path.clone());

        let documents = match parsed.documents {
            Ok(documents) => documents,
            Err(message) => {
                log::warn!("Leaving {} in place: {}", path_str, message);
                result.errors.push(format!("{}: {}", path_str, message));
                self.raise(
                    Alert::new(
                        &self.fabric_id,
                        AlertType::ValidationError,
                        Severity::High,
                        path_str.clone(),
                        format!("Cannot decode {}: {}", path_str, message),
                        now,
                    )
                    .with_details(json!({ "file": path_str })),
                    result,
                )?;
                return Ok(());
            }
        };

        // The file decodes now; a parse alert from an earlier attempt is stale.
        self.alerts
            .clear(AlertType::ValidationError, None, &path_str, now)?;

        for document in documents {
            match document {
                Document::Unsupported { index, kind } => {
                    let warning = format!("{}#{}: unsupported kind '{}' skipped", path_str, index, kind);
                    log::warn!("{}", warning);
                    result.warnings.push(warning);
                }
                Document::Invalid { index, message } => {
                    self.reject_document(&path_str, index, &message, now, result)?;
                }
                Document::Valid(doc) => {
                    self.apply_document(&path_str, doc, commit, now, result)?;
                }
            }
        }

        match self.archive(&path) {
            Ok(archived) => {
                log::debug!("Archived {} as {}", path_str, archived.display());
                result.archived_files.push(archived);
            }
            Err(e) => {
                log::error!("Failed to archive {}: {}", path_str, e);
                result.errors.push(format!("{}: archive failed: {}", path_str, e));
            }
        }
        Ok(())
    }

    fn reject_document(
        &self,
        path: &str,
        index: usize,
        message: &str,
        now: DateTime<Utc>,
        result: &mut IngestionResult,
    ) -> Result<()> {
        let subject = format!("{}#{}", path, index);
        log::warn!("Invalid document {}: {}", subject, message);
        result.errors.push(format!("{}: {}", subject, message));
        self.raise(
            Alert::new(
                &self.fabric_id,
                AlertType::ValidationError,
                Severity::High,
                subject.clone(),
                format!("Invalid document {}: {}", subject, message),
                now,
            )
            .with_details(json!({ "file": path, "documentIndex": index })),
            result,
        )
    }

    fn apply_document(
        &self,
        path: &str,
        doc: ValidDocument,
        commit: &str,
        now: DateTime<Utc>,
        result: &mut IngestionResult,
    ) -> Result<()> {
        let index = doc.index;
        let identity = doc.identity.clone();
        let spec = doc.spec.clone();
        let record = build_record(doc, &self.fabric_id, path, now);

        let bytes = match render_record(&record) {
            Ok(bytes) => bytes,
            Err(e) => return self.reject_document(path, index, &e.to_string(), now, result),
        };
        let written = match create_record(self.source.as_ref(), identity.kind, &identity.name, &bytes) {
            Ok(written) => written,
            Err(e) => return self.reject_document(path, index, &e.to_string(), now, result),
        };

        let existing = resource_repo::find_by_identity(&self.db, &self.fabric_id, &identity)?;
        if let Some(existing) = existing {
            log::warn!(
                "{} from {}#{} conflicts with the existing record {}",
                identity,
                path,
                index,
                existing.source_path.as_deref().unwrap_or("(none)")
            );
            self.raise(
                Alert::for_resource(
                    &existing,
                    AlertType::ConflictDetected,
                    Severity::Critical,
                    format!("{} is declared more than once", identity),
                    now,
                )
                .with_details(json!({
                    "file": path,
                    "documentIndex": index,
                    "record": written.display().to_string(),
                    "existingRecord": existing.source_path,
                })),
                result,
            )?;
            result.records.push(WrittenRecord {
                identity,
                path: written,
                spec,
                created: false,
            });
            return Ok(());
        }

        let resource = ManagedResource::ingested(
            &self.fabric_id,
            &identity,
            spec.clone(),
            commit.to_string(),
            written.display().to_string(),
            now,
        );
        if let Err(e) = resource_repo::insert(&self.db, &resource, "ingested") {
            if let Err(remove_err) = self.source.remove(&written) {
                log::error!("Failed to remove {} after insert failure: {}", written.display(), remove_err);
            }
            return Err(e.into());
        }

        log::info!("Ingested {} into {}", identity, written.display());
        result.created_resources.push(identity.clone());
        result.records.push(WrittenRecord {
            identity,
            path: written,
            spec,
            created: true,
        });
        Ok(())
    }

    fn raise(&self, alert: Alert, result: &mut IngestionResult) -> Result<()> {
        if self.alerts.raise(alert)?.is_created() {
            result.alerts_raised += 1;
        }
        Ok(())
    }

    /// Renames `path` to `<name><suffix>`, or `<name>.<n><suffix>` when taken.
    fn archive(&self, path: &Path) -> std::result::Result<PathBuf, SourceError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        for counter in 0..=MAX_NAME_ATTEMPTS {
            let target_name = if counter == 0 {
                format!("{}{}", file_name, self.archive_suffix)
            } else {
                format!("{}.{}{}", file_name, counter, self.archive_suffix)
            };
            let target = path.with_file_name(target_name);
            match self.source.rename(path, &target) {
                Ok(()) => return Ok(target),
                Err(SourceError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SourceError::AlreadyExists(path.to_path_buf()))
    }
}

fn run_parser(
    worker_id: usize,
    jobs: Receiver<(usize, SourceFile)>,
    results: Sender<ParsedFile>,
    source: Arc<dyn SourceTree>,
    namespace: &str,
) {
    log::debug!("Parser {} started", worker_id);
    for (position, file) in jobs.iter() {
        let documents = source
            .read(&file.path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| parse_file(&bytes, namespace));
        if results
            .send(ParsedFile {
                position,
                file,
                documents,
            })
            .is_err()
        {
            log::error!("Parser {} could not hand back its result", worker_id);
            break;
        }
    }
    log::debug!("Parser {} stopped", worker_id);
}

pub(crate) fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

/// Decodes a raw file into validated documents.
///
/// Any decode failure (non-UTF-8 input or a YAML error in any document)
/// rejects the whole file.
fn parse_file(bytes: &[u8], namespace: &str) -> std::result::Result<Vec<Document>, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("not valid UTF-8: {}", e))?;

    let mut values = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| format!("document {}: {}", index, e))?;
        if !value.is_null() {
            values.push((index, value));
        }
    }

    Ok(values
        .into_iter()
        .map(|(index, value)| validate_document(index, &value, namespace))
        .collect())
}

fn validate_document(index: usize, value: &serde_yaml::Value, namespace: &str) -> Document {
    let invalid = |message: String| Document::Invalid { index, message };

    if !value.is_mapping() {
        return invalid("document is not a mapping".to_string());
    }

    let kind = match value.get("kind").and_then(|k| k.as_str()).map(str::trim) {
        Some(kind) if !kind.is_empty() => kind,
        _ => return invalid("missing kind".to_string()),
    };
    let Ok(kind_enum) = kind.parse::<ResourceKind>() else {
        return Document::Unsupported {
            index,
            kind: kind.to_string(),
        };
    };

    let metadata = value.get("metadata");
    let name = match metadata.and_then(|m| m.get("name")).and_then(|n| n.as_str()) {
        Some(name) if !name.trim().is_empty() => name.trim(),
        _ => return invalid("missing metadata.name".to_string()),
    };
    if name.len() > MAX_NAME_LENGTH || !RE_RESOURCE_NAME.is_match(name) {
        return invalid(format!("invalid resource name '{}'", name));
    }

    let resource_namespace = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(|n| n.as_str())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(namespace);

    let spec = match value.get("spec") {
        None | Some(serde_yaml::Value::Null) => SpecDocument::new(),
        Some(serde_yaml::Value::Mapping(map)) => {
            if let Some(key) = map.keys().find(|k| !k.is_string()) {
                return invalid(format!("spec has a non-string key: {:?}", key));
            }
            match serde_json::to_value(map).map(SpecDocument::from_value) {
                Ok(Some(spec)) => spec,
                Ok(None) => return invalid("spec is not a mapping".to_string()),
                Err(e) => return invalid(format!("spec cannot be represented: {}", e)),
            }
        }
        Some(_) => return invalid("spec is not a mapping".to_string()),
    };

    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .unwrap_or(kind_enum.api_version())
        .to_string();

    Document::Valid(ValidDocument {
        index,
        identity: ResourceIdentity::new(kind_enum, resource_namespace, name),
        api_version,
        labels: string_map(metadata.and_then(|m| m.get("labels"))),
        annotations: string_map(metadata.and_then(|m| m.get("annotations"))),
        spec,
    })
}

fn string_map(value: Option<&serde_yaml::Value>) -> BTreeMap<String, String> {
    let Some(serde_yaml::Value::Mapping(map)) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
        .collect()
}

fn build_record(doc: ValidDocument, fabric_id: &str, raw_path: &str, now: DateTime<Utc>) -> ManagedRecord {
    let mut annotations = doc.annotations;
    annotations.insert(ANNOTATION_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    annotations.insert(ANNOTATION_FABRIC.to_string(), fabric_id.to_string());
    annotations.insert(ANNOTATION_SOURCE_FILE.to_string(), raw_path.to_string());
    annotations.insert(ANNOTATION_DOCUMENT_INDEX.to_string(), doc.index.to_string());
    annotations.insert(ANNOTATION_INGESTED_AT.to_string(), now.to_rfc3339());

    ManagedRecord {
        api_version: doc.api_version,
        kind: doc.identity.kind.as_str().to_string(),
        metadata: ObjectMeta {
            name: doc.identity.name,
            namespace: Some(doc.identity.namespace),
            labels: doc.labels,
            annotations,
        },
        spec: doc.spec,
    }
}

/// A managed record for a resource the engine writes itself (imports and
/// write-backs).
pub(crate) fn record_for(
    identity: &ResourceIdentity,
    fabric_id: &str,
    spec: SpecDocument,
    now: DateTime<Utc>,
) -> ManagedRecord {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    annotations.insert(ANNOTATION_FABRIC.to_string(), fabric_id.to_string());
    annotations.insert(ANNOTATION_INGESTED_AT.to_string(), now.to_rfc3339());

    ManagedRecord {
        api_version: identity.kind.api_version().to_string(),
        kind: identity.kind.as_str().to_string(),
        metadata: ObjectMeta {
            name: identity.name.clone(),
            namespace: Some(identity.namespace.clone()),
            labels: BTreeMap::new(),
            annotations,
        },
        spec,
    }
}

pub(crate) fn render_record(record: &ManagedRecord) -> Result<Vec<u8>> {
    serde_yaml::to_string(record)
        .map(String::into_bytes)
        .map_err(GitOpsError::from)
}

/// Creates `<kind dir>/<name>.yaml`, falling back to `<name>-1.yaml`,
/// `<name>-2.yaml`, ... Never overwrites.
pub(crate) fn create_record(
    source: &dyn SourceTree,
    kind: ResourceKind,
    name: &str,
    bytes: &[u8],
) -> std::result::Result<PathBuf, SourceError> {
    let dir = Path::new(kind.directory());
    for counter in 0..=MAX_NAME_ATTEMPTS {
        let file_name = if counter == 0 {
            format!("{}.yaml", name)
        } else {
            format!("{}-{}.yaml", name, counter)
        };
        let path = dir.join(file_name);
        match source.create(&path, bytes) {
            Ok(()) => return Ok(path),
            Err(SourceError::AlreadyExists(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(SourceError::AlreadyExists(dir.join(format!("{}.yaml", name))))
}
