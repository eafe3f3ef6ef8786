use crate::config::FileFormat;
use log::{debug, info, warn};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Top-level field every usable Iceberg metadata seed must carry.
pub const ICEBERG_SNAPSHOT_MARKER: &str = "current-snapshot-id";
/// History fields stripped from Iceberg seeds; they only widen the mutation surface.
const ICEBERG_LOG_FIELDS: [&str; 2] = ["metadata-log", "snapshot-log"];
const ICEBERG_METADATA_EXTENSION: &str = "json";
const ICEBERG_MANIFEST_EXTENSION: &str = "avro";

/// Defines errors that can arise while loading the seed corpus.
///
/// Per-file problems (unreadable, empty, unparseable seeds) are not errors: they are
/// logged and the file is skipped. Only a missing corpus directory or an empty
/// bucket stops the session.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The corpus directory itself could not be opened.
    #[error("Failed to read corpus directory {path:?}: {source}")]
    DirectoryUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A bucket the configured format needs ended up with no usable seeds.
    #[error("No usable {bucket} seeds found in {path:?}")]
    EmptyBucket { bucket: &'static str, path: PathBuf },
}

/// One seed: the full contents of a corpus file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    bytes: Vec<u8>,
    origin: PathBuf,
}

impl CorpusEntry {
    /// Returns `None` for empty buffers, which are never admitted to the corpus.
    pub fn new(bytes: Vec<u8>, origin: impl Into<PathBuf>) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        Some(Self {
            bytes,
            origin: origin.into(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }
}

/// How seeds are bucketed for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusMode {
    /// Every regular file goes into the generic bucket.
    Generic,
    /// `.json` files become metadata seeds (rewritten to point at `bucket`),
    /// `.avro` files become manifest-list seeds, everything else is ignored.
    Iceberg { bucket: String },
}

impl CorpusMode {
    /// Picks the load mode for `format`. Iceberg needs the bucket the seeds are
    /// rewritten to; validation has already checked it is present.
    pub fn for_format(format: FileFormat, bucket: Option<&str>) -> Self {
        match format {
            FileFormat::Iceberg => CorpusMode::Iceberg {
                bucket: bucket.unwrap_or_default().to_string(),
            },
            FileFormat::Csv | FileFormat::Parquet => CorpusMode::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Metadata,
    Manifest,
    Generic,
}

/// Seeds for one session, split into the three buckets.
#[derive(Debug, Default)]
pub struct CorpusSet {
    metadata: Vec<CorpusEntry>,
    manifest: Vec<CorpusEntry>,
    generic: Vec<CorpusEntry>,
}

impl CorpusSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks `dir` recursively and loads every regular file into its bucket.
    pub fn load(dir: &Path, mode: &CorpusMode) -> Result<Self, CorpusError> {
        fs::read_dir(dir).map_err(|e| CorpusError::DirectoryUnreadable {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut set = CorpusSet::new();
        let mut skipped = 0usize;

        for walk_result in WalkDir::new(dir).follow_links(true) {
            let dir_entry = match walk_result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable corpus path: {e}");
                    skipped += 1;
                    continue;
                }
            };
            if !dir_entry.file_type().is_file() {
                continue;
            }
            let path = dir_entry.path();
            let Some(bucket) = classify(path, mode) else {
                debug!("Ignoring {path:?}: extension not used by this format");
                continue;
            };

            let raw = match fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read seed file {path:?}: {e}");
                    skipped += 1;
                    continue;
                }
            };

            let bytes = match (bucket, mode) {
                (Bucket::Metadata, CorpusMode::Iceberg { bucket: storage }) => {
                    match rewrite_iceberg_metadata(&raw, storage) {
                        Some(rewritten) => rewritten,
                        None => {
                            warn!(
                                "Dropping {path:?}: not valid Iceberg metadata or no `{ICEBERG_SNAPSHOT_MARKER}`"
                            );
                            skipped += 1;
                            continue;
                        }
                    }
                }
                _ => raw,
            };

            match CorpusEntry::new(bytes, path) {
                Some(entry) => set.insert(bucket, entry),
                None => {
                    warn!("Dropping empty seed file {path:?}");
                    skipped += 1;
                }
            }
        }

        info!(
            "Loaded corpus from {dir:?}: {} generic, {} metadata, {} manifest seeds ({skipped} skipped)",
            set.generic.len(),
            set.metadata.len(),
            set.manifest.len()
        );
        Ok(set)
    }

    fn insert(&mut self, bucket: Bucket, entry: CorpusEntry) {
        match bucket {
            Bucket::Metadata => self.metadata.push(entry),
            Bucket::Manifest => self.manifest.push(entry),
            Bucket::Generic => self.generic.push(entry),
        }
    }

    pub fn add_generic(&mut self, entry: CorpusEntry) {
        self.insert(Bucket::Generic, entry);
    }

    pub fn add_metadata(&mut self, entry: CorpusEntry) {
        self.insert(Bucket::Metadata, entry);
    }

    pub fn add_manifest(&mut self, entry: CorpusEntry) {
        self.insert(Bucket::Manifest, entry);
    }

    /// Iceberg table metadata seeds, already rewritten for the session bucket.
    pub fn metadata(&self) -> &[CorpusEntry] {
        &self.metadata
    }

    /// Iceberg manifest-list (Avro) seeds.
    pub fn manifest(&self) -> &[CorpusEntry] {
        &self.manifest
    }

    /// CSV and Parquet seeds.
    pub fn generic(&self) -> &[CorpusEntry] {
        &self.generic
    }

    /// Total number of seeds across all buckets.
    pub fn len(&self) -> usize {
        self.metadata.len() + self.manifest.len() + self.generic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails if a bucket the format reads from is empty.
    pub fn ensure_ready(&self, format: FileFormat, dir: &Path) -> Result<(), CorpusError> {
        let empty = |bucket| CorpusError::EmptyBucket {
            bucket,
            path: dir.to_path_buf(),
        };
        match format {
            FileFormat::Csv | FileFormat::Parquet if self.generic.is_empty() => {
                Err(empty(format.as_str()))
            }
            FileFormat::Iceberg if self.metadata.is_empty() => Err(empty("iceberg metadata")),
            FileFormat::Iceberg if self.manifest.is_empty() => Err(empty("iceberg manifest-list")),
            _ => Ok(()),
        }
    }
}

fn classify(path: &Path, mode: &CorpusMode) -> Option<Bucket> {
    match mode {
        CorpusMode::Generic => Some(Bucket::Generic),
        CorpusMode::Iceberg { .. } => match path.extension().and_then(|ext| ext.to_str()) {
            Some(ICEBERG_METADATA_EXTENSION) => Some(Bucket::Metadata),
            Some(ICEBERG_MANIFEST_EXTENSION) => Some(Bucket::Manifest),
            _ => None,
        },
    }
}

/// Object-store path every rewritten snapshot points its manifest list at.
pub fn manifest_list_location(bucket: &str) -> String {
    format!("s3://{bucket}/metadata/manifest_list.avro")
}

/// Rewrites an Iceberg table-metadata seed so the target reads from `bucket`.
///
/// Sets `location`, points every snapshot's `manifest-list` at the fuzzed manifest
/// list, and drops the log-history fields. Returns `None` if the seed does not parse
/// as a JSON object or lacks [`ICEBERG_SNAPSHOT_MARKER`].
pub fn rewrite_iceberg_metadata(raw: &[u8], bucket: &str) -> Option<Vec<u8>> {
    let mut document: JsonValue = serde_json::from_slice(raw).ok()?;
    let fields = document.as_object_mut()?;
    if !fields.contains_key(ICEBERG_SNAPSHOT_MARKER) {
        return None;
    }

    fields.insert(
        "location".to_string(),
        JsonValue::String(format!("s3://{bucket}")),
    );
    for log_field in ICEBERG_LOG_FIELDS {
        fields.remove(log_field);
    }
    if let Some(JsonValue::Array(snapshots)) = fields.get_mut("snapshots") {
        for snapshot in snapshots.iter_mut() {
            if let JsonValue::Object(snapshot) = snapshot {
                snapshot.insert(
                    "manifest-list".to_string(),
                    JsonValue::String(manifest_list_location(bucket)),
                );
            }
        }
    }

    serde_json::to_vec(&document).ok()
}
