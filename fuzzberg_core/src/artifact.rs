use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while writing mutation files.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to create mutation directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to open mutation file {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Failed to write mutation file {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Which file a mutation lands in; fixes both the file name and the crash extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Csv,
    Parquet,
    IcebergMetadata,
    IcebergManifest,
}

impl ArtifactKind {
    /// Name of the per-round mutation file the queries read.
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Csv => "fuzz.csv",
            ArtifactKind::Parquet => "fuzz.parquet",
            ArtifactKind::IcebergMetadata => "v3.metadata.json",
            ArtifactKind::IcebergManifest => "manifest_list.avro",
        }
    }

    /// Extension used for saved crash files.
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Csv => "csv",
            ArtifactKind::Parquet => "parquet",
            ArtifactKind::IcebergMetadata => "json",
            ArtifactKind::IcebergManifest => "avro",
        }
    }
}

/// A mutation file the target reads. Truncated and rewritten every round.
#[derive(Debug)]
pub struct MutationFile {
    path: PathBuf,
    file: File,
}

impl MutationFile {
    /// Creates (or truncates) the mutation file for `kind` inside `dir`.
    ///
    /// # Arguments
    /// * `dir`: The mutation directory. Created if it does not exist.
    /// * `kind`: Decides the file name, see [`ArtifactKind::file_name`].
    ///
    /// # Returns
    /// The open file, or an `ArtifactError` naming the path that failed.
    pub fn create(dir: &Path, kind: ArtifactKind) -> Result<Self, ArtifactError> {
        fs::create_dir_all(dir).map_err(|source| ArtifactError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(kind.file_name());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| ArtifactError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the file contents with `data`.
    pub fn write_round(&mut self, data: &[u8]) -> Result<(), ArtifactError> {
        self.replace(data).map_err(|source| ArtifactError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn replace(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(data)?;
        self.file.flush()
    }

    /// Flushes to disk so the file survives a crash of the whole host.
    pub fn sync(&mut self) -> Result<(), ArtifactError> {
        self.file.sync_all().map_err(|source| ArtifactError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Where a crash artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashDestination {
    CrashDir(PathBuf),
    TempFile(PathBuf),
    Stdout,
}

impl std::fmt::Display for CrashDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrashDestination::CrashDir(path) | CrashDestination::TempFile(path) => {
                write!(f, "{}", path.display())
            }
            CrashDestination::Stdout => write!(f, "<stdout>"),
        }
    }
}

/// `crash-<md5 of data>.<ext>`, so identical crashes map to one file.
pub fn crash_file_name(data: &[u8], kind: ArtifactKind) -> String {
    format!("crash-{:x}.{}", md5::compute(data), kind.extension())
}

/// Fallback location used when the crash directory is not writable.
pub fn temp_crash_path(kind: ArtifactKind) -> PathBuf {
    std::env::temp_dir().join(format!("fuzzberg-crash.{}", kind.extension()))
}

/// Persists a crash artifact, degrading to a temp file and then to stdout.
pub fn write_crash(data: &[u8], crash_dir: &Path, kind: ArtifactKind) -> CrashDestination {
    write_crash_with_fallback(data, crash_dir, &temp_crash_path(kind), kind)
}

pub(crate) fn write_crash_with_fallback(
    data: &[u8],
    crash_dir: &Path,
    fallback: &Path,
    kind: ArtifactKind,
) -> CrashDestination {
    let primary = crash_dir.join(crash_file_name(data, kind));
    match fs::create_dir_all(crash_dir).and_then(|_| fs::write(&primary, data)) {
        Ok(()) => {
            info!("Crash artifact written to {}", primary.display());
            return CrashDestination::CrashDir(primary);
        }
        Err(e) => warn!("Failed to write crash artifact to {}: {e}", primary.display()),
    }

    match fs::write(fallback, data) {
        Ok(()) => {
            info!("Crash artifact written to {}", fallback.display());
            return CrashDestination::TempFile(fallback.to_path_buf());
        }
        Err(e) => warn!("Failed to write crash artifact to {}: {e}", fallback.display()),
    }

    warn!("Dumping crash artifact ({} bytes) to stdout", data.len());
    let mut stdout = io::stdout().lock();
    if let Err(e) = stdout.write_all(data).and_then(|_| stdout.flush()) {
        warn!("Failed to dump crash artifact to stdout: {e}");
    }
    CrashDestination::Stdout
}
