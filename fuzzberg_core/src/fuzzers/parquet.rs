use super::{FuzzContext, FuzzError, FuzzOutcome};
use crate::artifact::{ArtifactKind, MutationFile};
use crate::corpus::CorpusSet;
use crate::scheduler::RandomScheduler;
use log::{debug, warn};
use std::fmt;
use std::path::Path;

/// Magic bytes at both ends of a Parquet file.
pub const PARQUET_MAGIC: &[u8; 4] = b"PAR1";
/// Leading magic, trailing length field and trailing magic.
const FRAMING_OVERHEAD: usize = 12;
/// Length field plus trailing magic.
const FOOTER_LEN: usize = 8;

/// Why a seed cannot be split into Parquet framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingReject {
    TooSmall(usize),
    ZeroMetadata,
    MetadataExceedsFile { metadata_len: usize, file_len: usize },
    MetadataExceedsBuffer { metadata_len: usize, capacity: usize },
    NoPageData,
}

impl fmt::Display for FramingReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingReject::TooSmall(len) => write!(f, "{len} bytes is too small for Parquet"),
            FramingReject::ZeroMetadata => write!(f, "footer declares empty file metadata"),
            FramingReject::MetadataExceedsFile {
                metadata_len,
                file_len,
            } => write!(f, "metadata length {metadata_len} does not fit in {file_len} bytes"),
            FramingReject::MetadataExceedsBuffer {
                metadata_len,
                capacity,
            } => write!(
                f,
                "metadata length {metadata_len} does not fit the {capacity}-byte buffer"
            ),
            FramingReject::NoPageData => write!(f, "no page data between magic and metadata"),
        }
    }
}

/// A seed split into `PAR1 | pages | metadata | len | PAR1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParquetFraming<'s> {
    pub pages: &'s [u8],
    pub metadata: &'s [u8],
    pub length_field: [u8; 4],
}

impl<'s> ParquetFraming<'s> {
    /// Splits `bytes`, rejecting seeds whose footer cannot be trusted or whose
    /// metadata would not leave room in a buffer of `capacity` bytes.
    pub fn locate(bytes: &'s [u8], capacity: usize) -> Result<Self, FramingReject> {
        let size = bytes.len();
        if size < FRAMING_OVERHEAD {
            return Err(FramingReject::TooSmall(size));
        }
        let mut length_field = [0u8; 4];
        length_field.copy_from_slice(&bytes[size - FOOTER_LEN..size - 4]);
        let metadata_len = u32::from_le_bytes(length_field) as usize;

        if metadata_len == 0 {
            return Err(FramingReject::ZeroMetadata);
        }
        if metadata_len > size - FRAMING_OVERHEAD {
            return Err(FramingReject::MetadataExceedsFile {
                metadata_len,
                file_len: size,
            });
        }
        if metadata_len > capacity.saturating_sub(FRAMING_OVERHEAD) {
            return Err(FramingReject::MetadataExceedsBuffer {
                metadata_len,
                capacity,
            });
        }

        let metadata_start = size - FOOTER_LEN - metadata_len;
        let pages = &bytes[4..metadata_start];
        if pages.is_empty() {
            return Err(FramingReject::NoPageData);
        }
        Ok(Self {
            pages,
            metadata: &bytes[metadata_start..size - FOOTER_LEN],
            length_field,
        })
    }

    /// Writes the framing around `pages_len` mutated page bytes already at `out[4..]`.
    /// Returns the total file length.
    fn assemble(&self, out: &mut [u8], pages_len: usize) -> usize {
        out[..4].copy_from_slice(PARQUET_MAGIC);
        let mut at = 4 + pages_len;
        out[at..at + self.metadata.len()].copy_from_slice(self.metadata);
        at += self.metadata.len();
        out[at..at + 4].copy_from_slice(&self.length_field);
        at += 4;
        out[at..at + 4].copy_from_slice(PARQUET_MAGIC);
        at + 4
    }
}

/// Mutates only the page data of Parquet seeds, keeping magic, file metadata and
/// footer intact so the reader gets past the framing checks.
pub struct ParquetFuzzer {
    file: MutationFile,
    scheduler: RandomScheduler,
}

impl ParquetFuzzer {
    /// Fails when no seed in the corpus has framing that fits `capacity`.
    pub fn new(mutation_dir: &Path, corpus: &CorpusSet, capacity: usize) -> Result<Self, FuzzError> {
        let seeds = corpus.generic();
        let viable = seeds
            .iter()
            .filter(|entry| ParquetFraming::locate(entry.as_bytes(), capacity).is_ok())
            .count();
        if viable == 0 {
            return Err(FuzzError::NoViableSeeds {
                format: "parquet",
                checked: seeds.len(),
            });
        }
        if viable < seeds.len() {
            warn!(
                "{} of {} Parquet seeds have unusable framing and will be skipped",
                seeds.len() - viable,
                seeds.len()
            );
        }
        Ok(Self {
            file: MutationFile::create(mutation_dir, ArtifactKind::Parquet)?,
            scheduler: RandomScheduler::new(),
        })
    }

    /// Mutates the page data of one randomly chosen seed and submits it.
    ///
    /// Seeds whose framing does not fit the buffer are skipped and another one is
    /// picked, until the interrupt flag is raised.
    pub fn round(
        &mut self,
        corpus: &CorpusSet,
        ctx: &mut FuzzContext<'_>,
    ) -> Result<Option<FuzzOutcome>, FuzzError> {
        let capacity = ctx.buffer.capacity();
        let mut rng = ctx.seeds.rng();
        let framing = loop {
            if ctx.interrupt.is_set() {
                return Ok(Some(FuzzOutcome::Interrupted));
            }
            let seed = self.scheduler.pick(corpus.generic(), &mut rng)?;
            match ParquetFraming::locate(seed.as_bytes(), capacity) {
                Ok(framing) => break framing,
                Err(reject) => debug!("Reselecting, {:?}: {reject}", seed.origin()),
            }
        };

        let seed_value = ctx.seeds.next_seed();
        let pages_end = capacity - framing.metadata.len() - FOOTER_LEN;
        let buffer = ctx.buffer.as_mut_slice();
        let pages_len = ctx
            .mutator
            .mutate(framing.pages, &mut buffer[4..pages_end], seed_value)?;
        let size = framing.assemble(buffer, pages_len);
        self.file.write_round(ctx.buffer.filled(size))?;

        if let Some(crash) = ctx.submit(size, ArtifactKind::Parquet)? {
            return Ok(Some(FuzzOutcome::Crash(crash)));
        }
        ctx.buffer.reset(size);
        Ok(None)
    }
}
