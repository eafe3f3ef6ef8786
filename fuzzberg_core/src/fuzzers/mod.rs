//! Format-specific fuzzing strategies.
//!
//! Every strategy runs the same loop: pick a seed, mutate it into the session's
//! mutation buffer, persist it where the target reads it, submit the query set.
//! They differ in how much of the file format they keep intact.

pub mod generic;
pub mod iceberg;
pub mod parquet;

use crate::artifact::{ArtifactError, ArtifactKind};
use crate::config::{FileFormat, Tuning};
use crate::corpus::CorpusSet;
use crate::mutator::{ByteMutator, MutationBuffer, MutatorError, SeedSource};
use crate::protocol::{QueryRunner, RoundVerdict};
use crate::scheduler::SchedulerError;
use crate::signal::InterruptFlag;
use std::path::Path;
use thiserror::Error;

pub use crate::oracle::PendingCrash;
pub use generic::GenericFuzzer;
pub use iceberg::IcebergFuzzer;
pub use parquet::ParquetFuzzer;

/// Errors that abort a fuzzing session.
#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Target did not answer `{query}` within the request timeout")]
    TargetTimedOut { query: String },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Mutator(#[from] MutatorError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Failed to serialize the Iceberg working document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("None of the {checked} {format} seeds has usable framing")]
    NoViableSeeds {
        format: &'static str,
        checked: usize,
    },
}

/// Why a fuzzing loop stopped without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuzzOutcome {
    /// A query failed; the mutation is still in the buffer.
    Crash(PendingCrash),
    Interrupted,
}

/// Session-owned state every fuzzing round borrows.
pub struct FuzzContext<'a> {
    pub runner: &'a mut QueryRunner,
    pub mutator: &'a mut dyn ByteMutator,
    pub buffer: &'a mut MutationBuffer,
    pub seeds: &'a mut SeedSource,
    pub interrupt: InterruptFlag,
}

impl FuzzContext<'_> {
    /// Submits the query set against a mutation of `size` bytes already persisted as `kind`.
    pub(crate) fn submit(
        &mut self,
        size: usize,
        kind: ArtifactKind,
    ) -> Result<Option<PendingCrash>, FuzzError> {
        match self.runner.submit_all() {
            RoundVerdict::Passed => Ok(None),
            RoundVerdict::Failed { query, reason } => Ok(Some(PendingCrash {
                size,
                kind,
                query,
                reason,
            })),
            RoundVerdict::TimedOut { query } => Err(FuzzError::TargetTimedOut { query }),
        }
    }
}

/// The strategy chosen for a session, fixed at construction.
pub enum FormatFuzzer {
    Generic(GenericFuzzer),
    Parquet(ParquetFuzzer),
    Iceberg(IcebergFuzzer),
}

impl FormatFuzzer {
    /// Opens the mutation files and checks the corpus can feed the strategy.
    pub fn new(
        format: FileFormat,
        mutation_dir: &Path,
        corpus: &CorpusSet,
        tuning: &Tuning,
    ) -> Result<Self, FuzzError> {
        Ok(match format {
            FileFormat::Csv => FormatFuzzer::Generic(GenericFuzzer::new(mutation_dir)?),
            FileFormat::Parquet => FormatFuzzer::Parquet(ParquetFuzzer::new(
                mutation_dir,
                corpus,
                tuning.mutation_capacity,
            )?),
            FileFormat::Iceberg => FormatFuzzer::Iceberg(IcebergFuzzer::new(
                mutation_dir,
                corpus,
                tuning.field_retry_budget,
            )?),
        })
    }

    /// Short strategy name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            FormatFuzzer::Generic(_) => "generic",
            FormatFuzzer::Parquet(_) => "parquet",
            FormatFuzzer::Iceberg(_) => "iceberg",
        }
    }

    /// Runs rounds until a query fails, the run is interrupted, or a fatal error occurs.
    pub fn run(
        &mut self,
        corpus: &CorpusSet,
        ctx: &mut FuzzContext<'_>,
    ) -> Result<FuzzOutcome, FuzzError> {
        loop {
            if ctx.interrupt.is_set() {
                return Ok(FuzzOutcome::Interrupted);
            }
            let outcome = match self {
                FormatFuzzer::Generic(fuzzer) => fuzzer.round(corpus, ctx)?,
                FormatFuzzer::Parquet(fuzzer) => fuzzer.round(corpus, ctx)?,
                FormatFuzzer::Iceberg(fuzzer) => fuzzer.round(corpus, ctx)?,
            };
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::transport::test_utils::ScriptedTransport;

    /// Owns everything a [`FuzzContext`] borrows.
    pub struct Harness {
        pub runner: QueryRunner,
        pub mutator: Box<dyn ByteMutator>,
        pub buffer: MutationBuffer,
        pub seeds: SeedSource,
        pub interrupt: InterruptFlag,
    }

    impl Harness {
        pub fn new(
            transport: ScriptedTransport,
            mutator: impl ByteMutator + 'static,
            capacity: usize,
        ) -> Self {
            Self {
                runner: QueryRunner::new(Box::new(transport), vec!["SELECT 1".to_string()]),
                mutator: Box::new(mutator),
                buffer: MutationBuffer::new(capacity),
                seeds: SeedSource::fixed(7),
                interrupt: InterruptFlag::detached(),
            }
        }

        pub fn context(&mut self) -> FuzzContext<'_> {
            FuzzContext {
                runner: &mut self.runner,
                mutator: self.mutator.as_mut(),
                buffer: &mut self.buffer,
                seeds: &mut self.seeds,
                interrupt: self.interrupt,
            }
        }
    }
}
