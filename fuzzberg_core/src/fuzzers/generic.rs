use super::{FuzzContext, FuzzError, FuzzOutcome};
use crate::artifact::{ArtifactKind, MutationFile};
use crate::corpus::CorpusSet;
use crate::scheduler::RandomScheduler;
use log::debug;
use std::path::Path;

/// Mutates whole seeds with no regard for structure. Used for CSV.
pub struct GenericFuzzer {
    file: MutationFile,
    scheduler: RandomScheduler,
}

impl GenericFuzzer {
    /// Creates `fuzz.csv` in `mutation_dir`.
    pub fn new(mutation_dir: &Path) -> Result<Self, FuzzError> {
        Ok(Self {
            file: MutationFile::create(mutation_dir, ArtifactKind::Csv)?,
            scheduler: RandomScheduler::new(),
        })
    }

    /// One pick, mutate, write and submit cycle over the generic bucket.
    ///
    /// Returns `Some` when the round ends the session.
    pub fn round(
        &mut self,
        corpus: &CorpusSet,
        ctx: &mut FuzzContext<'_>,
    ) -> Result<Option<FuzzOutcome>, FuzzError> {
        let mut rng = ctx.seeds.rng();
        let seed = self.scheduler.pick(corpus.generic(), &mut rng)?;
        let seed_value = ctx.seeds.next_seed();

        let size = ctx
            .mutator
            .mutate(seed.as_bytes(), ctx.buffer.as_mut_slice(), seed_value)?;
        debug!("{:?}: {} -> {size} bytes", seed.origin(), seed.len());
        self.file.write_round(ctx.buffer.filled(size))?;

        if let Some(crash) = ctx.submit(size, ArtifactKind::Csv)? {
            return Ok(Some(FuzzOutcome::Crash(crash)));
        }
        ctx.buffer.reset(size);
        Ok(None)
    }
}
