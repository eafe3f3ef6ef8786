use crate::corpus::CorpusEntry;
use rand_core::RngCore;
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    /// The bucket handed to the scheduler holds no seeds.
    #[error("Corpus bucket is empty, cannot schedule next seed")]
    CorpusEmpty,
}

/// A `Scheduler` picks the next seed from a corpus bucket.
///
/// Every fuzzer in this crate draws seeds uniformly, but the seam stays so a
/// weighted or round-robin strategy can be swapped in per format.
pub trait Scheduler {
    /// Returns the index of the next seed in `bucket`.
    fn next(&mut self, bucket: &[CorpusEntry], rng: &mut dyn RngCore)
    -> Result<usize, SchedulerError>;
}

/// Uniformly random selection, no feedback.
#[derive(Default, Debug, Clone, Copy)]
pub struct RandomScheduler;

impl RandomScheduler {
    pub fn new() -> Self {
        RandomScheduler
    }

    /// Picks an entry and returns a reference to it.
    pub fn pick<'c>(
        &mut self,
        bucket: &'c [CorpusEntry],
        rng: &mut dyn RngCore,
    ) -> Result<&'c CorpusEntry, SchedulerError> {
        let index = self.next(bucket, rng)?;
        Ok(&bucket[index])
    }
}

impl Scheduler for RandomScheduler {
    fn next(
        &mut self,
        bucket: &[CorpusEntry],
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError> {
        if bucket.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        Ok((rng.next_u64() % bucket.len() as u64) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_utils::entry;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn empty_bucket_returns_corpus_empty() {
        let mut scheduler = RandomScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert_eq!(
            scheduler.next(&[], &mut rng),
            Err(SchedulerError::CorpusEmpty)
        );
    }

    #[test]
    fn every_seed_is_eventually_selected() {
        let mut scheduler = RandomScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let bucket = vec![entry(b"one"), entry(b"two"), entry(b"three")];

        let mut seen = HashSet::new();
        for _ in 0..64 {
            let id = scheduler.next(&bucket, &mut rng).unwrap();
            assert!(id < bucket.len());
            seen.insert(id);
        }
        assert_eq!(seen.len(), bucket.len());
    }

    #[test]
    fn pick_returns_an_entry_from_the_bucket() {
        let mut scheduler = RandomScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        let bucket = vec![entry(b"only")];
        assert_eq!(
            scheduler.pick(&bucket, &mut rng).unwrap().as_bytes(),
            b"only"
        );
    }
}
