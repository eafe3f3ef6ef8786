use super::{FuzzContext, FuzzError, FuzzOutcome};
use crate::artifact::{ArtifactKind, MutationFile};
use crate::corpus::{CorpusEntry, CorpusSet};
use crate::scheduler::RandomScheduler;
use log::{debug, info, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde_json::{Map, Value as JsonValue};
use std::path::Path;

/// Bytes kept verbatim at the front of every manifest-list mutation (`Obj\x01`).
const AVRO_HEADER_LEN: usize = 4;
/// Length of an Avro object-container sync marker.
const AVRO_SYNC_LEN: usize = 16;
/// Writer schema spliced over manifest payloads to desynchronise schema and data.
const FAKE_AVRO_SCHEMA: &[u8] =
    br#"{"type":"record","name":"Fuzz","fields":[{"name":"x","type":"int"}]}"#;
/// Probability of descending one level below a top-level metadata key.
const DESCEND_PROBABILITY: f64 = 0.5;

type Document = Map<String, JsonValue>;

/// Location of the value mutated for one top-level key of the metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldPath {
    Whole(String),
    ObjectKey(String, String),
    ArrayIndex(String, usize),
    ArrayObjectKey(String, usize, String),
}

fn random_key(fields: &Map<String, JsonValue>, rng: &mut ChaCha8Rng) -> Option<String> {
    if fields.is_empty() {
        return None;
    }
    fields.keys().nth(rng.random_range(0..fields.len())).cloned()
}

impl FieldPath {
    fn choose(key: &str, value: &JsonValue, rng: &mut ChaCha8Rng) -> Self {
        let whole = FieldPath::Whole(key.to_string());
        if !rng.random_bool(DESCEND_PROBABILITY) {
            return whole;
        }
        match value {
            JsonValue::Object(fields) => random_key(fields, rng)
                .map(|child| FieldPath::ObjectKey(key.to_string(), child))
                .unwrap_or(whole),
            JsonValue::Array(items) if !items.is_empty() => {
                let index = rng.random_range(0..items.len());
                match &items[index] {
                    JsonValue::Object(fields) => random_key(fields, rng)
                        .map(|child| FieldPath::ArrayObjectKey(key.to_string(), index, child))
                        .unwrap_or(FieldPath::ArrayIndex(key.to_string(), index)),
                    _ => FieldPath::ArrayIndex(key.to_string(), index),
                }
            }
            _ => whole,
        }
    }

    fn resolve_mut<'d>(&self, document: &'d mut Document) -> Option<&'d mut JsonValue> {
        match self {
            FieldPath::Whole(key) => document.get_mut(key),
            FieldPath::ObjectKey(key, child) => document.get_mut(key)?.get_mut(child.as_str()),
            FieldPath::ArrayIndex(key, index) => document.get_mut(key)?.get_mut(*index),
            FieldPath::ArrayObjectKey(key, index, child) => document
                .get_mut(key)?
                .get_mut(*index)?
                .get_mut(child.as_str()),
        }
    }
}

/// Result of trying to turn a JSON value into a mutated, still-valid JSON value.
#[derive(Debug, PartialEq)]
enum Fragment {
    Valid(JsonValue),
    Exhausted,
    Interrupted,
}

/// Mutates `encoded` until the output parses as JSON, at most `budget` times.
fn mutate_fragment(
    encoded: &[u8],
    ctx: &mut FuzzContext<'_>,
    budget: u32,
) -> Result<Fragment, FuzzError> {
    let limit = ctx.buffer.capacity().saturating_sub(1);
    for _ in 0..budget {
        if ctx.interrupt.is_set() {
            return Ok(Fragment::Interrupted);
        }
        let seed_value = ctx.seeds.next_seed();
        let len = ctx
            .mutator
            .mutate(encoded, &mut ctx.buffer.as_mut_slice()[..limit], seed_value)?;
        let parsed = serde_json::from_slice::<JsonValue>(ctx.buffer.filled(len));
        ctx.buffer.reset(len);
        if let Ok(value) = parsed {
            return Ok(Fragment::Valid(value));
        }
    }
    Ok(Fragment::Exhausted)
}

/// Applies Avro object-container corruptions to `buf[..total]`, leaving the
/// header magic alone. Returns the new length, never more than `buf.len()`.
pub fn corrupt_container(buf: &mut [u8], total: usize, rng: &mut ChaCha8Rng) -> usize {
    let capacity = buf.len();
    let mut total = total.min(capacity);

    if total > AVRO_HEADER_LEN + AVRO_SYNC_LEN && rng.random_bool(0.3) {
        let header_sync = AVRO_HEADER_LEN..AVRO_HEADER_LEN + AVRO_SYNC_LEN;
        for pos in (total - AVRO_SYNC_LEN..total).chain(header_sync) {
            if rng.random_bool(0.3) {
                buf[pos] = rng.random();
            }
        }
    }

    let payload = total.saturating_sub(AVRO_HEADER_LEN);
    if payload > 24 && rng.random_bool(0.3) {
        let pos = AVRO_HEADER_LEN + 8 + rng.random_range(0..8);
        buf[pos] = rng.random();
    }

    if rng.random_bool(0.3) {
        let at = 100 + rng.random_range(0..100);
        if at + FAKE_AVRO_SCHEMA.len() < total {
            buf[at..at + FAKE_AVRO_SCHEMA.len()].copy_from_slice(FAKE_AVRO_SCHEMA);
        }
    }

    if payload > 32 && rng.random_bool(0.5) {
        let cut = rng.random_range(0..16);
        buf[total - cut..total].fill(0);
        total -= cut;
    } else if total + 16 <= capacity {
        buf[total..total + 16].fill(0);
        total += 16;
    }

    let payload = total.saturating_sub(AVRO_HEADER_LEN);
    if payload > 64 && rng.random_bool(0.3) {
        for _ in 0..8 {
            let pos = AVRO_HEADER_LEN + rng.random_range(0..payload);
            buf[pos] ^= 1 << rng.random_range(0..8u8);
        }
    }

    if payload > 128 && rng.random_bool(0.2) {
        let start = AVRO_HEADER_LEN + rng.random_range(0..payload / 2);
        let span = 16 + rng.random_range(0..32);
        if start + span <= total && total + span <= capacity {
            buf.copy_within(start..total, start + span);
            total += span;
        }
    }

    total
}

/// Three-phase fuzzer for Iceberg tables: blind metadata mutation, per-field
/// metadata mutation, then manifest-list container mutation.
pub struct IcebergFuzzer {
    metadata_file: MutationFile,
    manifest_file: MutationFile,
    scheduler: RandomScheduler,
    document: Option<Document>,
    retry_budget: u32,
}

impl IcebergFuzzer {
    /// Fails when no manifest-list seed is long enough to carry the Avro header.
    pub fn new(mutation_dir: &Path, corpus: &CorpusSet, retry_budget: u32) -> Result<Self, FuzzError> {
        let manifests = corpus.manifest();
        if !manifests.iter().any(|entry| entry.len() >= AVRO_HEADER_LEN) {
            return Err(FuzzError::NoViableSeeds {
                format: "iceberg manifest-list",
                checked: manifests.len(),
            });
        }
        info!(
            "Iceberg fuzzing over {} metadata and {} manifest-list seeds",
            corpus.metadata().len(),
            manifests.len()
        );
        Ok(Self {
            metadata_file: MutationFile::create(mutation_dir, ArtifactKind::IcebergMetadata)?,
            manifest_file: MutationFile::create(mutation_dir, ArtifactKind::IcebergManifest)?,
            scheduler: RandomScheduler::new(),
            document: None,
            retry_budget,
        })
    }

    /// One full blind, field and manifest sequence.
    pub fn round(
        &mut self,
        corpus: &CorpusSet,
        ctx: &mut FuzzContext<'_>,
    ) -> Result<Option<FuzzOutcome>, FuzzError> {
        if let Some(outcome) = self.blind_phase(corpus, ctx)? {
            return Ok(Some(outcome));
        }
        if ctx.interrupt.is_set() {
            return Ok(Some(FuzzOutcome::Interrupted));
        }
        if let Some(outcome) = self.field_phase(ctx)? {
            return Ok(Some(outcome));
        }
        if ctx.interrupt.is_set() {
            return Ok(Some(FuzzOutcome::Interrupted));
        }
        self.manifest_phase(corpus, ctx)
    }

    fn blind_phase(
        &mut self,
        corpus: &CorpusSet,
        ctx: &mut FuzzContext<'_>,
    ) -> Result<Option<FuzzOutcome>, FuzzError> {
        info!("Iceberg phase 1: blind metadata mutation");
        let mut rng = ctx.seeds.rng();
        let seed = self.scheduler.pick(corpus.metadata(), &mut rng)?;
        self.document = match serde_json::from_slice(seed.as_bytes()) {
            Ok(JsonValue::Object(document)) => Some(document),
            _ => {
                warn!("{:?} is no longer a JSON object, skipping field phase", seed.origin());
                None
            }
        };

        let seed_value = ctx.seeds.next_seed();
        let size = ctx
            .mutator
            .mutate(seed.as_bytes(), ctx.buffer.as_mut_slice(), seed_value)?;
        self.metadata_file.write_round(ctx.buffer.filled(size))?;

        if let Some(crash) = ctx.submit(size, ArtifactKind::IcebergMetadata)? {
            return Ok(Some(FuzzOutcome::Crash(crash)));
        }
        ctx.buffer.reset(size);
        Ok(None)
    }

    /// Mutates one value under each top-level key in turn, restoring the key after
    /// its queries pass.
    fn field_phase(&mut self, ctx: &mut FuzzContext<'_>) -> Result<Option<FuzzOutcome>, FuzzError> {
        let Self {
            document,
            metadata_file,
            manifest_file,
            retry_budget,
            ..
        } = self;
        let Some(document) = document.as_mut() else {
            return Ok(None);
        };
        info!("Iceberg phase 2: field mutation over {} keys", document.len());

        let mut rng = ctx.seeds.rng();
        let keys: Vec<String> = document.keys().cloned().collect();
        for key in keys {
            if ctx.interrupt.is_set() {
                return Ok(Some(FuzzOutcome::Interrupted));
            }
            let Some(original) = document.get(&key).cloned() else {
                continue;
            };
            let path = FieldPath::choose(&key, &original, &mut rng);
            let Some(target) = path.resolve_mut(document) else {
                continue;
            };
            let encoded = serde_json::to_vec(target)?;

            let fragment = match mutate_fragment(&encoded, ctx, *retry_budget)? {
                Fragment::Valid(fragment) => fragment,
                Fragment::Interrupted => return Ok(Some(FuzzOutcome::Interrupted)),
                Fragment::Exhausted => {
                    warn!("No valid JSON mutation of {path:?} after {retry_budget} attempts");
                    continue;
                }
            };
            debug!("{path:?}: {} -> {fragment}", String::from_utf8_lossy(&encoded));
            *target = fragment;

            let serialized = serde_json::to_vec(&*document)?;
            let Some(size) = ctx.buffer.stage(&serialized) else {
                debug!("Mutated document ({} bytes) exceeds the buffer", serialized.len());
                document.insert(key, original);
                continue;
            };
            metadata_file.write_round(ctx.buffer.filled(size))?;

            if let Some(crash) = ctx.submit(size, ArtifactKind::IcebergMetadata)? {
                metadata_file.sync()?;
                manifest_file.sync()?;
                return Ok(Some(FuzzOutcome::Crash(crash)));
            }
            ctx.buffer.reset(size);
            document.insert(key, original);
        }
        Ok(None)
    }

    fn manifest_phase(
        &mut self,
        corpus: &CorpusSet,
        ctx: &mut FuzzContext<'_>,
    ) -> Result<Option<FuzzOutcome>, FuzzError> {
        info!("Iceberg phase 3: manifest-list mutation");
        if let Some(document) = &self.document {
            self.metadata_file.write_round(&serde_json::to_vec(document)?)?;
        }

        let mut rng = ctx.seeds.rng();
        let seed = loop {
            if ctx.interrupt.is_set() {
                return Ok(Some(FuzzOutcome::Interrupted));
            }
            let seed: &CorpusEntry = self.scheduler.pick(corpus.manifest(), &mut rng)?;
            if seed.len() >= AVRO_HEADER_LEN {
                break seed.as_bytes();
            }
            debug!("Reselecting, {:?} is shorter than the Avro header", seed.origin());
        };

        let seed_value = ctx.seeds.next_seed();
        let buffer = ctx.buffer.as_mut_slice();
        buffer[..AVRO_HEADER_LEN].copy_from_slice(&seed[..AVRO_HEADER_LEN]);
        let payload = ctx.mutator.mutate(
            &seed[AVRO_HEADER_LEN..],
            &mut buffer[AVRO_HEADER_LEN..],
            seed_value,
        )?;
        let size = corrupt_container(buffer, AVRO_HEADER_LEN + payload, &mut rng);
        self.manifest_file.write_round(ctx.buffer.filled(size))?;

        if let Some(crash) = ctx.submit(size, ArtifactKind::IcebergManifest)? {
            self.metadata_file.sync()?;
            self.manifest_file.sync()?;
            return Ok(Some(FuzzOutcome::Crash(crash)));
        }
        ctx.buffer.reset(size);
        self.document = None;
        Ok(None)
    }
}
