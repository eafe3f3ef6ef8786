use crate::config::MutatorConfig;
use log::debug;
use rand::rngs::OsRng;
use rand::{Rng, TryRngCore};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Size of the session's mutation buffer unless configured otherwise.
pub const DEFAULT_MUTATION_CAPACITY: usize = 1024 * 1024;

/// Placeholder in external mutator arguments replaced by the round's seed value.
pub const SEED_PLACEHOLDER: &str = "{seed}";

const HAVOC_MAX_STACK_POWER: u32 = 5;
const HAVOC_MAX_BLOCK: usize = 64;
const HAVOC_MAX_INSERT: usize = 32;
const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];
const INTERESTING_32: [i32; 8] = [
    i32::MIN,
    -100_663_046,
    -32_769,
    32_768,
    65_535,
    65_536,
    100_663_045,
    i32::MAX,
];
/// Bytes that tend to matter to text formats (CSV delimiters, quoting, JSON structure).
const SYNTAX_BYTES: &[u8] = b",;\t\"'\n\r{}[]:\\\0";

/// Errors raised by a mutation primitive.
#[derive(Error, Debug)]
pub enum MutatorError {
    #[error("External mutator command is empty")]
    EmptyCommand,

    #[error("Failed to spawn external mutator '{command}': {source}")]
    Spawn {
        command: String,
        source: io::Error,
    },

    #[error("I/O error talking to external mutator '{command}': {source}")]
    Io {
        command: String,
        source: io::Error,
    },

    #[error("External mutator '{command}' did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("External mutator '{command}' failed: {status}")]
    Failed { command: String, status: ExitStatus },
}

/// A byte-level mutation primitive.
///
/// Implementations read `seed` and write the mutated bytes into the front of `out`,
/// returning how many bytes were written. The result never exceeds `out.len()`;
/// callers hand in a sub-slice when they need to leave room for framing.
/// Bytes past the returned length are left as they were found: scratch space an
/// implementation dirties beyond it is zeroed again before returning.
/// Two calls with the same `seed` and `seed_value` produce the same output.
pub trait ByteMutator {
    fn name(&self) -> &'static str;

    fn mutate(&mut self, seed: &[u8], out: &mut [u8], seed_value: u64)
    -> Result<usize, MutatorError>;
}

/// Built-in stacked mutator in the style of AFL's havoc stage.
///
/// Copies the seed into the output, then applies between 2 and 32 randomly chosen
/// edits: bit flips, interesting values, arithmetic, block deletion, duplication
/// and insertion, byte swaps, chunk overwrites and syntax-character splices.
#[derive(Debug, Default, Clone, Copy)]
pub struct HavocMutator;

impl HavocMutator {
    pub fn new() -> Self {
        HavocMutator
    }

    fn apply_one(rng: &mut ChaCha8Rng, out: &mut [u8], len: usize) -> usize {
        let cap = out.len();
        match rng.random_range(0..11u8) {
            0 if len > 0 => {
                let pos = rng.random_range(0..len);
                out[pos] ^= 1 << rng.random_range(0..8u8);
                len
            }
            1 if len > 0 => {
                let pos = rng.random_range(0..len);
                out[pos] = rng.random();
                len
            }
            2 if len > 0 => {
                let pos = rng.random_range(0..len);
                out[pos] = INTERESTING_8[rng.random_range(0..INTERESTING_8.len())] as u8;
                len
            }
            3 if len >= 4 => {
                let pos = rng.random_range(0..=len - 4);
                let value = INTERESTING_32[rng.random_range(0..INTERESTING_32.len())];
                let bytes = if rng.random_bool(0.5) {
                    value.to_le_bytes()
                } else {
                    value.to_be_bytes()
                };
                out[pos..pos + 4].copy_from_slice(&bytes);
                len
            }
            4 if len > 0 => {
                let pos = rng.random_range(0..len);
                let delta = rng.random_range(1..=35u8);
                out[pos] = if rng.random_bool(0.5) {
                    out[pos].wrapping_add(delta)
                } else {
                    out[pos].wrapping_sub(delta)
                };
                len
            }
            5 if len > 1 => {
                let start = rng.random_range(0..len);
                let n = rng.random_range(1..=(len - start).min(HAVOC_MAX_BLOCK));
                out.copy_within(start + n..len, start);
                len - n
            }
            6 if len > 0 && len < cap => {
                let start = rng.random_range(0..len);
                let n = rng.random_range(1..=(len - start).min(cap - len).min(HAVOC_MAX_BLOCK));
                out.copy_within(start..len, start + n);
                len + n
            }
            7 if len < cap => {
                let pos = rng.random_range(0..=len);
                let n = rng.random_range(1..=(cap - len).min(HAVOC_MAX_INSERT));
                out.copy_within(pos..len, pos + n);
                if rng.random_bool(0.5) {
                    rng.fill(&mut out[pos..pos + n]);
                } else {
                    let fill = rng.random();
                    out[pos..pos + n].fill(fill);
                }
                len + n
            }
            8 if len > 1 => {
                let a = rng.random_range(0..len);
                let b = rng.random_range(0..len);
                out.swap(a, b);
                len
            }
            9 if len > 1 => {
                let n = rng.random_range(1..=(len / 2).clamp(1, HAVOC_MAX_BLOCK));
                let src = rng.random_range(0..=len - n);
                let dst = rng.random_range(0..=len - n);
                out.copy_within(src..src + n, dst);
                len
            }
            10 if len > 0 => {
                let pos = rng.random_range(0..len);
                out[pos] = SYNTAX_BYTES[rng.random_range(0..SYNTAX_BYTES.len())];
                len
            }
            _ => len,
        }
    }
}

impl ByteMutator for HavocMutator {
    fn name(&self) -> &'static str {
        "havoc"
    }

    fn mutate(
        &mut self,
        seed: &[u8],
        out: &mut [u8],
        seed_value: u64,
    ) -> Result<usize, MutatorError> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed_value);
        let mut len = seed.len().min(out.len());
        out[..len].copy_from_slice(&seed[..len]);

        let stack = 1usize << rng.random_range(1..=HAVOC_MAX_STACK_POWER);
        let mut high_water = len;
        for _ in 0..stack {
            len = Self::apply_one(&mut rng, out, len);
            high_water = high_water.max(len);
        }
        // Deletions leave stale bytes behind the new end.
        out[len..high_water].fill(0);
        Ok(len)
    }
}

/// Drives an external mutation tool (radamsa and friends).
///
/// The seed is written to the tool's stdin, the mutation read from its stdout.
/// Output beyond the destination capacity is drained and discarded.
#[derive(Debug, Clone)]
pub struct CommandMutator {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandMutator {
    /// Wraps `command` (program followed by arguments).
    ///
    /// Arguments may contain [`SEED_PLACEHOLDER`], replaced with the round's seed value.
    /// Fails with `MutatorError::EmptyCommand` if there is no program to run.
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self, MutatorError> {
        if command.first().is_none_or(|program| program.is_empty()) {
            return Err(MutatorError::EmptyCommand);
        }
        Ok(Self { command, timeout })
    }

    fn display(&self) -> String {
        self.command.join(" ")
    }

    fn command_for(&self, seed_value: u64) -> Command {
        let seed_text = seed_value.to_string();
        let mut cmd = Command::new(&self.command[0]);
        for arg in &self.command[1..] {
            cmd.arg(arg.replace(SEED_PLACEHOLDER, &seed_text));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }
}

impl ByteMutator for CommandMutator {
    fn name(&self) -> &'static str {
        "command"
    }

    fn mutate(
        &mut self,
        seed: &[u8],
        out: &mut [u8],
        seed_value: u64,
    ) -> Result<usize, MutatorError> {
        let io_error = |source| MutatorError::Io {
            command: self.display(),
            source,
        };

        let mut child = self
            .command_for(seed_value)
            .spawn()
            .map_err(|source| MutatorError::Spawn {
                command: self.display(),
                source,
            })?;
        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io_error(io::Error::other("mutator pipes unavailable")));
        };
        let capacity = out.len() as u64;

        let (wait_result, read_result) = thread::scope(|scope| {
            scope.spawn(move || {
                // The tool may exit without consuming all of its input.
                if let Err(e) = stdin.write_all(seed) {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        debug!("External mutator stdin write failed: {e}");
                    }
                }
            });
            let reader = scope.spawn(move || -> io::Result<Vec<u8>> {
                let mut produced = Vec::new();
                stdout.by_ref().take(capacity).read_to_end(&mut produced)?;
                io::copy(&mut stdout, &mut io::sink())?;
                Ok(produced)
            });

            let started = Instant::now();
            let wait_result = loop {
                match child.try_wait() {
                    Ok(Some(status)) => break Ok(status),
                    Ok(None) if started.elapsed() > self.timeout => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break Err(MutatorError::TimedOut {
                            command: self.display(),
                            timeout: self.timeout,
                        });
                    }
                    Ok(None) => thread::sleep(Duration::from_millis(5)),
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break Err(io_error(e));
                    }
                }
            };
            let read_result = reader
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("mutator reader thread panicked")));
            (wait_result, read_result)
        });

        let status = wait_result?;
        if !status.success() {
            return Err(MutatorError::Failed {
                command: self.display(),
                status,
            });
        }
        let produced = read_result.map_err(io_error)?;
        let len = produced.len().min(out.len());
        out[..len].copy_from_slice(&produced[..len]);
        Ok(len)
    }
}

/// Builds the mutation primitive the configuration asks for.
pub fn build_mutator(config: &MutatorConfig) -> Result<Box<dyn ByteMutator>, MutatorError> {
    match config {
        MutatorConfig::Havoc => Ok(Box::new(HavocMutator::new())),
        MutatorConfig::Command {
            command,
            timeout_ms,
        } => Ok(Box::new(CommandMutator::new(
            command.clone(),
            Duration::from_millis(*timeout_ms),
        )?)),
    }
}

/// The session's single mutation region.
///
/// Every round writes into it; callers zero the used prefix with [`reset`](Self::reset)
/// once the round has passed.
#[derive(Debug)]
pub struct MutationBuffer {
    bytes: Box<[u8]>,
}

impl MutationBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Whole buffer, for writers that report how much they filled.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// The first `len` bytes, clamped to capacity.
    pub fn filled(&self, len: usize) -> &[u8] {
        &self.bytes[..len.min(self.bytes.len())]
    }

    /// Zeroes the first `len` bytes after a passing round.
    ///
    /// Writers never leave bytes past the length they report, so resetting that
    /// prefix returns the whole buffer to zero.
    pub fn reset(&mut self, len: usize) {
        let len = len.min(self.bytes.len());
        self.bytes[..len].fill(0);
    }

    /// Copies `data` to the front of the buffer. Returns `None` if it does not fit.
    pub fn stage(&mut self, data: &[u8]) -> Option<usize> {
        let dst = self.bytes.get_mut(..data.len())?;
        dst.copy_from_slice(data);
        Some(data.len())
    }
}

/// Supplies per-round mutation seeds.
#[derive(Debug)]
pub enum SeedSource {
    /// OS entropy, falling back to clock, pid and a counter when unavailable.
    Entropy { counter: u64 },
    /// A reproducible sequence derived from a fixed seed.
    Fixed(ChaCha8Rng),
}

impl SeedSource {
    /// Seeds drawn from OS entropy.
    pub fn from_entropy() -> Self {
        SeedSource::Entropy { counter: 0 }
    }

    /// Reproducible seeds derived from `seed`.
    pub fn fixed(seed: u64) -> Self {
        SeedSource::Fixed(ChaCha8Rng::seed_from_u64(seed))
    }

    pub fn from_option(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_entropy, Self::fixed)
    }

    /// Returns the seed value for the next mutation.
    pub fn next_seed(&mut self) -> u64 {
        match self {
            SeedSource::Fixed(rng) => rng.next_u64(),
            SeedSource::Entropy { counter } => {
                *counter = counter.wrapping_add(1);
                match OsRng.try_next_u64() {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("OS entropy unavailable ({e}), using clock fallback");
                        fallback_seed(*counter)
                    }
                }
            }
        }
    }

    /// A fresh generator for per-round structural decisions.
    pub fn rng(&mut self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.next_seed())
    }
}

fn fallback_seed(counter: u64) -> u64 {
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    clock ^ u64::from(std::process::id()) ^ counter.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn havoc_never_exceeds_the_output_slice() {
        let mut mutator = HavocMutator::new();
        let seed = b"id,name,price\n1,widget,9.99\n2,gadget,19.99\n";
        for cap in [1usize, 3, 16, seed.len(), 200] {
            let mut out = vec![0u8; cap];
            for seed_value in 0..200 {
                let len = mutator.mutate(seed, &mut out, seed_value).unwrap();
                assert!(len <= cap, "len {len} > cap {cap}");
            }
        }
    }

    #[test]
    fn havoc_is_deterministic_per_seed_value() {
        let mut mutator = HavocMutator::new();
        let seed = b"{\"format-version\": 2}";
        let mut first = vec![0u8; 128];
        let mut second = vec![0u8; 128];
        let a = mutator.mutate(seed, &mut first, 42).unwrap();
        let b = mutator.mutate(seed, &mut second, 42).unwrap();
        assert_eq!(first[..a], second[..b]);
    }

    #[test]
    fn havoc_changes_the_input_eventually() {
        let mut mutator = HavocMutator::new();
        let seed = vec![b'a'; 64];
        let mut out = vec![0u8; 256];
        let changed = (0..32).any(|seed_value| {
            let len = mutator.mutate(&seed, &mut out, seed_value).unwrap();
            out[..len] != seed[..]
        });
        assert!(changed);
    }

    #[test]
    fn reset_after_havoc_leaves_the_buffer_zeroed() {
        let mut mutator = HavocMutator::new();
        let seed = b"id,name,price\n1,widget,9.99\n2,gadget,19.99\n3,doohickey,0.5\n";
        let mut buffer = MutationBuffer::new(256);
        for seed_value in 0..500 {
            let len = mutator
                .mutate(seed, buffer.as_mut_slice(), seed_value)
                .unwrap();
            assert!(
                buffer.as_slice()[len..].iter().all(|&b| b == 0),
                "seed value {seed_value} left bytes past {len}"
            );
            buffer.reset(len);
            assert!(buffer.as_slice().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn havoc_handles_empty_seed_and_empty_output() {
        let mut mutator = HavocMutator::new();
        assert_eq!(mutator.mutate(b"abc", &mut [], 7).unwrap(), 0);
        let mut out = vec![0u8; 32];
        let len = mutator.mutate(b"", &mut out, 7).unwrap();
        assert!(len <= 32);
    }

    #[test]
    fn command_mutator_passes_seed_through_stdin() {
        let mut mutator =
            CommandMutator::new(vec!["/bin/cat".to_string()], Duration::from_secs(5)).unwrap();
        let mut out = vec![0u8; 64];
        let len = mutator.mutate(b"a,b,c\n", &mut out, 1).unwrap();
        assert_eq!(&out[..len], b"a,b,c\n");
    }

    #[test]
    fn command_mutator_truncates_to_capacity() {
        let mut mutator =
            CommandMutator::new(vec!["/bin/cat".to_string()], Duration::from_secs(5)).unwrap();
        let mut out = vec![0u8; 4];
        let len = mutator.mutate(b"0123456789", &mut out, 1).unwrap();
        assert_eq!(len, 4);
        assert_eq!(&out, b"0123");
    }

    #[test]
    fn command_mutator_substitutes_seed_placeholder() {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "cat >/dev/null; printf %s {seed}".to_string(),
        ];
        let mut mutator = CommandMutator::new(command, Duration::from_secs(5)).unwrap();
        let mut out = vec![0u8; 32];
        let len = mutator.mutate(b"ignored", &mut out, 31337).unwrap();
        assert_eq!(&out[..len], b"31337");
    }

    #[test]
    fn command_mutator_reports_failure_and_timeout() {
        let failing = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        let mut mutator = CommandMutator::new(failing, Duration::from_secs(5)).unwrap();
        let mut out = vec![0u8; 8];
        assert!(matches!(
            mutator.mutate(b"x", &mut out, 1),
            Err(MutatorError::Failed { .. })
        ));

        let hanging = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "exec sleep 5".to_string(),
        ];
        let mut mutator = CommandMutator::new(hanging, Duration::from_millis(200)).unwrap();
        assert!(matches!(
            mutator.mutate(b"x", &mut out, 1),
            Err(MutatorError::TimedOut { .. })
        ));
    }

    #[test]
    fn command_mutator_rejects_empty_command() {
        assert!(matches!(
            CommandMutator::new(Vec::new(), Duration::from_secs(1)),
            Err(MutatorError::EmptyCommand)
        ));
    }

    #[test]
    fn buffer_stage_and_reset() {
        let mut buffer = MutationBuffer::new(8);
        assert_eq!(buffer.stage(b"abcd"), Some(4));
        assert_eq!(buffer.filled(4), b"abcd");
        assert_eq!(buffer.stage(b"too long for it"), None);
        buffer.reset(4);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buffer.filled(100).len(), 8);
    }

    #[test]
    fn fixed_seed_source_is_reproducible() {
        let mut a = SeedSource::fixed(9);
        let mut b = SeedSource::fixed(9);
        let first: Vec<u64> = (0..4).map(|_| a.next_seed()).collect();
        let second: Vec<u64> = (0..4).map(|_| b.next_seed()).collect();
        assert_eq!(first, second);

        let mut entropy = SeedSource::from_entropy();
        assert_ne!(entropy.next_seed(), entropy.next_seed());
    }
}
