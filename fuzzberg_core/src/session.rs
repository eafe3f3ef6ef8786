use crate::artifact::write_crash;
use crate::config::{FileFormat, SessionSettings, TargetDatabase, Tuning};
use crate::corpus::{CorpusError, CorpusMode, CorpusSet};
use crate::fuzzers::{FormatFuzzer, FuzzContext, FuzzError, FuzzOutcome};
use crate::mutator::{ByteMutator, MutationBuffer, SeedSource};
use crate::oracle::{CrashOracle, CrashReport, TargetExit};
use crate::protocol::QueryRunner;
use crate::signal::{InterruptFlag, publish_target_pid};
use crate::supervisor::{LaunchSpec, SupervisorError, TargetSupervisor};
use crate::transport::QueryTransport;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Pause between connection probes while the target starts up.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Errors that end a session before it produces a report.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error(transparent)]
    Fuzz(#[from] FuzzError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Summary of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub execs: u64,
    pub elapsed: Duration,
    /// `None` if the target never got past startup.
    pub exit: Option<TargetExit>,
    pub crash: Option<CrashReport>,
    pub interrupted: bool,
}

struct Ending {
    exit: Option<TargetExit>,
    crash: Option<CrashReport>,
    interrupted: bool,
}

/// One fuzzing run against one target process.
///
/// Built with everything loaded and validated, so nothing can fail for lack of
/// seeds once the target is running. [`run`](Self::run) consumes the session,
/// which makes teardown happen exactly once.
pub struct TargetSession {
    database: TargetDatabase,
    format: FileFormat,
    crash_dir: PathBuf,
    tuning: Tuning,
    corpus: CorpusSet,
    fuzzer: FormatFuzzer,
    runner: QueryRunner,
    mutator: Box<dyn ByteMutator>,
    buffer: MutationBuffer,
    seeds: SeedSource,
    supervisor: TargetSupervisor,
    interrupt: InterruptFlag,
}

impl TargetSession {
    /// Loads the corpus and builds the format fuzzer, without starting the target.
    ///
    /// # Arguments
    /// * `settings`: Validated session settings.
    /// * `transport`: Carries the query set to the target.
    /// * `mutator`: Byte-level mutation primitive used by every strategy.
    /// * `interrupt`: Flag polled between rounds.
    ///
    /// # Returns
    /// A session ready to [`run`](Self::run), or a `SessionError` if the corpus is
    /// unusable for the selected format.
    pub fn prepare(
        settings: SessionSettings,
        transport: Box<dyn QueryTransport>,
        mutator: Box<dyn ByteMutator>,
        interrupt: InterruptFlag,
    ) -> Result<Self, SessionError> {
        let mode = CorpusMode::for_format(settings.format, settings.bucket.as_deref());
        let corpus = CorpusSet::load(&settings.corpus_dir, &mode)?;
        corpus.ensure_ready(settings.format, &settings.corpus_dir)?;
        let fuzzer = FormatFuzzer::new(
            settings.format,
            &settings.mutation_dir,
            &corpus,
            &settings.tuning,
        )?;

        let supervisor = TargetSupervisor::new(LaunchSpec {
            binary: settings.binary,
            args: settings.target_args,
            startup_delay: settings.tuning.startup_delay,
            connect_timeout: settings.tuning.connect_timeout,
            probe_interval: PROBE_INTERVAL,
        });

        Ok(Self {
            database: settings.database,
            format: settings.format,
            crash_dir: settings.crash_dir,
            buffer: MutationBuffer::new(settings.tuning.mutation_capacity),
            tuning: settings.tuning,
            corpus,
            fuzzer,
            runner: QueryRunner::new(transport, settings.queries),
            mutator,
            seeds: SeedSource::from_option(settings.seed),
            supervisor,
            interrupt,
        })
    }

    /// Launches the target, fuzzes until a crash, an interrupt or a fatal error,
    /// then tears down.
    pub fn run(mut self) -> Result<SessionReport, SessionError> {
        let started = Instant::now();
        let result = self.drive();
        let (execs, elapsed) = self.teardown(started);
        result.map(|ending| SessionReport {
            execs,
            elapsed,
            exit: ending.exit,
            crash: ending.crash,
            interrupted: ending.interrupted,
        })
    }

    fn drive(&mut self) -> Result<Ending, SessionError> {
        match self
            .supervisor
            .launch(self.runner.transport_mut(), self.interrupt)
        {
            Ok(_) => {}
            Err(SupervisorError::Interrupted) => {
                return Ok(Ending {
                    exit: None,
                    crash: None,
                    interrupted: true,
                });
            }
            Err(e) => return Err(e.into()),
        }
        self.supervisor.begin_fuzzing();
        info!(
            "Fuzzing {} {} input with the {} strategy and the {} mutator",
            self.database,
            self.format,
            self.fuzzer.name(),
            self.mutator.name()
        );

        let outcome = {
            let mut ctx = FuzzContext {
                runner: &mut self.runner,
                mutator: self.mutator.as_mut(),
                buffer: &mut self.buffer,
                seeds: &mut self.seeds,
                interrupt: self.interrupt,
            };
            self.fuzzer.run(&self.corpus, &mut ctx)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Fuzzing aborted: {e}");
                if let Err(kill_error) = self.supervisor.kill_now() {
                    debug!("Target already gone: {kill_error}");
                }
                return Err(e.into());
            }
        };

        match outcome {
            FuzzOutcome::Crash(pending) => {
                info!("Query `{}` failed: {}", pending.query, pending.reason);
                let exit = self.supervisor.supervise_exit(self.tuning.exit_wait)?;
                if !exit.is_failure() {
                    warn!("Query failed but the target {exit}; keeping the input anyway");
                }

                let artifact = self.buffer.filled(pending.size);
                let mut report = CrashOracle::new().examine(&pending, exit, artifact);
                let destination = write_crash(artifact, &self.crash_dir, pending.kind);
                info!(
                    "Crash: {} | {} bytes, md5 {}, saved to {destination}",
                    report.description, report.size, report.input_hash
                );
                report.destination = Some(destination);
                Ok(Ending {
                    exit: Some(exit),
                    crash: Some(report),
                    interrupted: false,
                })
            }
            FuzzOutcome::Interrupted => {
                let exit = self.supervisor.interrupt(self.tuning.interrupt_grace)?;
                info!("Target {exit}");
                Ok(Ending {
                    exit: Some(exit),
                    crash: None,
                    interrupted: true,
                })
            }
        }
    }

    fn teardown(mut self, started: Instant) -> (u64, Duration) {
        self.runner.close();
        publish_target_pid(None);
        let execs = self.runner.execs();
        let elapsed = started.elapsed();
        info!("Executions: {execs}");
        info!("Elapsed Time: {}", format_elapsed(elapsed));
        (execs, elapsed)
    }
}

/// Formats a duration as `Nd Nh Nm Ns`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}d {}h {}m {}s",
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::CrashDestination;
    use crate::config::MutatorConfig;
    use crate::mutator::test_utils::AppendingMutator;
    use crate::signal::test_utils::target_pid_guard;
    use crate::transport::QueryOutcome;
    use crate::transport::test_utils::ScriptedTransport;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn settings(root: &Path, script: &str) -> SessionSettings {
        let corpus_dir = root.join("corpus");
        fs::create_dir_all(&corpus_dir).unwrap();
        fs::write(corpus_dir.join("seed.csv"), b"id,name\n1,x\n").unwrap();

        SessionSettings {
            database: TargetDatabase::DuckDb,
            format: FileFormat::Csv,
            binary: PathBuf::from("/bin/sh"),
            target_args: vec!["-c".to_string(), script.to_string()],
            url: "http://127.0.0.1:1".to_string(),
            auth: None,
            corpus_dir,
            crash_dir: root.join("crashes"),
            mutation_dir: root.join("mutations"),
            queries: vec!["SELECT * FROM read_csv('fuzz.csv')".to_string()],
            bucket: None,
            seed: Some(1),
            tuning: Tuning {
                startup_delay: Duration::ZERO,
                connect_timeout: Duration::from_secs(2),
                interrupt_grace: Duration::from_millis(100),
                exit_wait: Duration::from_secs(5),
                ..Tuning::default()
            },
            mutator: MutatorConfig::Havoc,
        }
    }

    #[test]
    fn interrupt_kills_target_and_tears_down_once() {
        let _pid = target_pid_guard();
        let dir = tempdir().unwrap();
        let interrupt = InterruptFlag::detached();
        let transport = ScriptedTransport::always_ok().raise_after(3, interrupt);
        let log = transport.log();

        let session = TargetSession::prepare(
            settings(dir.path(), "sleep 30"),
            Box::new(transport),
            Box::new(AppendingMutator::default()),
            interrupt,
        )
        .unwrap();
        let report = session.run().unwrap();

        assert!(report.interrupted);
        assert_eq!(report.exit, Some(TargetExit::Killed));
        assert!(report.crash.is_none());
        assert_eq!(report.execs, 3);
        assert_eq!(log.closes(), 1);
    }

    #[test]
    fn failed_query_captures_crash_artifact() {
        let _pid = target_pid_guard();
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new([
            QueryOutcome::Ok,
            QueryOutcome::Failed("connection reset by peer".to_string()),
        ]);
        let log = transport.log();

        let session = TargetSession::prepare(
            settings(dir.path(), "sleep 0.5; kill -SEGV $$"),
            Box::new(transport),
            Box::new(AppendingMutator::default()),
            InterruptFlag::detached(),
        )
        .unwrap();
        let report = session.run().unwrap();

        assert_eq!(
            report.exit,
            Some(TargetExit::Crashed {
                signal: libc::SIGSEGV
            })
        );
        let crash = report.crash.expect("crash report");
        assert_eq!(crash.size, b"id,name\n1,x\n!".len());
        let Some(CrashDestination::CrashDir(path)) = crash.destination else {
            panic!("crash artifact should land in the crash dir");
        };
        assert_eq!(fs::read(path).unwrap(), b"id,name\n1,x\n!");
        assert_eq!(report.execs, 2);
        assert_eq!(log.closes(), 1);
    }

    #[test]
    fn timeout_aborts_and_kills_target() {
        let _pid = target_pid_guard();
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new([QueryOutcome::TimedOut]);
        let log = transport.log();

        let session = TargetSession::prepare(
            settings(dir.path(), "sleep 30"),
            Box::new(transport),
            Box::new(AppendingMutator::default()),
            InterruptFlag::detached(),
        )
        .unwrap();
        assert!(matches!(
            session.run(),
            Err(SessionError::Fuzz(FuzzError::TargetTimedOut { .. }))
        ));
        assert_eq!(log.closes(), 1);
    }

    #[test]
    fn empty_corpus_fails_before_launch() {
        let dir = tempdir().unwrap();
        let mut settings = settings(dir.path(), "exit 0");
        fs::remove_file(settings.corpus_dir.join("seed.csv")).unwrap();
        settings.seed = None;

        assert!(matches!(
            TargetSession::prepare(
                settings,
                Box::new(ScriptedTransport::always_ok()),
                Box::new(AppendingMutator::default()),
                InterruptFlag::detached(),
            ),
            Err(SessionError::Corpus(CorpusError::EmptyBucket { .. }))
        ));
    }

    #[test]
    fn elapsed_time_is_split_into_units() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0d 0h 0m 0s");
        assert_eq!(
            format_elapsed(Duration::from_secs(2 * 86_400 + 3 * 3_600 + 4 * 60 + 5)),
            "2d 3h 4m 5s"
        );
    }
}
