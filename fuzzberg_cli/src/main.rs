use fuzzberg_core::config::{FileFormat, FuzzbergConfig, TargetDatabase};
use fuzzberg_core::mutator::build_mutator;
use fuzzberg_core::session::TargetSession;
use fuzzberg_core::signal::{InterruptFlag, install_interrupt_handler};
use fuzzberg_core::transport::HttpTransport;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::process::ExitCode;

/// Mutation fuzzer for database file-format readers.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Target database profile (firebolt, duckdb).
    #[clap(short, long)]
    database: Option<TargetDatabase>,
    /// Input format to fuzz (csv, parquet, iceberg).
    #[clap(short, long)]
    format: Option<FileFormat>,
    /// URL the queries are POSTed to.
    #[clap(short, long)]
    url: Option<String>,
    /// Seed corpus directory.
    #[clap(short, long)]
    input: Option<PathBuf>,
    /// Crash output directory.
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Target server binary.
    #[clap(short, long)]
    bin: Option<PathBuf>,
    /// Directory the mutated files are written to.
    #[clap(short, long)]
    mutate: Option<PathBuf>,
    /// JSON query-set file.
    #[clap(short, long)]
    queries: Option<PathBuf>,
    /// Bearer token for the target's auth header.
    #[clap(short = 't', long)]
    auth: Option<String>,
    /// Object-store bucket the Iceberg metadata points at.
    #[clap(short = 'B', long)]
    bucket: Option<String>,
    #[clap(long, value_parser)]
    config_file: Option<PathBuf>,
    /// Fixes the mutation seed sequence.
    #[clap(long)]
    seed: Option<u64>,
    /// Arguments passed to the target binary.
    #[clap(last = true)]
    target_args: Vec<String>,
}

impl Cli {
    fn apply(self, config: &mut FuzzbergConfig) {
        let target = &mut config.target;
        target.database = self.database.or(target.database);
        target.url = self.url.or(target.url.take());
        target.binary = self.bin.or(target.binary.take());
        target.auth_token = self.auth.or(target.auth_token.take());
        if !self.target_args.is_empty() {
            target.args = self.target_args;
        }

        let fuzzing = &mut config.fuzzing;
        fuzzing.format = self.format.or(fuzzing.format);
        fuzzing.corpus_dir = self.input.or(fuzzing.corpus_dir.take());
        fuzzing.crash_dir = self.output.or(fuzzing.crash_dir.take());
        fuzzing.mutation_dir = self.mutate.or(fuzzing.mutation_dir.take());
        fuzzing.queries_file = self.queries.or(fuzzing.queries_file.take());
        fuzzing.bucket = self.bucket.or(fuzzing.bucket.take());
        fuzzing.seed = self.seed.or(fuzzing.seed);
    }
}

fn load_config(config_file: Option<&PathBuf>) -> anyhow::Result<FuzzbergConfig> {
    match config_file {
        Some(path) => {
            info!("Loading configuration from {path:?}");
            Ok(FuzzbergConfig::load_from_file(path)?)
        }
        None => {
            let default_path = PathBuf::from("config.toml");
            if default_path.exists() {
                info!("Loading default configuration from {default_path:?}");
                Ok(FuzzbergConfig::load_from_file(&default_path)?)
            } else {
                Ok(FuzzbergConfig::default())
            }
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = load_config(cli.config_file.as_ref())?;
    cli.apply(&mut config);
    let settings = config.validate().context("invalid configuration")?;

    install_interrupt_handler().context("failed to install SIGINT handler")?;
    let transport = HttpTransport::new(
        &settings.url,
        settings.auth.clone(),
        settings.tuning.request_timeout,
    )?;
    let mutator = build_mutator(&settings.mutator)?;

    let session = TargetSession::prepare(
        settings,
        Box::new(transport),
        mutator,
        InterruptFlag::process(),
    )?;
    let report = session.run()?;

    match &report.crash {
        Some(crash) => {
            info!(
                "Found a crash after {} executions: {}",
                report.execs, crash.description
            );
            Ok(ExitCode::SUCCESS)
        }
        None if report.interrupted => {
            info!("Stopped after {} executions", report.execs);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            warn!("Session ended without a crash or an interrupt");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run(Cli::parse())
}
