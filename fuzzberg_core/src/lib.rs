pub mod artifact;
pub mod config;
pub mod corpus;
pub mod fuzzers;
pub mod mutator;
pub mod oracle;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod supervisor;
pub mod transport;

pub use artifact::{ArtifactKind, CrashDestination, MutationFile};
pub use config::{FileFormat, FuzzbergConfig, SessionSettings, TargetDatabase};
pub use corpus::{CorpusEntry, CorpusError, CorpusSet};
pub use fuzzers::{FormatFuzzer, FuzzError, FuzzOutcome};
pub use mutator::{ByteMutator, CommandMutator, HavocMutator, MutationBuffer, SeedSource};
pub use oracle::{CrashOracle, CrashReport, TargetExit};
pub use scheduler::{RandomScheduler, Scheduler, SchedulerError};
pub use session::{SessionError, SessionReport, TargetSession};
pub use signal::InterruptFlag;
pub use supervisor::{SupervisorError, TargetSupervisor};
pub use transport::{HttpTransport, QueryOutcome, QueryTransport};
