use crate::oracle::TargetExit;
use crate::signal::{InterruptFlag, publish_target_pid};
use crate::transport::QueryTransport;
use log::{debug, info, warn};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Polling step while waiting on the child.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors raised while starting or stopping the target.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn target {binary:?}: {source}")]
    Spawn { binary: PathBuf, source: io::Error },

    #[error("Target {0} before accepting connections")]
    ExitedDuringStartup(TargetExit),

    #[error("Target did not accept connections within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Interrupted while waiting for the target to start")]
    Interrupted,

    #[error("Failed to wait for target: {0}")]
    Wait(#[source] io::Error),

    #[error("No target process is running")]
    NotRunning,
}

/// Lifecycle of the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Launching,
    Connected,
    Fuzzing,
    Interrupted,
    Crashed,
    Exited,
}

/// How to start the target and how long to wait for it.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub startup_delay: Duration,
    pub connect_timeout: Duration,
    pub probe_interval: Duration,
}

/// Owns the target process for the lifetime of a session.
#[derive(Debug)]
pub struct TargetSupervisor {
    spec: LaunchSpec,
    child: Option<Child>,
    state: SupervisorState,
}

impl TargetSupervisor {
    /// Creates a supervisor. Nothing is spawned until [`launch`](Self::launch).
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            child: None,
            state: SupervisorState::NotStarted,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Pid of the running target, `None` once it has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Spawns the target in its own process group and waits until `transport`
    /// can reach it.
    ///
    /// The child is killed on every failure path.
    pub fn launch(
        &mut self,
        transport: &mut dyn QueryTransport,
        interrupt: InterruptFlag,
    ) -> Result<u32, SupervisorError> {
        let mut cmd = Command::new(&self.spec.binary);
        cmd.args(&self.spec.args)
            .stdin(Stdio::null())
            .process_group(0);

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            binary: self.spec.binary.clone(),
            source,
        })?;
        let pid = child.id();
        self.child = Some(child);
        self.state = SupervisorState::Launching;
        publish_target_pid(Some(pid));
        info!("Launched {:?} (pid {pid})", self.spec.binary);

        if let Err(e) = self.await_connection(transport, interrupt) {
            if self.child.is_some() {
                self.kill_now()?;
            }
            return Err(e);
        }
        self.state = SupervisorState::Connected;
        info!("Target pid {pid} is accepting connections");
        Ok(pid)
    }

    fn await_connection(
        &mut self,
        transport: &mut dyn QueryTransport,
        interrupt: InterruptFlag,
    ) -> Result<(), SupervisorError> {
        let startup_end = Instant::now() + self.spec.startup_delay;
        while Instant::now() < startup_end {
            self.check_startup(interrupt)?;
            thread::sleep(
                WAIT_POLL_INTERVAL.min(startup_end.saturating_duration_since(Instant::now())),
            );
        }

        let deadline = Instant::now() + self.spec.connect_timeout;
        let mut attempts = 0u32;
        loop {
            self.check_startup(interrupt)?;
            attempts += 1;
            match transport.probe() {
                Ok(()) => {
                    debug!("Connection probe succeeded after {attempts} attempt(s)");
                    return Ok(());
                }
                Err(e) => debug!("Connection probe {attempts} failed: {e}"),
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::ConnectTimeout(self.spec.connect_timeout));
            }
            thread::sleep(self.spec.probe_interval);
        }
    }

    fn check_startup(&mut self, interrupt: InterruptFlag) -> Result<(), SupervisorError> {
        if interrupt.is_set() {
            return Err(SupervisorError::Interrupted);
        }
        if let Some(status) = self.try_reap()? {
            return Err(SupervisorError::ExitedDuringStartup(TargetExit::classify(
                status,
            )));
        }
        Ok(())
    }

    /// Marks the target as under test. Called after a successful launch.
    pub fn begin_fuzzing(&mut self) {
        self.state = SupervisorState::Fuzzing;
    }

    /// Waits up to `wait` for the target to exit on its own and classifies the exit.
    /// A target still running after that is killed and reported as unresponsive.
    pub fn supervise_exit(&mut self, wait: Duration) -> Result<TargetExit, SupervisorError> {
        let exit = match self.wait_for_exit(wait)? {
            Some(status) => TargetExit::classify(status),
            None => {
                warn!("Target still running after {wait:?}, killing it");
                self.kill_now()?;
                TargetExit::Unresponsive
            }
        };
        self.state = if exit.is_failure() {
            SupervisorState::Crashed
        } else {
            SupervisorState::Exited
        };
        Ok(exit)
    }

    /// Gives the target `grace` to react to SIGUSR1, then kills it.
    pub fn interrupt(&mut self, grace: Duration) -> Result<TargetExit, SupervisorError> {
        info!("Interrupted, giving the target {grace:?} before killing it");
        let exit = match self.wait_for_exit(grace)? {
            Some(status) => TargetExit::classify(status),
            None => self.kill_now()?,
        };
        self.state = SupervisorState::Interrupted;
        Ok(exit)
    }

    /// Kills the target's process group and reaps it.
    pub fn kill_now(&mut self) -> Result<TargetExit, SupervisorError> {
        let mut child = self.child.take().ok_or(SupervisorError::NotRunning)?;
        kill_group(&mut child);
        let status = child.wait().map_err(SupervisorError::Wait);
        publish_target_pid(None);
        debug!("Target reaped after kill: {:?}", status.as_ref().ok());
        status.map(|_| TargetExit::Killed)
    }

    fn wait_for_exit(&mut self, limit: Duration) -> Result<Option<ExitStatus>, SupervisorError> {
        if self.child.is_none() {
            return Err(SupervisorError::NotRunning);
        }
        let deadline = Instant::now() + limit;
        loop {
            if let Some(status) = self.try_reap()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Collects the child's status if it has exited. The status is collected once.
    fn try_reap(&mut self) -> Result<Option<ExitStatus>, SupervisorError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match child.try_wait().map_err(SupervisorError::Wait)? {
            Some(status) => {
                self.child = None;
                publish_target_pid(None);
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }
}

impl Drop for TargetSupervisor {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("Target pid {} still running at teardown, killing it", child.id());
            kill_group(&mut child);
            let _ = child.wait();
            publish_target_pid(None);
        }
    }
}

fn kill_group(child: &mut Child) {
    let killed_group = i32::try_from(child.id())
        // SAFETY: killpg only sends a signal; the group id is our own child's pid.
        .map(|pgid| unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0)
        .unwrap_or(false);
    if !killed_group {
        if let Err(e) = child.kill() {
            debug!("kill({}) failed: {e}", child.id());
        }
    }
}
