//! Process-wide interrupt state.
//!
//! The SIGINT handler only touches two atomics and sends one signal; everything else
//! happens cooperatively when the fuzz loop next checks the flag.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
/// Pid of the running target, or 0 when none is running.
static TARGET_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_sigint(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    let pid = TARGET_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // Asks the target to flush its coverage counters before it is killed.
        // SAFETY: kill(2) is async-signal-safe.
        unsafe {
            libc::kill(pid, libc::SIGUSR1);
        }
    }
}

/// Installs the SIGINT handler for the whole process.
pub fn install_interrupt_handler() -> io::Result<()> {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    // SAFETY: the handler only performs async-signal-safe operations.
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Records the pid the SIGINT handler forwards SIGUSR1 to.
pub fn publish_target_pid(pid: Option<u32>) {
    let raw = pid.and_then(|p| i32::try_from(p).ok()).unwrap_or(0);
    TARGET_PID.store(raw, Ordering::SeqCst);
}

/// Handle on an interrupt flag.
///
/// [`InterruptFlag::process`] is the flag the SIGINT handler sets. Tests use
/// [`InterruptFlag::detached`] so they never share state.
#[derive(Debug, Clone, Copy)]
pub struct InterruptFlag(&'static AtomicBool);

impl InterruptFlag {
    /// The flag set by the SIGINT handler.
    pub fn process() -> Self {
        InterruptFlag(&INTERRUPTED)
    }

    /// A private flag nothing but its holders can raise.
    pub fn detached() -> Self {
        InterruptFlag(Box::leak(Box::new(AtomicBool::new(false))))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::target_pid_guard;
    use super::*;
    use std::process::{Command, Stdio};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn detached_flags_are_independent() {
        let a = InterruptFlag::detached();
        let b = InterruptFlag::detached();
        a.raise();
        assert!(a.is_set());
        assert!(!b.is_set());
    }

    #[test]
    fn copies_share_state() {
        let flag = InterruptFlag::detached();
        let copy = flag;
        copy.raise();
        assert!(flag.is_set());
    }

    #[test]
    fn sigint_sets_process_flag_and_forwards_sigusr1() {
        let _pid = target_pid_guard();
        install_interrupt_handler().unwrap();

        let mut child = Command::new("/bin/sh")
            .args(["-c", "trap 'exit 42' USR1; while true; do sleep 0.05; done"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        // Give the shell time to install its trap.
        thread::sleep(Duration::from_millis(200));
        publish_target_pid(Some(child.id()));

        // SAFETY: the handler installed above replaces the default terminate action.
        assert_eq!(unsafe { libc::raise(libc::SIGINT) }, 0);
        publish_target_pid(None);
        assert!(InterruptFlag::process().is_set());

        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            if Instant::now() >= deadline {
                child.kill().unwrap();
                panic!("target ignored SIGUSR1");
            }
            thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(status.code(), Some(42));
    }

    #[test]
    fn out_of_range_pid_is_not_published() {
        let _pid = target_pid_guard();
        publish_target_pid(Some(u32::MAX));
        assert_eq!(TARGET_PID.load(Ordering::SeqCst), 0);
    }
}
