//! Supervision of the external strace subprocess.
//!
//! The tracer itself does all the hard interception work; this wrapper only
//! launches it with the flags the log grammar depends on and enforces an
//! optional wall-clock timeout.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

const WAIT_TICK: Duration = Duration::from_millis(20);

/// One strace invocation: the fixed flags (`-f -T -ttt -q -o <log>`) plus
/// whatever filter expression and command the user supplied.
pub struct Strace {
    pub default_args: Vec<String>,
    pub user_args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Strace {
    /// Run strace to completion, or until the wall-clock timeout. On timeout
    /// the child is sent SIGINT so it detaches from the tracee and flushes;
    /// everything already written to the log is still parseable. Returns
    /// whether the timeout fired.
    pub fn run(&self) -> Result<bool> {
        let mut child = Command::new("strace")
            .args(&self.default_args)
            .args(&self.user_args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .context("failed to launch strace (is it installed?)")?;

        let Some(limit) = self.timeout else {
            child.wait().context("failed to wait for strace")?;
            return Ok(false);
        };

        let started = Instant::now();
        loop {
            if child.try_wait().context("failed to poll strace")?.is_some() {
                return Ok(false);
            }
            if started.elapsed() >= limit {
                signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGINT)
                    .context("failed to signal strace after timeout")?;
                child.wait().context("failed to reap strace after timeout")?;
                return Ok(true);
            }
            thread::sleep(WAIT_TICK);
        }
    }
}
