// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time};

use nix::sys::signal;
use nix::unistd::{Pid, getpgid};
use tokio::process::{Child, Command};

const GRACEFUL_SHUTDOWN_POLL_TIME: time::Duration = time::Duration::from_millis(50);

///
/// A child process running in its own process group, whose Drop implementation signals that
/// group: SIGINT first, then SIGKILL after a grace period. This covers grandchildren which
/// a bare `Child::kill` would orphan.
///
pub struct ManagedChild {
    child: Child,
    graceful_shutdown_timeout: Option<time::Duration>,
    killed: AtomicBool,
}

impl ManagedChild {
    pub fn spawn(
        command: &mut Command,
        graceful_shutdown_timeout: Option<time::Duration>,
    ) -> Result<Self, std::io::Error> {
        // `kill_on_drop` lets tokio reap the process via its own mechanism as a backstop.
        command.kill_on_drop(true);

        // Adjust the Command to create its own process group as it starts, so that killing
        // the group later is safe.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map(|_sid| ()).map_err(|e| {
                    std::io::Error::other(format!("Could not create new session: {e}"))
                })
            });
        }

        let child = command.spawn()?;
        Ok(Self {
            child,
            graceful_shutdown_timeout,
            killed: AtomicBool::new(false),
        })
    }

    fn get_pgid(&self) -> Result<Pid, String> {
        let pid = self.id().ok_or_else(|| "Process had no PID.".to_owned())?;
        getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| format!("Could not get process group id of child process: {e}"))
    }

    /// Sends a signal to the child process group.
    fn signal_pg<T: Into<Option<signal::Signal>>>(&mut self, signal: T) -> Result<(), String> {
        let pgid = self.get_pgid()?;
        // A negative pid signals the entire process group.
        signal::kill(Pid::from_raw(-pgid.as_raw()), signal)
            .map_err(|e| format!("Failed to interrupt child process group: {e}"))
    }

    fn check_child_has_exited(&mut self) -> Result<bool, String> {
        self.child
            .try_wait()
            .map(|o| o.is_some())
            .map_err(|e| e.to_string())
    }

    ///
    /// Synchronously waits (by polling, bounded by `max_wait_duration`) for the child to
    /// exit. Returns true if it exited.
    ///
    fn wait_for_child_exit_sync(
        &mut self,
        max_wait_duration: time::Duration,
    ) -> Result<bool, String> {
        let deadline = time::Instant::now() + max_wait_duration;
        while time::Instant::now() <= deadline {
            if self.check_child_has_exited()? {
                return Ok(true);
            }
            thread::sleep(GRACEFUL_SHUTDOWN_POLL_TIME);
        }
        Ok(false)
    }

    ///
    /// Sends SIGINT to the process group and gives it a chance to exit; if it does not
    /// within the grace period, sends SIGKILL.
    ///
    /// This method blocks the current thread, but for a bounded amount of time.
    ///
    pub fn graceful_shutdown_sync(&mut self) -> Result<(), String> {
        let Some(graceful_shutdown_timeout) = self.graceful_shutdown_timeout else {
            return self.kill_pgid();
        };

        self.signal_pg(signal::Signal::SIGINT)?;
        match self.wait_for_child_exit_sync(graceful_shutdown_timeout) {
            Ok(true) => {
                self.killed.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(false) => {
                log::warn!(
                    "Timed out waiting for graceful shutdown of process group. Will try SIGKILL instead."
                );
                self.kill_pgid()
            }
            Err(e) => {
                log::warn!(
                    "An error occurred while waiting for graceful shutdown of process group ({e}). \
           Will try SIGKILL instead."
                );
                self.kill_pgid()
            }
        }
    }

    fn kill_pgid(&mut self) -> Result<(), String> {
        self.signal_pg(signal::Signal::SIGKILL)?;
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Deref for ManagedChild {
    type Target = Child;

    fn deref(&self) -> &Child {
        &self.child
    }
}

impl DerefMut for ManagedChild {
    fn deref_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

/// Implements drop by killing the process group.
impl Drop for ManagedChild {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::SeqCst) {
            let _ = self.graceful_shutdown_sync();
        }
    }
}
