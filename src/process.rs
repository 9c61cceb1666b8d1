//! Thin builder over `std::process::Command` for host tool invocations.
//!
//! Every external tool the pipeline runs goes through [`Cmd`]. Output is
//! captured, never thrown away. An optional deadline and a [`CancelToken`]
//! both stop the command promptly.
//!
//! Each command runs in its own process group. Tools such as debootstrap
//! and apt-get fork helpers that inherit the output pipes, so stopping a
//! command means signalling the whole group, and collecting its output is
//! bounded even when a helper outlives the command.

use std::ffi::OsString;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::ExecError;
use crate::interrupt::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long output pipes may stay open after the command itself exited.
const CAPTURE_GRACE: Duration = Duration::from_secs(1);

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    /// Stdout followed by stderr, trimmed. Used for diagnostics.
    pub fn combined(&self) -> String {
        let mut out = String::new();
        out.push_str(self.stdout.trim_end());
        if !self.stderr.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(self.stderr.trim_end());
        }
        out
    }
}

/// Builder for a single host command.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
            cancel: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run to completion and require a zero exit status.
    pub fn run(self) -> Result<CommandResult, ExecError> {
        let program = self.program.clone();
        let result = self.run_unchecked()?;
        if result.code == Some(0) {
            return Ok(result);
        }
        Err(ExecError::NonZeroExit {
            program,
            code: result.code,
            output: result.combined(),
        })
    }

    /// Run to completion, returning whatever exit status the tool produced.
    pub fn run_unchecked(self) -> Result<CommandResult, ExecError> {
        debug!(program = %self.program, args = ?self.args, "spawning");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ExecError::NotFound {
                    program: self.program.clone(),
                }
            } else {
                ExecError::Spawn {
                    program: self.program.clone(),
                    source,
                }
            }
        })?;

        let group = child.id();
        let stdout_rx = capture(child.stdout.take());
        let stderr_rx = capture(child.stderr.take());

        let status = self.wait(&mut child);

        let until = Instant::now() + CAPTURE_GRACE;
        let mut stdout = collect(stdout_rx.as_ref(), until);
        let mut stderr = collect(stderr_rx.as_ref(), until);
        if stdout.is_none() || stderr.is_none() {
            warn!(program = %self.program, "helpers still hold the output pipes; killing process group");
            kill_group(group);
            let until = Instant::now() + CAPTURE_GRACE;
            stdout = stdout.or_else(|| collect(stdout_rx.as_ref(), until));
            stderr = stderr.or_else(|| collect(stderr_rx.as_ref(), until));
        }
        let status = status?;
        let stdout = stdout.unwrap_or_default();
        let stderr = stderr.unwrap_or_default();

        Ok(CommandResult {
            code: status.code(),
            stdout,
            stderr,
        })
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, ExecError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    return Err(ExecError::Spawn {
                        program: self.program.clone(),
                        source,
                    })
                }
            }

            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                kill_and_reap(child);
                return Err(ExecError::Interrupted {
                    program: self.program.clone(),
                });
            }

            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    kill_and_reap(child);
                    return Err(ExecError::Timeout {
                        program: self.program.clone(),
                        after: limit,
                    });
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

/// SIGKILL every process in the group led by `leader`.
fn kill_group(leader: u32) {
    let Ok(pgid) = libc::pid_t::try_from(leader) else {
        return;
    };
    // SAFETY: killpg(2) has no memory-safety preconditions. The group was
    // created for this command by `process_group(0)`.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<String>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
        });
        rx
    })
}

/// Captured text, or `None` if the pipe is still open at `until`.
fn collect(rx: Option<&Receiver<String>>, until: Instant) -> Option<String> {
    let Some(rx) = rx else {
        return Some(String::new());
    };
    match rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
        Ok(text) => Some(text),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(String::new()),
    }
}
