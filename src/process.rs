//! Subprocess execution.
//!
//! [`Cmd`] is a small builder over [`std::process::Command`] that maps failures
//! onto [`crate::Error`]. Three ways to run:
//!
//! - [`Cmd::run`] captures stdout/stderr and fails on non-zero exit.
//! - [`Cmd::run_interactive`] inherits the terminal (emulator, long builds).
//! - [`Cmd::run_tagged`] forwards every output line to the log prefixed with a
//!   unit tag and returns the exit code, so parallel builds stay readable.
//!
//! ```rust,ignore
//! use osforge::process::Cmd;
//!
//! let out = Cmd::new("git")
//!     .args(["ls-remote", "https://example.org/repo.git", "main"])
//!     .error_msg("git ls-remote failed")
//!     .run()?;
//! ```

use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builder for an external command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Message prefixed to the error detail when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of failing on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> Error {
        Error::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    fn failure(&self, exit_code: i32, stderr: &str) -> Error {
        let stderr = stderr.trim();
        let detail = match (&self.error_msg, stderr.is_empty()) {
            (Some(msg), true) => msg.clone(),
            (Some(msg), false) => format!("{msg}\n{stderr}"),
            (None, _) => stderr.to_string(),
        };
        Error::Command {
            program: self.program.clone(),
            exit_code,
            detail,
        }
    }

    /// Run to completion, capturing output.
    pub fn run(self) -> Result<CommandResult> {
        debug!("running {} {:?}", self.program, self.args);
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;

        let result = CommandResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() && !self.allow_fail {
            return Err(self.failure(result.exit_code, &result.stderr));
        }
        Ok(result)
    }

    /// Run with the terminal attached. Returns the exit code.
    pub fn run_interactive(self) -> Result<i32> {
        debug!("running {} {:?} (interactive)", self.program, self.args);
        let status = self
            .command()
            .status()
            .map_err(|e| self.spawn_error(e))?;
        let code = status.code().unwrap_or(-1);
        if code != 0 && !self.allow_fail {
            return Err(self.failure(code, ""));
        }
        Ok(code)
    }

    /// Run while forwarding each stdout/stderr line to the log as `[tag] line`.
    ///
    /// Always returns the exit code; non-zero is not turned into an error so the
    /// caller can map it onto the unit that failed.
    pub fn run_tagged(self, tag: &str) -> Result<i32> {
        debug!("running {} {:?} [{}]", self.program, self.args, tag);
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        std::thread::scope(|s| {
            if let Some(out) = stdout {
                s.spawn(move || forward_lines(out, tag));
            }
            if let Some(err) = stderr {
                s.spawn(move || forward_lines(err, tag));
            }
        });

        let status = child
            .wait()
            .map_err(|e| Error::io(format!("waiting for {}", self.program), e))?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn forward_lines<R: Read>(stream: R, tag: &str) {
    for line in BufReader::new(stream).lines().map_while(std::io::Result::ok) {
        info!("[{}] {}", tag, line);
    }
}

/// Whether `program` resolves on `PATH`.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}
