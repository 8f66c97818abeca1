//! Subprocess execution.
//!
//! `Cmd` is a small builder around [`std::process::Command`] that captures
//! stdout and stderr, honours a [`CancelToken`] while the child runs, and
//! turns a non-zero exit into [`Error::Command`] carrying the tool's full
//! output verbatim.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result, Stage};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Captured output of a successful command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    stage: Stage,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>, stage: Stage) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            stage,
            error_msg: None,
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

    /// Prefix for the failure message, e.g. "make modules_prepare failed".
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Render the command line for logs and diagnostics.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    /// Run to completion, killing the child if `cancel` fires.
    pub fn run(&self, cancel: &CancelToken) -> Result<CmdOutput> {
        cancel.check()?;
        tracing::debug!(command = %self.display(), "spawning");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &self.envs {
            command.env(k, v);
        }

        let mut child = command
            .spawn()
            .io_context(|| format!("{}: spawning `{}`", self.stage, self.display()))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_cancellable(&mut child, cancel) {
            Ok(status) => status,
            Err(e) => {
                let _ = stdout.join();
                let _ = stderr.join();
                return Err(e);
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let mut output = String::new();
            if let Some(msg) = &self.error_msg {
                output.push_str(msg);
                output.push('\n');
            }
            output.push_str(stdout.trim_end());
            if !stderr.trim().is_empty() {
                output.push('\n');
                output.push_str(stderr.trim_end());
            }
            return Err(Error::Command {
                stage: self.stage,
                command: self.display(),
                status: status.to_string(),
                output,
            });
        }

        Ok(CmdOutput { stdout, stderr })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_cancellable(child: &mut Child, cancel: &CancelToken) -> Result<std::process::ExitStatus> {
    loop {
        if let Some(status) = child.try_wait().io_context(|| "waiting for child process")? {
            return Ok(status);
        }
        if let Err(e) = cancel.check() {
            tracing::warn!(pid = child.id(), "killing child process: {e}");
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
