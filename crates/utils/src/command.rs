//! Helpers intended for [`std::process::Command`].

use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Synchronously execute the child, and return an error if the child exited unsuccessfully.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process, capturing stderr; if the child fails the
    /// captured stderr is included in the error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;

    /// Render the command in a form suitable for pasting into a shell.
    fn to_string_pretty(&self) -> String;
}

/// Helpers intended for [`std::process::Output`].
trait OutputExt {
    /// Turn an unsuccessful exit into an error, including stderr if available.
    fn check_status(&self, stderr: &[u8]) -> Result<()>;
}

impl OutputExt for Output {
    fn check_status(&self, stderr: &[u8]) -> Result<()> {
        if self.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            anyhow::bail!("Subprocess failed: {:?}", self.status)
        }
        anyhow::bail!("Subprocess failed: {:?}\n{stderr}", self.status)
    }
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run(&mut self) -> Result<()> {
        let st = self
            .status()
            .with_context(|| format!("Spawning {}", program_name(self)))?;
        if !st.success() {
            anyhow::bail!("Subprocess failed: {st:?}");
        }
        Ok(())
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let o = self
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", program_name(self)))?;
        o.check_status(&o.stderr)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let o = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", program_name(self)))?;
        o.check_status(&o.stderr)?;
        String::from_utf8(o.stdout).context("Parsing subprocess output as UTF-8")
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let s = self.run_get_string()?;
        serde_json::from_str(&s).context("Parsing subprocess output as JSON")
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| {
                let arg = arg.to_string_lossy();
                shlex::try_quote(&arg)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| arg.into_owned())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}
