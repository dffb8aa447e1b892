//! Runtime CLI invocation.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use kiln_common::{KilnError, KilnResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::errors::{Target, classify};
use crate::driver::ArchiveSink;

/// One invocation of the runtime CLI.
#[derive(Debug)]
pub struct RuntimeCommand<'a> {
    binary: &'a Path,
    subcommand: &'static str,
    args: Vec<OsString>,
    target: Target<'a>,
}

impl<'a> RuntimeCommand<'a> {
    /// Start building `binary subcommand ...`.
    pub fn new(binary: &'a Path, subcommand: &'static str, target: Target<'a>) -> Self {
        Self {
            binary,
            subcommand,
            args: Vec::new(),
            target,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `flag value` for every value.
    #[must_use]
    pub fn repeated(mut self, flag: &str, values: &[String]) -> Self {
        for value in values {
            self.args.push(flag.into());
            self.args.push(value.into());
        }
        self
    }

    /// Append `flag value` if a value is present.
    #[must_use]
    pub fn optional(mut self, flag: &str, value: Option<&str>) -> Self {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.args.push(flag.into());
            self.args.push(value.into());
        }
        self
    }

    /// The arguments after the binary, for logging and tests.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.subcommand.to_string())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect()
    }

    fn command(&self) -> Command {
        tracing::debug!(
            binary = %self.binary.display(),
            argv = ?self.argv(),
            "Running runtime command"
        );

        let mut command = Command::new(self.binary);
        command
            .arg(self.subcommand)
            .args(&self.args)
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, err: std::io::Error) -> KilnError {
        if err.kind() == std::io::ErrorKind::NotFound {
            KilnError::RuntimeUnavailable {
                message: format!("runtime binary not found: {}", self.binary.display()),
            }
        } else {
            KilnError::Io(err)
        }
    }

    fn failure(&self, status: std::process::ExitStatus, stderr: &[u8]) -> KilnError {
        classify(
            self.subcommand,
            self.target,
            status.code(),
            &String::from_utf8_lossy(stderr),
        )
    }

    /// Run to completion and return trimmed stdout.
    pub async fn output(self) -> KilnResult<String> {
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(self.failure(output.status, &output.stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run with `input` written to stdin, returning trimmed stdout.
    pub async fn output_with_input(self, input: &[u8]) -> KilnResult<String> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // Dropping stdin closes it; the child may exit before reading it all.
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(input).await,
            None => Ok(()),
        };

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(self.failure(output.status, &output.stderr));
        }
        written?;

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run with the file at `path` as stdin, returning trimmed stdout.
    pub async fn output_with_file(self, path: &Path) -> KilnResult<String> {
        let file = std::fs::File::open(path)?;

        let output = self
            .command()
            .stdin(Stdio::from(file))
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(self.failure(output.status, &output.stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run and copy stdout into `dst`, flushing it before returning.
    ///
    /// A write error on `dst` kills the child and is returned verbatim.
    pub async fn stream_to(self, dst: &mut ArchiveSink<'_>) -> KilnResult<u64> {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            return Err(KilnError::Internal {
                message: "runtime child has no output pipes".to_string(),
            });
        };

        // Drain stderr apart from stdout.
        let stderr_task = tokio::spawn(async move {
            let mut captured = Vec::new();
            stderr.read_to_end(&mut captured).await.map(|_| captured)
        });

        let copied = match tokio::io::copy(&mut stdout, &mut *dst).await {
            Ok(copied) => copied,
            Err(err) => {
                drop(stdout);
                if let Err(kill_err) = child.kill().await {
                    tracing::warn!(error = %kill_err, "Failed to kill runtime command");
                }
                stderr_task.abort();
                return Err(KilnError::Io(err));
            }
        };
        dst.flush().await?;

        let status = child.wait().await?;
        if !status.success() {
            let captured = match stderr_task.await {
                Ok(Ok(captured)) => captured,
                Ok(Err(err)) => return Err(KilnError::Io(err)),
                Err(join_err) => {
                    return Err(KilnError::Internal {
                        message: format!("stderr reader failed: {join_err}"),
                    });
                }
            };
            return Err(self.failure(status, &captured));
        }
        stderr_task.abort();

        tracing::debug!(subcommand = self.subcommand, bytes = copied, "Stream complete");
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_argv() {
        let binary = Path::new("docker");
        let command = RuntimeCommand::new(binary, "commit", Target::Container("abc"))
            .optional("--author", Some("bob"))
            .optional("--message", Some(""))
            .repeated("--change", &["ENV A=1".to_string(), "USER app".to_string()])
            .arg("abc");

        insta::assert_snapshot!(
            command.argv().join(" "),
            @"commit --author bob --change ENV A=1 --change USER app abc"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let binary = Path::new("/nonexistent/kiln-runtime");
        let err = RuntimeCommand::new(binary, "version", Target::Runtime)
            .output()
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::RuntimeUnavailable { .. }));
    }
}
