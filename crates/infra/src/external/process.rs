//! Adapter invocation as a child process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::invoker::{ActionError, ActionInvoker, ActionRequest};

/// How action names map to executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterLayout {
    /// One executable per action: `<dir>/<action><extension>`, optionally run
    /// through an interpreter (`php`, `python3`, ...).
    PerAction {
        dir: PathBuf,
        interpreter: Option<PathBuf>,
        extension: Option<String>,
    },
    /// One executable for every action; the action is passed as `--action=<name>`
    /// after `leading_args`.
    Single {
        program: PathBuf,
        leading_args: Vec<String>,
    },
}

/// Runs adapters as child processes with a hard timeout.
///
/// stdin is closed, stdout/stderr are captured. On timeout the child is killed.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    layout: AdapterLayout,
}

/// Bytes of stderr kept in error values.
const STDERR_TAIL: usize = 2048;

impl ProcessInvoker {
    pub fn new(layout: AdapterLayout) -> Self {
        Self { layout }
    }

    fn command(&self, request: &ActionRequest) -> Command {
        let mut cmd = match &self.layout {
            AdapterLayout::PerAction {
                dir,
                interpreter,
                extension,
            } => {
                let script = dir.join(format!(
                    "{}{}",
                    request.action.name(),
                    extension.as_deref().unwrap_or_default()
                ));
                match interpreter {
                    Some(interpreter) => {
                        let mut cmd = Command::new(interpreter);
                        cmd.arg(script);
                        cmd
                    }
                    None => Command::new(script),
                }
            }
            AdapterLayout::Single {
                program,
                leading_args,
            } => {
                let mut cmd = Command::new(program);
                cmd.args(leading_args);
                cmd.arg(format!("--action={}", request.action.name()));
                cmd
            }
        };

        cmd.args(request.to_argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ActionInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        request: &ActionRequest,
        timeout: Duration,
    ) -> Result<Envelope, ActionError> {
        let action = request.action;
        let child = self
            .command(request)
            .spawn()
            .map_err(|e| ActionError::Spawn {
                action,
                message: e.to_string(),
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ActionError::Spawn {
                    action,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(%action, timeout_secs = timeout.as_secs(), "adapter timed out");
                return Err(ActionError::Timeout {
                    action,
                    after: timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code();
        debug!(%action, ?exit_code, stderr = %tail(&stderr), "adapter exited");

        match Envelope::from_stdout(action, &stdout)? {
            Some(envelope) => Ok(envelope),
            None => Err(ActionError::MissingEnvelope {
                action,
                exit_code,
                stderr: tail(&stderr).to_string(),
            }),
        }
    }
}

fn tail(s: &str) -> &str {
    let s = s.trim_end();
    if s.len() <= STDERR_TAIL {
        return s;
    }
    let mut start = s.len() - STDERR_TAIL;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
