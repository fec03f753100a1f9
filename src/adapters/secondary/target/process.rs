/*
Copyright 2024 San Francisco Compute Company

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Local process execution shared by the local and ssh targets

use crate::domain::TargetError;
use crate::ports::{CommandOutput, ProcessHandle, Signal, StreamSinks};
use log::{debug, trace};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// A local process to start
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Written to stdin, which is then closed; stdin is null when absent
    pub input: Option<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    pub fn input(mut self, input: Option<String>) -> Self {
        self.input = input;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Printable command line, without stdin or environment
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }

    fn command(&self, new_process_group: bool) -> Result<Command, TargetError> {
        let (program, args) = self.argv.split_first().ok_or_else(|| TargetError::SpawnFailed {
            command: String::new(),
            reason: "empty command".to_string(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if new_process_group {
            // keeps terminal signals (Ctrl-C) away from the child
            cmd.process_group(0);
        }
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    fn spawn(&self, new_process_group: bool) -> Result<Child, TargetError> {
        let mut child = self
            .command(new_process_group)?
            .spawn()
            .map_err(|e| TargetError::SpawnFailed {
                command: self.display(),
                reason: e.to_string(),
            })?;
        if let (Some(input), Some(mut stdin)) = (self.input.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // the child may exit without reading stdin
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    trace!("stdin write failed: {}", e);
                }
            });
        }
        Ok(child)
    }
}

/// Exit code, or 128 plus the signal number for a signalled process
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buffer).await {
            debug!("failed to read process output: {}", e);
        }
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Run a process to completion and capture its output.
///
/// On timeout the process (and its group, if it leads one) is killed.
pub async fn run_process(
    spec: &ProcessSpec,
    limit: Option<Duration>,
    new_process_group: bool,
) -> Result<CommandOutput, TargetError> {
    debug!("executing: {}", spec.display());
    let mut child = spec.spawn(new_process_group)?;
    let stdout = tokio::spawn(read_all(child.stdout.take()));
    let stderr = tokio::spawn(read_all(child.stderr.take()));

    let status = match limit {
        Some(limit) => match timeout(limit, child.wait()).await.ok() {
            Some(status) => status,
            None => {
                if let Some(pid) = child.id() {
                    let handle = detached_handle(pid, new_process_group);
                    if let Err(e) = handle.signal_group(Signal::Kill) {
                        debug!("failed to kill timed out process {}: {}", pid, e);
                    }
                }
                let _ = child.kill().await;
                return Err(TargetError::Timeout {
                    command: spec.display(),
                    timeout: limit,
                });
            }
        },
        None => child.wait().await,
    }
    .map_err(|e| TargetError::SpawnFailed {
        command: spec.display(),
        reason: e.to_string(),
    })?;

    Ok(CommandOutput {
        stdout: stdout.await.unwrap_or_default(),
        stderr: stderr.await.unwrap_or_default(),
        exit_code: exit_code(status),
    })
}

fn detached_handle(pid: u32, leads_group: bool) -> ProcessHandle {
    let (_, exit) = watch::channel(None);
    ProcessHandle::new(pid, leads_group.then_some(pid), exit)
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: Option<R>, sink: mpsc::Sender<String>) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    let mut receiver_open = true;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                // keep draining after the receiver goes away so the child never blocks on a full pipe
                if receiver_open && sink.send(line).await.is_err() {
                    receiver_open = false;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("failed to read streamed output: {}", e);
                break;
            }
        }
    }
}

/// Run a process in its own group, streaming stdout and stderr line by line.
///
/// The process handle goes to `sinks.process` right after spawning; the exit
/// code goes to `sinks.exit_code` once both streams are drained.
pub async fn stream_process(spec: &ProcessSpec, sinks: StreamSinks) -> Result<(), TargetError> {
    debug!("streaming: {}", spec.display());
    let mut child = spec.spawn(true)?;
    let pid = child.id().ok_or_else(|| TargetError::SpawnFailed {
        command: spec.display(),
        reason: "process exited before its pid was read".to_string(),
    })?;

    let (exit_tx, exit_rx) = watch::channel(None);
    let _ = sinks.process.send(ProcessHandle::new(pid, Some(pid), exit_rx));

    let stdout = tokio::spawn(forward_lines(child.stdout.take(), sinks.stdout));
    let stderr = tokio::spawn(forward_lines(child.stderr.take(), sinks.stderr));

    let status = child.wait().await.map_err(|e| TargetError::SpawnFailed {
        command: spec.display(),
        reason: e.to_string(),
    })?;
    let _ = stdout.await;
    let _ = stderr.await;

    let code = exit_code(status);
    let _ = exit_tx.send(Some(code));
    let _ = sinks.exit_code.send(code);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_run_process_basic() {
        let output = run_process(&sh("echo hello world; echo oops >&2; exit 3"), None, false)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello world");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_run_process_stdin_and_env() {
        let spec = sh("read line; echo \"$line-$GREETING\"")
            .input(Some("secret\n".to_string()))
            .env("GREETING", "hi");
        let output = run_process(&spec, None, true).await.unwrap();
        assert_eq!(output.stdout, "secret-hi\n");
    }

    #[tokio::test]
    async fn test_run_process_timeout() {
        let result = run_process(&sh("sleep 10"), Some(Duration::from_millis(100)), true).await;
        assert!(matches!(result, Err(TargetError::Timeout { .. })));
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spec = ProcessSpec::new(vec!["definitely_not_a_real_command_12345".to_string()]);
        assert!(matches!(
            run_process(&spec, None, false).await,
            Err(TargetError::SpawnFailed { .. })
        ));
        assert!(run_process(&ProcessSpec::default(), None, false).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_process_delivers_lines_and_exit_code() {
        let (stdout_tx, mut stdout_rx) = mpsc::channel(8);
        let (stderr_tx, mut stderr_rx) = mpsc::channel(8);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (process_tx, process_rx) = oneshot::channel();
        let sinks = StreamSinks {
            stdout: stdout_tx,
            stderr: stderr_tx,
            exit_code: exit_tx,
            process: process_tx,
        };

        let task = tokio::spawn(async move {
            stream_process(&sh("echo one; echo two; echo err >&2; exit 5"), sinks).await
        });
        let handle = process_rx.await.unwrap();
        assert_eq!(handle.process_group(), Some(handle.pid()));
        assert_eq!(stdout_rx.recv().await.unwrap(), "one");
        assert_eq!(stdout_rx.recv().await.unwrap(), "two");
        assert_eq!(stderr_rx.recv().await.unwrap(), "err");
        assert_eq!(exit_rx.await.unwrap(), 5);
        assert_eq!(handle.wait().await, Some(5));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stream_process_can_be_interrupted() {
        let (stdout_tx, _stdout_rx) = mpsc::channel(8);
        let (stderr_tx, _stderr_rx) = mpsc::channel(8);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (process_tx, process_rx) = oneshot::channel();
        let sinks = StreamSinks {
            stdout: stdout_tx,
            stderr: stderr_tx,
            exit_code: exit_tx,
            process: process_tx,
        };

        let task = tokio::spawn(async move { stream_process(&sh("sleep 30"), sinks).await });
        let handle = process_rx.await.unwrap();
        let code = handle.interrupt_then_kill(Duration::from_secs(2)).await;
        assert_eq!(code, Some(128 + libc::SIGINT));
        assert_eq!(exit_rx.await.unwrap(), 128 + libc::SIGINT);
        task.await.unwrap().unwrap();
    }
}
