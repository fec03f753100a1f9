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

use crate::domain::TargetError;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// How a command should be elevated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SudoMode {
    /// Run as the current user
    #[default]
    None,
    /// `sudo -S <cmd>`, password (if any) is read from stdin
    PasswordFromStdin,
}

/// A command to run on a target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetCommand {
    /// Command program name
    pub program: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Privilege elevation wrapper
    pub sudo: SudoMode,
}

impl TargetCommand {
    /// Create a new command
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            sudo: SudoMode::None,
        }
    }

    /// Set the command arguments
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Wrap the command in `sudo -S`
    pub fn with_sudo_stdin(mut self) -> Self {
        self.sudo = SudoMode::PasswordFromStdin;
        self
    }

    /// Full argument vector including any sudo prefix
    pub fn argv(&self) -> Vec<String> {
        let mut argv = match self.sudo {
            SudoMode::None => Vec::new(),
            SudoMode::PasswordFromStdin => vec!["sudo".to_string(), "-S".to_string()],
        };
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for TargetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Execution policy for a single command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Maximum run time; `None` means no timeout
    pub timeout: Option<Duration>,
    /// Start the command in its own process group so terminal signals don't reach it
    pub new_process_group: bool,
    /// Reuse a shared connection (remote targets only)
    pub reuse_connection: bool,
}

impl RunOptions {
    /// Short bounded command over a shared connection
    pub fn quick(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            new_process_group: false,
            reuse_connection: true,
        }
    }

    /// Long-running, cancellable command: no timeout, own process group, fresh connection
    pub fn long_running() -> Self {
        Self {
            timeout: None,
            new_process_group: true,
            reuse_connection: false,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            new_process_group: false,
            reuse_connection: true,
        }
    }
}

/// Command execution result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit status code (-1 when terminated by a signal)
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Signals the core sends to processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Kill,
}

impl Signal {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
        }
    }

    /// Name accepted by `kill -<NAME>`
    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "INT",
            Signal::Kill => "KILL",
        }
    }
}

/// Handle to a running local process, shared with callers that may cancel it
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    process_group: Option<u32>,
    exit: watch::Receiver<Option<i32>>,
}

impl ProcessHandle {
    /// Create a handle; the owner of `exit`'s sender publishes the exit code
    pub fn new(pid: u32, process_group: Option<u32>, exit: watch::Receiver<Option<i32>>) -> Self {
        Self {
            pid,
            process_group,
            exit,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process group id when the process leads its own group
    pub fn process_group(&self) -> Option<u32> {
        self.process_group
    }

    /// Exit code if the process already finished
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Send a signal to the process
    pub fn signal(&self, signal: Signal) -> std::io::Result<()> {
        send_signal(self.pid as libc::pid_t, signal)
    }

    /// Send a signal to the process group, or the process itself when it has no group
    pub fn signal_group(&self, signal: Signal) -> std::io::Result<()> {
        match self.process_group {
            Some(pgid) => send_signal(-(pgid as libc::pid_t), signal),
            None => self.signal(signal),
        }
    }

    /// Wait for the process to exit and return its exit code
    pub async fn wait(&self) -> Option<i32> {
        let mut exit = self.exit.clone();
        let code = match exit.wait_for(|code| code.is_some()).await {
            Ok(code) => *code,
            // sender dropped without publishing: the exit is unknown
            Err(_) => None,
        };
        code
    }

    /// Wait at most `limit` for the process to exit
    pub async fn wait_timeout(&self, limit: Duration) -> Option<i32> {
        tokio::time::timeout(limit, self.wait()).await.ok().flatten()
    }

    /// Interrupt the group, give it `grace` to exit, then kill it
    pub async fn interrupt_then_kill(&self, grace: Duration) -> Option<i32> {
        if let Some(code) = self.exit_code() {
            return Some(code);
        }
        if let Err(e) = self.signal_group(Signal::Interrupt) {
            log::debug!("interrupt of pid {} failed: {}", self.pid, e);
        }
        if let Some(code) = self.wait_timeout(grace).await {
            return Some(code);
        }
        log::warn!(
            "process {} did not exit within {:?} of SIGINT, sending SIGKILL",
            self.pid,
            grace
        );
        if let Err(e) = self.signal_group(Signal::Kill) {
            log::debug!("kill of pid {} failed: {}", self.pid, e);
        }
        self.wait().await
    }
}

fn send_signal(pid: libc::pid_t, signal: Signal) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, signal.as_raw()) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // ESRCH: already gone
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Destinations for a streamed command's output
#[derive(Debug)]
pub struct StreamSinks {
    /// One message per stdout line (without the trailing newline)
    pub stdout: mpsc::Sender<String>,
    /// One message per stderr line (without the trailing newline)
    pub stderr: mpsc::Sender<String>,
    /// Exit code, sent once the command finishes
    pub exit_code: oneshot::Sender<i32>,
    /// Process handle, sent as soon as the command starts
    pub process: oneshot::Sender<ProcessHandle>,
}

/// Secondary port - a machine scripts can run on
///
/// Implementations exist for the local host and for remote hosts reached over ssh.
/// Every method must be safe to call concurrently on distinct targets.
#[async_trait]
pub trait Target: Send + Sync {
    /// Name used in logs and for per-target scratch directories
    fn name(&self) -> String;

    /// Temporary directory on the target, if it has been created
    fn temp_directory(&self) -> Option<String>;

    /// Create (once) and return the target's temporary directory under `root`
    async fn create_temp_directory(&self, root: &str) -> Result<String, TargetError>;

    /// Remove the temporary directory created by `create_temp_directory`
    async fn remove_temp_directory(&self) -> Result<(), TargetError>;

    /// The user's PATH on the target
    async fn user_path(&self) -> Result<String, TargetError>;

    /// Machine architecture as reported by `uname -m`
    async fn architecture(&self) -> Result<String, TargetError>;

    /// Whether the user is root or can use sudo
    async fn can_elevate_privileges(&self) -> bool;

    /// Whether the user is already root
    fn is_super_user(&self) -> bool;

    /// Copy a local file to the target; a directory destination keeps the file name
    async fn push_file(&self, local_path: &Path, remote_destination: &str)
        -> Result<(), TargetError>;

    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit is reported in the output, not as an error.
    async fn run_command(
        &self,
        command: &TargetCommand,
        options: RunOptions,
    ) -> Result<CommandOutput, TargetError>;

    /// Run a command, delivering output line by line as it is produced
    async fn run_command_stream(
        &self,
        command: &TargetCommand,
        sinks: StreamSinks,
    ) -> Result<(), TargetError>;

    /// Load kernel modules, returning only those that were not already loaded
    async fn install_modules(&self, modules: &[String]) -> Result<Vec<String>, TargetError>;

    /// Unload kernel modules
    async fn uninstall_modules(&self, modules: &[String]) -> Result<(), TargetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_argv() {
        let cmd = TargetCommand::new("bash").args(&["/tmp/x/controller.sh"]);
        assert_eq!(cmd.argv(), vec!["bash", "/tmp/x/controller.sh"]);
        assert_eq!(
            cmd.clone().with_sudo_stdin().argv(),
            vec!["sudo", "-S", "bash", "/tmp/x/controller.sh"]
        );
        assert_eq!(
            cmd.with_sudo_stdin().to_string(),
            "sudo -S bash /tmp/x/controller.sh"
        );
    }

    #[test]
    fn test_run_options() {
        let long = RunOptions::long_running();
        assert!(long.timeout.is_none());
        assert!(long.new_process_group);
        assert!(!long.reuse_connection);
        assert!(RunOptions::default().reuse_connection);
    }

    #[tokio::test]
    async fn test_process_handle_wait() {
        let (tx, rx) = watch::channel(None);
        let handle = ProcessHandle::new(1234, Some(1234), rx);
        assert_eq!(handle.exit_code(), None);
        assert_eq!(handle.wait_timeout(Duration::from_millis(20)).await, None);

        tx.send(Some(7)).unwrap();
        assert_eq!(handle.wait().await, Some(7));
        assert_eq!(handle.exit_code(), Some(7));
    }

    #[tokio::test]
    async fn test_process_handle_sender_dropped() {
        let (tx, rx) = watch::channel(None);
        let handle = ProcessHandle::new(1, None, rx);
        drop(tx);
        assert_eq!(handle.wait().await, None);
    }
}
