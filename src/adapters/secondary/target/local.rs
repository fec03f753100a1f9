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

//! Target adapter for the machine the program runs on

use super::common;
use super::process::{run_process, stream_process, ProcessSpec};
use crate::domain::TargetError;
use crate::ports::{CommandOutput, RunOptions, StreamSinks, SudoMode, Target, TargetCommand};
use async_trait::async_trait;
use log::debug;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::OnceCell;

/// The local host
pub struct LocalTarget {
    name: String,
    /// Fed to `sudo -S` on stdin
    sudo_password: Option<String>,
    module_timeout: Duration,
    temp_dir: Mutex<Option<String>>,
    architecture: OnceCell<String>,
    can_elevate: OnceCell<bool>,
}

impl LocalTarget {
    /// Create a local target
    ///
    /// # Arguments
    /// * `sudo_password` - Password for `sudo -S`, if sudo needs one
    /// * `module_timeout` - Timeout for each modprobe call
    pub fn new(sudo_password: Option<String>, module_timeout: Duration) -> Self {
        Self {
            name: System::host_name().unwrap_or_else(|| "localhost".to_string()),
            sudo_password,
            module_timeout,
            temp_dir: Mutex::new(None),
            architecture: OnceCell::new(),
            can_elevate: OnceCell::new(),
        }
    }

    fn spec(&self, command: &TargetCommand) -> ProcessSpec {
        let input = match (command.sudo, &self.sudo_password) {
            (SudoMode::PasswordFromStdin, Some(password)) => Some(format!("{password}\n")),
            _ => None,
        };
        ProcessSpec::new(command.argv()).input(input)
    }

    fn set_temp_dir(&self, dir: Option<String>) {
        if let Ok(mut guard) = self.temp_dir.lock() {
            *guard = dir;
        }
    }
}

#[async_trait]
impl Target for LocalTarget {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn temp_directory(&self) -> Option<String> {
        self.temp_dir.lock().ok().and_then(|dir| dir.clone())
    }

    async fn create_temp_directory(&self, root: &str) -> Result<String, TargetError> {
        if let Some(dir) = self.temp_directory() {
            return Ok(dir);
        }
        let dir = common::make_temp_directory(self, root).await?;
        debug!("created temp directory {} on {}", dir, self.name);
        self.set_temp_dir(Some(dir.clone()));
        Ok(dir)
    }

    async fn remove_temp_directory(&self) -> Result<(), TargetError> {
        if let Some(dir) = self.temp_directory() {
            common::remove_directory(self, &dir).await?;
            self.set_temp_dir(None);
        }
        Ok(())
    }

    async fn user_path(&self) -> Result<String, TargetError> {
        let path = std::env::var("PATH").unwrap_or_default();
        Ok(common::filter_existing_paths(&path))
    }

    async fn architecture(&self) -> Result<String, TargetError> {
        self.architecture
            .get_or_try_init(|| common::uname_machine(self))
            .await
            .cloned()
    }

    async fn can_elevate_privileges(&self) -> bool {
        if self.is_super_user() {
            return true;
        }
        *self
            .can_elevate
            .get_or_init(|| common::probe_sudo(self))
            .await
    }

    fn is_super_user(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail
        unsafe { libc::geteuid() == 0 }
    }

    async fn push_file(
        &self,
        local_path: &Path,
        remote_destination: &str,
    ) -> Result<(), TargetError> {
        let destination = Path::new(remote_destination);
        let destination = if destination.is_dir() {
            match local_path.file_name() {
                Some(file_name) => destination.join(file_name),
                None => destination.to_path_buf(),
            }
        } else {
            destination.to_path_buf()
        };
        let copied = if local_path.is_dir() {
            common::copy_tree(local_path, &destination).await
        } else {
            tokio::fs::copy(local_path, &destination).await.map(|_| ())
        };
        copied.map_err(|e| TargetError::TransferFailed {
            source_path: local_path.display().to_string(),
            destination: destination.display().to_string(),
            stderr: e.to_string(),
        })
    }

    async fn run_command(
        &self,
        command: &TargetCommand,
        options: RunOptions,
    ) -> Result<CommandOutput, TargetError> {
        run_process(&self.spec(command), options.timeout, options.new_process_group).await
    }

    async fn run_command_stream(
        &self,
        command: &TargetCommand,
        sinks: StreamSinks,
    ) -> Result<(), TargetError> {
        stream_process(&self.spec(command), sinks).await
    }

    async fn install_modules(&self, modules: &[String]) -> Result<Vec<String>, TargetError> {
        common::install_modules(self, modules, self.module_timeout).await
    }

    async fn uninstall_modules(&self, modules: &[String]) -> Result<(), TargetError> {
        common::uninstall_modules(self, modules, self.module_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target() -> LocalTarget {
        LocalTarget::new(None, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_temp_directory_lifecycle() {
        let root = TempDir::new().unwrap();
        let target = target();
        assert_eq!(target.temp_directory(), None);

        let dir = target
            .create_temp_directory(root.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(dir.contains("script_runner.tmp."));
        assert!(Path::new(&dir).is_dir());
        // created once
        assert_eq!(
            target
                .create_temp_directory(root.path().to_str().unwrap())
                .await
                .unwrap(),
            dir
        );

        target.remove_temp_directory().await.unwrap();
        assert!(!Path::new(&dir).exists());
        assert_eq!(target.temp_directory(), None);
    }

    #[tokio::test]
    async fn test_push_file_into_directory() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let file = src.path().join("check.sh");
        std::fs::write(&file, "echo hi\n").unwrap();

        target()
            .push_file(&file, dst.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dst.path().join("check.sh")).unwrap(),
            "echo hi\n"
        );
    }

    #[tokio::test]
    async fn test_push_directory() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let tool = src.path().join("async-profiler");
        std::fs::create_dir_all(tool.join("bin")).unwrap();
        std::fs::write(tool.join("bin/asprof"), "#!/bin/sh\n").unwrap();

        target()
            .push_file(&tool, dst.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(dst.path().join("async-profiler/bin/asprof").is_file());
    }

    #[tokio::test]
    async fn test_run_command_reports_exit_code() {
        let output = target()
            .run_command(
                &TargetCommand::new("sh").args(&["-c", "echo out; exit 4"]),
                RunOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.exit_code, 4);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_sudo_password_only_for_stdin_mode() {
        let target = LocalTarget::new(Some("hunter2".to_string()), Duration::from_secs(10));
        let plain = target.spec(&TargetCommand::new("ls"));
        assert_eq!(plain.input, None);
        let sudo = target.spec(&TargetCommand::new("ls").with_sudo_stdin());
        assert_eq!(sudo.input.as_deref(), Some("hunter2\n"));
        assert_eq!(sudo.argv, vec!["sudo", "-S", "ls"]);
    }

    #[tokio::test]
    async fn test_architecture_and_path() {
        let target = target();
        assert!(!target.architecture().await.unwrap().is_empty());
        let path = target.user_path().await.unwrap();
        assert!(path.split(':').all(|entry| Path::new(entry).is_dir()));
    }
}
