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

//! In-memory target that records what the services ask of it

use crate::domain::TargetError;
use crate::ports::{
    CommandOutput, DependencyProvider, ProcessHandle, RunOptions, StreamSinks, Target,
    TargetCommand,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::watch;

type Responder = Box<dyn Fn(&TargetCommand) -> CommandOutput + Send + Sync>;

pub struct RecordingTarget {
    name: String,
    temp_dir: Mutex<Option<String>>,
    can_elevate: bool,
    super_user: bool,
    loaded_modules: Mutex<Vec<String>>,
    uninstalled: Mutex<Vec<String>>,
    pushed: Mutex<Vec<PathBuf>>,
    commands: Mutex<Vec<(TargetCommand, RunOptions)>>,
    responder: Responder,
    stream_lines: Vec<String>,
}

impl RecordingTarget {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            temp_dir: Mutex::new(None),
            can_elevate: false,
            super_user: false,
            loaded_modules: Mutex::new(Vec::new()),
            uninstalled: Mutex::new(Vec::new()),
            pushed: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            responder: Box::new(|_| CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            }),
            stream_lines: Vec::new(),
        }
    }

    pub fn with_elevation(mut self, can_elevate: bool, super_user: bool) -> Self {
        self.can_elevate = can_elevate;
        self.super_user = super_user;
        self
    }

    pub fn with_loaded_modules(self, modules: &[&str]) -> Self {
        *self.loaded_modules.lock().unwrap() = modules.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_responder(
        mut self,
        responder: impl Fn(&TargetCommand) -> CommandOutput + Send + Sync + 'static,
    ) -> Self {
        self.responder = Box::new(responder);
        self
    }

    pub fn with_stream_lines(mut self, lines: &[&str]) -> Self {
        self.stream_lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    /// The temp directory this target hands out
    pub fn temp_dir(&self) -> String {
        format!("/tmp/script_runner.tmp.{}", self.name)
    }

    pub fn pushed_files(&self) -> Vec<PathBuf> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<(TargetCommand, RunOptions)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn uninstalled_modules(&self) -> Vec<String> {
        self.uninstalled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Target for RecordingTarget {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn temp_directory(&self) -> Option<String> {
        self.temp_dir.lock().unwrap().clone()
    }

    async fn create_temp_directory(&self, _root: &str) -> Result<String, TargetError> {
        let dir = self.temp_dir();
        *self.temp_dir.lock().unwrap() = Some(dir.clone());
        Ok(dir)
    }

    async fn remove_temp_directory(&self) -> Result<(), TargetError> {
        *self.temp_dir.lock().unwrap() = None;
        Ok(())
    }

    async fn user_path(&self) -> Result<String, TargetError> {
        Ok("/usr/bin:/bin".to_string())
    }

    async fn architecture(&self) -> Result<String, TargetError> {
        Ok("x86_64".to_string())
    }

    async fn can_elevate_privileges(&self) -> bool {
        self.can_elevate || self.super_user
    }

    fn is_super_user(&self) -> bool {
        self.super_user
    }

    async fn push_file(&self, local_path: &Path, _remote: &str) -> Result<(), TargetError> {
        self.pushed.lock().unwrap().push(local_path.to_path_buf());
        Ok(())
    }

    async fn run_command(
        &self,
        command: &TargetCommand,
        options: RunOptions,
    ) -> Result<CommandOutput, TargetError> {
        self.commands
            .lock()
            .unwrap()
            .push((command.clone(), options));
        Ok((self.responder)(command))
    }

    async fn run_command_stream(
        &self,
        command: &TargetCommand,
        sinks: StreamSinks,
    ) -> Result<(), TargetError> {
        self.commands
            .lock()
            .unwrap()
            .push((command.clone(), RunOptions::long_running()));
        let (exit_tx, exit_rx) = watch::channel(None);
        let _ = sinks.process.send(ProcessHandle::new(4242, Some(4242), exit_rx));
        for line in &self.stream_lines {
            let _ = sinks.stdout.send(line.clone()).await;
        }
        let _ = exit_tx.send(Some(0));
        let _ = sinks.exit_code.send(0);
        Ok(())
    }

    async fn install_modules(&self, modules: &[String]) -> Result<Vec<String>, TargetError> {
        let mut loaded = self.loaded_modules.lock().unwrap();
        let mut installed = Vec::new();
        for module in modules {
            if !loaded.contains(module) {
                loaded.push(module.clone());
                installed.push(module.clone());
            }
        }
        Ok(installed)
    }

    async fn uninstall_modules(&self, modules: &[String]) -> Result<(), TargetError> {
        self.uninstalled.lock().unwrap().extend(modules.iter().cloned());
        Ok(())
    }
}

/// Dependencies served from a fixed map of qualified name to local path
#[derive(Default)]
pub struct StaticDependencies(pub HashMap<String, PathBuf>);

#[async_trait]
impl DependencyProvider for StaticDependencies {
    async fn locate(
        &self,
        dependency: &str,
        _staging_dir: &Path,
    ) -> Result<Option<PathBuf>, TargetError> {
        Ok(self.0.get(dependency).cloned())
    }
}
