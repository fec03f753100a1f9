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

use crate::domain::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Seconds the controller waits for interrupted jobs before SIGKILLing them
pub const CONTROLLER_STOP_WINDOW_SECS: u64 = 5;

/// Settings for running script batches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Keep running sequential scripts after one fails
    pub continue_on_sequential_error: bool,
    /// Fail batch preparation when a binary dependency cannot be found
    pub fail_if_dependency_not_found: bool,
    /// Local scratch directory; each target gets its own subdirectory
    pub scratch_dir: PathBuf,
    /// Directory checked for dependencies before the resource bundle
    pub tools_dir: Option<PathBuf>,
    /// Resource bundle holding dependencies as `<arch>/<name>`
    pub resources_dir: PathBuf,
    /// Directory on the target under which its temp directory is created
    pub target_temp_root: String,
    /// Seconds to wait for a controller to exit after SIGINT before SIGKILL.
    /// Must exceed [`CONTROLLER_STOP_WINDOW_SECS`].
    pub interrupt_grace_secs: u64,
    /// Timeout for each `kill` command sent to a target
    pub signal_command_timeout_secs: u64,
    /// Timeout for each modprobe invocation
    pub module_command_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            continue_on_sequential_error: false,
            fail_if_dependency_not_found: false,
            scratch_dir: std::env::temp_dir().join("script_runner"),
            tools_dir: None,
            resources_dir: PathBuf::from("resources"),
            target_temp_root: "/tmp".to_string(),
            interrupt_grace_secs: 20,
            signal_command_timeout_secs: 15,
            module_command_timeout_secs: 10,
        }
    }
}

impl ExecutionConfig {
    /// Parse a configuration from TOML, filling unspecified fields with defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signal_command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "signal_command_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.interrupt_grace_secs <= CONTROLLER_STOP_WINDOW_SECS {
            return Err(ConfigError::Invalid(format!(
                "interrupt_grace_secs must exceed the controller's {} second job stop window",
                CONTROLLER_STOP_WINDOW_SECS
            )));
        }
        if self.target_temp_root.is_empty() {
            return Err(ConfigError::Invalid(
                "target_temp_root cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_secs(self.interrupt_grace_secs)
    }

    pub fn signal_command_timeout(&self) -> Duration {
        Duration::from_secs(self.signal_command_timeout_secs)
    }

    pub fn module_command_timeout(&self) -> Duration {
        Duration::from_secs(self.module_command_timeout_secs)
    }
}

/// Builder pattern for execution configuration
pub struct ExecutionConfigBuilder {
    config: ExecutionConfig,
}

impl ExecutionConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: ExecutionConfig::default(),
        }
    }

    /// Keep running sequential scripts after a failure
    pub fn continue_on_sequential_error(mut self, enabled: bool) -> Self {
        self.config.continue_on_sequential_error = enabled;
        self
    }

    /// Fail when a dependency is missing
    pub fn fail_if_dependency_not_found(mut self, enabled: bool) -> Self {
        self.config.fail_if_dependency_not_found = enabled;
        self
    }

    /// Set the local scratch directory
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = dir.into();
        self
    }

    /// Set the tools override directory
    pub fn tools_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tools_dir = Some(dir.into());
        self
    }

    /// Set the resource bundle directory
    pub fn resources_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.resources_dir = dir.into();
        self
    }

    /// Set the root for target temp directories
    pub fn target_temp_root(mut self, root: &str) -> Self {
        self.config.target_temp_root = root.to_string();
        self
    }

    /// Set the controller interrupt grace period
    pub fn interrupt_grace(mut self, grace: Duration) -> Self {
        self.config.interrupt_grace_secs = grace.as_secs();
        self
    }

    /// Build the configuration
    pub fn build(self) -> ExecutionConfig {
        self.config
    }
}

impl Default for ExecutionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
