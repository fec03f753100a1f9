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

use std::time::Duration;
use thiserror::Error;

/// Target-level errors raised by adapters (not exposed to callers directly)
#[derive(Debug, Clone, Error)]
pub enum TargetError {
    /// The command could not be started
    #[error("Failed to start command '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },
    /// The command did not finish within its timeout
    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    /// Copying a file to or from the target failed
    #[error("Failed to transfer '{source_path}' to '{destination}': {stderr}")]
    TransferFailed {
        source_path: String,
        destination: String,
        stderr: String,
    },
    /// A command ran but reported failure where success was required
    #[error("Command '{command}' failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    /// The target has no temporary directory yet
    #[error("Target '{0}' has no temporary directory")]
    NoTempDirectory(String),
    /// Elevated privileges are required but unavailable
    #[error("Elevated privileges required: {0}")]
    ElevationRequired(String),
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TargetError {
    fn from(err: std::io::Error) -> Self {
        TargetError::Io(err.to_string())
    }
}

/// Errors raised while building or querying the work item registry
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    /// The name is empty or contains characters outside `[A-Za-z0-9 ._+-]`
    #[error("Invalid script name '{0}': names may only contain letters, digits, spaces, '.', '_', '+' and '-'")]
    InvalidName(String),
    /// A script with the same name is already registered
    #[error("Script '{0}' is already registered")]
    DuplicateName(String),
    /// No script with the requested name exists
    #[error("Unknown script: {0}")]
    UnknownScript(String),
    /// The registry file could not be read or parsed
    #[error("Failed to load registry: {0}")]
    LoadFailed(String),
}

/// Configuration loading errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {reason}")]
    ReadFailed { path: String, reason: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned by the script execution service
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// Every submitted item was dropped or the submission was empty
    #[error("No scripts to run on target")]
    NothingToRun,
    /// Two distinct names map to the same sanitized token
    #[error("Script names '{first}' and '{second}' both sanitize to '{token}'")]
    NameCollision {
        first: String,
        second: String,
        token: String,
    },
    /// A work item failed validation
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Preparing the target failed
    #[error("Error while preparing target to run scripts: {0}")]
    Preparation(String),
    /// A required binary dependency could not be located
    #[error("Dependency not found: {0}")]
    DependencyNotFound(String),
    /// Kernel modules could not be installed
    #[error("Error installing kernel modules: {0}")]
    ModuleInstall(String),
    /// The controller script could not be rendered
    #[error("Error forming controller script: {0}")]
    Generation(String),
    /// The batch needs superuser but the target cannot elevate
    #[error("Controller script requires elevated privileges but the user cannot elevate privileges on target")]
    ElevationUnavailable,
    /// Transport or invocation failure talking to the target
    #[error(transparent)]
    Transport(#[from] TargetError),
    /// The controller exited non-zero without producing any result block
    #[error("Controller script returned exit code {exit_code}")]
    ControllerFailed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The controller produced no result block for a requested script
    #[error("Script output not found for script: {0}")]
    OutputMissing(String),
}

impl From<ConfigError> for ExecutionError {
    fn from(err: ConfigError) -> Self {
        ExecutionError::Preparation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_error_lifts_into_execution_error() {
        let err: ExecutionError = TargetError::NoTempDirectory("host1".to_string()).into();
        assert!(matches!(err, ExecutionError::Transport(_)));
        assert_eq!(err.to_string(), "Target 'host1' has no temporary directory");
    }

    #[test]
    fn test_controller_failure_message() {
        let err = ExecutionError::ControllerFailed {
            exit_code: 3,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Controller script returned exit code 3");
    }
}
