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

//! Pushes a controller to a target and runs it

use crate::domain::services::controller::ControllerScript;
use crate::domain::services::demux::parse_controller_output;
use crate::domain::{
    ExecutionError, ExecutionResult, PrivilegeCapabilities, CONTROLLER_SCRIPT_NAME,
};
use crate::ports::{RunOptions, Target, TargetCommand};
use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;

/// Command that runs the controller, elevated when the batch needs it
pub fn controller_command(
    temp_dir: &str,
    needs_elevated_privileges: bool,
    capabilities: PrivilegeCapabilities,
) -> TargetCommand {
    let script = format!("{temp_dir}/{CONTROLLER_SCRIPT_NAME}");
    let command = TargetCommand::new("bash").args(&[&script]);
    if needs_elevated_privileges && !capabilities.is_super_user {
        command.with_sudo_stdin()
    } else {
        command
    }
}

/// Write, push and run a controller, then demultiplex its output.
///
/// The controller runs in its own process group without a timeout; cancel it
/// through its pid file (see [`crate::domain::services::cancellation`]).
///
/// # Arguments
/// * `target` - Target whose temp directory already holds the item scripts
/// * `temp_dir` - That temp directory
/// * `local_dir` - Local scratch directory for this target
/// * `controller` - The rendered controller
/// * `capabilities` - What the target lets the user do
///
/// # Returns
/// * `Ok(HashMap)` - Results by original name; items without a block are absent
/// * `Err(ExecutionError)` - Elevation unavailable, transport failure, or a
///   failed controller that produced no results
pub async fn run_controller(
    target: &dyn Target,
    temp_dir: &str,
    local_dir: &Path,
    controller: &ControllerScript,
    capabilities: PrivilegeCapabilities,
) -> Result<HashMap<String, ExecutionResult>, ExecutionError> {
    if controller.needs_elevated_privileges && !capabilities.allows_privileged() {
        return Err(ExecutionError::ElevationUnavailable);
    }

    let local_path = local_dir.join(CONTROLLER_SCRIPT_NAME);
    tokio::fs::write(&local_path, &controller.text)
        .await
        .map_err(|e| {
            ExecutionError::Preparation(format!(
                "failed to write controller script {}: {}",
                local_path.display(),
                e
            ))
        })?;
    target.push_file(&local_path, temp_dir).await?;

    let command = controller_command(
        temp_dir,
        controller.needs_elevated_privileges,
        capabilities,
    );
    debug!("running controller on {}: {}", target.name(), command);
    let output = target
        .run_command(&command, RunOptions::long_running())
        .await?;

    let results = parse_controller_output(&output.stdout);
    if !output.success() {
        if results.is_empty() {
            return Err(ExecutionError::ControllerFailed {
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        warn!(
            "controller on {} exited with code {}, returning {} partial results: {}",
            target.name(),
            output.exit_code,
            results.len(),
            output.stderr.trim()
        );
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::services::controller::BLOCK_DELIMITER;
    use crate::domain::services::testing::RecordingTarget;
    use crate::ports::CommandOutput;
    use tempfile::TempDir;

    fn controller(needs_elevated_privileges: bool) -> ControllerScript {
        ControllerScript {
            text: "#!/usr/bin/env bash\n".to_string(),
            needs_elevated_privileges,
        }
    }

    fn caps(can_elevate: bool, is_super_user: bool) -> PrivilegeCapabilities {
        PrivilegeCapabilities {
            can_elevate,
            is_super_user,
        }
    }

    fn block(name: &str, exit: i32) -> String {
        format!("{BLOCK_DELIMITER}\nSCRIPT NAME: {name}\nSTDOUT:\nout\nSTDERR:\nEXIT CODE: {exit}\n")
    }

    #[test]
    fn test_controller_command_elevation() {
        let cmd = controller_command("/tmp/d", true, caps(true, false));
        assert_eq!(cmd.argv(), vec!["sudo", "-S", "bash", "/tmp/d/controller.sh"]);

        let cmd = controller_command("/tmp/d", true, caps(false, true));
        assert_eq!(cmd.argv(), vec!["bash", "/tmp/d/controller.sh"]);

        let cmd = controller_command("/tmp/d", false, caps(true, false));
        assert_eq!(cmd.argv(), vec!["bash", "/tmp/d/controller.sh"]);
    }

    #[tokio::test]
    async fn test_elevation_unavailable() {
        let scratch = TempDir::new().unwrap();
        let target = RecordingTarget::new("t");
        let result = run_controller(
            &target,
            "/tmp/d",
            scratch.path(),
            &controller(true),
            caps(false, false),
        )
        .await;
        assert!(matches!(result, Err(ExecutionError::ElevationUnavailable)));
        assert!(target.commands().is_empty());
    }

    #[tokio::test]
    async fn test_runs_long_running_and_parses() {
        let scratch = TempDir::new().unwrap();
        let target = RecordingTarget::new("t").with_responder(|_| CommandOutput {
            stdout: block("a", 0) + &block("b", 2),
            stderr: String::new(),
            exit_code: 0,
        });
        let results = run_controller(
            &target,
            "/tmp/d",
            scratch.path(),
            &controller(false),
            caps(false, false),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results["b"].exit_code, 2);
        assert!(scratch.path().join(CONTROLLER_SCRIPT_NAME).exists());
        assert_eq!(target.pushed_files(), vec![scratch.path().join(CONTROLLER_SCRIPT_NAME)]);

        let (_, options) = &target.commands()[0];
        assert_eq!(*options, RunOptions::long_running());
    }

    #[tokio::test]
    async fn test_failed_controller_without_output() {
        let scratch = TempDir::new().unwrap();
        let target = RecordingTarget::new("t").with_responder(|_| CommandOutput {
            stdout: String::new(),
            stderr: "bash: controller.sh: No such file".to_string(),
            exit_code: 127,
        });
        let result = run_controller(
            &target,
            "/tmp/d",
            scratch.path(),
            &controller(false),
            caps(false, false),
        )
        .await;
        match result {
            Err(ExecutionError::ControllerFailed {
                exit_code, stderr, ..
            }) => {
                assert_eq!(exit_code, 127);
                assert!(stderr.contains("No such file"));
            }
            other => panic!("expected controller failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_controller_keeps_partial_results() {
        let scratch = TempDir::new().unwrap();
        let target = RecordingTarget::new("t").with_responder(|_| CommandOutput {
            stdout: block("first", 3),
            stderr: String::new(),
            exit_code: 3,
        });
        let results = run_controller(
            &target,
            "/tmp/d",
            scratch.path(),
            &controller(false),
            caps(false, false),
        )
        .await
        .unwrap();
        assert_eq!(results["first"].exit_code, 3);
    }
}
