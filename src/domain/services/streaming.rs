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

//! Runs one work item with live output, bypassing the controller

use crate::domain::services::planner::probe_capabilities;
use crate::domain::services::preparer::TargetPreparer;
use crate::domain::{validate_name, ExecutionError, PrivilegeCapabilities, WorkItem};
use crate::ports::{StreamSinks, Target, TargetCommand};
use log::debug;

/// Command that runs a pushed item script, elevated if it needs privileges
pub fn stream_command(
    temp_dir: &str,
    item: &WorkItem,
    capabilities: PrivilegeCapabilities,
) -> TargetCommand {
    let script = format!("{temp_dir}/{}", item.script_file_name());
    let command = TargetCommand::new("bash").args(&[&script]);
    if item.requires_privilege && !capabilities.is_super_user {
        command.with_sudo_stdin()
    } else {
        command
    }
}

/// Prepare the target for one item and stream its output into `sinks`.
///
/// Modules loaded for the item are unloaded once the command returns, whether
/// it finished, failed or was cancelled through the delivered process handle.
pub async fn run_streaming(
    preparer: &TargetPreparer,
    target: &dyn Target,
    item: &WorkItem,
    sinks: StreamSinks,
) -> Result<(), ExecutionError> {
    validate_name(&item.name)?;
    let capabilities = probe_capabilities(target).await;
    if item.requires_privilege && !capabilities.allows_privileged() {
        return Err(ExecutionError::ElevationUnavailable);
    }

    let prepared = preparer
        .prepare_strict(target, std::slice::from_ref(item))
        .await?;
    let command = stream_command(&prepared.temp_dir, item, capabilities);
    debug!("streaming '{}' on {}: {}", item.name, target.name(), command);

    let result = target.run_command_stream(&command, sinks).await;
    preparer
        .cleanup(target, &prepared.installed_modules)
        .await;
    result.map_err(ExecutionError::from)
}
