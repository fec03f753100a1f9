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

//! Splits a submission into sequential and concurrent phases

use crate::domain::{
    validate_name, ExecutionBatch, ExecutionError, PrivilegeCapabilities, WorkItem,
};
use crate::ports::Target;
use log::warn;
use std::collections::HashMap;

/// Partition work items into an execution batch.
///
/// Items needing privileges the target can't grant are dropped with a warning.
/// Isolated items go to the sequential phase, the rest run concurrently; a lone
/// concurrent item is appended to the sequential phase instead.
///
/// # Returns
/// * `Ok(ExecutionBatch)` - The two phases, submission order preserved
/// * `Err(ExecutionError)` - Invalid or colliding names, or nothing left to run
pub fn plan_batch(
    items: &[WorkItem],
    capabilities: PrivilegeCapabilities,
) -> Result<ExecutionBatch, ExecutionError> {
    check_names(items)?;

    let mut batch = ExecutionBatch::default();
    for item in items {
        if item.requires_privilege && !capabilities.allows_privileged() {
            warn!(
                "skipping script because it requires superuser privileges and the user cannot elevate privileges on target: script={}",
                item.name
            );
            continue;
        }
        if item.isolated {
            batch.sequential.push(item.clone());
        } else {
            batch.concurrent.push(item.clone());
        }
    }

    if batch.concurrent.len() == 1 {
        batch.sequential.append(&mut batch.concurrent);
    }

    if batch.is_empty() {
        return Err(ExecutionError::NothingToRun);
    }
    Ok(batch)
}

/// Ask a target what the current user may do there
pub async fn probe_capabilities(target: &dyn Target) -> PrivilegeCapabilities {
    PrivilegeCapabilities {
        can_elevate: target.can_elevate_privileges().await,
        is_super_user: target.is_super_user(),
    }
}

/// Names must be valid and unique after sanitization
pub(crate) fn check_names(items: &[WorkItem]) -> Result<(), ExecutionError> {
    let mut tokens: HashMap<String, &str> = HashMap::new();
    for item in items {
        validate_name(&item.name)?;
        let token = item.sanitized_name();
        if let Some(first) = tokens.insert(token.clone(), &item.name) {
            return Err(ExecutionError::NameCollision {
                first: first.to_string(),
                second: item.name.clone(),
                token,
            });
        }
    }
    Ok(())
}
